//! Inode Lifecycle
//!
//! DRAM inode headers and the operations that combine the tree, log,
//! table and truncate list: create, lookup, write, read, setattr,
//! unlink/rmdir, evict, and the mount-time tree rebuilds.
//!
//! Every live inode has one DRAM header. Its spin lock is the per-inode
//! lock: writers, truncate and log GC run under it. The header also
//! carries the seqlock that lets lock-free readers observe `{root,
//! height}` untorn while a shrink republishes both.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use pmfs_common::inode::{s_isdir, s_islnk, s_isreg, mask_inode_flags};
use pmfs_common::log::{
    entry_loc, FileWriteEntry, LinkChangeEntry, SetattrEntry, LAST_ENTRY, LOG_ENTRY_SIZE,
};
use pmfs_common::{
    BlockType, PmfsInode, CACHELINE_SIZE, META_BLK_SHIFT, PMFS_BLOCK_SHIFT,
    PMFS_DEF_BLOCK_SIZE_4K, PMFS_INODE_SIZE, PMFS_NORMAL_INODE_START,
};

use crate::dir::DirIndex;
use crate::error::{PmfsError, Result};
use crate::fs::PmfsState;
use crate::journal::{LogRecordKind, MAX_INODE_LENTRIES};
use crate::pm::{flush, flush_buffer, memcpy_atomic, persistent_barrier, PmArena};
use crate::tree::sparse_last_blocknr;

// ============================================================================
// DRAM INODE HEADER
// ============================================================================

/// Mutable DRAM state of a live inode, under the per-inode lock.
pub struct HeaderInner {
    pub i_size: u64,
    pub i_mode: u16,
    pub log_pages: u32,
    /// Directory index; empty for non-directories.
    pub dir: DirIndex,
    pub on_truncate_list: bool,
}

/// Per-inode DRAM header.
pub struct InodeHeader {
    pub ino: u64,
    /// PM offset of the inode slot.
    pub pi_off: u64,
    /// Guards `{root, height}` against torn reads; writers bump to odd,
    /// publish, bump to even.
    seq: AtomicU64,
    pub inner: Mutex<HeaderInner>,
}

impl InodeHeader {
    pub(crate) fn new(ino: u64, pi_off: u64, i_size: u64, i_mode: u16, log_pages: u32) -> Self {
        InodeHeader {
            ino,
            pi_off,
            seq: AtomicU64::new(0),
            inner: Mutex::new(HeaderInner {
                i_size,
                i_mode,
                log_pages,
                dir: DirIndex::new(),
                on_truncate_list: false,
            }),
        }
    }

    /// Read `{root, height}` without the inode lock, retrying across
    /// concurrent republications.
    pub fn read_root_height(&self, arena: &PmArena) -> (u64, u32) {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let pi = arena.at::<PmfsInode>(self.pi_off);
            let root = unsafe { core::ptr::read_volatile(&pi.root) };
            let height = unsafe { core::ptr::read_volatile(&pi.height) };
            if self.seq.load(Ordering::Acquire) == s1 {
                return (root, height as u32);
            }
        }
    }

    /// Publish a new `{root, height}` pair. The platform has no 16-byte
    /// CAS, so the pair is bracketed by the sequence counter instead.
    pub(crate) fn write_root_height(&self, arena: &PmArena, root: u64, height: u8) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        {
            let _gate = arena.unlock_inode(self.pi_off);
            let pi = arena.at_mut::<PmfsInode>(self.pi_off);
            unsafe {
                core::ptr::write_volatile(&mut pi.root, root);
                core::ptr::write_volatile(&mut pi.height, height);
            }
            flush_buffer(pi as *const PmfsInode as *const u8, 16, false);
        }
        self.seq.fetch_add(1, Ordering::Release);
    }
}

// ============================================================================
// SETATTR
// ============================================================================

bitflags! {
    /// Which fields of a [`SetattrFields`] are valid.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AttrMask: u32 {
        const MODE  = 1 << 0;
        const UID   = 1 << 1;
        const GID   = 1 << 2;
        const SIZE  = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
        const CTIME = 1 << 6;
    }
}

pub const ATTR_SIZE: AttrMask = AttrMask::SIZE;

impl Default for AttrMask {
    fn default() -> Self {
        AttrMask::empty()
    }
}

/// Attribute-change request.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetattrFields {
    pub valid: AttrMask,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl SetattrFields {
    pub fn size(size: u64) -> Self {
        SetattrFields {
            valid: AttrMask::SIZE,
            size,
            ..Default::default()
        }
    }
}

impl PmfsState {
    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// Fetch (or build) the DRAM header of inode `ino`. Fails with
    /// `BadInode` for slots that fail the active predicate and
    /// `AccessDenied` for absent basic inodes.
    pub fn iget(&self, ino: u64) -> Result<Arc<InodeHeader>> {
        {
            let ts = self.inode_table_mutex.lock();
            if let Some(h) = ts.headers.get(&ino) {
                return Ok(h.clone());
            }
        }

        let pi_off = self.get_inode_off(ino)?;
        let pi = self.inode_at(pi_off);
        if !pi.is_active() {
            // deleted or never born
            return Err(PmfsError::BadInode);
        }

        let header = Arc::new(InodeHeader::new(
            ino,
            pi_off,
            pi.i_size,
            pi.i_mode,
            pi.log_pages,
        ));

        if s_isdir(pi.i_mode) && pi.log_head != 0 {
            let pi = self.inode_mut(pi_off);
            let mut inner = header.inner.lock();
            self.rebuild_dir_tree(pi, &mut inner)?;
        }

        let mut ts = self.inode_table_mutex.lock();
        let entry = ts.headers.entry(ino).or_insert_with(|| header.clone());
        Ok(entry.clone())
    }

    // ========================================================================
    // CREATE
    // ========================================================================

    /// Create a new inode named `name` in `dir`. One journal transaction
    /// covers the slot, the parent entry and the parent inode.
    pub fn create(
        &self,
        dir: &Arc<InodeHeader>,
        name: &[u8],
        mode: u16,
        rdev: u32,
    ) -> Result<Arc<InodeHeader>> {
        if name.is_empty() || name.len() > pmfs_common::log::PMFS_NAME_LEN {
            return Err(PmfsError::InvalidArgument);
        }

        let mut dir_inner = dir.inner.lock();
        if !s_isdir(dir_inner.i_mode) {
            return Err(PmfsError::InvalidArgument);
        }
        if dir_inner.dir.find(name).is_some() {
            return Err(PmfsError::InvalidArgument);
        }

        let mkdir = s_isdir(mode);
        let mut tx = self.journal().new_transaction(MAX_INODE_LENTRIES * 2)?;

        let (ino, pi_off) = self.allocate_inode_slot(&mut tx)?;

        let pidir = self.inode_mut(dir.pi_off);
        let now = self.now();
        let res: Result<Arc<InodeHeader>> = (|| {
            // owner, mode and inherited flags
            let pi = self.inode_mut(pi_off);
            {
                let _gate = self.arena().unlock_struct(pi);
                pi.i_mode = mode;
                pi.i_uid = 0;
                pi.i_gid = 0;
                pi.i_links_count = if mkdir { 2 } else { 1 };
                pi.i_size = 0;
                pi.i_blocks = 0;
                pi.i_atime = now;
                pi.i_mtime = now;
                pi.i_ctime = now;
                pi.i_rdev = rdev;
                pi.i_generation = self.next_generation();
                pi.i_flags = mask_inode_flags(mode, pidir.i_flags);
            }
            flush(pi, false);

            if mkdir {
                self.append_dir_init_entries(pi, ino, dir.ino)?;
            }

            // parent directory entry
            {
                let _gate = self.arena().unlock_struct(pidir);
                pidir.i_mtime = now;
                pidir.i_ctime = now;
            }
            let link_change = if mkdir { 1 } else { 0 };
            let (curr_entry, new_tail, _) =
                self.append_dir_entry(pidir, pidir.log_tail, ino, name, link_change, false)?;
            dir_inner.dir.insert(name, ino, curr_entry)?;
            if mkdir {
                let _gate = self.arena().unlock_struct(pidir);
                pidir.i_links_count += 1;
            }
            self.update_tail(pidir, new_tail);
            dir_inner.i_size = pidir.i_size;

            let header = Arc::new(InodeHeader::new(ino, pi_off, 0, mode, pi.log_pages));
            Ok(header)
        })();

        match res {
            Ok(header) => {
                self.journal().commit(tx)?;
                let mut ts = self.inode_table_mutex.lock();
                ts.headers.insert(ino, header.clone());
                Ok(header)
            }
            Err(e) => {
                // mark the half-born inode bad and give the slot back
                log::error!("create failed for inode {}: {}", ino, e);
                let pi = self.inode_mut(pi_off);
                {
                    let _gate = self.arena().unlock_struct(pi);
                    pi.i_links_count = 0;
                    pi.i_mode = 0;
                    pi.i_dtime = now;
                }
                flush(pi, true);
                self.journal().commit(tx)?;
                self.release_inode_slot(ino);
                Err(e)
            }
        }
    }

    // ========================================================================
    // UNLINK / RMDIR
    // ========================================================================

    /// Remove the link `name` from `dir`. An inode whose last link goes
    /// away joins the truncate list; its blocks are reclaimed at evict (or
    /// at mount, whichever comes first).
    pub fn unlink(&self, dir: &Arc<InodeHeader>, name: &[u8]) -> Result<()> {
        let mut dir_inner = dir.inner.lock();
        let node = self
            .find_dir_node(&dir_inner, name)
            .ok_or(PmfsError::NotFound)?;

        let target = self.iget(node.ino)?;
        let mut target_inner = target.inner.lock();
        if s_isdir(target_inner.i_mode) {
            // rmdir only removes empty directories
            let live = self.readdir(&target_inner, 0).0;
            if live
                .iter()
                .any(|e| e.name != b"." && e.name != b"..")
            {
                return Err(PmfsError::InvalidArgument);
            }
        }

        let pidir = self.inode_mut(dir.pi_off);
        let now = self.now();
        {
            let _gate = self.arena().unlock_struct(pidir);
            pidir.i_mtime = now;
            pidir.i_ctime = now;
        }

        let dec_link = if s_isdir(target_inner.i_mode) { -1 } else { 0 };
        let (_, new_tail, _) =
            self.append_dir_entry(pidir, pidir.log_tail, 0, name, dec_link, false)?;
        dir_inner.dir.remove(name);
        if dec_link != 0 {
            let _gate = self.arena().unlock_struct(pidir);
            pidir.i_links_count -= 1;
        }
        self.update_tail(pidir, new_tail);
        dir_inner.i_size = pidir.i_size;

        // drop the target's link
        let pi = self.inode_mut(target.pi_off);
        {
            let _gate = self.arena().unlock_struct(pi);
            if s_isdir(target_inner.i_mode) {
                pi.i_links_count = 0;
            } else if pi.i_links_count > 0 {
                pi.i_links_count -= 1;
            }
            pi.i_ctime = now;
        }
        flush(pi, true);
        if s_isdir(target_inner.i_mode) && pi.log_head != 0 {
            // dying directories record the drop in their own log
            self.append_link_change_entry(pi)?;
        }

        if pi.i_links_count == 0 {
            let i_size = target_inner.i_size;
            self.truncate_add(&target, &mut target_inner, i_size)?;
        }
        Ok(())
    }

    // ========================================================================
    // EVICT
    // ========================================================================

    /// Free a dead inode's slot inside a journal transaction: clear the
    /// tree root, stamp the deletion time and release the log.
    fn free_inode(&self, sih: &InodeHeader) -> Result<()> {
        let pi = self.inode_mut(sih.pi_off);

        let mut tx = self.journal().new_transaction(MAX_INODE_LENTRIES)?;
        self.journal().add_logentry(
            &mut tx,
            sih.pi_off,
            PMFS_INODE_SIZE as u32,
            LogRecordKind::Data,
        );

        {
            let _gate = self.arena().unlock_struct(pi);
            pi.root = 0;
            pi.height = 0;
            pi.i_size = 0;
            pi.i_dtime = self.now();
        }
        self.free_inode_log(pi);
        flush(pi, false);

        self.journal().commit(tx)?;
        self.release_inode_slot(sih.ino);
        Ok(())
    }

    /// Tear down an inode whose last reference dropped. Unlinked inodes
    /// lose their tree and log; everyone leaves the truncate list and the
    /// header map.
    pub fn evict_inode(&self, sih: &Arc<InodeHeader>) -> Result<()> {
        log::debug!("evict inode {}", sih.ino);
        let mut inner = sih.inner.lock();
        let pi = self.inode_mut(sih.pi_off);

        if pi.i_links_count == 0 && pi.i_mode != 0 && sih.ino >= PMFS_NORMAL_INODE_START {
            let mode = pi.i_mode;
            if s_isreg(mode) || s_isdir(mode) || s_islnk(mode) {
                let root = pi.root;
                let height = pi.height as u32;
                let btype = pi.blk_type();

                let last_blocknr = if pi.has_eofblocks() {
                    (1u64 << (height * META_BLK_SHIFT)) - 1
                } else if inner.i_size > 0 {
                    sparse_last_blocknr(height, (inner.i_size - 1) >> pi.blk_shift())
                } else {
                    0
                };

                // first free the inode, then the blocks of its tree
                self.free_inode(sih)?;

                if s_isreg(mode) {
                    self.free_file_inode_subtree(root, height, btype, last_blocknr);
                } else {
                    self.free_dir_inode_subtree(root, height, btype, last_blocknr);
                }
                inner.i_size = 0;
                inner.dir.clear();
            }
        }

        // now it is safe to leave the truncate list
        self.truncate_del(sih, &mut inner)?;
        drop(inner);

        let mut ts = self.inode_table_mutex.lock();
        ts.headers.remove(&sih.ino);
        Ok(())
    }

    // ========================================================================
    // SETATTR
    // ========================================================================

    /// Copy one log-recorded attribute change onto the PM inode.
    pub fn apply_setattr_entry(&self, pi: &mut PmfsInode, entry: &SetattrEntry) {
        let _gate = self.arena().unlock_struct(pi);
        pi.i_mode = entry.mode;
        pi.i_uid = entry.uid;
        pi.i_gid = entry.gid;
        pi.i_atime = entry.atime;
        pi.i_mtime = entry.mtime;
        pi.i_ctime = entry.ctime;
        pi.i_size = entry.size;
    }

    /// Copy one log-recorded link-count change onto the PM inode.
    pub fn apply_link_change_entry(&self, pi: &mut PmfsInode, entry: &LinkChangeEntry) {
        let _gate = self.arena().unlock_struct(pi);
        pi.i_links_count = entry.links;
        pi.i_ctime = entry.ctime;
        pi.i_flags = entry.flags;
        pi.i_generation = entry.generation;
    }

    /// Update one inode field in place with an atomic store, without a
    /// transaction.
    fn update_single_field(&self, pi: &mut PmfsInode, attr: &SetattrFields, field: AttrMask) {
        {
            let _gate = self.arena().unlock_struct(pi);
            let (dst, src, size): (*mut u8, *const u8, usize) = if field == AttrMask::MODE {
                (core::ptr::addr_of_mut!(pi.i_mode).cast(), core::ptr::addr_of!(attr.mode).cast(), 2)
            } else if field == AttrMask::UID {
                (core::ptr::addr_of_mut!(pi.i_uid).cast(), core::ptr::addr_of!(attr.uid).cast(), 4)
            } else if field == AttrMask::GID {
                (core::ptr::addr_of_mut!(pi.i_gid).cast(), core::ptr::addr_of!(attr.gid).cast(), 4)
            } else if field == AttrMask::ATIME {
                (core::ptr::addr_of_mut!(pi.i_atime).cast(), core::ptr::addr_of!(attr.atime).cast(), 4)
            } else if field == AttrMask::MTIME {
                (core::ptr::addr_of_mut!(pi.i_mtime).cast(), core::ptr::addr_of!(attr.mtime).cast(), 4)
            } else if field == AttrMask::CTIME {
                (core::ptr::addr_of_mut!(pi.i_ctime).cast(), core::ptr::addr_of!(attr.ctime).cast(), 4)
            } else {
                return;
            };
            memcpy_atomic(dst, src, size);
        }
        flush(pi, true);
    }

    /// Attribute change. A size change runs the truncate protocol
    /// (truncate list, block hint, setsize); a single remaining field is
    /// stored atomically; multiple fields go through a journal
    /// transaction.
    pub fn setattr(&self, sih: &Arc<InodeHeader>, attr: &SetattrFields) -> Result<()> {
        let mut inner = sih.inner.lock();
        let mut valid = attr.valid;
        let pi = self.inode_mut(sih.pi_off);

        if valid.contains(AttrMask::SIZE)
            && (attr.size != inner.i_size || pi.has_eofblocks())
        {
            self.truncate_add(sih, &mut inner, attr.size)?;
            // allocation hint for files that have no blocks yet
            self.set_blocksize_hint(pi, attr.size);

            // now the inode can be truncated freely
            self.setsize(sih, &mut inner, attr.size)?;
            {
                let _gate = self.arena().unlock_struct(pi);
                pi.i_size = attr.size;
            }
            flush_buffer(pi as *const PmfsInode as *const u8, CACHELINE_SIZE, false);
            // ctime and mtime were already updated by the truncate
            valid.remove(AttrMask::CTIME | AttrMask::MTIME);

            self.truncate_del(sih, &mut inner)?;
        }

        valid.remove(AttrMask::SIZE);
        if valid.is_empty() {
            return Ok(());
        }

        if valid.bits().count_ones() == 1 {
            self.update_single_field(pi, attr, valid);
        } else {
            // multiple fields change; use a transaction for atomicity
            let mut tx = self.journal().new_transaction(MAX_INODE_LENTRIES)?;
            self.journal().add_logentry(
                &mut tx,
                sih.pi_off,
                PMFS_INODE_SIZE as u32,
                LogRecordKind::Data,
            );
            {
                let _gate = self.arena().unlock_struct(pi);
                if valid.contains(AttrMask::MODE) {
                    pi.i_mode = attr.mode;
                }
                if valid.contains(AttrMask::UID) {
                    pi.i_uid = attr.uid;
                }
                if valid.contains(AttrMask::GID) {
                    pi.i_gid = attr.gid;
                }
                if valid.contains(AttrMask::ATIME) {
                    pi.i_atime = attr.atime;
                }
                if valid.contains(AttrMask::MTIME) {
                    pi.i_mtime = attr.mtime;
                }
                if valid.contains(AttrMask::CTIME) {
                    pi.i_ctime = attr.ctime;
                }
            }
            flush(pi, false);
            self.journal().commit(tx)?;
        }

        if valid.contains(AttrMask::MODE) {
            inner.i_mode = attr.mode;
        }

        // directories keep attribute history in their log for rebuild
        if s_isdir(inner.i_mode) && pi.log_head != 0 {
            self.append_setattr_entry(pi, valid.bits() as u8, pi.i_size)?;
        }
        Ok(())
    }

    /// Pick a data-block size for an inode that has no blocks yet, from
    /// the size it is about to get.
    pub(crate) fn set_blocksize_hint(&self, pi: &mut PmfsInode, new_size: u64) {
        if pi.root != 0 || pi.i_size != 0 {
            return;
        }
        let btype = if new_size >= BlockType::Block1G.size() as u64 {
            BlockType::Block1G
        } else if new_size >= BlockType::Block2M.size() as u64 {
            BlockType::Block2M
        } else {
            BlockType::Block4K
        };
        if btype as u8 != pi.i_blk_type {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_blk_type = btype as u8;
            flush(pi, false);
        }
    }

    /// Zero the sub-block spill beyond a shrink target, so data does not
    /// resurface if the file grows again. Skipped on block boundaries,
    /// growth, and holes.
    fn block_truncate_page(&self, sih: &InodeHeader, inner: &HeaderInner, newsize: u64) {
        let offset = newsize & (PMFS_DEF_BLOCK_SIZE_4K as u64 - 1);
        if offset == 0 || newsize > inner.i_size {
            return;
        }
        let length = PMFS_DEF_BLOCK_SIZE_4K as u64 - offset;
        let blocknr = newsize >> PMFS_BLOCK_SHIFT;

        let blockoff = if s_isreg(inner.i_mode) {
            self.find_data_block(sih, blocknr)
        } else {
            self.find_direct_block(sih, blocknr)
        };
        if blockoff == 0 {
            return;
        }

        let _gate = self.arena().unlock_block(blockoff);
        let bytes = self.arena().bytes_mut(blockoff + offset, length as usize);
        bytes.fill(0);
        flush_buffer(bytes.as_ptr(), length as usize, false);
    }

    /// Change the file size: zero the spill page, publish the new size,
    /// then free the blocks past it.
    pub fn setsize(&self, sih: &InodeHeader, inner: &mut HeaderInner, newsize: u64) -> Result<()> {
        let oldsize = inner.i_size;

        if !(s_isreg(inner.i_mode) || s_isdir(inner.i_mode) || s_islnk(inner.i_mode)) {
            log::error!("setsize: wrong file mode {:o}", inner.i_mode);
            return Err(PmfsError::InvalidArgument);
        }

        if newsize != oldsize {
            self.block_truncate_page(sih, inner, newsize);
            inner.i_size = newsize;
            let pi = self.inode_mut(sih.pi_off);
            let _gate = self.arena().unlock_struct(pi);
            pi.i_size = newsize;
        }

        let pi = self.inode_mut(sih.pi_off);
        self.truncate_blocks(pi, sih, newsize, oldsize);
        persistent_barrier();
        Ok(())
    }

    // ========================================================================
    // WRITE / READ
    // ========================================================================

    /// Copy-on-write file write: fresh blocks are filled, logged as one
    /// write entry and published into the tree; displaced blocks are freed
    /// through the assignment.
    pub fn write(&self, sih: &Arc<InodeHeader>, pos: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut inner = sih.inner.lock();
        if !s_isreg(inner.i_mode) {
            return Err(PmfsError::InvalidArgument);
        }
        let pi = self.inode_mut(sih.pi_off);

        let block_size = PMFS_DEF_BLOCK_SIZE_4K as u64;
        let end = pos + data.len() as u64;
        let start_blk = pos >> PMFS_BLOCK_SHIFT;
        let end_blk = (end - 1) >> PMFS_BLOCK_SHIFT;
        let num_blocks = (end_blk - start_blk + 1) as u32;

        let partial_head = pos & (block_size - 1) != 0;
        let partial_tail = end & (block_size - 1) != 0 && end < inner.i_size;
        let zero = partial_head || partial_tail;
        debug_assert_eq!(pi.i_blk_type, BlockType::Block4K as u8);

        let blocknr = self
            .allocator()
            .new_data_blocks(self.arena(), num_blocks, pi.blk_type(), zero)?;
        let new_off = crate::balloc::block_to_off(blocknr);
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_blocks += num_blocks as u64;
        }

        // carry over the parts of the edge blocks the write leaves alone
        if partial_head {
            let old = self.find_data_block(sih, start_blk);
            if old != 0 {
                let head_len = (pos & (block_size - 1)) as usize;
                let src = self.arena().bytes(old, head_len).as_ptr();
                let _gate = self.arena().unlock_block(new_off);
                let dst = self.arena().bytes_mut(new_off, head_len);
                unsafe { core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), head_len) };
            }
        }
        if partial_tail {
            let old = self.find_data_block(sih, end_blk);
            if old != 0 {
                let tail_off = (end & (block_size - 1)) as usize;
                let tail_len = block_size as usize - tail_off;
                let dst_base = new_off + ((end_blk - start_blk) << PMFS_BLOCK_SHIFT);
                let src = self.arena().bytes(old + tail_off as u64, tail_len).as_ptr();
                let _gate = self.arena().unlock_block(dst_base);
                let dst = self.arena().bytes_mut(dst_base + tail_off as u64, tail_len);
                unsafe { core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), tail_len) };
            }
        }

        // the payload itself
        {
            let write_off = new_off + (pos & (block_size - 1));
            let _gate = self
                .arena()
                .unlock_range(new_off, (num_blocks as usize) << PMFS_BLOCK_SHIFT);
            self.arena()
                .bytes_mut(write_off, data.len())
                .copy_from_slice(data);
            flush_buffer(self.arena().ptr(write_off), data.len(), false);
        }

        let new_size = inner.i_size.max(end);
        let curr_entry =
            self.append_file_write_entry(pi, blocknr, start_blk, num_blocks, new_size)?;
        self.assign_blocks(pi, sih, start_blk, num_blocks, curr_entry, true)?;

        let now = self.now();
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_size = new_size;
            pi.i_mtime = now;
            pi.i_ctime = now;
        }
        inner.i_size = new_size;
        self.check_eof_blocks(pi, new_size);
        flush(pi, false);

        // the tail publication commits the write
        self.update_tail(pi, curr_entry + LOG_ENTRY_SIZE as u64);
        Ok(data.len())
    }

    /// Read through the tree; holes read as zeros.
    pub fn read(&self, sih: &Arc<InodeHeader>, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = sih.inner.lock();
        if pos >= inner.i_size {
            return Ok(0);
        }
        let len = buf.len().min((inner.i_size - pos) as usize);
        let block_size = PMFS_DEF_BLOCK_SIZE_4K as u64;

        let mut done = 0usize;
        while done < len {
            let cur = pos + done as u64;
            let blk = cur >> PMFS_BLOCK_SHIFT;
            let in_blk = (cur & (block_size - 1)) as usize;
            let chunk = (block_size as usize - in_blk).min(len - done);

            let off = if s_isreg(inner.i_mode) {
                self.find_data_block(sih, blk)
            } else {
                self.find_direct_block(sih, blk)
            };
            if off == 0 {
                buf[done..done + chunk].fill(0);
            } else {
                buf[done..done + chunk]
                    .copy_from_slice(self.arena().bytes(off + in_blk as u64, chunk));
            }
            done += chunk;
        }
        Ok(done)
    }

    // ========================================================================
    // REBUILD
    // ========================================================================

    /// Regenerate a file inode's tree from its log at mount. The stale
    /// tree skeleton is dropped first; every live entry is assigned back
    /// without re-freeing the blocks it displaced before the crash.
    pub fn rebuild_file_tree(&self, sih: &Arc<InodeHeader>) -> Result<()> {
        let mut inner = sih.inner.lock();
        let pi = self.inode_mut(sih.pi_off);
        log::debug!("rebuild inode {} tree", sih.ino);

        if pi.root != 0 && pi.height > 0 {
            let last_blocknr = (1u64 << (pi.height as u32 * META_BLK_SHIFT)) - 1;
            self.free_file_meta_blocks(pi, sih, last_blocknr);
        } else {
            sih.write_root_height(self.arena(), 0, 0);
        }

        let mut curr_p = pi.log_head;
        while curr_p != pi.log_tail {
            if entry_loc(curr_p) == LAST_ENTRY {
                curr_p = self.next_log_page(curr_p);
                if curr_p == 0 {
                    panic!("inode {} log is broken", sih.ino);
                }
                continue;
            }

            let entry = *self.arena().at::<FileWriteEntry>(curr_p);
            if !entry.is_dead() {
                self.assign_blocks(pi, sih, entry.pgoff as u64, entry.num_pages, curr_p, false)?;
            }

            curr_p += LOG_ENTRY_SIZE as u64;
        }

        // blocks = data blocks reachable from the tree plus the log chain
        let data_blocks = self.count_iblocks(pi, pi.root);
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_blocks = data_blocks + pi.log_pages as u64;
        }
        flush(pi, true);
        inner.log_pages = pi.log_pages;
        inner.i_size = pi.i_size;
        Ok(())
    }

    /// List a directory, names only; sorted by index order.
    pub fn list_dir(&self, sih: &Arc<InodeHeader>) -> Vec<Vec<u8>> {
        let inner = sih.inner.lock();
        self.readdir(&inner, 0).0.into_iter().map(|e| e.name).collect()
    }
}
