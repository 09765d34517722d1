//! Inode Log
//!
//! Append-only per-inode log of 32-byte operation entries in chained 4K
//! pages. Writers reserve an append head, construct the entry in place,
//! flush it, and publish the new `log_tail` with a preceding store fence;
//! a reader that sees the new tail therefore sees every entry before it.
//!
//! File logs hold fixed-size file-write entries and are garbage collected
//! when the log grows: a page is invalid once every entry on it is fully
//! superseded, and invalid pages are unlinked from the chain and freed.
//! Directory logs hold variable-length records and are only reclaimed
//! wholesale when the inode dies.

use pmfs_common::log::{
    block_off, cache_align, dir_log_rec_len, entry_loc, page_tail, DirLogEntry, FileWriteEntry,
    LinkChangeEntry, LogEntryType, LogPageTail, SetattrEntry, ENTRIES_PER_PAGE, LAST_ENTRY,
    LOG_ENTRY_SIZE,
};
use pmfs_common::{
    BlockType, PmfsInode, CACHELINE_SIZE, PMFS_DEF_BLOCK_SIZE_4K, PMFS_INODE_SIZE,
};

use crate::balloc::{block_to_off, off_to_block, FreeHint};
use crate::error::{PmfsError, Result};
use crate::fs::PmfsState;
use crate::pm::{flush, flush_buffer, persistent_barrier};

/// Pages the log grows by at most in one extension.
const MAX_EXTEND_PAGES: u32 = 256;

/// Would an entry of `size` bytes at `curr_p` cross the page tail? With
/// `new_inode`, the cacheline-aligned inlined inode slot after the entry
/// must fit too.
pub fn entry_crosses_tail(curr_p: u64, size: u64, new_inode: bool) -> bool {
    let entry_end = entry_loc(curr_p) + size;

    if !new_inode || entry_end > LAST_ENTRY {
        return entry_end > LAST_ENTRY;
    }

    let inode_start = if entry_end & (CACHELINE_SIZE as u64 - 1) == 0 {
        entry_end
    } else {
        cache_align(entry_end) + CACHELINE_SIZE as u64
    };
    inode_start + PMFS_INODE_SIZE as u64 > LAST_ENTRY
}

impl PmfsState {
    // ========================================================================
    // PAGE CHAIN
    // ========================================================================

    /// Allocate `num_pages` zeroed log pages and chain them. Returns the
    /// PM offset of the first page.
    pub fn allocate_inode_log_pages(&self, num_pages: u32) -> Result<u64> {
        let first = self
            .allocator()
            .new_data_blocks(self.arena(), num_pages, BlockType::Block4K, true)
            .map_err(|e| {
                log::error!("no inode log page available");
                e
            })?;
        log::debug!("alloc {} log pages at block {}", num_pages, first);

        // Coalesce the pages
        let first_off = block_to_off(first);
        let _gate = self.arena().unlock_range(
            first_off,
            num_pages as usize * PMFS_DEF_BLOCK_SIZE_4K,
        );
        for i in 0..num_pages as u64 - 1 {
            let page_off = first_off + (i << 12);
            let tail = self.arena().at_mut::<LogPageTail>(page_tail(page_off));
            tail.next_page = first_off + ((i + 1) << 12);
        }
        Ok(first_off)
    }

    /// `next_page` link of the page containing `curr_p` (0 terminates).
    pub fn next_log_page(&self, curr_p: u64) -> u64 {
        self.arena().at::<LogPageTail>(page_tail(curr_p)).next_page
    }

    /// True when there is no room for even an empty-name record at
    /// `curr_p`, or the record there was never written. Fixed-size
    /// setattr/link-change records are never page terminators, whatever
    /// their second byte holds.
    pub fn is_last_dir_entry(&self, curr_p: u64) -> bool {
        if entry_loc(curr_p) + dir_log_rec_len(0) > LAST_ENTRY {
            return true;
        }
        let entry = self.arena().at::<DirLogEntry>(curr_p);
        match LogEntryType::from_u8(entry.entry_type) {
            Some(LogEntryType::SetAttr) | Some(LogEntryType::LinkChange) => false,
            Some(LogEntryType::DirLog) => entry.name_len == 0,
            _ => true,
        }
    }

    // ========================================================================
    // APPEND HEAD
    // ========================================================================

    /// Reserve the position of the next log entry of `size` bytes,
    /// seeding an empty log or growing a full one as needed. File logs are
    /// garbage collected on growth.
    pub fn get_append_head(
        &self,
        pi: &mut PmfsInode,
        tail: u64,
        size: u64,
        new_inode: bool,
        is_file: bool,
    ) -> Result<u64> {
        let mut curr_p = tail;

        if curr_p == 0 {
            // empty log: seed head and tail
            let new_block = self.allocate_inode_log_pages(1)?;
            {
                let _gate = self.arena().unlock_struct(pi);
                pi.log_head = new_block;
                pi.log_pages = 1;
            }
            flush_buffer(
                &pi.log_head as *const u64 as *const u8,
                CACHELINE_SIZE,
                true,
            );
            return Ok(new_block);
        }

        if entry_crosses_tail(curr_p, size, new_inode) {
            let next = self.next_log_page(curr_p);
            if next == 0 {
                curr_p = self.extend_inode_log(pi, curr_p, is_file)?;
            } else {
                curr_p = next;
            }
        }
        Ok(curr_p)
    }

    /// Grow the log by up to [`MAX_EXTEND_PAGES`] pages (doubling). File
    /// logs run garbage collection over the old chain; directory logs are
    /// linked and republished as-is.
    fn extend_inode_log(&self, pi: &mut PmfsInode, curr_p: u64, is_file: bool) -> Result<u64> {
        let num_pages = pi.log_pages.min(MAX_EXTEND_PAGES);
        let new_block = self.allocate_inode_log_pages(num_pages)?;
        log::debug!(
            "extend log: link block 0x{:x} to 0x{:x} ({} pages)",
            block_off(curr_p),
            new_block,
            num_pages
        );

        if is_file {
            self.log_garbage_collection(pi, new_block, num_pages)?;
        } else {
            {
                let _gate = self.arena().unlock_block(page_tail(curr_p));
                let tail = self.arena().at_mut::<LogPageTail>(page_tail(curr_p));
                tail.next_page = new_block;
                flush(tail, false);
            }
            let _gate = self.arena().unlock_struct(pi);
            pi.log_pages += num_pages;
            flush_buffer(
                &pi.log_head as *const u64 as *const u8,
                CACHELINE_SIZE,
                true,
            );
        }
        Ok(new_block)
    }

    /// Publish a new `log_tail`. The fence before the store orders every
    /// entry write ahead of the publication.
    pub fn update_tail(&self, pi: &mut PmfsInode, new_tail: u64) {
        persistent_barrier();
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.log_tail = new_tail;
        }
        flush_buffer(
            &pi.log_tail as *const u64 as *const u8,
            CACHELINE_SIZE,
            true,
        );
    }

    // ========================================================================
    // GARBAGE COLLECTION
    // ========================================================================

    /// Every entry on the page fully superseded?
    fn curr_log_page_invalid(&self, page_off: u64) -> bool {
        for i in 0..ENTRIES_PER_PAGE {
            let entry = self
                .arena()
                .at::<FileWriteEntry>(page_off + (i * LOG_ENTRY_SIZE) as u64);
            if !entry.is_dead() {
                return false;
            }
        }
        true
    }

    /// Unlink `curr_page` from the chain behind `last_page` and free it.
    /// Log pages are always 4K blocks.
    fn free_curr_log_page(&self, curr_page: u64, last_page: u64) {
        {
            let _gate = self.arena().unlock_block(page_tail(last_page));
            let tail = self.arena().at_mut::<LogPageTail>(page_tail(last_page));
            tail.next_page = self.arena().at::<LogPageTail>(page_tail(curr_page)).next_page;
            flush(tail, true);
        }
        self.allocator()
            .free_data_block(off_to_block(curr_page), BlockType::Block4K);
    }

    /// Walk the chain from `log_head`, unlink and free fully-invalidated
    /// pages, link the freshly allocated extension at `new_block` behind
    /// the old tail page, and publish head, tail and page count together.
    pub fn log_garbage_collection(
        &self,
        pi: &mut PmfsInode,
        new_block: u64,
        num_pages: u32,
    ) -> Result<()> {
        let mut curr = pi.log_head;
        let mut possible_head = 0u64;
        let mut found_head = false;
        let mut last_page = 0u64;
        let mut first_need_free = false;
        let mut freed: u32 = 0;

        loop {
            if block_off(curr) == block_off(pi.log_tail) {
                // don't recycle the tail page
                if !found_head {
                    possible_head = curr;
                }
                break;
            }

            let curr_page = block_off(curr);
            let next = self.next_log_page(curr_page);
            if self.curr_log_page_invalid(curr_page) {
                if curr == pi.log_head {
                    // free the first page after the head moves
                    first_need_free = true;
                    last_page = curr_page;
                } else {
                    log::debug!("free log block 0x{:x}", curr_page);
                    self.free_curr_log_page(curr_page, last_page);
                }
                freed += 1;
            } else {
                if !found_head {
                    possible_head = curr;
                    found_head = true;
                }
                last_page = curr_page;
            }

            curr = next;
            if curr == 0 {
                break;
            }
        }

        // hook the new pages behind the old tail page
        {
            let _gate = self.arena().unlock_block(page_tail(pi.log_tail));
            let tail = self.arena().at_mut::<LogPageTail>(page_tail(pi.log_tail));
            tail.next_page = new_block;
            flush(tail, false);
        }

        let old_head = pi.log_head;
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.log_head = possible_head;
            pi.log_tail = new_block;
            pi.log_pages = pi.log_pages + num_pages - freed;
        }
        flush_buffer(
            &pi.log_head as *const u64 as *const u8,
            CACHELINE_SIZE,
            true,
        );

        if first_need_free {
            log::debug!("free log head block 0x{:x}", block_off(old_head));
            self.allocator()
                .free_data_block(off_to_block(block_off(old_head)), BlockType::Block4K);
        }
        Ok(())
    }

    // ========================================================================
    // ENTRY APPENDS
    // ========================================================================

    /// Append a file-write entry describing `num_blocks` data blocks at
    /// `blocknr` for file block index `start_blk`. Returns the entry's PM
    /// offset; the caller publishes the tail once the data is in place.
    pub fn append_file_write_entry(
        &self,
        pi: &mut PmfsInode,
        blocknr: u64,
        start_blk: u64,
        num_blocks: u32,
        size: u64,
    ) -> Result<u64> {
        let block = block_to_off(blocknr);
        let curr_p =
            self.get_append_head(pi, pi.log_tail, LOG_ENTRY_SIZE as u64, false, true)?;

        {
            let _gate = self.arena().unlock_block(curr_p);
            let entry = self.arena().at_mut::<FileWriteEntry>(curr_p);
            entry.pgoff = start_blk as u32;
            entry.num_pages = num_blocks;
            entry.invalid_pages = 0;
            entry.block = block; // low bits carry the invalid count, starts 0
            entry.mtime = self.now();
            entry.size = size;
            flush(entry, true);
        }
        log::debug!(
            "entry @ 0x{:x}: pgoff {}, num {}, block {}",
            curr_p,
            start_blk,
            num_blocks,
            blocknr
        );
        Ok(curr_p)
    }

    /// Append a directory mutation record to a directory inode's log.
    /// Returns `(entry_off, new_tail, inlined_inode_off)`; the caller
    /// publishes `new_tail`.
    #[allow(clippy::too_many_arguments)]
    pub fn append_dir_entry(
        &self,
        pidir: &mut PmfsInode,
        tail: u64,
        ino: u64,
        name: &[u8],
        link_change: i32,
        new_inode: bool,
    ) -> Result<(u64, u64, Option<u64>)> {
        let de_len = dir_log_rec_len(name.len());
        let curr_p = self.get_append_head(pidir, tail, de_len, new_inode, false)?;

        {
            let _gate = self.arena().unlock_block(curr_p);
            let entry = self.arena().at_mut::<DirLogEntry>(curr_p);
            entry.entry_type = LogEntryType::DirLog as u8;
            entry.ino = ino;
            entry.name_len = name.len() as u8;
            self.arena()
                .bytes_mut(curr_p + pmfs_common::log::DIR_LOG_HEADER_LEN as u64, name.len())
                .copy_from_slice(name);
            entry.file_type = 0;
            entry.mtime = self.now();
            entry.size = pidir.i_size;
            entry.new_inode = new_inode as u8;

            let links = pidir.i_links_count as i32;
            let links = if links == 0 && link_change == -1 {
                0
            } else {
                links + link_change
            };
            entry.links_count = links as u16;
            entry.de_len = de_len as u16;
            flush_buffer(self.arena().ptr(curr_p), de_len as usize, false);
        }

        let mut curr_tail = curr_p + de_len;
        let mut pi_addr = None;
        if new_inode {
            // reserve the cacheline-aligned inlined inode slot
            let inode_start = if entry_crosses_tail(curr_p, de_len, true) {
                self.next_log_page(curr_p)
            } else if curr_tail & (CACHELINE_SIZE as u64 - 1) == 0 {
                curr_tail
            } else {
                cache_align(curr_tail) + CACHELINE_SIZE as u64
            };
            pi_addr = Some(inode_start);
            curr_tail = inode_start + PMFS_INODE_SIZE as u64;
        }

        log::debug!(
            "dir entry @ 0x{:x}: ino {}, entry len {}, name len {}",
            curr_p,
            ino,
            de_len,
            name.len()
        );
        Ok((curr_p, curr_tail, pi_addr))
    }

    /// Seed a fresh directory log with the `.` and `..` records and
    /// publish head and tail.
    pub fn append_dir_init_entries(
        &self,
        pi: &mut PmfsInode,
        self_ino: u64,
        parent_ino: u64,
    ) -> Result<()> {
        if pi.log_head != 0 {
            log::debug!("log head already exists @ 0x{:x}", pi.log_head);
            return Err(PmfsError::InvalidArgument);
        }

        let new_block = self.allocate_inode_log_pages(1)?;
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.log_tail = new_block;
            pi.log_head = new_block;
            pi.log_pages = 1;
            pi.i_blocks = 1;
        }
        flush_buffer(
            &pi.log_head as *const u64 as *const u8,
            CACHELINE_SIZE,
            true,
        );

        let now = self.now();
        let mut curr_p = new_block;
        for (name, ino, links) in [(&b"."[..], self_ino, 1u16), (&b".."[..], parent_ino, 2u16)] {
            let de_len = dir_log_rec_len(name.len());
            let _gate = self.arena().unlock_block(curr_p);
            let entry = self.arena().at_mut::<DirLogEntry>(curr_p);
            entry.entry_type = LogEntryType::DirLog as u8;
            entry.ino = ino;
            entry.name_len = name.len() as u8;
            entry.de_len = de_len as u16;
            entry.mtime = now;
            entry.size = PMFS_DEF_BLOCK_SIZE_4K as u64;
            entry.links_count = links;
            entry.new_inode = 0;
            entry.file_type = 0;
            self.arena()
                .bytes_mut(curr_p + pmfs_common::log::DIR_LOG_HEADER_LEN as u64, name.len())
                .copy_from_slice(name);
            flush_buffer(self.arena().ptr(curr_p), de_len as usize, false);
            curr_p += de_len;
        }

        self.update_tail(pi, curr_p);
        Ok(())
    }

    /// Append an attribute-change entry to a directory-style log.
    pub fn append_setattr_entry(
        &self,
        pi: &mut PmfsInode,
        attr: u8,
        size: u64,
    ) -> Result<u64> {
        let curr_p = self.get_append_head(pi, pi.log_tail, LOG_ENTRY_SIZE as u64, false, false)?;
        {
            let _gate = self.arena().unlock_block(curr_p);
            let entry = self.arena().at_mut::<SetattrEntry>(curr_p);
            entry.entry_type = LogEntryType::SetAttr as u8;
            entry.attr = attr;
            entry.mode = pi.i_mode;
            entry.uid = pi.i_uid;
            entry.gid = pi.i_gid;
            entry.atime = pi.i_atime;
            entry.mtime = pi.i_mtime;
            entry.ctime = pi.i_ctime;
            entry.size = size;
            flush(entry, true);
        }
        self.update_tail(pi, curr_p + LOG_ENTRY_SIZE as u64);
        Ok(curr_p)
    }

    /// Append a link-count change entry to a directory-style log.
    pub fn append_link_change_entry(&self, pi: &mut PmfsInode) -> Result<u64> {
        let curr_p = self.get_append_head(pi, pi.log_tail, LOG_ENTRY_SIZE as u64, false, false)?;
        {
            let _gate = self.arena().unlock_block(curr_p);
            let entry = self.arena().at_mut::<LinkChangeEntry>(curr_p);
            entry.entry_type = LogEntryType::LinkChange as u8;
            entry.padding = 0;
            entry.links = pi.i_links_count;
            entry.ctime = pi.i_ctime;
            entry.flags = pi.i_flags;
            entry.generation = pi.i_generation;
            entry.paddings = [0; 2];
            flush(entry, true);
        }
        self.update_tail(pi, curr_p + LOG_ENTRY_SIZE as u64);
        Ok(curr_p)
    }

    // ========================================================================
    // FREE
    // ========================================================================

    /// Free the whole log chain and reset the log fields.
    pub fn free_inode_log(&self, pi: &mut PmfsInode) {
        if pi.log_head == 0 || pi.log_tail == 0 {
            return;
        }

        let mut curr_block = pi.log_head;
        let mut hint = FreeHint::new();
        while curr_block != 0 {
            let curr_page = block_off(curr_block);
            let next = self.next_log_page(curr_page);
            log::debug!("free log page 0x{:x}", curr_page);
            self.allocator()
                .free_log_block(off_to_block(curr_page), BlockType::Block4K, &mut hint);
            curr_block = next;
        }

        let _gate = self.arena().unlock_struct(pi);
        pi.log_head = 0;
        pi.log_tail = 0;
        pi.log_pages = 0;
        flush_buffer(
            &pi.log_head as *const u64 as *const u8,
            CACHELINE_SIZE,
            false,
        );
    }
}
