//! Filesystem State
//!
//! `PmfsState` owns the PM arena, the allocator and journal facades, the
//! global locks and the DRAM header map, and is passed explicitly to
//! every core operation. `format` lays down a fresh filesystem; `mount`
//! verifies the super block, rebuilds the DRAM side from the logs and
//! replays the truncate list.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use pmfs_common::inode::{s_isdir, s_isreg, S_IFDIR};
use pmfs_common::{
    basic_inode_offset, PmfsInode, PmfsSuperBlock, PMFS_BLOCKNODE_INO, PMFS_FREE_INODE_HINT_START,
    PMFS_INODE_BITS, PMFS_ROOT_INO, PMFS_SB_SIZE, PMFS_SUPER_MAGIC, PMFS_DEF_BLOCK_SIZE_4K,
    PMFS_INODETABLE_INO,
};

use crate::balloc::BlockAllocator;
use crate::error::{PmfsError, Result};
use crate::inode::InodeHeader;
use crate::journal::Journal;
use crate::pm::{flush, PmArena};

/// 4K pages at the front of the arena holding the super blocks and basic
/// inodes; the allocator pool starts after them.
pub const PMFS_RESERVED_BLOCKS: u64 = 1;

bitflags! {
    /// Mount behavior options.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MountOpts: u32 {
        /// Enforce the write-protection gate.
        const PROTECT = 1 << 0;
        /// Panic on detected corruption instead of erroring out.
        const ERRORS_PANIC = 1 << 1;
    }
}

/// Inode tracking, under `inode_table_mutex`.
pub struct InodeTableState {
    pub s_inodes_count: u64,
    pub s_free_inodes_count: u64,
    pub s_free_inode_hint: u64,
    pub s_max_inode: u64,
    /// DRAM headers of live inodes.
    pub headers: BTreeMap<u64, Arc<InodeHeader>>,
}

/// Per-filesystem state. Everything the core operations need travels
/// through a reference to this.
pub struct PmfsState {
    arena: PmArena,
    allocator: Arc<dyn BlockAllocator>,
    journal: Arc<dyn Journal>,
    pub(crate) inode_table_mutex: Mutex<InodeTableState>,
    pub(crate) s_truncate_lock: Mutex<()>,
    table_sih: Arc<InodeHeader>,
    next_generation: AtomicU32,
    mounting: AtomicBool,
    time: AtomicU32,
    opts: MountOpts,
}

impl PmfsState {
    // ========================================================================
    // ACCESSORS
    // ========================================================================

    #[inline]
    pub fn arena(&self) -> &PmArena {
        &self.arena
    }

    #[inline]
    pub fn allocator(&self) -> &dyn BlockAllocator {
        &*self.allocator
    }

    #[inline]
    pub fn journal(&self) -> &dyn Journal {
        &*self.journal
    }

    pub fn get_super(&self) -> &PmfsSuperBlock {
        self.arena.at(0)
    }

    pub fn get_redund_super(&self) -> &PmfsSuperBlock {
        self.arena.at(PMFS_SB_SIZE as u64)
    }

    /// The inode record at a PM offset.
    #[inline]
    pub fn inode_at(&self, pi_off: u64) -> &PmfsInode {
        self.arena.at(pi_off)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn inode_mut(&self, pi_off: u64) -> &mut PmfsInode {
        self.arena.at_mut(pi_off)
    }

    pub(crate) fn table_sih(&self) -> Arc<InodeHeader> {
        self.table_sih.clone()
    }

    #[inline]
    pub(crate) fn is_mounting(&self) -> bool {
        self.mounting.load(Ordering::Relaxed)
    }

    pub(crate) fn next_generation(&self) -> u32 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current time, seconds. Injected by the embedder.
    #[inline]
    pub fn now(&self) -> u32 {
        self.time.load(Ordering::Relaxed)
    }

    pub fn set_time(&self, secs: u32) {
        self.time.store(secs, Ordering::Relaxed);
    }

    pub fn inodes_count(&self) -> u64 {
        self.inode_table_mutex.lock().s_inodes_count
    }

    pub fn free_inodes_count(&self) -> u64 {
        self.inode_table_mutex.lock().s_free_inodes_count
    }

    /// The root directory's header.
    pub fn root(&self) -> Result<Arc<InodeHeader>> {
        self.iget(PMFS_ROOT_INO)
    }

    /// Tear down the DRAM side and hand back the arena. Nothing is
    /// flushed or unwound; together with [`PmArena::into_backing`] this
    /// simulates pulling the power.
    pub fn into_arena(self) -> PmArena {
        self.arena
    }

    fn new(
        arena: PmArena,
        allocator: Arc<dyn BlockAllocator>,
        journal: Arc<dyn Journal>,
        opts: MountOpts,
        mounting: bool,
    ) -> Self {
        let table_sih = Arc::new(InodeHeader::new(
            PMFS_INODETABLE_INO,
            basic_inode_offset(PMFS_INODETABLE_INO),
            0,
            0,
            0,
        ));
        PmfsState {
            arena,
            allocator,
            journal,
            inode_table_mutex: Mutex::new(InodeTableState {
                s_inodes_count: 0,
                s_free_inodes_count: 0,
                s_free_inode_hint: PMFS_FREE_INODE_HINT_START,
                s_max_inode: PMFS_FREE_INODE_HINT_START,
                headers: BTreeMap::new(),
            }),
            s_truncate_lock: Mutex::new(()),
            table_sih,
            next_generation: AtomicU32::new(0),
            mounting: AtomicBool::new(mounting),
            time: AtomicU32::new(1),
            opts,
        }
    }

    // ========================================================================
    // FORMAT
    // ========================================================================

    /// Lay down a fresh filesystem on the arena: super blocks, basic
    /// inodes, the inode table and an empty root directory.
    pub fn format(
        arena: PmArena,
        allocator: Arc<dyn BlockAllocator>,
        journal: Arc<dyn Journal>,
        num_inodes: u64,
        volume_name: &str,
    ) -> Result<Self> {
        let state = Self::new(arena, allocator, journal, MountOpts::PROTECT, false);

        {
            let _gate = state.arena.unlock_range(0, PMFS_DEF_BLOCK_SIZE_4K);
            state.arena.bytes_mut(0, PMFS_DEF_BLOCK_SIZE_4K).fill(0);

            let sb = state.arena.at_mut::<PmfsSuperBlock>(0);
            sb.s_magic = PMFS_SUPER_MAGIC;
            sb.s_blocksize = PMFS_DEF_BLOCK_SIZE_4K as u32;
            sb.s_size = state.arena.len() as u64;
            let name = volume_name.as_bytes();
            let n = name.len().min(sb.s_volume_name.len());
            sb.s_volume_name[..n].copy_from_slice(&name[..n]);
            sb.s_inode_table_offset = basic_inode_offset(PMFS_INODETABLE_INO);
            sb.s_journal_offset = 0;
            sb.s_wtime = state.now();
            sb.s_sum = sb.calculate_sum();
            flush(sb, true);

            // redundant copy
            let copy = *state.get_super();
            *state.arena.at_mut::<PmfsSuperBlock>(PMFS_SB_SIZE as u64) = copy;
            flush(state.get_redund_super(), true);
        }

        // blocknode inode: reserved for the allocator's saved state
        {
            let pi = state.inode_mut(basic_inode_offset(PMFS_BLOCKNODE_INO));
            let _gate = state.arena.unlock_struct(pi);
            pi.i_links_count = 1;
            pi.pmfs_ino = PMFS_BLOCKNODE_INO;
            flush(pi, false);
        }

        state.init_inode_table(num_inodes)?;

        // root directory
        let root_off = basic_inode_offset(PMFS_ROOT_INO);
        {
            let pi = state.inode_mut(root_off);
            let _gate = state.arena.unlock_struct(pi);
            pi.i_mode = S_IFDIR | 0o755;
            pi.i_links_count = 2;
            pi.pmfs_ino = PMFS_ROOT_INO;
            let now = state.now();
            pi.i_atime = now;
            pi.i_mtime = now;
            pi.i_ctime = now;
            flush(pi, false);
        }
        {
            let pi = state.inode_mut(root_off);
            state.append_dir_init_entries(pi, PMFS_ROOT_INO, PMFS_ROOT_INO)?;
        }
        state.iget(PMFS_ROOT_INO)?;

        log::debug!("formatted pmfs: {} bytes", state.arena.len());
        Ok(state)
    }

    // ========================================================================
    // MOUNT
    // ========================================================================

    /// Check super-block integrity, preferring the redundant copy when
    /// the primary is torn.
    fn check_integrity(&self) -> Result<()> {
        if self.get_super().is_valid() {
            return Ok(());
        }
        log::error!("primary super block is bad; trying the redundant copy");
        if self.get_redund_super().is_valid() {
            let copy = *self.get_redund_super();
            let _gate = self.arena.unlock_range(0, PMFS_SB_SIZE);
            *self.arena.at_mut::<PmfsSuperBlock>(0) = copy;
            flush(self.get_super(), true);
            return Ok(());
        }
        log::error!("both super blocks are bad");
        if self.opts.contains(MountOpts::ERRORS_PANIC) {
            panic!("pmfs: corrupt super block");
        }
        Err(PmfsError::Corrupt)
    }

    /// Mount an existing filesystem: verify the super block, rebuild the
    /// DRAM headers and trees from the logs, and finish any work the
    /// truncate list recorded.
    pub fn mount(
        arena: PmArena,
        allocator: Arc<dyn BlockAllocator>,
        journal: Arc<dyn Journal>,
        opts: MountOpts,
    ) -> Result<Self> {
        let state = Self::new(arena, allocator, journal, opts, true);
        state.check_integrity()?;

        // inode tracking comes from the table inode itself
        let table_pi = state.inode_at(state.inode_table_off());
        let inodes_count = table_pi.i_size >> PMFS_INODE_BITS;
        {
            let mut ts = state.inode_table_mutex.lock();
            ts.s_inodes_count = inodes_count;
        }

        // rebuild the root directory first, then every live table slot
        state.iget(PMFS_ROOT_INO)?;

        let mut free_count = 0u64;
        let mut hint = 0u64;
        let mut max_inode = PMFS_FREE_INODE_HINT_START;
        for ino in PMFS_FREE_INODE_HINT_START..inodes_count {
            let pi_off = state.inode_slot_off(ino)?;
            let pi = state.inode_at(pi_off);
            if pi.is_free() {
                free_count += 1;
                if hint == 0 {
                    hint = ino;
                }
                continue;
            }
            max_inode = ino;
            let sih = state.iget(ino)?;
            if s_isreg(pi.i_mode) {
                state.rebuild_file_tree(&sih)?;
            }
            if pi.i_generation > state.next_generation.load(Ordering::Relaxed) {
                state.next_generation.store(pi.i_generation, Ordering::Relaxed);
            }
        }
        {
            let mut ts = state.inode_table_mutex.lock();
            ts.s_free_inodes_count = free_count;
            ts.s_free_inode_hint = if hint == 0 {
                PMFS_FREE_INODE_HINT_START
            } else {
                hint
            };
            ts.s_max_inode = max_inode;
        }

        // deferred reclamation work survives the crash here
        state.recover_truncate_list()?;

        {
            let _gate = state.arena.unlock_range(0, PMFS_SB_SIZE);
            let sb = state.arena.at_mut::<PmfsSuperBlock>(0);
            sb.s_mtime = state.now();
            flush(sb, false);
        }
        state.mounting.store(false, Ordering::Relaxed);
        log::debug!(
            "mounted pmfs: {} inodes, {} free",
            inodes_count,
            free_count
        );
        Ok(state)
    }

    /// Walk every directory the header map knows and sanity-check its
    /// index against the log-derived inode metadata. Diagnostics only.
    pub fn dir_index_sizes(&self) -> BTreeMap<u64, usize> {
        let ts = self.inode_table_mutex.lock();
        let mut out = BTreeMap::new();
        for (ino, sih) in ts.headers.iter() {
            let inner = sih.inner.lock();
            if s_isdir(inner.i_mode) {
                out.insert(*ino, inner.dir.len());
            }
        }
        out
    }
}
