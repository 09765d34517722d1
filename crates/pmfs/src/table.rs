//! Inode Table
//!
//! A linear slab of 128-byte inode slots stored inside a distinguished
//! inode's own file tree, addressed by inode number: slot `i` lives at
//! table byte offset `i * 128`. Allocation scans forward from a free hint
//! in page-aligned batches; when no slot is free the table grows by one
//! block of its own block type. The table only ever grows.
//!
//! Everything here runs under `inode_table_mutex`.

use pmfs_common::{
    basic_inode_offset, inodes_per_block, BlockType, PMFS_BLOCK_SHIFT,
    PMFS_FREE_INODE_HINT_START, PMFS_INODE_BITS, PMFS_INODE_SIZE, PMFS_INODETABLE_INO,
    PMFS_LARGE_INODE_TABLE_SIZE, PMFS_LARGE_INODE_TABLE_THRESHOLD, PMFS_NORMAL_INODE_START,
};

use crate::error::{PmfsError, Result};
use crate::fs::{InodeTableState, PmfsState};
use crate::journal::{LogRecordKind, MAX_INODE_LENTRIES};
use crate::pm::flush;

impl PmfsState {
    /// The inode-table inode itself.
    pub(crate) fn inode_table_off(&self) -> u64 {
        basic_inode_offset(PMFS_INODETABLE_INO)
    }

    /// PM offset of the slot of normal inode `ino`, resolved through the
    /// table inode's tree.
    pub(crate) fn inode_slot_off(&self, ino: u64) -> Result<u64> {
        let table_off = ino << PMFS_INODE_BITS;
        let sih = self.table_sih();
        let block = self.find_direct_block(&sih, table_off >> PMFS_BLOCK_SHIFT);
        if block == 0 {
            return Err(PmfsError::AccessDenied);
        }
        Ok(block + (table_off & ((1 << PMFS_BLOCK_SHIFT) - 1)))
    }

    /// PM offset of any inode's slot: basic inodes live at fixed offsets,
    /// normal inodes inside the table.
    pub fn get_inode_off(&self, ino: u64) -> Result<u64> {
        if ino == 0 {
            return Err(PmfsError::AccessDenied);
        }
        if ino < PMFS_NORMAL_INODE_START {
            return Ok(basic_inode_offset(ino));
        }
        let ts = self.inode_table_mutex.lock();
        if ino >= ts.s_inodes_count {
            return Err(PmfsError::BadInode);
        }
        drop(ts);
        self.inode_slot_off(ino)
    }

    /// Initialize the inode table at format time. The table inode record
    /// has already been zeroed.
    pub fn init_inode_table(&self, num_inodes: u64) -> Result<()> {
        let pi = self.inode_mut(self.inode_table_off());

        let init_size = if num_inodes == 0 {
            if self.arena().len() as u64 >= PMFS_LARGE_INODE_TABLE_THRESHOLD {
                PMFS_LARGE_INODE_TABLE_SIZE
            } else {
                1 << PMFS_BLOCK_SHIFT
            }
        } else {
            num_inodes << PMFS_INODE_BITS
        };

        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_mode = 0;
            pi.i_uid = 0;
            pi.i_gid = 0;
            pi.i_links_count = 1;
            pi.i_flags = 0;
            pi.height = 0;
            pi.i_dtime = 0;
            pi.pmfs_ino = PMFS_INODETABLE_INO;
            pi.i_blk_type = if init_size >= PMFS_LARGE_INODE_TABLE_SIZE {
                BlockType::Block2M as u8
            } else {
                BlockType::Block4K as u8
            };
        }

        let blk_shift = pi.blk_shift();
        let num_blocks = (init_size + pi.blk_size() as u64 - 1) >> blk_shift;
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_size = num_blocks << blk_shift;
        }

        {
            let mut ts = self.inode_table_mutex.lock();
            ts.s_inodes_count = num_blocks << (blk_shift - PMFS_INODE_BITS);
        }

        // in terms of the 4K base block size
        let num_4k = num_blocks << (blk_shift - PMFS_BLOCK_SHIFT);
        let sih = self.table_sih();
        self.alloc_blocks(pi, &sih, 0, num_4k as u32, true)
            .map_err(|e| {
                log::error!("error initializing the inode table: {}", e);
                e
            })?;
        flush(pi, true);

        let mut ts = self.inode_table_mutex.lock();
        // slots below the hint start are never used
        ts.s_free_inodes_count = ts.s_inodes_count - PMFS_FREE_INODE_HINT_START;
        ts.s_free_inode_hint = PMFS_FREE_INODE_HINT_START;
        ts.s_max_inode = PMFS_FREE_INODE_HINT_START;
        log::debug!(
            "inode table: {} slots, {} free",
            ts.s_inodes_count,
            ts.s_free_inodes_count
        );
        Ok(())
    }

    /// Grow the table by one of its blocks inside a journal transaction.
    pub(crate) fn increase_inode_table_size(&self, ts: &mut InodeTableState) -> Result<()> {
        let pi = self.inode_mut(self.inode_table_off());

        let mut tx = self.journal().new_transaction(MAX_INODE_LENTRIES)?;
        self.journal().add_logentry(
            &mut tx,
            self.inode_table_off(),
            PMFS_INODE_SIZE as u32,
            LogRecordKind::Data,
        );

        let sih = self.table_sih();
        let res = self.alloc_blocks(pi, &sih, pi.i_size >> PMFS_BLOCK_SHIFT, 1, true);

        match res {
            Ok(()) => {
                let i_size = pi.i_size;
                ts.s_free_inode_hint = i_size >> PMFS_INODE_BITS;
                let i_size = i_size + pi.blk_size() as u64;

                {
                    let _gate = self.arena().unlock_struct(pi);
                    pi.i_size = i_size;
                }
                flush(pi, false);

                ts.s_free_inodes_count += inodes_per_block(pi.blk_type());
                ts.s_inodes_count = i_size >> PMFS_INODE_BITS;
            }
            Err(e) => {
                log::debug!("no space left to grow the inode table");
                self.journal().commit(tx)?;
                return Err(e);
            }
        }
        self.journal().commit(tx)?;
        Ok(())
    }

    /// Find the oldest free inode slot, journal it under the caller's
    /// transaction, and wipe it for a new life. Returns `(ino, slot PM
    /// offset)`. Table growth happens here when the scan comes up empty.
    pub(crate) fn allocate_inode_slot(&self, tx: &mut crate::journal::Transaction) -> Result<(u64, u64)> {
        let mut ts = self.inode_table_mutex.lock();

        let table_pi = self.inode_at(self.inode_table_off());
        let per_block = inodes_per_block(table_pi.blk_type());

        let mut i = ts.s_free_inode_hint;
        let found;
        'search: loop {
            let num_inodes = ts.s_inodes_count;
            while i < num_inodes {
                // scan the rest of the slot batch this inode's block holds
                let end_ino = (i + (per_block - (i & (per_block - 1)))).min(num_inodes);
                while i < end_ino {
                    let pi = self.inode_at(self.inode_slot_off(i)?);
                    if pi.is_free() {
                        found = i;
                        break 'search;
                    }
                    i += 1;
                }
            }
            self.increase_inode_table_size(&mut ts).map_err(|e| {
                log::debug!("could not find a free inode");
                e
            })?;
        }

        let ino = found;
        let pi_off = self.inode_slot_off(ino)?;
        log::debug!("allocating inode {}", ino);

        self.journal()
            .add_logentry(tx, pi_off, PMFS_INODE_SIZE as u32, LogRecordKind::Data);

        let pi = self.inode_mut(pi_off);
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_blk_type = BlockType::Block4K as u8;
            pi.height = 0;
            pi.root = 0;
            pi.i_dtime = 0;
            pi.pmfs_ino = ino;
            pi.log_head = 0;
            pi.log_tail = 0;
            pi.log_pages = 0;
            pi.i_truncated.next = 0;
            pi.i_truncated.truncate_size = 0;
        }

        ts.s_free_inodes_count -= 1;
        ts.s_free_inode_hint = if ino < ts.s_inodes_count - 1 {
            ino + 1
        } else {
            PMFS_FREE_INODE_HINT_START
        };
        if ino > ts.s_max_inode {
            ts.s_max_inode = ino;
        }

        Ok((ino, pi_off))
    }

    /// Return a slot to the free pool after its inode died.
    pub(crate) fn release_inode_slot(&self, ino: u64) {
        let mut ts = self.inode_table_mutex.lock();
        if ino < ts.s_free_inode_hint {
            ts.s_free_inode_hint = ino;
        }
        ts.s_free_inodes_count += 1;
        if ts.s_free_inodes_count == ts.s_inodes_count - PMFS_FREE_INODE_HINT_START {
            // filesystem is empty
            log::debug!("fs is empty");
            ts.s_free_inode_hint = PMFS_FREE_INODE_HINT_START;
        }
        log::debug!(
            "free inode {}: free {} total {} hint {}",
            ino,
            ts.s_free_inodes_count,
            ts.s_inodes_count,
            ts.s_free_inode_hint
        );
    }
}
