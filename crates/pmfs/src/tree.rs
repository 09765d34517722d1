//! Radix Block Tree
//!
//! Per-inode fixed-fanout tree mapping file-relative block indices to PM
//! block references. Interior nodes are 4K meta blocks of 512 slots; a
//! zero slot is a hole. Height 0 means `root` itself is the single leaf
//! reference.
//!
//! Leaf interpretation differs by tree kind:
//!
//! - **File trees**: a leaf holds the PM offset of a file-write log entry,
//!   which in turn names a contiguous data extent. Assigning a new entry
//!   over a live leaf frees the displaced data block and bumps the old
//!   entry's invalid counter.
//! - **Direct trees** (directories, symlinks, the inode table): a leaf
//!   holds the data block's PM offset itself.
//!
//! Tree mutation happens under the per-inode lock. `{root, height}` are
//! published together through the header seqlock so lock-free readers
//! never see a torn pair.

use pmfs_common::log::FileWriteEntry;
use pmfs_common::{
    BlockType, PmfsInode, META_BLK_SHIFT, PMFS_BLOCK_SHIFT, PMFS_EOFBLOCKS_FL,
    PMFS_MAX_TREE_HEIGHT, PTRS_PER_META_BLOCK,
};

use crate::balloc::{block_to_off, off_to_block, BlockNr};
use crate::error::{PmfsError, Result};
use crate::fs::PmfsState;
use crate::inode::InodeHeader;
use crate::pm::{flush_buffer, flush};

/// Leaf interpretation of a radix tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeKind {
    /// Leaves are file-write log entry offsets.
    File,
    /// Leaves are data-block offsets (directories, symlinks, inode table).
    Direct,
}

/// Slots covered by one slot at the given level.
#[inline]
fn node_bits(height: u32) -> u32 {
    (height - 1) * META_BLK_SHIFT
}

/// Clamp a size-derived last block index to what the tree height can
/// address. Sparse files may claim sizes past their tree.
pub fn sparse_last_blocknr(height: u32, last_blocknr: u64) -> u64 {
    let max = 1u64 << (height * META_BLK_SHIFT);
    if last_blocknr >= max {
        max - 1
    } else {
        last_blocknr
    }
}

/// Minimum tree height addressing `last_blocknr`.
fn height_for(mut last_blocknr: u64) -> u32 {
    let mut height = 0;
    while last_blocknr > 0 {
        last_blocknr >>= META_BLK_SHIFT;
        height += 1;
    }
    height
}

/// Any non-zero slot outside `[start_idx, end_idx]`? Decides whether a
/// meta block can be freed after a range truncate.
fn is_empty_meta_block(node: &[u64; PTRS_PER_META_BLOCK], start_idx: usize, end_idx: usize) -> bool {
    node[..start_idx].iter().all(|&p| p == 0) && node[end_idx + 1..].iter().all(|&p| p == 0)
}

impl PmfsState {
    // ========================================================================
    // FIND
    // ========================================================================

    /// Walk the tree from `root` down `height` levels to the leaf covering
    /// `blocknr`. Returns 0 on any hole.
    fn walk_leaf(&self, root: u64, height: u32, mut blocknr: u64) -> u64 {
        let mut bp = root;
        let mut h = height;
        while h > 0 {
            let node = self.arena().slots(bp);
            let bits = node_bits(h);
            let idx = (blocknr >> bits) as usize;
            bp = node[idx];
            if bp == 0 {
                return 0;
            }
            blocknr &= (1 << bits) - 1;
            h -= 1;
        }
        bp
    }

    /// PM byte offset of the data backing 4K-relative block `file_blocknr`
    /// of a file inode, or 0 for a hole. The leaf's log entry is
    /// dereferenced to the extent block.
    pub fn find_data_block(&self, sih: &InodeHeader, file_blocknr: u64) -> u64 {
        let pi = self.inode_at(sih.pi_off);
        let data_bits = pi.blk_shift();
        let blk_shift = data_bits - PMFS_BLOCK_SHIFT;
        let blk_offset = file_blocknr & ((1 << blk_shift) - 1);
        let blocknr = file_blocknr >> blk_shift;

        let (root, height) = sih.read_root_height(self.arena());
        if root == 0 || blocknr >= (1u64 << (height * META_BLK_SHIFT)) {
            return 0;
        }

        let leaf = self.walk_leaf(root, height, blocknr);
        if leaf == 0 {
            return 0;
        }

        let entry = self.arena().at::<FileWriteEntry>(leaf);
        if !entry.covers(blocknr) {
            log::error!(
                "find: entry extent mismatch: blocknr {} entry pgoff {} num {}",
                blocknr,
                entry.pgoff,
                entry.num_pages
            );
            return 0;
        }
        let bp = entry.data_off() + ((blocknr - entry.pgoff as u64) << data_bits);
        bp + (blk_offset << PMFS_BLOCK_SHIFT)
    }

    /// Direct-leaf variant of [`find_data_block`]: the leaf already is the
    /// data block offset. Used for directory data, symlinks and the inode
    /// table.
    ///
    /// [`find_data_block`]: PmfsState::find_data_block
    pub fn find_direct_block(&self, sih: &InodeHeader, file_blocknr: u64) -> u64 {
        let pi = self.inode_at(sih.pi_off);
        let data_bits = pi.blk_shift();
        let blk_shift = data_bits - PMFS_BLOCK_SHIFT;
        let blk_offset = file_blocknr & ((1 << blk_shift) - 1);
        let blocknr = file_blocknr >> blk_shift;

        let (root, height) = sih.read_root_height(self.arena());
        if root == 0 || blocknr >= (1u64 << (height * META_BLK_SHIFT)) {
            return 0;
        }

        let bp = self.walk_leaf(root, height, blocknr);
        if bp == 0 {
            return 0;
        }
        bp + (blk_offset << PMFS_BLOCK_SHIFT)
    }

    // ========================================================================
    // ALLOCATE
    // ========================================================================

    /// Allocate one data block for the inode and account it. Returns the
    /// absolute block number.
    pub(crate) fn new_data_block(&self, pi: &mut PmfsInode, zero: bool) -> Result<BlockNr> {
        let btype = pi.blk_type();
        let blocknr = self.allocator().new_data_blocks(self.arena(), 1, btype, zero)?;
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_blocks += btype.num_4k_blocks();
        }
        Ok(blocknr)
    }

    /// Prepend empty interior nodes until the tree reaches `new_height`.
    /// Fresh nodes are explicitly zero-filled; only slot 0 carries the old
    /// root.
    fn increase_btree_height(&self, pi: &mut PmfsInode, sih: &InodeHeader, new_height: u32) -> Result<()> {
        let mut height = pi.height as u32;
        let mut prev_root = pi.root;
        log::debug!("increasing tree height {}:{}", height, new_height);
        while height < new_height {
            let blocknr = self.allocator().new_meta_blocks(self.arena(), 1, true)?;
            let node_off = block_to_off(blocknr);
            let node = self.arena().slots_mut(node_off);
            let _gate = self.arena().unlock_block(node_off);
            node.fill(0);
            node[0] = prev_root;
            flush_buffer(node.as_ptr() as *const u8, 8, false);
            prev_root = node_off;
            height += 1;
        }
        sih.write_root_height(self.arena(), prev_root, new_height as u8);
        Ok(())
    }

    fn recursive_alloc_blocks(
        &self,
        pi: &mut PmfsInode,
        node_off: u64,
        height: u32,
        first_blocknr: u64,
        last_blocknr: u64,
        zero: bool,
    ) -> Result<()> {
        let bits = node_bits(height);
        let first_index = (first_blocknr >> bits) as usize;
        let last_index = (last_blocknr >> bits) as usize;

        for i in first_index..=last_index {
            let node = self.arena().slots_mut(node_off);
            if height == 1 {
                if node[i] == 0 {
                    let blocknr = match self.new_data_block(pi, zero) {
                        Ok(nr) => nr,
                        Err(e) => {
                            log::debug!("alloc data blk failed: {}", e);
                            // For later recovery in truncate
                            let _gate = self.arena().unlock_struct(pi);
                            pi.i_flags |= PMFS_EOFBLOCKS_FL;
                            flush(pi, false);
                            return Err(e);
                        }
                    };
                    let _gate = self.arena().unlock_block(node_off);
                    node[i] = block_to_off(blocknr);
                }
            } else {
                if node[i] == 0 {
                    let blocknr = self.allocator().new_meta_blocks(self.arena(), 1, true)?;
                    let child = block_to_off(blocknr);
                    self.arena().slots_mut(child).fill(0);
                    let _gate = self.arena().unlock_block(node_off);
                    node[i] = child;
                }
                let first_blk = if i == first_index {
                    first_blocknr & ((1 << bits) - 1)
                } else {
                    0
                };
                let last_blk = if i == last_index {
                    last_blocknr & ((1 << bits) - 1)
                } else {
                    (1 << bits) - 1
                };
                self.recursive_alloc_blocks(pi, node[i], height - 1, first_blk, last_blk, zero)?;
            }
        }
        Ok(())
    }

    /// Allocate data blocks covering 4K-relative blocks
    /// `[file_blocknr, file_blocknr + num)`, growing the tree as needed.
    /// Existing blocks in the range are kept.
    pub fn alloc_blocks(
        &self,
        pi: &mut PmfsInode,
        sih: &InodeHeader,
        file_blocknr: u64,
        num: u32,
        zero: bool,
    ) -> Result<()> {
        let data_bits = pi.blk_shift();
        let blk_shift = data_bits - PMFS_BLOCK_SHIFT;
        let first_blocknr = file_blocknr >> blk_shift;
        let last_blocknr = (file_blocknr + num as u64 - 1) >> blk_shift;

        log::debug!(
            "alloc_blocks height {} file_blocknr {:x} num {}, first {:x} last {:x}",
            pi.height,
            file_blocknr,
            num,
            first_blocknr,
            last_blocknr
        );

        let mut height = pi.height as u32;
        let max_blocks = 1u64 << (height * META_BLK_SHIFT);

        if last_blocknr > max_blocks - 1 {
            // tree height increases as a result of this allocation
            height = height.max(height_for(last_blocknr));
            if height > PMFS_MAX_TREE_HEIGHT {
                log::debug!("max file size, cannot grow the file");
                return Err(PmfsError::NoSpace);
            }
        }

        if pi.root == 0 {
            if height == 0 {
                let blocknr = self.new_data_block(pi, zero)?;
                sih.write_root_height(self.arena(), block_to_off(blocknr), 0);
            } else {
                self.increase_btree_height(pi, sih, height)?;
                self.recursive_alloc_blocks(pi, pi.root, pi.height as u32, first_blocknr, last_blocknr, zero)?;
            }
        } else {
            if height == 0 {
                // the whole range already sits in the root leaf
                return Ok(());
            }
            if height > pi.height as u32 {
                self.increase_btree_height(pi, sih, height)?;
            }
            self.recursive_alloc_blocks(pi, pi.root, height, first_blocknr, last_blocknr, zero)?;
        }
        Ok(())
    }

    // ========================================================================
    // ASSIGN
    // ========================================================================

    /// Free the data block a live file leaf points at and invalidate one
    /// page of its entry's extent.
    fn retire_leaf(&self, pi: &mut PmfsInode, leaf: u64, index: u64) {
        let entry = self.arena().at_mut::<FileWriteEntry>(leaf);
        if !entry.covers(index) {
            log::error!(
                "entry extent mismatch: index {}, entry pgoff {}, num {}",
                index,
                entry.pgoff,
                entry.num_pages
            );
            panic!("corrupt file tree leaf");
        }
        let entry_off = index - entry.pgoff as u64;
        let blocknr = off_to_block(entry.data_off()) + entry_off;
        {
            let _gate = self.arena().unlock_block(leaf);
            entry.inc_invalid();
        }
        self.allocator().free_data_block(blocknr, pi.blk_type());
        log::debug!("free block {} @ {}, entry off {}", index, blocknr, entry_off);
        let _gate = self.arena().unlock_struct(pi);
        pi.i_blocks -= 1;
    }

    #[allow(clippy::too_many_arguments)]
    fn recursive_assign_blocks(
        &self,
        pi: &mut PmfsInode,
        node_off: u64,
        height: u32,
        first_blocknr: u64,
        last_blocknr: u64,
        curr_entry: u64,
        start_pgoff: u64,
        free_old: bool,
    ) -> Result<()> {
        let bits = node_bits(height);
        let first_index = (first_blocknr >> bits) as usize;
        let last_index = (last_blocknr >> bits) as usize;

        for i in first_index..=last_index {
            let node = self.arena().slots_mut(node_off);
            if height == 1 {
                if node[i] != 0 && free_old {
                    self.retire_leaf(pi, node[i], start_pgoff + i as u64);
                }
                let _gate = self.arena().unlock_block(node_off);
                node[i] = curr_entry;
            } else {
                if node[i] == 0 {
                    let blocknr = self.allocator().new_meta_blocks(self.arena(), 1, true)?;
                    let child = block_to_off(blocknr);
                    self.arena().slots_mut(child).fill(0);
                    let _gate = self.arena().unlock_block(node_off);
                    node[i] = child;
                }
                let first_blk = if i == first_index {
                    first_blocknr & ((1 << bits) - 1)
                } else {
                    0
                };
                let last_blk = if i == last_index {
                    last_blocknr & ((1 << bits) - 1)
                } else {
                    (1 << bits) - 1
                };
                let pgoff = start_pgoff + ((i as u64) << bits);
                self.recursive_assign_blocks(
                    pi,
                    node[i],
                    height - 1,
                    first_blk,
                    last_blk,
                    curr_entry,
                    pgoff,
                    free_old,
                )?;
            }
        }
        Ok(())
    }

    /// Publish the log entry at `curr_entry` into the file tree for 4K
    /// blocks `[file_blocknr, file_blocknr + num)`. Displaced blocks are
    /// freed and their entries garbage-marked.
    pub fn assign_blocks(
        &self,
        pi: &mut PmfsInode,
        sih: &InodeHeader,
        file_blocknr: u64,
        num: u32,
        curr_entry: u64,
        free_old: bool,
    ) -> Result<()> {
        let data_bits = pi.blk_shift();
        let blk_shift = data_bits - PMFS_BLOCK_SHIFT;
        let first_blocknr = file_blocknr >> blk_shift;
        let last_blocknr = (file_blocknr + num as u64 - 1) >> blk_shift;

        log::debug!(
            "assign_blocks height {} file_blocknr {:x} entry {:x} num {}",
            pi.height,
            file_blocknr,
            curr_entry,
            num
        );

        let mut height = pi.height as u32;
        let max_blocks = 1u64 << (height * META_BLK_SHIFT);

        if last_blocknr > max_blocks - 1 {
            height = height.max(height_for(last_blocknr));
            if height > PMFS_MAX_TREE_HEIGHT {
                log::debug!("max file size, cannot grow the file");
                return Err(PmfsError::NoSpace);
            }
        }

        if pi.root == 0 {
            if height == 0 {
                sih.write_root_height(self.arena(), curr_entry, 0);
            } else {
                self.increase_btree_height(pi, sih, height)?;
                self.recursive_assign_blocks(
                    pi,
                    pi.root,
                    pi.height as u32,
                    first_blocknr,
                    last_blocknr,
                    curr_entry,
                    0,
                    free_old,
                )?;
            }
        } else {
            if height == 0 {
                // re-assign the root leaf, retiring the old entry
                if free_old {
                    self.retire_leaf(pi, pi.root, 0);
                }
                sih.write_root_height(self.arena(), curr_entry, 0);
                return Ok(());
            }
            if height > pi.height as u32 {
                self.increase_btree_height(pi, sih, height)?;
            }
            self.recursive_assign_blocks(
                pi,
                pi.root,
                height,
                first_blocknr,
                last_blocknr,
                curr_entry,
                0,
                free_old,
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // TRUNCATE
    // ========================================================================

    /// Recursively free `[first_blocknr, last_blocknr]` below `node_off`.
    /// Returns the number of data blocks freed and whether the node ended
    /// up empty (and was itself left to the caller to free).
    fn recursive_truncate_blocks(
        &self,
        kind: TreeKind,
        btype: BlockType,
        node_off: u64,
        height: u32,
        first_blocknr: u64,
        last_blocknr: u64,
        start_pgoff: u64,
    ) -> (u64, bool) {
        let bits = node_bits(height);
        let first_index = (first_blocknr >> bits) as usize;
        let last_index = (last_blocknr >> bits) as usize;
        let mut start = first_index;
        let mut end = last_index;
        let mut freed: u64 = 0;
        let mut all_range_freed = true;

        let node = self.arena().slots_mut(node_off);

        if height == 1 {
            for i in first_index..=last_index {
                if node[i] == 0 {
                    continue;
                }
                match kind {
                    TreeKind::File => {
                        let entry = self.arena().at_mut::<FileWriteEntry>(node[i]);
                        let index = start_pgoff + i as u64;
                        if !entry.covers(index) {
                            log::error!(
                                "entry error: start pgoff {}, {}, entry pgoff {}, num {}",
                                start_pgoff,
                                i,
                                entry.pgoff,
                                entry.num_pages
                            );
                            panic!("corrupt file tree leaf");
                        }
                        let entry_off = index - entry.pgoff as u64;
                        let blocknr = off_to_block(entry.data_off()) + entry_off;
                        {
                            let _gate = self.arena().unlock_block(node[i]);
                            entry.inc_invalid();
                        }
                        self.allocator().free_data_block(blocknr, btype);
                    }
                    TreeKind::Direct => {
                        self.allocator().free_data_block(off_to_block(node[i]), btype);
                    }
                }
                freed += 1;
            }
        } else {
            for i in first_index..=last_index {
                if node[i] == 0 {
                    continue;
                }
                let first_blk = if i == first_index {
                    first_blocknr & ((1 << bits) - 1)
                } else {
                    0
                };
                let last_blk = if i == last_index {
                    last_blocknr & ((1 << bits) - 1)
                } else {
                    (1 << bits) - 1
                };
                let pgoff = start_pgoff + ((i as u64) << bits);
                let (sub_freed, mpty) = self.recursive_truncate_blocks(
                    kind,
                    btype,
                    node[i],
                    height - 1,
                    first_blk,
                    last_blk,
                    pgoff,
                );
                freed += sub_freed;
                if mpty {
                    self.free_meta_node(kind, node[i]);
                } else {
                    if i == first_index {
                        start += 1;
                    } else if i == last_index {
                        end -= 1;
                    }
                    all_range_freed = false;
                }
            }
        }

        if all_range_freed && is_empty_meta_block(node, first_index, last_index) {
            (freed, true)
        } else {
            // zero out the freed slice if the meta block is not empty
            if start <= end {
                let _gate = self.arena().unlock_block(node_off);
                for slot in &mut node[start..=end] {
                    *slot = 0;
                }
                flush_buffer(
                    node[start..].as_ptr() as *const u8,
                    (end - start + 1) * core::mem::size_of::<u64>(),
                    false,
                );
            }
            (freed, false)
        }
    }

    /// Interior nodes of directory trees live in data blocks; file trees
    /// use meta blocks.
    fn free_meta_node(&self, kind: TreeKind, node_off: u64) {
        match kind {
            TreeKind::File => self.allocator().free_meta_block(off_to_block(node_off)),
            TreeKind::Direct => self
                .allocator()
                .free_data_block(off_to_block(node_off), BlockType::Block4K),
        }
    }

    /// Free meta blocks only, leaving data untouched. Used to drop a tree
    /// skeleton that will be regenerated from the log.
    fn recursive_truncate_meta_blocks(
        &self,
        node_off: u64,
        height: u32,
        first_blocknr: u64,
        last_blocknr: u64,
    ) -> (u64, bool) {
        if height == 1 {
            return (0, true);
        }
        let bits = node_bits(height);
        let first_index = (first_blocknr >> bits) as usize;
        let last_index = (last_blocknr >> bits) as usize;
        let mut start = first_index;
        let mut end = last_index;
        let mut freed: u64 = 0;
        let mut all_range_freed = true;

        let node = self.arena().slots_mut(node_off);
        for i in first_index..=last_index {
            if node[i] == 0 {
                continue;
            }
            let first_blk = if i == first_index {
                first_blocknr & ((1 << bits) - 1)
            } else {
                0
            };
            let last_blk = if i == last_index {
                last_blocknr & ((1 << bits) - 1)
            } else {
                (1 << bits) - 1
            };
            let (sub_freed, mpty) =
                self.recursive_truncate_meta_blocks(node[i], height - 1, first_blk, last_blk);
            freed += sub_freed;
            if mpty {
                self.allocator().free_meta_block(off_to_block(node[i]));
                freed += 1;
            } else {
                if i == first_index {
                    start += 1;
                } else if i == last_index {
                    end -= 1;
                }
                all_range_freed = false;
            }
        }

        if all_range_freed && is_empty_meta_block(node, first_index, last_index) {
            (freed, true)
        } else {
            if start <= end {
                let _gate = self.arena().unlock_block(node_off);
                for slot in &mut node[start..=end] {
                    *slot = 0;
                }
                flush_buffer(
                    node[start..].as_ptr() as *const u8,
                    (end - start + 1) * core::mem::size_of::<u64>(),
                    false,
                );
            }
            (freed, false)
        }
    }

    /// Free a whole file subtree on evict. Returns data blocks freed.
    pub fn free_file_inode_subtree(
        &self,
        root: u64,
        height: u32,
        btype: BlockType,
        last_blocknr: u64,
    ) -> u64 {
        if root == 0 {
            return 0;
        }
        if height == 0 {
            let entry = self.arena().at_mut::<FileWriteEntry>(root);
            let blocknr = off_to_block(entry.data_off());
            {
                let _gate = self.arena().unlock_block(root);
                entry.inc_invalid();
            }
            self.allocator().free_data_block(blocknr, btype);
            1
        } else {
            let (freed, mpty) = self.recursive_truncate_blocks(
                TreeKind::File,
                btype,
                root,
                height,
                0,
                last_blocknr,
                0,
            );
            debug_assert!(mpty, "full-range truncate left live leaves");
            self.allocator().free_meta_block(off_to_block(root));
            freed
        }
    }

    /// Free a whole directory/symlink subtree on evict.
    pub fn free_dir_inode_subtree(
        &self,
        root: u64,
        height: u32,
        btype: BlockType,
        last_blocknr: u64,
    ) -> u64 {
        if root == 0 {
            return 0;
        }
        if height == 0 {
            self.allocator().free_data_block(off_to_block(root), btype);
            1
        } else {
            let (freed, mpty) = self.recursive_truncate_blocks(
                TreeKind::Direct,
                btype,
                root,
                height,
                0,
                last_blocknr,
                0,
            );
            debug_assert!(mpty, "full-range truncate left live leaves");
            self.allocator()
                .free_data_block(off_to_block(root), BlockType::Block4K);
            freed
        }
    }

    /// Free only the interior nodes of a file tree; the data stays
    /// reachable through the log. Clears `root`.
    pub fn free_file_meta_blocks(&self, pi: &mut PmfsInode, sih: &InodeHeader, last_blocknr: u64) -> u64 {
        if pi.root == 0 || pi.height == 0 {
            return 0;
        }
        let (mut freed, mpty) =
            self.recursive_truncate_meta_blocks(pi.root, pi.height as u32, 0, last_blocknr);
        debug_assert!(mpty);
        self.allocator().free_meta_block(off_to_block(pi.root));
        freed += 1;
        sih.write_root_height(self.arena(), 0, 0);
        freed
    }

    /// Reduce the tree height to the minimum covering `newsize`, replacing
    /// the root by its slot-0 child level by level. `{root, height}` are
    /// published together through the header seqlock.
    fn decrease_btree_height(&self, pi: &mut PmfsInode, sih: &InodeHeader, newsize: u64, mut newroot: u64) {
        let height = pi.height as u32;
        let mut new_height = 0;

        if pi.i_blocks == 0 || newsize == 0 {
            // root must be empty by now
            debug_assert_eq!(newroot, 0);
        } else {
            let blk_size = pi.blk_size() as u64;
            let last_blocknr = ((newsize + blk_size - 1) >> pi.blk_shift()) - 1;
            new_height = height_for(last_blocknr);
            if height == new_height {
                return;
            }
            log::debug!("reducing tree height {} -> {}", height, new_height);
            let mut h = height;
            while h > new_height {
                let node = self.arena().slots(newroot);
                let page_addr = newroot;
                newroot = node[0];
                self.allocator().free_meta_block(off_to_block(page_addr));
                h -= 1;
            }
        }
        sih.write_root_height(self.arena(), newroot, new_height as u8);
    }

    /// Free data blocks of `[start, end)` (byte offsets) from the inode's
    /// tree, shrinking height afterwards. Mirrors the shape of the original
    /// range truncate: used both by setattr truncation and by recovery.
    pub fn truncate_blocks(&self, pi: &mut PmfsInode, sih: &InodeHeader, start: u64, end: u64) {
        let data_bits = pi.blk_shift();

        if pi.root == 0 {
            self.truncate_time_update(pi);
            return;
        }

        log::debug!(
            "truncate: iblocks {:x} {:x} {:x} height {} size {:x}",
            pi.i_blocks,
            start,
            end,
            pi.height,
            pi.i_size
        );

        let first_blocknr = (start + (1u64 << data_bits) - 1) >> data_bits;
        let last_blocknr = if pi.has_eofblocks() {
            (1u64 << (pi.height as u32 * META_BLK_SHIFT)) - 1
        } else {
            if end == 0 {
                self.truncate_time_update(pi);
                return;
            }
            sparse_last_blocknr(pi.height as u32, (end - 1) >> data_bits)
        };

        if first_blocknr > last_blocknr {
            self.truncate_time_update(pi);
            return;
        }

        let mut root = pi.root;
        let freed;
        let kind = if pmfs_common::inode::s_isreg(pi.i_mode) {
            TreeKind::File
        } else {
            TreeKind::Direct
        };

        if pi.height == 0 {
            match kind {
                TreeKind::File => {
                    let entry = self.arena().at_mut::<FileWriteEntry>(root);
                    let blocknr = off_to_block(entry.data_off());
                    {
                        let _gate = self.arena().unlock_block(root);
                        entry.inc_invalid();
                    }
                    self.allocator().free_data_block(blocknr, pi.blk_type());
                }
                TreeKind::Direct => {
                    self.allocator().free_data_block(off_to_block(root), pi.blk_type());
                }
            }
            root = 0;
            freed = 1;
        } else {
            let (f, mpty) = self.recursive_truncate_blocks(
                kind,
                pi.blk_type(),
                root,
                pi.height as u32,
                first_blocknr,
                last_blocknr,
                0,
            );
            freed = f;
            if mpty {
                self.free_meta_node(kind, root);
                root = 0;
            }
        }

        // during mount recovery a power failure happened; recount instead
        // of trusting the stored block count
        let i_blocks = if self.is_mounting() {
            self.count_iblocks(pi, root)
        } else {
            pi.i_blocks - freed * (1u64 << (data_bits - PMFS_BLOCK_SHIFT))
        };

        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_blocks = i_blocks;
            let now = self.now();
            pi.i_mtime = now;
            pi.i_ctime = now;
        }
        self.decrease_btree_height(pi, sih, start, root);
        self.check_eof_blocks(pi, pi.i_size);
        flush_buffer(pi as *const PmfsInode as *const u8, pmfs_common::CACHELINE_SIZE, false);
    }

    fn truncate_time_update(&self, pi: &mut PmfsInode) {
        let _gate = self.arena().unlock_struct(pi);
        let now = self.now();
        pi.i_mtime = now;
        pi.i_ctime = now;
        flush_buffer(pi as *const PmfsInode as *const u8, pmfs_common::CACHELINE_SIZE, false);
    }

    /// Clear `EOFBLOCKS_FL` once the allocated extent again covers
    /// `size`.
    pub(crate) fn check_eof_blocks(&self, pi: &mut PmfsInode, size: u64) {
        if pi.has_eofblocks()
            && size + (1u64 << PMFS_BLOCK_SHIFT) > (pi.i_blocks << PMFS_BLOCK_SHIFT)
        {
            let _gate = self.arena().unlock_struct(pi);
            pi.i_flags &= !PMFS_EOFBLOCKS_FL;
        }
    }

    fn count_iblocks_recursive(&self, block: u64, height: u32) -> u64 {
        if height == 0 {
            return 1;
        }
        let node = self.arena().slots(block);
        let mut blocks = 0;
        for &slot in node.iter() {
            if slot == 0 {
                continue;
            }
            blocks += self.count_iblocks_recursive(slot, height - 1);
        }
        blocks
    }

    /// Recount the inode's data blocks (4K units) by walking the tree.
    pub(crate) fn count_iblocks(&self, pi: &PmfsInode, root: u64) -> u64 {
        if root == 0 {
            return 0;
        }
        let iblocks = self.count_iblocks_recursive(root, pi.height as u32);
        iblocks << (pi.blk_shift() - PMFS_BLOCK_SHIFT)
    }

    // ========================================================================
    // SEEK_DATA / SEEK_HOLE
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn recursive_find_region(
        &self,
        block: u64,
        height: u32,
        first_blocknr: u64,
        last_blocknr: u64,
        data_found: &mut bool,
        hole_found: &mut bool,
        hole: bool,
    ) -> u64 {
        let bits = node_bits(height);
        let first_index = (first_blocknr >> bits) as usize;
        let last_index = (last_blocknr >> bits) as usize;
        let node = self.arena().slots(block);
        let mut blocks: u64 = 0;

        for i in first_index..=last_index {
            if height == 1 || node[i] == 0 {
                if node[i] != 0 {
                    *data_found = true;
                    if !hole {
                        return blocks;
                    }
                } else {
                    *hole_found = true;
                }
                if !*hole_found || !hole {
                    blocks += 1 << bits;
                }
            } else {
                let first_blk = if i == first_index {
                    first_blocknr & ((1 << bits) - 1)
                } else {
                    0
                };
                let last_blk = if i == last_index {
                    last_blocknr & ((1 << bits) - 1)
                } else {
                    (1 << bits) - 1
                };
                blocks += self.recursive_find_region(
                    node[i],
                    height - 1,
                    first_blk,
                    last_blk,
                    data_found,
                    hole_found,
                    hole,
                );
                if !hole && *data_found {
                    return blocks;
                }
            }
        }
        blocks
    }

    /// SEEK_DATA (`hole == false`) / SEEK_HOLE (`hole == true`) scan.
    /// Advances `offset` per lseek semantics; `InvalidArgument` maps to
    /// ENXIO past EOF.
    pub fn find_region(&self, sih: &InodeHeader, offset: &mut u64, hole: bool) -> Result<()> {
        let pi = self.inode_at(sih.pi_off);
        let i_size = pi.i_size;
        let data_bits = pi.blk_shift();
        let mut data_found = false;
        let mut hole_found = false;
        let mut blocks: u64 = 0;

        if *offset >= i_size {
            return Err(PmfsError::InvalidArgument);
        }

        if pi.i_blocks == 0 || pi.root == 0 {
            if hole {
                *offset = i_size;
                return Ok(());
            }
            return Err(PmfsError::InvalidArgument);
        }

        let offset_in_block = *offset & ((1u64 << data_bits) - 1);

        if pi.height == 0 {
            data_found = true;
        } else {
            let first_blocknr = *offset >> data_bits;
            let last_blocknr = i_size >> data_bits;
            blocks = self.recursive_find_region(
                pi.root,
                pi.height as u32,
                first_blocknr,
                last_blocknr,
                &mut data_found,
                &mut hole_found,
                hole,
            );
        }

        // searching data but only holes found to the end
        if !hole && !data_found && hole_found {
            return Err(PmfsError::InvalidArgument);
        }

        if data_found && !hole_found {
            // already inside data; for SEEK_HOLE the next hole is EOF
            if hole {
                *offset = i_size;
            }
            return Ok(());
        }

        // searching a hole and starting inside one
        if hole && hole_found && blocks == 0 {
            if !data_found {
                *offset = i_size;
            }
            return Ok(());
        }

        if offset_in_block != 0 {
            blocks -= 1;
            *offset += (blocks << data_bits) + ((1u64 << data_bits) - offset_in_block);
        } else {
            *offset += blocks << data_bits;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_covers_last_block() {
        assert_eq!(height_for(0), 0);
        assert_eq!(height_for(1), 1);
        assert_eq!(height_for(511), 1);
        assert_eq!(height_for(512), 2);
        assert_eq!(height_for(512 * 512 - 1), 2);
        assert_eq!(height_for(512 * 512), 3);
    }

    #[test]
    fn sparse_clamp() {
        assert_eq!(sparse_last_blocknr(1, 100), 100);
        assert_eq!(sparse_last_blocknr(1, 511), 511);
        assert_eq!(sparse_last_blocknr(1, 512), 511);
        assert_eq!(sparse_last_blocknr(2, 100_000), 100_000);
        assert_eq!(sparse_last_blocknr(2, 1 << 20), (1 << 18) - 1);
    }

    #[test]
    fn empty_meta_block_ignores_covered_range() {
        let mut node = [0u64; PTRS_PER_META_BLOCK];
        assert!(is_empty_meta_block(&node, 0, 511));
        node[7] = 0x1000;
        assert!(is_empty_meta_block(&node, 7, 7));
        assert!(is_empty_meta_block(&node, 0, 10));
        assert!(!is_empty_meta_block(&node, 8, 10));
        assert!(!is_empty_meta_block(&node, 0, 6));
    }
}
