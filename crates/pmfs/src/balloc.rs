//! Block Allocator Facade
//!
//! The engine consumes the allocator through a trait: PM data blocks
//! (4K/2M/1G), 4K meta blocks for radix nodes, and log pages. Blocks are
//! identified by their 4K page number; a 2M or 1G data block is an aligned
//! run of 4K pages.
//!
//! `RangeAllocator` is the reference implementation: a first-fit ordered
//! map of free ranges under its own lock (`s_lock`), with sticky free
//! hints that speed up adjacent frees.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::error::{PmfsError, Result};
use crate::pm::{memset_nt, PmArena};
use pmfs_common::{BlockType, PMFS_BLOCK_SHIFT, PMFS_DEF_BLOCK_SIZE_4K};

/// 4K page number within the PM region.
pub type BlockNr = u64;

/// PM byte offset of a block.
#[inline]
pub const fn block_to_off(blocknr: BlockNr) -> u64 {
    blocknr << PMFS_BLOCK_SHIFT
}

/// 4K page number containing a PM byte offset.
#[inline]
pub const fn off_to_block(off: u64) -> BlockNr {
    off >> PMFS_BLOCK_SHIFT
}

// ============================================================================
// FREE HINT
// ============================================================================

/// Opaque sticky cursor carried across adjacent frees. Callers that free
/// runs of related blocks (log chains, truncate sweeps) keep one hint per
/// sweep.
#[derive(Default)]
pub struct FreeHint {
    // Start of the free range the previous free landed in.
    last_range: Option<u64>,
}

impl FreeHint {
    pub fn new() -> Self {
        FreeHint::default()
    }
}

// ============================================================================
// ALLOCATOR TRAIT
// ============================================================================

/// Block allocation contract consumed by the engine.
pub trait BlockAllocator: Send + Sync {
    /// Allocate `num` contiguous data blocks of the given type; the run is
    /// aligned to the block type. Returns the first 4K page number.
    fn new_data_blocks(
        &self,
        arena: &PmArena,
        num: u32,
        btype: BlockType,
        zero: bool,
    ) -> Result<BlockNr>;

    /// Allocate `num` contiguous 4K meta blocks.
    fn new_meta_blocks(&self, arena: &PmArena, num: u32, zero: bool) -> Result<BlockNr>;

    fn free_data_block(&self, blocknr: BlockNr, btype: BlockType);

    fn free_meta_block(&self, blocknr: BlockNr);

    /// Free a log page; `hint` speeds up freeing chains page by page.
    fn free_log_block(&self, blocknr: BlockNr, btype: BlockType, hint: &mut FreeHint);

    fn count_free_blocks(&self) -> u64;
}

// ============================================================================
// RANGE ALLOCATOR
// ============================================================================

struct FreeList {
    // start page -> length, coalesced on free
    ranges: BTreeMap<u64, u64>,
    num_free_blocks: u64,
    alloc_count: u64,
    free_count: u64,
    allocated_blocks: u64,
    freed_blocks: u64,
}

/// First-fit free-range allocator over 4K pages.
pub struct RangeAllocator {
    s_lock: Mutex<FreeList>,
}

impl RangeAllocator {
    /// An allocator whose free pool is the page range `[start, end)`.
    pub fn new(start: BlockNr, end: BlockNr) -> Self {
        let mut ranges = BTreeMap::new();
        let len = end.saturating_sub(start);
        if len > 0 {
            ranges.insert(start, len);
        }
        RangeAllocator {
            s_lock: Mutex::new(FreeList {
                ranges,
                num_free_blocks: len,
                alloc_count: 0,
                free_count: 0,
                allocated_blocks: 0,
                freed_blocks: 0,
            }),
        }
    }

    /// An allocator with nothing free. Recovery code feeds it with frees.
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Number of free operations performed, for consistency checks.
    pub fn free_count(&self) -> u64 {
        self.s_lock.lock().free_count
    }

    /// Is the page run `[blocknr, blocknr + num)` entirely free?
    pub fn is_free(&self, blocknr: BlockNr, num: u64) -> bool {
        let list = self.s_lock.lock();
        match list.ranges.range(..=blocknr).next_back() {
            Some((&start, &len)) => blocknr + num <= start + len,
            None => false,
        }
    }

    fn alloc_aligned(&self, num: u64, align: u64) -> Result<BlockNr> {
        let mut list = self.s_lock.lock();
        let mut found = None;
        for (&start, &len) in list.ranges.iter() {
            let aligned = (start + align - 1) & !(align - 1);
            if aligned + num <= start + len {
                found = Some((start, len, aligned));
                break;
            }
        }
        let (start, len, aligned) = found.ok_or(PmfsError::NoSpace)?;

        list.ranges.remove(&start);
        if aligned > start {
            list.ranges.insert(start, aligned - start);
        }
        let tail = (start + len) - (aligned + num);
        if tail > 0 {
            list.ranges.insert(aligned + num, tail);
        }
        list.num_free_blocks -= num;
        list.alloc_count += 1;
        list.allocated_blocks += num;
        Ok(aligned)
    }

    fn free_run(&self, blocknr: BlockNr, num: u64, hint: Option<&mut FreeHint>) {
        let mut list = self.s_lock.lock();

        // Sticky-hint fast path: extend the range the previous free ended in.
        if let Some(hint) = &hint {
            if let Some(start) = hint.last_range {
                if let Some(&len) = list.ranges.get(&start) {
                    if start + len == blocknr {
                        list.ranges.insert(start, len + num);
                        list.num_free_blocks += num;
                        list.free_count += 1;
                        list.freed_blocks += num;
                        self.coalesce_after(&mut list, start);
                        return;
                    }
                }
            }
        }

        let mut start = blocknr;
        let mut len = num;

        // Merge with predecessor
        if let Some((&prev, &prev_len)) = list.ranges.range(..blocknr).next_back() {
            debug_assert!(prev + prev_len <= blocknr, "double free of block {}", blocknr);
            if prev + prev_len == blocknr {
                list.ranges.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        // Merge with successor
        if let Some(&next_len) = list.ranges.get(&(blocknr + num)) {
            list.ranges.remove(&(blocknr + num));
            len += next_len;
        }
        list.ranges.insert(start, len);
        list.num_free_blocks += num;
        list.free_count += 1;
        list.freed_blocks += num;
        drop(list);

        if let Some(hint) = hint {
            hint.last_range = Some(start);
        }
    }

    fn coalesce_after(&self, list: &mut FreeList, start: u64) {
        let len = *list.ranges.get(&start).unwrap_or(&0);
        if let Some(&next_len) = list.ranges.get(&(start + len)) {
            list.ranges.remove(&(start + len));
            list.ranges.insert(start, len + next_len);
        }
    }

    fn zero_blocks(arena: &PmArena, blocknr: BlockNr, num: u64) {
        memset_nt(
            arena.ptr(block_to_off(blocknr)),
            0,
            (num as usize) * PMFS_DEF_BLOCK_SIZE_4K,
        );
    }
}

impl BlockAllocator for RangeAllocator {
    fn new_data_blocks(
        &self,
        arena: &PmArena,
        num: u32,
        btype: BlockType,
        zero: bool,
    ) -> Result<BlockNr> {
        let per_block = btype.num_4k_blocks();
        let pages = num as u64 * per_block;
        let blocknr = self.alloc_aligned(pages, per_block)?;
        if zero {
            Self::zero_blocks(arena, blocknr, pages);
        }
        log::debug!("alloc {} data blocks ({:?}) at {}", num, btype, blocknr);
        Ok(blocknr)
    }

    fn new_meta_blocks(&self, arena: &PmArena, num: u32, zero: bool) -> Result<BlockNr> {
        let blocknr = self.alloc_aligned(num as u64, 1)?;
        if zero {
            Self::zero_blocks(arena, blocknr, num as u64);
        }
        Ok(blocknr)
    }

    fn free_data_block(&self, blocknr: BlockNr, btype: BlockType) {
        self.free_run(blocknr, btype.num_4k_blocks(), None);
    }

    fn free_meta_block(&self, blocknr: BlockNr) {
        self.free_run(blocknr, 1, None);
    }

    fn free_log_block(&self, blocknr: BlockNr, btype: BlockType, hint: &mut FreeHint) {
        self.free_run(blocknr, btype.num_4k_blocks(), Some(hint));
    }

    fn count_free_blocks(&self) -> u64 {
        self.s_lock.lock().num_free_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        let arena = PmArena::volatile(1 << 20);
        let a = RangeAllocator::new(0, 256);
        assert_eq!(a.count_free_blocks(), 256);

        let b1 = a.new_meta_blocks(&arena, 1, true).unwrap();
        let b2 = a.new_meta_blocks(&arena, 4, false).unwrap();
        assert_eq!(a.count_free_blocks(), 251);
        assert_ne!(b1, b2);

        a.free_meta_block(b1);
        for i in 0..4 {
            a.free_meta_block(b2 + i);
        }
        assert_eq!(a.count_free_blocks(), 256);
        assert!(a.is_free(0, 256));
    }

    #[test]
    fn large_blocks_are_aligned() {
        let arena = PmArena::volatile(1 << 20);
        let a = RangeAllocator::new(3, 2048);
        let b = a.new_data_blocks(&arena, 1, BlockType::Block2M, false).unwrap();
        assert_eq!(b % 512, 0);
        a.free_data_block(b, BlockType::Block2M);
        assert_eq!(a.count_free_blocks(), 2045);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let arena = PmArena::volatile(1 << 20);
        let a = RangeAllocator::new(0, 4);
        assert_eq!(
            a.new_meta_blocks(&arena, 8, false).unwrap_err(),
            PmfsError::NoSpace
        );
        // 2M needs 512 pages
        assert_eq!(
            a.new_data_blocks(&arena, 1, BlockType::Block2M, false).unwrap_err(),
            PmfsError::NoSpace
        );
    }

    #[test]
    fn hinted_frees_coalesce_chains() {
        let arena = PmArena::volatile(1 << 20);
        let a = RangeAllocator::new(0, 64);
        let start = a.new_meta_blocks(&arena, 8, false).unwrap();

        let mut hint = FreeHint::new();
        for i in 0..8 {
            a.free_log_block(start + i, BlockType::Block4K, &mut hint);
        }
        assert_eq!(a.count_free_blocks(), 64);
        assert_eq!(a.free_count(), 8);
        assert!(a.is_free(0, 64));
        // all eight frees landed in one range
        assert_eq!(a.s_lock.lock().ranges.len(), 1);
    }

    #[test]
    fn zeroed_allocation_is_zero() {
        let arena = PmArena::volatile(1 << 20);
        arena.bytes_mut(0, 1 << 20).fill(0xAA);
        let a = RangeAllocator::new(16, 32);
        let b = a.new_data_blocks(&arena, 1, BlockType::Block4K, true).unwrap();
        assert!(arena.bytes(block_to_off(b), 4096).iter().all(|&x| x == 0));
    }
}
