//! Inode Structure
//!
//! PM inodes are fixed 128-byte records. The three basic inodes (root
//! directory, blocknode, inode table) live at fixed offsets after the super
//! blocks; every other inode is a slot in the inode-table inode's file
//! extent, addressed by `ino * PMFS_INODE_SIZE`.

use crate::{BlockType, PMFS_INODE_SIZE};

// ============================================================================
// INODE FLAGS
// ============================================================================

/// There are blocks allocated beyond eof; truncate must cover the whole
/// tree at recovery.
pub const PMFS_EOFBLOCKS_FL: u32 = 0x2000_0000;

pub const FS_SECRM_FL: u32 = 0x0000_0001;
pub const FS_UNRM_FL: u32 = 0x0000_0002;
pub const FS_COMPR_FL: u32 = 0x0000_0004;
pub const FS_SYNC_FL: u32 = 0x0000_0008;
pub const FS_IMMUTABLE_FL: u32 = 0x0000_0010;
pub const FS_APPEND_FL: u32 = 0x0000_0020;
pub const FS_NODUMP_FL: u32 = 0x0000_0040;
pub const FS_NOATIME_FL: u32 = 0x0000_0080;
pub const FS_COMPRBLK_FL: u32 = 0x0000_0200;
pub const FS_NOCOMP_FL: u32 = 0x0000_0400;
pub const FS_JOURNAL_DATA_FL: u32 = 0x0000_4000;
pub const FS_NOTAIL_FL: u32 = 0x0000_8000;
pub const FS_DIRSYNC_FL: u32 = 0x0001_0000;
pub const FS_TOPDIR_FL: u32 = 0x0002_0000;

/// Flags that should be inherited by new inodes from their parent.
pub const PMFS_FL_INHERITED: u32 = FS_SECRM_FL
    | FS_UNRM_FL
    | FS_COMPR_FL
    | FS_SYNC_FL
    | FS_NODUMP_FL
    | FS_NOATIME_FL
    | FS_COMPRBLK_FL
    | FS_NOCOMP_FL
    | FS_JOURNAL_DATA_FL
    | FS_NOTAIL_FL
    | FS_DIRSYNC_FL;
/// Flags that are appropriate for regular files (all but dir-specific ones).
pub const PMFS_REG_FLMASK: u32 = !(FS_DIRSYNC_FL | FS_TOPDIR_FL);
/// Flags that are appropriate for non-directories/non-regular files.
pub const PMFS_OTHER_FLMASK: u32 = FS_NODUMP_FL | FS_NOATIME_FL;

// ============================================================================
// FILE MODE
// ============================================================================

pub const S_IFMT: u16 = 0xF000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFBLK: u16 = 0x6000;

pub const fn s_isreg(mode: u16) -> bool {
    mode & S_IFMT == S_IFREG
}

pub const fn s_isdir(mode: u16) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub const fn s_islnk(mode: u16) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Mask out flags that are inappropriate for the given type of inode.
pub fn mask_inode_flags(mode: u16, parent_flags: u32) -> u32 {
    let flags = parent_flags & PMFS_FL_INHERITED;
    if s_isdir(mode) {
        flags
    } else if s_isreg(mode) {
        flags & PMFS_REG_FLMASK
    } else {
        flags & PMFS_OTHER_FLMASK
    }
}

// ============================================================================
// TRUNCATE ITEM
// ============================================================================

/// Per-inode link in the PM truncate list.
///
/// `next` is the inode number of the next list member (0 terminates). An
/// inode on the list has deferred reclamation work: a pending free of the
/// whole inode, or a shrink to `truncate_size` that may be half done.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TruncateItem {
    pub next: u64,
    pub truncate_size: u64,
}

pub const PMFS_TRUNCATE_ITEM_SIZE: usize = 16;

// ============================================================================
// INODE STRUCTURE
// ============================================================================

/// Inode - 128 bytes in PM.
///
/// `root` and `height` describe the radix block tree: with `height == 0`,
/// `root` points directly at one data block (dir tree) or log entry (file
/// tree); otherwise at a radix node. The two fields share the inode's first
/// qword region so a shrink can publish both together (see the engine's
/// seqlock discipline).
///
/// `log_head`/`log_tail` bound the logical log range inside the chained
/// log pages; `log_pages` is the chain length.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PmfsInode {
    // First cacheline: tree geometry and size
    pub i_rsvd: u16,           // reserved; used to be a checksum
    pub height: u8,            // radix tree height, 0..=3
    pub i_blk_type: u8,        // data block size this inode uses
    pub i_flags: u32,          // inode flags
    pub root: u64,             // radix tree root, PM offset
    pub i_size: u64,           // size of data in bytes
    pub i_ctime: u32,          // inode change time
    pub i_mtime: u32,          // data modification time
    pub i_dtime: u32,          // deletion time
    pub i_mode: u16,           // file mode
    pub i_links_count: u16,    // links count
    pub i_blocks: u64,         // block count, in 4K units
    pub i_xattr: u64,          // extended attribute block
    pub i_uid: u32,            // owner uid
    pub i_gid: u32,            // group id
    pub i_generation: u32,     // file version (for NFS)
    pub i_atime: u32,          // access time
    pub i_rdev: u32,           // device inode major/minor
    pub _pad0: u32,

    // Log
    pub pmfs_ino: u64,         // own inode number
    pub log_head: u64,         // PM offset of the first log entry
    pub log_tail: u64,         // PM offset one past the last log entry
    pub log_pages: u32,        // length of the log page chain
    pub _pad1: u32,

    // Deferred-reclamation link
    pub i_truncated: TruncateItem,
}

impl PmfsInode {
    #[inline]
    pub fn blk_type(&self) -> BlockType {
        BlockType::from_u8(self.i_blk_type)
    }

    /// log2 of this inode's data-block size.
    #[inline]
    pub fn blk_shift(&self) -> u32 {
        self.blk_type().shift()
    }

    #[inline]
    pub fn blk_size(&self) -> u32 {
        self.blk_type().size()
    }

    /// An inode slot is free iff it has no links and is either unborn or
    /// deleted.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.i_links_count == 0 && (self.i_mode == 0 || self.i_dtime != 0)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        !self.is_free()
    }

    pub fn has_eofblocks(&self) -> bool {
        self.i_flags & PMFS_EOFBLOCKS_FL != 0
    }
}

// ============================================================================
// COMPILE-TIME CHECKS
// ============================================================================

const _: () = assert!(core::mem::size_of::<PmfsInode>() == PMFS_INODE_SIZE);
const _: () = assert!(core::mem::size_of::<TruncateItem>() == PMFS_TRUNCATE_ITEM_SIZE);
// decrease_btree_height publishes {root, height} together; keep them in the
// first 16 bytes of the inode.
const _: () = assert!(core::mem::offset_of!(PmfsInode, height) == 2);
const _: () = assert!(core::mem::offset_of!(PmfsInode, root) == 8);
const _: () = assert!(core::mem::offset_of!(PmfsInode, i_truncated) == 112);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_predicate() {
        let mut pi: PmfsInode = unsafe { core::mem::zeroed() };
        assert!(pi.is_free());

        pi.i_mode = S_IFREG | 0o644;
        pi.i_links_count = 1;
        assert!(pi.is_active());

        // unlinked but not yet deleted: still active (open file)
        pi.i_links_count = 0;
        pi.i_dtime = 0;
        assert!(pi.is_active());

        // deleted
        pi.i_dtime = 1234;
        assert!(pi.is_free());
    }

    #[test]
    fn flag_inheritance() {
        let parent = FS_SYNC_FL | FS_DIRSYNC_FL | FS_SECRM_FL | PMFS_EOFBLOCKS_FL;
        // dirs inherit everything inheritable; EOFBLOCKS is never inherited
        assert_eq!(
            mask_inode_flags(S_IFDIR, parent),
            FS_SYNC_FL | FS_DIRSYNC_FL | FS_SECRM_FL
        );
        // regular files drop dir-only flags
        assert_eq!(
            mask_inode_flags(S_IFREG, parent),
            FS_SYNC_FL | FS_SECRM_FL
        );
        // special files keep only NODUMP/NOATIME
        assert_eq!(mask_inode_flags(S_IFCHR, parent | FS_NOATIME_FL), FS_NOATIME_FL);
    }
}
