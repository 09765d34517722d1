//! PMFS - Persistent-memory filesystem data engine
//!
//! The engine manages the on-PM data structures of PMFS through a direct
//! byte-addressable mapping:
//!
//! - **Radix block tree**: per-inode fixed-fanout tree mapping file block
//!   indices to PM block references (alloc / assign / find / truncate,
//!   height grow and shrink).
//! - **Inode log**: append-only chain of 4K pages of 32-byte operation
//!   entries, garbage collected by page invalidation.
//! - **Inode table**: linear slab of 128-byte inode slots with a free-hint
//!   search, grown through the table inode's own block tree.
//! - **Truncate list**: PM-resident list of inodes with deferred
//!   reclamation work, replayed at mount to survive crashes.
//! - **Directory index**: per-directory DRAM ordered map over the
//!   directory's log entries, rebuilt from the log.
//!
//! ## Crash consistency
//!
//! Every PM store is followed by a cacheline flush; every persistent
//! pointer publication is preceded by a store fence. Multi-step updates
//! either go through the journal facade, are ordered so a torn prefix is
//! recoverable (log append then tail publication), or are registered on
//! the truncate list first.
//!
//! ## Locking
//!
//! `inode_table_mutex` serializes slot allocation, table growth and the
//! DRAM header map. `s_truncate_lock` guards the truncate list. The
//! allocator carries its own lock. The per-inode lock serializes writers
//! and truncate against readers; log-page GC runs under it, so readers
//! holding entry pointers hold it too.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod balloc;
pub mod dir;
pub mod error;
pub mod fs;
pub mod inode;
pub mod journal;
pub mod log;
pub mod pm;
pub mod table;
pub mod tree;
pub mod truncate;

pub use balloc::{BlockAllocator, BlockNr, FreeHint, RangeAllocator};
pub use dir::DirIndex;
pub use error::{PmfsError, Result};
pub use fs::{MountOpts, PmfsState};
pub use inode::{AttrMask, InodeHeader, SetattrFields, ATTR_SIZE};
pub use journal::{Journal, LiteJournal, Transaction};
pub use pm::PmArena;

pub use pmfs_common::{BlockType, PmfsInode, PmfsSuperBlock};
