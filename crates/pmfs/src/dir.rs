//! Directory Index
//!
//! Per-directory DRAM ordered map over the directory inode's log entries.
//! The key is the 31-bit BKDR hash of the name; the map value remembers
//! the owning inode and the PM offset of the directory log entry that
//! created the link.
//!
//! The comparator is hash-only: on a hash match the name is double-checked
//! and a mismatch logged, but the entries are still treated as equivalent,
//! so a second insert with a colliding name fails. The log remains the
//! source of truth; the index is rebuilt from it at mount.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use pmfs_common::log::{
    block_off, DirLogEntry, LinkChangeEntry, LogEntryType, SetattrEntry, LOG_ENTRY_SIZE,
};
use pmfs_common::{bkdr_hash, PmfsInode, PMFS_INODE_SIZE};

use crate::error::{PmfsError, Result};
use crate::fs::PmfsState;
use crate::inode::HeaderInner;
use crate::log::entry_crosses_tail;
use crate::pm::flush;

/// Bogus readdir position meaning "end of directory".
pub const READDIR_END: u64 = 0x1;

/// One DRAM index node.
#[derive(Clone, Copy, Debug)]
pub struct DirNode {
    pub ino: u64,
    /// PM offset of the directory log entry.
    pub nvmm: u64,
}

/// Hash-keyed ordered map over a directory's live links.
#[derive(Default)]
pub struct DirIndex {
    tree: BTreeMap<u32, DirNode>,
}

impl DirIndex {
    pub fn new() -> Self {
        DirIndex::default()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Link `name` to `ino`, remembering the log entry at `dir_entry`.
    /// A present key means the name (or a hash alias of it) already exists.
    pub fn insert(&mut self, name: &[u8], ino: u64, dir_entry: u64) -> Result<()> {
        let hash = bkdr_hash(name);
        if self.tree.contains_key(&hash) {
            log::debug!("dir entry already exists (hash 0x{:x})", hash);
            return Err(PmfsError::InvalidArgument);
        }
        self.tree.insert(hash, DirNode { ino, nvmm: dir_entry });
        Ok(())
    }

    /// Hash-only lookup.
    pub fn find(&self, name: &[u8]) -> Option<&DirNode> {
        self.tree.get(&bkdr_hash(name))
    }

    pub fn remove(&mut self, name: &[u8]) -> Option<DirNode> {
        self.tree.remove(&bkdr_hash(name))
    }

    /// Drop every node. The log is untouched.
    pub fn clear(&mut self) {
        self.tree.clear();
    }

    fn iter_from(&self, start: Option<u32>) -> impl Iterator<Item = (&u32, &DirNode)> {
        let range = match start {
            Some(h) => self.tree.range(h..),
            None => self.tree.range(..),
        };
        range
    }
}

/// One readdir record.
pub struct DirListEntry {
    pub name: Vec<u8>,
    pub ino: u64,
    /// Resume cursor: PM offset of the backing log entry.
    pub pos: u64,
}

impl PmfsState {
    /// Look `name` up in a directory, double-checking the stored entry the
    /// way the index was built: hash first, name mismatches logged but
    /// tolerated.
    pub fn find_dir_node(&self, inner: &HeaderInner, name: &[u8]) -> Option<DirNode> {
        let node = inner.dir.find(name)?;
        let entry = self.arena().at::<DirLogEntry>(node.nvmm);
        if entry.name_len as usize != name.len() {
            log::debug!(
                "name len does not match: {} {}",
                name.len(),
                entry.name_len
            );
        } else if entry.name() != name {
            log::debug!("name does not match (hash collision)");
        }
        Some(*node)
    }

    /// Rebuild a directory's DRAM index and inode metadata from its log.
    /// Panics on a broken chain; recovery treats that as fatal.
    pub fn rebuild_dir_tree(&self, pi: &mut PmfsInode, inner: &mut HeaderInner) -> Result<()> {
        let ino = pi.pmfs_ino;
        log::debug!("rebuild dir {} tree", ino);

        inner.dir.clear();

        let mut curr_p = pi.log_head;
        if curr_p == 0 {
            panic!("dir {} log is empty", ino);
        }
        log::debug!("log head 0x{:x}, tail 0x{:x}", curr_p, pi.log_tail);

        inner.log_pages = 1;
        while curr_p != pi.log_tail {
            if self.is_last_dir_entry(curr_p) {
                inner.log_pages += 1;
                curr_p = self.next_log_page(curr_p);
            }
            if curr_p == 0 {
                panic!("dir {} log chain is broken", ino);
            }

            let entry_type = self.arena().bytes(curr_p, 1)[0];
            match LogEntryType::from_u8(entry_type) {
                Some(LogEntryType::SetAttr) => {
                    let attr_entry = *self.arena().at::<SetattrEntry>(curr_p);
                    self.apply_setattr_entry(pi, &attr_entry);
                    curr_p += LOG_ENTRY_SIZE as u64;
                    continue;
                }
                Some(LogEntryType::LinkChange) => {
                    let link_entry = *self.arena().at::<LinkChangeEntry>(curr_p);
                    self.apply_link_change_entry(pi, &link_entry);
                    curr_p += LOG_ENTRY_SIZE as u64;
                    continue;
                }
                Some(LogEntryType::DirLog) => {}
                _ => {
                    log::error!("unknown entry type {} @ 0x{:x}", entry_type, curr_p);
                    panic!("corrupt dir log");
                }
            }

            let entry = self.arena().at::<DirLogEntry>(curr_p);
            let entry_ino = entry.ino;
            let de_len = entry.de_len as u64;
            let new_inode = entry.new_inode != 0;

            let ret = if entry_ino > 0 {
                // a live link to add
                if entry.name_len == 0 {
                    Err(PmfsError::InvalidArgument)
                } else {
                    inner.dir.insert(entry.name(), entry_ino, curr_p)
                }
            } else {
                inner.dir.remove(entry.name());
                Ok(())
            };
            if let Err(e) = ret {
                log::error!("rebuild dir {}: replay failed: {}", ino, e);
                break;
            }

            // the newest entry carries the directory's current metadata
            {
                let _gate = self.arena().unlock_struct(pi);
                pi.i_ctime = entry.mtime;
                pi.i_mtime = entry.mtime;
                pi.i_size = entry.size;
                pi.i_links_count = entry.links_count;
            }

            curr_p += de_len;

            // skip the inlined inode slot, cacheline aligned after the entry
            if new_inode {
                if entry_crosses_tail(curr_p - de_len, de_len, true) {
                    inner.log_pages += 1;
                    curr_p = self.next_log_page(curr_p);
                } else if curr_p & (pmfs_common::CACHELINE_SIZE as u64 - 1) != 0 {
                    curr_p = pmfs_common::log::cache_align(curr_p)
                        + pmfs_common::CACHELINE_SIZE as u64;
                }
                curr_p += PMFS_INODE_SIZE as u64;
            }
        }

        inner.i_size = pi.i_size;
        inner.i_mode = pi.i_mode;
        flush(pi, true);

        // keep traversing until the chain ends to count allocated pages
        let mut page = block_off(curr_p);
        loop {
            let next = self.next_log_page(page);
            if next == 0 {
                break;
            }
            inner.log_pages += 1;
            page = next;
        }

        Ok(())
    }

    /// List a directory from cursor `ctx_pos` (0 = start, a previously
    /// returned `pos` resumes past it, [`READDIR_END`] = done). Returns
    /// the records and the new cursor.
    pub fn readdir(&self, inner: &HeaderInner, ctx_pos: u64) -> (Vec<DirListEntry>, u64) {
        let mut out = Vec::new();

        let start = if ctx_pos == 0 {
            None
        } else if ctx_pos == READDIR_END {
            return (out, READDIR_END);
        } else {
            // resume: ctx_pos is the PM offset of the last emitted entry
            let entry = self.arena().at::<DirLogEntry>(ctx_pos);
            Some(bkdr_hash(entry.name()))
        };

        for (_, node) in inner.dir.iter_from(start) {
            if ctx_pos != 0 && ctx_pos != READDIR_END && node.nvmm == ctx_pos {
                continue;
            }
            if node.ino == 0 {
                continue;
            }
            let entry = self.arena().at::<DirLogEntry>(node.nvmm);
            let entry_ino = entry.ino;
            if entry_ino != node.ino {
                log::debug!("ino does not match: {} {}", entry_ino, node.ino);
            }
            out.push(DirListEntry {
                name: entry.name().to_vec(),
                ino: node.ino,
                pos: node.nvmm,
            });
        }
        (out, READDIR_END)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let mut idx = DirIndex::new();
        idx.insert(b"alpha", 10, 0x1000).unwrap();
        idx.insert(b"beta", 11, 0x1020).unwrap();

        assert_eq!(idx.find(b"alpha").unwrap().ino, 10);
        assert_eq!(idx.find(b"beta").unwrap().nvmm, 0x1020);
        assert!(idx.find(b"gamma").is_none());

        let node = idx.remove(b"alpha").unwrap();
        assert_eq!(node.ino, 10);
        assert!(idx.find(b"alpha").is_none());
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut idx = DirIndex::new();
        idx.insert(b"name", 5, 0x1000).unwrap();
        assert_eq!(
            idx.insert(b"name", 6, 0x2000).unwrap_err(),
            PmfsError::InvalidArgument
        );
        // first entry wins
        assert_eq!(idx.find(b"name").unwrap().ino, 5);
    }

    #[test]
    fn ordered_by_hash() {
        let mut idx = DirIndex::new();
        idx.insert(b"c", 3, 0x3000).unwrap();
        idx.insert(b"a", 1, 0x1000).unwrap();
        idx.insert(b"b", 2, 0x2000).unwrap();

        let hashes: Vec<u32> = idx.iter_from(None).map(|(h, _)| *h).collect();
        let mut sorted = hashes.clone();
        sorted.sort_unstable();
        assert_eq!(hashes, sorted);
        assert_eq!(idx.len(), 3);
    }
}
