//! Truncate List
//!
//! PM-resident singly-linked list of inode numbers, rooted at a head
//! record in the super block tail. An inode on the list has deferred
//! reclamation work that must survive a crash:
//!
//! 1. An unlinked inode still held open cannot be freed until the last
//!    reference drops. It joins the list at unlink time and leaves at
//!    evict; a crash in between is repaired at mount by freeing it.
//! 2. A shrinking truncate returns freed blocks to the allocator before
//!    the whole operation is persistent. The list entry carries the
//!    target size so a crash mid-truncate can finish the job.
//!
//! List updates follow strict ordering: the new item is written and made
//! persistent before the head pointer is atomically redirected to it.

use pmfs_common::{PmfsInode, TruncateItem, PMFS_TRUNCATE_HEAD_OFFSET};

use crate::error::Result;
use crate::fs::PmfsState;
use crate::inode::{HeaderInner, InodeHeader};
use crate::pm::{flush, persistent_barrier};

/// Byte offset of the embedded `TruncateItem` inside an inode slot.
const TRUNCATE_ITEM_OFFSET: u64 = core::mem::offset_of!(PmfsInode, i_truncated) as u64;

impl PmfsState {
    fn truncate_head(&self) -> &TruncateItem {
        self.arena().at::<TruncateItem>(PMFS_TRUNCATE_HEAD_OFFSET)
    }

    fn truncate_head_mut(&self) -> &mut TruncateItem {
        self.arena().at_mut::<TruncateItem>(PMFS_TRUNCATE_HEAD_OFFSET)
    }

    fn truncate_item_off(&self, ino: u64) -> Result<u64> {
        Ok(self.get_inode_off(ino)? + TRUNCATE_ITEM_OFFSET)
    }

    /// Register deferred reclamation work for an inode before blocks are
    /// freed. The item is persistent before the head points at it, so a
    /// crash sees either the old list or the complete new one.
    pub fn truncate_add(&self, sih: &InodeHeader, inner: &mut HeaderInner, truncate_size: u64) -> Result<()> {
        let _lock = self.s_truncate_lock.lock();
        if inner.on_truncate_list {
            return Ok(());
        }

        let li_off = self.truncate_item_off(sih.ino)?;
        let head = self.truncate_head();
        {
            let _gate = self.arena().unlock_range(li_off, core::mem::size_of::<TruncateItem>());
            let li = self.arena().at_mut::<TruncateItem>(li_off);
            li.next = head.next;
            li.truncate_size = truncate_size;
            flush(li, false);
        }
        // the item must be persistent before the head pointer moves
        persistent_barrier();

        {
            let _gate = self
                .arena()
                .unlock_range(PMFS_TRUNCATE_HEAD_OFFSET, core::mem::size_of::<TruncateItem>());
            let head = self.truncate_head_mut();
            head.next = sih.ino;
            flush(head, false);
        }
        persistent_barrier();

        inner.on_truncate_list = true;
        Ok(())
    }

    /// Unlink an inode from the list once its reclamation work is fully
    /// persistent.
    pub fn truncate_del(&self, sih: &InodeHeader, inner: &mut HeaderInner) -> Result<()> {
        let _lock = self.s_truncate_lock.lock();
        if !inner.on_truncate_list {
            return Ok(());
        }

        let li = self.arena().at::<TruncateItem>(self.truncate_item_off(sih.ino)?);
        let ino_next = li.next;

        // make sure all truncate work is persistent before unlinking
        persistent_barrier();

        // find the predecessor and skip over this item
        let head = self.truncate_head();
        if head.next == sih.ino {
            let _gate = self
                .arena()
                .unlock_range(PMFS_TRUNCATE_HEAD_OFFSET, core::mem::size_of::<TruncateItem>());
            let head = self.truncate_head_mut();
            head.next = ino_next;
            flush(head, false);
        } else {
            let mut prev_ino = head.next;
            loop {
                if prev_ino == 0 {
                    log::error!("inode {} not on the truncate list", sih.ino);
                    inner.on_truncate_list = false;
                    return Ok(());
                }
                let prev_off = self.truncate_item_off(prev_ino)?;
                let prev = self.arena().at::<TruncateItem>(prev_off);
                if prev.next == sih.ino {
                    let _gate = self
                        .arena()
                        .unlock_range(prev_off, core::mem::size_of::<TruncateItem>());
                    let prev = self.arena().at_mut::<TruncateItem>(prev_off);
                    prev.next = ino_next;
                    flush(prev, false);
                    break;
                }
                prev_ino = prev.next;
            }
        }
        persistent_barrier();

        inner.on_truncate_list = false;
        Ok(())
    }

    /// Number of inodes currently linked, head first.
    pub fn truncate_list_len(&self) -> usize {
        let _lock = self.s_truncate_lock.lock();
        let mut n = 0;
        let mut ino = self.truncate_head().next;
        while ino != 0 {
            n += 1;
            ino = match self.truncate_item_off(ino) {
                Ok(off) => self.arena().at::<TruncateItem>(off).next,
                Err(_) => break,
            };
        }
        n
    }

    /// Mount-time replay: complete the deferred work of every listed
    /// inode, then reset the list.
    pub fn recover_truncate_list(&self) -> Result<()> {
        loop {
            let ino = {
                let _lock = self.s_truncate_lock.lock();
                self.truncate_head().next
            };
            if ino == 0 {
                break;
            }

            let li_off = self.truncate_item_off(ino)?;
            let truncate_size = self.arena().at::<TruncateItem>(li_off).truncate_size;
            let pi = self.inode_at(self.get_inode_off(ino)?);
            log::debug!(
                "recover truncate list: inode {}, links {}, size {}",
                ino,
                pi.i_links_count,
                truncate_size
            );

            let sih = match self.iget(ino) {
                Ok(sih) => sih,
                Err(_) => {
                    // the slot already died; blocks it still referenced are
                    // unreachable and stay out of the rebuilt free lists
                    let _lock = self.s_truncate_lock.lock();
                    let next = self.arena().at::<TruncateItem>(li_off).next;
                    let _gate = self.arena().unlock_range(
                        PMFS_TRUNCATE_HEAD_OFFSET,
                        core::mem::size_of::<TruncateItem>(),
                    );
                    let head = self.truncate_head_mut();
                    head.next = next;
                    flush(head, true);
                    continue;
                }
            };
            {
                let mut inner = sih.inner.lock();
                inner.on_truncate_list = true;
            }

            if pi.i_links_count == 0 {
                // unlinked before the crash: free everything
                self.evict_inode(&sih)?;
            } else {
                // finish the interrupted shrink
                {
                    let mut inner = sih.inner.lock();
                    self.setsize(&sih, &mut inner, truncate_size)?;
                }
                let mut inner = sih.inner.lock();
                self.truncate_del(&sih, &mut inner)?;
            }
        }

        // the list is drained; make the empty head persistent
        let _gate = self
            .arena()
            .unlock_range(PMFS_TRUNCATE_HEAD_OFFSET, core::mem::size_of::<TruncateItem>());
        let head = self.truncate_head_mut();
        head.next = 0;
        flush(head, true);
        Ok(())
    }
}
