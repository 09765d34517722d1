//! Journal Facade
//!
//! Small multi-record atomic journal for inode metadata, consumed through
//! a trait. The engine opens a transaction, registers the PM ranges it is
//! about to overwrite, mutates them in place, and commits; the journal
//! implementation guarantees all-or-nothing visibility across a crash.
//!
//! `LiteJournal` is the reference implementation used by tests and the
//! mount path: it tracks transaction state and issues the commit barrier
//! but keeps no undo copies (a volatile arena has no partial-write crash
//! mode to undo).

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::vec::Vec;

use crate::error::Result;
use crate::pm::persistent_barrier;

// ============================================================================
// TRANSACTION
// ============================================================================

/// Journal record kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogRecordKind {
    /// Plain data range
    Data,
    /// Transaction start marker
    Start,
    /// Commit marker
    Commit,
}

/// One registered undo range.
#[derive(Clone, Copy, Debug)]
pub struct LogRecord {
    pub pm_off: u64,
    pub size: u32,
    pub kind: LogRecordKind,
}

/// An open journal transaction.
pub struct Transaction {
    pub id: u32,
    pub max_records: usize,
    records: Vec<LogRecord>,
}

impl Transaction {
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }
}

/// Upper bound of journal records one inode update needs: the inode slot
/// itself plus its tree root spill.
pub const MAX_INODE_LENTRIES: usize = 2;

// ============================================================================
// JOURNAL TRAIT
// ============================================================================

/// Journaling contract consumed by the engine.
pub trait Journal: Send + Sync {
    /// Open a transaction sized for `n_records` ranges.
    fn new_transaction(&self, n_records: usize) -> Result<Transaction>;

    /// Register a PM range the caller is about to overwrite.
    fn add_logentry(&self, tx: &mut Transaction, pm_off: u64, size: u32, kind: LogRecordKind);

    /// Persist and seal the transaction.
    fn commit(&self, tx: Transaction) -> Result<()>;
}

// ============================================================================
// LITE JOURNAL
// ============================================================================

/// Transaction bookkeeping without an undo area.
pub struct LiteJournal {
    next_id: AtomicU32,
    committed: AtomicU32,
}

impl LiteJournal {
    pub fn new() -> Self {
        LiteJournal {
            next_id: AtomicU32::new(1),
            committed: AtomicU32::new(0),
        }
    }

    pub fn committed_transactions(&self) -> u32 {
        self.committed.load(Ordering::Relaxed)
    }
}

impl Default for LiteJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal for LiteJournal {
    fn new_transaction(&self, n_records: usize) -> Result<Transaction> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("new transaction {} ({} records)", id, n_records);
        Ok(Transaction {
            id,
            max_records: n_records,
            records: Vec::with_capacity(n_records),
        })
    }

    fn add_logentry(&self, tx: &mut Transaction, pm_off: u64, size: u32, kind: LogRecordKind) {
        debug_assert!(tx.records.len() < tx.max_records, "transaction record overflow");
        tx.records.push(LogRecord { pm_off, size, kind });
    }

    fn commit(&self, tx: Transaction) -> Result<()> {
        persistent_barrier();
        self.committed.fetch_add(1, Ordering::Relaxed);
        log::debug!("commit transaction {}", tx.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_lifecycle() {
        let j = LiteJournal::new();
        let mut tx = j.new_transaction(MAX_INODE_LENTRIES).unwrap();
        j.add_logentry(&mut tx, 1024, 128, LogRecordKind::Data);
        assert_eq!(tx.records().len(), 1);
        j.commit(tx).unwrap();
        assert_eq!(j.committed_transactions(), 1);

        let tx2 = j.new_transaction(1).unwrap();
        assert_ne!(tx2.id, 0);
    }
}
