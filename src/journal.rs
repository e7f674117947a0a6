// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, KvsetId, MblockId, NodeId, Result, SeqNo};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

/// Ingest id used by compaction transactions (no client ingest attached)
pub const INVALID_INGEST_ID: u64 = u64::MAX;

/// Opaque handle for a pending kvset-add record
pub type Cookie = u64;

/// Durable metadata of one kvset, as recorded in the journal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvsetMeta {
    /// Kvset id
    pub kvset_id: KvsetId,

    /// Owning node
    pub node_id: NodeId,

    /// Data generation
    pub dgen: u64,

    /// Compaction counter
    pub compc: u32,

    /// Header block
    pub hblk: MblockId,

    /// Key blocks
    pub kblks: Vec<MblockId>,

    /// Value blocks
    pub vblks: Vec<MblockId>,
}

/// The metadata journal, consumed through a narrow interface
///
/// Every multi-step tree mutation (compaction commit, capped trim) is
/// bracketed by one journal transaction so that replay can reconstruct
/// the tree: kvset-add records describe outputs, kvset-delete records
/// retire inputs, and acks seal the adds. A transaction that cannot
/// complete is nak'd and leaves no trace after replay.
pub trait Journal: Send + Sync {
    /// Opens a transaction declaring the number of adds and deletes to come.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot accept a transaction.
    fn txstart(
        &self,
        ingest_id: u64,
        horizon: SeqNo,
        n_adds: usize,
        n_dels: usize,
    ) -> Result<Box<dyn JournalTx>>;

    /// Mints a fresh node id.
    fn mint_node_id(&self) -> NodeId;

    /// Mints a fresh kvset id.
    fn mint_kvset_id(&self) -> KvsetId;
}

/// One open journal transaction
pub trait JournalTx: Send {
    /// Records one kvset addition; returns a cookie to ack it with.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn record_kvset_add(&mut self, cnid: u64, meta: &KvsetMeta) -> Result<Cookie>;

    /// Acks a previously recorded addition.
    ///
    /// # Errors
    ///
    /// Returns an error if the ack cannot be written.
    fn ack_add(&mut self, cookie: Cookie) -> Result<()>;

    /// Records one kvset deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn record_kvset_delete(&mut self, cnid: u64, kvset_id: KvsetId) -> Result<()>;

    /// Abandons the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot record the abort.
    fn nak(&mut self) -> Result<()>;
}

/// One record as seen by the in-memory journal
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalRecord {
    /// Transaction open
    TxStart {
        /// Ingest id, [`INVALID_INGEST_ID`] for compactions
        ingest_id: u64,
        /// Sequence horizon
        horizon: SeqNo,
        /// Declared number of adds
        n_adds: usize,
        /// Declared number of deletes
        n_dels: usize,
    },

    /// Kvset addition
    KvsetAdd {
        /// Keyspace id
        cnid: u64,
        /// Kvset metadata
        meta: KvsetMeta,
    },

    /// Ack of an addition
    AddAck(Cookie),

    /// Kvset deletion
    KvsetDelete {
        /// Keyspace id
        cnid: u64,
        /// Kvset id
        kvset_id: KvsetId,
    },

    /// Transaction abort
    Nak,
}

struct MemJournalState {
    records: Mutex<Vec<JournalRecord>>,
    next_node_id: AtomicU64,
    next_kvset_id: AtomicU64,
    next_cookie: AtomicU64,
    fail_txstart: AtomicBool,
    fail_add: AtomicBool,
    fail_delete: AtomicBool,
}

/// In-memory journal used by tests and tooling
///
/// Records everything for later assertions and can inject failures into
/// the transaction-open, add and delete paths.
#[derive(Clone)]
pub struct MemJournal(Arc<MemJournalState>);

impl Default for MemJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemJournal {
    /// Creates a fresh in-memory journal.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(MemJournalState {
            records: Mutex::new(Vec::new()),
            next_node_id: AtomicU64::new(1),
            next_kvset_id: AtomicU64::new(1),
            next_cookie: AtomicU64::new(1),
            fail_txstart: AtomicBool::new(false),
            fail_add: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        }))
    }

    /// Returns a copy of everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<JournalRecord> {
        self.0.records.lock().expect("lock is poisoned").clone()
    }

    /// Makes the next transaction opens fail.
    pub fn set_fail_txstart(&self, fail: bool) {
        self.0.fail_txstart.store(fail, Ordering::Release);
    }

    /// Makes kvset-add records fail.
    pub fn set_fail_add(&self, fail: bool) {
        self.0.fail_add.store(fail, Ordering::Release);
    }

    /// Makes kvset-delete records fail.
    pub fn set_fail_delete(&self, fail: bool) {
        self.0.fail_delete.store(fail, Ordering::Release);
    }

    /// Returns how many naks were recorded.
    #[must_use]
    pub fn nak_count(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(r, JournalRecord::Nak))
            .count()
    }

    fn push(&self, record: JournalRecord) {
        self.0.records.lock().expect("lock is poisoned").push(record);
    }
}

impl Journal for MemJournal {
    fn txstart(
        &self,
        ingest_id: u64,
        horizon: SeqNo,
        n_adds: usize,
        n_dels: usize,
    ) -> Result<Box<dyn JournalTx>> {
        if self.0.fail_txstart.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::other("journal txstart failure")));
        }

        self.push(JournalRecord::TxStart {
            ingest_id,
            horizon,
            n_adds,
            n_dels,
        });

        Ok(Box::new(MemTx {
            journal: self.clone(),
        }))
    }

    fn mint_node_id(&self) -> NodeId {
        self.0.next_node_id.fetch_add(1, Ordering::Relaxed)
    }

    fn mint_kvset_id(&self) -> KvsetId {
        self.0.next_kvset_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct MemTx {
    journal: MemJournal,
}

impl JournalTx for MemTx {
    fn record_kvset_add(&mut self, cnid: u64, meta: &KvsetMeta) -> Result<Cookie> {
        if self.journal.0.fail_add.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::other("journal add failure")));
        }

        self.journal.push(JournalRecord::KvsetAdd {
            cnid,
            meta: meta.clone(),
        });

        Ok(self.journal.0.next_cookie.fetch_add(1, Ordering::Relaxed))
    }

    fn ack_add(&mut self, cookie: Cookie) -> Result<()> {
        self.journal.push(JournalRecord::AddAck(cookie));
        Ok(())
    }

    fn record_kvset_delete(&mut self, cnid: u64, kvset_id: KvsetId) -> Result<()> {
        if self.journal.0.fail_delete.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::other("journal delete failure")));
        }

        self.journal.push(JournalRecord::KvsetDelete { cnid, kvset_id });
        Ok(())
    }

    fn nak(&mut self) -> Result<()> {
        self.journal.push(JournalRecord::Nak);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn mem_journal_records_transaction() {
        let journal = MemJournal::new();

        let mut tx = journal.txstart(INVALID_INGEST_ID, 0, 1, 2).unwrap();

        let meta = KvsetMeta {
            kvset_id: 7,
            node_id: 0,
            dgen: 3,
            compc: 1,
            hblk: 10,
            kblks: vec![11],
            vblks: vec![12, 13],
        };

        let cookie = tx.record_kvset_add(1, &meta).unwrap();
        tx.record_kvset_delete(1, 5).unwrap();
        tx.record_kvset_delete(1, 6).unwrap();
        tx.ack_add(cookie).unwrap();

        let records = journal.records();
        assert_eq!(5, records.len());
        assert!(matches!(records.first(), Some(JournalRecord::TxStart { n_adds: 1, n_dels: 2, .. })));
        assert!(matches!(records.last(), Some(JournalRecord::AddAck(c)) if *c == cookie));
    }

    #[test]
    fn mem_journal_failure_injection() {
        let journal = MemJournal::new();

        journal.set_fail_txstart(true);
        assert!(journal.txstart(0, 0, 0, 0).is_err());
        journal.set_fail_txstart(false);

        let mut tx = journal.txstart(0, 0, 1, 0).unwrap();
        journal.set_fail_add(true);

        let meta = KvsetMeta {
            kvset_id: 1,
            node_id: 0,
            dgen: 1,
            compc: 0,
            hblk: 1,
            kblks: vec![],
            vblks: vec![],
        };

        assert!(tx.record_kvset_add(1, &meta).is_err());
        tx.nak().unwrap();
        assert_eq!(1, journal.nak_count());
    }

    #[test]
    fn mem_journal_mints_monotonic_ids() {
        let journal = MemJournal::new();
        assert!(journal.mint_node_id() < journal.mint_node_id());
        assert!(journal.mint_kvset_id() < journal.mint_kvset_id());
    }
}
