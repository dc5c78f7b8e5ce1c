//! Transactional store over a fjall keyspace
//!
//! Transactions are optimistic: reads go to committed state overlaid with
//! the transaction's own writes, every read is recorded, and commit
//! validates the read set against writes committed since the transaction
//! began. Validation and batch apply happen under a single commit lock,
//! so a committed transaction is serializable at its commit point.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use fjall::PartitionCreateOptions;
use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// How many times `transact` re-runs a conflicted transaction before
/// surfacing the conflict to the caller.
const MAX_COMMIT_ATTEMPTS: usize = 32;

struct CommitState {
    /// Commit sequence, incremented once per committed writing transaction.
    seq: u64,
    /// Last commit sequence that wrote each key. Process-local; cross-node
    /// coordination rides on the keys themselves (see the schema manager's
    /// generation discipline).
    key_versions: BTreeMap<Vec<u8>, u64>,
}

/// An ordered, transactional key-value database.
pub struct Database {
    keyspace: fjall::Keyspace,
    data: fjall::PartitionHandle,
    persist_mode: fjall::PersistMode,
    committed: Mutex<CommitState>,
}

impl Database {
    pub fn open(config: StoreConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let keyspace = fjall::Config::new(&config.data_dir)
            .cache_size(config.cache_size)
            .open()?;
        let data = keyspace.open_partition("data", PartitionCreateOptions::default())?;
        Ok(Arc::new(Self {
            keyspace,
            data,
            persist_mode: config.persist_mode,
            committed: Mutex::new(CommitState {
                seq: 0,
                key_versions: BTreeMap::new(),
            }),
        }))
    }

    /// Begin a transaction against the current committed state.
    pub fn begin(&self) -> Transaction<'_> {
        let start_seq = self.committed.lock().seq;
        Transaction {
            db: self,
            start_seq,
            reads: BTreeSet::new(),
            range_reads: Vec::new(),
            writes: BTreeMap::new(),
            cleared_ranges: Vec::new(),
            after_commit: Vec::new(),
        }
    }

    /// Run `f` in a transaction, retrying from scratch on commit conflicts.
    pub fn transact<T>(&self, mut f: impl FnMut(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            let mut txn = self.begin();
            let outcome = f(&mut txn).and_then(|value| txn.commit().map(|_| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt + 1 < MAX_COMMIT_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(attempt, "transaction conflict, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn committed_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key)?.map(|slice| slice.to_vec()))
    }

    fn committed_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.data.range(start.to_vec()..end.to_vec()) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }
}

enum Write {
    Set(Vec<u8>),
    Clear,
}

/// A single optimistic transaction. Dropped without `commit`, it has no
/// effect.
pub struct Transaction<'db> {
    db: &'db Database,
    start_seq: u64,
    reads: BTreeSet<Vec<u8>>,
    range_reads: Vec<(Vec<u8>, Vec<u8>)>,
    writes: BTreeMap<Vec<u8>, Write>,
    cleared_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    after_commit: Vec<Box<dyn FnOnce() + Send>>,
}

impl<'db> Transaction<'db> {
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reads.insert(key.to_vec());
        match self.writes.get(key) {
            Some(Write::Set(value)) => return Ok(Some(value.clone())),
            Some(Write::Clear) => return Ok(None),
            None => {}
        }
        if self.in_cleared_range(key) {
            return Ok(None);
        }
        self.db.committed_get(key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.writes.insert(key.to_vec(), Write::Set(value.to_vec()));
    }

    pub fn clear(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), Write::Clear);
    }

    /// Clear every key in `[start, end)`. Writes buffered earlier in the
    /// transaction are discarded if they fall inside the range.
    pub fn clear_range(&mut self, start: &[u8], end: &[u8]) {
        self.writes
            .retain(|key, _| key.as_slice() < start || key.as_slice() >= end);
        self.cleared_ranges.push((start.to_vec(), end.to_vec()));
    }

    /// All key-value pairs in `[start, end)`, committed state overlaid
    /// with this transaction's own writes, in key order.
    pub fn get_range(&mut self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.range_reads.push((start.to_vec(), end.to_vec()));
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, value) in self.db.committed_range(start, end)? {
            if !self.in_cleared_range(&key) {
                merged.insert(key, value);
            }
        }
        let bounds = (Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()));
        for (key, write) in self.writes.range(bounds) {
            match write {
                Write::Set(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                Write::Clear => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Register a callback to run after this transaction durably commits.
    /// Callbacks run in registration order; none run on abort or conflict.
    pub fn after_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.after_commit.push(Box::new(callback));
    }

    /// Validate reads and atomically apply writes.
    pub fn commit(self) -> Result<()> {
        let callbacks = {
            let mut state = self.db.committed.lock();

            for key in &self.reads {
                if state.key_versions.get(key).copied().unwrap_or(0) > self.start_seq {
                    return Err(Error::CommitConflict);
                }
            }
            for (start, end) in &self.range_reads {
                let bounds = (
                    Bound::Included(start.clone()),
                    Bound::Excluded(end.clone()),
                );
                if state
                    .key_versions
                    .range::<Vec<u8>, _>(bounds)
                    .any(|(_, &version)| version > self.start_seq)
                {
                    return Err(Error::CommitConflict);
                }
            }

            if self.writes.is_empty() && self.cleared_ranges.is_empty() {
                // Read-only: validated, nothing to apply.
                self.after_commit
            } else {
                let commit_seq = state.seq + 1;
                let mut batch = self.db.keyspace.batch();
                let mut written: Vec<Vec<u8>> = Vec::new();

                // Range clears resolve to the keys present right now, under
                // the commit lock, so keys committed meanwhile are covered.
                for (start, end) in &self.cleared_ranges {
                    for (key, _) in self.db.committed_range(start, end)? {
                        batch.remove(&self.db.data, key.clone());
                        written.push(key);
                    }
                }
                for (key, write) in &self.writes {
                    match write {
                        Write::Set(value) => {
                            batch.insert(&self.db.data, key.clone(), value.clone())
                        }
                        Write::Clear => batch.remove(&self.db.data, key.clone()),
                    }
                    written.push(key.clone());
                }

                batch.commit()?;
                if !matches!(self.db.persist_mode, fjall::PersistMode::Buffer) {
                    self.db.keyspace.persist(self.db.persist_mode)?;
                }
                state.seq = commit_seq;
                for key in written {
                    state.key_versions.insert(key, commit_seq);
                }
                self.after_commit
            }
        };

        for callback in callbacks {
            callback();
        }
        Ok(())
    }
}

impl Transaction<'_> {
    fn in_cleared_range(&self, key: &[u8]) -> bool {
        self.cleared_ranges
            .iter()
            .any(|(start, end)| key >= start.as_slice() && key < end.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> Arc<Database> {
        Database::open(StoreConfig::temporary()).unwrap()
    }

    #[test]
    fn test_read_your_writes() {
        let db = open_db();
        let mut txn = db.begin();
        assert_eq!(txn.get(b"k").unwrap(), None);
        txn.set(b"k", b"v1");
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v1".to_vec()));
        txn.clear(b"k");
        assert_eq!(txn.get(b"k").unwrap(), None);
        txn.set(b"k", b"v2");
        txn.commit().unwrap();

        let mut txn = db.begin();
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_commit_conflict_on_stale_read() {
        let db = open_db();
        db.transact(|txn| {
            txn.set(b"counter", b"0");
            Ok(())
        })
        .unwrap();

        let mut t1 = db.begin();
        let mut t2 = db.begin();
        t1.get(b"counter").unwrap();
        t1.set(b"counter", b"1");
        t2.get(b"counter").unwrap();
        t2.set(b"counter", b"2");

        t1.commit().unwrap();
        assert_eq!(t2.commit(), Err(Error::CommitConflict));
    }

    #[test]
    fn test_range_read_conflicts_with_phantom_insert() {
        let db = open_db();
        let mut reader = db.begin();
        reader.get_range(b"a", b"z").unwrap();

        let mut writer = db.begin();
        writer.set(b"m", b"phantom");
        writer.commit().unwrap();

        reader.set(b"out", b"x");
        assert_eq!(reader.commit(), Err(Error::CommitConflict));
    }

    #[test]
    fn test_clear_range_removes_committed_keys() {
        let db = open_db();
        db.transact(|txn| {
            txn.set(b"p/a", b"1");
            txn.set(b"p/b", b"2");
            txn.set(b"q", b"3");
            Ok(())
        })
        .unwrap();

        let mut txn = db.begin();
        txn.clear_range(b"p/", b"p0");
        assert_eq!(txn.get(b"p/a").unwrap(), None);
        assert_eq!(txn.get_range(b"p/", b"p0").unwrap(), vec![]);
        txn.commit().unwrap();

        let mut check = db.begin();
        assert_eq!(check.get(b"p/a").unwrap(), None);
        assert_eq!(check.get(b"p/b").unwrap(), None);
        assert_eq!(check.get(b"q").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_get_range_overlays_writes() {
        let db = open_db();
        db.transact(|txn| {
            txn.set(b"r/1", b"old");
            txn.set(b"r/2", b"keep");
            Ok(())
        })
        .unwrap();

        let mut txn = db.begin();
        txn.set(b"r/1", b"new");
        txn.set(b"r/3", b"added");
        txn.clear(b"r/2");
        let range = txn.get_range(b"r/", b"r0").unwrap();
        assert_eq!(
            range,
            vec![
                (b"r/1".to_vec(), b"new".to_vec()),
                (b"r/3".to_vec(), b"added".to_vec()),
            ]
        );
    }

    #[test]
    fn test_transact_retries_conflicts() {
        let db = open_db();
        db.transact(|txn| {
            txn.set(b"n", &0u64.to_be_bytes());
            Ok(())
        })
        .unwrap();

        // Force one conflict by committing a competing write between the
        // first read and the first commit.
        let mut interfered = false;
        db.transact(|txn| {
            let raw = txn.get(b"n")?.unwrap();
            let n = u64::from_be_bytes(raw.as_slice().try_into().unwrap());
            if !interfered {
                interfered = true;
                db.transact(|other| {
                    other.set(b"n", &10u64.to_be_bytes());
                    Ok(())
                })?;
            }
            txn.set(b"n", &(n + 1).to_be_bytes());
            Ok(())
        })
        .unwrap();

        let mut check = db.begin();
        let raw = check.get(b"n").unwrap().unwrap();
        assert_eq!(u64::from_be_bytes(raw.as_slice().try_into().unwrap()), 11);
    }

    #[test]
    fn test_after_commit_runs_in_order_only_on_commit() {
        let db = open_db();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (l1, l2) = (log.clone(), log.clone());
        let mut txn = db.begin();
        txn.set(b"k", b"v");
        txn.after_commit(move || l1.lock().push(1));
        txn.after_commit(move || l2.lock().push(2));
        txn.commit().unwrap();
        assert_eq!(*log.lock(), vec![1, 2]);

        let l3 = log.clone();
        {
            let mut txn = db.begin();
            txn.after_commit(move || l3.lock().push(3));
            // Dropped without commit.
        }
        assert_eq!(*log.lock(), vec![1, 2]);
    }
}
