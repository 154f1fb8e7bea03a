//! Ordered key-value engine contract.
//!
//! The index layer never touches disk itself. It talks to an engine through
//! [`KvEngine`], which must provide atomic single-key puts and gets, atomic
//! multi-key batches, and snapshot-isolated prefix scans. [`RedbKvEngine`]
//! is the persistent implementation; [`MemoryKvEngine`] keeps everything in
//! a `BTreeMap` for tests and embedding.
//!
//! [`RedbKvEngine`]: crate::redb_engine::RedbKvEngine

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{KrknError, Result};

/// Key type for the engine.
pub type Key = Vec<u8>;
/// Value type for the engine.
pub type Value = Vec<u8>;

/// One scanned entry. The value is `None` for key-only scans.
pub type ScanEntry = (Key, Option<Value>);

/// Owned, lazily advancing scan over one prefix.
///
/// A cursor pins the snapshot it was opened on. Dropping it releases that
/// snapshot, whether or not it was drained.
pub type KvCursor = Box<dyn Iterator<Item = Result<ScanEntry>> + Send>;

/// Whether a scan materializes values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Yield keys and values.
    KeysAndValues,
    /// Yield keys only; values are never fetched.
    KeysOnly,
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair, overwriting any existing value.
    Put {
        /// The key to insert or update.
        key: Key,
        /// The value to store.
        value: Value,
    },
}

/// Embedded ordered key-value engine consumed by the store.
pub trait KvEngine: Send + Sync {
    /// Get a value by key. Returns `None` if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Put a key-value pair atomically.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Apply all operations atomically: either all become visible or none do.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Open a forward scan over every key starting with `prefix`, in ascending
    /// key order, against a snapshot taken now.
    fn scan_prefix(&self, prefix: &[u8], mode: ScanMode) -> Result<KvCursor>;

    /// Release the engine. Called at most once by the store.
    fn close(&self) -> Result<()>;
}

type Snapshot = Arc<BTreeMap<Key, Value>>;

/// In-memory engine backed by a copy-on-write `BTreeMap`.
///
/// Scans hold an `Arc` of the map as it was when the scan opened, so writes
/// made afterwards are invisible to them. Every entry a cursor yields is
/// counted, which lets tests check how much work a partially consumed scan did.
pub struct MemoryKvEngine {
    data: RwLock<Snapshot>,
    visited: Arc<AtomicU64>,
}

impl MemoryKvEngine {
    /// Creates a new empty in-memory engine.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Arc::new(BTreeMap::new())),
            visited: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total number of entries yielded by all scans so far.
    pub fn entries_visited(&self) -> u64 {
        self.visited.load(Ordering::Relaxed)
    }

    /// Shared handle on the visited-entry counter.
    pub fn visit_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.visited)
    }

    /// Number of keys currently stored, including bookkeeping keys.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let data = self
            .data
            .read()
            .map_err(|e| KrknError::Kv(e.to_string()))?;
        Ok(Arc::clone(&data))
    }
}

impl Default for MemoryKvEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for MemoryKvEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        Ok(self.snapshot()?.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(vec![BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| KrknError::Kv(e.to_string()))?;
        let map = Arc::make_mut(&mut data);
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8], mode: ScanMode) -> Result<KvCursor> {
        Ok(Box::new(MemoryCursor {
            snapshot: self.snapshot()?,
            prefix: prefix.to_vec(),
            lower: Bound::Included(prefix.to_vec()),
            mode,
            visited: Arc::clone(&self.visited),
            done: false,
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Cursor over a memory snapshot. Resumes from the last yielded key, so each
/// step costs one tree descent and nothing past the current entry is touched.
struct MemoryCursor {
    snapshot: Snapshot,
    prefix: Key,
    lower: Bound<Key>,
    mode: ScanMode,
    visited: Arc<AtomicU64>,
    done: bool,
}

impl Iterator for MemoryCursor {
    type Item = Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self
            .snapshot
            .range::<Key, _>((self.lower.clone(), Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.starts_with(&self.prefix))
            .map(|(k, v)| (k.clone(), v.clone()));
        match next {
            Some((key, value)) => {
                self.visited.fetch_add(1, Ordering::Relaxed);
                self.lower = Bound::Excluded(key.clone());
                let value = match self.mode {
                    ScanMode::KeysAndValues => Some(value),
                    ScanMode::KeysOnly => None,
                };
                Some(Ok((key, value)))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
