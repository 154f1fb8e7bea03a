//! Persistent engine backed by redb.
//!
//! redb supplies the ordered B-tree, MVCC read snapshots, atomic write
//! transactions and the exclusive file lock. It has no at-rest encryption,
//! so values are sealed with [`ValueCipher`] before they reach the table.
//! Keys stay in plaintext to preserve ordering for prefix scans.

use std::ops::Bound;
use std::path::Path;
use std::sync::RwLock;

use redb::{Database, ReadOnlyTable, TableDefinition};
use tracing::debug;

use crate::cipher::{EncryptionKey, ValueCipher};
use crate::error::{kv_err, KrknError, Result};
use crate::kv::{BatchOp, Key, KvCursor, KvEngine, ScanEntry, ScanMode, Value};

const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("krkn");

/// redb-backed [`KvEngine`] with sealed values.
pub struct RedbKvEngine {
    db: RwLock<Option<Database>>,
    cipher: std::sync::Arc<ValueCipher>,
}

impl RedbKvEngine {
    /// Open or create the database file at `path`.
    ///
    /// Fails if another handle in this process (or another process) holds the file.
    pub fn open(path: &Path, key: &EncryptionKey, cache_size_bytes: usize) -> Result<Self> {
        let db = Database::builder()
            .set_cache_size(cache_size_bytes)
            .create(path)
            .map_err(kv_err)?;

        // Read transactions cannot open a table that was never created.
        let txn = db.begin_write().map_err(kv_err)?;
        txn.open_table(ENTRIES).map_err(kv_err)?;
        txn.commit().map_err(kv_err)?;

        debug!(path = %path.display(), "Opened redb engine");
        Ok(Self {
            db: RwLock::new(Some(db)),
            cipher: std::sync::Arc::new(ValueCipher::new(key)?),
        })
    }

    fn read_table(&self) -> Result<ReadOnlyTable<&'static [u8], &'static [u8]>> {
        let guard = self.db.read().map_err(|e| KrknError::Kv(e.to_string()))?;
        let db = guard.as_ref().ok_or(KrknError::Closed)?;
        let txn = db.begin_read().map_err(kv_err)?;
        txn.open_table(ENTRIES).map_err(kv_err)
    }
}

impl KvEngine for RedbKvEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let table = self.read_table()?;
        let sealed = table.get(key).map_err(kv_err)?;
        match sealed {
            Some(guard) => Ok(Some(self.cipher.open(guard.value())?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(vec![BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let guard = self.db.read().map_err(|e| KrknError::Kv(e.to_string()))?;
        let db = guard.as_ref().ok_or(KrknError::Closed)?;
        let txn = db.begin_write().map_err(kv_err)?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(kv_err)?;
            for op in &ops {
                match op {
                    BatchOp::Put { key, value } => {
                        let sealed = self.cipher.seal(value)?;
                        table
                            .insert(key.as_slice(), sealed.as_slice())
                            .map_err(kv_err)?;
                    }
                }
            }
        }
        txn.commit().map_err(kv_err)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8], mode: ScanMode) -> Result<KvCursor> {
        Ok(Box::new(RedbCursor {
            table: self.read_table()?,
            cipher: std::sync::Arc::clone(&self.cipher),
            prefix: prefix.to_vec(),
            last: None,
            mode,
            done: false,
        }))
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.db.write().map_err(|e| KrknError::Kv(e.to_string()))?;
        if guard.take().is_some() {
            debug!("Closed redb engine");
        }
        Ok(())
    }
}

/// Cursor over one read transaction. The table handle pins the snapshot
/// until the cursor is dropped.
struct RedbCursor {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    cipher: std::sync::Arc<ValueCipher>,
    prefix: Key,
    last: Option<Key>,
    mode: ScanMode,
    done: bool,
}

impl RedbCursor {
    fn step(&mut self) -> Result<Option<ScanEntry>> {
        let lower = match &self.last {
            Some(last) => Bound::Excluded(last.as_slice()),
            None => Bound::Included(self.prefix.as_slice()),
        };
        let mut range = self
            .table
            .range::<&[u8]>((lower, Bound::Unbounded))
            .map_err(kv_err)?;
        let Some(entry) = range.next() else {
            return Ok(None);
        };
        let (k, v) = entry.map_err(kv_err)?;
        let key = k.value().to_vec();
        if !key.starts_with(&self.prefix) {
            return Ok(None);
        }
        let value = match self.mode {
            ScanMode::KeysAndValues => Some(self.cipher.open(v.value())?),
            ScanMode::KeysOnly => None,
        };
        Ok(Some((key, value)))
    }
}

impl Iterator for RedbCursor {
    type Item = Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => {
                self.last = Some(entry.0.clone());
                Some(Ok(entry))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
