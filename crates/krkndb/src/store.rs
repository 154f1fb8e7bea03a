//! Store lifecycle and write path.
//!
//! A [`Store`] owns the single engine handle for one directory. Every public
//! operation takes the store's exclusive lock: writes hold it until their
//! batch commits, reads hold it while they acquire their snapshot (a point
//! read, or a scan cursor). Once a cursor exists, iteration continues on its
//! snapshot without the lock, so a slow consumer never blocks writers.
//!
//! Opening is first-caller-wins per directory: while a store for a path is
//! live, further [`Store::open`] calls for the same path return a handle to
//! that store instead of opening the engine a second time. Paths are made
//! absolute and lexically normalized first, so `db` and `x/../db` name the
//! same store. Opens of one directory queue on that directory's slot; opens
//! of other directories never wait on them.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;

use tracing::{debug, info, warn};

use crate::cipher::EncryptionKey;
use crate::config::StoreOptions;
use crate::counter::{self, CounterManager};
use crate::error::{KrknError, Result};
use crate::keys;
use crate::kv::{BatchOp, KvEngine};
use crate::query::QueryEngine;
use crate::record::{HashRecord, HashType};
use crate::redb_engine::RedbKvEngine;

/// Open slot of one directory. Its lock is held for the whole open of that
/// directory, retries included.
#[derive(Default)]
struct OpenSlot {
    live: Mutex<Weak<StoreInner>>,
}

impl OpenSlot {
    fn is_idle(slot: &Arc<OpenSlot>) -> bool {
        Arc::strong_count(slot) == 1
            && slot
                .live
                .try_lock()
                .map(|live| live.strong_count() == 0)
                .unwrap_or(false)
    }
}

/// Open slots by normalized absolute directory. Locked only to look up or
/// insert a slot.
fn open_slots() -> &'static Mutex<HashMap<PathBuf, Arc<OpenSlot>>> {
    static OPEN_SLOTS: OnceLock<Mutex<HashMap<PathBuf, Arc<OpenSlot>>>> = OnceLock::new();
    OPEN_SLOTS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn slot_for(dir: &Path) -> Result<Arc<OpenSlot>> {
    let mut slots = open_slots()
        .lock()
        .map_err(|e| KrknError::Kv(e.to_string()))?;
    slots.retain(|path, slot| path == dir || !OpenSlot::is_idle(slot));
    Ok(Arc::clone(slots.entry(dir.to_path_buf()).or_default()))
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

struct StoreInner {
    engine: Mutex<Option<Box<dyn KvEngine>>>,
    dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    key_fingerprint: Option<[u8; 32]>,
    is_new: bool,
}

/// Handle on an open hash index. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open or create the store in `dir` with default options.
    pub fn open(dir: impl AsRef<Path>, encryption_key: &[u8]) -> Result<Self> {
        Self::open_with_options(dir, encryption_key, StoreOptions::default())
    }

    /// Open or create the store in `dir`.
    ///
    /// The key must be exactly 32 bytes. The directory is created if missing.
    /// The engine open is attempted `options.open_attempts` times with a fixed
    /// delay in between; the last failure is returned inside
    /// [`KrknError::Open`].
    ///
    /// If the directory is already open in this process, the live store is
    /// returned and `options` are ignored: the first opener's options stay in
    /// effect. The key must still match the one the store was opened with,
    /// otherwise the call fails with [`KrknError::Config`].
    pub fn open_with_options(
        dir: impl AsRef<Path>,
        encryption_key: &[u8],
        options: StoreOptions,
    ) -> Result<Self> {
        let key = EncryptionKey::from_slice(encryption_key)?;
        options.validate()?;

        let dir = std::path::absolute(dir.as_ref())
            .map(|abs| normalize_path(&abs))
            .map_err(|e| {
                KrknError::Config(format!(
                    "failed to get absolute path for '{}': {}",
                    dir.as_ref().display(),
                    e
                ))
            })?;

        let slot = slot_for(&dir)?;
        let mut live = slot.live.lock().map_err(|e| KrknError::Kv(e.to_string()))?;
        if let Some(inner) = live.upgrade() {
            let store = Store { inner };
            if !store.is_closed() {
                if store.inner.key_fingerprint != Some(key.fingerprint()) {
                    return Err(KrknError::Config(format!(
                        "encryption key does not match the open store at '{}'",
                        dir.display()
                    )));
                }
                debug!(dir = %dir.display(), "Reusing live store handle");
                return Ok(store);
            }
        }

        let is_new = !dir.exists();
        if is_new {
            create_dir(&dir, options.dir_mode)?;
        }
        let db_path = dir.join(&options.file_name);

        let mut attempt = 1;
        let engine = loop {
            match RedbKvEngine::open(&db_path, &key, options.cache_size_bytes) {
                Ok(engine) => break engine,
                Err(e) if attempt < options.open_attempts => {
                    warn!(attempt, error = %e, path = %db_path.display(), "Failed to open krkn database, retrying");
                    thread::sleep(options.open_retry_delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(KrknError::Open {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
            }
        };

        let inner = Arc::new(StoreInner {
            engine: Mutex::new(Some(Box::new(engine))),
            dir: Some(dir),
            db_path: Some(db_path.clone()),
            key_fingerprint: Some(key.fingerprint()),
            is_new,
        });
        *live = Arc::downgrade(&inner);

        info!(path = %db_path.display(), is_new, "Opened krkn database");
        Ok(Store { inner })
    }

    /// Wrap an already opened engine. The store is not tied to any directory.
    pub fn from_engine(engine: Box<dyn KvEngine>) -> Self {
        Store {
            inner: Arc::new(StoreInner {
                engine: Mutex::new(Some(engine)),
                dir: None,
                db_path: None,
                key_fingerprint: None,
                is_new: true,
            }),
        }
    }

    /// Run `f` against the engine while holding the store's exclusive lock.
    pub(crate) fn locked<T>(&self, f: impl FnOnce(&dyn KvEngine) -> Result<T>) -> Result<T> {
        let guard = self
            .inner
            .engine
            .lock()
            .map_err(|e| KrknError::Kv(e.to_string()))?;
        let engine = guard.as_deref().ok_or(KrknError::Closed)?;
        f(engine)
    }

    /// Persist one record, overwriting any value under the same key.
    ///
    /// The record, its type counter, the total counter and (on first sight
    /// of the type) the registry entry are written in one atomic batch.
    /// Overwriting an existing key leaves the counters unchanged.
    pub fn store(&self, record: &HashRecord) -> Result<()> {
        record.ensure_canonical()?;
        self.locked(|engine| {
            let mut ops = vec![BatchOp::Put {
                key: record.key().to_vec(),
                value: record.value().as_bytes().to_vec(),
            }];
            if engine.get(record.key())?.is_none() {
                let added = BTreeMap::from([(record.hash_type(), 1u64)]);
                ops.extend(counter::increment_ops(engine, &added)?);
            }
            engine.write_batch(ops)?;
            debug!(hash_type = record.hash_type(), key = %keys::display_key(record.key()), "Stored hash");
            Ok(())
        })
    }

    /// Persist many records in one atomic batch.
    ///
    /// Records sharing a key collapse to the last one in `records`.
    pub fn store_batch(&self, records: &[HashRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut unique: BTreeMap<&[u8], &HashRecord> = BTreeMap::new();
        for record in records {
            record.ensure_canonical()?;
            unique.insert(record.key(), record);
        }

        self.locked(|engine| {
            let mut ops = Vec::with_capacity(unique.len() + 4);
            let mut added: BTreeMap<HashType, u64> = BTreeMap::new();
            for (key, record) in &unique {
                if engine.get(key)?.is_none() {
                    *added.entry(record.hash_type()).or_default() += 1;
                }
                ops.push(BatchOp::Put {
                    key: key.to_vec(),
                    value: record.value().as_bytes().to_vec(),
                });
            }
            ops.extend(counter::increment_ops(engine, &added)?);
            engine.write_batch(ops)?;
            debug!(records = unique.len(), new_types = added.len(), "Stored hash batch");
            Ok(())
        })
    }

    /// Retrieval strategies over this store.
    pub fn query(&self) -> QueryEngine<'_> {
        QueryEngine::new(self)
    }

    /// Counter and registry maintenance for this store.
    pub fn counters(&self) -> CounterManager<'_> {
        CounterManager::new(self)
    }

    /// Release the engine. Later operations on any handle fail with [`KrknError::Closed`].
    ///
    /// Closing an already closed store is a no-op.
    pub fn close(&self) -> Result<()> {
        let engine = {
            let mut guard = self
                .inner
                .engine
                .lock()
                .map_err(|e| KrknError::Kv(e.to_string()))?;
            guard.take()
        };
        let Some(engine) = engine else {
            return Ok(());
        };
        engine.close()?;
        info!(path = ?self.inner.db_path, "Closed krkn database");
        Ok(())
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner
            .engine
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    /// True if this open created the store directory.
    pub fn is_new(&self) -> bool {
        self.inner.is_new
    }

    /// Absolute store directory, if the store is backed by one.
    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    /// Absolute path of the database file, if the store is backed by one.
    pub fn db_path(&self) -> Option<&Path> {
        self.inner.db_path.as_deref()
    }

    /// True if both handles refer to the same open store.
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.inner.db_path)
            .field("is_new", &self.inner.is_new)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(unix)]
fn create_dir(dir: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir(dir: &Path, _mode: u32) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvEngine;
    use crate::record::hash_types;

    fn memory_store() -> Store {
        Store::from_engine(Box::new(MemoryKvEngine::new()))
    }

    #[test]
    fn test_store_then_get() {
        let store = memory_store();
        store.store(&HashRecord::new("abc", "plain", hash_types::MD5)).unwrap();
        let rec = store.query().get_by_original_hash("abc", hash_types::MD5).unwrap();
        assert_eq!(rec.value(), "plain");
    }

    #[test]
    fn test_overwrite_keeps_counts() {
        let store = memory_store();
        store.store(&HashRecord::new("abc", "v1", 0)).unwrap();
        store.store(&HashRecord::new("abc", "v2", 0)).unwrap();
        assert_eq!(store.counters().total_count().unwrap(), 1);
        assert_eq!(store.counters().count_for_type(0).unwrap(), 1);
        assert_eq!(store.query().get_by_original_hash("abc", 0).unwrap().value(), "v2");
    }

    #[test]
    fn test_store_registers_type_once() {
        let store = memory_store();
        store.store(&HashRecord::new("a", "1", 1400)).unwrap();
        store.store(&HashRecord::new("b", "2", 1400)).unwrap();
        store.store(&HashRecord::new("c", "3", 0)).unwrap();
        assert_eq!(store.counters().hash_types().unwrap(), vec![0, 1400]);
        assert_eq!(store.counters().count_for_type(1400).unwrap(), 2);
        assert_eq!(store.counters().total_count().unwrap(), 3);
    }

    #[test]
    fn test_store_batch_collapses_duplicates() {
        let store = memory_store();
        store.store(&HashRecord::new("existing", "old", 0)).unwrap();
        store
            .store_batch(&[
                HashRecord::new("x", "1", 0),
                HashRecord::new("x", "2", 0),
                HashRecord::new("existing", "new", 0),
                HashRecord::new("y", "3", 1700),
            ])
            .unwrap();
        let counters = store.counters();
        assert_eq!(counters.count_for_type(0).unwrap(), 2);
        assert_eq!(counters.count_for_type(1700).unwrap(), 1);
        assert_eq!(counters.total_count().unwrap(), 3);
        assert_eq!(store.query().get_by_original_hash("x", 0).unwrap().value(), "2");
        assert_eq!(store.query().get_by_original_hash("existing", 0).unwrap().value(), "new");
    }

    #[test]
    fn test_store_batch_empty_is_noop() {
        let store = memory_store();
        store.store_batch(&[]).unwrap();
        assert_eq!(store.counters().total_count().unwrap(), 0);
    }

    #[test]
    fn test_closed_store_fails_fast() {
        let store = memory_store();
        let other = store.clone();
        store.close().unwrap();
        assert!(other.is_closed());
        assert!(matches!(
            other.store(&HashRecord::new("a", "b", 0)),
            Err(KrknError::Closed)
        ));
        assert!(matches!(
            other.query().get_by_original_hash("a", 0),
            Err(KrknError::Closed)
        ));
        store.close().unwrap();
    }

    #[test]
    fn test_non_canonical_record_is_rejected() {
        let store = memory_store();
        store.store(&HashRecord::new("a", "1", 0)).unwrap();

        let forged = HashRecord::with_raw_key("x", 0, keys::TOTAL_COUNT_KEY);
        assert!(matches!(store.store(&forged), Err(KrknError::Config(_))));
        assert!(matches!(
            store.store_batch(&[HashRecord::new("b", "2", 0), forged]),
            Err(KrknError::Config(_))
        ));

        let counters = store.counters();
        assert_eq!(counters.total_count().unwrap(), 1);
        assert_eq!(counters.verify().unwrap().total, 1);
        assert!(store.query().get_by_original_hash("b", 0).is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize_path(Path::new("/a/./b/")), PathBuf::from("/a/b"));
        assert_eq!(normalize_path(Path::new("/a/x/y/../../db")), PathBuf::from("/a/db"));
        assert_eq!(normalize_path(Path::new("/..")), PathBuf::from("/"));
    }

    #[test]
    fn test_idle_slots_are_pruned() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = normalize_path(&dir.path().join("a"));
        let b = normalize_path(&dir.path().join("b"));
        drop(slot_for(&a).unwrap());
        drop(slot_for(&b).unwrap());
        assert!(!open_slots().lock().unwrap().contains_key(&a));
    }

    #[test]
    fn test_wrong_key_length_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        for len in [0usize, 16, 31, 33] {
            let err = Store::open(dir.path().join("db"), &vec![0u8; len]).unwrap_err();
            assert!(matches!(err, KrknError::Config(_)));
        }
        assert!(!dir.path().join("db").exists());
    }
}
