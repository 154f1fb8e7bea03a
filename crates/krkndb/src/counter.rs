//! Record counters and the hash type registry.
//!
//! Counters are 8-byte big-endian integers under reserved keys: one total and
//! one per hash type. The registry holds one key per hash type ever stored so
//! recounts can enumerate types without scanning the whole keyspace.
//!
//! [`Store::store`](crate::Store::store) keeps counters current in the same
//! batch as each record write. The recount operations here rebuild them from
//! the records themselves and are meant as a repair tool.
//!
//! A full recount is not atomic across types: if it fails partway, types
//! already processed keep their new counters and the rest are untouched.
//! Recounts racing with concurrent writes may land a transiently stale value.

use std::collections::BTreeMap;

use tracing::{debug, error, info};

use crate::error::{KrknError, Result};
use crate::keys;
use crate::kv::{BatchOp, KvCursor, KvEngine, ScanMode};
use crate::record::HashType;
use crate::store::Store;

/// Encode a counter value.
pub(crate) fn encode_count(count: u64) -> Vec<u8> {
    count.to_be_bytes().to_vec()
}

/// Decode a counter value stored under `key`.
pub(crate) fn decode_count(key: &[u8], raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| {
        KrknError::Corrupt(format!(
            "counter {} holds {} bytes, expected 8",
            keys::display_key(key),
            raw.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Read a counter, treating an absent key as zero.
pub(crate) fn read_count(engine: &dyn KvEngine, key: &[u8]) -> Result<u64> {
    match engine.get(key)? {
        Some(raw) => decode_count(key, &raw),
        None => Ok(0),
    }
}

/// Batch operations that account for `added` new records per hash type,
/// registering any type seen for the first time.
pub(crate) fn increment_ops(
    engine: &dyn KvEngine,
    added: &BTreeMap<HashType, u64>,
) -> Result<Vec<BatchOp>> {
    let mut ops = Vec::new();
    let mut total_added = 0u64;
    for (&hash_type, &count) in added {
        if count == 0 {
            continue;
        }
        let count_key = keys::type_count_key(hash_type);
        let current = read_count(engine, &count_key)?;
        ops.push(BatchOp::Put {
            key: count_key,
            value: encode_count(current.saturating_add(count)),
        });

        let registry_key = keys::registry_key(hash_type);
        if engine.get(&registry_key)?.is_none() {
            debug!(hash_type, "Registering new hash type");
            ops.push(BatchOp::Put {
                key: registry_key,
                value: Vec::new(),
            });
        }
        total_added += count;
    }
    if total_added > 0 {
        let total = read_count(engine, keys::TOTAL_COUNT_KEY)?;
        ops.push(BatchOp::Put {
            key: keys::TOTAL_COUNT_KEY.to_vec(),
            value: encode_count(total.saturating_add(total_added)),
        });
    }
    Ok(ops)
}

fn registered_types(engine: &dyn KvEngine) -> Result<Vec<HashType>> {
    let mut types = Vec::new();
    for entry in engine.scan_prefix(keys::REGISTRY_PREFIX, ScanMode::KeysOnly)? {
        let (key, _) = entry?;
        let hash_type = keys::hash_type_from_registry_key(&key).ok_or_else(|| {
            KrknError::Corrupt(format!("malformed registry key {}", keys::display_key(&key)))
        })?;
        types.push(hash_type);
    }
    Ok(types)
}

/// Count the entries of a key-only cursor.
fn count_entries(cursor: KvCursor) -> Result<u64> {
    let mut count = 0u64;
    for entry in cursor {
        entry?;
        count += 1;
    }
    Ok(count)
}

/// Point-in-time view of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Value of the total counter.
    pub total: u64,
    /// Per-type counters for every registered hash type.
    pub per_type: BTreeMap<HashType, u64>,
}

/// Maintains and repairs record counters for one store.
pub struct CounterManager<'a> {
    store: &'a Store,
}

impl<'a> CounterManager<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Recount every registered hash type and rewrite all counters.
    ///
    /// With an empty registry the total is set to zero.
    pub fn perform_recount(&self) -> Result<()> {
        info!("Starting full recount of all hash types");

        let hash_types = self.hash_types().map_err(|e| {
            error!(error = %e, "Failed to get registered hash types");
            e
        })?;

        if hash_types.is_empty() {
            info!("No hash types registered, nothing to recount");
            return self.set_count(keys::TOTAL_COUNT_KEY, 0);
        }
        info!(types = hash_types.len(), "Found registered hash types");

        let mut total = 0u64;
        for hash_type in &hash_types {
            let count = self.count_records(*hash_type).map_err(|e| {
                error!(hash_type, error = %e, "Failed to count hash type");
                e
            })?;
            self.set_count(&keys::type_count_key(*hash_type), count)
                .map_err(|e| {
                    error!(hash_type, error = %e, "Failed to update count for hash type");
                    e
                })?;
            info!(hash_type, count, "Updated hash type count");
            total += count;
        }

        self.set_count(keys::TOTAL_COUNT_KEY, total).map_err(|e| {
            error!(error = %e, "Failed to update total hash count");
            e
        })?;
        info!(total, types = hash_types.len(), "Recount completed");
        Ok(())
    }

    /// Recount one hash type, then recompute the total from all per-type counters.
    ///
    /// A type that has records but was never registered gets registered.
    pub fn recount_hash_type(&self, hash_type: HashType) -> Result<()> {
        info!(hash_type, "Starting recount for hash type");

        let count = self.count_records(hash_type).map_err(|e| {
            error!(hash_type, error = %e, "Failed to count hash type");
            e
        })?;

        self.store.locked(|engine| {
            let mut ops = vec![BatchOp::Put {
                key: keys::type_count_key(hash_type),
                value: encode_count(count),
            }];
            let registry_key = keys::registry_key(hash_type);
            if count > 0 && engine.get(&registry_key)?.is_none() {
                ops.push(BatchOp::Put {
                    key: registry_key,
                    value: Vec::new(),
                });
            }
            engine.write_batch(ops)
        })?;

        let total = self.counts()?.per_type.values().sum();
        self.set_count(keys::TOTAL_COUNT_KEY, total)?;
        info!(hash_type, count, total, "Recount for hash type completed");
        Ok(())
    }

    /// Write `count` under `key` as an 8-byte big-endian integer.
    pub fn set_count(&self, key: &[u8], count: u64) -> Result<()> {
        self.store
            .locked(|engine| engine.put(key, &encode_count(count)))
    }

    /// Stored total record count.
    pub fn total_count(&self) -> Result<u64> {
        self.store
            .locked(|engine| read_count(engine, keys::TOTAL_COUNT_KEY))
    }

    /// Stored record count for one hash type (zero if never seen).
    pub fn count_for_type(&self, hash_type: HashType) -> Result<u64> {
        self.store
            .locked(|engine| read_count(engine, &keys::type_count_key(hash_type)))
    }

    /// Every registered hash type, ascending.
    pub fn hash_types(&self) -> Result<Vec<HashType>> {
        self.store.locked(registered_types)
    }

    /// Read the total and every registered per-type counter under one lock.
    pub fn counts(&self) -> Result<CounterSnapshot> {
        self.store.locked(|engine| {
            let mut snapshot = CounterSnapshot {
                total: read_count(engine, keys::TOTAL_COUNT_KEY)?,
                per_type: BTreeMap::new(),
            };
            for hash_type in registered_types(engine)? {
                let count = read_count(engine, &keys::type_count_key(hash_type))?;
                snapshot.per_type.insert(hash_type, count);
            }
            Ok(snapshot)
        })
    }

    /// Compare stored counters with a key-only recount without writing anything.
    ///
    /// Returns the recounted values, or [`KrknError::Consistency`] for the
    /// first counter that disagrees.
    pub fn verify(&self) -> Result<CounterSnapshot> {
        let stored = self.counts()?;
        let mut counted = CounterSnapshot::default();
        for (&hash_type, &stored_count) in &stored.per_type {
            let count = self.count_records(hash_type)?;
            if count != stored_count {
                return Err(KrknError::Consistency {
                    counter: keys::display_key(&keys::type_count_key(hash_type)),
                    stored: stored_count,
                    counted: count,
                });
            }
            counted.per_type.insert(hash_type, count);
            counted.total += count;
        }
        if counted.total != stored.total {
            return Err(KrknError::Consistency {
                counter: keys::display_key(keys::TOTAL_COUNT_KEY),
                stored: stored.total,
                counted: counted.total,
            });
        }
        Ok(counted)
    }

    /// Key-only count of the records under one type prefix.
    fn count_records(&self, hash_type: HashType) -> Result<u64> {
        let prefix = keys::type_prefix(hash_type);
        let cursor = self
            .store
            .locked(|engine| engine.scan_prefix(&prefix, ScanMode::KeysOnly))?;
        let count = count_entries(cursor)?;
        debug!(hash_type, count, "Counted records");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvEngine;
    use crate::record::HashRecord;

    fn memory_store() -> Store {
        Store::from_engine(Box::new(MemoryKvEngine::new()))
    }

    fn seed(store: &Store, hash_type: HashType, n: usize) {
        for i in 0..n {
            store
                .store(&HashRecord::new(format!("h{}-{}", hash_type, i), "v", hash_type))
                .unwrap();
        }
    }

    #[test]
    fn test_decode_count_rejects_wrong_width() {
        assert_eq!(decode_count(b"k", &encode_count(42)).unwrap(), 42);
        assert!(matches!(decode_count(b"k", &[0, 1]), Err(KrknError::Corrupt(_))));
    }

    #[test]
    fn test_counter_encoding_is_big_endian() {
        assert_eq!(encode_count(1), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_recount_repairs_wrong_counters() {
        let store = memory_store();
        seed(&store, 0, 5);
        seed(&store, 1400, 3);
        let counters = store.counters();
        counters.set_count(keys::TOTAL_COUNT_KEY, 999).unwrap();
        counters.set_count(&keys::type_count_key(0), 0).unwrap();
        counters.set_count(&keys::type_count_key(1400), 77).unwrap();

        counters.perform_recount().unwrap();

        assert_eq!(counters.total_count().unwrap(), 8);
        assert_eq!(counters.count_for_type(0).unwrap(), 5);
        assert_eq!(counters.count_for_type(1400).unwrap(), 3);
    }

    #[test]
    fn test_recount_empty_registry_zeroes_total() {
        let store = memory_store();
        let counters = store.counters();
        counters.set_count(keys::TOTAL_COUNT_KEY, 12).unwrap();
        counters.perform_recount().unwrap();
        assert_eq!(counters.total_count().unwrap(), 0);
    }

    #[test]
    fn test_recount_is_idempotent() {
        let store = memory_store();
        seed(&store, 100, 4);
        let counters = store.counters();
        counters.perform_recount().unwrap();
        let first = counters.counts().unwrap();
        counters.perform_recount().unwrap();
        assert_eq!(counters.counts().unwrap(), first);
    }

    #[test]
    fn test_recount_single_type_resums_total() {
        let store = memory_store();
        seed(&store, 0, 2);
        seed(&store, 1700, 4);
        let counters = store.counters();
        counters.set_count(&keys::type_count_key(1700), 0).unwrap();
        counters.set_count(keys::TOTAL_COUNT_KEY, 2).unwrap();

        counters.recount_hash_type(1700).unwrap();

        assert_eq!(counters.count_for_type(1700).unwrap(), 4);
        assert_eq!(counters.total_count().unwrap(), 6);
    }

    #[test]
    fn test_verify_detects_drift() {
        let store = memory_store();
        seed(&store, 0, 3);
        let counters = store.counters();
        assert_eq!(counters.verify().unwrap().total, 3);

        counters.set_count(&keys::type_count_key(0), 1).unwrap();
        match counters.verify() {
            Err(KrknError::Consistency { stored, counted, .. }) => {
                assert_eq!(stored, 1);
                assert_eq!(counted, 3);
            }
            other => panic!("expected consistency error, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_types_ordered_numerically() {
        let store = memory_store();
        seed(&store, 1700, 1);
        seed(&store, 0, 1);
        seed(&store, 100, 1);
        assert_eq!(store.counters().hash_types().unwrap(), vec![0, 100, 1700]);
    }

    #[test]
    fn test_type_prefix_does_not_overlap() {
        let store = memory_store();
        seed(&store, 1, 2);
        seed(&store, 14, 3);
        seed(&store, 1400, 4);
        let counters = store.counters();
        counters.perform_recount().unwrap();
        assert_eq!(counters.count_for_type(1).unwrap(), 2);
        assert_eq!(counters.count_for_type(14).unwrap(), 3);
        assert_eq!(counters.total_count().unwrap(), 9);
    }
}
