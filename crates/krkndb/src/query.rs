//! Retrieval strategies.
//!
//! - [`QueryEngine::get_by_original_hash`]: one point read.
//! - [`QueryEngine::find_by_hashes`]: one scan of a type, filtered against an
//!   in-memory key set. O(m + s) for m stored records and s searched hashes,
//!   instead of s point reads.
//! - [`QueryEngine::all_of_type`]: one scan of a type.
//! - [`QueryEngine::search_by_prefix`]: one scan bounded by a normalized-sum
//!   prefix.
//!
//! Scans come back as [`RecordIter`], which pulls from the engine only as the
//! caller advances it. Dropping the iterator, or calling
//! [`RecordIter::close`], releases the underlying snapshot immediately.

use std::collections::HashMap;
use std::iter::FusedIterator;

use tracing::debug;

use crate::error::{KrknError, Result};
use crate::keys;
use crate::kv::{KvCursor, ScanMode};
use crate::record::{HashRecord, HashType};
use crate::store::Store;

/// Lazy sequence of records in ascending key order.
pub struct RecordIter {
    cursor: Option<KvCursor>,
    hash_type: HashType,
    /// Batch search filter: canonical key to original hash text.
    wanted: Option<HashMap<Vec<u8>, String>>,
}

impl RecordIter {
    fn new(cursor: KvCursor, hash_type: HashType, wanted: Option<HashMap<Vec<u8>, String>>) -> Self {
        Self {
            cursor: Some(cursor),
            hash_type,
            wanted,
        }
    }

    fn empty(hash_type: HashType) -> Self {
        Self {
            cursor: None,
            hash_type,
            wanted: None,
        }
    }

    /// Stop the scan and release its snapshot. Further calls to `next` yield `None`.
    pub fn close(&mut self) {
        self.cursor = None;
    }

    /// True while the scan may still produce records.
    pub fn is_open(&self) -> bool {
        self.cursor.is_some()
    }
}

impl Iterator for RecordIter {
    type Item = Result<HashRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cursor = self.cursor.as_mut()?;
            let (key, value) = match cursor.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    self.close();
                    return Some(Err(e));
                }
                None => {
                    self.close();
                    return None;
                }
            };

            let original_hash = match self.wanted.as_mut() {
                Some(wanted) => match wanted.remove(&key) {
                    Some(original) => Some(original),
                    None => continue,
                },
                None => None,
            };
            // Every searched key has been found; nothing left to scan for.
            if self.wanted.as_ref().is_some_and(HashMap::is_empty) {
                self.close();
            }

            let record = value
                .ok_or_else(|| {
                    KrknError::Kv(format!("scan returned no value for {}", keys::display_key(&key)))
                })
                .and_then(|value| HashRecord::from_entry(self.hash_type, key, value, original_hash));
            if record.is_err() {
                self.close();
            }
            return Some(record);
        }
    }
}

impl FusedIterator for RecordIter {}

impl std::fmt::Debug for RecordIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordIter")
            .field("hash_type", &self.hash_type)
            .field("open", &self.is_open())
            .field("pending", &self.wanted.as_ref().map(HashMap::len))
            .finish()
    }
}

/// Read-side operations over one store.
pub struct QueryEngine<'a> {
    store: &'a Store,
}

impl<'a> QueryEngine<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Look up one record by its original hash text.
    pub fn get_by_original_hash(&self, original_hash: &str, hash_type: HashType) -> Result<HashRecord> {
        let key = keys::encode(hash_type, original_hash);
        let value = self.store.locked(|engine| engine.get(&key))?;
        match value {
            Some(value) => HashRecord::from_entry(hash_type, key, value, Some(original_hash.to_string())),
            None => Err(KrknError::NotFound {
                hash_type,
                key: keys::display_key(&key),
            }),
        }
    }

    /// Every stored record of `hash_type` whose original hash is in `search_list`.
    ///
    /// Results come in ascending key order, each at most once, however often
    /// a hash repeats in the list. The type is scanned once; the scan ends
    /// early when every searched hash has been found.
    pub fn find_by_hashes<I, S>(&self, search_list: I, hash_type: HashType) -> Result<RecordIter>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut wanted: HashMap<Vec<u8>, String> = HashMap::new();
        for hash in search_list {
            let hash = hash.as_ref();
            wanted
                .entry(keys::encode(hash_type, hash))
                .or_insert_with(|| hash.to_string());
        }
        if wanted.is_empty() {
            return Ok(RecordIter::empty(hash_type));
        }

        debug!(hash_type, searched = wanted.len(), "Starting batch search");
        let cursor = self.scan(&keys::type_prefix(hash_type))?;
        Ok(RecordIter::new(cursor, hash_type, Some(wanted)))
    }

    /// Every record of `hash_type`, in ascending key order.
    pub fn all_of_type(&self, hash_type: HashType) -> Result<RecordIter> {
        debug!(hash_type, "Starting type iteration");
        let cursor = self.scan(&keys::type_prefix(hash_type))?;
        Ok(RecordIter::new(cursor, hash_type, None))
    }

    /// Records of `hash_type` whose normalized sum starts with `partial_sum_hex`.
    ///
    /// This matches on the SHA-256 of the original hash text, not on the
    /// original text itself. Hex digits are accepted in either case. An empty
    /// prefix is the same as [`all_of_type`](Self::all_of_type).
    pub fn search_by_prefix(&self, partial_sum_hex: &str, hash_type: HashType) -> Result<RecordIter> {
        if !partial_sum_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KrknError::Config(format!(
                "prefix '{}' is not hexadecimal",
                partial_sum_hex
            )));
        }
        if partial_sum_hex.len() > keys::NORMALIZED_SUM_LEN {
            return Ok(RecordIter::empty(hash_type));
        }

        let partial = partial_sum_hex.to_ascii_lowercase();
        debug!(hash_type, prefix = %partial, "Starting prefix search");
        let cursor = self.scan(&keys::prefix_query(hash_type, &partial))?;
        Ok(RecordIter::new(cursor, hash_type, None))
    }

    fn scan(&self, prefix: &[u8]) -> Result<KvCursor> {
        self.store
            .locked(|engine| engine.scan_prefix(prefix, ScanMode::KeysAndValues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvEngine;
    use std::sync::atomic::Ordering;

    fn memory_store() -> Store {
        Store::from_engine(Box::new(MemoryKvEngine::new()))
    }

    fn seed(store: &Store, hash_type: HashType, n: usize) -> Vec<String> {
        let hashes: Vec<String> = (0..n).map(|i| format!("hash_{}_{}", hash_type, i)).collect();
        let records: Vec<HashRecord> = hashes
            .iter()
            .map(|h| HashRecord::new(h.clone(), format!("value_{}", h), hash_type))
            .collect();
        store.store_batch(&records).unwrap();
        hashes
    }

    fn collect(iter: RecordIter) -> Vec<HashRecord> {
        iter.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = memory_store();
        assert!(matches!(
            store.query().get_by_original_hash("nope", 0),
            Err(KrknError::NotFound { hash_type: 0, .. })
        ));
    }

    #[test]
    fn test_find_by_hashes_intersection_sorted_by_key() {
        let store = memory_store();
        let hashes = seed(&store, 0, 20);
        let search = vec![
            hashes[7].clone(),
            "not-stored".to_string(),
            hashes[3].clone(),
            hashes[7].clone(),
            hashes[15].clone(),
        ];

        let found = collect(store.query().find_by_hashes(&search, 0).unwrap());
        assert_eq!(found.len(), 3);
        assert!(found.windows(2).all(|w| w[0].key() < w[1].key()));
        let mut originals: Vec<&str> = found.iter().filter_map(|r| r.original_hash()).collect();
        originals.sort();
        let mut expected = vec![hashes[15].as_str(), hashes[3].as_str(), hashes[7].as_str()];
        expected.sort();
        assert_eq!(originals, expected);
        for rec in &found {
            assert_eq!(rec.value(), format!("value_{}", rec.original_hash().unwrap()));
        }
    }

    #[test]
    fn test_find_by_hashes_ignores_other_types() {
        let store = memory_store();
        let md5 = seed(&store, 0, 5);
        seed(&store, 1400, 5);
        let found = collect(store.query().find_by_hashes(&md5, 1400).unwrap());
        assert!(found.is_empty());
    }

    #[test]
    fn test_find_by_hashes_empty_list_does_not_scan() {
        let engine = MemoryKvEngine::new();
        let visited = engine.visit_counter();
        let store = Store::from_engine(Box::new(engine));
        seed(&store, 0, 10);
        let found = collect(store.query().find_by_hashes(Vec::<String>::new(), 0).unwrap());
        assert!(found.is_empty());
        assert_eq!(visited.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_all_of_type_yields_each_once() {
        let store = memory_store();
        seed(&store, 0, 12);
        seed(&store, 100, 4);
        let records = collect(store.query().all_of_type(0).unwrap());
        assert_eq!(records.len(), 12);
        assert!(records.windows(2).all(|w| w[0].key() < w[1].key()));
        assert!(records.iter().all(|r| r.hash_type() == 0 && r.original_hash().is_none()));
        assert!(collect(store.query().all_of_type(1700).unwrap()).is_empty());
    }

    #[test]
    fn test_early_termination_bounds_work() {
        let engine = MemoryKvEngine::new();
        let visited = engine.visit_counter();
        let store = Store::from_engine(Box::new(engine));
        seed(&store, 0, 200);

        let before = visited.load(Ordering::Relaxed);
        let taken: Vec<_> = store.query().all_of_type(0).unwrap().take(5).collect();
        assert_eq!(taken.len(), 5);
        assert_eq!(visited.load(Ordering::Relaxed) - before, 5);
    }

    #[test]
    fn test_close_stops_iteration() {
        let store = memory_store();
        seed(&store, 0, 3);
        let mut iter = store.query().all_of_type(0).unwrap();
        assert!(iter.next().is_some());
        iter.close();
        assert!(!iter.is_open());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_scan_does_not_see_later_writes() {
        let store = memory_store();
        seed(&store, 0, 3);
        let iter = store.query().all_of_type(0).unwrap();
        store.store(&HashRecord::new("late", "v", 0)).unwrap();
        assert_eq!(collect(iter).len(), 3);
        assert_eq!(collect(store.query().all_of_type(0).unwrap()).len(), 4);
    }

    #[test]
    fn test_empty_prefix_equals_type_iteration() {
        let store = memory_store();
        seed(&store, 1700, 25);
        let all = collect(store.query().all_of_type(1700).unwrap());
        let prefixed = collect(store.query().search_by_prefix("", 1700).unwrap());
        assert_eq!(all, prefixed);
    }

    #[test]
    fn test_prefix_search_matches_normalized_sum() {
        let store = memory_store();
        seed(&store, 0, 50);
        let target = HashRecord::new("hash_0_10", "", 0);
        let prefix = &target.normalized_sum()[..6];

        let found = collect(store.query().search_by_prefix(prefix, 0).unwrap());
        assert!(found.iter().any(|r| r.normalized_sum() == target.normalized_sum()));
        assert!(found.iter().all(|r| r.normalized_sum().starts_with(prefix)));

        let upper = collect(store.query().search_by_prefix(&prefix.to_uppercase(), 0).unwrap());
        assert_eq!(found, upper);
    }

    #[test]
    fn test_prefix_search_rejects_non_hex() {
        let store = memory_store();
        assert!(matches!(
            store.query().search_by_prefix("xyz", 0),
            Err(KrknError::Config(_))
        ));
    }

    #[test]
    fn test_prefix_longer_than_sum_matches_nothing() {
        let store = memory_store();
        seed(&store, 0, 2);
        let long = "a".repeat(65);
        assert!(collect(store.query().search_by_prefix(&long, 0).unwrap()).is_empty());
    }
}
