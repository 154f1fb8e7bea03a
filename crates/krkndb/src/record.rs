//! The hash record entity.

use serde::Serialize;

use crate::error::{KrknError, Result};
use crate::keys;

/// Numeric identifier of a digest algorithm.
pub type HashType = u64;

/// Well-known hash type identifiers.
pub mod hash_types {
    use super::HashType;

    /// MD5
    pub const MD5: HashType = 0;
    /// SHA-1
    pub const SHA1: HashType = 100;
    /// NTLM
    pub const NTLM: HashType = 1000;
    /// SHA-256
    pub const SHA256: HashType = 1400;
    /// SHA-512
    pub const SHA512: HashType = 1700;
}

/// One stored hash to plaintext mapping.
///
/// Records are immutable; persisting one overwrites whatever was stored under
/// the same canonical key. They can only be built from their parts, so the
/// key always derives from `(hash_type, original_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashRecord {
    original_hash: Option<String>,
    normalized_sum: String,
    value: String,
    hash_type: HashType,
    key: Vec<u8>,
}

impl HashRecord {
    /// Build a record from the original hash text, recovered value and hash type.
    pub fn new(original_hash: impl Into<String>, value: impl Into<String>, hash_type: HashType) -> Self {
        let original_hash = original_hash.into();
        let normalized_sum = keys::normalized_sum(&original_hash);
        let key = keys::key_for_sum(hash_type, &normalized_sum);
        Self {
            original_hash: Some(original_hash),
            normalized_sum,
            value: value.into(),
            hash_type,
            key,
        }
    }

    /// Rebuild a record from a scanned key and its raw value.
    ///
    /// The original hash text is not persisted; it is only known when the
    /// caller supplied it (point lookups, batch searches).
    pub(crate) fn from_entry(
        hash_type: HashType,
        key: Vec<u8>,
        value: Vec<u8>,
        original_hash: Option<String>,
    ) -> Result<Self> {
        let normalized_sum = keys::sum_from_key(hash_type, &key)
            .filter(|sum| keys::is_normalized_sum(sum))
            .ok_or_else(|| {
                KrknError::Corrupt(format!("malformed record key {}", keys::display_key(&key)))
            })?
            .to_string();
        let value = String::from_utf8(value).map_err(|_| {
            KrknError::Corrupt(format!("non UTF-8 value under {}", keys::display_key(&key)))
        })?;
        Ok(Self {
            original_hash,
            normalized_sum,
            value,
            hash_type,
            key,
        })
    }

    /// Original hash text, when known.
    pub fn original_hash(&self) -> Option<&str> {
        self.original_hash.as_deref()
    }

    /// Hex SHA-256 of the original hash text (always 64 characters).
    pub fn normalized_sum(&self) -> &str {
        &self.normalized_sum
    }

    /// Recovered plaintext.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Hash type identifier.
    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// Canonical key in the underlying store.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Check that the key is `krkn:<hash_type>:<normalized_sum>` and, when the
    /// original hash is known, that the sum is its digest.
    pub(crate) fn ensure_canonical(&self) -> Result<()> {
        let sum_matches = match &self.original_hash {
            Some(original) => keys::normalized_sum(original) == self.normalized_sum,
            None => true,
        };
        if keys::is_normalized_sum(&self.normalized_sum)
            && sum_matches
            && self.key == keys::key_for_sum(self.hash_type, &self.normalized_sum)
        {
            Ok(())
        } else {
            Err(KrknError::Config(format!(
                "record key {} is not canonical for hash type {}",
                keys::display_key(&self.key),
                self.hash_type
            )))
        }
    }

    /// Record with an arbitrary key, bypassing derivation.
    #[cfg(test)]
    pub(crate) fn with_raw_key(value: &str, hash_type: HashType, key: &[u8]) -> Self {
        Self {
            original_hash: None,
            normalized_sum: keys::normalized_sum(value),
            value: value.to_string(),
            hash_type,
            key: key.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_key_and_sum() {
        let rec = HashRecord::new("5f4dcc3b5aa765d61d8327deb882cf99", "password", hash_types::MD5);
        assert_eq!(rec.normalized_sum().len(), 64);
        assert_eq!(rec.key(), keys::encode(0, "5f4dcc3b5aa765d61d8327deb882cf99").as_slice());
        assert_eq!(rec.original_hash(), Some("5f4dcc3b5aa765d61d8327deb882cf99"));
        assert_eq!(rec.value(), "password");
        assert_eq!(rec.hash_type(), 0);
    }

    #[test]
    fn test_from_entry_matches_new() {
        let rec = HashRecord::new("abc", "v", 1700);
        let rebuilt =
            HashRecord::from_entry(1700, rec.key().to_vec(), b"v".to_vec(), Some("abc".into()))
                .unwrap();
        assert_eq!(rebuilt, rec);
    }

    #[test]
    fn test_from_entry_rejects_foreign_key() {
        let rec = HashRecord::new("abc", "v", 1700);
        let err = HashRecord::from_entry(0, rec.key().to_vec(), b"v".to_vec(), None).unwrap_err();
        assert!(matches!(err, KrknError::Corrupt(_)));
    }

    #[test]
    fn test_canonical_check() {
        assert!(HashRecord::new("abc", "v", 0).ensure_canonical().is_ok());

        let reserved = HashRecord::with_raw_key("v", 0, keys::TOTAL_COUNT_KEY);
        assert!(matches!(reserved.ensure_canonical(), Err(KrknError::Config(_))));

        // Right shape, wrong hash type.
        let other_type = HashRecord::with_raw_key("v", 0, &keys::encode(1400, "v"));
        assert!(other_type.ensure_canonical().is_err());
    }

    #[test]
    fn test_from_entry_rejects_non_hex_sum() {
        let key = format!("krkn:0:{}", "z".repeat(64)).into_bytes();
        let err = HashRecord::from_entry(0, key, b"v".to_vec(), None).unwrap_err();
        assert!(matches!(err, KrknError::Corrupt(_)));
    }

    #[test]
    fn test_from_entry_rejects_bad_utf8() {
        let rec = HashRecord::new("abc", "v", 0);
        let err = HashRecord::from_entry(0, rec.key().to_vec(), vec![0xff, 0xfe], None).unwrap_err();
        assert!(matches!(err, KrknError::Corrupt(_)));
    }
}
