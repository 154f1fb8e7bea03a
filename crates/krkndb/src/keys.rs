//! Canonical key derivation.
//!
//! Every record lives under `krkn:<hash type>:<sha256 hex of original hash>`.
//! Re-hashing the original digest to SHA-256 gives every key a fixed 64
//! character suffix regardless of the source algorithm, so scans behave the
//! same way for MD5 and SHA-512 alike.
//!
//! Bookkeeping entries (counters, type registry) live under `krkn_meta:`,
//! which never collides with a `krkn:<t>:` prefix.

use sha2::{Digest, Sha256};

use crate::record::HashType;

/// Literal prefix of every record key.
pub const RECORD_PREFIX: &str = "krkn:";

/// Length of a normalized sum in hex characters.
pub const NORMALIZED_SUM_LEN: usize = 64;

/// Reserved key holding the total record count.
pub const TOTAL_COUNT_KEY: &[u8] = b"krkn_meta:total";

const TYPE_COUNT_PREFIX: &str = "krkn_meta:count:";

/// Prefix of the hash type registry range.
pub const REGISTRY_PREFIX: &[u8] = b"krkn_meta:type:";

/// Hex-encoded SHA-256 of the original hash text.
pub fn normalized_sum(original_hash: &str) -> String {
    let digest = Sha256::digest(original_hash.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// True for exactly 64 lowercase hex characters.
pub fn is_normalized_sum(sum: &str) -> bool {
    sum.len() == NORMALIZED_SUM_LEN
        && sum.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Canonical key for `original_hash` under `hash_type`.
pub fn encode(hash_type: HashType, original_hash: &str) -> Vec<u8> {
    key_for_sum(hash_type, &normalized_sum(original_hash))
}

/// Canonical key for an already normalized sum.
pub fn key_for_sum(hash_type: HashType, sum: &str) -> Vec<u8> {
    let mut key = type_prefix(hash_type);
    key.extend_from_slice(sum.as_bytes());
    key
}

/// `krkn:<hash type>:`, bounding a scan to exactly one hash type.
pub fn type_prefix(hash_type: HashType) -> Vec<u8> {
    format!("{}{}:", RECORD_PREFIX, hash_type).into_bytes()
}

/// Type prefix extended with a partial normalized sum.
///
/// An empty `partial_sum_hex` yields the plain type prefix.
pub fn prefix_query(hash_type: HashType, partial_sum_hex: &str) -> Vec<u8> {
    let mut prefix = type_prefix(hash_type);
    prefix.extend_from_slice(partial_sum_hex.as_bytes());
    prefix
}

/// Split a record key back into its normalized sum, checking the type prefix.
pub fn sum_from_key(hash_type: HashType, key: &[u8]) -> Option<&str> {
    let suffix = key.strip_prefix(type_prefix(hash_type).as_slice())?;
    std::str::from_utf8(suffix).ok()
}

/// Reserved key holding the record count of one hash type.
pub fn type_count_key(hash_type: HashType) -> Vec<u8> {
    format!("{}{}", TYPE_COUNT_PREFIX, hash_type).into_bytes()
}

/// Registry entry marking `hash_type` as seen.
///
/// The type id is appended big-endian so registry scans come back in numeric order.
pub fn registry_key(hash_type: HashType) -> Vec<u8> {
    let mut key = REGISTRY_PREFIX.to_vec();
    key.extend_from_slice(&hash_type.to_be_bytes());
    key
}

/// Decode a registry key produced by [`registry_key`].
pub fn hash_type_from_registry_key(key: &[u8]) -> Option<HashType> {
    let raw: [u8; 8] = key.strip_prefix(REGISTRY_PREFIX)?.try_into().ok()?;
    Some(HashType::from_be_bytes(raw))
}

/// Render a key for logs and error messages.
pub fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}
