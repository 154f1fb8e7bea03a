//! Error types for KrknDB

use crate::record::HashType;

/// All errors that can occur while opening, writing or querying a store
#[derive(Debug, thiserror::Error)]
pub enum KrknError {
    /// Malformed construction input (wrong key length, bad path, bad options)
    #[error("configuration error: {0}")]
    Config(String),

    /// The storage engine could not be opened within the retry budget
    #[error("failed to open krkn database after {attempts} attempts: {source}")]
    Open {
        /// Number of attempts made before giving up
        attempts: u32,
        /// The last failure reported by the engine
        #[source]
        source: Box<KrknError>,
    },

    /// A point lookup found no record for the derived key
    #[error("hash not found for type {hash_type} (key {key})")]
    NotFound {
        /// Hash type that was queried
        hash_type: HashType,
        /// Canonical key that was probed
        key: String,
    },

    /// Filesystem I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage engine failed a read, write or scan
    #[error("storage engine error: {0}")]
    Kv(String),

    /// A stored value could not be decoded
    #[error("corrupt entry: {0}")]
    Corrupt(String),

    /// Stored counters disagree with a full recount
    #[error("counter mismatch for {counter}: stored {stored}, counted {counted}")]
    Consistency {
        /// Reserved key of the counter that disagrees
        counter: String,
        /// Value currently persisted
        stored: u64,
        /// Value obtained by scanning
        counted: u64,
    },

    /// Value sealing or unsealing failed
    #[error("encryption error: {0}")]
    Encryption(String),

    /// The store was closed; no further operations are possible
    #[error("store is closed")]
    Closed,
}

impl From<redb::Error> for KrknError {
    fn from(e: redb::Error) -> Self {
        KrknError::Kv(e.to_string())
    }
}

/// Result alias for KrknDB operations
pub type Result<T> = std::result::Result<T, KrknError>;

/// Convert any redb error into a [`KrknError::Kv`].
pub(crate) fn kv_err<E: Into<redb::Error>>(e: E) -> KrknError {
    KrknError::from(e.into())
}
