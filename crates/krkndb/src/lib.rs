#![warn(missing_docs)]

//! KrknDB: embedded index of cryptographic hashes to recovered plaintext.
//!
//! Write path: HashRecord → canonical key (`krkn:<type>:<sha256 hex>`) → one atomic batch
//! (record + counters + registry) → engine
//! Read path:  key or prefix → point read / snapshot scan → lazy [`RecordIter`]
//!
//! ```no_run
//! use krkndb::{HashRecord, Store};
//!
//! let store = Store::open("./krkn-data", b"12345678901234567890123456789012")?;
//! store.store(&HashRecord::new("5f4dcc3b5aa765d61d8327deb882cf99", "password", 0))?;
//! let rec = store.query().get_by_original_hash("5f4dcc3b5aa765d61d8327deb882cf99", 0)?;
//! assert_eq!(rec.value(), "password");
//! store.close()?;
//! # Ok::<(), krkndb::KrknError>(())
//! ```

pub mod cipher;
pub mod config;
pub mod counter;
pub mod error;
pub mod keys;
pub mod kv;
pub mod query;
pub mod record;
pub mod redb_engine;
pub mod store;

pub use cipher::{EncryptionKey, ValueCipher};
pub use config::StoreOptions;
pub use counter::{CounterManager, CounterSnapshot};
pub use error::{KrknError, Result};
pub use kv::{BatchOp, KvCursor, KvEngine, MemoryKvEngine, ScanMode};
pub use query::{QueryEngine, RecordIter};
pub use record::{hash_types, HashRecord, HashType};
pub use redb_engine::RedbKvEngine;
pub use store::Store;
