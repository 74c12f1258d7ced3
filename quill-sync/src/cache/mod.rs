//! Local durable cache.
//!
//! Holds the full encoded document state per path so edits survive a crash
//! or an offline session. The router writes it after every processed update,
//! replays it at session start, and clears it once the remote store has
//! accepted a save.
//!
//! ```text
//! ┌──────────────┐  set(path, state)   ┌────────────────────────────┐
//! │ Update Router│ ──────────────────► │ LocalCache                 │
//! │              │ ◄── get at start ── │  MemoryCache (tests)       │
//! │              │ ── delete on save ► │  RocksCache  (LZ4, RocksDB)│
//! └──────────────┘                     └────────────────────────────┘
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemoryCache;
pub use rocks::{CacheConfig, CacheMetadata, RocksCache};

use thiserror::Error;

use crate::origin::DocPath;

/// Key-value store of encoded document state, keyed by document path.
///
/// Calls are synchronous and expected to be fast (local disk).
pub trait LocalCache: Send + Sync {
    fn get(&self, path: &DocPath) -> Result<Option<Vec<u8>>, CacheError>;
    fn set(&self, path: &DocPath, state: &[u8]) -> Result<(), CacheError>;
    fn delete(&self, path: &DocPath) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}
