//! RocksDB-backed local cache.
//!
//! Column families:
//! - `documents`: encoded document state, LZ4 compressed, keyed by path
//! - `metadata`: [`CacheMetadata`] (bincode), keyed by path
//!
//! State and metadata are written in one atomic batch, so a crash never
//! leaves metadata describing a state that is not there.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{CacheError, LocalCache};
use crate::origin::DocPath;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, the cache is the offline backstop)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_cache"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each cached state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Uncompressed state size in bytes
    pub state_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub saved_at: u64,
}

impl CacheMetadata {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CacheError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

pub struct RocksCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
}

impl RocksCache {
    /// Open (or create) the cache at the configured path.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("local cache opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &CacheConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn metadata(&self, path: &DocPath) -> Result<Option<CacheMetadata>, CacheError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, path.as_str().as_bytes())? {
            Some(bytes) => CacheMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CacheError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl LocalCache for RocksCache {
    fn get(&self, path: &DocPath) -> Result<Option<Vec<u8>>, CacheError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, path.as_str().as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| CacheError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, path: &DocPath, state: &[u8]) -> Result<(), CacheError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);
        let meta = CacheMetadata {
            state_size: state.len() as u64,
            compressed_size: compressed.len() as u64,
            saved_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let key = path.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, key, &compressed);
        batch.put_cf(cf_meta, key, meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn delete(&self, path: &DocPath) -> Result<(), CacheError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let key = path.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, key);
        batch.delete_cf(cf_meta, key);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        let path = DocPath::from("stories/one");
        let state = b"encoded document state, long enough to be worth compressing ".repeat(8);

        cache.set(&path, &state).unwrap();
        assert_eq!(cache.get(&path).unwrap(), Some(state.clone()));

        let meta = cache.metadata(&path).unwrap().unwrap();
        assert_eq!(meta.state_size, state.len() as u64);
        assert!(meta.compressed_size < meta.state_size);
    }

    #[test]
    fn test_delete_removes_state_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        let path = DocPath::from("stories/two");

        cache.set(&path, b"state").unwrap();
        cache.delete(&path).unwrap();
        assert_eq!(cache.get(&path).unwrap(), None);
        assert_eq!(cache.metadata(&path).unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = DocPath::from("stories/three");
        {
            let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
            cache.set(&path, b"persisted").unwrap();
        }
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        assert_eq!(cache.get(&path).unwrap().as_deref(), Some(&b"persisted"[..]));
        assert!(cache.path().exists());
    }
}
