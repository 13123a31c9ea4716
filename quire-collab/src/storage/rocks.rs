//! RocksDB-backed document store.
//!
//! A single column family `documents` holds every key. Values are the JSON
//! encoding of the stored value, LZ4 compressed with the size prepended.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{DocStore, StoreError};

const CF_DOCUMENTS: &str = "documents";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable [`DocStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column family if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf = ColumnFamilyDescriptor::new(CF_DOCUMENTS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![cf],
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 blocks.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_DOCUMENTS)
            .ok_or(StoreError::MissingColumnFamily(CF_DOCUMENTS))
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl DocStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let raw = serde_json::to_vec(&value)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key.as_bytes(), compressed, &write_opts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{load_ops, persist_ops};
    use quire_core::{OpId, Operation, Position};
    use serde_json::json;

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let value = json!([{"a": 1}, "x".repeat(512)]);
        store.set("k", value.clone()).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(value));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let ops = vec![Operation::insert("d", OpId::new("s", 0), Position::new(vec![2]), 'z')];
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            persist_ops(&store, "d", &ops);
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(load_ops(&store, "d"), ops);
    }

    #[test]
    fn test_corrupt_value_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let key = crate::storage::ops_key("d");
        let cf = store.cf().unwrap();
        store.db.put_cf(cf, key.as_bytes(), [10, 0, 0, 0, 0xff]).unwrap();
        assert!(store.get(&key).is_err());
        assert!(load_ops(&store, "d").is_empty());
    }
}
