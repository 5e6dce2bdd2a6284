//! RocksDB-backed append-only snapshot store.
//!
//! Column families:
//! - `snapshots` — full document state, LZ4 compressed
//! - `meta`      — per-version metadata (bincode)
//!
//! Key format: `<room id bytes> 0x00 <version id bytes>`. Version ids are
//! ISO-8601 UTC timestamps with microsecond precision, so lexicographic key
//! order within a room equals chronological order, and "latest" is one
//! reverse seek away. Room ids therefore must not contain NUL bytes.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_META];

/// Key separator between room id and version id.
const KEY_SEPARATOR: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("kn_collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
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

/// Immutable metadata of one stored version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMeta {
    /// Timestamp-derived version id (ISO-8601 UTC).
    pub id: String,
    /// Uncompressed payload size in bytes.
    pub size: u64,
    /// Compressed size on disk.
    pub compressed_size: u64,
    /// Creation time (seconds since epoch).
    pub created_at: u64,
    /// Document logical clock at snapshot time, when known.
    pub doc_clock: Option<u64>,
}

impl VersionMeta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// A version with this id already exists (store is append-only)
    AlreadyExists(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Room id contains a NUL byte
    InvalidRoomId(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::AlreadyExists(id) => write!(f, "Version already exists: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::InvalidRoomId(id) => write!(f, "Invalid room id: {id:?}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Append-only, timestamp-keyed snapshot store.
pub struct VersionStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl VersionStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed by us before insertion.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts
    }

    // ─── Write path ───────────────────────────────────────────────────

    /// Write a new immutable snapshot with a generated timestamp id.
    pub fn save(
        &self,
        room_id: &str,
        payload: &[u8],
        doc_clock: Option<u64>,
    ) -> Result<VersionMeta, StoreError> {
        let mut id = Self::generate_id();
        // Two saves inside the same microsecond get a disambiguating suffix.
        let mut attempt = 0u32;
        while self.meta_exists(room_id, &id)? {
            attempt += 1;
            id = format!("{}-{attempt}", Self::generate_id());
        }
        self.save_with_id(room_id, &id, payload, doc_clock)
    }

    /// Write a new immutable snapshot under an explicit id.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the id is taken —
    /// versions are never overwritten.
    pub fn save_with_id(
        &self,
        room_id: &str,
        id: &str,
        payload: &[u8],
        doc_clock: Option<u64>,
    ) -> Result<VersionMeta, StoreError> {
        if self.meta_exists(room_id, id)? {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }

        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(payload);
        let meta = VersionMeta {
            id: id.to_string(),
            size: payload.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at: epoch_secs(),
            doc_clock,
        };

        let key = Self::version_key(room_id, id)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    // ─── Read path ────────────────────────────────────────────────────

    /// Payload of the most recent snapshot, or `None` for a fresh room.
    pub fn load_latest(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = Self::room_prefix(room_id)?;

        // Latest = last key under the room prefix: seek to the prefix upper
        // bound and walk backward one step.
        let upper = Self::prefix_upper_bound(room_id)?;
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
                if !key.starts_with(&prefix) {
                    return Ok(None);
                }
                let payload = lz4_flex::decompress_size_prepended(&value)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    /// Version metadata for a room, most recent first, capped at `limit`.
    pub fn list(&self, room_id: &str, limit: usize) -> Result<Vec<VersionMeta>, StoreError> {
        let cf = self.cf(CF_META)?;
        let prefix = Self::room_prefix(room_id)?;
        let upper = Self::prefix_upper_bound(room_id)?;

        let mut versions = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));

        for item in iter {
            if versions.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            versions.push(VersionMeta::decode(&value)?);
        }

        Ok(versions)
    }

    /// Fetch one snapshot by id.
    pub fn load(
        &self,
        room_id: &str,
        id: &str,
    ) -> Result<Option<(VersionMeta, Vec<u8>)>, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;
        let key = Self::version_key(room_id, id)?;

        let meta_bytes = match self.db.get_cf(&cf_meta, &key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let payload_bytes = match self.db.get_cf(&cf_snapshots, &key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let meta = VersionMeta::decode(&meta_bytes)?;
        let payload = lz4_flex::decompress_size_prepended(&payload_bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        Ok(Some((meta, payload)))
    }

    /// Number of versions stored for a room.
    pub fn count(&self, room_id: &str) -> Result<usize, StoreError> {
        Ok(self.list(room_id, usize::MAX)?.len())
    }

    // ─── Keys ─────────────────────────────────────────────────────────

    fn version_key(room_id: &str, id: &str) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::room_prefix(room_id)?;
        key.extend_from_slice(id.as_bytes());
        Ok(key)
    }

    fn room_prefix(room_id: &str) -> Result<Vec<u8>, StoreError> {
        if room_id.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(StoreError::InvalidRoomId(room_id.to_string()));
        }
        let mut prefix = Vec::with_capacity(room_id.len() + 1);
        prefix.extend_from_slice(room_id.as_bytes());
        prefix.push(KEY_SEPARATOR);
        Ok(prefix)
    }

    /// First key lexicographically greater than any key under the room
    /// prefix (separator 0x00 bumped to 0x01).
    fn prefix_upper_bound(room_id: &str) -> Result<Vec<u8>, StoreError> {
        let mut bound = Self::room_prefix(room_id)?;
        if let Some(last) = bound.last_mut() {
            *last = KEY_SEPARATOR + 1;
        }
        Ok(bound)
    }

    fn meta_exists(&self, room_id: &str, id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_META)?;
        let key = Self::version_key(room_id, id)?;
        Ok(self.db.get_cf(&cf, &key)?.is_some())
    }

    fn generate_id() -> String {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string()
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family {name}")))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
