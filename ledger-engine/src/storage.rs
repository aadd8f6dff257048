//! Durable event store on RocksDB
//!
//! # Column Families
//!
//! - `events` - Append-only event log (key: big-endian global sequence)
//! - `event_ids` - Duplicate detection (key: event_id, value: sequence)
//! - `aggregates` - Per-aggregate index (key: aggregate_id || 0x00 || version)
//! - `meta` - Store metadata (`last_sequence`)
//!
//! Each append is one `WriteBatch`, so the event, both index entries and the
//! metadata land together or not at all.

use crate::{
    config::Config,
    error::{Error, Result},
    event::Event,
    event_store::{check_aggregate_id, check_version, effective_limit, EventStore},
};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use std::path::Path;
use std::sync::Arc;

/// Column family names
const CF_EVENTS: &str = "events";
const CF_EVENT_IDS: &str = "event_ids";
const CF_AGGREGATES: &str = "aggregates";
const CF_META: &str = "meta";

const META_LAST_SEQUENCE: &[u8] = b"last_sequence";

/// Separator between aggregate id and version in index keys
const AGGREGATE_SEPARATOR: u8 = 0x00;

/// Event store backed by RocksDB
pub struct RocksEventStore {
    db: Arc<DB>,
    /// Last assigned sequence; the mutex also serializes appends
    append_lock: Mutex<u64>,
    max_load_limit: usize,
    sync_writes: bool,
}

impl RocksEventStore {
    /// Open or create the event log under `config.event_store_dir()`
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_at(&config.event_store_dir(), config)
    }

    /// Open at an explicit path, using `config` for tuning
    pub fn open_at(path: &Path, config: &Config) -> Result<Self> {
        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Universal compaction for write-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_EVENT_IDS, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_AGGREGATES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let store = Self {
            db: Arc::new(db),
            append_lock: Mutex::new(0),
            max_load_limit: config.event_store.max_load_limit.max(1),
            sync_writes: config.rocksdb.sync_writes,
        };

        let last = store.read_last_sequence()?;
        *store.append_lock.lock() = last;

        tracing::info!(path = ?path, last_sequence = last, "Opened RocksDB event store");

        Ok(store)
    }

    // Column family options

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Indices benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Key helpers

    fn aggregate_prefix(aggregate_id: &str) -> Vec<u8> {
        let mut key = aggregate_id.as_bytes().to_vec();
        key.push(AGGREGATE_SEPARATOR);
        key
    }

    fn aggregate_key(aggregate_id: &str, version: u64) -> Vec<u8> {
        let mut key = Self::aggregate_prefix(aggregate_id);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn decode_u64(bytes: &[u8]) -> Result<u64> {
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Storage(format!("expected 8-byte key, got {}", bytes.len())))?;
        Ok(u64::from_be_bytes(array))
    }

    /// Last sequence from the log's last key, cross-checked against `meta`
    fn read_last_sequence(&self) -> Result<u64> {
        let cf = self.cf(CF_EVENTS)?;
        let from_log = match self.db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                Self::decode_u64(&key)?
            }
            None => 0,
        };

        let cf_meta = self.cf(CF_META)?;
        if let Some(bytes) = self.db.get_cf(&cf_meta, META_LAST_SEQUENCE)? {
            let recorded = Self::decode_u64(&bytes)?;
            if recorded != from_log {
                return Err(Error::Storage(format!(
                    "event log ends at {} but metadata records {}",
                    from_log, recorded
                )));
            }
        }
        Ok(from_log)
    }

    fn read_aggregate_version(&self, aggregate_id: &str) -> Result<u64> {
        let cf = self.cf(CF_AGGREGATES)?;
        let prefix = Self::aggregate_prefix(aggregate_id);
        let upper = Self::aggregate_key(aggregate_id, u64::MAX);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            return Self::decode_u64(&key[prefix.len()..]);
        }
        Ok(0)
    }

    fn get_event_at(&self, sequence: u64) -> Result<Event> {
        let cf = self.cf(CF_EVENTS)?;
        let value = self
            .db
            .get_cf(&cf, sequence.to_be_bytes())?
            .ok_or_else(|| Error::Storage(format!("event at sequence {} missing", sequence)))?;
        Ok(bincode::deserialize(&value)?)
    }
}

impl EventStore for RocksEventStore {
    fn append(&self, event: Event) -> Result<u64> {
        check_aggregate_id(&event)?;

        let mut last = self.append_lock.lock();

        let cf_ids = self.cf(CF_EVENT_IDS)?;
        if self.db.get_cf(&cf_ids, event.id.as_bytes())?.is_some() {
            return Err(Error::DuplicateEvent(event.id));
        }

        let current = self.read_aggregate_version(&event.aggregate_id)?;
        check_version(&event, current)?;

        let sequence = *last + 1;
        let event = event.with_sequence(sequence);
        let seq_bytes = sequence.to_be_bytes();

        let mut batch = WriteBatch::default();
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_aggregates = self.cf(CF_AGGREGATES)?;
        let cf_meta = self.cf(CF_META)?;
        batch.put_cf(&cf_events, seq_bytes, bincode::serialize(&event)?);
        batch.put_cf(&cf_ids, event.id.as_bytes(), seq_bytes);
        batch.put_cf(
            &cf_aggregates,
            Self::aggregate_key(&event.aggregate_id, event.version),
            seq_bytes,
        );
        batch.put_cf(&cf_meta, META_LAST_SEQUENCE, seq_bytes);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);

        // Atomic commit
        self.db.write_opt(batch, &write_opts)?;
        *last = sequence;

        tracing::debug!(
            event_id = %event.id,
            aggregate_id = %event.aggregate_id,
            version = event.version,
            sequence,
            "Event appended"
        );

        Ok(sequence)
    }

    fn load(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        let cf = self.cf(CF_EVENTS)?;
        let limit = effective_limit(limit, self.max_load_limit);
        let start = after.saturating_add(1).to_be_bytes();

        let mut events = Vec::with_capacity(limit.min(64));
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
            .take(limit)
        {
            let (_, value) = item?;
            events.push(bincode::deserialize(&value)?);
        }
        Ok(events)
    }

    fn load_by_aggregate(&self, aggregate_id: &str, after: u64) -> Result<Vec<Event>> {
        if self.read_aggregate_version(aggregate_id)? == 0 {
            return Err(Error::AggregateNotFound(aggregate_id.to_string()));
        }

        let cf = self.cf(CF_AGGREGATES)?;
        let prefix = Self::aggregate_prefix(aggregate_id);
        let start = Self::aggregate_key(aggregate_id, after.saturating_add(1));

        let mut events = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            events.push(self.get_event_at(Self::decode_u64(&value)?)?);
        }
        Ok(events)
    }

    fn last_sequence(&self) -> Result<u64> {
        Ok(*self.append_lock.lock())
    }

    fn aggregate_version(&self, aggregate_id: &str) -> Result<u64> {
        self.read_aggregate_version(aggregate_id)
    }
}

impl std::fmt::Debug for RocksEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksEventStore")
            .field("path", &self.db.path())
            .field("max_load_limit", &self.max_load_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (config, temp_dir)
    }

    fn note(aggregate: &str, version: u64) -> Event {
        Event::new(
            aggregate,
            version,
            EventPayload::Annotated {
                note: "test".to_string(),
            },
        )
    }

    #[test]
    fn test_append_and_load() {
        let (config, _temp) = test_config();
        let store = RocksEventStore::open(&config).unwrap();

        assert_eq!(store.append(note("a", 1)).unwrap(), 1);
        assert_eq!(store.append(note("b", 1)).unwrap(), 2);
        assert_eq!(store.append(note("a", 2)).unwrap(), 3);

        let events = store.load(1, 10).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_duplicate_and_conflict() {
        let (config, _temp) = test_config();
        let store = RocksEventStore::open(&config).unwrap();

        let event = note("a", 1);
        store.append(event.clone()).unwrap();

        assert!(matches!(
            store.append(event).unwrap_err(),
            Error::DuplicateEvent(_)
        ));
        assert!(matches!(
            store.append(note("a", 5)).unwrap_err(),
            Error::VersionConflict { expected: 2, actual: 5, .. }
        ));
        assert_eq!(store.last_sequence().unwrap(), 1);
    }

    #[test]
    fn test_aggregate_prefixes_do_not_collide() {
        let (config, _temp) = test_config();
        let store = RocksEventStore::open(&config).unwrap();

        store.append(note("acct", 1)).unwrap();
        store.append(note("acct-2", 1)).unwrap();
        store.append(note("acct", 2)).unwrap();

        assert_eq!(store.aggregate_version("acct").unwrap(), 2);
        assert_eq!(store.aggregate_version("acct-2").unwrap(), 1);

        let history = store.load_by_aggregate("acct", 0).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.aggregate_id == "acct"));
        assert_eq!(store.load_by_aggregate("acct", 1).unwrap().len(), 1);
        assert!(store.load_by_aggregate("nobody", 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_nul_in_aggregate_id_is_rejected() {
        let (config, _temp) = test_config();
        let store = RocksEventStore::open(&config).unwrap();

        let err = store.append(note("acct\0x", 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Rejected);
        assert_eq!(store.last_sequence().unwrap(), 0);
    }

    #[test]
    fn test_reopen_recovers_last_sequence() {
        let (config, _temp) = test_config();
        {
            let store = RocksEventStore::open(&config).unwrap();
            store.append(note("a", 1)).unwrap();
            store.append(note("a", 2)).unwrap();
        }

        let store = RocksEventStore::open(&config).unwrap();
        assert_eq!(store.last_sequence().unwrap(), 2);
        assert_eq!(store.append(note("a", 3)).unwrap(), 3);
    }
}
