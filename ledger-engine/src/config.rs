//! Configuration for the ledger engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory (RocksDB, snapshots, checkpoint)
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Event store configuration
    pub event_store: EventStoreConfig,

    /// Sequencer configuration
    pub sequencer: SequencerConfig,

    /// Snapshot configuration
    pub snapshot: SnapshotConfig,

    /// Checkpoint configuration
    pub checkpoint: CheckpointConfig,

    /// Reconciler configuration
    pub reconciler: ReconcilerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            event_store: EventStoreConfig::default(),
            sequencer: SequencerConfig::default(),
            snapshot: SnapshotConfig::default(),
            checkpoint: CheckpointConfig::default(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync every append batch
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
        }
    }
}

/// Where events are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStoreBackend {
    /// Process memory (tests, embedding)
    InMemory,
    /// RocksDB under `data_dir/events`
    RocksDb,
}

/// Event store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    /// Backend
    pub backend: EventStoreBackend,

    /// Hard cap on events returned by one `load`
    pub max_load_limit: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            backend: EventStoreBackend::RocksDb,
            max_load_limit: crate::event_store::MAX_LOAD_LIMIT,
        }
    }
}

/// Sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Actor mailbox capacity
    pub mailbox_capacity: usize,

    /// Ordered-event channel capacity towards the apply worker
    pub downstream_capacity: usize,

    /// How long an emit may wait on a stalled consumer (milliseconds)
    pub emit_timeout_ms: u64,

    /// Pending-buffer depth that triggers a stuck-producer warning
    pub buffer_warn_depth: usize,
}

impl SequencerConfig {
    /// Emit timeout as a `Duration`
    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            downstream_capacity: 1000,
            emit_timeout_ms: 30_000,
            buffer_warn_depth: 10_000,
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshot every N applied events
    pub interval_events: u64,

    /// Directory (relative paths resolve under `data_dir`)
    pub dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_events: 1_000,
            dir: PathBuf::from("snapshots"),
        }
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// File path (relative paths resolve under `data_dir`)
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("checkpoint"),
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Seconds between audits
    pub interval_secs: u64,
}

impl ReconcilerConfig {
    /// Interval as a `Duration`
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(interval) = std::env::var("LEDGER_SNAPSHOT_INTERVAL") {
            config.snapshot.interval_events = parse_env("LEDGER_SNAPSHOT_INTERVAL", &interval)?;
        }

        if let Ok(timeout) = std::env::var("LEDGER_EMIT_TIMEOUT_MS") {
            config.sequencer.emit_timeout_ms = parse_env("LEDGER_EMIT_TIMEOUT_MS", &timeout)?;
        }

        if let Ok(interval) = std::env::var("LEDGER_RECONCILE_INTERVAL_SECS") {
            config.reconciler.interval_secs =
                parse_env("LEDGER_RECONCILE_INTERVAL_SECS", &interval)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let checks = [
            (self.sequencer.mailbox_capacity == 0, "sequencer.mailbox_capacity"),
            (self.sequencer.downstream_capacity == 0, "sequencer.downstream_capacity"),
            (self.sequencer.emit_timeout_ms == 0, "sequencer.emit_timeout_ms"),
            (self.snapshot.interval_events == 0, "snapshot.interval_events"),
            (self.reconciler.interval_secs == 0, "reconciler.interval_secs"),
            (self.event_store.max_load_limit == 0, "event_store.max_load_limit"),
        ];

        for (is_zero, name) in checks {
            if is_zero {
                return Err(crate::Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// Resolved snapshot directory
    pub fn snapshot_dir(&self) -> PathBuf {
        self.resolve(&self.snapshot.dir)
    }

    /// Resolved checkpoint file
    pub fn checkpoint_path(&self) -> PathBuf {
        self.resolve(&self.checkpoint.path)
    }

    /// RocksDB directory for the event log
    pub fn event_store_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{} is not a valid number: {}", name, value)))
}
