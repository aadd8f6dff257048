//! Ledger snapshots
//!
//! A snapshot is a full copy of account state plus the last global
//! sequence it includes. Files are named `snapshot-{sequence:020}.json`
//! so the latest one is the lexicographic maximum. Older snapshots are
//! superseded by newer ones and stay on disk.

use crate::{
    ledger::Ledger,
    types::{Account, AccountId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persisted snapshot format version
pub const SCHEMA_VERSION: &str = "1";

const PREFIX: &str = "snapshot-";
const SUFFIX: &str = ".json";

/// Point-in-time copy of the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last global sequence reflected in `accounts`
    pub last_sequence: u64,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Every account
    pub accounts: BTreeMap<AccountId, Account>,
    /// Format tag
    pub schema_version: String,
    /// Hex SHA-256 of the JSON-encoded accounts
    pub checksum: String,
}

impl Snapshot {
    /// Build a snapshot from accounts
    pub fn new(last_sequence: u64, accounts: BTreeMap<AccountId, Account>) -> Result<Self> {
        let checksum = accounts_checksum(&accounts)?;
        Ok(Self {
            last_sequence,
            timestamp: Utc::now(),
            accounts,
            schema_version: SCHEMA_VERSION.to_string(),
            checksum,
        })
    }

    /// Deep copy of the ledger at `last_sequence`
    pub fn capture(ledger: &Ledger, last_sequence: u64) -> Result<Self> {
        Self::new(last_sequence, ledger.accounts())
    }

    /// Check format tag and checksum
    pub fn verify(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(Error::Storage(format!(
                "snapshot {} has schema version {}, expected {}",
                self.last_sequence, self.schema_version, SCHEMA_VERSION
            )));
        }
        let actual = accounts_checksum(&self.accounts)?;
        if actual != self.checksum {
            return Err(Error::Storage(format!(
                "snapshot {} checksum mismatch",
                self.last_sequence
            )));
        }
        Ok(())
    }
}

fn accounts_checksum(accounts: &BTreeMap<AccountId, Account>) -> Result<String> {
    let encoded = serde_json::to_vec(accounts)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// content, never a partial file
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;

    // Persist the rename itself
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            File::open(dir)?.sync_all()?;
        }
    }
    Ok(())
}

/// Snapshot persistence
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot
    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Highest-sequence snapshot, `None` when there are none
    fn load_latest(&self) -> Result<Option<Snapshot>>;

    /// Snapshot at exactly `sequence`
    fn load(&self, sequence: u64) -> Result<Snapshot>;

    /// Sequences of every stored snapshot, ascending
    fn list(&self) -> Result<Vec<u64>>;
}

/// Directory of JSON snapshot files
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Open (creating if needed) a snapshot directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the snapshots
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{}{:020}{}", PREFIX, sequence, SUFFIX))
    }

    fn read(&self, path: &Path) -> Result<Snapshot> {
        let bytes = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        snapshot.verify()?;
        Ok(snapshot)
    }

    /// Delete all but the newest `keep` snapshots; returns how many went
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let sequences = self.list()?;
        let excess = sequences.len().saturating_sub(keep);
        for sequence in &sequences[..excess] {
            fs::remove_file(self.path_for(*sequence))?;
        }
        if excess > 0 {
            tracing::info!(removed = excess, kept = keep, "Pruned old snapshots");
        }
        Ok(excess)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path_for(snapshot.last_sequence), &bytes)?;

        tracing::info!(
            last_sequence = snapshot.last_sequence,
            accounts = snapshot.accounts.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<Snapshot>> {
        match self.list()?.last() {
            Some(sequence) => self.read(&self.path_for(*sequence)).map(Some),
            None => Ok(None),
        }
    }

    fn load(&self, sequence: u64) -> Result<Snapshot> {
        let path = self.path_for(sequence);
        if !path.exists() {
            return Err(Error::SnapshotNotFound(sequence.to_string()));
        }
        self.read(&path)
    }

    fn list(&self) -> Result<Vec<u64>> {
        let mut sequences = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(digits) = name
                .strip_prefix(PREFIX)
                .and_then(|rest| rest.strip_suffix(SUFFIX))
            else {
                continue;
            };
            if let Ok(sequence) = digits.parse::<u64>() {
                sequences.push(sequence);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }
}

/// Takes a snapshot every `interval` applied events
pub struct Snapshotter {
    store: Arc<dyn SnapshotStore>,
    interval: u64,
    since_last: u64,
}

impl Snapshotter {
    /// Create snapshotter
    pub fn new(store: Arc<dyn SnapshotStore>, interval: u64) -> Self {
        Self {
            store,
            interval: interval.max(1),
            since_last: 0,
        }
    }

    /// Count one applied event; true when a snapshot is due
    pub fn record_applied(&mut self) -> bool {
        self.since_last += 1;
        self.since_last >= self.interval
    }

    /// Snapshot the ledger if due
    pub fn maybe_snapshot(&mut self, ledger: &Ledger, sequence: u64) -> Result<Option<Snapshot>> {
        if !self.record_applied() {
            return Ok(None);
        }
        self.snapshot_now(ledger, sequence).map(Some)
    }

    /// Snapshot unconditionally and reset the cadence
    pub fn snapshot_now(&mut self, ledger: &Ledger, sequence: u64) -> Result<Snapshot> {
        let snapshot = Snapshot::capture(ledger, sequence)?;
        self.store.save(&snapshot)?;
        self.since_last = 0;
        Ok(snapshot)
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }
}

impl std::fmt::Debug for Snapshotter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshotter")
            .field("interval", &self.interval)
            .field("since_last", &self.since_last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountType, Asset, Transaction, TransactionId};
    use rust_decimal::Decimal;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn ledger() -> Ledger {
        let ledger = Ledger::new();
        for (id, ty) in [("cash", AccountType::Asset), ("A", AccountType::Liability)] {
            ledger.create_account(id.into(), Asset::USD, ty).unwrap();
            ledger.open_account(&id.into()).unwrap();
        }
        let tx = Transaction::builder(TransactionId::from_uuid(Uuid::new_v4()))
            .debit("cash", Decimal::from(75))
            .credit("A", Decimal::from(75))
            .build();
        ledger.apply_transaction(tx).unwrap();
        ledger
    }

    #[test]
    fn test_save_and_load_latest() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        let ledger = ledger();

        let older = Snapshot::capture(&ledger, 9).unwrap();
        let newer = Snapshot::capture(&ledger, 10).unwrap();
        store.save(&newer).unwrap();
        store.save(&older).unwrap();

        // Zero padding keeps 10 after 9
        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest, newer);
        assert_eq!(store.list().unwrap(), vec![9, 10]);
        assert_eq!(store.load(9).unwrap().last_sequence, 9);
    }

    #[test]
    fn test_empty_store_has_no_latest() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path().join("snaps")).unwrap();
        assert!(store.load_latest().unwrap().is_none());
        assert!(matches!(store.load(1), Err(Error::SnapshotNotFound(_))));
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        let mut snapshot = Snapshot::capture(&ledger(), 3).unwrap();
        if let Some(account) = snapshot.accounts.get_mut(&AccountId::new("A")) {
            account.balance = Decimal::from(1_000_000);
        }
        store.save(&snapshot).unwrap();

        assert!(matches!(store.load_latest(), Err(Error::Storage(_))));
    }

    #[test]
    fn test_leftover_tmp_file_ignored() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        store.save(&Snapshot::capture(&ledger(), 5).unwrap()).unwrap();
        fs::write(dir.path().join("snapshot-00000000000000000006.tmp"), b"{trunc").unwrap();

        assert_eq!(store.load_latest().unwrap().unwrap().last_sequence, 5);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        let ledger = ledger();
        for seq in [1, 2, 3, 4] {
            store.save(&Snapshot::capture(&ledger, seq).unwrap()).unwrap();
        }
        assert_eq!(store.prune(2).unwrap(), 2);
        assert_eq!(store.list().unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_snapshotter_cadence() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let mut snapshotter = Snapshotter::new(store.clone(), 3);
        let ledger = ledger();

        assert!(snapshotter.maybe_snapshot(&ledger, 1).unwrap().is_none());
        assert!(snapshotter.maybe_snapshot(&ledger, 2).unwrap().is_none());
        let taken = snapshotter.maybe_snapshot(&ledger, 3).unwrap().unwrap();
        assert_eq!(taken.last_sequence, 3);
        assert!(snapshotter.maybe_snapshot(&ledger, 4).unwrap().is_none());
        assert_eq!(store.list().unwrap(), vec![3]);
    }
}
