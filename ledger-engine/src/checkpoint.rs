//! Stream position persistence and recovery planning
//!
//! The checkpoint is one decimal number in a text file: the last global
//! sequence applied to the ledger. It only ever moves forward.

use crate::{snapshot::write_atomic, Error, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Durable last-applied sequence
pub trait CheckpointStore: Send + Sync {
    /// Last applied sequence, `None` if nothing was ever applied
    fn load(&self) -> Result<Option<u64>>;

    /// Record `sequence` as applied
    fn save(&self, sequence: u64) -> Result<()>;
}

/// Plain-text checkpoint file
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    last_saved: Mutex<Option<u64>>,
}

impl FileCheckpointStore {
    /// Open a checkpoint file, creating its directory
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let last_saved = read_checkpoint(&path)?;
        Ok(Self {
            path,
            last_saved: Mutex::new(last_saved),
        })
    }

    /// Checkpoint file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_checkpoint(path: &Path) -> Result<Option<u64>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    text.trim().parse::<u64>().map(Some).map_err(|_| {
        Error::Storage(format!(
            "checkpoint {} is corrupt: {:?}",
            path.display(),
            text.trim()
        ))
    })
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<u64>> {
        read_checkpoint(&self.path)
    }

    fn save(&self, sequence: u64) -> Result<()> {
        let mut last_saved = self.last_saved.lock();
        if let Some(previous) = *last_saved {
            if sequence < previous {
                return Err(Error::InvariantViolation(format!(
                    "checkpoint would move backwards from {} to {}",
                    previous, sequence
                )));
            }
            if sequence == previous {
                return Ok(());
            }
        }

        write_atomic(&self.path, sequence.to_string().as_bytes())?;
        *last_saved = Some(sequence);

        tracing::trace!(sequence, "Checkpoint saved");
        Ok(())
    }
}

/// Where recovery starts and what it replays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Snapshot to restore, if any
    pub restore_from: Option<u64>,
    /// Events already applied before the crash but newer than the snapshot.
    /// They are replayed into the ledger without checkpointing, publishing
    /// or re-dispatching.
    pub replay: Option<RangeInclusive<u64>>,
    /// First sequence the live pipeline expects
    pub resume_from: u64,
}

impl RecoveryPlan {
    /// Plan recovery from a checkpoint and the latest snapshot's sequence
    pub fn compute(checkpoint: Option<u64>, snapshot_sequence: Option<u64>) -> Self {
        let applied = checkpoint.unwrap_or(0);
        let snapshot = snapshot_sequence.unwrap_or(0);

        let replay = (applied > snapshot).then(|| (snapshot + 1)..=applied);

        Self {
            restore_from: snapshot_sequence,
            replay,
            resume_from: applied.max(snapshot) + 1,
        }
    }
}
