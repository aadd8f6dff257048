//! Error types for the ledger engine
//!
//! Every failure belongs to one of five classes (see [`ErrorKind`]):
//!
//! - **Retryable** conflicts: nothing changed, reload and retry the command
//! - **Rejected**: a clean business rejection, safe to report to the caller
//! - **NotFound**: the thing does not exist yet
//! - **Fatal**: a logic defect or corruption; the pipeline must halt
//! - **System**: storage, I/O, configuration

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Optimistic concurrency conflict, no state changed
    Retryable,
    /// Business rejection, no state changed
    Rejected,
    /// Missing account, snapshot or aggregate
    NotFound,
    /// Invariant violation, pipeline must halt
    Fatal,
    /// Storage / infrastructure failure
    System,
}

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Event id already present in the store
    #[error("Duplicate event: {0}")]
    DuplicateEvent(Uuid),

    /// Per-aggregate version is not exactly current + 1
    #[error("Version conflict on aggregate {aggregate_id}: expected {expected}, got {actual}")]
    VersionConflict {
        /// Aggregate being appended to
        aggregate_id: String,
        /// Version the store would accept next
        expected: u64,
        /// Version carried by the rejected event
        actual: u64,
    },

    /// Applying the transaction would drive an account negative
    #[error("Insufficient funds in account {account_id}: balance {balance}, required {required}")]
    InsufficientFunds {
        /// Offending account
        account_id: String,
        /// Balance of the affected layer before the transaction
        balance: Decimal,
        /// Amount the transaction tried to take out
        required: Decimal,
    },

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account already exists
    #[error("Account already exists: {0}")]
    AccountExists(String),

    /// Account cannot take entries in its current status
    #[error("Account {account_id} is not open (status: {status})")]
    AccountNotActive {
        /// Account id
        account_id: String,
        /// Current status
        status: String,
    },

    /// Illegal account lifecycle transition
    #[error("Invalid status transition for account {account_id}: {from} -> {to}")]
    InvalidStatusTransition {
        /// Account id
        account_id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Snapshot not found
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Aggregate has no events
    #[error("Aggregate not found: {0}")]
    AggregateNotFound(String),

    /// Event refused before it reached the log (bad aggregate id, ...)
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Structurally invalid transaction (too few entries, bad amount, ...)
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Entries reference accounts of more than one asset
    #[error("Mixed assets in transaction {0}")]
    MixedAssets(String),

    /// Signed entries do not sum to zero
    #[error("Unbalanced transaction {transaction_id}: signed sum {sum}")]
    UnbalancedTransaction {
        /// Transaction id
        transaction_id: String,
        /// Non-zero signed sum
        sum: Decimal,
    },

    /// Event could not be translated into a transaction
    #[error("Translation failed for event {event_id}: {reason}")]
    Translation {
        /// Source event
        event_id: Uuid,
        /// What went wrong
        reason: String,
    },

    /// Pipeline is halted and refuses work until an operator resumes it
    #[error("Pipeline halted: {0}")]
    Halted(String),

    /// Downstream consumer did not accept an event in time
    #[error("Downstream consumer unresponsive after {0} ms")]
    ConsumerUnresponsive(u64),

    /// Reconciliation found divergence or could not run
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(String),

    /// Invariant violation (money conservation, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB, snapshot files)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateEvent(_) | Error::VersionConflict { .. } => ErrorKind::Retryable,
            Error::InsufficientFunds { .. }
            | Error::AccountNotActive { .. }
            | Error::AccountExists(_)
            | Error::InvalidStatusTransition { .. }
            | Error::InvalidTransaction(_)
            | Error::InvalidEvent(_)
            | Error::MixedAssets(_)
            | Error::Halted(_) => ErrorKind::Rejected,
            Error::AccountNotFound(_)
            | Error::SnapshotNotFound(_)
            | Error::AggregateNotFound(_) => ErrorKind::NotFound,
            Error::UnbalancedTransaction { .. }
            | Error::Translation { .. }
            | Error::ConsumerUnresponsive(_)
            | Error::ReconciliationFailed(_)
            | Error::InvariantViolation(_) => ErrorKind::Fatal,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Json(_)
            | Error::Concurrency(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::System,
        }
    }

    /// Caller should reload aggregate state and retry
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Logic defect or corruption: halt, don't retry
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// "Doesn't exist yet", as opposed to a storage failure
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::DuplicateEvent(Uuid::nil()).is_retryable());
        assert!(Error::VersionConflict {
            aggregate_id: "acct-1".into(),
            expected: 2,
            actual: 5,
        }
        .is_retryable());
        assert!(Error::AccountNotFound("A".into()).is_not_found());
        assert!(Error::ConsumerUnresponsive(30_000).is_fatal());
        assert_eq!(
            Error::InsufficientFunds {
                account_id: "A".into(),
                balance: Decimal::ZERO,
                required: Decimal::ONE,
            }
            .kind(),
            ErrorKind::Rejected
        );
        assert_eq!(Error::Storage("disk".into()).kind(), ErrorKind::System);
        assert_eq!(
            Error::InvalidEvent("a\0b".into()).kind(),
            ErrorKind::Rejected
        );
    }
}
