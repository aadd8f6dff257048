//! Event-sourced double-entry ledger core
//!
//! Turns an unordered stream of domain events into a consistent,
//! auditable, recoverable ledger.
//!
//! # Architecture
//!
//! - **Event Store**: append-only log, global sequence, per-aggregate
//!   optimistic concurrency
//! - **Sequencer**: re-emits events in strict sequence, buffering gaps
//! - **Projector**: deterministic event → balanced transaction translation
//! - **Ledger**: sole writer of account state; validate, then mutate
//! - **Snapshot/Checkpoint**: crash-safe recovery without full replay
//! - **Reconciler**: audits the ledger against an independent projection
//!
//! # Invariants
//!
//! - Money conservation: every posted transaction's signed entries sum to zero
//! - Deterministic replay: same events → same state
//! - Append-only: events are never modified or deleted
//! - Fail-closed: invariant breaches halt the pipeline until an operator resumes

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod event_store;
pub mod halt;
pub mod ledger;
pub mod metrics;
pub mod projection;
pub mod projector;
pub mod reconciler;
pub mod sequencer;
pub mod snapshot;
pub mod storage;
pub mod types;

// Re-exports
pub use bus::{EventBus, EventSubscriber};
pub use config::Config;
pub use engine::{EngineStatus, LedgerEngine};
pub use error::{Error, ErrorKind, Result};
pub use event::{Event, EventPayload, EventType};
pub use event_store::{EventStore, InMemoryEventStore};
pub use halt::{HaltReason, HaltSwitch, PipelineStatus};
pub use ledger::{ApplyOutcome, Ledger};
pub use projection::BalanceProjection;
pub use projector::{ProjectionOutcome, Projector};
pub use reconciler::{Reconciler, ReconciliationReport};
pub use sequencer::Sequencer;
pub use snapshot::{Snapshot, SnapshotStore};
pub use storage::RocksEventStore;
pub use types::{
    Account, AccountId, AccountStatus, AccountType, Asset, Direction, Entry, EntryLayer,
    Transaction, TransactionId, TransactionStatus,
};
