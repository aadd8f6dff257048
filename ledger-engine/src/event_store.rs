//! Append-only event store
//!
//! The store assigns the global sequence and enforces per-aggregate
//! optimistic concurrency. An append is all-or-nothing: either the event,
//! its id index and its aggregate index become visible together, or none of
//! them do.
//!
//! # Implementations
//!
//! - [`InMemoryEventStore`]: process memory, for tests and embedding
//! - [`crate::storage::RocksEventStore`]: durable, RocksDB column families

use crate::{event::Event, Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Hard cap on the number of events a single `load` returns
pub const MAX_LOAD_LIMIT: usize = 1000;

/// Append-only log with global ordering and per-aggregate versions
pub trait EventStore: Send + Sync {
    /// Append an event and return its global sequence
    ///
    /// # Errors
    ///
    /// - `DuplicateEvent`: the event id is already stored
    /// - `VersionConflict`: `event.version` is not the aggregate's current
    ///   version plus one
    fn append(&self, event: Event) -> Result<u64>;

    /// Events with sequence strictly greater than `after`, at most `limit`
    /// of them (`0` or anything above the store's cap means the cap)
    fn load(&self, after: u64, limit: usize) -> Result<Vec<Event>>;

    /// One aggregate's events with version strictly greater than `after`
    ///
    /// Returns `AggregateNotFound` if the aggregate has never been written.
    fn load_by_aggregate(&self, aggregate_id: &str, after: u64) -> Result<Vec<Event>>;

    /// Highest assigned sequence (0 when empty)
    fn last_sequence(&self) -> Result<u64>;

    /// Highest version of an aggregate (0 when unknown)
    fn aggregate_version(&self, aggregate_id: &str) -> Result<u64>;
}

/// Clamp a requested limit to the store's cap
pub(crate) fn effective_limit(requested: usize, cap: usize) -> usize {
    if requested == 0 || requested > cap {
        cap
    } else {
        requested
    }
}

/// Aggregate ids are index-key prefixes and must not contain NUL
pub(crate) fn check_aggregate_id(event: &Event) -> Result<()> {
    if event.aggregate_id.as_bytes().contains(&0x00) {
        return Err(Error::InvalidEvent(format!(
            "aggregate id {:?} contains a NUL byte",
            event.aggregate_id
        )));
    }
    Ok(())
}

/// Check the optimistic-concurrency rule for one append
pub(crate) fn check_version(event: &Event, current: u64) -> Result<()> {
    let expected = current + 1;
    if event.version != expected {
        return Err(Error::VersionConflict {
            aggregate_id: event.aggregate_id.clone(),
            expected,
            actual: event.version,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryLog {
    /// Event with sequence `n` lives at index `n - 1`
    events: Vec<Event>,
    by_id: HashMap<Uuid, u64>,
    /// Sequences per aggregate, in version order
    aggregates: HashMap<String, Vec<u64>>,
}

/// Event store held in process memory
#[derive(Debug)]
pub struct InMemoryEventStore {
    log: RwLock<MemoryLog>,
    max_load_limit: usize,
}

impl InMemoryEventStore {
    /// Empty store with the default load cap
    pub fn new() -> Self {
        Self::with_max_load_limit(MAX_LOAD_LIMIT)
    }

    /// Empty store with a custom load cap
    pub fn with_max_load_limit(max_load_limit: usize) -> Self {
        Self {
            log: RwLock::new(MemoryLog::default()),
            max_load_limit: max_load_limit.max(1),
        }
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    /// True when nothing has been appended
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: Event) -> Result<u64> {
        check_aggregate_id(&event)?;

        // One write lock serializes sequence assignment and version checks
        let mut log = self.log.write();

        if log.by_id.contains_key(&event.id) {
            return Err(Error::DuplicateEvent(event.id));
        }

        let current = log
            .aggregates
            .get(&event.aggregate_id)
            .map(|seqs| seqs.len() as u64)
            .unwrap_or(0);
        check_version(&event, current)?;

        let sequence = log.events.len() as u64 + 1;
        let event = event.with_sequence(sequence);

        log.by_id.insert(event.id, sequence);
        log.aggregates
            .entry(event.aggregate_id.clone())
            .or_default()
            .push(sequence);

        tracing::debug!(
            event_id = %event.id,
            aggregate_id = %event.aggregate_id,
            version = event.version,
            sequence,
            "Event appended"
        );
        log.events.push(event);

        Ok(sequence)
    }

    fn load(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        let log = self.log.read();
        let limit = effective_limit(limit, self.max_load_limit);
        let start = (after as usize).min(log.events.len());

        Ok(log.events[start..].iter().take(limit).cloned().collect())
    }

    fn load_by_aggregate(&self, aggregate_id: &str, after: u64) -> Result<Vec<Event>> {
        let log = self.log.read();
        let sequences = log
            .aggregates
            .get(aggregate_id)
            .ok_or_else(|| Error::AggregateNotFound(aggregate_id.to_string()))?;

        // Versions are contiguous from 1, so version v sits at index v - 1
        let start = (after as usize).min(sequences.len());
        Ok(sequences[start..]
            .iter()
            .map(|seq| log.events[(*seq - 1) as usize].clone())
            .collect())
    }

    fn last_sequence(&self) -> Result<u64> {
        Ok(self.log.read().events.len() as u64)
    }

    fn aggregate_version(&self, aggregate_id: &str) -> Result<u64> {
        Ok(self
            .log
            .read()
            .aggregates
            .get(aggregate_id)
            .map(|seqs| seqs.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use std::sync::Arc;

    fn note(aggregate: &str, version: u64) -> Event {
        Event::new(
            aggregate,
            version,
            EventPayload::Annotated {
                note: format!("{}-{}", aggregate, version),
            },
        )
    }

    #[test]
    fn test_append_assigns_sequences() {
        let store = InMemoryEventStore::new();
        assert_eq!(store.append(note("a", 1)).unwrap(), 1);
        assert_eq!(store.append(note("b", 1)).unwrap(), 2);
        assert_eq!(store.append(note("a", 2)).unwrap(), 3);
        assert_eq!(store.last_sequence().unwrap(), 3);
        assert_eq!(store.aggregate_version("a").unwrap(), 2);
    }

    #[test]
    fn test_duplicate_event_rejected() {
        let store = InMemoryEventStore::new();
        let event = note("a", 1);
        store.append(event.clone()).unwrap();

        let err = store.append(event.clone()).unwrap_err();
        assert!(matches!(err, Error::DuplicateEvent(id) if id == event.id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_version_conflict_leaves_store_untouched() {
        let store = InMemoryEventStore::new();
        store.append(note("a", 1)).unwrap();

        let err = store.append(note("a", 3)).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict { expected: 2, actual: 3, .. }
        ));

        let err = store.append(note("a", 1)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.last_sequence().unwrap(), 1);
    }

    #[test]
    fn test_nul_in_aggregate_id_is_rejected() {
        let store = InMemoryEventStore::new();
        let err = store.append(note("a\0b", 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
        assert!(!err.is_retryable());
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_after_and_limit() {
        let store = InMemoryEventStore::with_max_load_limit(3);
        for v in 1..=5 {
            store.append(note("a", v)).unwrap();
        }

        let events = store.load(1, 2).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);

        // Unbounded request is capped
        assert_eq!(store.load(0, usize::MAX).unwrap().len(), 3);
        assert_eq!(store.load(0, 0).unwrap().len(), 3);
        assert!(store.load(5, 10).unwrap().is_empty());
        assert!(store.load(99, 10).unwrap().is_empty());
    }

    #[test]
    fn test_load_by_aggregate() {
        let store = InMemoryEventStore::new();
        store.append(note("a", 1)).unwrap();
        store.append(note("b", 1)).unwrap();
        store.append(note("a", 2)).unwrap();
        store.append(note("a", 3)).unwrap();

        let events = store.load_by_aggregate("a", 1).unwrap();
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(events[0].sequence, 3);

        assert!(store.load_by_aggregate("a", 3).unwrap().is_empty());
        assert!(store.load_by_aggregate("missing", 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_concurrent_appends_get_unique_sequences() {
        let store = Arc::new(InMemoryEventStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let aggregate = format!("agg-{}", i);
                    for v in 1..=25 {
                        store.append(note(&aggregate, v)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let events = store.load(0, 0).unwrap();
        assert_eq!(store.last_sequence().unwrap(), 200);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, i as u64 + 1);
        }
    }
}
