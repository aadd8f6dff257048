//! Total-order sequencer
//!
//! Producers may deliver events out of order and more than once. The
//! sequencer re-emits them in strict global sequence with no gaps and no
//! duplicates, which is what makes downstream replay deterministic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          Producers (append -> sequenced event)       │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ SequencerHandle::submit
//!                       ▼ mpsc::channel (bounded)
//! ┌──────────────────────────────────────────────────────┐
//! │              SequencerActor (Single Task)            │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ expected: u64                                  │  │
//! │  │ pending:  BTreeMap<sequence, Event>            │  │
//! │  └────────────────────────────────────────────────┘  │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ send_timeout(emit_timeout)
//!                       ▼ ordered, gap-free
//! ┌──────────────────────────────────────────────────────┐
//! │                 Apply worker (Projector)             │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! A downstream that does not accept an event within `emit_timeout` halts
//! the pipeline instead of letting the buffer grow without bound.

use crate::{
    config::SequencerConfig,
    event::Event,
    halt::{HaltReason, HaltSwitch},
    metrics::Metrics,
    Error, Result,
};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// What one `submit` did
#[derive(Debug, Default)]
pub struct SubmitOutcome {
    /// Events now ready, in sequence order
    pub emitted: Vec<Event>,
    /// The event was a redelivery and was dropped
    pub duplicate: bool,
}

/// Reordering core, free of I/O
#[derive(Debug)]
pub struct Sequencer {
    expected: u64,
    pending: BTreeMap<u64, Event>,
}

impl Sequencer {
    /// Start expecting `expected` (1 for a fresh log)
    pub fn new(expected: u64) -> Self {
        Self {
            expected: expected.max(1),
            pending: BTreeMap::new(),
        }
    }

    /// Next sequence that may be emitted
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Out-of-order events waiting for a gap to close
    pub fn pending_depth(&self) -> usize {
        self.pending.len()
    }

    /// Accept one event
    ///
    /// - below `expected`: duplicate, discarded
    /// - equal: emitted together with any contiguous buffered run
    /// - above: buffered
    pub fn submit(&mut self, event: Event) -> Result<SubmitOutcome> {
        if event.sequence == 0 {
            return Err(Error::InvariantViolation(format!(
                "event {} reached the sequencer without a global sequence",
                event.id
            )));
        }

        let mut outcome = SubmitOutcome::default();

        if event.sequence < self.expected {
            tracing::debug!(
                event_id = %event.id,
                sequence = event.sequence,
                expected = self.expected,
                "Discarding duplicate event"
            );
            outcome.duplicate = true;
            return Ok(outcome);
        }

        if event.sequence > self.expected {
            if self.pending.contains_key(&event.sequence) {
                outcome.duplicate = true;
            } else {
                self.pending.insert(event.sequence, event);
            }
            return Ok(outcome);
        }

        self.expected += 1;
        outcome.emitted.push(event);
        outcome.emitted.extend(self.drain_contiguous());
        Ok(outcome)
    }

    /// Pop every buffered event that is now contiguous with `expected`
    pub fn drain_contiguous(&mut self) -> Vec<Event> {
        let mut ready = Vec::new();
        while let Some(event) = self.pending.remove(&self.expected) {
            self.expected += 1;
            ready.push(event);
        }
        ready
    }
}

/// Snapshot of the actor's position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerStatus {
    /// Next sequence to emit
    pub expected: u64,
    /// Buffered out-of-order events
    pub pending_depth: usize,
}

/// Reply to a submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Events forwarded downstream by this submit
    pub emitted: usize,
    /// Event was a redelivery
    pub duplicate: bool,
    /// Status after the submit
    pub status: SequencerStatus,
}

/// What shutdown left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Contiguous events flushed during shutdown
    pub flushed: usize,
    /// Non-contiguous events dropped; they are re-read from the store on restart
    pub left_unflushed: usize,
    /// First sequence not handed downstream
    pub expected: u64,
}

/// Message sent to the sequencer actor
#[derive(Debug)]
pub enum SequencerMessage {
    /// Submit an event
    Submit {
        /// Sequenced event
        event: Event,
        /// Reply
        response: oneshot::Sender<Result<SubmitReceipt>>,
    },

    /// Query position
    Status {
        /// Reply
        response: oneshot::Sender<SequencerStatus>,
    },

    /// Stop accepting, flush contiguous events, exit
    Shutdown {
        /// Reply
        response: oneshot::Sender<ShutdownReport>,
    },
}

/// Actor that owns the [`Sequencer`] and feeds the downstream consumer
pub struct SequencerActor {
    core: Sequencer,
    mailbox: mpsc::Receiver<SequencerMessage>,
    downstream: mpsc::Sender<Event>,
    emit_timeout: Duration,
    buffer_warn_depth: usize,
    halt: HaltSwitch,
    metrics: Metrics,
    /// Last sequence the downstream consumer accepted
    delivered: u64,
}

impl SequencerActor {
    /// Create new actor
    pub fn new(
        expected: u64,
        mailbox: mpsc::Receiver<SequencerMessage>,
        downstream: mpsc::Sender<Event>,
        config: &SequencerConfig,
        halt: HaltSwitch,
        metrics: Metrics,
    ) -> Self {
        Self {
            core: Sequencer::new(expected),
            delivered: expected.max(1) - 1,
            mailbox,
            downstream,
            emit_timeout: config.emit_timeout(),
            buffer_warn_depth: config.buffer_warn_depth,
            halt,
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                SequencerMessage::Submit { event, response } => {
                    let result = self.handle_submit(event).await;
                    let _ = response.send(result);
                }

                SequencerMessage::Status { response } => {
                    let _ = response.send(self.status());
                }

                SequencerMessage::Shutdown { response } => {
                    self.mailbox.close();
                    let report = self.shutdown().await;
                    let _ = response.send(report);
                    break;
                }
            }
        }

        tracing::info!(expected = self.core.expected(), "Sequencer stopped");
    }

    fn status(&self) -> SequencerStatus {
        SequencerStatus {
            expected: self.core.expected(),
            pending_depth: self.core.pending_depth(),
        }
    }

    async fn handle_submit(&mut self, event: Event) -> Result<SubmitReceipt> {
        self.halt.ensure_running()?;

        let outcome = self.core.submit(event)?;
        if outcome.duplicate {
            self.metrics.duplicates_discarded.inc();
        }

        let depth = self.core.pending_depth();
        self.metrics.sequencer_pending_depth.set(depth as i64);
        if depth > self.buffer_warn_depth {
            tracing::warn!(
                pending_depth = depth,
                expected = self.core.expected(),
                "Sequencer buffer deep; a producer may be stuck"
            );
        }

        let emitted = self.emit(outcome.emitted).await?;

        Ok(SubmitReceipt {
            emitted,
            duplicate: outcome.duplicate,
            status: self.status(),
        })
    }

    /// Forward events downstream, halting on a stalled or closed consumer
    async fn emit(&mut self, events: Vec<Event>) -> Result<usize> {
        let mut emitted = 0;
        for event in events {
            let sequence = event.sequence;
            match self.downstream.send_timeout(event, self.emit_timeout).await {
                Ok(()) => {
                    emitted += 1;
                    self.delivered = sequence;
                }
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    let err = Error::ConsumerUnresponsive(self.emit_timeout.as_millis() as u64);
                    tracing::error!(sequence, "Downstream consumer did not accept event in time");
                    self.halt.halt(HaltReason::ConsumerUnresponsive, err.to_string());
                    return Err(err);
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    let err = Error::ConsumerUnresponsive(0);
                    self.halt
                        .halt(HaltReason::ConsumerUnresponsive, "downstream channel closed");
                    return Err(err);
                }
            }
        }
        Ok(emitted)
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        let before = self.delivered;
        if !self.halt.is_halted() {
            let ready = self.core.drain_contiguous();
            let _ = self.emit(ready).await;
        }
        let flushed = (self.delivered - before) as usize;
        let left_unflushed = self.core.pending_depth();
        let expected = self.delivered + 1;

        if left_unflushed > 0 || expected != self.core.expected() {
            tracing::info!(
                left_unflushed,
                expected,
                "Leaving undelivered events for replay on restart"
            );
        }

        ShutdownReport {
            flushed,
            left_unflushed,
            expected,
        }
    }
}

impl std::fmt::Debug for SequencerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerActor")
            .field("expected", &self.core.expected())
            .field("pending_depth", &self.core.pending_depth())
            .field("emit_timeout", &self.emit_timeout)
            .finish()
    }
}

/// Handle for sending messages to the sequencer actor
#[derive(Clone, Debug)]
pub struct SequencerHandle {
    sender: mpsc::Sender<SequencerMessage>,
}

impl SequencerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<SequencerMessage>) -> Self {
        Self { sender }
    }

    /// Submit a sequenced event
    pub async fn submit(&self, event: Event) -> Result<SubmitReceipt> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SequencerMessage::Submit {
                event,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Sequencer mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Current position
    pub async fn status(&self) -> Result<SequencerStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SequencerMessage::Status { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Sequencer mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Stop accepting submissions and flush contiguous events
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SequencerMessage::Shutdown { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Sequencer mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

/// Spawn the sequencer actor
pub fn spawn_sequencer(
    expected: u64,
    config: &SequencerConfig,
    downstream: mpsc::Sender<Event>,
    halt: HaltSwitch,
    metrics: Metrics,
) -> (SequencerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity); // Bounded channel for backpressure
    let actor = SequencerActor::new(expected, rx, downstream, config, halt, metrics);

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (SequencerHandle::new(tx), task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;

    fn sequenced(sequence: u64) -> Event {
        Event::new(
            format!("agg-{}", sequence),
            1,
            EventPayload::Annotated {
                note: String::new(),
            },
        )
        .with_sequence(sequence)
    }

    fn sequences(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn test_reorders_out_of_order_arrival() {
        let mut seq = Sequencer::new(1);
        let mut emitted = Vec::new();
        for s in [1, 3, 2] {
            emitted.extend(seq.submit(sequenced(s)).unwrap().emitted);
        }
        assert_eq!(sequences(&emitted), vec![1, 2, 3]);
        assert_eq!(seq.expected(), 4);
        assert_eq!(seq.pending_depth(), 0);
    }

    #[test]
    fn test_gap_holds_everything_back() {
        let mut seq = Sequencer::new(1);
        assert!(seq.submit(sequenced(2)).unwrap().emitted.is_empty());
        assert!(seq.submit(sequenced(3)).unwrap().emitted.is_empty());
        assert_eq!(seq.pending_depth(), 2);

        let out = seq.submit(sequenced(1)).unwrap();
        assert_eq!(sequences(&out.emitted), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicates_discarded() {
        let mut seq = Sequencer::new(1);
        seq.submit(sequenced(1)).unwrap();

        let out = seq.submit(sequenced(1)).unwrap();
        assert!(out.duplicate);
        assert!(out.emitted.is_empty());

        seq.submit(sequenced(5)).unwrap();
        assert!(seq.submit(sequenced(5)).unwrap().duplicate);
        assert_eq!(seq.pending_depth(), 1);
    }

    #[test]
    fn test_unsequenced_event_is_defect() {
        let mut seq = Sequencer::new(1);
        let err = seq.submit(sequenced(0)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let mut seq = Sequencer::new(11);
        assert!(seq.submit(sequenced(10)).unwrap().duplicate);
        assert_eq!(sequences(&seq.submit(sequenced(11)).unwrap().emitted), vec![11]);
    }

    fn spawn_test(
        downstream_capacity: usize,
        emit_timeout_ms: u64,
    ) -> (SequencerHandle, mpsc::Receiver<Event>, HaltSwitch) {
        let config = SequencerConfig {
            downstream_capacity,
            emit_timeout_ms,
            ..SequencerConfig::default()
        };
        let (down_tx, down_rx) = mpsc::channel(config.downstream_capacity);
        let halt = HaltSwitch::new();
        let (handle, _task) =
            spawn_sequencer(1, &config, down_tx, halt.clone(), Metrics::new().unwrap());
        (handle, down_rx, halt)
    }

    #[tokio::test]
    async fn test_actor_emits_in_order() {
        let (handle, mut down_rx, _halt) = spawn_test(16, 1_000);

        handle.submit(sequenced(2)).await.unwrap();
        let receipt = handle.submit(sequenced(1)).await.unwrap();
        assert_eq!(receipt.emitted, 2);
        assert_eq!(receipt.status.expected, 3);

        assert_eq!(down_rx.recv().await.unwrap().sequence, 1);
        assert_eq!(down_rx.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_consumer_halts() {
        // Capacity 1 and nobody reading: the second emit must time out
        let (handle, _down_rx, halt) = spawn_test(1, 30_000);

        handle.submit(sequenced(1)).await.unwrap();
        let err = handle.submit(sequenced(2)).await.unwrap_err();

        assert!(matches!(err, Error::ConsumerUnresponsive(30_000)));
        assert!(halt.is_halted());

        // Fail closed: further submissions are refused
        assert!(matches!(
            handle.submit(sequenced(3)).await,
            Err(Error::Halted(_))
        ));

        // Sequence 2 was never accepted downstream
        let report = handle.shutdown().await.unwrap();
        assert_eq!(report.expected, 2);
        assert_eq!(report.flushed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_gapped_events() {
        let (handle, mut down_rx, _halt) = spawn_test(16, 1_000);

        handle.submit(sequenced(1)).await.unwrap();
        handle.submit(sequenced(3)).await.unwrap();
        handle.submit(sequenced(4)).await.unwrap();

        let report = handle.shutdown().await.unwrap();
        assert_eq!(report.expected, 2);
        assert_eq!(report.left_unflushed, 2);
        assert_eq!(report.flushed, 0);

        assert_eq!(down_rx.recv().await.unwrap().sequence, 1);
        // Actor exited and dropped its sender
        assert!(down_rx.recv().await.is_none());
        assert!(handle.submit(sequenced(2)).await.is_err());
    }
}
