//! Pipeline wiring
//!
//! ```text
//! append ──► EventStore ──► Sequencer ──► apply worker ──► EventBus
//!                                          │  Projector → Ledger
//!                                          │  Checkpoint
//!                                          └─ Snapshotter
//! ```
//!
//! The apply worker is the only task that mutates the ledger. On open the
//! engine restores the latest snapshot, silently replays events up to the
//! checkpoint, and then feeds anything newer through the live pipeline.

use crate::{
    bus::EventBus,
    checkpoint::{CheckpointStore, FileCheckpointStore, RecoveryPlan},
    config::{Config, EventStoreBackend},
    event::Event,
    event_store::{EventStore, InMemoryEventStore},
    halt::{HaltSwitch, PipelineStatus},
    ledger::Ledger,
    metrics::Metrics,
    projection::BalanceProjection,
    projector::{ProjectionOutcome, Projector},
    reconciler::Reconciler,
    sequencer::{spawn_sequencer, SequencerHandle, SequencerStatus, ShutdownReport},
    snapshot::{FileSnapshotStore, Snapshot, SnapshotStore, Snapshotter},
    storage::RocksEventStore,
    Error, Result,
};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    /// Running or halted
    pub pipeline: PipelineStatus,
    /// Last sequence applied to the ledger
    pub last_applied: u64,
    /// Last sequence in the event store
    pub last_sequence: u64,
    /// Sequencer position, `None` if the actor is gone
    pub sequencer: Option<SequencerStatus>,
}

struct Pipeline {
    sequencer: SequencerHandle,
    actor: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl Pipeline {
    async fn stop(self) -> Option<ShutdownReport> {
        let report = self.sequencer.shutdown().await.ok();
        if report.is_none() {
            self.actor.abort();
        }
        let _ = self.actor.await;
        // The actor dropped its downstream sender; the worker drains and exits
        let _ = self.worker.await;
        report
    }
}

/// State every apply worker shares with the engine
#[derive(Clone)]
struct Shared {
    store: Arc<dyn EventStore>,
    ledger: Arc<Ledger>,
    bus: Arc<EventBus>,
    checkpoints: Arc<dyn CheckpointStore>,
    snapshots: Arc<dyn SnapshotStore>,
    halt: HaltSwitch,
    metrics: Metrics,
    applied: Arc<watch::Sender<u64>>,
    gate: Arc<RwLock<()>>,
}

struct ApplyWorker {
    shared: Shared,
    projector: Projector,
    snapshotter: Snapshotter,
}

impl ApplyWorker {
    fn new(shared: Shared, snapshot_interval: u64) -> Self {
        Self {
            projector: Projector::new(shared.ledger.clone()),
            snapshotter: Snapshotter::new(shared.snapshots.clone(), snapshot_interval),
            shared,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            if self.shared.halt.is_halted() {
                // Left for replay after an operator resume
                tracing::debug!(sequence = event.sequence, "Pipeline halted, not applying");
                continue;
            }

            if let Err(err) = self.apply(&event).await {
                tracing::error!(
                    event_id = %event.id,
                    sequence = event.sequence,
                    error = %err,
                    "Apply failed"
                );
                self.shared.halt.halt_on(&err);
                self.shared.metrics.set_halted(true);
            }
        }

        tracing::info!(
            last_applied = *self.shared.applied.borrow(),
            "Apply worker stopped"
        );
    }

    async fn apply(&mut self, event: &Event) -> Result<()> {
        let expected = *self.shared.applied.borrow() + 1;
        if event.sequence != expected {
            return Err(Error::InvariantViolation(format!(
                "apply worker expected sequence {}, received {}",
                expected, event.sequence
            )));
        }

        let _gate = self.shared.gate.write().await;
        let start = Instant::now();

        match self.projector.project(event)? {
            ProjectionOutcome::Applied(_) => self.shared.metrics.transactions_posted.inc(),
            ProjectionOutcome::Rejected { .. } => self.shared.metrics.transactions_rejected.inc(),
            ProjectionOutcome::Duplicate(_)
            | ProjectionOutcome::Lifecycle(_)
            | ProjectionOutcome::Skipped => {}
        }

        self.shared.checkpoints.save(event.sequence)?;
        self.shared.applied.send_replace(event.sequence);
        self.shared
            .metrics
            .record_applied(event.sequence, start.elapsed().as_secs_f64());

        let report = self.shared.bus.publish(event).await;
        if report.lagging > 0 {
            if let Err(err) = self
                .shared
                .bus
                .catch_up_until(self.shared.store.as_ref(), event.sequence)
                .await
            {
                tracing::warn!(sequence = event.sequence, error = %err, "Subscriber catch-up failed");
            }
        }

        if self
            .snapshotter
            .maybe_snapshot(&self.shared.ledger, event.sequence)?
            .is_some()
        {
            self.shared.metrics.snapshots_total.inc();
        }

        Ok(())
    }
}

/// Ledger core with its event pipeline
pub struct LedgerEngine {
    config: Config,
    shared: Shared,
    projection: Arc<BalanceProjection>,
    pipeline: Mutex<Option<Pipeline>>,
}

impl LedgerEngine {
    /// Open stores from `config`, recover, and start the pipeline
    pub async fn open(config: Config) -> Result<Self> {
        let store: Arc<dyn EventStore> = match config.event_store.backend {
            EventStoreBackend::InMemory => Arc::new(InMemoryEventStore::with_max_load_limit(
                config.event_store.max_load_limit,
            )),
            EventStoreBackend::RocksDb => Arc::new(RocksEventStore::open(&config)?),
        };
        Self::open_with_store(config, store).await
    }

    /// Open with an already constructed event store
    pub async fn open_with_store(config: Config, store: Arc<dyn EventStore>) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = %config.data_dir.display(),
            "Opening ledger engine"
        );

        let snapshots: Arc<dyn SnapshotStore> =
            Arc::new(FileSnapshotStore::open(config.snapshot_dir())?);
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::open(config.checkpoint_path())?);
        let metrics = Metrics::new().map_err(|e| Error::Config(e.to_string()))?;

        let snapshot = snapshots.load_latest()?;
        let checkpoint = checkpoints.load()?;
        let plan = RecoveryPlan::compute(checkpoint, snapshot.as_ref().map(|s| s.last_sequence));

        let last_sequence = store.last_sequence()?;
        if plan.resume_from - 1 > last_sequence {
            return Err(Error::InvariantViolation(format!(
                "recovered position {} is ahead of the event store ({})",
                plan.resume_from - 1,
                last_sequence
            )));
        }

        let ledger = Arc::new(match snapshot {
            Some(snapshot) => Ledger::from_accounts(snapshot.accounts),
            None => Ledger::new(),
        });
        if let Some(range) = &plan.replay {
            let replayed = replay_into(&Projector::new(ledger.clone()), store.as_ref(), range)?;
            tracing::info!(replayed, from = range.start(), to = range.end(), "Ledger rebuilt");
        }
        ledger.trial_balance()?;

        let last_applied = plan.resume_from - 1;
        metrics.last_applied_sequence.set(last_applied as i64);

        let (applied, _) = watch::channel(last_applied);
        let shared = Shared {
            store,
            ledger,
            bus: Arc::new(EventBus::new()),
            checkpoints,
            snapshots,
            halt: HaltSwitch::new(),
            metrics,
            applied: Arc::new(applied),
            gate: Arc::new(RwLock::new(())),
        };

        // The read model is rebuilt from the log, independently of the ledger
        let projection = Arc::new(BalanceProjection::new());
        shared.bus.subscribe(projection.clone());
        shared
            .bus
            .catch_up_until(shared.store.as_ref(), last_applied)
            .await?;

        let engine = Self {
            pipeline: Mutex::new(Some(spawn_pipeline(&config, &shared, last_applied + 1))),
            config,
            shared,
            projection,
        };

        let dispatched = engine.dispatch_pending().await?;
        tracing::info!(
            restored_from = ?plan.restore_from,
            resume_from = plan.resume_from,
            dispatched,
            "Ledger engine ready"
        );
        Ok(engine)
    }

    /// Feed stored events past the applied position into the sequencer
    ///
    /// Stops early once the pipeline halts; the rest stays in the store
    /// until an operator resumes.
    async fn dispatch_pending(&self) -> Result<usize> {
        let sequencer = self.sequencer().await?;
        let mut after = *self.shared.applied.borrow();
        let mut dispatched = 0;
        while !self.shared.halt.is_halted() {
            let page = self.shared.store.load(after, 0)?;
            let Some(last) = page.last() else { break };
            after = last.sequence;
            for event in page {
                if let Err(err) = sequencer.submit(event).await {
                    if self.shared.halt.is_halted() {
                        break;
                    }
                    return Err(err);
                }
                dispatched += 1;
            }
        }

        if self.shared.halt.is_halted() {
            tracing::warn!(
                dispatched,
                status = ?self.shared.halt.status(),
                "Pipeline halted while dispatching stored events"
            );
        }
        Ok(dispatched)
    }

    async fn sequencer(&self) -> Result<SequencerHandle> {
        self.pipeline
            .lock()
            .await
            .as_ref()
            .map(|p| p.sequencer.clone())
            .ok_or_else(|| Error::Concurrency("pipeline is shut down".to_string()))
    }

    /// Append an event and hand it to the pipeline
    ///
    /// Store errors (`DuplicateEvent`, `VersionConflict`) are returned as is.
    /// Once the append succeeds the event is durable; a pipeline problem
    /// after that point is logged and the sequence is still returned, since
    /// the event is picked up again on resume or restart.
    pub async fn append(&self, event: Event) -> Result<u64> {
        self.shared.halt.ensure_running()?;
        let sequencer = self.sequencer().await?;

        let sequence = self.shared.store.append(event.clone())?;
        self.shared.metrics.events_appended.inc();

        if let Err(err) = sequencer.submit(event.with_sequence(sequence)).await {
            tracing::warn!(sequence, error = %err, "Appended event not dispatched");
        }
        Ok(sequence)
    }

    /// Operator action: clear a halt and restart the pipeline from the last
    /// applied event
    pub async fn resume(&self) -> Result<usize> {
        {
            let mut pipeline = self.pipeline.lock().await;
            if let Some(old) = pipeline.take() {
                old.stop().await;
            }
            self.shared.halt.resume();
            self.shared.metrics.set_halted(false);
            let expected = *self.shared.applied.borrow() + 1;
            *pipeline = Some(spawn_pipeline(&self.config, &self.shared, expected));
        }
        self.dispatch_pending().await
    }

    /// Wait until `sequence` has been applied and published
    pub async fn wait_for_applied(&self, sequence: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.applied.subscribe();
        tokio::time::timeout(timeout, async {
            rx.wait_for(|applied| *applied >= sequence).await.map(|_| ())
        })
        .await
        .map_err(|_| Error::Concurrency(format!("timed out waiting for sequence {}", sequence)))?
        .map_err(|_| Error::Concurrency("apply worker stopped".to_string()))?;

        // The worker holds the gate until the bus publish is done
        drop(self.shared.gate.read().await);
        Ok(())
    }

    /// Current status
    pub async fn status(&self) -> Result<EngineStatus> {
        let sequencer = match self.sequencer().await {
            Ok(handle) => handle.status().await.ok(),
            Err(_) => None,
        };
        Ok(EngineStatus {
            pipeline: self.shared.halt.status(),
            last_applied: self.last_applied(),
            last_sequence: self.shared.store.last_sequence()?,
            sequencer,
        })
    }

    /// Last sequence applied to the ledger
    pub fn last_applied(&self) -> u64 {
        *self.shared.applied.borrow()
    }

    /// The ledger (read access; writes go through the pipeline)
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.shared.ledger
    }

    /// Independent read model
    pub fn projection(&self) -> &Arc<BalanceProjection> {
        &self.projection
    }

    /// Event bus, for registering further subscribers
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    /// Event store
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.shared.store
    }

    /// Halt switch
    pub fn halt(&self) -> &HaltSwitch {
        &self.shared.halt
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconciler comparing the ledger with the balance projection
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.shared.ledger.clone(),
            self.projection.clone(),
            self.shared.halt.clone(),
            self.shared.metrics.clone(),
            self.config.reconciler.interval(),
        )
        .with_gate(self.shared.gate.clone())
    }

    /// Stop the pipeline and write a final snapshot
    pub async fn shutdown(&self) -> Result<Option<ShutdownReport>> {
        let report = match self.pipeline.lock().await.take() {
            Some(pipeline) => pipeline.stop().await,
            None => return Ok(None),
        };

        let last_applied = self.last_applied();
        let latest = self.shared.snapshots.list()?.last().copied().unwrap_or(0);
        if !self.shared.halt.is_halted() && last_applied > latest {
            let snapshot = Snapshot::capture(&self.shared.ledger, last_applied)?;
            self.shared.snapshots.save(&snapshot)?;
            self.shared.metrics.snapshots_total.inc();
        }

        tracing::info!(last_applied, ?report, "Ledger engine shut down");
        Ok(report)
    }
}

impl std::fmt::Debug for LedgerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerEngine")
            .field("last_applied", &self.last_applied())
            .field("status", &self.shared.halt.status())
            .finish()
    }
}

fn spawn_pipeline(config: &Config, shared: &Shared, expected: u64) -> Pipeline {
    let (downstream, events) = mpsc::channel(config.sequencer.downstream_capacity);
    let (sequencer, actor) = spawn_sequencer(
        expected,
        &config.sequencer,
        downstream,
        shared.halt.clone(),
        shared.metrics.clone(),
    );

    let worker = ApplyWorker::new(shared.clone(), config.snapshot.interval_events);
    let worker = tokio::spawn(worker.run(events));

    Pipeline {
        sequencer,
        actor,
        worker,
    }
}

/// Re-apply already checkpointed events without side effects
fn replay_into(
    projector: &Projector,
    store: &dyn EventStore,
    range: &RangeInclusive<u64>,
) -> Result<usize> {
    let mut after = range.start().saturating_sub(1);
    let mut replayed = 0;

    'pages: while after < *range.end() {
        let page = store.load(after, 0)?;
        if page.is_empty() {
            break;
        }
        for event in &page {
            if event.sequence > *range.end() {
                break 'pages;
            }
            projector.project(event)?;
            after = event.sequence;
            replayed += 1;
        }
    }

    if after < *range.end() {
        return Err(Error::InvariantViolation(format!(
            "event store ends at {} but checkpoint is {}",
            after,
            range.end()
        )));
    }
    Ok(replayed)
}
