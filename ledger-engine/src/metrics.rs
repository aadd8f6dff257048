//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger engine.
//!
//! # Metrics
//!
//! - `ledger_events_appended_total` - Events accepted by the event store
//! - `ledger_duplicates_discarded_total` - Redelivered events dropped by the sequencer
//! - `ledger_sequencer_pending_depth` - Out-of-order events waiting for a gap to fill
//! - `ledger_transactions_posted_total` - Transactions applied
//! - `ledger_transactions_rejected_total` - Business rejections
//! - `ledger_apply_duration_seconds` - Histogram of project+apply latencies
//! - `ledger_last_applied_sequence` - Checkpoint position
//! - `ledger_snapshots_total` - Snapshots written
//! - `ledger_reconciliation_runs_total` - Reconciler audits
//! - `ledger_reconciliation_discrepancies` - Discrepancies in the latest audit
//! - `ledger_halted` - 1 while the pipeline is halted

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Events appended
    pub events_appended: IntCounter,

    /// Duplicates discarded by the sequencer
    pub duplicates_discarded: IntCounter,

    /// Sequencer pending buffer depth
    pub sequencer_pending_depth: IntGauge,

    /// Transactions posted
    pub transactions_posted: IntCounter,

    /// Transactions rejected
    pub transactions_rejected: IntCounter,

    /// Apply duration histogram
    pub apply_duration: Histogram,

    /// Last applied global sequence
    pub last_applied_sequence: IntGauge,

    /// Snapshots written
    pub snapshots_total: IntCounter,

    /// Reconciliation runs
    pub reconciliation_runs: IntCounter,

    /// Discrepancies found by the latest reconciliation
    pub reconciliation_discrepancies: IntGauge,

    /// Halted flag
    pub halted: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let events_appended = IntCounter::new(
            "ledger_events_appended_total",
            "Events accepted by the event store",
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let duplicates_discarded = IntCounter::new(
            "ledger_duplicates_discarded_total",
            "Redelivered events dropped by the sequencer",
        )?;
        registry.register(Box::new(duplicates_discarded.clone()))?;

        let sequencer_pending_depth = IntGauge::new(
            "ledger_sequencer_pending_depth",
            "Out-of-order events waiting for a gap to fill",
        )?;
        registry.register(Box::new(sequencer_pending_depth.clone()))?;

        let transactions_posted = IntCounter::new(
            "ledger_transactions_posted_total",
            "Transactions applied to the ledger",
        )?;
        registry.register(Box::new(transactions_posted.clone()))?;

        let transactions_rejected = IntCounter::new(
            "ledger_transactions_rejected_total",
            "Transactions rejected by the ledger",
        )?;
        registry.register(Box::new(transactions_rejected.clone()))?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_apply_duration_seconds",
                "Histogram of project+apply latencies",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        let last_applied_sequence = IntGauge::new(
            "ledger_last_applied_sequence",
            "Last globally sequenced event applied to the ledger",
        )?;
        registry.register(Box::new(last_applied_sequence.clone()))?;

        let snapshots_total = IntCounter::new("ledger_snapshots_total", "Snapshots written")?;
        registry.register(Box::new(snapshots_total.clone()))?;

        let reconciliation_runs = IntCounter::new(
            "ledger_reconciliation_runs_total",
            "Reconciliation audits performed",
        )?;
        registry.register(Box::new(reconciliation_runs.clone()))?;

        let reconciliation_discrepancies = IntGauge::new(
            "ledger_reconciliation_discrepancies",
            "Discrepancies found by the latest reconciliation",
        )?;
        registry.register(Box::new(reconciliation_discrepancies.clone()))?;

        let halted = IntGauge::new("ledger_halted", "1 while the pipeline is halted")?;
        registry.register(Box::new(halted.clone()))?;

        Ok(Self {
            events_appended,
            duplicates_discarded,
            sequencer_pending_depth,
            transactions_posted,
            transactions_rejected,
            apply_duration,
            last_applied_sequence,
            snapshots_total,
            reconciliation_runs,
            reconciliation_discrepancies,
            halted,
            registry,
        })
    }

    /// Record applied event position
    pub fn record_applied(&self, sequence: u64, duration_seconds: f64) {
        self.last_applied_sequence.set(sequence as i64);
        self.apply_duration.observe(duration_seconds);
    }

    /// Update halted flag
    pub fn set_halted(&self, halted: bool) {
        self.halted.set(i64::from(halted));
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metric names are static and unique")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.events_appended.get(), 0);
        assert_eq!(metrics.halted.get(), 0);

        // Independent registries: a second collector does not collide
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_record_applied() {
        let metrics = Metrics::new().unwrap();
        metrics.record_applied(42, 0.002);
        assert_eq!(metrics.last_applied_sequence.get(), 42);
        assert_eq!(metrics.apply_duration.get_sample_count(), 1);
    }

    #[test]
    fn test_registry_gathers_all_families() {
        let metrics = Metrics::new().unwrap();
        metrics.set_halted(true);
        let families = metrics.registry().gather();
        assert_eq!(families.len(), 11);
        assert_eq!(metrics.halted.get(), 1);
    }
}
