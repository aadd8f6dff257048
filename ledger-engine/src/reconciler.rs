//! Background balance audit
//!
//! Compares the ledger's balances with an independently derived view,
//! account by account, on the settled and on-hold layers. Any discrepancy, or a failure to fetch either side,
//! halts the pipeline and raises an alert. Nothing is repaired here.

use crate::{
    halt::{HaltReason, HaltSwitch},
    ledger::Ledger,
    metrics::Metrics,
    projection::BalanceProjection,
    types::{AccountId, EntryLayer},
    Error, Result,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// One side of a reconciliation
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Label for reports and logs
    fn name(&self) -> &str;

    /// Settled balance per account
    async fn fetch_balances(&self) -> Result<BTreeMap<AccountId, Decimal>>;

    /// On-hold balance per account; zero entries may be omitted
    async fn fetch_held_balances(&self) -> Result<BTreeMap<AccountId, Decimal>> {
        Ok(BTreeMap::new())
    }
}

#[async_trait]
impl BalanceSource for Ledger {
    fn name(&self) -> &str {
        "ledger"
    }

    async fn fetch_balances(&self) -> Result<BTreeMap<AccountId, Decimal>> {
        Ok(self.balances())
    }

    async fn fetch_held_balances(&self) -> Result<BTreeMap<AccountId, Decimal>> {
        Ok(self.held_balances())
    }
}

#[async_trait]
impl BalanceSource for BalanceProjection {
    fn name(&self) -> &str {
        "balance-projection"
    }

    async fn fetch_balances(&self) -> Result<BTreeMap<AccountId, Decimal>> {
        Ok(self.balances())
    }

    async fn fetch_held_balances(&self) -> Result<BTreeMap<AccountId, Decimal>> {
        Ok(self.held_balances())
    }
}

/// Kind of divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscrepancyKind {
    /// Account exists only in the ledger
    InternalOnly,
    /// Account exists only in the external view
    ExternalOnly,
    /// Both have the account with different balances
    Mismatch,
}

/// One divergent account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    /// Account
    pub account_id: AccountId,
    /// Balance layer that diverged
    pub layer: EntryLayer,
    /// Kind
    pub kind: DiscrepancyKind,
    /// Ledger balance, if present
    pub internal: Option<Decimal>,
    /// External balance, if present
    pub external: Option<Decimal>,
}

/// Outcome of one audit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Accounts seen on either side
    pub accounts_checked: usize,
    /// Accounts that agree
    pub matched: usize,
    /// Ledger-only accounts
    pub internal_only: usize,
    /// External-only accounts
    pub external_only: usize,
    /// Balance mismatches
    pub mismatched: usize,
    /// Per-account detail
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    /// Compare two settled balance maps
    pub fn compare(
        internal: &BTreeMap<AccountId, Decimal>,
        external: &BTreeMap<AccountId, Decimal>,
    ) -> Self {
        Self::compare_layer(EntryLayer::Settled, internal, external)
    }

    /// Compare settled balances, then on-hold balances
    ///
    /// A zero hold and a missing hold are the same thing. An account that
    /// matches on settled funds but not on holds no longer counts as matched.
    pub fn compare_with_holds(
        internal: &BTreeMap<AccountId, Decimal>,
        external: &BTreeMap<AccountId, Decimal>,
        internal_held: &BTreeMap<AccountId, Decimal>,
        external_held: &BTreeMap<AccountId, Decimal>,
    ) -> Self {
        let mut report = Self::compare(internal, external);
        let held = Self::compare_layer(
            EntryLayer::OnHold,
            &non_zero(internal_held),
            &non_zero(external_held),
        );

        let mut flagged: BTreeSet<AccountId> = report
            .discrepancies
            .iter()
            .map(|d| d.account_id.clone())
            .collect();
        for d in held.discrepancies {
            if flagged.insert(d.account_id.clone()) {
                if internal.contains_key(&d.account_id) || external.contains_key(&d.account_id) {
                    report.matched -= 1;
                } else {
                    report.accounts_checked += 1;
                }
            }
            match d.kind {
                DiscrepancyKind::Mismatch => report.mismatched += 1,
                DiscrepancyKind::InternalOnly => report.internal_only += 1,
                DiscrepancyKind::ExternalOnly => report.external_only += 1,
            }
            report.discrepancies.push(d);
        }
        report
    }

    fn compare_layer(
        layer: EntryLayer,
        internal: &BTreeMap<AccountId, Decimal>,
        external: &BTreeMap<AccountId, Decimal>,
    ) -> Self {
        let ids: BTreeSet<&AccountId> = internal.keys().chain(external.keys()).collect();
        let mut report = Self {
            accounts_checked: ids.len(),
            ..Self::default()
        };

        for id in ids {
            let left = internal.get(id).copied();
            let right = external.get(id).copied();
            let kind = match (left, right) {
                (Some(a), Some(b)) if a == b => {
                    report.matched += 1;
                    continue;
                }
                (Some(_), Some(_)) => {
                    report.mismatched += 1;
                    DiscrepancyKind::Mismatch
                }
                (Some(_), None) => {
                    report.internal_only += 1;
                    DiscrepancyKind::InternalOnly
                }
                (None, _) => {
                    report.external_only += 1;
                    DiscrepancyKind::ExternalOnly
                }
            };
            report.discrepancies.push(Discrepancy {
                account_id: id.clone(),
                layer,
                kind,
                internal: left,
                external: right,
            });
        }
        report
    }

    /// True when nothing diverged
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

fn non_zero(balances: &BTreeMap<AccountId, Decimal>) -> BTreeMap<AccountId, Decimal> {
    balances
        .iter()
        .filter(|(_, v)| !v.is_zero())
        .map(|(id, v)| (id.clone(), *v))
        .collect()
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} checked, {} matched, {} mismatched, {} internal-only, {} external-only",
            self.accounts_checked,
            self.matched,
            self.mismatched,
            self.internal_only,
            self.external_only
        )
    }
}

/// Receives reconciliation failures
pub trait AlertSink: Send + Sync {
    /// Raise an alert
    fn alert(&self, report: Option<&ReconciliationReport>, detail: &str);
}

/// Alerts through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, report: Option<&ReconciliationReport>, detail: &str) {
        match report {
            Some(report) => {
                for d in &report.discrepancies {
                    tracing::error!(
                        account_id = %d.account_id,
                        layer = ?d.layer,
                        kind = ?d.kind,
                        internal = ?d.internal,
                        external = ?d.external,
                        "Reconciliation discrepancy"
                    );
                }
                tracing::error!(summary = %report, %detail, "RECONCILIATION FAILED");
            }
            None => tracing::error!(%detail, "RECONCILIATION FAILED"),
        }
    }
}

/// Periodic auditor
pub struct Reconciler {
    internal: Arc<dyn BalanceSource>,
    external: Arc<dyn BalanceSource>,
    halt: HaltSwitch,
    alerts: Arc<dyn AlertSink>,
    metrics: Metrics,
    interval: Duration,
    gate: Option<Arc<RwLock<()>>>,
}

impl Reconciler {
    /// Create reconciler
    pub fn new(
        internal: Arc<dyn BalanceSource>,
        external: Arc<dyn BalanceSource>,
        halt: HaltSwitch,
        metrics: Metrics,
        interval: Duration,
    ) -> Self {
        Self {
            internal,
            external,
            halt,
            alerts: Arc::new(LogAlertSink),
            metrics,
            interval,
            gate: None,
        }
    }

    /// Replace the alert sink
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Fetch both sides under a read guard of `gate`. The apply worker holds
    /// the write side between mutating the ledger and publishing to the
    /// projection, so both sides are read at the same sequence.
    pub fn with_gate(mut self, gate: Arc<RwLock<()>>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn fail(&self, report: Option<&ReconciliationReport>, detail: String) -> Error {
        self.alerts.alert(report, &detail);
        self.halt.halt(HaltReason::ReconciliationDiscrepancy, detail.clone());
        self.metrics.set_halted(true);
        Error::ReconciliationFailed(detail)
    }

    /// Audit once
    pub async fn run_once(&self) -> Result<ReconciliationReport> {
        self.metrics.reconciliation_runs.inc();

        let guard = match &self.gate {
            Some(gate) => Some(gate.read().await),
            None => None,
        };
        let fetched = tokio::try_join!(
            self.internal.fetch_balances(),
            self.external.fetch_balances(),
            self.internal.fetch_held_balances(),
            self.external.fetch_held_balances()
        );
        drop(guard);
        let (internal, external, internal_held, external_held) = match fetched {
            Ok(balances) => balances,
            Err(err) => {
                return Err(self.fail(None, format!("balance fetch failed: {}", err)));
            }
        };

        let report = ReconciliationReport::compare_with_holds(
            &internal,
            &external,
            &internal_held,
            &external_held,
        );
        self.metrics
            .reconciliation_discrepancies
            .set(report.discrepancies.len() as i64);

        if !report.is_clean() {
            let detail = format!(
                "{} vs {}: {}",
                self.internal.name(),
                self.external.name(),
                report
            );
            return Err(self.fail(Some(&report), detail));
        }

        tracing::info!(
            accounts = report.accounts_checked,
            "Reconciliation passed"
        );
        Ok(report)
    }

    /// Audit at startup, then every `interval`, until `shutdown` flips to true
    ///
    /// Ticks are skipped while the pipeline is halted, so auditing picks up
    /// again after an operator resume.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.halt.is_halted() {
                        tracing::debug!("Pipeline halted, skipping reconciliation");
                        continue;
                    }
                    // Failures are alerted and halted inside run_once
                    let _ = self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("internal", &self.internal.name())
            .field("external", &self.external.name())
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Fixed {
        name: &'static str,
        balances: Mutex<BTreeMap<AccountId, Decimal>>,
        held: Mutex<BTreeMap<AccountId, Decimal>>,
    }

    fn balances(pairs: &[(&str, i64)]) -> BTreeMap<AccountId, Decimal> {
        pairs
            .iter()
            .map(|(id, v)| (AccountId::new(*id), Decimal::from(*v)))
            .collect()
    }

    impl Fixed {
        fn new(name: &'static str, pairs: &[(&str, i64)]) -> Arc<Self> {
            Arc::new(Self {
                name,
                balances: Mutex::new(balances(pairs)),
                held: Mutex::new(BTreeMap::new()),
            })
        }
    }

    #[async_trait]
    impl BalanceSource for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch_balances(&self) -> Result<BTreeMap<AccountId, Decimal>> {
            Ok(self.balances.lock().clone())
        }

        async fn fetch_held_balances(&self) -> Result<BTreeMap<AccountId, Decimal>> {
            Ok(self.held.lock().clone())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl BalanceSource for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn fetch_balances(&self) -> Result<BTreeMap<AccountId, Decimal>> {
            Err(Error::Storage("projection store offline".into()))
        }
    }

    #[derive(Default)]
    struct CountingSink(Mutex<usize>);

    impl AlertSink for CountingSink {
        fn alert(&self, _report: Option<&ReconciliationReport>, _detail: &str) {
            *self.0.lock() += 1;
        }
    }

    fn reconciler(
        internal: Arc<dyn BalanceSource>,
        external: Arc<dyn BalanceSource>,
    ) -> (Reconciler, HaltSwitch, Arc<CountingSink>) {
        let halt = HaltSwitch::new();
        let sink = Arc::new(CountingSink::default());
        let reconciler = Reconciler::new(
            internal,
            external,
            halt.clone(),
            Metrics::new().unwrap(),
            Duration::from_secs(60),
        )
        .with_alert_sink(sink.clone());
        (reconciler, halt, sink)
    }

    #[tokio::test]
    async fn test_matching_balances() {
        let ledger = Fixed::new("ledger", &[("A", 100), ("B", 50)]);
        let projection = Fixed::new("projection", &[("A", 100), ("B", 50)]);
        let (reconciler, halt, sink) = reconciler(ledger, projection);

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.accounts_checked, 2);
        assert_eq!(report.matched, 2);
        assert!(report.discrepancies.is_empty());
        assert!(!halt.is_halted());
        assert_eq!(*sink.0.lock(), 0);
    }

    #[tokio::test]
    async fn test_single_mismatch_halts() {
        let ledger = Fixed::new("ledger", &[("A", 100), ("B", 50)]);
        let projection = Fixed::new("projection", &[("A", 100), ("B", 50)]);
        projection
            .balances
            .lock()
            .insert(AccountId::new("B"), Decimal::from(40));
        let (reconciler, halt, sink) = reconciler(ledger, projection);

        let err = reconciler.run_once().await.unwrap_err();
        assert!(matches!(err, Error::ReconciliationFailed(_)));
        assert!(halt.is_halted());
        assert_eq!(*sink.0.lock(), 1);

        let report = ReconciliationReport::compare(
            &balances(&[("A", 100), ("B", 50)]),
            &balances(&[("A", 100), ("B", 40)]),
        );
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].account_id, AccountId::new("B"));
        assert_eq!(report.discrepancies[0].kind, DiscrepancyKind::Mismatch);
    }

    #[tokio::test]
    async fn test_held_only_divergence_halts() {
        let ledger = Fixed::new("ledger", &[("A", 100), ("B", 50)]);
        let projection = Fixed::new("projection", &[("A", 100), ("B", 50)]);
        *ledger.held.lock() = balances(&[("A", 20), ("B", 0)]);
        *projection.held.lock() = balances(&[("A", 15)]);
        let (reconciler, halt, sink) = reconciler(ledger, projection);

        assert!(matches!(
            reconciler.run_once().await,
            Err(Error::ReconciliationFailed(_))
        ));
        assert!(halt.is_halted());
        assert_eq!(*sink.0.lock(), 1);

        let report = ReconciliationReport::compare_with_holds(
            &balances(&[("A", 100), ("B", 50)]),
            &balances(&[("A", 100), ("B", 50)]),
            &balances(&[("A", 20), ("B", 0)]),
            &balances(&[("A", 15)]),
        );
        assert_eq!(report.accounts_checked, 2);
        assert_eq!(report.matched, 1);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].account_id, AccountId::new("A"));
        assert_eq!(report.discrepancies[0].layer, EntryLayer::OnHold);
    }

    #[test]
    fn test_zero_hold_equals_missing_hold() {
        let settled = balances(&[("A", 10)]);
        let report = ReconciliationReport::compare_with_holds(
            &settled,
            &settled,
            &balances(&[("A", 0)]),
            &BTreeMap::new(),
        );
        assert!(report.is_clean());
        assert_eq!(report.matched, 1);
    }

    #[test]
    fn test_one_sided_accounts() {
        let internal = BTreeMap::from([(AccountId::new("A"), Decimal::ONE)]);
        let external = BTreeMap::from([(AccountId::new("Z"), Decimal::ONE)]);
        let report = ReconciliationReport::compare_with_holds(
            &internal,
            &external,
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        assert_eq!(report.internal_only, 1);
        assert_eq!(report.external_only, 1);
        assert_eq!(report.accounts_checked, 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_fails_closed() {
        let ledger = Fixed::new("ledger", &[("A", 100)]);
        let (reconciler, halt, sink) = reconciler(ledger, Arc::new(Unreachable));

        assert!(reconciler.run_once().await.is_err());
        assert!(halt.is_halted());
        assert_eq!(*sink.0.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_audits_at_startup_and_stops() {
        let ledger = Fixed::new("ledger", &[("A", 1)]);
        let projection = Fixed::new("projection", &[("A", 1)]);
        let (reconciler, _halt, _sink) = reconciler(ledger, projection);
        let reconciler = Arc::new(reconciler);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(stop_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(125)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        // t=0, 60, 120
        assert_eq!(reconciler.metrics.reconciliation_runs.get(), 3);
    }
}
