//! Fail-closed pipeline status
//!
//! A fatal condition (unbalanced translation, stuck consumer, reconciliation
//! divergence) moves the pipeline from `Running` to `Halted`. Nothing
//! resumes it except an explicit operator call to [`HaltSwitch::resume`].

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why the pipeline stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Projector produced an unbalanced transaction
    UnbalancedTransaction,
    /// An event could not be translated
    TranslationFailure,
    /// Ledger and read projection diverged, or could not be compared
    ReconciliationDiscrepancy,
    /// Downstream consumer did not accept events in time
    ConsumerUnresponsive,
    /// Persisting state or position failed
    StorageFailure,
    /// Any other invariant violation
    InvariantViolation,
}

impl HaltReason {
    /// Map a fatal error to its halt reason
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::UnbalancedTransaction { .. } => HaltReason::UnbalancedTransaction,
            Error::Translation { .. } => HaltReason::TranslationFailure,
            Error::ConsumerUnresponsive(_) => HaltReason::ConsumerUnresponsive,
            Error::ReconciliationFailed(_) => HaltReason::ReconciliationDiscrepancy,
            Error::InvariantViolation(_) => HaltReason::InvariantViolation,
            _ => HaltReason::StorageFailure,
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaltReason::UnbalancedTransaction => "unbalanced transaction",
            HaltReason::TranslationFailure => "translation failure",
            HaltReason::ReconciliationDiscrepancy => "reconciliation discrepancy",
            HaltReason::ConsumerUnresponsive => "consumer unresponsive",
            HaltReason::StorageFailure => "storage failure",
            HaltReason::InvariantViolation => "invariant violation",
        };
        f.write_str(s)
    }
}

/// Pipeline status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Processing normally
    Running,
    /// Stopped until an operator resumes
    Halted {
        /// Reason class
        reason: HaltReason,
        /// Human-readable detail
        detail: String,
        /// When the halt happened
        at: DateTime<Utc>,
    },
}

impl PipelineStatus {
    /// True when halted
    pub fn is_halted(&self) -> bool {
        matches!(self, PipelineStatus::Halted { .. })
    }
}

/// Shared Running/Halted switch
///
/// Cloning is cheap; every clone observes the same status.
#[derive(Debug, Clone)]
pub struct HaltSwitch {
    status: Arc<RwLock<PipelineStatus>>,
    notify: Arc<watch::Sender<bool>>,
}

impl HaltSwitch {
    /// New switch in `Running`
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            status: Arc::new(RwLock::new(PipelineStatus::Running)),
            notify: Arc::new(notify),
        }
    }

    /// Move to `Halted`. The first halt wins; later calls keep the original
    /// reason so the root cause stays visible.
    pub fn halt(&self, reason: HaltReason, detail: impl Into<String>) {
        let detail = detail.into();
        let mut status = self.status.write();
        if status.is_halted() {
            tracing::warn!(%reason, %detail, "Additional halt signal while already halted");
            return;
        }

        tracing::error!(%reason, %detail, "Pipeline halted");
        *status = PipelineStatus::Halted {
            reason,
            detail,
            at: Utc::now(),
        };
        drop(status);
        self.notify.send_replace(true);
    }

    /// Halt because of a fatal error
    pub fn halt_on(&self, err: &Error) {
        self.halt(HaltReason::from_error(err), err.to_string());
    }

    /// Operator action: clear the halt
    pub fn resume(&self) {
        let mut status = self.status.write();
        if let PipelineStatus::Halted { reason, .. } = &*status {
            tracing::warn!(%reason, "Pipeline resumed by operator");
        }
        *status = PipelineStatus::Running;
        drop(status);
        self.notify.send_replace(false);
    }

    /// Current status
    pub fn status(&self) -> PipelineStatus {
        self.status.read().clone()
    }

    /// True when halted
    pub fn is_halted(&self) -> bool {
        self.status.read().is_halted()
    }

    /// `Err(Halted)` when halted
    pub fn ensure_running(&self) -> Result<()> {
        match &*self.status.read() {
            PipelineStatus::Running => Ok(()),
            PipelineStatus::Halted { reason, detail, .. } => {
                Err(Error::Halted(format!("{}: {}", reason, detail)))
            }
        }
    }

    /// Receiver that flips to `true` on halt
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }
}

impl Default for HaltSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_and_resume() {
        let switch = HaltSwitch::new();
        assert!(switch.ensure_running().is_ok());

        switch.halt(HaltReason::ConsumerUnresponsive, "apply worker stalled");
        assert!(switch.is_halted());
        assert!(matches!(switch.ensure_running(), Err(Error::Halted(_))));

        switch.resume();
        assert_eq!(switch.status(), PipelineStatus::Running);
    }

    #[test]
    fn test_first_halt_reason_wins() {
        let switch = HaltSwitch::new();
        switch.halt(HaltReason::UnbalancedTransaction, "first");
        switch.halt(HaltReason::StorageFailure, "second");

        match switch.status() {
            PipelineStatus::Halted { reason, detail, .. } => {
                assert_eq!(reason, HaltReason::UnbalancedTransaction);
                assert_eq!(detail, "first");
            }
            PipelineStatus::Running => panic!("expected halted"),
        }
    }

    #[tokio::test]
    async fn test_subscribers_observe_halt() {
        let switch = HaltSwitch::new();
        let mut rx = switch.subscribe();
        let clone = switch.clone();

        tokio::spawn(async move {
            clone.halt_on(&Error::ReconciliationFailed("B differs".into()));
        });

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(switch.is_halted());
    }
}
