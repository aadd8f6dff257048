//! Event → transaction projection
//!
//! `translate` is a pure function of the event. The transaction id is a
//! UUIDv5 of the event id, so redelivering an event always yields the
//! same transaction and the ledger's idempotency check turns the retry
//! into a no-op.

use crate::{
    event::{Event, EventPayload},
    ledger::{ApplyOutcome, Ledger},
    types::{AccountId, Asset, EntryLayer, Transaction, TransactionId},
    Error, ErrorKind, Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Namespace for event-derived transaction ids. Changing it breaks replay
/// idempotency against existing ledgers.
pub const TRANSACTION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6c, 0x65, 0x64, 0x67, 0x65, 0x72, 0x2d, 0x74, 0x78, 0x2d, 0x6e, 0x73, 0x2d, 0x76, 0x30, 0x31,
]);

/// Deterministic transaction id for an event
pub fn transaction_id_for(event_id: &Uuid) -> TransactionId {
    TransactionId::from_uuid(Uuid::new_v5(&TRANSACTION_NAMESPACE, event_id.as_bytes()))
}

fn positive(event: &Event, amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(Error::Translation {
            event_id: event.id,
            reason: format!("non-positive amount {}", amount),
        });
    }
    Ok(amount)
}

/// Translate an event into at most one transaction
///
/// Lifecycle and annotation events have no ledger entries and yield `None`.
pub fn translate(event: &Event) -> Result<Option<Transaction>> {
    let builder = Transaction::builder(transaction_id_for(&event.id))
        .source_event(event.id)
        .created_at(event.timestamp);

    let tx = match &event.payload {
        EventPayload::AccountOpened { .. }
        | EventPayload::AccountFrozen { .. }
        | EventPayload::AccountUnfrozen { .. }
        | EventPayload::AccountClosed { .. }
        | EventPayload::Annotated { .. } => return Ok(None),

        EventPayload::FundsDeposited {
            account_id,
            funding_account,
            amount,
            ..
        } => {
            let amount = positive(event, *amount)?;
            builder
                .debit(funding_account.clone(), amount)
                .credit(account_id.clone(), amount)
                .build()
        }

        EventPayload::FundsWithdrawn {
            account_id,
            settlement_account,
            amount,
            ..
        } => {
            let amount = positive(event, *amount)?;
            builder
                .debit(account_id.clone(), amount)
                .credit(settlement_account.clone(), amount)
                .build()
        }

        EventPayload::TransferCompleted {
            from, to, amount, ..
        } => {
            if from == to {
                return Err(Error::Translation {
                    event_id: event.id,
                    reason: format!("transfer from {} to itself", from),
                });
            }
            let amount = positive(event, *amount)?;
            builder
                .debit(from.clone(), amount)
                .credit(to.clone(), amount)
                .build()
        }

        EventPayload::FundsHeld {
            account_id, amount, ..
        } => {
            let amount = positive(event, *amount)?;
            builder
                .debit_layer(account_id.clone(), amount, EntryLayer::Settled)
                .credit_layer(account_id.clone(), amount, EntryLayer::OnHold)
                .build()
        }

        EventPayload::HoldReleased {
            account_id, amount, ..
        } => {
            let amount = positive(event, *amount)?;
            builder
                .debit_layer(account_id.clone(), amount, EntryLayer::OnHold)
                .credit_layer(account_id.clone(), amount, EntryLayer::Settled)
                .build()
        }
    };

    Ok(Some(tx))
}

fn payload_asset(payload: &EventPayload) -> Option<Asset> {
    match payload {
        EventPayload::FundsDeposited { asset, .. }
        | EventPayload::FundsWithdrawn { asset, .. }
        | EventPayload::TransferCompleted { asset, .. }
        | EventPayload::FundsHeld { asset, .. }
        | EventPayload::HoldReleased { asset, .. } => Some(*asset),
        _ => None,
    }
}

/// What projecting one event did
#[derive(Debug)]
pub enum ProjectionOutcome {
    /// Transaction posted
    Applied(TransactionId),
    /// Transaction was already posted by an earlier delivery
    Duplicate(TransactionId),
    /// Business rejection recorded; the pipeline advances
    Rejected {
        /// Transaction, if the event produced one
        transaction_id: Option<TransactionId>,
        /// Why
        reason: Error,
    },
    /// Account lifecycle command applied
    Lifecycle(AccountId),
    /// Event has no ledger effect
    Skipped,
}

impl ProjectionOutcome {
    /// True for `Rejected`
    pub fn is_rejected(&self) -> bool {
        matches!(self, ProjectionOutcome::Rejected { .. })
    }
}

/// Applies ordered events to the ledger
#[derive(Debug, Clone)]
pub struct Projector {
    ledger: Arc<Ledger>,
}

impl Projector {
    /// Create projector over a ledger
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Ledger being projected into
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Translate and apply one event
    ///
    /// Fatal errors (translation failure, unbalanced result, invariant
    /// violation) and system errors are returned; the caller must halt.
    pub fn project(&self, event: &Event) -> Result<ProjectionOutcome> {
        if let Some(outcome) = self.apply_lifecycle(event)? {
            return Ok(outcome);
        }

        let Some(tx) = translate(event)? else {
            return Ok(ProjectionOutcome::Skipped);
        };

        if !tx.is_balanced() {
            return Err(Error::UnbalancedTransaction {
                transaction_id: tx.id.to_string(),
                sum: tx.signed_sum(),
            });
        }

        let tx_id = tx.id;
        if let Some(asset) = payload_asset(&event.payload) {
            if let Some(mismatch) = self.asset_mismatch(&tx, asset) {
                return Ok(self.rejected(event, Some(tx_id), mismatch));
            }
        }

        match self.ledger.apply_transaction(tx) {
            Ok(ApplyOutcome::Posted(id)) => Ok(ProjectionOutcome::Applied(id)),
            Ok(ApplyOutcome::AlreadyPosted(id)) => Ok(ProjectionOutcome::Duplicate(id)),
            Err(err) => self.classify(event, Some(tx_id), err),
        }
    }

    fn apply_lifecycle(&self, event: &Event) -> Result<Option<ProjectionOutcome>> {
        let result = match &event.payload {
            EventPayload::AccountOpened {
                account_id,
                asset,
                account_type,
            } => {
                if let Ok(existing) = self.ledger.account(account_id) {
                    if existing.asset == *asset && existing.account_type == *account_type {
                        tracing::debug!(
                            event_id = %event.id,
                            account_id = %account_id,
                            "Account already opened, skipping"
                        );
                        return Ok(Some(ProjectionOutcome::Skipped));
                    }
                }
                self.ledger
                    .create_account(account_id.clone(), *asset, *account_type)
                    .and_then(|_| self.ledger.open_account(account_id))
                    .map(|_| account_id)
            }
            EventPayload::AccountFrozen { account_id } => {
                self.ledger.freeze_account(account_id).map(|_| account_id)
            }
            EventPayload::AccountUnfrozen { account_id } => {
                self.ledger.unfreeze_account(account_id).map(|_| account_id)
            }
            EventPayload::AccountClosed { account_id } => {
                self.ledger.close_account(account_id).map(|_| account_id)
            }
            _ => return Ok(None),
        };

        match result {
            Ok(account_id) => Ok(Some(ProjectionOutcome::Lifecycle(account_id.clone()))),
            Err(err) => self.classify(event, None, err).map(Some),
        }
    }

    fn asset_mismatch(&self, tx: &Transaction, asset: Asset) -> Option<Error> {
        tx.entries.iter().find_map(|entry| {
            let account = self.ledger.account(&entry.account_id).ok()?;
            (account.asset != asset).then(|| {
                Error::MixedAssets(format!(
                    "{}: event asset {} but account {} holds {}",
                    tx.id, asset, account.id, account.asset
                ))
            })
        })
    }

    fn classify(
        &self,
        event: &Event,
        transaction_id: Option<TransactionId>,
        err: Error,
    ) -> Result<ProjectionOutcome> {
        match err.kind() {
            ErrorKind::Rejected | ErrorKind::NotFound => {
                Ok(self.rejected(event, transaction_id, err))
            }
            _ => Err(err),
        }
    }

    fn rejected(
        &self,
        event: &Event,
        transaction_id: Option<TransactionId>,
        reason: Error,
    ) -> ProjectionOutcome {
        tracing::info!(
            event_id = %event.id,
            sequence = event.sequence,
            event_type = %event.event_type(),
            error = %reason,
            "Event rejected by ledger"
        );
        ProjectionOutcome::Rejected {
            transaction_id,
            reason,
        }
    }
}
