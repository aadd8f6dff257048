//! Balance read model
//!
//! `BalanceProjection` derives account balances straight from the event
//! stream with its own bookkeeping, sharing no state with the [`Ledger`].
//! The reconciler compares the two; any divergence means one of them has
//! a defect.
//!
//! [`Ledger`]: crate::Ledger

use crate::{
    bus::EventSubscriber,
    event::{Event, EventPayload},
    types::{AccountId, AccountStatus, AccountType, Asset, NormalBalance},
    Result,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Subscriber id used on the bus
pub const BALANCE_PROJECTION_ID: &str = "balance-projection";

#[derive(Debug, Clone)]
struct ProjectedAccount {
    asset: Asset,
    normal: NormalBalance,
    status: AccountStatus,
    settled: Decimal,
    held: Decimal,
}

impl ProjectedAccount {
    fn new(asset: Asset, account_type: AccountType) -> Self {
        Self {
            asset,
            normal: account_type.normal_balance(),
            status: AccountStatus::Open,
            settled: Decimal::ZERO,
            held: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Bucket {
    Settled,
    Held,
}

// (account, bucket, credit-positive amount)
type Leg<'a> = (&'a AccountId, Bucket, Decimal);

#[derive(Debug, Default)]
struct ProjectionState {
    accounts: BTreeMap<AccountId, ProjectedAccount>,
    watermark: u64,
    ignored: u64,
}

impl ProjectionState {
    fn apply(&mut self, event: &Event) {
        let applied = match &event.payload {
            EventPayload::AccountOpened {
                account_id,
                asset,
                account_type,
            } => {
                if self.accounts.contains_key(account_id) {
                    false
                } else {
                    self.accounts
                        .insert(account_id.clone(), ProjectedAccount::new(*asset, *account_type));
                    true
                }
            }
            EventPayload::AccountFrozen { account_id } => {
                self.set_status(account_id, AccountStatus::Open, AccountStatus::Frozen)
            }
            EventPayload::AccountUnfrozen { account_id } => {
                self.set_status(account_id, AccountStatus::Frozen, AccountStatus::Open)
            }
            EventPayload::AccountClosed { account_id } => self.close(account_id),
            EventPayload::FundsDeposited {
                account_id,
                funding_account,
                asset,
                amount,
            } => self.post(
                *asset,
                *amount,
                &[
                    (funding_account, Bucket::Settled, -*amount),
                    (account_id, Bucket::Settled, *amount),
                ],
            ),
            EventPayload::FundsWithdrawn {
                account_id,
                settlement_account,
                asset,
                amount,
            } => self.post(
                *asset,
                *amount,
                &[
                    (account_id, Bucket::Settled, -*amount),
                    (settlement_account, Bucket::Settled, *amount),
                ],
            ),
            EventPayload::TransferCompleted {
                from,
                to,
                asset,
                amount,
            } => {
                from != to
                    && self.post(
                        *asset,
                        *amount,
                        &[
                            (from, Bucket::Settled, -*amount),
                            (to, Bucket::Settled, *amount),
                        ],
                    )
            }
            EventPayload::FundsHeld {
                account_id,
                asset,
                amount,
            } => self.post(
                *asset,
                *amount,
                &[
                    (account_id, Bucket::Settled, -*amount),
                    (account_id, Bucket::Held, *amount),
                ],
            ),
            EventPayload::HoldReleased {
                account_id,
                asset,
                amount,
            } => self.post(
                *asset,
                *amount,
                &[
                    (account_id, Bucket::Held, -*amount),
                    (account_id, Bucket::Settled, *amount),
                ],
            ),
            EventPayload::Annotated { .. } => true,
        };

        if !applied {
            self.ignored += 1;
        }
        self.watermark = event.sequence;
    }

    fn set_status(&mut self, id: &AccountId, from: AccountStatus, to: AccountStatus) -> bool {
        match self.accounts.get_mut(id) {
            Some(account) if account.status == from => {
                account.status = to;
                true
            }
            _ => false,
        }
    }

    fn close(&mut self, id: &AccountId) -> bool {
        match self.accounts.get_mut(id) {
            Some(account)
                if matches!(account.status, AccountStatus::Open | AccountStatus::Frozen)
                    && account.settled.is_zero()
                    && account.held.is_zero() =>
            {
                account.status = AccountStatus::Closed;
                true
            }
            _ => false,
        }
    }

    /// All-or-nothing movement; false when the ledger would refuse it
    fn post(&mut self, asset: Asset, amount: Decimal, legs: &[Leg<'_>]) -> bool {
        if amount <= Decimal::ZERO || !asset.accepts(amount) {
            return false;
        }

        let mut next: BTreeMap<(&AccountId, Bucket), Decimal> = BTreeMap::new();
        for (id, bucket, credit_positive) in legs {
            let Some(account) = self.accounts.get(*id) else {
                return false;
            };
            if account.asset != asset || account.status != AccountStatus::Open {
                return false;
            }
            let change = match account.normal {
                NormalBalance::Credit => *credit_positive,
                NormalBalance::Debit => -*credit_positive,
            };
            let current = match bucket {
                Bucket::Settled => account.settled,
                Bucket::Held => account.held,
            };
            *next.entry((*id, *bucket)).or_insert(current) += change;
        }

        if next.values().any(|balance| *balance < Decimal::ZERO) {
            return false;
        }

        for ((id, bucket), balance) in next {
            if let Some(account) = self.accounts.get_mut(id) {
                match bucket {
                    Bucket::Settled => account.settled = balance,
                    Bucket::Held => account.held = balance,
                }
            }
        }
        true
    }
}

/// Independently maintained settled and on-hold balances
#[derive(Debug, Default)]
pub struct BalanceProjection {
    state: RwLock<ProjectionState>,
}

impl BalanceProjection {
    /// Empty projection
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event unless already seen
    pub fn apply(&self, event: &Event) {
        let mut state = self.state.write();
        if event.sequence <= state.watermark {
            return;
        }
        state.apply(event);
    }

    /// Last sequence applied
    pub fn watermark(&self) -> u64 {
        self.state.read().watermark
    }

    /// Events seen that had no effect
    pub fn ignored(&self) -> u64 {
        self.state.read().ignored
    }

    /// Settled balance per account
    pub fn balances(&self) -> BTreeMap<AccountId, Decimal> {
        self.state
            .read()
            .accounts
            .iter()
            .map(|(id, account)| (id.clone(), account.settled))
            .collect()
    }

    /// On-hold balance per account
    pub fn held_balances(&self) -> BTreeMap<AccountId, Decimal> {
        self.state
            .read()
            .accounts
            .iter()
            .map(|(id, account)| (id.clone(), account.held))
            .collect()
    }
}

#[async_trait]
impl EventSubscriber for BalanceProjection {
    fn id(&self) -> &str {
        BALANCE_PROJECTION_ID
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        self.apply(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Vec<EventPayload> {
        vec![
            EventPayload::AccountOpened {
                account_id: "cash".into(),
                asset: Asset::USD,
                account_type: AccountType::Asset,
            },
            EventPayload::AccountOpened {
                account_id: "A".into(),
                asset: Asset::USD,
                account_type: AccountType::Liability,
            },
            EventPayload::AccountOpened {
                account_id: "B".into(),
                asset: Asset::USD,
                account_type: AccountType::Liability,
            },
            EventPayload::FundsDeposited {
                account_id: "A".into(),
                funding_account: "cash".into(),
                asset: Asset::USD,
                amount: Decimal::from(500),
            },
            EventPayload::TransferCompleted {
                from: "A".into(),
                to: "B".into(),
                asset: Asset::USD,
                amount: Decimal::from(100),
            },
            // Overdraft, refused
            EventPayload::TransferCompleted {
                from: "A".into(),
                to: "B".into(),
                asset: Asset::USD,
                amount: Decimal::from(1000),
            },
        ]
    }

    fn feed(projection: &BalanceProjection) -> Vec<Event> {
        events()
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let ev = Event::new(format!("agg-{}", i), 1, payload).with_sequence(i as u64 + 1);
                projection.apply(&ev);
                ev
            })
            .collect()
    }

    #[test]
    fn test_projects_balances() {
        let projection = BalanceProjection::new();
        feed(&projection);

        let balances = projection.balances();
        assert_eq!(balances[&AccountId::new("A")], Decimal::from(400));
        assert_eq!(balances[&AccountId::new("B")], Decimal::from(100));
        assert_eq!(balances[&AccountId::new("cash")], Decimal::from(500));
        assert_eq!(projection.watermark(), 6);
        assert_eq!(projection.ignored(), 1);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let projection = BalanceProjection::new();
        let events = feed(&projection);
        let before = projection.balances();

        for ev in &events {
            projection.apply(ev);
        }
        assert_eq!(projection.balances(), before);
    }

    #[test]
    fn test_hold_moves_out_of_settled() {
        let projection = BalanceProjection::new();
        feed(&projection);
        let hold = Event::new(
            "hold-1",
            1,
            EventPayload::FundsHeld {
                account_id: "B".into(),
                asset: Asset::USD,
                amount: Decimal::from(30),
            },
        )
        .with_sequence(7);
        projection.apply(&hold);
        assert_eq!(projection.balances()[&AccountId::new("B")], Decimal::from(70));
    }
}
