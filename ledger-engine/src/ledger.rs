//! The ledger: sole owner and writer of account state
//!
//! `apply_transaction` runs in three phases under one write lock:
//!
//! 1. **Idempotency**: an already posted transaction id is a no-op success;
//!    an already rejected id stays rejected
//! 2. **Validation** (read-only): accounts exist and are open, one asset,
//!    amounts fit the asset, signed entries sum to zero, and every affected
//!    balance layer stays non-negative
//! 3. **Mutation**: apply every delta and bump every affected account's
//!    version by one
//!
//! There is no external transaction to roll back, so nothing is touched
//! until phase 2 has passed in full.
//!
//! # Example
//!
//! ```
//! use ledger_engine::{AccountType, Asset, Ledger, Transaction, TransactionId};
//! use rust_decimal::Decimal;
//! use uuid::Uuid;
//!
//! let ledger = Ledger::new();
//! ledger.create_account("cash".into(), Asset::USD, AccountType::Asset).unwrap();
//! ledger.create_account("A".into(), Asset::USD, AccountType::Liability).unwrap();
//! ledger.open_account(&"cash".into()).unwrap();
//! ledger.open_account(&"A".into()).unwrap();
//!
//! let tx = Transaction::builder(TransactionId::from_uuid(Uuid::new_v4()))
//!     .debit("cash", Decimal::from(500))
//!     .credit("A", Decimal::from(500))
//!     .build();
//! ledger.apply_transaction(tx).unwrap();
//!
//! assert_eq!(ledger.balance(&"A".into()).unwrap(), Decimal::from(500));
//! ```

use crate::{
    types::{
        Account, AccountId, AccountStatus, AccountType, Asset, EntryLayer, NormalBalance,
        Transaction, TransactionId, TransactionStatus,
    },
    Error, Result,
};
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

/// Result of a successful `apply_transaction`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied now
    Posted(TransactionId),
    /// Already applied earlier; nothing changed
    AlreadyPosted(TransactionId),
}

impl ApplyOutcome {
    /// Transaction id either way
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            ApplyOutcome::Posted(id) | ApplyOutcome::AlreadyPosted(id) => *id,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<TransactionId, Transaction>,
    idempotency_keys: HashMap<String, TransactionId>,
}

impl LedgerState {
    fn account(&self, id: &AccountId) -> Result<&Account> {
        self.accounts
            .get(id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))
    }

    fn already_posted(&self, tx: &Transaction) -> Option<TransactionId> {
        if let Some(existing) = self.transactions.get(&tx.id) {
            if existing.status == TransactionStatus::Posted {
                return Some(existing.id);
            }
        }
        tx.idempotency_key
            .as_ref()
            .and_then(|key| self.idempotency_keys.get(key))
            .copied()
    }

    /// Read-only checks; returns the net delta per (account, layer)
    fn validate(&self, tx: &Transaction) -> Result<BTreeMap<(AccountId, EntryLayer), Decimal>> {
        tx.validate_shape()?;

        let mut asset: Option<Asset> = None;
        let mut deltas: BTreeMap<(AccountId, EntryLayer), Decimal> = BTreeMap::new();

        for entry in &tx.entries {
            let account = self.account(&entry.account_id)?;

            match asset {
                None => asset = Some(account.asset),
                Some(a) if a != account.asset => {
                    return Err(Error::MixedAssets(tx.id.to_string()));
                }
                Some(_) => {}
            }

            if !account.asset.accepts(entry.amount) {
                return Err(Error::InvalidTransaction(format!(
                    "amount {} exceeds {} precision",
                    entry.amount, account.asset
                )));
            }

            if account.status != AccountStatus::Open {
                return Err(Error::AccountNotActive {
                    account_id: account.id.to_string(),
                    status: account.status.to_string(),
                });
            }

            *deltas
                .entry((entry.account_id.clone(), entry.layer()))
                .or_insert(Decimal::ZERO) += account.delta_for(entry.signed_amount());
        }

        // Funds check
        for ((account_id, layer), delta) in &deltas {
            let account = self.account(account_id)?;
            let current = account.layer_balance(*layer);
            if current + *delta < Decimal::ZERO {
                return Err(Error::InsufficientFunds {
                    account_id: account_id.to_string(),
                    balance: current,
                    required: -*delta,
                });
            }
        }

        Ok(deltas)
    }
}

/// Account arena and posting engine
#[derive(Debug, Default)]
pub struct Ledger {
    state: RwLock<LedgerState>,
}

impl Ledger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger seeded from snapshot accounts
    pub fn from_accounts(accounts: BTreeMap<AccountId, Account>) -> Self {
        let ledger = Self::new();
        ledger.restore(accounts);
        ledger
    }

    /// Create a zero-balance account in `Pending` status
    pub fn create_account(
        &self,
        id: AccountId,
        asset: Asset,
        account_type: AccountType,
    ) -> Result<Account> {
        let mut state = self.state.write();
        if state.accounts.contains_key(&id) {
            return Err(Error::AccountExists(id.to_string()));
        }

        let account = Account::new(id.clone(), asset, account_type);
        state.accounts.insert(id, account.clone());

        tracing::info!(
            account_id = %account.id,
            asset = %asset,
            account_type = ?account_type,
            "Account created"
        );
        Ok(account)
    }

    /// Pending -> Open
    pub fn open_account(&self, id: &AccountId) -> Result<Account> {
        self.transition(id, AccountStatus::Open, |_| Ok(()))
    }

    /// Open -> Frozen
    pub fn freeze_account(&self, id: &AccountId) -> Result<Account> {
        self.transition(id, AccountStatus::Frozen, |_| Ok(()))
    }

    /// Frozen -> Open
    pub fn unfreeze_account(&self, id: &AccountId) -> Result<Account> {
        self.transition(id, AccountStatus::Open, |account| {
            if account.status != AccountStatus::Frozen {
                return Err(Error::InvalidStatusTransition {
                    account_id: id.to_string(),
                    from: account.status.to_string(),
                    to: AccountStatus::Open.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Open|Frozen -> Closed; every balance layer must be zero
    pub fn close_account(&self, id: &AccountId) -> Result<Account> {
        self.transition(id, AccountStatus::Closed, |account| {
            if !account.is_empty() {
                return Err(Error::InvalidStatusTransition {
                    account_id: id.to_string(),
                    from: format!("{} with balance {}", account.status, account.balance),
                    to: AccountStatus::Closed.to_string(),
                });
            }
            Ok(())
        })
    }

    // Status changes are not balance mutations and leave `version` alone.
    // `guard` runs under the same write lock as the change.
    fn transition<F>(&self, id: &AccountId, next: AccountStatus, guard: F) -> Result<Account>
    where
        F: FnOnce(&Account) -> Result<()>,
    {
        let mut state = self.state.write();
        let account = state
            .accounts
            .get_mut(id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;

        guard(&*account)?;
        if !account.status.can_transition_to(next) {
            return Err(Error::InvalidStatusTransition {
                account_id: id.to_string(),
                from: account.status.to_string(),
                to: next.to_string(),
            });
        }

        let from = account.status;
        account.status = next;
        account.updated_at = Utc::now();

        tracing::info!(account_id = %id, %from, to = %next, "Account status changed");
        Ok(account.clone())
    }

    /// Apply a balanced transaction atomically
    ///
    /// # Errors
    ///
    /// - `AccountNotFound`, `AccountNotActive`, `MixedAssets`,
    ///   `InvalidTransaction`, `InsufficientFunds`: rejected, nothing changed
    /// - `UnbalancedTransaction`: rejected, nothing changed; fatal for the
    ///   pipeline since it signals a projector defect
    pub fn apply_transaction(&self, mut tx: Transaction) -> Result<ApplyOutcome> {
        let mut state = self.state.write();

        if let Some(existing) = state.already_posted(&tx) {
            tracing::debug!(transaction_id = %tx.id, "Transaction already posted, skipping");
            return Ok(ApplyOutcome::AlreadyPosted(existing));
        }

        // A rejection is final for its id
        if let Some(existing) = state.transactions.get(&tx.id) {
            if existing.status == TransactionStatus::Rejected {
                return Err(Error::InvalidTransaction(format!(
                    "transaction {} was already rejected",
                    tx.id
                )));
            }
        }

        let deltas = match state.validate(&tx) {
            Ok(deltas) => deltas,
            Err(err) => {
                tracing::info!(transaction_id = %tx.id, error = %err, "Transaction rejected");
                tx.status = TransactionStatus::Rejected;
                state.transactions.insert(tx.id, tx);
                return Err(err);
            }
        };

        // Mutation phase: validation passed, nothing below can fail
        let now = Utc::now();
        let mut touched: Vec<&AccountId> = Vec::with_capacity(deltas.len());
        for ((account_id, layer), delta) in &deltas {
            if let Some(account) = state.accounts.get_mut(account_id) {
                *account.layer_balance_mut(*layer) += *delta;
                if touched.last() != Some(&account_id) {
                    account.version += 1;
                    account.updated_at = now;
                    touched.push(account_id);
                }
            }
        }

        let id = tx.id;
        let affected = touched.len();
        tx.status = TransactionStatus::Posted;
        tx.posted_at = Some(now);
        if let Some(key) = tx.idempotency_key.clone() {
            state.idempotency_keys.insert(key, id);
        }
        state.transactions.insert(id, tx);

        tracing::debug!(transaction_id = %id, accounts = affected, "Transaction posted");
        Ok(ApplyOutcome::Posted(id))
    }

    /// Deep copy of one account
    pub fn account(&self, id: &AccountId) -> Result<Account> {
        self.state.read().account(id).cloned()
    }

    /// Settled balance of one account
    pub fn balance(&self, id: &AccountId) -> Result<Decimal> {
        Ok(self.state.read().account(id)?.balance)
    }

    /// Deep copy of every account
    pub fn accounts(&self) -> BTreeMap<AccountId, Account> {
        self.state
            .read()
            .accounts
            .iter()
            .map(|(id, account)| (id.clone(), account.clone()))
            .collect()
    }

    /// Settled balance of every account
    pub fn balances(&self) -> BTreeMap<AccountId, Decimal> {
        self.state
            .read()
            .accounts
            .iter()
            .map(|(id, account)| (id.clone(), account.balance))
            .collect()
    }

    /// On-hold balance of every account
    pub fn held_balances(&self) -> BTreeMap<AccountId, Decimal> {
        self.state
            .read()
            .accounts
            .iter()
            .map(|(id, account)| (id.clone(), account.held_balance))
            .collect()
    }

    /// Number of accounts
    pub fn account_count(&self) -> usize {
        self.state.read().accounts.len()
    }

    /// True if `id` has been posted
    pub fn is_posted(&self, id: &TransactionId) -> bool {
        self.state
            .read()
            .transactions
            .get(id)
            .map(|tx| tx.status == TransactionStatus::Posted)
            .unwrap_or(false)
    }

    /// Recorded transaction (posted or rejected)
    pub fn transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.state.read().transactions.get(id).cloned()
    }

    /// Posted transaction only
    pub fn posted_transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.transaction(id)
            .filter(|tx| tx.status == TransactionStatus::Posted)
    }

    /// Replace all state with snapshot accounts
    ///
    /// Transaction history is not part of a snapshot; replay after restore
    /// only covers events past the snapshot, so it is not needed.
    pub fn restore(&self, accounts: BTreeMap<AccountId, Account>) {
        let mut state = self.state.write();
        state.accounts = accounts.into_iter().collect();
        state.transactions.clear();
        state.idempotency_keys.clear();
        tracing::info!(accounts = state.accounts.len(), "Ledger restored from snapshot");
    }

    /// Conservation audit: per asset, debit-normal balances equal
    /// credit-normal balances across all layers
    pub fn trial_balance(&self) -> Result<()> {
        let state = self.state.read();
        let mut totals: HashMap<Asset, (Decimal, Decimal)> = HashMap::new();

        for account in state.accounts.values() {
            let total = account.balance + account.pending_balance + account.held_balance;
            let (debits, credits) = totals.entry(account.asset).or_default();
            match account.normal_balance() {
                NormalBalance::Debit => *debits += total,
                NormalBalance::Credit => *credits += total,
            }
        }

        for (asset, (debits, credits)) in totals {
            if debits != credits {
                return Err(Error::InvariantViolation(format!(
                    "{} out of balance: debit-normal {} vs credit-normal {}",
                    asset, debits, credits
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id(s: &str) -> AccountId {
        AccountId::new(s)
    }

    fn new_tx_id() -> TransactionId {
        TransactionId::from_uuid(Uuid::new_v4())
    }

    fn open(ledger: &Ledger, name: &str, account_type: AccountType) {
        ledger.create_account(id(name), Asset::USD, account_type).unwrap();
        ledger.open_account(&id(name)).unwrap();
    }

    fn funded_ledger() -> Ledger {
        let ledger = Ledger::new();
        open(&ledger, "cash", AccountType::Asset);
        open(&ledger, "A", AccountType::Liability);
        open(&ledger, "B", AccountType::Liability);

        let fund = Transaction::builder(new_tx_id())
            .debit("cash", Decimal::from(500))
            .credit("A", Decimal::from(500))
            .build();
        ledger.apply_transaction(fund).unwrap();
        ledger
    }

    #[test]
    fn test_create_account_pending_zero() {
        let ledger = Ledger::new();
        let account = ledger
            .create_account(id("A"), Asset::USD, AccountType::Liability)
            .unwrap();

        assert_eq!(account.status, AccountStatus::Pending);
        assert_eq!(account.balance, Decimal::ZERO);
        assert_eq!(account.version, 0);
        assert!(matches!(
            ledger.create_account(id("A"), Asset::USD, AccountType::Liability),
            Err(Error::AccountExists(_))
        ));
    }

    #[test]
    fn test_transfer_moves_funds_and_versions() {
        let ledger = funded_ledger();

        let transfer = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(100))
            .credit("B", Decimal::from(100))
            .build();
        let outcome = ledger.apply_transaction(transfer.clone()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Posted(transfer.id));

        let a = ledger.account(&id("A")).unwrap();
        let b = ledger.account(&id("B")).unwrap();
        assert_eq!(a.balance, Decimal::from(400));
        assert_eq!(b.balance, Decimal::from(100));
        assert_eq!(a.version, 2);
        assert_eq!(b.version, 1);
        assert!(ledger.is_posted(&transfer.id));
        assert!(ledger.trial_balance().is_ok());
    }

    #[test]
    fn test_insufficient_funds_changes_nothing() {
        let ledger = funded_ledger();
        let before = ledger.accounts();

        let overdraft = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(1000))
            .credit("B", Decimal::from(1000))
            .build();
        let err = ledger.apply_transaction(overdraft.clone()).unwrap_err();

        assert!(matches!(
            err,
            Error::InsufficientFunds { ref account_id, .. } if account_id == "A"
        ));
        assert_eq!(ledger.accounts(), before);
        assert_eq!(
            ledger.transaction(&overdraft.id).unwrap().status,
            TransactionStatus::Rejected
        );
    }

    #[test]
    fn test_idempotent_apply() {
        let ledger = funded_ledger();
        let transfer = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(50))
            .credit("B", Decimal::from(50))
            .build();

        ledger.apply_transaction(transfer.clone()).unwrap();
        let after_first = ledger.accounts();

        let outcome = ledger.apply_transaction(transfer.clone()).unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyPosted(transfer.id));
        assert_eq!(ledger.accounts(), after_first);
    }

    #[test]
    fn test_rejected_id_never_posts_later() {
        let ledger = funded_ledger();
        let overdraft = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(600))
            .credit("B", Decimal::from(600))
            .build();
        assert!(ledger.apply_transaction(overdraft.clone()).is_err());

        let top_up = Transaction::builder(new_tx_id())
            .debit("cash", Decimal::from(500))
            .credit("A", Decimal::from(500))
            .build();
        ledger.apply_transaction(top_up).unwrap();

        // Enough funds now, but the id stays rejected
        assert!(matches!(
            ledger.apply_transaction(overdraft),
            Err(Error::InvalidTransaction(_))
        ));
        assert_eq!(ledger.balance(&id("B")).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_idempotency_key_dedupes_distinct_ids() {
        let ledger = funded_ledger();
        let first = Transaction::builder(new_tx_id())
            .idempotency_key("req-1")
            .debit("A", Decimal::from(10))
            .credit("B", Decimal::from(10))
            .build();
        let retry = Transaction::builder(new_tx_id())
            .idempotency_key("req-1")
            .debit("A", Decimal::from(10))
            .credit("B", Decimal::from(10))
            .build();

        ledger.apply_transaction(first.clone()).unwrap();
        assert_eq!(
            ledger.apply_transaction(retry).unwrap(),
            ApplyOutcome::AlreadyPosted(first.id)
        );
        assert_eq!(ledger.balance(&id("B")).unwrap(), Decimal::from(10));
    }

    #[test]
    fn test_unknown_account_rejected() {
        let ledger = funded_ledger();
        let tx = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(1))
            .credit("ghost", Decimal::from(1))
            .build();
        assert!(ledger.apply_transaction(tx).unwrap_err().is_not_found());
        assert_eq!(ledger.balance(&id("A")).unwrap(), Decimal::from(500));
    }

    #[test]
    fn test_mixed_assets_rejected() {
        let ledger = funded_ledger();
        ledger
            .create_account(id("E"), Asset::EUR, AccountType::Liability)
            .unwrap();
        ledger.open_account(&id("E")).unwrap();

        let tx = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(1))
            .credit("E", Decimal::from(1))
            .build();
        assert!(matches!(
            ledger.apply_transaction(tx),
            Err(Error::MixedAssets(_))
        ));
    }

    #[test]
    fn test_unbalanced_rejected_before_mutation() {
        let ledger = funded_ledger();
        let tx = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(100))
            .credit("B", Decimal::from(90))
            .build();
        let err = ledger.apply_transaction(tx).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ledger.balance(&id("B")).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_frozen_account_refuses_entries() {
        let ledger = funded_ledger();
        ledger.freeze_account(&id("B")).unwrap();

        let tx = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(1))
            .credit("B", Decimal::from(1))
            .build();
        assert!(matches!(
            ledger.apply_transaction(tx.clone()),
            Err(Error::AccountNotActive { .. })
        ));

        ledger.unfreeze_account(&id("B")).unwrap();
        // The rejected id stays rejected; the retry needs a new id
        assert!(matches!(
            ledger.apply_transaction(tx.clone()),
            Err(Error::InvalidTransaction(_))
        ));
        let retry = Transaction::builder(new_tx_id())
            .debit("A", Decimal::from(1))
            .credit("B", Decimal::from(1))
            .build();
        assert!(ledger.apply_transaction(retry).is_ok());
        assert_eq!(ledger.balance(&id("B")).unwrap(), Decimal::from(1));
    }

    #[test]
    fn test_close_requires_zero_balance() {
        let ledger = funded_ledger();
        assert!(matches!(
            ledger.close_account(&id("A")),
            Err(Error::InvalidStatusTransition { .. })
        ));
        let closed = ledger.close_account(&id("B")).unwrap();
        assert_eq!(closed.status, AccountStatus::Closed);
        assert!(ledger.open_account(&id("B")).is_err());
    }

    #[test]
    fn test_close_racing_credit_never_strands_balance() {
        use std::sync::{Arc, Barrier};

        for round in 0..200 {
            let ledger = Arc::new(funded_ledger());
            let target = format!("C{}", round);
            open(&ledger, &target, AccountType::Liability);
            let barrier = Arc::new(Barrier::new(2));

            let closer = {
                let (ledger, barrier, target) = (ledger.clone(), barrier.clone(), target.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.close_account(&id(&target)).is_ok()
                })
            };
            let poster = {
                let (ledger, barrier, target) = (ledger.clone(), barrier.clone(), target.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    let tx = Transaction::builder(new_tx_id())
                        .debit("A", Decimal::from(1))
                        .credit(target.as_str(), Decimal::from(1))
                        .build();
                    ledger.apply_transaction(tx).is_ok()
                })
            };
            let closed = closer.join().unwrap();
            let posted = poster.join().unwrap();

            let account = ledger.account(&id(&target)).unwrap();
            // Whichever goes first, the other must fail
            assert!(!(closed && posted));
            if account.status == AccountStatus::Closed {
                assert!(account.is_empty());
            }
        }
    }

    #[test]
    fn test_hold_layer() {
        let ledger = funded_ledger();
        let hold = Transaction::builder(new_tx_id())
            .debit_layer("A", Decimal::from(200), EntryLayer::Settled)
            .credit_layer("A", Decimal::from(200), EntryLayer::OnHold)
            .build();
        ledger.apply_transaction(hold).unwrap();

        let a = ledger.account(&id("A")).unwrap();
        assert_eq!(a.balance, Decimal::from(300));
        assert_eq!(a.held_balance, Decimal::from(200));
        // One transaction, one version bump, even with two entries on A
        assert_eq!(a.version, 2);

        let too_much = Transaction::builder(new_tx_id())
            .debit_layer("A", Decimal::from(201), EntryLayer::OnHold)
            .credit_layer("A", Decimal::from(201), EntryLayer::Settled)
            .build();
        assert!(matches!(
            ledger.apply_transaction(too_much),
            Err(Error::InsufficientFunds { .. })
        ));
        assert!(ledger.trial_balance().is_ok());
    }

    #[test]
    fn test_restore_replaces_state() {
        let ledger = funded_ledger();
        let snapshot = ledger.accounts();

        let restored = Ledger::from_accounts(snapshot.clone());
        assert_eq!(restored.accounts(), snapshot);
        assert_eq!(restored.balance(&id("A")).unwrap(), Decimal::from(500));
    }
}
