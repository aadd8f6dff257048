//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode, JSON for snapshots)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (Decimal for money, never floating point)

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Account identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// ISO 4217 asset code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Asset {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// UAE Dirham
    AED,
    /// Indian Rupee
    INR,
}

impl Asset {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Asset::USD => "USD",
            Asset::EUR => "EUR",
            Asset::GBP => "GBP",
            Asset::AED => "AED",
            Asset::INR => "INR",
        }
    }

    /// Number of minor-unit digits an amount may carry
    pub fn precision(&self) -> u32 {
        match self {
            Asset::USD | Asset::EUR | Asset::GBP | Asset::AED | Asset::INR => 2,
        }
    }

    /// True if `amount` fits the asset's minor units
    pub fn accepts(&self, amount: Decimal) -> bool {
        amount.normalize().scale() <= self.precision()
    }
}

impl FromStr for Asset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "USD" => Ok(Asset::USD),
            "EUR" => Ok(Asset::EUR),
            "GBP" => Ok(Asset::GBP),
            "AED" => Ok(Asset::AED),
            "INR" => Ok(Asset::INR),
            other => Err(Error::InvalidTransaction(format!("unknown asset {}", other))),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Side of the books an account type grows on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalBalance {
    /// Increases on debit (assets, expenses)
    Debit,
    /// Increases on credit (liabilities, equity, revenue)
    Credit,
}

/// Account classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    /// Asset
    Asset,
    /// Liability (customer balances live here)
    Liability,
    /// Equity
    Equity,
    /// Revenue
    Revenue,
    /// Expense
    Expense,
}

impl AccountType {
    /// Derived normal balance
    pub fn normal_balance(&self) -> NormalBalance {
        match self {
            AccountType::Asset | AccountType::Expense => NormalBalance::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Revenue => {
                NormalBalance::Credit
            }
        }
    }
}

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Created, not yet usable
    Pending,
    /// Accepts entries
    Open,
    /// Temporarily blocked
    Frozen,
    /// Terminal
    Closed,
}

impl AccountStatus {
    /// Whether `self -> next` is a legal lifecycle move
    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        use AccountStatus::*;
        matches!(
            (self, next),
            (Pending, Open) | (Open, Frozen) | (Frozen, Open) | (Open, Closed) | (Frozen, Closed)
        )
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Open => "open",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Ledger account, owned exclusively by [`crate::Ledger`]
///
/// Balances are kept in the account's natural sign: a debit-normal account
/// grows on debit, a credit-normal account grows on credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,

    /// Asset held
    pub asset: Asset,

    /// Classification
    pub account_type: AccountType,

    /// Lifecycle status
    pub status: AccountStatus,

    /// Settled balance
    pub balance: Decimal,

    /// Pending layer
    #[serde(default)]
    pub pending_balance: Decimal,

    /// On-hold layer
    #[serde(default)]
    pub held_balance: Decimal,

    /// Incremented by one on every applied transaction
    pub version: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// New zero-balance account in `Pending` status
    pub fn new(id: AccountId, asset: Asset, account_type: AccountType) -> Self {
        let now = Utc::now();
        Self {
            id,
            asset,
            account_type,
            status: AccountStatus::Pending,
            balance: Decimal::ZERO,
            pending_balance: Decimal::ZERO,
            held_balance: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derived normal balance
    pub fn normal_balance(&self) -> NormalBalance {
        self.account_type.normal_balance()
    }

    /// Balance of one layer
    pub fn layer_balance(&self, layer: EntryLayer) -> Decimal {
        match layer {
            EntryLayer::Settled => self.balance,
            EntryLayer::Pending => self.pending_balance,
            EntryLayer::OnHold => self.held_balance,
        }
    }

    pub(crate) fn layer_balance_mut(&mut self, layer: EntryLayer) -> &mut Decimal {
        match layer {
            EntryLayer::Settled => &mut self.balance,
            EntryLayer::Pending => &mut self.pending_balance,
            EntryLayer::OnHold => &mut self.held_balance,
        }
    }

    /// Effect of a signed entry amount (credits positive) on this account's
    /// natural-sign balance
    pub fn delta_for(&self, signed_amount: Decimal) -> Decimal {
        match self.normal_balance() {
            NormalBalance::Credit => signed_amount,
            NormalBalance::Debit => -signed_amount,
        }
    }

    /// True when every layer is zero
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.pending_balance.is_zero() && self.held_balance.is_zero()
    }
}

/// Entry direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Debit
    Debit,
    /// Credit
    Credit,
}

/// Balance layer an entry posts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryLayer {
    /// Settled funds
    Settled,
    /// In flight
    Pending,
    /// Reserved
    OnHold,
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Wrap a UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One leg of a transaction. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Owning transaction
    pub transaction_id: TransactionId,

    /// Account touched
    pub account_id: AccountId,

    /// Debit or credit
    pub direction: Direction,

    /// Always positive
    pub amount: Decimal,

    /// Balance layer; `None` means settled
    pub layer: Option<EntryLayer>,
}

impl Entry {
    /// Credits positive, debits negative
    pub fn signed_amount(&self) -> Decimal {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }

    /// Effective layer
    pub fn layer(&self) -> EntryLayer {
        self.layer.unwrap_or(EntryLayer::Settled)
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Built, not yet applied
    Pending,
    /// Applied to the ledger (terminal)
    Posted,
    /// Refused by the ledger (terminal)
    Rejected,
}

/// Balanced double-entry transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: TransactionId,

    /// Caller-supplied idempotency key
    pub idempotency_key: Option<String>,

    /// Event this transaction was derived from
    pub source_event: Option<Uuid>,

    /// Ordered entries (at least two)
    pub entries: Vec<Entry>,

    /// Status
    pub status: TransactionStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Posting timestamp
    pub posted_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Start building a transaction
    pub fn builder(id: TransactionId) -> TransactionBuilder {
        TransactionBuilder::new(id)
    }

    /// Signed sum of all entries (zero when balanced)
    pub fn signed_sum(&self) -> Decimal {
        self.entries.iter().map(Entry::signed_amount).sum()
    }

    /// Double-entry check
    pub fn is_balanced(&self) -> bool {
        self.signed_sum().is_zero()
    }

    /// Structural checks that need no account state
    pub fn validate_shape(&self) -> Result<()> {
        if self.entries.len() < 2 {
            return Err(Error::InvalidTransaction(format!(
                "transaction {} has {} entries, need at least 2",
                self.id,
                self.entries.len()
            )));
        }

        for entry in &self.entries {
            if entry.amount <= Decimal::ZERO {
                return Err(Error::InvalidTransaction(format!(
                    "entry on {} has non-positive amount {}",
                    entry.account_id, entry.amount
                )));
            }
            if entry.transaction_id != self.id {
                return Err(Error::InvalidTransaction(format!(
                    "entry on {} belongs to transaction {}",
                    entry.account_id, entry.transaction_id
                )));
            }
        }

        let sum = self.signed_sum();
        if !sum.is_zero() {
            return Err(Error::UnbalancedTransaction {
                transaction_id: self.id.to_string(),
                sum,
            });
        }

        Ok(())
    }
}

/// Builder for [`Transaction`]
#[derive(Debug)]
pub struct TransactionBuilder {
    id: TransactionId,
    idempotency_key: Option<String>,
    source_event: Option<Uuid>,
    entries: Vec<Entry>,
    created_at: Option<DateTime<Utc>>,
}

impl TransactionBuilder {
    fn new(id: TransactionId) -> Self {
        Self {
            id,
            idempotency_key: None,
            source_event: None,
            entries: Vec::with_capacity(2),
            created_at: None,
        }
    }

    /// Set idempotency key
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Record the source event
    pub fn source_event(mut self, event_id: Uuid) -> Self {
        self.source_event = Some(event_id);
        self
    }

    /// Pin the creation timestamp (defaults to now)
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Settled debit
    pub fn debit(self, account: impl Into<AccountId>, amount: Decimal) -> Self {
        self.entry(account.into(), Direction::Debit, amount, None)
    }

    /// Settled credit
    pub fn credit(self, account: impl Into<AccountId>, amount: Decimal) -> Self {
        self.entry(account.into(), Direction::Credit, amount, None)
    }

    /// Debit on a specific layer
    pub fn debit_layer(self, account: impl Into<AccountId>, amount: Decimal, layer: EntryLayer) -> Self {
        self.entry(account.into(), Direction::Debit, amount, Some(layer))
    }

    /// Credit on a specific layer
    pub fn credit_layer(self, account: impl Into<AccountId>, amount: Decimal, layer: EntryLayer) -> Self {
        self.entry(account.into(), Direction::Credit, amount, Some(layer))
    }

    fn entry(
        mut self,
        account_id: AccountId,
        direction: Direction,
        amount: Decimal,
        layer: Option<EntryLayer>,
    ) -> Self {
        self.entries.push(Entry {
            transaction_id: self.id,
            account_id,
            direction,
            amount,
            layer,
        });
        self
    }

    /// Finish; the transaction starts `Pending`
    ///
    /// Nothing is validated here. Unbalanced results are returned as-is so
    /// the caller decides whether that is fatal.
    pub fn build(self) -> Transaction {
        Transaction {
            id: self.id,
            idempotency_key: self.idempotency_key,
            source_event: self.source_event,
            entries: self.entries,
            status: TransactionStatus::Pending,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            posted_at: None,
        }
    }
}
