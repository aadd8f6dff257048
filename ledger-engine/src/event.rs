//! Domain events
//!
//! Events are immutable facts. The payload is a closed enum so the
//! projector's translation is an exhaustive `match`, checked by the
//! compiler, rather than runtime type inspection.

use crate::types::{AccountId, AccountType, Asset};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Immutable, append-only fact record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Aggregate this event belongs to
    pub aggregate_id: String,

    /// Per-aggregate version, starting at 1
    pub version: u64,

    /// Global sequence, assigned by the event store (0 until appended)
    pub sequence: u64,

    /// What happened
    pub payload: EventPayload,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new, not yet sequenced event
    pub fn new(aggregate_id: impl Into<String>, version: u64, payload: EventPayload) -> Self {
        Self {
            id: Uuid::now_v7(),
            aggregate_id: aggregate_id.into(),
            version,
            sequence: 0,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Type tag derived from the payload
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Copy of this event stamped with a global sequence
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Event payloads known to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    /// Account created and opened
    AccountOpened {
        /// New account
        account_id: AccountId,
        /// Asset held
        asset: Asset,
        /// Classification
        account_type: AccountType,
    },

    /// Account blocked
    AccountFrozen {
        /// Account
        account_id: AccountId,
    },

    /// Account unblocked
    AccountUnfrozen {
        /// Account
        account_id: AccountId,
    },

    /// Account closed (terminal)
    AccountClosed {
        /// Account
        account_id: AccountId,
    },

    /// External money came in
    FundsDeposited {
        /// Customer account credited
        account_id: AccountId,
        /// Funding account debited
        funding_account: AccountId,
        /// Asset
        asset: Asset,
        /// Amount
        amount: Decimal,
    },

    /// Money paid out
    FundsWithdrawn {
        /// Customer account debited
        account_id: AccountId,
        /// Settlement account credited
        settlement_account: AccountId,
        /// Asset
        asset: Asset,
        /// Amount
        amount: Decimal,
    },

    /// Internal transfer between two accounts
    TransferCompleted {
        /// Debited account
        from: AccountId,
        /// Credited account
        to: AccountId,
        /// Asset
        asset: Asset,
        /// Amount
        amount: Decimal,
    },

    /// Settled funds moved to the on-hold layer
    FundsHeld {
        /// Account
        account_id: AccountId,
        /// Asset
        asset: Asset,
        /// Amount
        amount: Decimal,
    },

    /// On-hold funds returned to the settled layer
    HoldReleased {
        /// Account
        account_id: AccountId,
        /// Asset
        asset: Asset,
        /// Amount
        amount: Decimal,
    },

    /// Free-form annotation with no ledger effect
    Annotated {
        /// Note text
        note: String,
    },
}

impl EventPayload {
    /// Type tag
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::AccountOpened { .. } => EventType::AccountOpened,
            EventPayload::AccountFrozen { .. } => EventType::AccountFrozen,
            EventPayload::AccountUnfrozen { .. } => EventType::AccountUnfrozen,
            EventPayload::AccountClosed { .. } => EventType::AccountClosed,
            EventPayload::FundsDeposited { .. } => EventType::FundsDeposited,
            EventPayload::FundsWithdrawn { .. } => EventType::FundsWithdrawn,
            EventPayload::TransferCompleted { .. } => EventType::TransferCompleted,
            EventPayload::FundsHeld { .. } => EventType::FundsHeld,
            EventPayload::HoldReleased { .. } => EventType::HoldReleased,
            EventPayload::Annotated { .. } => EventType::Annotated,
        }
    }
}

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// Account opened
    AccountOpened = 1,
    /// Account frozen
    AccountFrozen = 2,
    /// Account unfrozen
    AccountUnfrozen = 3,
    /// Account closed
    AccountClosed = 4,
    /// Deposit
    FundsDeposited = 5,
    /// Withdrawal
    FundsWithdrawn = 6,
    /// Transfer
    TransferCompleted = 7,
    /// Hold placed
    FundsHeld = 8,
    /// Hold released
    HoldReleased = 9,
    /// Annotation
    Annotated = 10,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_from_payload() {
        let event = Event::new(
            "acct-A",
            1,
            EventPayload::AccountFrozen {
                account_id: AccountId::new("A"),
            },
        );
        assert_eq!(event.event_type(), EventType::AccountFrozen);
        assert_eq!(event.sequence, 0);
    }

    #[test]
    fn test_bincode_roundtrip_preserves_payload() {
        let event = Event::new(
            "transfer-1",
            1,
            EventPayload::TransferCompleted {
                from: AccountId::new("A"),
                to: AccountId::new("B"),
                asset: Asset::USD,
                amount: Decimal::new(10050, 2),
            },
        )
        .with_sequence(7);

        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, event);
    }
}
