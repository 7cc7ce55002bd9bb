//! Event types flowing from the engine to its processors.

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::entities::{SettlementKind, VenueId};

/// Deadline classes the scheduler arms per trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// The draft's join window: fire deletes the trade and frees its venue.
    JoinTimeout,
    /// The post-settlement grace window: fire recycles the venue.
    Recycle,
}

/// A scheduled deadline came due. The dispatch loop re-checks the trade
/// record before acting, so stale or duplicate fires are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub trade_id: Uuid,
    pub kind: TimerKind,
}

/// Venue-facing notifications produced by the engine and delivered by the
/// notifier. Delivery failures are logged and swallowed; the three broadcast
/// variants are additionally guarded by per-trade idempotency flags.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    DepositConfirmed {
        trade_id: Uuid,
        venue: VenueId,
        amount: Decimal,
        total: Decimal,
    },
    /// Total deposits are still below the agreed quantity. Sent at most once
    /// per trade.
    PartialDeposit {
        trade_id: Uuid,
        venue: VenueId,
        total: Decimal,
        expected: Decimal,
    },
    /// Terminal release broadcast. Sent at most once, keyed to the tx hash.
    TradeCompleted {
        trade_id: Uuid,
        venue: VenueId,
        amount: Decimal,
        fee: Decimal,
        tx_hash: String,
    },
    /// Terminal refund broadcast. Sent at most once, keyed to the tx hash.
    TradeRefunded {
        trade_id: Uuid,
        venue: VenueId,
        amount: Decimal,
        tx_hash: String,
    },
    /// A partial settlement went through and the trade stays active.
    PartialSettled {
        trade_id: Uuid,
        venue: VenueId,
        kind: SettlementKind,
        amount: Decimal,
        remaining: Decimal,
        tx_hash: String,
    },
    /// A draft expired before reaching quorum and was deleted.
    TradeExpired {
        trade_id: Uuid,
        venue: Option<VenueId>,
    },
}

impl NotificationEvent {
    pub fn trade_id(&self) -> Uuid {
        match self {
            NotificationEvent::DepositConfirmed { trade_id, .. }
            | NotificationEvent::PartialDeposit { trade_id, .. }
            | NotificationEvent::TradeCompleted { trade_id, .. }
            | NotificationEvent::TradeRefunded { trade_id, .. }
            | NotificationEvent::PartialSettled { trade_id, .. }
            | NotificationEvent::TradeExpired { trade_id, .. } => *trade_id,
        }
    }

    pub fn venue(&self) -> Option<VenueId> {
        match self {
            NotificationEvent::DepositConfirmed { venue, .. }
            | NotificationEvent::PartialDeposit { venue, .. }
            | NotificationEvent::TradeCompleted { venue, .. }
            | NotificationEvent::TradeRefunded { venue, .. }
            | NotificationEvent::PartialSettled { venue, .. } => Some(*venue),
            NotificationEvent::TradeExpired { venue, .. } => *venue,
        }
    }
}
