//! The trade record: single source of truth for one custodial trade.

use std::collections::BTreeSet;
use std::str::FromStr;

use alloy_primitives::U256;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ChainName, TokenSymbol, UnknownCode, UserId, VenueId};

/// Trade lifecycle.
///
/// ```text
/// draft -> awaiting_details -> awaiting_deposit -> deposited
///       -> in_fiat_transfer -> ready_to_release -> completed
/// ```
///
/// plus `disputed` (reachable from any funded status) and `refunded`
/// (reachable from any funded status and from `disputed`). A `draft` that
/// never reaches quorum is deleted rather than parked in a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Draft,
    AwaitingDetails,
    AwaitingDeposit,
    Deposited,
    InFiatTransfer,
    ReadyToRelease,
    Disputed,
    Completed,
    Refunded,
}

impl TradeStatus {
    /// Statuses in which custodied funds are (or may be) held for the trade.
    pub const FUNDED: [TradeStatus; 4] = [
        TradeStatus::Deposited,
        TradeStatus::InFiatTransfer,
        TradeStatus::ReadyToRelease,
        TradeStatus::Disputed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Draft => "draft",
            TradeStatus::AwaitingDetails => "awaiting_details",
            TradeStatus::AwaitingDeposit => "awaiting_deposit",
            TradeStatus::Deposited => "deposited",
            TradeStatus::InFiatTransfer => "in_fiat_transfer",
            TradeStatus::ReadyToRelease => "ready_to_release",
            TradeStatus::Disputed => "disputed",
            TradeStatus::Completed => "completed",
            TradeStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::Refunded)
    }

    pub fn is_funded(&self) -> bool {
        Self::FUNDED.contains(self)
    }
}

impl FromStr for TradeStatus {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TradeStatus::Draft),
            "awaiting_details" => Ok(TradeStatus::AwaitingDetails),
            "awaiting_deposit" => Ok(TradeStatus::AwaitingDeposit),
            "deposited" => Ok(TradeStatus::Deposited),
            "in_fiat_transfer" => Ok(TradeStatus::InFiatTransfer),
            "ready_to_release" => Ok(TradeStatus::ReadyToRelease),
            "disputed" => Ok(TradeStatus::Disputed),
            "completed" => Ok(TradeStatus::Completed),
            "refunded" => Ok(TradeStatus::Refunded),
            other => Err(UnknownCode {
                kind: "trade status",
                value: other.to_owned(),
            }),
        }
    }
}

/// The two sides of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeRole {
    Buyer,
    Seller,
}

impl TradeRole {
    pub fn opposite(self) -> Self {
        match self {
            TradeRole::Buyer => TradeRole::Seller,
            TradeRole::Seller => TradeRole::Buyer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeRole::Buyer => "buyer",
            TradeRole::Seller => "seller",
        }
    }
}

/// Direction of a fund movement: release pays the buyer, refund returns the
/// deposit to the seller. Also keys the two independent approval sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Release,
    Refund,
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementKind::Release => "release",
            SettlementKind::Refund => "refund",
        }
    }

    /// The role the settled funds are paid out to.
    pub fn payout_role(&self) -> TradeRole {
        match self {
            SettlementKind::Release => TradeRole::Buyer,
            SettlementKind::Refund => TradeRole::Seller,
        }
    }
}

impl FromStr for SettlementKind {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "release" => Ok(SettlementKind::Release),
            "refund" => Ok(SettlementKind::Refund),
            other => Err(UnknownCode {
                kind: "settlement kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// One side-effect broadcast that must happen at most once per trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastEffect {
    Completed,
    Refunded,
    PartialDeposit,
}

impl BroadcastEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastEffect::Completed => "completed",
            BroadcastEffect::Refunded => "refunded",
            BroadcastEffect::PartialDeposit => "partial_deposit",
        }
    }
}

/// A participant slot: platform user id plus optional display handle.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Participant {
    pub user: UserId,
    pub handle: Option<String>,
}

impl Participant {
    pub fn new(user: UserId, handle: Option<String>) -> Self {
        Self { user, handle }
    }
}

/// Agreed terms of the trade.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Terms {
    pub token: TokenSymbol,
    pub chain: ChainName,
    /// Token quantity the seller is expected to deposit, in human units.
    pub quantity: Decimal,
    /// Fiat price per token unit.
    pub rate: Decimal,
    pub payment_method: String,
}

/// A submitted settlement whose confirmation was not observed within the
/// polling budget. Kept on the trade so the reconciler can finalize it once
/// the receipt shows up; the transaction may still land at any time, so the
/// movement must never be resubmitted while this is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSettlement {
    pub kind: SettlementKind,
    pub tx_hash: String,
    pub amount: Decimal,
    pub amount_wei: U256,
    /// Whether a confirmed landing zeroes the trade (full payout or a partial
    /// that drains the remaining balance).
    pub exhausts_balance: bool,
    pub submitted_at: OffsetDateTime,
}

/// One custodial trade, end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub trade_id: Uuid,
    pub status: TradeStatus,
    pub venue_id: Option<VenueId>,

    pub creator: Participant,
    pub buyer: Option<Participant>,
    pub seller: Option<Participant>,
    /// Users whose venue join was approved, creator included. Add-to-set:
    /// duplicate join events are absorbed rather than counted.
    pub joined: BTreeSet<UserId>,

    pub terms: Option<Terms>,
    pub buyer_address: Option<String>,
    pub seller_address: Option<String>,
    pub deposit_address: Option<String>,

    /// Accumulated confirmed deposits, human units.
    pub balance: Decimal,
    /// Exact integer-unit mirror of `balance`. Full payouts use this verbatim
    /// so no decimal rounding drift reaches the chain.
    pub balance_wei: Option<U256>,
    pub last_checked_block: u64,
    /// Transaction hashes already credited; transfers seen through both the
    /// RPC scan and the explorer fallback are counted once.
    pub seen_deposit_hashes: BTreeSet<String>,

    pub release_approvals: BTreeSet<UserId>,
    pub refund_approvals: BTreeSet<UserId>,
    /// Explicitly staged partial amount; `None` means settle the full balance.
    pub pending_amount: Option<Decimal>,

    pub release_tx_hash: Option<String>,
    pub refund_tx_hash: Option<String>,
    pub pending_verification: Option<PendingSettlement>,

    pub completed_broadcast_sent: bool,
    pub refunded_broadcast_sent: bool,
    pub partial_deposit_broadcast_sent: bool,

    pub join_deadline: Option<OffsetDateTime>,
    pub recycle_after: Option<OffsetDateTime>,

    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Trade {
    /// A fresh draft. The creator counts as joined; the venue, deadline and
    /// everything else are filled in by the engine as the trade advances.
    pub fn new(creator: Participant) -> Self {
        let now = OffsetDateTime::now_utc();
        let mut joined = BTreeSet::new();
        joined.insert(creator.user);
        Self {
            trade_id: Uuid::now_v7(),
            status: TradeStatus::Draft,
            venue_id: None,
            creator,
            buyer: None,
            seller: None,
            joined,
            terms: None,
            buyer_address: None,
            seller_address: None,
            deposit_address: None,
            balance: Decimal::ZERO,
            balance_wei: None,
            last_checked_block: 0,
            seen_deposit_hashes: BTreeSet::new(),
            release_approvals: BTreeSet::new(),
            refund_approvals: BTreeSet::new(),
            pending_amount: None,
            release_tx_hash: None,
            refund_tx_hash: None,
            pending_verification: None,
            completed_broadcast_sent: false,
            refunded_broadcast_sent: false,
            partial_deposit_broadcast_sent: false,
            join_deadline: None,
            recycle_after: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn participant(&self, role: TradeRole) -> Option<&Participant> {
        match role {
            TradeRole::Buyer => self.buyer.as_ref(),
            TradeRole::Seller => self.seller.as_ref(),
        }
    }

    /// The role `user` holds, if any.
    pub fn role_of(&self, user: UserId) -> Option<TradeRole> {
        if self.buyer.as_ref().is_some_and(|p| p.user == user) {
            Some(TradeRole::Buyer)
        } else if self.seller.as_ref().is_some_and(|p| p.user == user) {
            Some(TradeRole::Seller)
        } else {
            None
        }
    }

    /// Whether `user` was admitted to the trade (creator included).
    pub fn is_participant(&self, user: UserId) -> bool {
        self.joined.contains(&user)
    }

    pub fn both_roles_claimed(&self) -> bool {
        self.buyer.is_some() && self.seller.is_some()
    }

    /// Everything a deposit needs: both roles, terms, both payout addresses.
    pub fn details_complete(&self) -> bool {
        self.both_roles_claimed()
            && self.terms.is_some()
            && self.buyer_address.is_some()
            && self.seller_address.is_some()
    }

    pub fn payout_address(&self, kind: SettlementKind) -> Option<&str> {
        match kind {
            SettlementKind::Release => self.buyer_address.as_deref(),
            SettlementKind::Refund => self.seller_address.as_deref(),
        }
    }

    pub fn approvals(&self, kind: SettlementKind) -> &BTreeSet<UserId> {
        match kind {
            SettlementKind::Release => &self.release_approvals,
            SettlementKind::Refund => &self.refund_approvals,
        }
    }

    /// True once both the buyer and the seller are in the approval set.
    pub fn has_settlement_quorum(&self, kind: SettlementKind) -> bool {
        let (Some(buyer), Some(seller)) = (self.buyer.as_ref(), self.seller.as_ref()) else {
            return false;
        };
        let approvals = self.approvals(kind);
        approvals.contains(&buyer.user) && approvals.contains(&seller.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: i64) -> Participant {
        Participant::new(UserId(id), None)
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            TradeStatus::Draft,
            TradeStatus::AwaitingDetails,
            TradeStatus::AwaitingDeposit,
            TradeStatus::Deposited,
            TradeStatus::InFiatTransfer,
            TradeStatus::ReadyToRelease,
            TradeStatus::Disputed,
            TradeStatus::Completed,
            TradeStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<TradeStatus>(), Ok(status));
        }
        assert!("paid".parse::<TradeStatus>().is_err());
    }

    #[test]
    fn funded_statuses_exclude_terminals() {
        assert!(TradeStatus::Deposited.is_funded());
        assert!(TradeStatus::Disputed.is_funded());
        assert!(!TradeStatus::Completed.is_funded());
        assert!(!TradeStatus::Draft.is_funded());
        assert!(TradeStatus::Completed.is_terminal());
        assert!(TradeStatus::Refunded.is_terminal());
    }

    #[test]
    fn creator_counts_as_joined() {
        let trade = Trade::new(participant(10));
        assert!(trade.joined.contains(&UserId(10)));
        assert_eq!(trade.status, TradeStatus::Draft);
    }

    #[test]
    fn role_lookup_covers_both_slots() {
        let mut trade = Trade::new(participant(10));
        trade.buyer = Some(participant(10));
        trade.seller = Some(participant(20));
        assert_eq!(trade.role_of(UserId(10)), Some(TradeRole::Buyer));
        assert_eq!(trade.role_of(UserId(20)), Some(TradeRole::Seller));
        assert_eq!(trade.role_of(UserId(30)), None);
        assert!(trade.both_roles_claimed());
    }

    #[test]
    fn settlement_quorum_requires_both_parties() {
        let mut trade = Trade::new(participant(10));
        trade.buyer = Some(participant(10));
        trade.seller = Some(participant(20));

        trade.release_approvals.insert(UserId(10));
        assert!(!trade.has_settlement_quorum(SettlementKind::Release));

        // The same user approving twice does not reach quorum.
        trade.release_approvals.insert(UserId(10));
        assert!(!trade.has_settlement_quorum(SettlementKind::Release));

        trade.release_approvals.insert(UserId(20));
        assert!(trade.has_settlement_quorum(SettlementKind::Release));
        assert!(!trade.has_settlement_quorum(SettlementKind::Refund));
    }

    #[test]
    fn quorum_without_roles_is_never_reached() {
        let mut trade = Trade::new(participant(10));
        trade.release_approvals.insert(UserId(10));
        trade.release_approvals.insert(UserId(20));
        assert!(!trade.has_settlement_quorum(SettlementKind::Release));
    }
}
