//! Persistence traits for trades and venues.
//!
//! The store is the authority for ordering: every state-changing operation
//! re-reads the record and performs a conditional write, so racing handlers
//! see [`StoreError::Conflict`] instead of silently clobbering each other.
//! Membership-style fields (joins, approvals, seen deposit hashes) use
//! atomic add-to-set operations so duplicate delivery of the same external
//! event is absorbed rather than counted.

mod postgres;

pub use postgres::PgStore;

use async_trait::async_trait;
use alloy_primitives::U256;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entities::{
    BroadcastEffect, PendingSettlement, SettlementKind, Trade, TradeStatus, UserId, Venue,
    VenueId, VenueStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("trade {0} not found")]
    TradeNotFound(Uuid),
    #[error("venue {0} not found")]
    VenueNotFound(VenueId),
    /// A conditional write found the record in an unexpected state. The
    /// caller may re-read and retry; nothing was written.
    #[error("conditional write rejected: {0}")]
    Conflict(&'static str),
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Everything a successful settlement writes back in one conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementUpdate {
    pub kind: SettlementKind,
    pub amount: Decimal,
    pub amount_wei: U256,
    pub tx_hash: String,
    /// Full payout (or a partial that drains the balance): zero the balances
    /// and move to the terminal status for `kind`.
    pub exhausts_balance: bool,
    /// Persisted recycle deadline, set on terminal settlements.
    pub recycle_after: Option<OffsetDateTime>,
}

/// Durable trade records.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert(&self, trade: &Trade) -> Result<(), StoreError>;

    async fn fetch(&self, trade_id: Uuid) -> Result<Trade, StoreError>;

    /// The single non-terminal trade bound to a venue, if any.
    async fn fetch_by_venue(
        &self,
        venue: VenueId,
        statuses: &[TradeStatus],
    ) -> Result<Option<Trade>, StoreError>;

    /// Trades in any of `statuses`; all trades when empty. Newest first.
    async fn list(&self, statuses: &[TradeStatus]) -> Result<Vec<Trade>, StoreError>;

    /// Full-row conditional write: applies `trade` only while the stored
    /// status is one of `expected` (any status when `expected` is empty).
    async fn persist(&self, trade: &Trade, expected: &[TradeStatus]) -> Result<(), StoreError>;

    /// Delete the trade while it is in one of `expected` (any status when
    /// empty). `false` means the guard rejected: the trade advanced
    /// concurrently and must not be removed.
    async fn delete(&self, trade_id: Uuid, expected: &[TradeStatus]) -> Result<bool, StoreError>;

    /// Add-to-set join. Returns the updated record so quorum is recomputed
    /// from what is actually stored.
    async fn add_joined(&self, trade_id: Uuid, user: UserId) -> Result<Trade, StoreError>;

    /// Add-to-set approval for one settlement kind. Returns the updated record.
    async fn add_approval(
        &self,
        trade_id: Uuid,
        kind: SettlementKind,
        user: UserId,
    ) -> Result<Trade, StoreError>;

    /// Clear the whole approval set of one kind (declining resets both
    /// parties, no partial carry-over).
    async fn clear_approvals(
        &self,
        trade_id: Uuid,
        kind: SettlementKind,
    ) -> Result<Trade, StoreError>;

    /// Atomically credit confirmed deposits: add the hashes to the seen set,
    /// add the amounts to both balances, advance the scan cursor, and move to
    /// `deposited` — but only if none of `hashes` was already seen and the
    /// status is one of `expected`. Returns `None` when the guard rejected
    /// the write (a concurrent check already credited these transfers).
    async fn credit_deposit(
        &self,
        trade_id: Uuid,
        hashes: &[String],
        amount: Decimal,
        amount_wei: U256,
        head_block: u64,
        expected: &[TradeStatus],
    ) -> Result<Option<Trade>, StoreError>;

    /// Advance the deposit scan cursor monotonically. A concurrent credit
    /// that already moved it further wins; nothing else on the record is
    /// touched.
    async fn advance_scan_cursor(&self, trade_id: Uuid, to_block: u64) -> Result<(), StoreError>;

    /// Apply a confirmed settlement. Balances are adjusted additively so a
    /// concurrent deposit credit is never lost. The write is keyed to the
    /// verification marker recorded at submission time: once one caller
    /// finalizes a transaction, a second attempt (engine poll racing the
    /// reconciler) is rejected with [`StoreError::Conflict`].
    async fn apply_settlement(
        &self,
        trade_id: Uuid,
        update: &SettlementUpdate,
        expected: &[TradeStatus],
    ) -> Result<Trade, StoreError>;

    /// Park a submitted-but-unconfirmed settlement for the reconciler.
    async fn record_verification(
        &self,
        trade_id: Uuid,
        pending: &PendingSettlement,
        expected: &[TradeStatus],
    ) -> Result<(), StoreError>;

    /// Drop the parked settlement marker (the transaction failed on-chain).
    async fn clear_verification(&self, trade_id: Uuid) -> Result<(), StoreError>;

    /// Test-and-set a broadcast idempotency flag. For settlement broadcasts
    /// the flag is keyed to the settlement's transaction hash: a stale event
    /// carrying a different hash does not claim the flag. Returns `true`
    /// exactly once per effect.
    async fn try_mark_effect(
        &self,
        trade_id: Uuid,
        effect: BroadcastEffect,
        tx_hash: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Drafts whose persisted join deadline has passed.
    async fn join_timeouts_due(&self, now: OffsetDateTime) -> Result<Vec<Trade>, StoreError>;

    /// Terminal trades whose persisted recycle deadline has passed.
    async fn recycles_due(&self, now: OffsetDateTime) -> Result<Vec<Trade>, StoreError>;

    /// Trades carrying a parked settlement awaiting reconciliation.
    async fn pending_verifications(&self) -> Result<Vec<Trade>, StoreError>;
}

/// Durable venue pool records.
#[async_trait]
pub trait VenueStore: Send + Sync {
    /// Provision a venue if it is not already known. Existing rows keep
    /// their state.
    async fn ensure(&self, venue: &Venue) -> Result<(), StoreError>;

    async fn fetch_venue(&self, venue_id: VenueId) -> Result<Venue, StoreError>;

    async fn fetch_by_trade(&self, trade_id: Uuid) -> Result<Option<Venue>, StoreError>;

    async fn list_venues(&self) -> Result<Vec<Venue>, StoreError>;

    /// Atomically claim the first available venue for a trade. `None` means
    /// the pool is exhausted; racing claims each get distinct venues.
    async fn try_claim(
        &self,
        trade_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<Venue>, StoreError>;

    /// Full-row conditional write guarded on the expected prior status
    /// (any status when `expected` is empty).
    async fn persist_venue(
        &self,
        venue: &Venue,
        expected: &[VenueStatus],
    ) -> Result<(), StoreError>;
}
