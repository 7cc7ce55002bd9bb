//! In-memory store with the same conditional-write semantics as [`PgStore`]:
//! status guards, add-to-set joins, the seen-hash overlap check, the
//! verification-keyed settlement apply, and the monotonic scan cursor.
//! Every operation runs atomically under one lock, like its single-statement
//! SQL counterpart.
//!
//! [`PgStore`]: crate::store::PgStore

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use alloy_primitives::U256;
use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entities::{
    BroadcastEffect, PendingSettlement, SettlementKind, Trade, TradeStatus, UserId, Venue,
    VenueId, VenueStatus,
};
use crate::store::{SettlementUpdate, StoreError, TradeStore, VenueStore};

#[derive(Default)]
pub struct MemoryStore {
    trades: Mutex<BTreeMap<Uuid, Trade>>,
    venues: Mutex<BTreeMap<i64, Venue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn trades(&self) -> MutexGuard<'_, BTreeMap<Uuid, Trade>> {
        self.trades.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn venues(&self) -> MutexGuard<'_, BTreeMap<i64, Venue>> {
        self.venues.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn status_allowed(expected: &[TradeStatus], status: TradeStatus) -> bool {
    expected.is_empty() || expected.contains(&status)
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn insert(&self, trade: &Trade) -> Result<(), StoreError> {
        let mut trades = self.trades();
        if trades.contains_key(&trade.trade_id) {
            return Err(StoreError::Conflict("duplicate trade id"));
        }
        trades.insert(trade.trade_id, trade.clone());
        Ok(())
    }

    async fn fetch(&self, trade_id: Uuid) -> Result<Trade, StoreError> {
        self.trades()
            .get(&trade_id)
            .cloned()
            .ok_or(StoreError::TradeNotFound(trade_id))
    }

    async fn fetch_by_venue(
        &self,
        venue: VenueId,
        statuses: &[TradeStatus],
    ) -> Result<Option<Trade>, StoreError> {
        Ok(self
            .trades()
            .values()
            .filter(|t| t.venue_id == Some(venue) && statuses.contains(&t.status))
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn list(&self, statuses: &[TradeStatus]) -> Result<Vec<Trade>, StoreError> {
        let mut trades: Vec<Trade> = self
            .trades()
            .values()
            .filter(|t| status_allowed(statuses, t.status))
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(trades)
    }

    async fn persist(&self, trade: &Trade, expected: &[TradeStatus]) -> Result<(), StoreError> {
        let mut trades = self.trades();
        let stored = trades
            .get_mut(&trade.trade_id)
            .ok_or(StoreError::TradeNotFound(trade.trade_id))?;
        if !status_allowed(expected, stored.status) {
            return Err(StoreError::Conflict("trade status changed underneath"));
        }
        let mut updated = trade.clone();
        updated.updated_at = OffsetDateTime::now_utc();
        *stored = updated;
        Ok(())
    }

    async fn delete(&self, trade_id: Uuid, expected: &[TradeStatus]) -> Result<bool, StoreError> {
        let mut trades = self.trades();
        match trades.get(&trade_id) {
            Some(stored) if status_allowed(expected, stored.status) => {
                trades.remove(&trade_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_joined(&self, trade_id: Uuid, user: UserId) -> Result<Trade, StoreError> {
        let mut trades = self.trades();
        let stored = trades
            .get_mut(&trade_id)
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        stored.joined.insert(user);
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(stored.clone())
    }

    async fn add_approval(
        &self,
        trade_id: Uuid,
        kind: SettlementKind,
        user: UserId,
    ) -> Result<Trade, StoreError> {
        let mut trades = self.trades();
        let stored = trades
            .get_mut(&trade_id)
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        match kind {
            SettlementKind::Release => stored.release_approvals.insert(user),
            SettlementKind::Refund => stored.refund_approvals.insert(user),
        };
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(stored.clone())
    }

    async fn clear_approvals(
        &self,
        trade_id: Uuid,
        kind: SettlementKind,
    ) -> Result<Trade, StoreError> {
        let mut trades = self.trades();
        let stored = trades
            .get_mut(&trade_id)
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        match kind {
            SettlementKind::Release => stored.release_approvals.clear(),
            SettlementKind::Refund => stored.refund_approvals.clear(),
        }
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(stored.clone())
    }

    async fn credit_deposit(
        &self,
        trade_id: Uuid,
        hashes: &[String],
        amount: Decimal,
        amount_wei: U256,
        head_block: u64,
        expected: &[TradeStatus],
    ) -> Result<Option<Trade>, StoreError> {
        let mut trades = self.trades();
        let Some(stored) = trades.get_mut(&trade_id) else {
            return Ok(None);
        };
        if !expected.contains(&stored.status) {
            return Ok(None);
        }
        // The Postgres overlap guard: any already-seen hash rejects the batch.
        if hashes.iter().any(|h| stored.seen_deposit_hashes.contains(h)) {
            return Ok(None);
        }
        stored.seen_deposit_hashes.extend(hashes.iter().cloned());
        stored.balance += amount;
        stored.balance_wei = Some(stored.balance_wei.unwrap_or(U256::ZERO) + amount_wei);
        stored.last_checked_block = head_block;
        stored.status = TradeStatus::Deposited;
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(Some(stored.clone()))
    }

    async fn advance_scan_cursor(&self, trade_id: Uuid, to_block: u64) -> Result<(), StoreError> {
        let mut trades = self.trades();
        if let Some(stored) = trades.get_mut(&trade_id) {
            stored.last_checked_block = stored.last_checked_block.max(to_block);
            stored.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn apply_settlement(
        &self,
        trade_id: Uuid,
        update: &SettlementUpdate,
        expected: &[TradeStatus],
    ) -> Result<Trade, StoreError> {
        let mut trades = self.trades();
        let stored = trades
            .get_mut(&trade_id)
            .ok_or(StoreError::Conflict("settlement target moved status"))?;
        let marker_matches = stored
            .pending_verification
            .as_ref()
            .is_some_and(|p| p.tx_hash == update.tx_hash);
        if !expected.contains(&stored.status) || !marker_matches {
            return Err(StoreError::Conflict("settlement target moved status"));
        }

        if update.exhausts_balance {
            stored.status = match update.kind {
                SettlementKind::Release => TradeStatus::Completed,
                SettlementKind::Refund => TradeStatus::Refunded,
            };
            stored.balance = Decimal::ZERO;
            stored.balance_wei = Some(U256::ZERO);
            stored.recycle_after = update.recycle_after;
        } else {
            stored.balance -= update.amount;
            stored.balance_wei = stored.balance_wei.map(|w| w - update.amount_wei);
        }
        match update.kind {
            SettlementKind::Release => stored.release_tx_hash = Some(update.tx_hash.clone()),
            SettlementKind::Refund => stored.refund_tx_hash = Some(update.tx_hash.clone()),
        }
        stored.pending_amount = None;
        stored.release_approvals.clear();
        stored.refund_approvals.clear();
        stored.pending_verification = None;
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(stored.clone())
    }

    async fn record_verification(
        &self,
        trade_id: Uuid,
        pending: &PendingSettlement,
        expected: &[TradeStatus],
    ) -> Result<(), StoreError> {
        let mut trades = self.trades();
        let stored = trades
            .get_mut(&trade_id)
            .ok_or(StoreError::Conflict("verification target moved status"))?;
        if !expected.contains(&stored.status) {
            return Err(StoreError::Conflict("verification target moved status"));
        }
        stored.pending_verification = Some(pending.clone());
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn clear_verification(&self, trade_id: Uuid) -> Result<(), StoreError> {
        let mut trades = self.trades();
        if let Some(stored) = trades.get_mut(&trade_id) {
            stored.pending_verification = None;
            stored.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn try_mark_effect(
        &self,
        trade_id: Uuid,
        effect: BroadcastEffect,
        tx_hash: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut trades = self.trades();
        let Some(stored) = trades.get_mut(&trade_id) else {
            return Ok(false);
        };
        let hash_matches = |recorded: &Option<String>| match tx_hash {
            None => true,
            Some(h) => recorded.as_deref() == Some(h),
        };
        let claimed = match effect {
            BroadcastEffect::Completed => {
                if !stored.completed_broadcast_sent && hash_matches(&stored.release_tx_hash) {
                    stored.completed_broadcast_sent = true;
                    true
                } else {
                    false
                }
            }
            BroadcastEffect::Refunded => {
                if !stored.refunded_broadcast_sent && hash_matches(&stored.refund_tx_hash) {
                    stored.refunded_broadcast_sent = true;
                    true
                } else {
                    false
                }
            }
            BroadcastEffect::PartialDeposit => {
                if !stored.partial_deposit_broadcast_sent && tx_hash.is_none() {
                    stored.partial_deposit_broadcast_sent = true;
                    true
                } else {
                    false
                }
            }
        };
        if claimed {
            stored.updated_at = OffsetDateTime::now_utc();
        }
        Ok(claimed)
    }

    async fn join_timeouts_due(&self, now: OffsetDateTime) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .trades()
            .values()
            .filter(|t| {
                t.status == TradeStatus::Draft
                    && t.join_deadline.is_some_and(|deadline| deadline <= now)
            })
            .cloned()
            .collect())
    }

    async fn recycles_due(&self, now: OffsetDateTime) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .trades()
            .values()
            .filter(|t| {
                t.status.is_terminal() && t.recycle_after.is_some_and(|deadline| deadline <= now)
            })
            .cloned()
            .collect())
    }

    async fn pending_verifications(&self) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .trades()
            .values()
            .filter(|t| t.pending_verification.is_some())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VenueStore for MemoryStore {
    async fn ensure(&self, venue: &Venue) -> Result<(), StoreError> {
        self.venues()
            .entry(venue.venue_id.0)
            .or_insert_with(|| venue.clone());
        Ok(())
    }

    async fn fetch_venue(&self, venue_id: VenueId) -> Result<Venue, StoreError> {
        self.venues()
            .get(&venue_id.0)
            .cloned()
            .ok_or(StoreError::VenueNotFound(venue_id))
    }

    async fn fetch_by_trade(&self, trade_id: Uuid) -> Result<Option<Venue>, StoreError> {
        Ok(self
            .venues()
            .values()
            .find(|v| v.assigned_trade == Some(trade_id))
            .cloned())
    }

    async fn list_venues(&self) -> Result<Vec<Venue>, StoreError> {
        Ok(self.venues().values().cloned().collect())
    }

    async fn try_claim(
        &self,
        trade_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<Venue>, StoreError> {
        let mut venues = self.venues();
        let Some(venue) = venues
            .values_mut()
            .filter(|v| v.status == VenueStatus::Available)
            .min_by_key(|v| v.venue_id)
        else {
            return Ok(None);
        };
        venue.status = VenueStatus::Assigned;
        venue.assigned_trade = Some(trade_id);
        venue.assigned_at = Some(now);
        venue.completed_at = None;
        Ok(Some(venue.clone()))
    }

    async fn persist_venue(
        &self,
        venue: &Venue,
        expected: &[VenueStatus],
    ) -> Result<(), StoreError> {
        let mut venues = self.venues();
        let stored = venues
            .get_mut(&venue.venue_id.0)
            .ok_or(StoreError::VenueNotFound(venue.venue_id))?;
        if !(expected.is_empty() || expected.contains(&stored.status)) {
            return Err(StoreError::Conflict("venue status changed underneath"));
        }
        *stored = venue.clone();
        Ok(())
    }
}
