//! Postgres implementation of the trade and venue stores.
//!
//! All writes that participate in the ordering protocol are single
//! statements: conditional `UPDATE ... WHERE ... AND status = ANY(..)`
//! guards, `CASE WHEN` add-to-set appends, and array-overlap checks for the
//! deposit dedupe. `rows_affected` / `RETURNING` decides whether the guard
//! held — no read-modify-write windows.

use std::collections::BTreeSet;
use std::str::FromStr;

use alloy_primitives::U256;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entities::{
    BroadcastEffect, ChainName, Participant, PendingSettlement, SettlementKind, Terms, TokenSymbol,
    Trade, TradeStatus, UserId, Venue, VenueId, VenueStatus,
};

use super::{SettlementUpdate, StoreError, TradeStore, VenueStore};

/// Column list shared by every trade query. The two 78-digit integer columns
/// are cast to text because their values exceed what `Decimal` can hold.
const TRADE_COLUMNS: &str = "trade_id, status, venue_id, \
    creator_id, creator_handle, buyer_id, buyer_handle, seller_id, seller_handle, joined, \
    token, chain, quantity, rate, payment_method, \
    buyer_address, seller_address, deposit_address, \
    balance, balance_wei::TEXT AS balance_wei, last_checked_block, seen_deposit_hashes, \
    release_approvals, refund_approvals, pending_amount, \
    release_tx_hash, refund_tx_hash, \
    verify_kind, verify_tx_hash, verify_amount, \
    verify_amount_wei::TEXT AS verify_amount_wei, verify_exhausts, verify_submitted_at, \
    completed_broadcast_sent, refunded_broadcast_sent, partial_deposit_broadcast_sent, \
    join_deadline, recycle_after, created_at, updated_at";

const VENUE_COLUMNS: &str =
    "venue_id, status, assigned_trade, invite_credential, assigned_at, completed_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    trade_id: Uuid,
    status: String,
    venue_id: Option<i64>,
    creator_id: i64,
    creator_handle: Option<String>,
    buyer_id: Option<i64>,
    buyer_handle: Option<String>,
    seller_id: Option<i64>,
    seller_handle: Option<String>,
    joined: Vec<i64>,
    token: Option<String>,
    chain: Option<String>,
    quantity: Option<Decimal>,
    rate: Option<Decimal>,
    payment_method: Option<String>,
    buyer_address: Option<String>,
    seller_address: Option<String>,
    deposit_address: Option<String>,
    balance: Decimal,
    balance_wei: Option<String>,
    last_checked_block: i64,
    seen_deposit_hashes: Vec<String>,
    release_approvals: Vec<i64>,
    refund_approvals: Vec<i64>,
    pending_amount: Option<Decimal>,
    release_tx_hash: Option<String>,
    refund_tx_hash: Option<String>,
    verify_kind: Option<String>,
    verify_tx_hash: Option<String>,
    verify_amount: Option<Decimal>,
    verify_amount_wei: Option<String>,
    verify_exhausts: Option<bool>,
    verify_submitted_at: Option<OffsetDateTime>,
    completed_broadcast_sent: bool,
    refunded_broadcast_sent: bool,
    partial_deposit_broadcast_sent: bool,
    join_deadline: Option<OffsetDateTime>,
    recycle_after: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

fn corrupt(msg: impl Into<String>) -> StoreError {
    StoreError::Corrupt(msg.into())
}

fn parse_wei(text: &str) -> Result<U256, StoreError> {
    U256::from_str_radix(text, 10).map_err(|e| corrupt(format!("bad integer amount: {e}")))
}

impl TryFrom<TradeRow> for Trade {
    type Error = StoreError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let status = TradeStatus::from_str(&row.status).map_err(|e| corrupt(e.to_string()))?;

        let participant = |id: Option<i64>, handle: Option<String>| {
            id.map(|id| Participant::new(UserId(id), handle))
        };

        let terms = match (row.token, row.chain, row.quantity, row.rate, row.payment_method) {
            (Some(token), Some(chain), Some(quantity), Some(rate), Some(payment_method)) => {
                Some(Terms {
                    token: TokenSymbol::new(token),
                    chain: ChainName::new(chain),
                    quantity,
                    rate,
                    payment_method,
                })
            }
            (None, None, None, None, None) => None,
            _ => return Err(corrupt("partially stored trade terms")),
        };

        let balance_wei = row.balance_wei.as_deref().map(parse_wei).transpose()?;

        let pending_verification = match row.verify_tx_hash {
            Some(tx_hash) => {
                let kind = row
                    .verify_kind
                    .as_deref()
                    .ok_or_else(|| corrupt("verification marker without kind"))?;
                Some(PendingSettlement {
                    kind: SettlementKind::from_str(kind).map_err(|e| corrupt(e.to_string()))?,
                    tx_hash,
                    amount: row
                        .verify_amount
                        .ok_or_else(|| corrupt("verification marker without amount"))?,
                    amount_wei: parse_wei(
                        row.verify_amount_wei
                            .as_deref()
                            .ok_or_else(|| corrupt("verification marker without wei amount"))?,
                    )?,
                    exhausts_balance: row.verify_exhausts.unwrap_or(false),
                    submitted_at: row
                        .verify_submitted_at
                        .ok_or_else(|| corrupt("verification marker without timestamp"))?,
                })
            }
            None => None,
        };

        Ok(Trade {
            trade_id: row.trade_id,
            status,
            venue_id: row.venue_id.map(VenueId),
            creator: Participant::new(UserId(row.creator_id), row.creator_handle),
            buyer: participant(row.buyer_id, row.buyer_handle),
            seller: participant(row.seller_id, row.seller_handle),
            joined: row.joined.into_iter().map(UserId).collect(),
            terms,
            buyer_address: row.buyer_address,
            seller_address: row.seller_address,
            deposit_address: row.deposit_address,
            balance: row.balance,
            balance_wei,
            last_checked_block: u64::try_from(row.last_checked_block)
                .map_err(|_| corrupt("negative scan cursor"))?,
            seen_deposit_hashes: row.seen_deposit_hashes.into_iter().collect(),
            release_approvals: row.release_approvals.into_iter().map(UserId).collect(),
            refund_approvals: row.refund_approvals.into_iter().map(UserId).collect(),
            pending_amount: row.pending_amount,
            release_tx_hash: row.release_tx_hash,
            refund_tx_hash: row.refund_tx_hash,
            pending_verification,
            completed_broadcast_sent: row.completed_broadcast_sent,
            refunded_broadcast_sent: row.refunded_broadcast_sent,
            partial_deposit_broadcast_sent: row.partial_deposit_broadcast_sent,
            join_deadline: row.join_deadline,
            recycle_after: row.recycle_after,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_codes(statuses: &[TradeStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_owned()).collect()
}

fn ids(set: &BTreeSet<UserId>) -> Vec<i64> {
    set.iter().map(|u| u.0).collect()
}

fn block_i64(block: u64) -> Result<i64, StoreError> {
    i64::try_from(block).map_err(|_| corrupt("block height exceeds i64"))
}

#[async_trait]
impl TradeStore for PgStore {
    #[tracing::instrument(skip_all, err, name = "SQL:InsertTrade")]
    async fn insert(&self, trade: &Trade) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO trades (trade_id, status, venue_id, \
                creator_id, creator_handle, buyer_id, buyer_handle, seller_id, seller_handle, joined, \
                token, chain, quantity, rate, payment_method, \
                buyer_address, seller_address, deposit_address, \
                balance, balance_wei, last_checked_block, seen_deposit_hashes, \
                release_approvals, refund_approvals, pending_amount, \
                release_tx_hash, refund_tx_hash, \
                verify_kind, verify_tx_hash, verify_amount, verify_amount_wei, verify_exhausts, verify_submitted_at, \
                completed_broadcast_sent, refunded_broadcast_sent, partial_deposit_broadcast_sent, \
                join_deadline, recycle_after, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                $11, $12, $13, $14, $15, $16, $17, $18, \
                $19, $20::numeric, $21, $22, $23, $24, $25, $26, $27, \
                $28, $29, $30, $31::numeric, $32, $33, \
                $34, $35, $36, $37, $38, $39, $40)",
        )
        .bind(trade.trade_id)
        .bind(trade.status.as_str())
        .bind(trade.venue_id.map(|v| v.0))
        .bind(trade.creator.user.0)
        .bind(trade.creator.handle.as_deref())
        .bind(trade.buyer.as_ref().map(|p| p.user.0))
        .bind(trade.buyer.as_ref().and_then(|p| p.handle.as_deref()))
        .bind(trade.seller.as_ref().map(|p| p.user.0))
        .bind(trade.seller.as_ref().and_then(|p| p.handle.as_deref()))
        .bind(ids(&trade.joined))
        .bind(trade.terms.as_ref().map(|t| t.token.as_str().to_owned()))
        .bind(trade.terms.as_ref().map(|t| t.chain.as_str().to_owned()))
        .bind(trade.terms.as_ref().map(|t| t.quantity))
        .bind(trade.terms.as_ref().map(|t| t.rate))
        .bind(trade.terms.as_ref().map(|t| t.payment_method.clone()))
        .bind(trade.buyer_address.as_deref())
        .bind(trade.seller_address.as_deref())
        .bind(trade.deposit_address.as_deref())
        .bind(trade.balance)
        .bind(trade.balance_wei.map(|w| w.to_string()))
        .bind(block_i64(trade.last_checked_block)?)
        .bind(trade.seen_deposit_hashes.iter().cloned().collect::<Vec<_>>())
        .bind(ids(&trade.release_approvals))
        .bind(ids(&trade.refund_approvals))
        .bind(trade.pending_amount)
        .bind(trade.release_tx_hash.as_deref())
        .bind(trade.refund_tx_hash.as_deref())
        .bind(trade.pending_verification.as_ref().map(|p| p.kind.as_str()))
        .bind(trade.pending_verification.as_ref().map(|p| p.tx_hash.clone()))
        .bind(trade.pending_verification.as_ref().map(|p| p.amount))
        .bind(trade.pending_verification.as_ref().map(|p| p.amount_wei.to_string()))
        .bind(trade.pending_verification.as_ref().map(|p| p.exhausts_balance))
        .bind(trade.pending_verification.as_ref().map(|p| p.submitted_at))
        .bind(trade.completed_broadcast_sent)
        .bind(trade.refunded_broadcast_sent)
        .bind(trade.partial_deposit_broadcast_sent)
        .bind(trade.join_deadline)
        .bind(trade.recycle_after)
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:FetchTrade")]
    async fn fetch(&self, trade_id: Uuid) -> Result<Trade, StoreError> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE trade_id = $1");
        let row = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        row.try_into()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:FetchTradeByVenue")]
    async fn fetch_by_venue(
        &self,
        venue: VenueId,
        statuses: &[TradeStatus],
    ) -> Result<Option<Trade>, StoreError> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE venue_id = $1 AND status = ANY($2) \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(venue.0)
            .bind(status_codes(statuses))
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trade::try_from).transpose()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:ListTrades")]
    async fn list(&self, statuses: &[TradeStatus]) -> Result<Vec<Trade>, StoreError> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE cardinality($1::text[]) = 0 OR status = ANY($1) \
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(status_codes(statuses))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:PersistTrade")]
    async fn persist(&self, trade: &Trade, expected: &[TradeStatus]) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE trades SET status = $2, venue_id = $3, \
                creator_id = $4, creator_handle = $5, \
                buyer_id = $6, buyer_handle = $7, seller_id = $8, seller_handle = $9, joined = $10, \
                token = $11, chain = $12, quantity = $13, rate = $14, payment_method = $15, \
                buyer_address = $16, seller_address = $17, deposit_address = $18, \
                balance = $19, balance_wei = $20::numeric, last_checked_block = $21, \
                seen_deposit_hashes = $22, release_approvals = $23, refund_approvals = $24, \
                pending_amount = $25, release_tx_hash = $26, refund_tx_hash = $27, \
                verify_kind = $28, verify_tx_hash = $29, verify_amount = $30, \
                verify_amount_wei = $31::numeric, verify_exhausts = $32, verify_submitted_at = $33, \
                completed_broadcast_sent = $34, refunded_broadcast_sent = $35, \
                partial_deposit_broadcast_sent = $36, \
                join_deadline = $37, recycle_after = $38, updated_at = NOW() \
             WHERE trade_id = $1 \
               AND (cardinality($39::text[]) = 0 OR status = ANY($39))",
        )
        .bind(trade.trade_id)
        .bind(trade.status.as_str())
        .bind(trade.venue_id.map(|v| v.0))
        .bind(trade.creator.user.0)
        .bind(trade.creator.handle.as_deref())
        .bind(trade.buyer.as_ref().map(|p| p.user.0))
        .bind(trade.buyer.as_ref().and_then(|p| p.handle.as_deref()))
        .bind(trade.seller.as_ref().map(|p| p.user.0))
        .bind(trade.seller.as_ref().and_then(|p| p.handle.as_deref()))
        .bind(ids(&trade.joined))
        .bind(trade.terms.as_ref().map(|t| t.token.as_str().to_owned()))
        .bind(trade.terms.as_ref().map(|t| t.chain.as_str().to_owned()))
        .bind(trade.terms.as_ref().map(|t| t.quantity))
        .bind(trade.terms.as_ref().map(|t| t.rate))
        .bind(trade.terms.as_ref().map(|t| t.payment_method.clone()))
        .bind(trade.buyer_address.as_deref())
        .bind(trade.seller_address.as_deref())
        .bind(trade.deposit_address.as_deref())
        .bind(trade.balance)
        .bind(trade.balance_wei.map(|w| w.to_string()))
        .bind(block_i64(trade.last_checked_block)?)
        .bind(trade.seen_deposit_hashes.iter().cloned().collect::<Vec<_>>())
        .bind(ids(&trade.release_approvals))
        .bind(ids(&trade.refund_approvals))
        .bind(trade.pending_amount)
        .bind(trade.release_tx_hash.as_deref())
        .bind(trade.refund_tx_hash.as_deref())
        .bind(trade.pending_verification.as_ref().map(|p| p.kind.as_str()))
        .bind(trade.pending_verification.as_ref().map(|p| p.tx_hash.clone()))
        .bind(trade.pending_verification.as_ref().map(|p| p.amount))
        .bind(trade.pending_verification.as_ref().map(|p| p.amount_wei.to_string()))
        .bind(trade.pending_verification.as_ref().map(|p| p.exhausts_balance))
        .bind(trade.pending_verification.as_ref().map(|p| p.submitted_at))
        .bind(trade.completed_broadcast_sent)
        .bind(trade.refunded_broadcast_sent)
        .bind(trade.partial_deposit_broadcast_sent)
        .bind(trade.join_deadline)
        .bind(trade.recycle_after)
        .bind(status_codes(expected))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM trades WHERE trade_id = $1)",
            )
            .bind(trade.trade_id)
            .fetch_one(&self.pool)
            .await?;
            if exists {
                return Err(StoreError::Conflict("trade status changed underneath"));
            }
            return Err(StoreError::TradeNotFound(trade.trade_id));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:DeleteTrade")]
    async fn delete(&self, trade_id: Uuid, expected: &[TradeStatus]) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM trades WHERE trade_id = $1 \
               AND (cardinality($2::text[]) = 0 OR status = ANY($2))",
        )
        .bind(trade_id)
        .bind(status_codes(expected))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip_all, err, name = "SQL:AddJoined")]
    async fn add_joined(&self, trade_id: Uuid, user: UserId) -> Result<Trade, StoreError> {
        let sql = format!(
            "UPDATE trades SET \
                joined = CASE WHEN $2 = ANY(joined) THEN joined ELSE array_append(joined, $2) END, \
                updated_at = NOW() \
             WHERE trade_id = $1 \
             RETURNING {TRADE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(trade_id)
            .bind(user.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        row.try_into()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:AddApproval")]
    async fn add_approval(
        &self,
        trade_id: Uuid,
        kind: SettlementKind,
        user: UserId,
    ) -> Result<Trade, StoreError> {
        let column = match kind {
            SettlementKind::Release => "release_approvals",
            SettlementKind::Refund => "refund_approvals",
        };
        let sql = format!(
            "UPDATE trades SET \
                {column} = CASE WHEN $2 = ANY({column}) THEN {column} ELSE array_append({column}, $2) END, \
                updated_at = NOW() \
             WHERE trade_id = $1 \
             RETURNING {TRADE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(trade_id)
            .bind(user.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        row.try_into()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:ClearApprovals")]
    async fn clear_approvals(
        &self,
        trade_id: Uuid,
        kind: SettlementKind,
    ) -> Result<Trade, StoreError> {
        let column = match kind {
            SettlementKind::Release => "release_approvals",
            SettlementKind::Refund => "refund_approvals",
        };
        let sql = format!(
            "UPDATE trades SET {column} = '{{}}', updated_at = NOW() \
             WHERE trade_id = $1 \
             RETURNING {TRADE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        row.try_into()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:CreditDeposit")]
    async fn credit_deposit(
        &self,
        trade_id: Uuid,
        hashes: &[String],
        amount: Decimal,
        amount_wei: U256,
        head_block: u64,
        expected: &[TradeStatus],
    ) -> Result<Option<Trade>, StoreError> {
        let sql = format!(
            "UPDATE trades SET \
                seen_deposit_hashes = ARRAY(SELECT DISTINCT h FROM unnest(seen_deposit_hashes || $2::text[]) AS h ORDER BY h), \
                balance = balance + $3, \
                balance_wei = COALESCE(balance_wei, 0) + $4::numeric, \
                last_checked_block = $5, \
                status = 'deposited', \
                updated_at = NOW() \
             WHERE trade_id = $1 \
               AND NOT (seen_deposit_hashes && $2::text[]) \
               AND status = ANY($6) \
             RETURNING {TRADE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(trade_id)
            .bind(hashes)
            .bind(amount)
            .bind(amount_wei.to_string())
            .bind(block_i64(head_block)?)
            .bind(status_codes(expected))
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trade::try_from).transpose()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:AdvanceScanCursor")]
    async fn advance_scan_cursor(&self, trade_id: Uuid, to_block: u64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE trades SET last_checked_block = GREATEST(last_checked_block, $2), \
                updated_at = NOW() \
             WHERE trade_id = $1",
        )
        .bind(trade_id)
        .bind(block_i64(to_block)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:ApplySettlement")]
    async fn apply_settlement(
        &self,
        trade_id: Uuid,
        update: &SettlementUpdate,
        expected: &[TradeStatus],
    ) -> Result<Trade, StoreError> {
        let row = if update.exhausts_balance {
            let terminal = match update.kind {
                SettlementKind::Release => TradeStatus::Completed,
                SettlementKind::Refund => TradeStatus::Refunded,
            };
            let sql = format!(
                "UPDATE trades SET \
                    status = $2, balance = 0, balance_wei = 0, pending_amount = NULL, \
                    release_approvals = '{{}}', refund_approvals = '{{}}', \
                    release_tx_hash = CASE WHEN $3 = 'release' THEN $4 ELSE release_tx_hash END, \
                    refund_tx_hash = CASE WHEN $3 = 'refund' THEN $4 ELSE refund_tx_hash END, \
                    verify_kind = NULL, verify_tx_hash = NULL, verify_amount = NULL, \
                    verify_amount_wei = NULL, verify_exhausts = NULL, verify_submitted_at = NULL, \
                    recycle_after = $5, updated_at = NOW() \
                 WHERE trade_id = $1 AND status = ANY($6) AND verify_tx_hash = $4 \
                 RETURNING {TRADE_COLUMNS}"
            );
            sqlx::query_as::<_, TradeRow>(&sql)
                .bind(trade_id)
                .bind(terminal.as_str())
                .bind(update.kind.as_str())
                .bind(&update.tx_hash)
                .bind(update.recycle_after)
                .bind(status_codes(expected))
                .fetch_optional(&self.pool)
                .await?
        } else {
            let sql = format!(
                "UPDATE trades SET \
                    balance = balance - $2, \
                    balance_wei = CASE WHEN balance_wei IS NULL THEN NULL ELSE balance_wei - $3::numeric END, \
                    pending_amount = NULL, \
                    release_approvals = '{{}}', refund_approvals = '{{}}', \
                    release_tx_hash = CASE WHEN $4 = 'release' THEN $5 ELSE release_tx_hash END, \
                    refund_tx_hash = CASE WHEN $4 = 'refund' THEN $5 ELSE refund_tx_hash END, \
                    verify_kind = NULL, verify_tx_hash = NULL, verify_amount = NULL, \
                    verify_amount_wei = NULL, verify_exhausts = NULL, verify_submitted_at = NULL, \
                    updated_at = NOW() \
                 WHERE trade_id = $1 AND status = ANY($6) AND verify_tx_hash = $5 \
                 RETURNING {TRADE_COLUMNS}"
            );
            sqlx::query_as::<_, TradeRow>(&sql)
                .bind(trade_id)
                .bind(update.amount)
                .bind(update.amount_wei.to_string())
                .bind(update.kind.as_str())
                .bind(&update.tx_hash)
                .bind(status_codes(expected))
                .fetch_optional(&self.pool)
                .await?
        };
        row.ok_or(StoreError::Conflict("settlement target moved status"))?
            .try_into()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:RecordVerification")]
    async fn record_verification(
        &self,
        trade_id: Uuid,
        pending: &PendingSettlement,
        expected: &[TradeStatus],
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE trades SET \
                verify_kind = $2, verify_tx_hash = $3, verify_amount = $4, \
                verify_amount_wei = $5::numeric, verify_exhausts = $6, verify_submitted_at = $7, \
                updated_at = NOW() \
             WHERE trade_id = $1 AND status = ANY($8)",
        )
        .bind(trade_id)
        .bind(pending.kind.as_str())
        .bind(&pending.tx_hash)
        .bind(pending.amount)
        .bind(pending.amount_wei.to_string())
        .bind(pending.exhausts_balance)
        .bind(pending.submitted_at)
        .bind(status_codes(expected))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict("verification target moved status"));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:ClearVerification")]
    async fn clear_verification(&self, trade_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE trades SET \
                verify_kind = NULL, verify_tx_hash = NULL, verify_amount = NULL, \
                verify_amount_wei = NULL, verify_exhausts = NULL, verify_submitted_at = NULL, \
                updated_at = NOW() \
             WHERE trade_id = $1",
        )
        .bind(trade_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:TryMarkEffect")]
    async fn try_mark_effect(
        &self,
        trade_id: Uuid,
        effect: BroadcastEffect,
        tx_hash: Option<&str>,
    ) -> Result<bool, StoreError> {
        let sql = match effect {
            BroadcastEffect::Completed => {
                "UPDATE trades SET completed_broadcast_sent = TRUE, updated_at = NOW() \
                 WHERE trade_id = $1 AND completed_broadcast_sent = FALSE \
                   AND ($2::text IS NULL OR release_tx_hash = $2)"
            }
            BroadcastEffect::Refunded => {
                "UPDATE trades SET refunded_broadcast_sent = TRUE, updated_at = NOW() \
                 WHERE trade_id = $1 AND refunded_broadcast_sent = FALSE \
                   AND ($2::text IS NULL OR refund_tx_hash = $2)"
            }
            BroadcastEffect::PartialDeposit => {
                "UPDATE trades SET partial_deposit_broadcast_sent = TRUE, updated_at = NOW() \
                 WHERE trade_id = $1 AND partial_deposit_broadcast_sent = FALSE \
                   AND $2::text IS NULL"
            }
        };
        let result = sqlx::query(sql)
            .bind(trade_id)
            .bind(tx_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip_all, err, name = "SQL:JoinTimeoutsDue")]
    async fn join_timeouts_due(&self, now: OffsetDateTime) -> Result<Vec<Trade>, StoreError> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE status = 'draft' AND join_deadline IS NOT NULL AND join_deadline <= $1"
        );
        let rows = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:RecyclesDue")]
    async fn recycles_due(&self, now: OffsetDateTime) -> Result<Vec<Trade>, StoreError> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE status IN ('completed', 'refunded') \
               AND recycle_after IS NOT NULL AND recycle_after <= $1"
        );
        let rows = sqlx::query_as::<_, TradeRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:PendingVerifications")]
    async fn pending_verifications(&self) -> Result<Vec<Trade>, StoreError> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE verify_tx_hash IS NOT NULL");
        let rows = sqlx::query_as::<_, TradeRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct VenueRow {
    venue_id: i64,
    status: String,
    assigned_trade: Option<Uuid>,
    invite_credential: Option<String>,
    assigned_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<VenueRow> for Venue {
    type Error = StoreError;

    fn try_from(row: VenueRow) -> Result<Self, Self::Error> {
        Ok(Venue {
            venue_id: VenueId(row.venue_id),
            status: VenueStatus::from_str(&row.status).map_err(|e| corrupt(e.to_string()))?,
            assigned_trade: row.assigned_trade,
            invite_credential: row.invite_credential,
            assigned_at: row.assigned_at,
            completed_at: row.completed_at,
        })
    }
}

#[async_trait]
impl VenueStore for PgStore {
    #[tracing::instrument(skip_all, err, name = "SQL:EnsureVenue")]
    async fn ensure(&self, venue: &Venue) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO venues (venue_id, status, assigned_trade, invite_credential, assigned_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (venue_id) DO NOTHING",
        )
        .bind(venue.venue_id.0)
        .bind(venue.status.as_str())
        .bind(venue.assigned_trade)
        .bind(venue.invite_credential.as_deref())
        .bind(venue.assigned_at)
        .bind(venue.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:FetchVenue")]
    async fn fetch_venue(&self, venue_id: VenueId) -> Result<Venue, StoreError> {
        let sql = format!("SELECT {VENUE_COLUMNS} FROM venues WHERE venue_id = $1");
        let row = sqlx::query_as::<_, VenueRow>(&sql)
            .bind(venue_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::VenueNotFound(venue_id))?;
        row.try_into()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:FetchVenueByTrade")]
    async fn fetch_by_trade(&self, trade_id: Uuid) -> Result<Option<Venue>, StoreError> {
        let sql = format!("SELECT {VENUE_COLUMNS} FROM venues WHERE assigned_trade = $1");
        let row = sqlx::query_as::<_, VenueRow>(&sql)
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Venue::try_from).transpose()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:ListVenues")]
    async fn list_venues(&self) -> Result<Vec<Venue>, StoreError> {
        let sql = format!("SELECT {VENUE_COLUMNS} FROM venues ORDER BY venue_id");
        let rows = sqlx::query_as::<_, VenueRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Venue::try_from).collect()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:TryClaimVenue")]
    async fn try_claim(
        &self,
        trade_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<Venue>, StoreError> {
        let sql = format!(
            "UPDATE venues SET status = 'assigned', assigned_trade = $1, assigned_at = $2, completed_at = NULL \
             WHERE venue_id = ( \
                SELECT venue_id FROM venues WHERE status = 'available' \
                ORDER BY venue_id LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {VENUE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, VenueRow>(&sql)
            .bind(trade_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Venue::try_from).transpose()
    }

    #[tracing::instrument(skip_all, err, name = "SQL:PersistVenue")]
    async fn persist_venue(
        &self,
        venue: &Venue,
        expected: &[VenueStatus],
    ) -> Result<(), StoreError> {
        let expected_codes: Vec<String> =
            expected.iter().map(|s| s.as_str().to_owned()).collect();
        let result = sqlx::query(
            "UPDATE venues SET status = $2, assigned_trade = $3, invite_credential = $4, \
                assigned_at = $5, completed_at = $6 \
             WHERE venue_id = $1 \
               AND (cardinality($7::text[]) = 0 OR status = ANY($7))",
        )
        .bind(venue.venue_id.0)
        .bind(venue.status.as_str())
        .bind(venue.assigned_trade)
        .bind(venue.invite_credential.as_deref())
        .bind(venue.assigned_at)
        .bind(venue.completed_at)
        .bind(expected_codes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM venues WHERE venue_id = $1)",
            )
            .bind(venue.venue_id.0)
            .fetch_one(&self.pool)
            .await?;
            if exists {
                return Err(StoreError::Conflict("venue status changed underneath"));
            }
            return Err(StoreError::VenueNotFound(venue.venue_id));
        }
        Ok(())
    }
}
