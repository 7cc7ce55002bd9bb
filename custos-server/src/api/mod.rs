//! The HTTP API: service routes for the frontend bot, admin routes for the
//! operator dashboard.
//!
//! Both route families share the response models and the engine-error
//! mapping below; authentication differs per family (see [`extractors`]).

pub mod admin;
pub mod extractors;
pub mod service;

use axum::http::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use custos_core::engine::{Actor, EngineError, SettlementOutcome};
use custos_core::entities::{
    SettlementKind, Terms, Trade, TradeStatus, UserId, Venue, VenueStatus,
};
use custos_core::store::StoreError;

/// Map an engine error to a response status and message.
///
/// Chain trouble and unconfirmed submissions surface as 502 so the caller
/// can tell "the request was wrong" from "the chain was unreachable".
pub(crate) fn engine_error_response(err: EngineError) -> (StatusCode, String) {
    let status = match &err {
        EngineError::Validation(_) | EngineError::Units(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Authorization(_) => StatusCode::FORBIDDEN,
        EngineError::NoVenueAvailable | EngineError::SettlementInFlight(_) => StatusCode::CONFLICT,
        EngineError::Store(StoreError::TradeNotFound(_) | StoreError::VenueNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
        EngineError::Chain(_) | EngineError::VerificationTimeout { .. } => StatusCode::BAD_GATEWAY,
        EngineError::Store(_) | EngineError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "API request failed");
    }

    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "internal server error".to_owned()
    } else {
        err.to_string()
    };
    (status, message)
}

// ---------------------------------------------------------------------------
// Shared request/response models
// ---------------------------------------------------------------------------

/// The platform user a request acts for.
#[derive(Debug, Deserialize)]
pub(crate) struct ActorBody {
    pub user_id: i64,
    #[serde(default)]
    pub handle: Option<String>,
}

impl ActorBody {
    pub(crate) fn into_actor(self) -> Actor {
        Actor::new(UserId(self.user_id), self.handle)
    }
}

/// API view of a participant slot.
#[derive(Debug, Serialize)]
pub(crate) struct ParticipantResponse {
    pub user_id: i64,
    pub handle: Option<String>,
}

/// API view of a trade record.
#[derive(Debug, Serialize)]
pub(crate) struct TradeResponse {
    pub trade_id: Uuid,
    pub status: TradeStatus,
    pub venue_id: Option<i64>,
    pub creator: ParticipantResponse,
    pub buyer: Option<ParticipantResponse>,
    pub seller: Option<ParticipantResponse>,
    pub joined: Vec<i64>,
    pub terms: Option<Terms>,
    pub buyer_address: Option<String>,
    pub seller_address: Option<String>,
    pub deposit_address: Option<String>,
    pub balance: Decimal,
    /// Exact integer-unit balance, decimal string.
    pub balance_wei: Option<String>,
    pub release_approvals: Vec<i64>,
    pub refund_approvals: Vec<i64>,
    pub pending_amount: Option<Decimal>,
    pub release_tx_hash: Option<String>,
    pub refund_tx_hash: Option<String>,
    pub join_deadline: Option<i64>,
    pub recycle_after: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// API view of a venue record.
#[derive(Debug, Serialize)]
pub(crate) struct VenueResponse {
    pub venue_id: i64,
    pub status: VenueStatus,
    pub assigned_trade: Option<Uuid>,
    pub invite_credential: Option<String>,
    pub assigned_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// API view of an executed settlement.
#[derive(Debug, Serialize)]
pub(crate) struct SettlementResponse {
    pub kind: SettlementKind,
    pub amount: Decimal,
    pub amount_wei: String,
    pub fee: Decimal,
    pub tx_hash: String,
    pub remaining: Decimal,
    pub exhausted: bool,
    pub trade: TradeResponse,
}

fn participant_response(p: &custos_core::entities::Participant) -> ParticipantResponse {
    ParticipantResponse {
        user_id: p.user.0,
        handle: p.handle.clone(),
    }
}

/// Convert a `Trade` (engine model) into a `TradeResponse` (API model).
pub(crate) fn trade_response(trade: &Trade) -> TradeResponse {
    TradeResponse {
        trade_id: trade.trade_id,
        status: trade.status,
        venue_id: trade.venue_id.map(|v| v.0),
        creator: participant_response(&trade.creator),
        buyer: trade.buyer.as_ref().map(participant_response),
        seller: trade.seller.as_ref().map(participant_response),
        joined: trade.joined.iter().map(|u| u.0).collect(),
        terms: trade.terms.clone(),
        buyer_address: trade.buyer_address.clone(),
        seller_address: trade.seller_address.clone(),
        deposit_address: trade.deposit_address.clone(),
        balance: trade.balance,
        balance_wei: trade.balance_wei.map(|w| w.to_string()),
        release_approvals: trade.release_approvals.iter().map(|u| u.0).collect(),
        refund_approvals: trade.refund_approvals.iter().map(|u| u.0).collect(),
        pending_amount: trade.pending_amount,
        release_tx_hash: trade.release_tx_hash.clone(),
        refund_tx_hash: trade.refund_tx_hash.clone(),
        join_deadline: trade.join_deadline.map(|t| t.unix_timestamp()),
        recycle_after: trade.recycle_after.map(|t| t.unix_timestamp()),
        created_at: trade.created_at.unix_timestamp(),
        updated_at: trade.updated_at.unix_timestamp(),
    }
}

/// Convert a `Venue` (engine model) into a `VenueResponse` (API model).
pub(crate) fn venue_response(venue: &Venue) -> VenueResponse {
    VenueResponse {
        venue_id: venue.venue_id.0,
        status: venue.status,
        assigned_trade: venue.assigned_trade,
        invite_credential: venue.invite_credential.clone(),
        assigned_at: venue.assigned_at.map(|t| t.unix_timestamp()),
        completed_at: venue.completed_at.map(|t| t.unix_timestamp()),
    }
}

/// Convert a `SettlementOutcome` into a `SettlementResponse`.
pub(crate) fn settlement_response(outcome: &SettlementOutcome) -> SettlementResponse {
    SettlementResponse {
        kind: outcome.kind,
        amount: outcome.amount,
        amount_wei: outcome.amount_wei.to_string(),
        fee: outcome.fee,
        tx_hash: outcome.tx_hash.clone(),
        remaining: outcome.remaining,
        exhausted: outcome.exhausted,
        trade: trade_response(&outcome.trade),
    }
}
