//! Service API handlers.
//!
//! These endpoints are called by the frontend chat bot and require the
//! shared service secret in the `Custos-Service-Authorization` header.
//! Every state-changing request names the platform user it acts for; the
//! engine authorizes that user against the trade, so a valid service secret
//! alone cannot move funds.
//!
//! # Endpoints
//!
//! - `POST /trades`                        – open a trade and claim a venue
//! - `GET  /trades/{id}`                   – fetch a trade
//! - `POST /trades/{id}/join`              – record a venue join request
//! - `POST /trades/{id}/role`              – claim buyer or seller
//! - `POST /trades/{id}/terms`             – set the agreed terms
//! - `POST /trades/{id}/address`           – set the caller's payout address
//! - `POST /trades/{id}/confirm`           – confirm details, open the deposit window
//! - `POST /trades/{id}/deposit-check`     – scan the chain for new deposits
//! - `POST /trades/{id}/fiat-sent`         – buyer marks the fiat leg sent
//! - `POST /trades/{id}/fiat-received`     – seller confirms the fiat leg
//! - `POST /trades/{id}/approve-release`   – approve paying the buyer
//! - `POST /trades/{id}/decline-release`   – withdraw release consensus
//! - `POST /trades/{id}/approve-refund`    – approve refunding the seller
//! - `POST /trades/{id}/decline-refund`    – withdraw refund consensus
//! - `POST /trades/{id}/partial`           – stage a partial settlement amount
//! - `POST /trades/{id}/dispute`           – freeze the trade for admins
//! - `POST /trades/{id}/close`             – tear down an unfunded trade, or
//!   free a settled one's venue early

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use custos_core::engine::{ApprovalOutcome, DepositCheck, EngineError, JoinOutcome};
use custos_core::entities::{ChainName, Terms, TokenSymbol, TradeRole, TradeStatus};

use crate::api::extractors::ServiceAuth;
use crate::api::{
    ActorBody, SettlementResponse, TradeResponse, VenueResponse, engine_error_response,
    settlement_response, trade_response, venue_response,
};
use crate::state::AppState;

/// Build the Service API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trades", post(open_trade))
        .route("/trades/{trade_id}", get(get_trade))
        .route("/trades/{trade_id}/join", post(join_trade))
        .route("/trades/{trade_id}/role", post(claim_role))
        .route("/trades/{trade_id}/terms", post(set_terms))
        .route("/trades/{trade_id}/address", post(set_address))
        .route("/trades/{trade_id}/confirm", post(confirm_details))
        .route("/trades/{trade_id}/deposit-check", post(deposit_check))
        .route("/trades/{trade_id}/fiat-sent", post(fiat_sent))
        .route("/trades/{trade_id}/fiat-received", post(fiat_received))
        .route("/trades/{trade_id}/approve-release", post(approve_release))
        .route("/trades/{trade_id}/decline-release", post(decline_release))
        .route("/trades/{trade_id}/approve-refund", post(approve_refund))
        .route("/trades/{trade_id}/decline-refund", post(decline_refund))
        .route("/trades/{trade_id}/partial", post(stage_partial))
        .route("/trades/{trade_id}/dispute", post(open_dispute))
        .route("/trades/{trade_id}/close", post(close_trade))
}

// ---------------------------------------------------------------------------
// Request/response models
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OpenTradeResponse {
    trade: TradeResponse,
    venue: VenueResponse,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum JoinResponse {
    Approved {
        quorum_reached: bool,
        trade: TradeResponse,
    },
    Declined {
        reason: &'static str,
    },
}

#[derive(Debug, Deserialize)]
struct ClaimRoleRequest {
    #[serde(flatten)]
    actor: ActorBody,
    role: TradeRole,
}

#[derive(Debug, Deserialize)]
struct SetTermsRequest {
    #[serde(flatten)]
    actor: ActorBody,
    token: String,
    chain: String,
    quantity: Decimal,
    rate: Decimal,
    payment_method: String,
}

#[derive(Debug, Deserialize)]
struct SetAddressRequest {
    #[serde(flatten)]
    actor: ActorBody,
    address: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum DepositCheckResponse {
    Credited {
        amount: Decimal,
        /// The accumulated balance now covers the agreed quantity.
        full: bool,
        trade: TradeResponse,
    },
    NoNewDeposit {
        scanned_to: u64,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum ApprovalResponse {
    /// Approval recorded; waiting on the counterparty.
    Pending { trade: TradeResponse },
    /// This approval completed the quorum and the settlement executed.
    Settled { settlement: SettlementResponse },
    /// Another caller is mid-settlement; nothing changed.
    InFlight,
}

#[derive(Debug, Deserialize)]
struct StagePartialRequest {
    #[serde(flatten)]
    actor: ActorBody,
    amount: Decimal,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /trades` — open a trade and bind a venue from the pool.
async fn open_trade(
    state: State<AppState>,
    _auth: ServiceAuth,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let (trade, venue) = state.flow.open_trade(body.into_actor()).await?;
    Ok((
        StatusCode::CREATED,
        Json(OpenTradeResponse {
            trade: trade_response(&trade),
            venue: venue_response(&venue),
        }),
    ))
}

/// `GET /trades/{trade_id}` — fetch a trade.
async fn get_trade(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state.flow.get_trade(trade_id).await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/join` — record a venue join request.
///
/// The engine approves or declines against the trade bound to the venue; a
/// join that completes the pair advances the trade to detail-gathering.
async fn join_trade(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state.flow.get_trade(trade_id).await?;
    let venue_id = trade
        .venue_id
        .ok_or_else(|| EngineError::Validation("trade has no venue".into()))?;

    let outcome = state.flow.record_join(venue_id, body.into_actor()).await?;
    let response = match outcome {
        JoinOutcome::Approved {
            trade,
            quorum_reached,
        } => JoinResponse::Approved {
            quorum_reached,
            trade: trade_response(&trade),
        },
        JoinOutcome::Declined { reason } => JoinResponse::Declined { reason },
    };
    Ok(Json(response))
}

/// `POST /trades/{trade_id}/role` — claim the buyer or seller slot.
async fn claim_role(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ClaimRoleRequest>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .claim_role(trade_id, body.actor.into_actor(), body.role)
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/terms` — set the agreed terms.
async fn set_terms(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<SetTermsRequest>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let terms = Terms {
        token: TokenSymbol::new(&body.token),
        chain: ChainName::new(&body.chain),
        quantity: body.quantity,
        rate: body.rate,
        payment_method: body.payment_method,
    };
    let trade = state
        .flow
        .set_terms(trade_id, body.actor.into_actor(), terms)
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/address` — set the caller's payout address.
///
/// Which side the address belongs to follows from the caller's role.
async fn set_address(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<SetAddressRequest>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .set_address(trade_id, body.actor.into_actor(), body.address)
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/confirm` — confirm details and open the deposit
/// window.
async fn confirm_details(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .confirm_details(trade_id, body.into_actor())
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/deposit-check` — scan the next block window for
/// deposits.
async fn deposit_check(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let check = state
        .flow
        .check_deposit(trade_id, body.into_actor())
        .await?;
    let response = match check {
        DepositCheck::Credited {
            trade,
            amount,
            full,
        } => DepositCheckResponse::Credited {
            amount,
            full,
            trade: trade_response(&trade),
        },
        DepositCheck::NoNewDeposit { scanned_to } => {
            DepositCheckResponse::NoNewDeposit { scanned_to }
        }
    };
    Ok(Json(response))
}

/// `POST /trades/{trade_id}/fiat-sent` — buyer marks the fiat leg sent.
async fn fiat_sent(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .mark_fiat_sent(trade_id, body.into_actor())
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/fiat-received` — seller confirms the fiat leg.
async fn fiat_received(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .confirm_fiat_received(trade_id, body.into_actor())
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/approve-release` — approve paying the buyer.
async fn approve_release(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let outcome = state
        .flow
        .approve_release(trade_id, body.into_actor())
        .await?;
    Ok(Json(approval_response(outcome)))
}

/// `POST /trades/{trade_id}/decline-release` — withdraw release consensus.
///
/// Clears both approval sets; consensus restarts from scratch.
async fn decline_release(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .decline_release(trade_id, body.into_actor())
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/approve-refund` — approve refunding the seller.
async fn approve_refund(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let outcome = state
        .flow
        .approve_refund(trade_id, body.into_actor())
        .await?;
    Ok(Json(approval_response(outcome)))
}

/// `POST /trades/{trade_id}/decline-refund` — withdraw refund consensus.
async fn decline_refund(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .decline_refund(trade_id, body.into_actor())
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/partial` — stage a partial settlement amount.
async fn stage_partial(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<StagePartialRequest>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .stage_partial(trade_id, body.actor.into_actor(), body.amount)
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/dispute` — freeze the trade for admin resolution.
async fn open_dispute(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state
        .flow
        .open_dispute(trade_id, body.into_actor())
        .await?;
    Ok(Json(trade_response(&trade)))
}

/// `POST /trades/{trade_id}/close` — tear down a trade that never held
/// funds, or hand a settled trade's venue back without waiting out the
/// recycle grace. Both paths re-authorize the named user.
async fn close_trade(
    state: State<AppState>,
    _auth: ServiceAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let trade = state.flow.get_trade(trade_id).await?;
    match trade.status {
        TradeStatus::Completed | TradeStatus::Refunded => {
            state
                .flow
                .recycle_trade(trade_id, body.into_actor())
                .await?;
        }
        _ => {
            state.flow.close_trade(trade_id, body.into_actor()).await?;
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

fn approval_response(outcome: ApprovalOutcome) -> ApprovalResponse {
    match outcome {
        ApprovalOutcome::Pending { trade } => ApprovalResponse::Pending {
            trade: trade_response(&trade),
        },
        ApprovalOutcome::Settled(settlement) => ApprovalResponse::Settled {
            settlement: settlement_response(&settlement),
        },
        ApprovalOutcome::InFlight => ApprovalResponse::InFlight,
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur in Service API handlers.
#[derive(Debug)]
enum ServiceApiError {
    Engine(EngineError),
}

impl From<EngineError> for ServiceApiError {
    fn from(err: EngineError) -> Self {
        ServiceApiError::Engine(err)
    }
}

impl IntoResponse for ServiceApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ServiceApiError::Engine(err) => engine_error_response(err).into_response(),
        }
    }
}
