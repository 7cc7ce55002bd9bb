use axum::{Json, extract::Path, response::IntoResponse};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::extractors::AdminAuth;
use crate::api::{ActorBody, settlement_response};
use crate::state::AppState;

use super::AdminApiError;

#[derive(Debug, Deserialize)]
pub(crate) struct ForceSettleRequest {
    #[serde(flatten)]
    actor: ActorBody,
    /// Amount to move, in token units. Absent means the full held balance.
    #[serde(default)]
    amount: Option<Decimal>,
}

/// `POST /trades/{trade_id}/force-release` — pay the buyer without consensus.
pub async fn force_release(
    state: axum::extract::State<AppState>,
    _auth: AdminAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ForceSettleRequest>,
) -> Result<impl IntoResponse, AdminApiError> {
    let outcome = state
        .flow
        .force_release(trade_id, body.actor.into_actor(), body.amount)
        .await?;
    Ok(Json(settlement_response(&outcome)))
}

/// `POST /trades/{trade_id}/force-refund` — refund the seller without consensus.
pub async fn force_refund(
    state: axum::extract::State<AppState>,
    _auth: AdminAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ForceSettleRequest>,
) -> Result<impl IntoResponse, AdminApiError> {
    let outcome = state
        .flow
        .force_refund(trade_id, body.actor.into_actor(), body.amount)
        .await?;
    Ok(Json(settlement_response(&outcome)))
}
