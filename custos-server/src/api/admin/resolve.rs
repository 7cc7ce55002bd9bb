use axum::{Json, extract::Path, response::IntoResponse};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use custos_core::entities::SettlementKind;

use crate::api::extractors::AdminAuth;
use crate::api::{ActorBody, settlement_response};
use crate::state::AppState;

use super::AdminApiError;

#[derive(Debug, Deserialize)]
pub(crate) struct ResolveRequest {
    #[serde(flatten)]
    actor: ActorBody,
    /// Which side the held funds go to.
    outcome: SettlementKind,
    /// Amount to move, in token units. Absent means the full held balance.
    #[serde(default)]
    amount: Option<Decimal>,
}

/// `POST /trades/{trade_id}/resolve` — settle a disputed trade either way.
///
/// A partial amount leaves the trade disputed with the remainder still held,
/// so a split resolution takes one call per side.
pub async fn resolve(
    state: axum::extract::State<AppState>,
    _auth: AdminAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ResolveRequest>,
) -> Result<impl IntoResponse, AdminApiError> {
    let actor = body.actor.into_actor();
    let outcome = match body.outcome {
        SettlementKind::Release => state.flow.force_release(trade_id, actor, body.amount).await?,
        SettlementKind::Refund => state.flow.force_refund(trade_id, actor, body.amount).await?,
    };
    Ok(Json(settlement_response(&outcome)))
}
