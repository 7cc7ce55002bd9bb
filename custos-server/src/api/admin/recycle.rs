use axum::{Json, extract::Path, http::StatusCode, response::IntoResponse};
use uuid::Uuid;

use crate::api::ActorBody;
use crate::api::extractors::AdminAuth;
use crate::state::AppState;

use super::AdminApiError;

/// `POST /trades/{trade_id}/recycle` — reclaim a terminal trade's venue.
///
/// Clears the membership roster, rotates the invite credential, and returns
/// the venue to the available pool.
pub async fn recycle(
    state: axum::extract::State<AppState>,
    _auth: AdminAuth,
    Path(trade_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, AdminApiError> {
    state.flow.recycle_trade(trade_id, body.into_actor()).await?;
    Ok(StatusCode::NO_CONTENT)
}
