use axum::{Json, response::IntoResponse};

use crate::api::extractors::AdminAuth;
use crate::api::venue_response;
use crate::state::AppState;

use super::AdminApiError;

/// `GET /venues` — show every venue in the pool and its assignment.
pub async fn list_venues(
    state: axum::extract::State<AppState>,
    _auth: AdminAuth,
) -> Result<impl IntoResponse, AdminApiError> {
    let venues = state.flow.list_venues().await?;

    let response: Vec<_> = venues.iter().map(venue_response).collect();
    Ok(Json(response))
}
