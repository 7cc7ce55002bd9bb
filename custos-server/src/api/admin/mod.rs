//! Admin API handlers.
//!
//! These endpoints are called by the operations dashboard and require the
//! `Custos-Admin-Authorization` header with the plaintext admin secret.
//! Force settlements additionally name the acting admin in the body; the
//! engine checks that user against the admin roster.
//!
//! # Endpoints
//!
//! - `GET  /trades`                           – list trades (filterable by status)
//! - `GET  /venues`                           – show the venue pool
//! - `POST /trades/{trade_id}/force-release`  – bypass consensus, pay the buyer
//! - `POST /trades/{trade_id}/force-refund`   – bypass consensus, refund the seller
//! - `POST /trades/{trade_id}/resolve`        – settle a disputed trade either way
//! - `POST /trades/{trade_id}/recycle`        – reclaim a terminal trade's venue

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};

use custos_core::engine::EngineError;

use crate::api::engine_error_response;
use crate::state::AppState;

mod force_settle;
mod list_trades;
mod list_venues;
mod recycle;
mod resolve;

/// Build the Admin API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trades", get(list_trades::list_trades))
        .route("/venues", get(list_venues::list_venues))
        .route(
            "/trades/{trade_id}/force-release",
            post(force_settle::force_release),
        )
        .route(
            "/trades/{trade_id}/force-refund",
            post(force_settle::force_refund),
        )
        .route("/trades/{trade_id}/resolve", post(resolve::resolve))
        .route("/trades/{trade_id}/recycle", post(recycle::recycle))
}

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

/// Errors that can occur in Admin API handlers.
#[derive(Debug)]
pub(crate) enum AdminApiError {
    Engine(EngineError),
    BadStatusFilter(String),
}

impl From<EngineError> for AdminApiError {
    fn from(err: EngineError) -> Self {
        AdminApiError::Engine(err)
    }
}

impl IntoResponse for AdminApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            AdminApiError::Engine(err) => engine_error_response(err).into_response(),
            AdminApiError::BadStatusFilter(value) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("unknown trade status: {value}"),
            )
                .into_response(),
        }
    }
}
