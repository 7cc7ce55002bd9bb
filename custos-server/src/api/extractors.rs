//! Custom Axum extractors for request authentication.
//!
//! Provides:
//! - `ServiceAuth` — checks the `Custos-Service-Authorization` header against
//!   the shared service secret (used by the Service API).
//! - `AdminAuth` — verifies the `Custos-Admin-Authorization` header against
//!   the stored argon2 hash of the admin secret (used by the Admin API).
//!
//! Neither extractor identifies *who* is acting; fund-affecting requests name
//! their actor in the body and the engine authorizes that user separately.

use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};

use crate::state::AppState;

/// Header carrying the frontend service's shared secret.
pub const SERVICE_AUTH_HEADER: &str = "custos-service-authorization";
/// Header carrying the plaintext admin secret.
pub const ADMIN_AUTH_HEADER: &str = "custos-admin-authorization";

// ---------------------------------------------------------------------------
// ServiceAuth — Service API authentication via shared secret
// ---------------------------------------------------------------------------

/// An Axum extractor that authenticates frontend-service requests.
pub struct ServiceAuth;

/// Errors returned by the [`ServiceAuth`] extractor.
#[derive(Debug, thiserror::Error)]
pub enum ServiceAuthError {
    #[error("missing Custos-Service-Authorization header")]
    MissingHeader,
    #[error("malformed Custos-Service-Authorization header")]
    InvalidHeader,
    #[error("service authorization failed")]
    VerificationFailed,
}

impl IntoResponse for ServiceAuthError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceAuthError::MissingHeader | ServiceAuthError::VerificationFailed => {
                StatusCode::UNAUTHORIZED
            }
            ServiceAuthError::InvalidHeader => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

impl FromRequestParts<AppState> for ServiceAuth {
    type Rejection = ServiceAuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get(SERVICE_AUTH_HEADER)
            .ok_or(ServiceAuthError::MissingHeader)?
            .to_str()
            .map_err(|_| ServiceAuthError::InvalidHeader)?;

        let expected = state.service_secret.read().await;
        if !secrets_match(provided, &expected) {
            return Err(ServiceAuthError::VerificationFailed);
        }

        Ok(ServiceAuth)
    }
}

// ---------------------------------------------------------------------------
// AdminAuth — Admin API authentication via argon2-hashed secret
// ---------------------------------------------------------------------------

/// An Axum extractor that authenticates admin requests.
pub struct AdminAuth;

/// Errors returned by the [`AdminAuth`] extractor.
#[derive(Debug, thiserror::Error)]
pub enum AdminAuthError {
    #[error("missing Custos-Admin-Authorization header")]
    MissingHeader,
    #[error("malformed Custos-Admin-Authorization header")]
    InvalidHeader,
    #[error("admin authorization failed")]
    VerificationFailed,
}

impl IntoResponse for AdminAuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AdminAuthError::MissingHeader | AdminAuthError::VerificationFailed => {
                StatusCode::UNAUTHORIZED
            }
            AdminAuthError::InvalidHeader => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = AdminAuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get(ADMIN_AUTH_HEADER)
            .ok_or(AdminAuthError::MissingHeader)?
            .to_str()
            .map_err(|_| AdminAuthError::InvalidHeader)?;

        if !state.config.admin.read().await.verify_secret(provided) {
            return Err(AdminAuthError::VerificationFailed);
        }

        Ok(AdminAuth)
    }
}

/// Comparison cost must not depend on where the first mismatch is.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
