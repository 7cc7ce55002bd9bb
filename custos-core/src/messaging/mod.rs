//! The venue messaging capability the engine consumes.
//!
//! The engine treats the chat platform as an opaque side-effect surface with
//! at-least-once semantics: send/edit messages, gate join requests, remove
//! members, rotate invite credentials. The server crate implements this
//! against the Telegram Bot API; the testkit provides a recording fake.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::entities::{UserId, VenueId};
use crate::utils::backoff::{jittered, retry_delay};

/// Platform reference to a sent message, for later edits.
pub type MessageRef = i64;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The platform asked us to slow down. Retried, honoring the hint.
    #[error("rate limited by the messaging platform (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Network-level failure. Retried with backoff.
    #[error("messaging transport error: {0}")]
    Transport(String),
    /// The platform understood and refused (bad chat id, missing rights).
    /// Never retried.
    #[error("messaging request rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. } | GatewayError::Transport(_)
        )
    }
}

/// Venue-side operations of the chat platform.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    async fn send_message(&self, venue: VenueId, text: &str) -> Result<MessageRef, GatewayError>;

    async fn edit_message(
        &self,
        venue: VenueId,
        message: MessageRef,
        text: &str,
    ) -> Result<(), GatewayError>;

    async fn approve_join(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError>;

    async fn decline_join(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError>;

    async fn remove_member(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError>;

    /// Rotate the venue's join credential, invalidating the previous one.
    /// Returns the new credential.
    async fn rotate_invite(&self, venue: VenueId) -> Result<String, GatewayError>;

    /// Live membership probe, used to resolve ambiguous join races.
    async fn is_member(&self, venue: VenueId, user: UserId) -> Result<bool, GatewayError>;
}

/// Attempts per gateway call before giving up.
pub const MAX_GATEWAY_ATTEMPTS: u32 = 4;

/// Run a gateway call with bounded retries.
///
/// Transport errors back off exponentially with jitter; rate limits honor the
/// server-supplied retry-after when present. Rejections surface immediately.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < MAX_GATEWAY_ATTEMPTS => {
                let base = match &err {
                    GatewayError::RateLimited {
                        retry_after: Some(hint),
                    } => *hint,
                    _ => retry_delay(attempt),
                };
                tracing::debug!(
                    attempt,
                    delay_ms = base.as_millis() as u64,
                    error = %err,
                    "retrying gateway call"
                );
                tokio::time::sleep(jittered(base)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
