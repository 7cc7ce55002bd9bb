//! Telegram implementation of the venue messaging gateway.
//!
//! One venue is one group chat the bot administers. Each method performs a
//! single Bot API call; bounded retries live in the engine (`with_retry`),
//! so this layer only classifies failures into the gateway error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use custos_core::entities::{UserId, VenueId};
use custos_core::messaging::{GatewayError, MessageRef, VenueGateway};

const API_BASE: &str = "https://api.telegram.org";

/// [`VenueGateway`] backed by the Telegram Bot API.
pub struct TelegramGateway {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramGateway {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(API_BASE, bot_token)
    }

    /// Point the gateway at a different API host (a local Bot API server).
    pub fn with_base_url(base: &str, bot_token: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: format!("{}/bot{}", base.trim_end_matches('/'), bot_token),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<T, GatewayError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        envelope.into_result()
    }
}

#[async_trait]
impl VenueGateway for TelegramGateway {
    async fn send_message(&self, venue: VenueId, text: &str) -> Result<MessageRef, GatewayError> {
        let message: Message = self
            .call("sendMessage", json!({ "chat_id": venue.0, "text": text }))
            .await?;
        Ok(message.message_id)
    }

    async fn edit_message(
        &self,
        venue: VenueId,
        message: MessageRef,
        text: &str,
    ) -> Result<(), GatewayError> {
        // Returns the edited Message for chat messages; the payload is not
        // needed.
        let _: serde_json::Value = self
            .call(
                "editMessageText",
                json!({ "chat_id": venue.0, "message_id": message, "text": text }),
            )
            .await?;
        Ok(())
    }

    async fn approve_join(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError> {
        let _: bool = self
            .call(
                "approveChatJoinRequest",
                json!({ "chat_id": venue.0, "user_id": user.0 }),
            )
            .await?;
        Ok(())
    }

    async fn decline_join(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError> {
        let _: bool = self
            .call(
                "declineChatJoinRequest",
                json!({ "chat_id": venue.0, "user_id": user.0 }),
            )
            .await?;
        Ok(())
    }

    async fn remove_member(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError> {
        // Ban-then-unban is Telegram's "kick": the user is out but may come
        // back through a future invite.
        let _: bool = self
            .call(
                "banChatMember",
                json!({ "chat_id": venue.0, "user_id": user.0 }),
            )
            .await?;
        let _: bool = self
            .call(
                "unbanChatMember",
                json!({ "chat_id": venue.0, "user_id": user.0, "only_if_banned": true }),
            )
            .await?;
        Ok(())
    }

    async fn rotate_invite(&self, venue: VenueId) -> Result<String, GatewayError> {
        // Join-request links keep every entry behind an explicit
        // approve/decline, so a stale link in old hands grants nothing.
        let link: ChatInviteLink = self
            .call(
                "createChatInviteLink",
                json!({ "chat_id": venue.0, "creates_join_request": true }),
            )
            .await?;
        Ok(link.invite_link)
    }

    async fn is_member(&self, venue: VenueId, user: UserId) -> Result<bool, GatewayError> {
        let member: ChatMember = self
            .call(
                "getChatMember",
                json!({ "chat_id": venue.0, "user_id": user.0 }),
            )
            .await?;
        Ok(member.is_present())
    }
}

/// The Bot API response wrapper: `{"ok": true, "result": ...}` or
/// `{"ok": false, "error_code": ..., "description": ...}`.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

impl<T> ApiEnvelope<T> {
    fn into_result(self) -> Result<T, GatewayError> {
        if self.ok {
            return self
                .result
                .ok_or_else(|| GatewayError::Transport("response missing result".into()));
        }
        let description = self
            .description
            .unwrap_or_else(|| "no description".to_owned());
        match self.error_code {
            Some(429) => Err(GatewayError::RateLimited {
                retry_after: self
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs),
            }),
            Some(code) if code >= 500 => Err(GatewayError::Transport(format!(
                "server error {code}: {description}"
            ))),
            _ => Err(GatewayError::Rejected(description)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ChatInviteLink {
    invite_link: String,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
    /// Only meaningful for `restricted` members, who may be inside or
    /// outside the chat.
    is_member: Option<bool>,
}

impl ChatMember {
    fn is_present(&self) -> bool {
        match self.status.as_str() {
            "creator" | "administrator" | "member" => true,
            "restricted" => self.is_member.unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope<T: serde::de::DeserializeOwned>(body: &str) -> ApiEnvelope<T> {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn ok_envelope_yields_the_result() {
        let env: ApiEnvelope<Message> =
            envelope(r#"{"ok": true, "result": {"message_id": 42}}"#);
        assert_eq!(env.into_result().unwrap().message_id, 42);
    }

    #[test]
    fn rate_limit_maps_to_retryable_with_hint() {
        let env: ApiEnvelope<bool> = envelope(
            r#"{"ok": false, "error_code": 429, "description": "Too Many Requests: retry after 31", "parameters": {"retry_after": 31}}"#,
        );
        match env.into_result() {
            Err(GatewayError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(31)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn bad_request_maps_to_rejected() {
        let env: ApiEnvelope<bool> = envelope(
            r#"{"ok": false, "error_code": 400, "description": "Bad Request: chat not found"}"#,
        );
        let err = env.into_result().unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_error_maps_to_retryable_transport() {
        let env: ApiEnvelope<bool> =
            envelope(r#"{"ok": false, "error_code": 502, "description": "Bad Gateway"}"#);
        let err = env.into_result().unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn ok_without_result_is_a_transport_error() {
        let env: ApiEnvelope<Message> = envelope(r#"{"ok": true}"#);
        assert!(matches!(
            env.into_result(),
            Err(GatewayError::Transport(_))
        ));
    }

    #[test]
    fn membership_statuses() {
        let present = |status: &str, is_member: Option<bool>| {
            ChatMember {
                status: status.to_owned(),
                is_member,
            }
            .is_present()
        };
        assert!(present("member", None));
        assert!(present("administrator", None));
        assert!(present("creator", None));
        assert!(present("restricted", Some(true)));
        assert!(!present("restricted", Some(false)));
        assert!(!present("left", None));
        assert!(!present("kicked", None));
    }
}
