//! Moderation gateway. Asks a local text-moderation service for a cleaned
//! version of each relayed message.
//!
//! The call is bounded by a short timeout and fails open: on any error the
//! original text is relayed unchanged.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ModerationError;

/// Default moderation endpoint.
pub const DEFAULT_MODERATION_URL: &str = "http://127.0.0.1:41356";

/// Hard budget for one moderation call.
pub const DEFAULT_MODERATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Anything that can rewrite outgoing text. Implementations must not fail.
#[async_trait]
pub trait Moderator: Send + Sync {
    /// Return the text to relay for `text` sent by `actor` in `conversation`.
    async fn moderate(&self, actor: &str, conversation: &str, text: &str) -> String;
}

/// Moderator used when moderation is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl Moderator for Passthrough {
    async fn moderate(&self, _actor: &str, _conversation: &str, text: &str) -> String {
        text.to_string()
    }
}

#[derive(Debug, Serialize)]
struct ModerationRequest<'a> {
    from: &'a str,
    ctx: &'a str,
    context: &'a str,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    #[serde(default)]
    context: Option<String>,
}

/// HTTP moderation client.
pub struct ModerationGateway {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl ModerationGateway {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One attempt against the endpoint, bounded by the configured timeout.
    async fn request(
        &self,
        actor: &str,
        conversation: &str,
        text: &str,
    ) -> Result<String, ModerationError> {
        let body = ModerationRequest {
            from: actor,
            ctx: conversation,
            context: text,
        };

        let call = async {
            let resp = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| ModerationError::Request(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(ModerationError::Status(resp.status().as_u16()));
            }

            let parsed: ModerationResponse = resp
                .json()
                .await
                .map_err(|e| ModerationError::Decode(e.to_string()))?;
            parsed.context.ok_or(ModerationError::MissingField)
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ModerationError::Timeout(self.timeout))?
    }
}

impl Default for ModerationGateway {
    fn default() -> Self {
        Self::new(DEFAULT_MODERATION_URL, DEFAULT_MODERATION_TIMEOUT)
    }
}

#[async_trait]
impl Moderator for ModerationGateway {
    async fn moderate(&self, actor: &str, conversation: &str, text: &str) -> String {
        match self.request(actor, conversation, text).await {
            Ok(replacement) => {
                debug!(
                    actor,
                    conversation,
                    changed = replacement != text,
                    "Moderation applied"
                );
                replacement
            }
            Err(e) => {
                warn!(
                    actor,
                    conversation,
                    url = %self.url,
                    error = %e,
                    "Moderation unavailable, relaying original text"
                );
                text.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_returns_input() {
        assert_eq!(Passthrough.moderate("u", "c", "hello").await, "hello");
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_open() {
        // Bind then drop so the port is known to refuse connections.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let gateway = ModerationGateway::new(format!("http://{addr}"), DEFAULT_MODERATION_TIMEOUT);
        assert_eq!(gateway.moderate("u", "c", "raw text").await, "raw text");
    }

    #[test]
    fn request_body_shape() {
        let body = ModerationRequest {
            from: "alice",
            ctx: "room-1",
            context: "hi",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"from": "alice", "ctx": "room-1", "context": "hi"}));
    }

    #[test]
    fn response_without_context_parses_as_none() {
        let parsed: ModerationResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.context.is_none());
    }

    #[test]
    fn default_gateway_targets_local_endpoint() {
        assert_eq!(ModerationGateway::default().url(), DEFAULT_MODERATION_URL);
    }
}
