//! Telegram connector — long-polls the Bot API for updates.
//!
//! Inbound messages are mapped to content elements (text, captions, photos,
//! stickers, voice/audio) with `reply_to_message` carried as quote metadata.
//! Outbound sends go through `sendMessage`; a quote element becomes
//! `reply_to_message_id` and long texts are split, each chunk yielding its own
//! message id.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::connectors::{Connector, EventStream, InstanceStatus};
use crate::content::ContentElement;
use crate::error::ConnectorError;
use crate::relay::types::{Author, InboundEvent, QuoteInfo, Sender};

const PLATFORM: &str = "telegram";

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Back-off after a failed poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Telegram bot instance.
pub struct TelegramConnector {
    instance: String,
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
    online: AtomicBool,
    self_id: OnceLock<String>,
}

impl TelegramConnector {
    pub fn new(instance: impl Into<String>, bot_token: SecretString) -> Self {
        Self {
            instance: instance.into(),
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
            online: AtomicBool::new(false),
            self_id: OnceLock::new(),
        }
    }

    /// Point the connector at another Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    fn send_error(reason: impl Into<String>) -> ConnectorError {
        ConnectorError::SendFailed {
            name: PLATFORM.into(),
            reason: reason.into(),
        }
    }

    /// Call `getMe` and return the bot's numeric user id.
    async fn fetch_self_id(&self) -> Result<String, ConnectorError> {
        let startup_error = |reason: String| ConnectorError::StartupFailed {
            name: PLATFORM.into(),
            reason,
        };

        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(startup_error(format!("getMe returned {}", resp.status())));
        }

        let data: Value = resp.json().await.map_err(|e| startup_error(e.to_string()))?;
        data.pointer("/result/id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| startup_error("getMe response has no result.id".into()))
    }

    /// Send a single message chunk (≤4096 chars). Returns its message id.
    async fn send_message_chunk(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, ConnectorError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(reply_to) = reply_to.and_then(|id| id.parse::<i64>().ok()) {
            body["reply_to_message_id"] = Value::from(reply_to);
            body["allow_sending_without_reply"] = Value::Bool(true);
        }

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            return Err(Self::send_error(format!(
                "sendMessage returned {status}: {err}"
            )));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| Self::send_error(e.to_string()))?;
        data.pointer("/result/message_id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| Self::send_error("sendMessage response has no message_id"))
    }
}

// ── Connector trait implementation ──────────────────────────────────

#[async_trait]
impl Connector for TelegramConnector {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn instance_id(&self) -> &str {
        &self.instance
    }

    fn status(&self) -> InstanceStatus {
        if self.online.load(Ordering::Relaxed) {
            InstanceStatus::Online
        } else if self.self_id.get().is_some() {
            InstanceStatus::Offline
        } else {
            InstanceStatus::Connecting
        }
    }

    async fn start(&self) -> Result<EventStream, ConnectorError> {
        let self_id = self.fetch_self_id().await?;
        let self_id = self.self_id.get_or_init(|| self_id).clone();
        self.online.store(true, Ordering::Relaxed);

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let instance = self.instance.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            tracing::info!(instance = %instance, "Telegram connector listening for messages");

            loop {
                let updates = match poll_updates(&client, &url, offset).await {
                    Ok(updates) => updates,
                    Err(e) => {
                        tracing::warn!(instance = %instance, error = %e, "Telegram poll failed");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                for update in &updates {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }
                    let Some(message) = update.get("message") else {
                        continue;
                    };
                    let Some(event) = parse_message(message, &instance, &self_id) else {
                        continue;
                    };
                    if tx.send(event).is_err() {
                        tracing::info!(instance = %instance, "Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn send(
        &self,
        channel_id: &str,
        elements: &[ContentElement],
    ) -> Result<Vec<String>, ConnectorError> {
        if self.status() == InstanceStatus::Offline {
            return Err(ConnectorError::Unavailable {
                name: PLATFORM.into(),
                instance: self.instance.clone(),
            });
        }
        let (text, reply_to) = compose_outbound(elements);
        if text.trim().is_empty() {
            return Err(Self::send_error("nothing to send"));
        }

        let chunks = split_message(&text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let mut ids = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let reply = if i == 0 { reply_to.as_deref() } else { None };
            match self.send_message_chunk(channel_id, chunk, reply).await {
                Ok(id) => ids.push(id),
                // Nothing posted yet: the whole send failed.
                Err(e) if ids.is_empty() => return Err(e),
                Err(e) => {
                    // Chunks already posted keep their ids.
                    tracing::warn!(
                        chat_id = channel_id,
                        posted = ids.len(),
                        dropped = chunks.len() - ids.len(),
                        error = %e,
                        "Telegram send incomplete"
                    );
                    break;
                }
            }
        }
        tracing::debug!(chat_id = channel_id, count = ids.len(), "Telegram message sent");
        Ok(ids)
    }

    async fn fetch_quote_author(
        &self,
        _channel_id: &str,
        _message_id: &str,
    ) -> Result<Option<Author>, ConnectorError> {
        // Replies carry the quoted author inline.
        Ok(None)
    }

    async fn shutdown(&self) -> Result<(), ConnectorError> {
        tracing::info!(instance = %self.instance, "Telegram connector shutting down");
        self.online.store(false, Ordering::Relaxed);
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn fetch_error(reason: impl Into<String>) -> ConnectorError {
    ConnectorError::FetchFailed {
        name: PLATFORM.into(),
        reason: reason.into(),
    }
}

/// One long-poll round of `getUpdates` starting at `offset`.
async fn poll_updates(
    client: &reqwest::Client,
    url: &str,
    offset: i64,
) -> Result<Vec<Value>, ConnectorError> {
    let body = serde_json::json!({
        "offset": offset,
        "timeout": 30,
        "allowed_updates": ["message"]
    });
    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| ConnectorError::Http(e.to_string()))?;

    let status = resp.status();
    let mut data: Value = resp
        .json()
        .await
        .map_err(|e| fetch_error(format!("getUpdates returned {status}: {e}")))?;

    if !status.is_success() {
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description");
        return Err(fetch_error(format!("getUpdates returned {status}: {description}")));
    }

    match data["result"].take() {
        Value::Array(updates) => Ok(updates),
        _ => Err(fetch_error("getUpdates response has no result")),
    }
}

fn id_string(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_i64).map(|id| id.to_string())
}

/// Full display name of a Telegram user object.
fn user_name(user: &Value) -> Option<String> {
    let first = user.get("first_name").and_then(Value::as_str)?;
    Some(match user.get("last_name").and_then(Value::as_str) {
        Some(last) => format!("{first} {last}"),
        None => first.to_string(),
    })
}

/// Map the content of a Telegram message object to elements.
fn message_elements(message: &Value) -> Vec<ContentElement> {
    let mut elements = Vec::new();

    if let Some(photo) = message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
        .and_then(|p| p.get("file_id"))
        .and_then(Value::as_str)
    {
        elements.push(ContentElement::Image {
            url: format!("tg://file/{photo}"),
        });
    }

    if let Some(sticker) = message.get("sticker") {
        elements.push(ContentElement::Emoji {
            id: sticker
                .get("file_unique_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: sticker.get("emoji").and_then(Value::as_str).map(String::from),
        });
    }

    if message.get("voice").is_some() || message.get("audio").is_some() {
        elements.push(ContentElement::Audio { url: None });
    }

    if let Some(text) = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
    {
        elements.push(ContentElement::text(text));
    }

    elements
}

/// Convert a Telegram message object into an inbound event.
fn parse_message(message: &Value, instance: &str, self_id: &str) -> Option<InboundEvent> {
    let message_id = id_string(message.get("message_id"))?;
    let channel = id_string(message.pointer("/chat/id"))?;
    let from = message.get("from")?;
    let sender = Sender {
        id: id_string(from.get("id"))?,
        name: user_name(from),
        avatar: None,
    };

    let quote = message.get("reply_to_message").and_then(|reply| {
        Some(QuoteInfo {
            message_id: id_string(reply.get("message_id"))?,
            author: reply.get("from").and_then(|f| {
                Some(Author {
                    id: id_string(f.get("id"))?,
                    name: user_name(f),
                })
            }),
            elements: message_elements(reply),
            nickname: None,
        })
    });

    let received_at = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now);

    Some(InboundEvent {
        platform: PLATFORM.to_string(),
        instance: instance.to_string(),
        self_id: self_id.to_string(),
        channel,
        message_id,
        sender,
        elements: message_elements(message),
        quote,
        received_at,
    })
}

/// Flatten outbound elements into message text plus an optional reply id.
fn compose_outbound(elements: &[ContentElement]) -> (String, Option<String>) {
    let mut text = String::new();
    let mut reply_to = None;
    for element in elements {
        match element {
            ContentElement::Text { content } => text.push_str(content),
            ContentElement::Quote { message_id } => {
                reply_to.get_or_insert_with(|| message_id.clone());
            }
            ContentElement::Mention { id, name } => {
                text.push_str(&format!("@{}", name.as_deref().unwrap_or(id)))
            }
            ContentElement::Emoji { name, .. } => {
                if let Some(name) = name {
                    text.push_str(name);
                }
            }
            other => tracing::debug!(kind = ?other.kind(), "Telegram: dropping unsupported element"),
        }
    }
    (text, reply_to)
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut boundary = max_len;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> TelegramConnector {
        TelegramConnector::new("relaybot", SecretString::from("123:ABC"))
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            connector().api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn custom_api_base_is_trimmed() {
        let ch = connector().with_api_base("http://localhost:8081/");
        assert_eq!(ch.api_url("sendMessage"), "http://localhost:8081/bot123:ABC/sendMessage");
    }

    #[test]
    fn status_connecting_before_start() {
        let ch = connector();
        assert_eq!(ch.status(), InstanceStatus::Connecting);
        assert!(!ch.supports_author_simulation());
        assert_eq!(ch.platform(), "telegram");
        assert_eq!(ch.instance_id(), "relaybot");
    }

    #[test]
    fn parse_text_reply() {
        let message = serde_json::json!({
            "message_id": 55,
            "date": 1_700_000_000,
            "chat": {"id": -100123},
            "from": {"id": 42, "first_name": "Alice", "last_name": "Liddell"},
            "text": "agreed",
            "reply_to_message": {
                "message_id": 54,
                "from": {"id": 999, "first_name": "Relay"},
                "text": "original"
            }
        });
        let event = parse_message(&message, "relaybot", "999").unwrap();
        assert_eq!(event.channel, "-100123");
        assert_eq!(event.message_id, "55");
        assert_eq!(event.sender.display_name(), "Alice Liddell");
        assert_eq!(event.elements, vec![ContentElement::text("agreed")]);

        let quote = event.quote.unwrap();
        assert_eq!(quote.message_id, "54");
        assert_eq!(quote.author.unwrap().id, "999");
        assert_eq!(quote.elements, vec![ContentElement::text("original")]);
    }

    #[test]
    fn parse_photo_with_caption() {
        let message = serde_json::json!({
            "message_id": 7,
            "chat": {"id": 1},
            "from": {"id": 2, "first_name": "Bob"},
            "photo": [{"file_id": "small"}, {"file_id": "large"}],
            "caption": "look"
        });
        let event = parse_message(&message, "relaybot", "999").unwrap();
        assert_eq!(
            event.elements,
            vec![
                ContentElement::Image {
                    url: "tg://file/large".into()
                },
                ContentElement::text("look"),
            ]
        );
        assert!(event.quote.is_none());
    }

    #[test]
    fn parse_sticker_and_voice() {
        let sticker = serde_json::json!({
            "message_id": 8, "chat": {"id": 1}, "from": {"id": 2, "first_name": "Bob"},
            "sticker": {"file_unique_id": "u1", "emoji": "😀"}
        });
        let voice = serde_json::json!({
            "message_id": 9, "chat": {"id": 1}, "from": {"id": 2, "first_name": "Bob"},
            "voice": {"file_id": "v"}
        });
        assert!(matches!(
            parse_message(&sticker, "b", "s").unwrap().elements[0],
            ContentElement::Emoji { .. }
        ));
        assert_eq!(
            parse_message(&voice, "b", "s").unwrap().elements,
            vec![ContentElement::Audio { url: None }]
        );
    }

    #[test]
    fn parse_without_sender_is_skipped() {
        let message = serde_json::json!({"message_id": 1, "chat": {"id": 1}, "text": "x"});
        assert!(parse_message(&message, "b", "s").is_none());
    }

    #[test]
    fn compose_uses_first_quote_as_reply() {
        let (text, reply) = compose_outbound(&[
            ContentElement::quote("10"),
            ContentElement::text("[TG - Alice]\n"),
            ContentElement::text("hi"),
            ContentElement::Author {
                name: "ignored".into(),
                avatar: None,
            },
        ]);
        assert_eq!(text, "[TG - Alice]\nhi");
        assert_eq!(reply.as_deref(), Some("10"));
    }

    #[test]
    fn split_short_message_untouched() {
        assert_eq!(split_message("hello", 10), vec!["hello".to_string()]);
    }

    #[test]
    fn split_prefers_newlines() {
        let chunks = split_message("aaaa\nbbbb\ncccc", 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb".to_string(), "cccc".to_string()]);
    }

    #[test]
    fn split_hard_cuts_without_whitespace() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));
    }

    #[test]
    fn split_respects_char_boundaries() {
        let chunks = split_message(&"é".repeat(10), 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), "é".repeat(10));
    }

    #[tokio::test]
    async fn send_empty_text_fails_without_network() {
        let err = connector()
            .send("1", &[ContentElement::quote("3")])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::SendFailed { .. }));
    }

    async fn stub_updates(status: u16, body: Value) -> String {
        let app = axum::Router::new().route(
            "/updates",
            axum::routing::post(move || {
                let body = body.clone();
                async move {
                    (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        axum::Json(body),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/updates")
    }

    #[tokio::test]
    async fn poll_returns_updates() {
        let url = stub_updates(
            200,
            serde_json::json!({"ok": true, "result": [{"update_id": 5}, {"update_id": 6}]}),
        )
        .await;
        let updates = poll_updates(&reqwest::Client::new(), &url, 0).await.unwrap();
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn rejected_poll_reports_description() {
        let url = stub_updates(
            401,
            serde_json::json!({"ok": false, "error_code": 401, "description": "Unauthorized"}),
        )
        .await;
        let err = poll_updates(&reqwest::Client::new(), &url, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::FetchFailed { .. }));
        assert!(err.to_string().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn poll_without_result_fails() {
        let url = stub_updates(200, serde_json::json!({"ok": true})).await;
        let err = poll_updates(&reqwest::Client::new(), &url, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::FetchFailed { .. }));
    }

    #[tokio::test]
    async fn send_to_unreachable_server_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ch = connector().with_api_base(format!("http://{addr}"));
        let err = ch
            .send("1", &[ContentElement::text("hello")])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Http(_)));
    }
}
