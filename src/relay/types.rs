//! Shared types for the relay pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TargetEndpoint;
use crate::connectors::InstanceStatus;
use crate::content::ContentElement;
use crate::store::MessageKey;

// ── Inbound event ───────────────────────────────────────────────────

/// Who posted a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

impl Sender {
    /// Display name, falling back to the platform id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.id)
    }
}

/// Author of a quoted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub name: Option<String>,
}

/// Metadata about the message an inbound message replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteInfo {
    pub message_id: String,
    /// May be absent when the platform does not inline the author; the
    /// dispatcher then asks the source connector.
    pub author: Option<Author>,
    #[serde(default)]
    pub elements: Vec<ContentElement>,
    /// Member nickname of the quoted author in this channel.
    pub nickname: Option<String>,
}

impl QuoteInfo {
    /// Name used in the textual fallback rendering.
    pub fn display_name(&self) -> &str {
        if let Some(nick) = self.nickname.as_deref().filter(|n| !n.is_empty()) {
            return nick;
        }
        match &self.author {
            Some(author) => author
                .name
                .as_deref()
                .filter(|n| !n.is_empty())
                .unwrap_or(&author.id),
            None => "unknown",
        }
    }
}

/// A message event emitted by a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Platform id, e.g. "telegram".
    pub platform: String,
    /// Bot instance that observed the message.
    pub instance: String,
    /// The bot's own user id on the platform.
    pub self_id: String,
    pub channel: String,
    pub message_id: String,
    pub sender: Sender,
    pub elements: Vec<ContentElement>,
    pub quote: Option<QuoteInfo>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Address of this message in the correlation table.
    pub fn key(&self) -> MessageKey {
        MessageKey::new(&self.message_id, &self.instance, &self.channel)
    }

    /// Whether the bot itself posted this message.
    pub fn is_own_message(&self) -> bool {
        self.sender.id == self.self_id
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Why a message was not relayed at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// A blocking-word pattern matched.
    Blocked { pattern: String },
    /// Quote-only source and the message is not a correlated reply.
    QuoteOnly,
    /// Nothing left to relay after the transform.
    EmptyContent,
}

impl DropReason {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "blocked",
            Self::QuoteOnly => "quote_only",
            Self::EmptyContent => "empty_content",
        }
    }
}

/// Why a single target was passed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No connector is registered for the target's platform/instance.
    InstanceMissing,
    /// The connector exists but is not online.
    InstanceNotOnline(InstanceStatus),
}

/// Result of relaying to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Delivered { message_ids: Vec<String> },
    Skipped(SkipReason),
    Failed(String),
}

impl TargetOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Outcome for one target of a fan-out.
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub target: TargetEndpoint,
    pub outcome: TargetOutcome,
}

/// Result of running one inbound message through the pipeline.
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    Dropped(DropReason),
    Relayed {
        targets: Vec<TargetReport>,
        /// Rows added to the correlation table.
        records_written: usize,
    },
}

impl RelayOutcome {
    /// Number of targets that received the message.
    pub fn delivered_count(&self) -> usize {
        match self {
            Self::Dropped(_) => 0,
            Self::Relayed { targets, .. } => {
                targets.iter().filter(|t| t.outcome.is_delivered()).count()
            }
        }
    }
}
