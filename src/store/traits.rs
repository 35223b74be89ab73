//! `RelayStore` trait, the correlation table behind reply-chain reconstruction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// A message address: platform-assigned id plus the bot instance and channel
/// it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub message_id: String,
    pub instance: String,
    pub channel: String,
}

impl MessageKey {
    pub fn new(
        message_id: impl Into<String>,
        instance: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            instance: instance.into(),
            channel: channel.into(),
        }
    }

    /// The (instance, channel) pair, used to match a record side to a target.
    pub fn location(&self) -> (&str, &str) {
        (&self.instance, &self.channel)
    }
}

/// A relay outcome staged for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRelayRecord {
    /// The inbound message that was relayed.
    pub source: MessageKey,
    /// One message produced on a target by that relay.
    pub target: MessageKey,
}

/// A persisted relay record. Never updated after insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    pub record_id: i64,
    pub source: MessageKey,
    pub target: MessageKey,
    pub created_at: DateTime<Utc>,
}

/// Append-only correlation table.
///
/// Lookups return matching records in ascending `record_id` order.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Records whose source side equals `key`.
    async fn find_by_source(&self, key: &MessageKey) -> Result<Vec<RelayRecord>, DatabaseError>;

    /// Records whose target side equals `key`.
    async fn find_by_target(&self, key: &MessageKey) -> Result<Vec<RelayRecord>, DatabaseError>;

    /// Insert a batch of records in one call. Pairs that already exist are
    /// left untouched. Returns the number of new rows.
    async fn upsert(&self, records: &[NewRelayRecord]) -> Result<usize, DatabaseError>;
}
