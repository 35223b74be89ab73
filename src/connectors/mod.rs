//! Platform connectors: the I/O edge of the relay.
//!
//! A connector turns one bot instance on one platform into a stream of
//! [`InboundEvent`]s and accepts element sequences to send. The dispatcher
//! never holds connectors directly; it asks an [`InstanceRegistry`] for the
//! live instance behind a target at send time.

pub mod console;
pub mod telegram;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::config::BotConfig;
use crate::content::ContentElement;
use crate::error::ConnectorError;
use crate::relay::types::{Author, InboundEvent};

pub use console::ConsoleConnector;
pub use telegram::TelegramConnector;

/// Stream of inbound events from a connector.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Connection state reported by a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Online,
    Connecting,
    Offline,
}

/// One bot instance on one platform.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Platform id, e.g. "telegram".
    fn platform(&self) -> &str;

    /// Instance id referenced by endpoint definitions.
    fn instance_id(&self) -> &str;

    fn status(&self) -> InstanceStatus;

    /// Whether the connector can render an [`ContentElement::Author`] marker.
    fn supports_author_simulation(&self) -> bool {
        false
    }

    /// Begin receiving messages.
    async fn start(&self) -> Result<EventStream, ConnectorError>;

    /// Send `elements` to `channel_id`. One logical send may produce several
    /// platform messages; all their ids are returned.
    async fn send(
        &self,
        channel_id: &str,
        elements: &[ContentElement],
    ) -> Result<Vec<String>, ConnectorError>;

    /// Look up who wrote `message_id`, when the inbound event did not say.
    async fn fetch_quote_author(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<Author>, ConnectorError>;

    async fn shutdown(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Lookup port for live connector instances.
pub trait InstanceRegistry: Send + Sync {
    fn resolve(&self, platform: &str, instance: &str) -> Option<Arc<dyn Connector>>;
}

/// Registry of all started connectors, keyed by (platform, instance).
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<(String, String), Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connector, replacing any with the same platform and instance.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        let key = (
            connector.platform().to_string(),
            connector.instance_id().to_string(),
        );
        tracing::info!(platform = %key.0, instance = %key.1, "Connector registered");
        self.connectors.insert(key, connector);
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Arc<dyn Connector>> {
        self.connectors.values()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

/// Build the connector for a configured bot.
///
/// Bots that cannot be built (unknown platform, missing credentials) are
/// logged and skipped so the remaining instances still start.
pub fn connector_for(bot: &BotConfig) -> Option<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match bot.platform.as_str() {
        "console" => {
            let channel = bot.channel.clone().unwrap_or_else(|| "lobby".to_string());
            Arc::new(ConsoleConnector::new(&bot.id, channel))
        }
        "telegram" => {
            let Some(token) = bot.resolve_token() else {
                tracing::warn!(
                    id = %bot.id,
                    token_env = bot.token_env.as_deref().unwrap_or("none"),
                    "Telegram bot has no token, skipping"
                );
                return None;
            };
            Arc::new(TelegramConnector::new(&bot.id, token))
        }
        other => {
            tracing::warn!(platform = other, id = %bot.id, "Unknown bot platform, skipping");
            return None;
        }
    };
    Some(connector)
}

impl InstanceRegistry for ConnectorRegistry {
    fn resolve(&self, platform: &str, instance: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .get(&(platform.to_string(), instance.to_string()))
            .cloned()
    }
}
