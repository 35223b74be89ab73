//! Error types for the relay.

use std::time::Duration;

/// Top-level error type for the relay process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("database: {0}")]
    Database(#[from] DatabaseError),

    #[error("connector: {0}")]
    Connector(#[from] ConnectorError),

    #[error("moderation: {0}")]
    Moderation(#[from] ModerationError),
}

/// Problems loading `relay.toml`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    ParseError(String),

    #[error("{key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("{key} is required. {hint}")]
    MissingRequired { key: String, hint: String },
}

/// Failures of the relay record store.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot open database: {0}")]
    Pool(String),

    #[error("Relay record query failed: {0}")]
    Query(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Malformed relay record: {0}")]
    Serialization(String),
}

/// Platform connector errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Connector {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on connector {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to fetch from connector {name}: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Connector {name} instance {instance} is not available")]
    Unavailable { name: String, instance: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Moderation endpoint errors. Never surfaced past the gateway, which fails
/// open on every variant.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("Moderation request failed: {0}")]
    Request(String),

    #[error("Moderation endpoint returned status {0}")]
    Status(u16),

    #[error("Malformed moderation response: {0}")]
    Decode(String),

    #[error("Moderation response has no replacement text")]
    MissingField,

    #[error("Moderation timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
