//! Configuration types.
//!
//! The relay reads one TOML file at startup. Endpoint and rule references are
//! resolved later by [`crate::relay::rules::RuleResolver`], which skips
//! anything that does not resolve instead of failing the load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::moderation::{DEFAULT_MODERATION_TIMEOUT, DEFAULT_MODERATION_URL};

/// Wildcard accepted by source instance/channel selectors.
pub const WILDCARD: &str = "*";

/// Pacing delay applied when a platform has no entry in `[delays]`.
pub const DEFAULT_PACING_DELAY: Duration = Duration::from_millis(200);

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "./relay.toml";

/// Root of the relay configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    /// Per-platform pacing delay in milliseconds.
    #[serde(default)]
    pub delays: HashMap<String, u64>,
    #[serde(default)]
    pub sources: HashMap<String, SourceEndpoint>,
    #[serde(default)]
    pub targets: HashMap<String, TargetEndpoint>,
    /// Forwarding rules, in declaration order.
    #[serde(default)]
    pub rules: Vec<ForwardingRule>,
    /// Connector instances to start.
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

/// Where relay records are kept.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// libSQL database file. `None` keeps records in memory only.
    #[serde(default = "default_db_path")]
    pub database: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_db_path(),
        }
    }
}

fn default_db_path() -> Option<PathBuf> {
    Some(PathBuf::from("./data/relay.db"))
}

/// External moderation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ModerationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_moderation_url")]
    pub url: String,
    #[serde(default = "default_moderation_timeout_ms")]
    pub timeout_ms: u64,
}

impl ModerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_moderation_url(),
            timeout_ms: default_moderation_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_moderation_url() -> String {
    DEFAULT_MODERATION_URL.to_string()
}

fn default_moderation_timeout_ms() -> u64 {
    DEFAULT_MODERATION_TIMEOUT.as_millis() as u64
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

/// A named place messages are read from.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEndpoint {
    pub platform: String,
    /// Bot instance selector, `*` for any.
    #[serde(default = "wildcard")]
    pub instance: String,
    /// Channel selector, `*` for any.
    #[serde(default = "wildcard")]
    pub channel: String,
    /// Display name used in the relay banner.
    pub name: String,
    /// Regular expressions; a match on any text element drops the message.
    #[serde(default)]
    pub blocking_words: Vec<String>,
    /// Forward only replies to previously relayed messages.
    #[serde(default)]
    pub only_quote: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// A named place messages are delivered to. Never wildcarded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetEndpoint {
    pub platform: String,
    pub instance: String,
    pub channel: String,
    #[serde(default)]
    pub disabled: bool,
    /// Render as the original author instead of with a text banner.
    #[serde(default)]
    pub simulate_original: bool,
}

/// One source fanned out to an ordered list of targets.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardingRule {
    #[serde(default)]
    pub name: Option<String>,
    pub source: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

/// A connector instance.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// `console` or `telegram`.
    pub platform: String,
    /// Instance id referenced by endpoints.
    pub id: String,
    #[serde(default)]
    pub token: Option<SecretString>,
    /// Environment variable holding the token, used when `token` is absent.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Channel the console connector posts into.
    #[serde(default)]
    pub channel: Option<String>,
}

impl BotConfig {
    /// Token from the file or from `token_env`.
    pub fn resolve_token(&self) -> Option<SecretString> {
        self.token.clone().or_else(|| {
            self.token_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|t| !t.is_empty())
                .map(SecretString::from)
        })
    }
}

impl RelayConfig {
    /// Parse a configuration document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Load from `RELAY_CONFIG` (default `./relay.toml`) and apply environment
    /// overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path =
            std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(db) = std::env::var("RELAY_DB_PATH") {
            self.storage.database = if db.is_empty() || db == ":memory:" {
                None
            } else {
                Some(PathBuf::from(db))
            };
        }
        if let Ok(url) = std::env::var("RELAY_MODERATION_URL") {
            self.moderation.url = url;
        }
    }

    /// Value checks that cannot be expressed through serde.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.moderation.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "moderation.timeout_ms".into(),
                message: "must be greater than zero".into(),
            });
        }
        for bot in &self.bots {
            if bot.id.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("bots[{}].id", bot.platform),
                    hint: "Every bot needs an instance id referenced by endpoints.".into(),
                });
            }
        }
        Ok(())
    }
}
