//! Rule resolver — expands forwarding rules into concrete bindings.
//!
//! Resolution runs once at startup. A rule whose source is undefined or
//! disabled, or whose targets all fail to resolve, is dropped with a log line
//! and never produces an error.

use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, SourceEndpoint, TargetEndpoint, WILDCARD};
use crate::relay::types::InboundEvent;

/// Instance or channel selector of a source endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Any,
    Exact(String),
}

impl Selector {
    pub fn parse(value: &str) -> Self {
        if value == WILDCARD {
            Self::Any
        } else {
            Self::Exact(value.to_string())
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == value,
        }
    }
}

/// A source endpoint with its blocking words compiled.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    /// Endpoint name from the configuration.
    pub key: String,
    pub platform: String,
    pub instance: Selector,
    pub channel: Selector,
    /// Display name used in the relay banner.
    pub name: String,
    pub blocking_words: Vec<Regex>,
    pub only_quote: bool,
}

impl ResolvedSource {
    fn compile(key: &str, endpoint: &SourceEndpoint) -> Self {
        let blocking_words = endpoint
            .blocking_words
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(source = key, pattern = %pattern, error = %e, "Ignoring invalid blocking-word pattern");
                    None
                }
            })
            .collect();

        Self {
            key: key.to_string(),
            platform: endpoint.platform.clone(),
            instance: Selector::parse(&endpoint.instance),
            channel: Selector::parse(&endpoint.channel),
            name: endpoint.name.clone(),
            blocking_words,
            only_quote: endpoint.only_quote,
        }
    }

    /// Whether an inbound event was posted where this source listens.
    pub fn matches(&self, event: &InboundEvent) -> bool {
        self.platform == event.platform
            && self.instance.matches(&event.instance)
            && self.channel.matches(&event.channel)
    }
}

/// One resolved rule: a source listener and its ordered targets.
#[derive(Debug, Clone)]
pub struct Binding {
    pub rule: String,
    pub source: ResolvedSource,
    /// Enabled targets, in rule order.
    pub targets: Vec<TargetEndpoint>,
}

impl Binding {
    pub fn matches(&self, event: &InboundEvent) -> bool {
        self.source.matches(event)
    }
}

/// Turns configuration into bindings.
pub struct RuleResolver;

impl RuleResolver {
    /// Resolve every rule in declaration order.
    pub fn resolve(config: &RelayConfig) -> Vec<Binding> {
        let mut compiled: HashMap<&str, ResolvedSource> = HashMap::new();
        let mut bindings = Vec::new();

        for (index, rule) in config.rules.iter().enumerate() {
            let rule_name = rule
                .name
                .clone()
                .unwrap_or_else(|| format!("{}#{index}", rule.source));

            let Some(endpoint) = config.sources.get(&rule.source) else {
                warn!(rule = %rule_name, source = %rule.source, "Skipping rule: source is not defined");
                continue;
            };
            if endpoint.disabled {
                debug!(rule = %rule_name, source = %rule.source, "Skipping rule: source is disabled");
                continue;
            }

            let targets: Vec<TargetEndpoint> = rule
                .targets
                .iter()
                .filter_map(|name| match config.targets.get(name) {
                    Some(target) if target.disabled => {
                        debug!(rule = %rule_name, target = %name, "Target disabled");
                        None
                    }
                    Some(target) => Some(target.clone()),
                    None => {
                        warn!(rule = %rule_name, target = %name, "Target is not defined");
                        None
                    }
                })
                .collect();

            if targets.is_empty() {
                warn!(rule = %rule_name, "Skipping rule: no usable targets");
                continue;
            }

            let source = compiled
                .entry(rule.source.as_str())
                .or_insert_with(|| ResolvedSource::compile(&rule.source, endpoint))
                .clone();

            bindings.push(Binding {
                rule: rule_name,
                source,
                targets,
            });
        }

        info!(
            rules = config.rules.len(),
            bindings = bindings.len(),
            "Forwarding rules resolved"
        );
        bindings
    }
}
