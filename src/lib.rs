//! Chat Relay: cross-platform message forwarding with reply-chain correlation.

pub mod config;
pub mod connectors;
pub mod content;
pub mod error;
pub mod moderation;
pub mod relay;
pub mod store;
