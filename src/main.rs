use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chat_relay::config::RelayConfig;
use chat_relay::connectors::{ConnectorRegistry, connector_for};
use chat_relay::moderation::{ModerationGateway, Moderator, Passthrough};
use chat_relay::relay::{Dispatcher, Router, RuleResolver};
use chat_relay::store::open_store;

/// Initialise tracing. The returned guard must live until exit so the file
/// writer flushes.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RELAY_LOG_JSON").is_ok_and(|v| v == "1");

    let (file_layer, guard) = match std::env::var("RELAY_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "chat-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = RelayConfig::from_env().context("loading relay configuration")?;

    eprintln!("📨 Chat Relay v{}", env!("CARGO_PKG_VERSION"));

    // ── Store ────────────────────────────────────────────────────────────
    let store = open_store(&config.storage)
        .await
        .context("opening relay store")?;
    match &config.storage.database {
        Some(path) => eprintln!("   Database: {}", path.display()),
        None => eprintln!("   Database: in-memory"),
    }

    // ── Moderation ───────────────────────────────────────────────────────
    let moderator: Arc<dyn Moderator> = if config.moderation.enabled {
        eprintln!("   Moderation: {}", config.moderation.url);
        Arc::new(ModerationGateway::new(
            config.moderation.url.clone(),
            config.moderation.timeout(),
        ))
    } else {
        eprintln!("   Moderation: disabled");
        Arc::new(Passthrough)
    };

    // ── Connectors ───────────────────────────────────────────────────────
    let mut registry = ConnectorRegistry::new();
    for bot in &config.bots {
        if let Some(connector) = connector_for(bot) {
            registry.register(connector);
        }
    }

    let mut streams = Vec::new();
    for connector in registry.connectors() {
        match connector.start().await {
            Ok(stream) => streams.push(stream),
            Err(e) => tracing::error!(
                platform = connector.platform(),
                instance = connector.instance_id(),
                error = %e,
                "Connector failed to start"
            ),
        }
    }
    eprintln!("   Connectors: {} started of {}", streams.len(), registry.len());

    // ── Rules ────────────────────────────────────────────────────────────
    let bindings = RuleResolver::resolve(&config);
    eprintln!("   Rules: {} active\n", bindings.len());

    let registry = Arc::new(registry);
    let dispatcher = Dispatcher::new(registry.clone(), store, moderator).with_delays(&config.delays);
    let router = Arc::new(Router::new(bindings, Arc::new(dispatcher)));

    let router_task = tokio::spawn(router.run(streams));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");

    router_task.abort();
    for connector in registry.connectors() {
        if let Err(e) = connector.shutdown().await {
            tracing::warn!(instance = connector.instance_id(), error = %e, "Connector shutdown failed");
        }
    }

    Ok(())
}
