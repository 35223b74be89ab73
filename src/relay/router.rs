//! Router — fans inbound events out to the bindings that listen for them.
//!
//! Each matching binding gets its own dispatch task, so pipelines for
//! different messages interleave freely.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connectors::EventStream;
use crate::relay::dispatcher::Dispatcher;
use crate::relay::rules::Binding;
use crate::relay::types::{InboundEvent, RelayOutcome};

pub struct Router {
    bindings: Vec<Arc<Binding>>,
    dispatcher: Arc<Dispatcher>,
}

impl Router {
    pub fn new(bindings: Vec<Binding>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            bindings: bindings.into_iter().map(Arc::new).collect(),
            dispatcher,
        }
    }

    pub fn bindings(&self) -> &[Arc<Binding>] {
        &self.bindings
    }

    /// Spawn one dispatch per binding matching `event`.
    ///
    /// Messages posted by the bot itself are ignored so relayed copies are
    /// never relayed again.
    pub fn route(&self, event: InboundEvent) -> Vec<JoinHandle<RelayOutcome>> {
        if event.is_own_message() {
            debug!(platform = %event.platform, message_id = %event.message_id, "Ignoring own message");
            return Vec::new();
        }

        let event = Arc::new(event);
        self.bindings
            .iter()
            .filter(|binding| binding.matches(&event))
            .map(|binding| {
                let binding = Arc::clone(binding);
                let event = Arc::clone(&event);
                let dispatcher = Arc::clone(&self.dispatcher);
                tokio::spawn(async move {
                    let outcome = dispatcher.dispatch(&binding, &event).await;
                    match &outcome {
                        RelayOutcome::Dropped(reason) => {
                            debug!(rule = %binding.rule, reason = reason.label(), "Message dropped")
                        }
                        RelayOutcome::Relayed { targets, .. } => debug!(
                            rule = %binding.rule,
                            delivered = outcome.delivered_count(),
                            targets = targets.len(),
                            "Relay finished"
                        ),
                    }
                    outcome
                })
            })
            .collect()
    }

    /// Consume a merged event stream until it ends.
    pub async fn run(self: Arc<Self>, streams: Vec<EventStream>) {
        info!(streams = streams.len(), bindings = self.bindings.len(), "Relay router started");
        let mut events = futures::stream::select_all(streams);
        while let Some(event) = events.next().await {
            self.route(event);
        }
        info!("All connector streams closed");
    }
}
