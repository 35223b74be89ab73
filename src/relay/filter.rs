//! Pre-processing stage: blocking words and quote classification.
//!
//! Quote classification turns the message an inbound reply points at into a
//! set of [`ReplyAnchors`], telling the dispatcher which message to quote on
//! each target so the reply chain survives the hop between platforms.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::content::ContentElement;
use crate::relay::rules::ResolvedSource;
use crate::relay::types::InboundEvent;
use crate::store::{MessageKey, RelayRecord, RelayStore};

/// Return the first blocking-word pattern that matches any text element.
pub fn blocking_match<'a>(
    source: &'a ResolvedSource,
    elements: &[ContentElement],
) -> Option<&'a str> {
    source
        .blocking_words
        .iter()
        .find(|regex| {
            elements
                .iter()
                .filter_map(ContentElement::as_text)
                .any(|text| regex.is_match(text))
        })
        .map(|regex| regex.as_str())
}

/// Message id to quote, per (instance, channel).
///
/// The first anchor recorded for a location wins; later records for the same
/// location are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyAnchors {
    anchors: HashMap<(String, String), String>,
}

impl ReplyAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an anchor unless the location already has one.
    pub fn insert_first(&mut self, key: &MessageKey) {
        self.anchors
            .entry((key.instance.clone(), key.channel.clone()))
            .or_insert_with(|| key.message_id.clone());
    }

    pub fn get(&self, instance: &str, channel: &str) -> Option<&str> {
        self.anchors
            .get(&(instance.to_string(), channel.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// What to do with a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteDecision {
    /// Relay, quoting the anchors where they exist.
    Relay(ReplyAnchors),
    /// Quote-only source and the reply is not correlated to a relay.
    Drop,
}

/// Classify a reply to `quoted_id` in the event's channel.
///
/// Store failures are logged and treated as "no record", which leads to the
/// textual fallback instead of a structural quote.
pub async fn classify_quote(
    store: &dyn RelayStore,
    event: &InboundEvent,
    quoted_id: &str,
    author_is_bot: bool,
    only_quote: bool,
) -> QuoteDecision {
    let quoted = MessageKey::new(quoted_id, &event.instance, &event.channel);
    let inbound = (event.instance.as_str(), event.channel.as_str());
    let mut anchors = ReplyAnchors::new();

    if author_is_bot {
        let relayed = lookup(store.find_by_source(&quoted).await, &quoted);
        fold_source_rows(&mut anchors, &relayed);
        if relayed.is_empty() {
            let delivered = lookup(store.find_by_target(&quoted).await, &quoted);
            fold_target_rows(store, &mut anchors, &delivered, inbound).await;
        }
        if anchors.is_empty() && only_quote {
            debug!(quoted = quoted_id, "Reply to bot message without a relay record");
            return QuoteDecision::Drop;
        }
    } else if only_quote {
        return QuoteDecision::Drop;
    } else {
        let delivered = lookup(store.find_by_target(&quoted).await, &quoted);
        fold_target_rows(store, &mut anchors, &delivered, inbound).await;
    }

    QuoteDecision::Relay(anchors)
}

fn lookup(
    result: Result<Vec<RelayRecord>, crate::error::DatabaseError>,
    key: &MessageKey,
) -> Vec<RelayRecord> {
    result.unwrap_or_else(|e| {
        warn!(message_id = %key.message_id, error = %e, "Relay record lookup failed");
        Vec::new()
    })
}

/// Rows where the quoted message was the relay source: quote each output.
fn fold_source_rows(anchors: &mut ReplyAnchors, rows: &[RelayRecord]) {
    for row in rows {
        anchors.insert_first(&row.target);
    }
}

/// Rows where the quoted message was a relay output: quote the origin, and
/// the origin's other deliveries outside the inbound channel.
async fn fold_target_rows(
    store: &dyn RelayStore,
    anchors: &mut ReplyAnchors,
    rows: &[RelayRecord],
    inbound: (&str, &str),
) {
    for row in rows {
        anchors.insert_first(&row.source);
        let siblings = lookup(store.find_by_source(&row.source).await, &row.source);
        for sibling in siblings
            .iter()
            .filter(|s| s.target.location() != inbound)
        {
            anchors.insert_first(&sibling.target);
        }
    }
}
