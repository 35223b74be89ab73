//! Fan-out dispatcher — runs one inbound message through the relay pipeline.
//!
//! Flow:
//! 1. Blocking-word filter
//! 2. Quote classification → reply anchors (or a quote-only drop)
//! 3. Transform + empty-content check
//! 4. Moderation (fails open)
//! 5. Per target, in rule order: resolve instance, pace, assemble, send
//! 6. One batch upsert of every delivered message id
//!
//! No step is fatal. Failures are contained to the target they happen on and
//! reported through [`RelayOutcome`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_PACING_DELAY, TargetEndpoint};
use crate::connectors::{InstanceRegistry, InstanceStatus};
use crate::content::{ContentElement, ElementKind, TransformEngine, VisitorTable, plain_text};
use crate::moderation::Moderator;
use crate::relay::filter::{QuoteDecision, ReplyAnchors, blocking_match, classify_quote};
use crate::relay::rules::Binding;
use crate::relay::types::{
    Author, DropReason, InboundEvent, QuoteInfo, RelayOutcome, SkipReason, TargetOutcome,
    TargetReport,
};
use crate::store::{MessageKey, NewRelayRecord, RelayStore};

/// Avatar used for author simulation when the source platform gives none.
pub const DEFAULT_AVATAR: &str = "https://cdn.discordapp.com/embed/avatars/0.png";

/// Runs the relay pipeline for resolved bindings.
pub struct Dispatcher {
    registry: Arc<dyn InstanceRegistry>,
    store: Arc<dyn RelayStore>,
    moderator: Arc<dyn Moderator>,
    engine: TransformEngine,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        store: Arc<dyn RelayStore>,
        moderator: Arc<dyn Moderator>,
    ) -> Self {
        Self {
            registry,
            store,
            moderator,
            engine: TransformEngine::new(),
            delays: HashMap::new(),
            default_delay: DEFAULT_PACING_DELAY,
        }
    }

    /// Per-platform pacing delays in milliseconds, as found in `[delays]`.
    pub fn with_delays(mut self, delays: &HashMap<String, u64>) -> Self {
        self.delays = delays
            .iter()
            .map(|(platform, ms)| (platform.clone(), Duration::from_millis(*ms)))
            .collect();
        self
    }

    /// Delay for platforms without an explicit entry.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    fn pacing_delay(&self, platform: &str) -> Duration {
        self.delays
            .get(platform)
            .copied()
            .unwrap_or(self.default_delay)
    }

    /// Relay `event` to the targets of `binding`.
    pub async fn dispatch(&self, binding: &Binding, event: &InboundEvent) -> RelayOutcome {
        let source = &binding.source;
        debug!(
            rule = %binding.rule,
            source = %source.key,
            message_id = %event.message_id,
            channel = %event.channel,
            "Dispatching inbound message"
        );

        // Step 1: blocking words
        if let Some(pattern) = blocking_match(source, &event.elements) {
            debug!(rule = %binding.rule, pattern, "Message blocked");
            return RelayOutcome::Dropped(DropReason::Blocked {
                pattern: pattern.to_string(),
            });
        }

        // Step 2: quote classification
        let (anchors, quote) = match &event.quote {
            Some(quote) => {
                let author = self.resolve_quote_author(event, quote).await;
                let author_is_bot = author.as_ref().is_some_and(|a| a.id == event.self_id);
                let decision = classify_quote(
                    self.store.as_ref(),
                    event,
                    &quote.message_id,
                    author_is_bot,
                    source.only_quote,
                )
                .await;
                match decision {
                    QuoteDecision::Relay(anchors) => {
                        let mut quote = quote.clone();
                        quote.author = author;
                        (anchors, Some(quote))
                    }
                    QuoteDecision::Drop => {
                        debug!(rule = %binding.rule, "Quote-only source: reply not correlated");
                        return RelayOutcome::Dropped(DropReason::QuoteOnly);
                    }
                }
            }
            None if source.only_quote => {
                debug!(rule = %binding.rule, "Quote-only source: not a reply");
                return RelayOutcome::Dropped(DropReason::QuoteOnly);
            }
            None => (ReplyAnchors::new(), None),
        };

        // Step 3: transform
        let body = self
            .engine
            .transform(&event.elements, &body_overrides(&event.self_id, source.only_quote));
        let text = plain_text(&body);
        if text.trim().is_empty() {
            debug!(rule = %binding.rule, "Nothing to relay after transform");
            return RelayOutcome::Dropped(DropReason::EmptyContent);
        }

        // Step 4: moderation
        let moderated = self
            .moderator
            .moderate(&event.sender.id, &event.channel, &text)
            .await;

        let fallback = quote.as_ref().map(|q| self.render_fallback(q));

        // Step 5: sequential fan-out
        let mut reports = Vec::with_capacity(binding.targets.len());
        let mut staged = Vec::new();
        let mut attempted = 0usize;

        for target in &binding.targets {
            let Some(connector) = self.registry.resolve(&target.platform, &target.instance) else {
                warn!(
                    platform = %target.platform,
                    instance = %target.instance,
                    "Target instance not found, skipping"
                );
                reports.push(report(target, TargetOutcome::Skipped(SkipReason::InstanceMissing)));
                continue;
            };

            let status = connector.status();
            if status != InstanceStatus::Online {
                warn!(
                    platform = %target.platform,
                    instance = %target.instance,
                    ?status,
                    "Target instance not online, skipping"
                );
                reports.push(report(
                    target,
                    TargetOutcome::Skipped(SkipReason::InstanceNotOnline(status)),
                ));
                continue;
            }

            if attempted > 0 {
                tokio::time::sleep(self.pacing_delay(&target.platform)).await;
            }
            attempted += 1;

            let author = (target.simulate_original && connector.supports_author_simulation())
                .then(|| ContentElement::Author {
                    name: event.sender.display_name().to_string(),
                    avatar: Some(
                        event
                            .sender
                            .avatar
                            .clone()
                            .unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
                    ),
                });
            let anchor = anchors.get(&target.instance, &target.channel);
            let payload = assemble_payload(
                author,
                &banner(&source.name, event.sender.display_name()),
                anchor,
                fallback.as_deref(),
                &moderated,
            );

            match connector.send(&target.channel, &payload).await {
                Ok(message_ids) => {
                    info!(
                        rule = %binding.rule,
                        platform = %target.platform,
                        channel = %target.channel,
                        count = message_ids.len(),
                        "Message relayed"
                    );
                    staged.extend(message_ids.iter().map(|id| NewRelayRecord {
                        source: event.key(),
                        target: MessageKey::new(id, &target.instance, &target.channel),
                    }));
                    reports.push(report(target, TargetOutcome::Delivered { message_ids }));
                }
                Err(e) => {
                    error!(
                        rule = %binding.rule,
                        platform = %target.platform,
                        channel = %target.channel,
                        error = %e,
                        "Relay delivery failed"
                    );
                    reports.push(report(target, TargetOutcome::Failed(e.to_string())));
                }
            }
        }

        // Step 6: persist
        let records_written = if staged.is_empty() {
            0
        } else {
            match self.store.upsert(&staged).await {
                Ok(n) => n,
                Err(e) => {
                    error!(rule = %binding.rule, error = %e, "Failed to persist relay records");
                    0
                }
            }
        };

        RelayOutcome::Relayed {
            targets: reports,
            records_written,
        }
    }

    /// Quote author from the event, or fetched through the source connector.
    async fn resolve_quote_author(&self, event: &InboundEvent, quote: &QuoteInfo) -> Option<Author> {
        if let Some(author) = &quote.author {
            return Some(author.clone());
        }
        let connector = self.registry.resolve(&event.platform, &event.instance)?;
        match connector
            .fetch_quote_author(&event.channel, &quote.message_id)
            .await
        {
            Ok(author) => author,
            Err(e) => {
                warn!(message_id = %quote.message_id, error = %e, "Failed to fetch quoted author");
                None
            }
        }
    }

    /// `Re <name> ⌈<quoted content>⌋` line used when no anchor exists.
    fn render_fallback(&self, quote: &QuoteInfo) -> String {
        let quoted = plain_text(&self.engine.reduce(&quote.elements));
        format!("Re {} ⌈{}⌋\n", quote.display_name(), quoted)
    }
}

fn report(target: &TargetEndpoint, outcome: TargetOutcome) -> TargetReport {
    TargetReport {
        target: target.clone(),
        outcome,
    }
}

/// Overrides for the message body: inbound quote references are dropped
/// (the chain is rebuilt per target) and, on quote-only sources, mentions of
/// the relaying bot are blanked.
fn body_overrides(self_id: &str, only_quote: bool) -> VisitorTable {
    let table = VisitorTable::new().with(ElementKind::Quote, |_| Vec::new());
    if !only_quote {
        return table;
    }
    let self_id = self_id.to_string();
    table.with(ElementKind::Mention, move |element| match element {
        ContentElement::Mention { id, .. } if *id == self_id => Vec::new(),
        ContentElement::Mention { id, name } => vec![ContentElement::text(format!(
            "@{}",
            name.as_deref().unwrap_or(id)
        ))],
        other => vec![other.clone()],
    })
}

/// Text banner naming the source and the sender.
pub fn banner(source_name: &str, username: &str) -> String {
    format!("[{source_name} - {username}]\n")
}

/// Build the outbound element sequence for one target.
///
/// With an author marker: `[author, quote?, fallback?, text]`.
/// Without: `[quote?, banner, fallback?, text]`. The fallback only appears
/// when there is no anchor.
fn assemble_payload(
    author: Option<ContentElement>,
    banner: &str,
    anchor: Option<&str>,
    fallback: Option<&str>,
    text: &str,
) -> Vec<ContentElement> {
    let mut payload = Vec::with_capacity(4);
    let simulated = author.is_some();
    if let Some(author) = author {
        payload.push(author);
    }
    if let Some(anchor) = anchor {
        payload.push(ContentElement::quote(anchor));
    }
    if !simulated {
        payload.push(ContentElement::text(banner));
    }
    if let (None, Some(fallback)) = (anchor, fallback) {
        payload.push(ContentElement::text(fallback));
    }
    payload.push(ContentElement::text(text));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::config::RelayConfig;
    use crate::connectors::{Connector, EventStream};
    use crate::error::ConnectorError;
    use crate::relay::rules::RuleResolver;
    use crate::relay::types::Sender;
    use crate::store::MemoryStore;

    // ── Mocks ───────────────────────────────────────────────────────────

    struct MockConnector {
        platform: String,
        instance: String,
        online: bool,
        fail: bool,
        simulate: bool,
        next_id: AtomicU64,
        sent: Mutex<Vec<(String, Vec<ContentElement>, Instant)>>,
        authors: HashMap<String, Author>,
        fetched: AtomicBool,
    }

    impl MockConnector {
        fn new(platform: &str, instance: &str) -> Self {
            Self {
                platform: platform.into(),
                instance: instance.into(),
                online: true,
                fail: false,
                simulate: false,
                next_id: AtomicU64::new(100),
                sent: Mutex::new(Vec::new()),
                authors: HashMap::new(),
                fetched: AtomicBool::new(false),
            }
        }

        fn sent(&self) -> Vec<(String, Vec<ContentElement>, Instant)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn platform(&self) -> &str {
            &self.platform
        }
        fn instance_id(&self) -> &str {
            &self.instance
        }
        fn status(&self) -> InstanceStatus {
            if self.online {
                InstanceStatus::Online
            } else {
                InstanceStatus::Offline
            }
        }
        fn supports_author_simulation(&self) -> bool {
            self.simulate
        }
        async fn start(&self) -> Result<EventStream, ConnectorError> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn send(
            &self,
            channel_id: &str,
            elements: &[ContentElement],
        ) -> Result<Vec<String>, ConnectorError> {
            if self.fail {
                return Err(ConnectorError::SendFailed {
                    name: self.platform.clone(),
                    reason: "boom".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), elements.to_vec(), Instant::now()));
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            Ok(vec![format!("{}-{id}", self.instance)])
        }
        async fn fetch_quote_author(
            &self,
            _channel_id: &str,
            message_id: &str,
        ) -> Result<Option<Author>, ConnectorError> {
            self.fetched.store(true, Ordering::Relaxed);
            Ok(self.authors.get(message_id).cloned())
        }
    }

    #[derive(Default)]
    struct MockRegistry {
        connectors: HashMap<(String, String), Arc<MockConnector>>,
    }

    impl MockRegistry {
        fn add(&mut self, connector: MockConnector) -> Arc<MockConnector> {
            let connector = Arc::new(connector);
            self.connectors.insert(
                (connector.platform.clone(), connector.instance.clone()),
                Arc::clone(&connector),
            );
            connector
        }
    }

    impl InstanceRegistry for MockRegistry {
        fn resolve(&self, platform: &str, instance: &str) -> Option<Arc<dyn Connector>> {
            self.connectors
                .get(&(platform.to_string(), instance.to_string()))
                .map(|c| Arc::clone(c) as Arc<dyn Connector>)
        }
    }

    struct Upper;

    #[async_trait]
    impl Moderator for Upper {
        async fn moderate(&self, _actor: &str, _conversation: &str, text: &str) -> String {
            text.to_uppercase()
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────────

    const CONFIG: &str = r#"
        [sources.src]
        platform = "alpha"
        instance = "s1"
        channel = "c1"
        name = "Alpha"
        blocking_words = ["forbidden"]

        [sources.quiet]
        platform = "alpha"
        name = "Quiet"
        only_quote = true

        [targets.a]
        platform = "beta"
        instance = "a"
        channel = "ca"

        [targets.b]
        platform = "beta"
        instance = "b"
        channel = "cb"

        [targets.c]
        platform = "beta"
        instance = "c"
        channel = "cc"

        [targets.back]
        platform = "alpha"
        instance = "s1"
        channel = "c1"
        simulate_original = true

        [[rules]]
        name = "fan"
        source = "src"
        targets = ["a", "b", "c"]

        [[rules]]
        name = "quiet"
        source = "quiet"
        targets = ["a"]

        [[rules]]
        name = "back"
        source = "src"
        targets = ["back"]
    "#;

    fn binding(name: &str) -> Binding {
        let config = RelayConfig::parse(CONFIG).unwrap();
        RuleResolver::resolve(&config)
            .into_iter()
            .find(|b| b.rule == name)
            .unwrap()
    }

    fn event(instance: &str, channel: &str, elements: Vec<ContentElement>) -> InboundEvent {
        InboundEvent {
            platform: "alpha".into(),
            instance: instance.into(),
            self_id: "bot".into(),
            channel: channel.into(),
            message_id: "m1".into(),
            sender: Sender {
                id: "u1".into(),
                name: Some("Alice".into()),
                avatar: None,
            },
            elements,
            quote: None,
            received_at: Utc::now(),
        }
    }

    fn dispatcher(registry: MockRegistry, store: Arc<MemoryStore>) -> Dispatcher {
        Dispatcher::new(Arc::new(registry), store, Arc::new(crate::moderation::Passthrough))
            .with_default_delay(Duration::from_millis(50))
    }

    fn text_of(elements: &[ContentElement]) -> String {
        plain_text(elements)
    }

    // ── Tests ───────────────────────────────────────────────────────────

    #[test]
    fn pacing_delay_uses_configured_platform_delay() {
        let config = RelayConfig::parse("[delays]\ntelegram = 350").unwrap();
        let d = Dispatcher::new(
            Arc::new(MockRegistry::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(crate::moderation::Passthrough),
        )
        .with_delays(&config.delays);
        assert_eq!(d.pacing_delay("telegram"), Duration::from_millis(350));
        assert_eq!(d.pacing_delay("discord"), DEFAULT_PACING_DELAY);
    }

    #[test]
    fn payload_with_banner_puts_quote_first() {
        let payload = assemble_payload(None, "[A - B]\n", Some("9"), Some("Re x ⌈y⌋\n"), "hi");
        assert_eq!(
            payload,
            vec![
                ContentElement::quote("9"),
                ContentElement::text("[A - B]\n"),
                ContentElement::text("hi"),
            ]
        );
    }

    #[test]
    fn payload_with_author_puts_quote_after_marker() {
        let author = ContentElement::Author {
            name: "Alice".into(),
            avatar: None,
        };
        let payload = assemble_payload(Some(author.clone()), "[A - B]\n", Some("9"), None, "hi");
        assert_eq!(
            payload,
            vec![author, ContentElement::quote("9"), ContentElement::text("hi")]
        );
    }

    #[test]
    fn payload_uses_fallback_without_anchor() {
        let payload = assemble_payload(None, "[A - B]\n", None, Some("Re x ⌈y⌋\n"), "hi");
        assert_eq!(text_of(&payload), "[A - B]\nRe x ⌈y⌋\nhi");
    }

    #[tokio::test]
    async fn blocked_message_is_not_sent() {
        let mut registry = MockRegistry::default();
        let a = registry.add(MockConnector::new("beta", "a"));
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(registry, Arc::clone(&store));

        let outcome = d
            .dispatch(
                &binding("fan"),
                &event("s1", "c1", vec![ContentElement::text("this is forbidden")]),
            )
            .await;
        assert!(matches!(outcome, RelayOutcome::Dropped(DropReason::Blocked { .. })));
        assert!(a.sent().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn image_only_message_is_dropped() {
        let mut registry = MockRegistry::default();
        let a = registry.add(MockConnector::new("beta", "a"));
        let d = dispatcher(registry, Arc::new(MemoryStore::new()));

        let outcome = d
            .dispatch(
                &binding("fan"),
                &event(
                    "s1",
                    "c1",
                    vec![ContentElement::Image {
                        url: "http://img".into(),
                    }],
                ),
            )
            .await;
        assert!(matches!(outcome, RelayOutcome::Dropped(DropReason::EmptyContent)));
        assert!(a.sent().is_empty());
    }

    #[tokio::test]
    async fn offline_target_is_skipped_and_pacing_applies() {
        let mut registry = MockRegistry::default();
        let a = registry.add(MockConnector::new("beta", "a"));
        let b = registry.add(MockConnector {
            online: false,
            ..MockConnector::new("beta", "b")
        });
        let c = registry.add(MockConnector::new("beta", "c"));
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(registry, Arc::clone(&store));

        let outcome = d
            .dispatch(&binding("fan"), &event("s1", "c1", vec![ContentElement::text("hello")]))
            .await;

        assert_eq!(outcome.delivered_count(), 2);
        let RelayOutcome::Relayed { targets, records_written } = &outcome else {
            panic!("expected relay");
        };
        assert_eq!(*records_written, 2);
        assert_eq!(
            targets[1].outcome,
            TargetOutcome::Skipped(SkipReason::InstanceNotOnline(InstanceStatus::Offline))
        );
        assert!(b.sent().is_empty());

        let sent_a = a.sent();
        let sent_c = c.sent();
        assert_eq!(sent_a.len(), 1);
        assert_eq!(sent_c.len(), 1);
        // The second delivery waits for the pacing delay.
        assert!(sent_c[0].2.duration_since(sent_a[0].2) >= Duration::from_millis(50));
        assert_eq!(text_of(&sent_a[0].1), "[Alpha - Alice]\nhello");
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn missing_and_failing_targets_do_not_stop_fan_out() {
        let mut registry = MockRegistry::default();
        registry.add(MockConnector {
            fail: true,
            ..MockConnector::new("beta", "a")
        });
        let c = registry.add(MockConnector::new("beta", "c"));
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(registry, Arc::clone(&store));

        let outcome = d
            .dispatch(&binding("fan"), &event("s1", "c1", vec![ContentElement::text("hi")]))
            .await;
        let RelayOutcome::Relayed { targets, records_written } = outcome else {
            panic!("expected relay");
        };
        assert!(matches!(targets[0].outcome, TargetOutcome::Failed(_)));
        assert_eq!(targets[1].outcome, TargetOutcome::Skipped(SkipReason::InstanceMissing));
        assert!(targets[2].outcome.is_delivered());
        assert_eq!(records_written, 1);
        assert_eq!(c.sent().len(), 1);
    }

    #[tokio::test]
    async fn no_deliveries_write_no_records() {
        let registry = MockRegistry::default();
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(registry, Arc::clone(&store));

        let outcome = d
            .dispatch(&binding("fan"), &event("s1", "c1", vec![ContentElement::text("hi")]))
            .await;
        assert_eq!(outcome.delivered_count(), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn moderated_text_is_sent() {
        let mut registry = MockRegistry::default();
        let a = registry.add(MockConnector::new("beta", "a"));
        let d = Dispatcher::new(
            Arc::new(registry),
            Arc::new(MemoryStore::new()),
            Arc::new(Upper),
        );

        d.dispatch(&binding("fan"), &event("s1", "c1", vec![ContentElement::text("quiet")]))
            .await;
        assert_eq!(text_of(&a.sent()[0].1), "[Alpha - Alice]\nQUIET");
    }

    #[tokio::test]
    async fn reply_round_trip_quotes_origin() {
        let mut registry = MockRegistry::default();
        let s1 = registry.add(MockConnector {
            simulate: true,
            ..MockConnector::new("alpha", "s1")
        });
        let store = Arc::new(MemoryStore::new());
        store
            .upsert(&[NewRelayRecord {
                source: MessageKey::new("m0", "s1", "c1"),
                target: MessageKey::new("t1", "s2", "c2"),
            }])
            .await
            .unwrap();
        let d = dispatcher(registry, Arc::clone(&store));

        // A reply on s2/c2 quoting t1, relayed back to s1/c1.
        let mut reply = event("s2", "c2", vec![ContentElement::text("agreed")]);
        reply.message_id = "r1".into();
        reply.quote = Some(QuoteInfo {
            message_id: "t1".into(),
            author: Some(Author {
                id: "bot".into(),
                name: None,
            }),
            elements: vec![ContentElement::text("origin")],
            nickname: None,
        });
        d.dispatch(&binding("back"), &reply).await;

        let sent = s1.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1,
            vec![
                ContentElement::Author {
                    name: "Alice".into(),
                    avatar: Some(DEFAULT_AVATAR.into()),
                },
                ContentElement::quote("m0"),
                ContentElement::text("agreed"),
            ]
        );
        assert_eq!(
            store
                .find_by_target(&MessageKey::new("s1-100", "s1", "c1"))
                .await
                .unwrap()[0]
                .source
                .message_id,
            "r1"
        );
    }

    #[tokio::test]
    async fn uncorrelated_reply_gets_text_fallback() {
        let mut registry = MockRegistry::default();
        let mut source = MockConnector::new("alpha", "s1");
        source.authors.insert(
            "x9".into(),
            Author {
                id: "u7".into(),
                name: Some("Bob".into()),
            },
        );
        let source = registry.add(source);
        let a = registry.add(MockConnector::new("beta", "a"));
        let d = dispatcher(registry, Arc::new(MemoryStore::new()));

        let mut reply = event("s1", "c1", vec![ContentElement::text("+1")]);
        reply.quote = Some(QuoteInfo {
            message_id: "x9".into(),
            author: None,
            elements: vec![
                ContentElement::text("see "),
                ContentElement::Image {
                    url: "http://img".into(),
                },
                ContentElement::Audio { url: None },
            ],
            nickname: None,
        });

        d.dispatch(&binding("fan"), &reply).await;
        assert!(source.fetched.load(Ordering::Relaxed));
        assert_eq!(
            text_of(&a.sent()[0].1),
            "[Alpha - Alice]\nRe Bob ⌈see [Voice]⌋\n+1"
        );
    }

    #[tokio::test]
    async fn anchored_and_unanchored_targets_mix_in_one_fan_out() {
        let mut registry = MockRegistry::default();
        let a = registry.add(MockConnector::new("beta", "a"));
        let b = registry.add(MockConnector::new("beta", "b"));
        let store = Arc::new(MemoryStore::new());
        // x1 in s1/c1 is a simulated copy of m0 from a/ca, not bot-authored.
        store
            .upsert(&[NewRelayRecord {
                source: MessageKey::new("m0", "a", "ca"),
                target: MessageKey::new("x1", "s1", "c1"),
            }])
            .await
            .unwrap();
        let d = dispatcher(registry, store);

        let mut reply = event("s1", "c1", vec![ContentElement::text("same here")]);
        reply.quote = Some(QuoteInfo {
            message_id: "x1".into(),
            author: Some(Author {
                id: "webhook-7".into(),
                name: Some("Dana".into()),
            }),
            elements: vec![ContentElement::text("earlier")],
            nickname: None,
        });

        let outcome = d.dispatch(&binding("fan"), &reply).await;
        assert_eq!(outcome.delivered_count(), 2);
        assert_eq!(
            a.sent()[0].1,
            vec![
                ContentElement::quote("m0"),
                ContentElement::text("[Alpha - Alice]\n"),
                ContentElement::text("same here"),
            ]
        );
        assert_eq!(
            b.sent()[0].1,
            vec![
                ContentElement::text("[Alpha - Alice]\n"),
                ContentElement::text("Re Dana ⌈earlier⌋\n"),
                ContentElement::text("same here"),
            ]
        );
    }

    #[tokio::test]
    async fn only_quote_source_drops_plain_and_foreign_replies() {
        let mut registry = MockRegistry::default();
        let a = registry.add(MockConnector::new("beta", "a"));
        let d = dispatcher(registry, Arc::new(MemoryStore::new()));
        let quiet = binding("quiet");

        let plain = event("s5", "c5", vec![ContentElement::text("hello")]);
        assert!(matches!(
            d.dispatch(&quiet, &plain).await,
            RelayOutcome::Dropped(DropReason::QuoteOnly)
        ));

        let mut foreign = plain.clone();
        foreign.quote = Some(QuoteInfo {
            message_id: "q".into(),
            author: Some(Author {
                id: "someone".into(),
                name: None,
            }),
            elements: vec![],
            nickname: None,
        });
        assert!(matches!(
            d.dispatch(&quiet, &foreign).await,
            RelayOutcome::Dropped(DropReason::QuoteOnly)
        ));
        assert!(a.sent().is_empty());
    }

    #[tokio::test]
    async fn only_quote_reply_to_relay_blanks_bot_mention() {
        let mut registry = MockRegistry::default();
        let a = registry.add(MockConnector::new("beta", "a"));
        let store = Arc::new(MemoryStore::new());
        store
            .upsert(&[NewRelayRecord {
                source: MessageKey::new("o1", "a", "ca"),
                target: MessageKey::new("q1", "s5", "c5"),
            }])
            .await
            .unwrap();
        let d = dispatcher(registry, store);

        let mut reply = event(
            "s5",
            "c5",
            vec![
                ContentElement::Mention {
                    id: "bot".into(),
                    name: Some("Relay".into()),
                },
                ContentElement::text(" thanks "),
                ContentElement::Mention {
                    id: "u3".into(),
                    name: Some("Carol".into()),
                },
            ],
        );
        reply.quote = Some(QuoteInfo {
            message_id: "q1".into(),
            author: Some(Author {
                id: "bot".into(),
                name: None,
            }),
            elements: vec![],
            nickname: None,
        });

        let outcome = d.dispatch(&binding("quiet"), &reply).await;
        assert_eq!(outcome.delivered_count(), 1);
        assert_eq!(
            a.sent()[0].1,
            vec![
                ContentElement::quote("o1"),
                ContentElement::text("[Quiet - Alice]\n"),
                ContentElement::text(" thanks @Carol"),
            ]
        );
    }

    #[test]
    fn body_overrides_drop_inbound_quotes() {
        let engine = TransformEngine::new();
        let out = engine.transform(
            &[ContentElement::quote("1"), ContentElement::text("x")],
            &body_overrides("bot", false),
        );
        assert_eq!(out, vec![ContentElement::text("x")]);
    }
}
