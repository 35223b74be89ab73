//! Console connector — stdin/stdout bridge for local testing.
//!
//! Every stdin line becomes a message in the configured channel. A line
//! starting with `>>ID ` replies to message `ID`. Relayed messages are printed
//! to stdout with the id they were assigned.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use crate::connectors::{Connector, EventStream, InstanceStatus};
use crate::content::ContentElement;
use crate::error::ConnectorError;
use crate::relay::types::{Author, InboundEvent, QuoteInfo, Sender};

const PLATFORM: &str = "console";

/// Sender id used for lines typed on stdin.
const LOCAL_USER: &str = "local-user";

/// Messages remembered for quote-author lookups.
const HISTORY_CAPACITY: usize = 1024;

/// Authors of the most recent messages, oldest evicted first.
struct AuthorHistory {
    capacity: usize,
    order: VecDeque<String>,
    authors: HashMap<String, Author>,
}

impl AuthorHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            authors: HashMap::new(),
        }
    }

    fn record(&mut self, message_id: String, author: Author) {
        if self.authors.insert(message_id.clone(), author).is_none() {
            self.order.push_back(message_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.authors.remove(&oldest);
            }
        }
    }

    fn get(&self, message_id: &str) -> Option<&Author> {
        self.authors.get(message_id)
    }

    fn len(&self) -> usize {
        self.authors.len()
    }
}

/// A console bot instance posting into a single channel.
pub struct ConsoleConnector {
    instance: String,
    channel: String,
    online: AtomicBool,
    next_id: Arc<AtomicU64>,
    history: Arc<Mutex<AuthorHistory>>,
}

impl ConsoleConnector {
    pub fn new(instance: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            channel: channel.into(),
            online: AtomicBool::new(false),
            next_id: Arc::new(AtomicU64::new(1)),
            history: Arc::new(Mutex::new(AuthorHistory::new(HISTORY_CAPACITY))),
        }
    }

    /// Remember at most `capacity` message authors.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history = Arc::new(Mutex::new(AuthorHistory::new(capacity)));
        self
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Split `>>ID text` into the quoted id and the remaining text.
fn parse_line(line: &str) -> (Option<String>, String) {
    if let Some(rest) = line.strip_prefix(">>") {
        let mut parts = rest.splitn(2, ' ');
        let id = parts.next().unwrap_or_default().trim();
        if !id.is_empty() {
            let text = parts.next().unwrap_or_default().trim().to_string();
            return (Some(id.to_string()), text);
        }
    }
    (None, line.to_string())
}

/// Render an outbound element sequence as one console line.
fn render_line(elements: &[ContentElement]) -> String {
    let mut line = String::new();
    for element in elements {
        match element {
            ContentElement::Author { name, .. } => line.push_str(&format!("{name}: ")),
            ContentElement::Quote { message_id } => line.push_str(&format!("(re #{message_id}) ")),
            ContentElement::Text { content } => line.push_str(content),
            ContentElement::Mention { id, name } => {
                line.push_str(&format!("@{}", name.as_deref().unwrap_or(id)))
            }
            ContentElement::Emoji { id, name } => {
                line.push_str(&format!("[{}]", name.as_deref().unwrap_or(id)))
            }
            ContentElement::Audio { .. } => line.push_str("[audio]"),
            ContentElement::Image { url } => line.push_str(&format!("[image {url}]")),
            ContentElement::Other { kind, .. } => line.push_str(&format!("[{kind}]")),
        }
    }
    line
}

#[async_trait]
impl Connector for ConsoleConnector {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn instance_id(&self) -> &str {
        &self.instance
    }

    fn status(&self) -> InstanceStatus {
        if self.online.load(Ordering::Relaxed) {
            InstanceStatus::Online
        } else {
            InstanceStatus::Connecting
        }
    }

    fn supports_author_simulation(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<EventStream, ConnectorError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let instance = self.instance.clone();
        let channel = self.channel.clone();
        let next_id = Arc::clone(&self.next_id);
        let history = Arc::clone(&self.history);

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let (quote_id, text) = parse_line(line);
                        let message_id = next_id.fetch_add(1, Ordering::Relaxed).to_string();
                        history.lock().await.record(
                            message_id.clone(),
                            Author {
                                id: LOCAL_USER.to_string(),
                                name: None,
                            },
                        );
                        eprintln!("#{message_id} {line}");

                        // Quote authors come from fetch_quote_author.
                        let quote = quote_id.map(|id| QuoteInfo {
                            message_id: id,
                            author: None,
                            elements: Vec::new(),
                            nickname: None,
                        });
                        let event = InboundEvent {
                            platform: PLATFORM.to_string(),
                            instance: instance.clone(),
                            self_id: instance.clone(),
                            channel: channel.clone(),
                            message_id,
                            sender: Sender {
                                id: LOCAL_USER.to_string(),
                                name: None,
                                avatar: None,
                            },
                            elements: vec![ContentElement::text(text)],
                            quote,
                            received_at: Utc::now(),
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        self.online.store(true, Ordering::Relaxed);
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn send(
        &self,
        channel_id: &str,
        elements: &[ContentElement],
    ) -> Result<Vec<String>, ConnectorError> {
        let message_id = self.allocate_id();
        let shown_as = elements.iter().find_map(|e| match e {
            ContentElement::Author { name, .. } => Some(name.clone()),
            _ => None,
        });
        self.history.lock().await.record(
            message_id.clone(),
            Author {
                id: self.instance.clone(),
                name: shown_as,
            },
        );
        println!("[{channel_id}] #{message_id} {}", render_line(elements));
        Ok(vec![message_id])
    }

    async fn fetch_quote_author(
        &self,
        _channel_id: &str,
        message_id: &str,
    ) -> Result<Option<Author>, ConnectorError> {
        Ok(self.history.lock().await.get(message_id).cloned())
    }

    async fn shutdown(&self) -> Result<(), ConnectorError> {
        self.online.store(false, Ordering::Relaxed);
        Ok(())
    }
}
