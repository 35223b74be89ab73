//! Content transform engine.
//!
//! Reduces a rich element sequence to something every platform can render:
//! pictures are dropped, mentions, emoji and audio become text. Callers can
//! replace the handling of any element kind for a single call through a
//! [`VisitorTable`]; visitors take precedence over the engine defaults.

use std::collections::HashMap;
use std::sync::Arc;

use super::element::{ContentElement, ElementKind};

/// Label used for an emoji that carries no name.
pub const DEFAULT_EMOJI_LABEL: &str = "Emoji";

/// Placeholder rendered in place of audio.
pub const AUDIO_PLACEHOLDER: &str = "[Voice]";

/// Replacement function for one element. Returning an empty vector drops the
/// element.
pub type Visitor = Arc<dyn Fn(&ContentElement) -> Vec<ContentElement> + Send + Sync>;

/// Per-call overrides keyed by element kind.
#[derive(Clone, Default)]
pub struct VisitorTable {
    visitors: HashMap<ElementKind, Visitor>,
}

impl VisitorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a visitor for `kind`, replacing any earlier one.
    pub fn with<F>(mut self, kind: ElementKind, visitor: F) -> Self
    where
        F: Fn(&ContentElement) -> Vec<ContentElement> + Send + Sync + 'static,
    {
        self.visitors.insert(kind, Arc::new(visitor));
        self
    }

    pub fn get(&self, kind: ElementKind) -> Option<&Visitor> {
        self.visitors.get(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }
}

impl std::fmt::Debug for VisitorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorTable")
            .field("kinds", &self.visitors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Stateless engine applying default rules merged with per-call visitors.
#[derive(Debug, Clone, Default)]
pub struct TransformEngine;

impl TransformEngine {
    pub fn new() -> Self {
        Self
    }

    /// Transform with defaults only.
    pub fn reduce(&self, elements: &[ContentElement]) -> Vec<ContentElement> {
        self.transform(elements, &VisitorTable::default())
    }

    /// Transform `elements` into a new sequence. Never fails.
    pub fn transform(
        &self,
        elements: &[ContentElement],
        overrides: &VisitorTable,
    ) -> Vec<ContentElement> {
        let mut out = Vec::with_capacity(elements.len());
        for element in elements {
            match overrides.get(element.kind()) {
                Some(visitor) => out.extend(visitor(element)),
                None => out.extend(default_visit(element)),
            }
        }
        out
    }
}

fn default_visit(element: &ContentElement) -> Vec<ContentElement> {
    match element {
        ContentElement::Image { .. } => Vec::new(),
        ContentElement::Mention { id, name } => {
            vec![ContentElement::text(format!(
                "@{}",
                name.as_deref().unwrap_or(id)
            ))]
        }
        ContentElement::Emoji { name, .. } => {
            vec![ContentElement::text(format!(
                "[{}]",
                name.as_deref().unwrap_or(DEFAULT_EMOJI_LABEL)
            ))]
        }
        ContentElement::Audio { .. } => vec![ContentElement::text(AUDIO_PLACEHOLDER)],
        other => vec![other.clone()],
    }
}
