//! Platform-agnostic message content.

use serde::{Deserialize, Serialize};

/// One element of a rich message.
///
/// Connectors convert their native payloads into a sequence of these and
/// render a sequence back into a native send call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentElement {
    /// Plain text.
    Text { content: String },
    /// A mention of a platform user.
    Mention {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A custom emoji, sticker or reaction.
    Emoji {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A voice clip or audio file.
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// A picture.
    Image { url: String },
    /// A structural reference to another message in the same channel.
    Quote { message_id: String },
    /// Outbound marker asking the connector to render the message as if
    /// posted by another author.
    Author {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },
    /// Anything the relay does not understand.
    Other {
        kind: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Discriminant of [`ContentElement`], used to key transform visitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Text,
    Mention,
    Emoji,
    Audio,
    Image,
    Quote,
    Author,
    Other,
}

impl ContentElement {
    /// Shorthand for a text element.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Shorthand for a quote reference.
    pub fn quote(message_id: impl Into<String>) -> Self {
        Self::Quote {
            message_id: message_id.into(),
        }
    }

    pub fn kind(&self) -> ElementKind {
        match self {
            Self::Text { .. } => ElementKind::Text,
            Self::Mention { .. } => ElementKind::Mention,
            Self::Emoji { .. } => ElementKind::Emoji,
            Self::Audio { .. } => ElementKind::Audio,
            Self::Image { .. } => ElementKind::Image,
            Self::Quote { .. } => ElementKind::Quote,
            Self::Author { .. } => ElementKind::Author,
            Self::Other { .. } => ElementKind::Other,
        }
    }

    /// Raw text of a text element.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            _ => None,
        }
    }
}

/// Concatenate the text elements of a sequence.
pub fn plain_text(elements: &[ContentElement]) -> String {
    elements.iter().filter_map(ContentElement::as_text).collect()
}
