//! The final-output content vocabulary.

use serde::{Deserialize, Serialize};

/// A piece of final output produced by an [`AgentLoopBody`](crate::contracts::AgentLoopBody).
///
/// Intentionally simple — structured payloads go through [`ContentPart::Json`]
/// rather than growing this enum a variant at a time.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text output.
    Text {
        /// The text content.
        text: String,
    },
    /// Structured JSON output.
    Json {
        /// The JSON payload.
        value: serde_json::Value,
    },
}

impl ContentPart {
    /// Build a [`ContentPart::Text`] from anything string-like.
    pub fn text(s: impl Into<String>) -> Self {
        ContentPart::Text { text: s.into() }
    }

    /// Build a [`ContentPart::Json`] from a serializable value.
    pub fn json(value: serde_json::Value) -> Self {
        ContentPart::Json { value }
    }

    /// Borrow the text, if this part is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::Json { .. } => None,
        }
    }
}
