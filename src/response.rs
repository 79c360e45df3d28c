//! Chat message and response value types.
//!
//! A [`Response`] is always populated with a [`StatusCode`]; the status is
//! the outcome channel, so callers never have to branch on an error type
//! at the boundary.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::StatusCode;

/// One turn of a recommendation-focused conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::new("assistant", content)
    }
}

/// A single generated completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
}

/// Result payload for a chat-completions request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Outcome of the request; choices are only populated on `Success`.
    pub status: StatusCode,

    /// Model that served (or rejected) the request.
    pub model_id: String,

    /// Unix timestamp (seconds) of response construction.
    pub created: u64,

    /// Generated completions, in rank order.
    pub choices: Vec<Choice>,
}

impl Response {
    /// A response carrying only a failure status.
    pub fn status_only(status: StatusCode, model_id: impl Into<String>) -> Self {
        Response {
            status,
            model_id: model_id.into(),
            created: unix_now(),
            choices: Vec::new(),
        }
    }

    /// A successful response with the generated choices.
    pub fn success(model_id: impl Into<String>, choices: Vec<Choice>) -> Self {
        Response {
            status: StatusCode::Success,
            model_id: model_id.into(),
            created: unix_now(),
            choices,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Format a ranked item list as assistant message content.
pub(crate) fn format_items(items: &[u64]) -> String {
    let ids: Vec<String> = items.iter().map(|id| id.to_string()).collect();
    format!("items: {}", ids.join(" "))
}
