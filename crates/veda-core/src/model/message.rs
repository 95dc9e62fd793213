use serde::{Deserialize, Serialize};

use crate::error::{Result, VedaError};

/// Validate a message the user is about to send.
pub fn validate_message_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(VedaError::InvalidInput("message cannot be empty".into()));
    }
    Ok(())
}

/// Who authored a message. Fixed when the message is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn in a conversation as shown to the user.
///
/// `text` only grows while `streaming` is set; the conversation state machine
/// is the only place that flips either field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub streaming: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            text: text.into(),
            streaming: false,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::Assistant,
            text: text.into(),
            streaming: false,
        }
    }

    /// Empty assistant message that will be filled by streamed deltas.
    pub fn placeholder() -> Self {
        Self {
            id: None,
            role: Role::Assistant,
            text: String::new(),
            streaming: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

/// A protocol event decoded from the reply stream. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    Done,
}
