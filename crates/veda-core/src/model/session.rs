use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};

use super::message::Message;

/// Label shown for sessions the backend has not named yet.
pub const UNTITLED_SESSION: &str = "New Conversation";

/// One entry of the session list, as returned by `GET /chat/sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(rename = "sessionName", default, deserialize_with = "null_as_empty")]
    pub display_name: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
}

impl SessionSummary {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            created_at: None,
        }
    }

    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = Some(created_at.into());
        self
    }

    /// Display name, falling back to [`UNTITLED_SESSION`] when blank.
    pub fn title(&self) -> &str {
        let name = self.display_name.trim();
        if name.is_empty() {
            UNTITLED_SESSION
        } else {
            name
        }
    }

    /// Calendar day the session was created, if the backend sent a parseable
    /// timestamp (RFC 3339 or a bare `YYYY-MM-DD`).
    pub fn created_on(&self) -> Option<NaiveDate> {
        self.created_at.as_deref().and_then(parse_day)
    }
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

// The backend sends `null` for unnamed sessions and unanswered questions.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One persisted question/answer pair from `GET /chat/history/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub question: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub answer: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
}

/// Expand history pairs into display messages, user before assistant, in
/// array order. Blank halves are skipped.
pub fn expand_history(entries: &[HistoryEntry]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(entries.len() * 2);
    for entry in entries {
        if !entry.question.is_empty() {
            messages.push(Message::user(entry.question.clone()));
        }
        if !entry.answer.is_empty() {
            messages.push(Message::assistant(entry.answer.clone()));
        }
    }
    messages
}

/// Body of `POST /chat/send-stream`. `sessionId` is omitted for a new chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SendMessageRequest {
    pub fn new(message: impl Into<String>, session_id: Option<&str>) -> Self {
        Self {
            message: message.into(),
            session_id: session_id
                .filter(|id| !id.trim().is_empty())
                .map(str::to_string),
        }
    }
}
