use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TurnId;

/// Author of a turn as it appears on the wire and in persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One chat message. Turns are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: TurnId,
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    /// Local-only marker for errors surfaced into the transcript; never sent to the peer.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl Turn {
    pub fn new(
        id: TurnId,
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            content: content.into(),
            role,
            timestamp,
            is_error: false,
        }
    }

    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(TurnId::generate(), Role::User, content, timestamp)
    }

    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(TurnId::generate(), Role::Assistant, content, timestamp)
    }

    /// Builds the visible marker appended when a reply fails instead of arriving.
    pub fn error_marker(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            is_error: true,
            ..Self::assistant(message, timestamp)
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
