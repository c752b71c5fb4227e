//! Messaging models as they appear on the wire.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

impl User {
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server id, or a negative local id while the message is optimistic.
    pub id: i64,
    pub content: String,
    pub sender_id: i64,
    pub conversation_id: i64,
    #[serde(default)]
    pub is_read: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Set on messages this client sent; echoed back by servers that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
}

impl Message {
    /// True until the server has confirmed the message.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.id < 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub participants: Vec<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Conversation {
    /// Name shown for this conversation to `current_user_id`.
    ///
    /// Own `name` first, then (non-group only) the first participant who is
    /// not the current user, then `Conversation #<id>`.
    #[must_use]
    pub fn display_name(&self, current_user_id: Option<i64>) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_owned();
        }
        if !self.is_group {
            if let Some(other) = self
                .participants
                .iter()
                .find(|p| Some(p.id) != current_user_id)
            {
                return other.full_name();
            }
        }
        format!("Conversation #{}", self.id)
    }

    /// Whether the last message counts as unread for `user_id`.
    #[must_use]
    pub fn has_unread_for(&self, user_id: Option<i64>) -> bool {
        self.last_message
            .as_ref()
            .is_some_and(|m| !m.is_read && Some(m.sender_id) != user_id)
    }
}

/// `messages_list` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessagesList {
    pub conversation_id: i64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// `messages_read` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessagesRead {
    pub conversation_id: i64,
    #[serde(default)]
    pub count: u32,
}

/// One entry of the `unread_counts` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UnreadCount {
    pub conversation_id: i64,
    pub count: u32,
}

/// `participant_added` payload.
#[derive(Debug, Deserialize)]
pub(crate) struct ParticipantAdded {
    pub conversation: Conversation,
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
