//! Frame — the unit carried over the shared realtime connection.
//!
//! ARCHITECTURE
//! ============
//! Every exchange with the server is a named event plus a JSON payload.
//! Requests go out as frames, replies and pushes come back as frames. There
//! is no request id on the wire: a reply is recognised by its event name
//! (and, for a few events, by fields inside the payload).
//!
//! DESIGN
//! ======
//! - Payload is an arbitrary `serde_json::Value`; some events carry a bare
//!   number (`auth`, `check_auth`), most carry an object.
//! - Text encoding is `{"event": "...", "data": ...}`.
//! - Event names are constants below so call sites never spell them twice.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// EVENT NAMES
// =============================================================================

pub const LOGIN: &str = "login";
pub const REGISTER: &str = "register";
pub const LOGOUT: &str = "logout";
pub const CHECK_AUTH: &str = "check_auth";
pub const AUTH: &str = "auth";
pub const AUTH_SUCCESS: &str = "auth_success";
pub const AUTH_ERROR: &str = "auth_error";
pub const LOGOUT_SUCCESS: &str = "logout_success";
pub const LOGOUT_ERROR: &str = "logout_error";

pub const GET_CONVERSATIONS: &str = "get_conversations";
pub const CONVERSATIONS_LIST: &str = "conversations_list";
pub const CONVERSATIONS_ERROR: &str = "conversations_error";
pub const CREATE_CONVERSATION: &str = "create_conversation";
pub const CONVERSATION_CREATED: &str = "conversation_created";
pub const CREATE_CONVERSATION_ERROR: &str = "create_conversation_error";
pub const GET_MESSAGES: &str = "get_messages";
pub const MESSAGES_LIST: &str = "messages_list";
pub const MESSAGES_ERROR: &str = "messages_error";
pub const SEND_MESSAGE: &str = "send_message";
pub const MARK_MESSAGES_READ: &str = "mark_messages_read";
pub const MESSAGES_READ: &str = "messages_read";
pub const MARK_MESSAGES_READ_ERROR: &str = "mark_messages_read_error";
pub const GET_UNREAD_COUNTS: &str = "get_unread_counts";
pub const UNREAD_COUNTS: &str = "unread_counts";
pub const UNREAD_COUNTS_ERROR: &str = "unread_counts_error";

/// Server push: a message was posted to a conversation the user belongs to.
pub const NEW_MESSAGE: &str = "new_message";
/// Server push: the user was added to a conversation.
pub const PARTICIPANT_ADDED: &str = "participant_added";

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Payload key for error messages on `*_error` events.
pub const FRAME_MESSAGE: &str = "message";

// =============================================================================
// TYPES
// =============================================================================

/// A single event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct FrameDecodeError(#[from] serde_json::Error);

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<Value>) -> Self {
        Self { event: event.into(), data: data.into() }
    }

    /// A frame with no payload (`null` on the wire).
    pub fn bare(event: impl Into<String>) -> Self {
        Self { event: event.into(), data: Value::Null }
    }

    /// Build a frame from any serializable payload.
    ///
    /// # Errors
    ///
    /// Fails only if `payload` cannot be represented as JSON.
    pub fn with_payload<T: Serialize>(event: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self { event: event.into(), data: serde_json::to_value(payload)? })
    }

    /// Server error message carried in `data.message`, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.data.get(FRAME_MESSAGE).and_then(Value::as_str)
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a frame as a JSON text message.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    // Value-only structs never fail to serialize.
    serde_json::to_string(frame).unwrap_or_default()
}

/// Decode a JSON text message into a frame.
///
/// # Errors
///
/// Returns [`FrameDecodeError`] if the text is not a `{event, data}` object.
pub fn decode_frame(text: &str) -> Result<Frame, FrameDecodeError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
