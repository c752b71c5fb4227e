//! Messaging store — conversations, messages and unread counters.
//!
//! ARCHITECTURE
//! ============
//! Requests go through the shared `Correlator`; unsolicited server events
//! (`new_message`, `participant_added`, `conversation_created`) arrive through
//! the connection's push stream and are applied by [`spawn_push_listener`].
//! Both paths mutate the same state under one lock.
//!
//! DESIGN
//! ======
//! - Collections are `Arc`-shared and updated copy-on-write, so a snapshot
//!   handed to a caller never changes underneath it.
//! - The lock is never held across an await. Network calls run first, their
//!   result is applied afterwards in one write section.
//! - Sends are optimistic: the message is in the list (negative id) before
//!   the request is written. The server's `new_message` replaces it, matched
//!   by `clientId` when echoed (at any age), else by sender + conversation
//!   + content within [`RECONCILE_WINDOW`]. Only the content fallback keeps
//!   a pending record, and records past the window are pruned on every send.
//! - Whether a conversation's messages were loaded is tracked separately
//!   from the list itself, so an optimistic send or a push before the first
//!   load never suppresses it.

mod model;
mod push;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlation::{Correlator, ProtocolError, decode};
use crate::frame::{self, Frame};
use crate::session::SessionProtocol;

pub use model::{Conversation, Message, User};
pub use push::spawn_push_listener;

use model::{MessagesList, MessagesRead, ParticipantAdded, UnreadCount};

/// How long an optimistic message may wait for its server echo and still be
/// matched by content.
pub const RECONCILE_WINDOW: Duration = Duration::from_secs(30);

// =============================================================================
// STATE
// =============================================================================

/// Point-in-time view of the messaging state.
#[derive(Debug, Clone, Default)]
pub struct MessengerState {
    /// Most recent first.
    pub conversations: Arc<Vec<Conversation>>,
    pub active_conversation: Option<i64>,
    pub messages: HashMap<i64, Arc<Vec<Message>>>,
    pub unread_counts: HashMap<i64, u32>,
}

/// What selecting a conversation requires, decided at selection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivationPlan {
    pub load: bool,
    pub mark_read: bool,
}

struct PendingSend {
    client_id: Uuid,
    local_id: i64,
    conversation_id: i64,
    content: String,
    sent_at: Instant,
}

#[derive(Default)]
struct Inner {
    view: MessengerState,
    fetched: HashSet<i64>,
    pending_sends: Vec<PendingSend>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest<'a> {
    user_ids: &'a [i64],
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    is_group: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetMessagesRequest {
    conversation_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    conversation_id: i64,
    sender_id: i64,
    content: &'a str,
    client_id: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    conversation_id: i64,
    user_id: i64,
}

// =============================================================================
// MESSAGING STORE
// =============================================================================

pub struct MessagingStore {
    correlator: Correlator,
    session: Arc<SessionProtocol>,
    inner: RwLock<Inner>,
    next_local_id: AtomicI64,
}

impl MessagingStore {
    #[must_use]
    pub fn new(correlator: Correlator, session: Arc<SessionProtocol>) -> Self {
        Self { correlator, session, inner: RwLock::new(Inner::default()), next_local_id: AtomicI64::new(-1) }
    }

    #[must_use]
    pub fn snapshot(&self) -> MessengerState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .view
            .clone()
    }

    #[must_use]
    pub fn conversations(&self) -> Arc<Vec<Conversation>> {
        Arc::clone(
            &self
                .inner
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .view
                .conversations,
        )
    }

    #[must_use]
    pub fn messages(&self, conversation_id: i64) -> Option<Arc<Vec<Message>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .view
            .messages
            .get(&conversation_id)
            .cloned()
    }

    #[must_use]
    pub fn unread_count(&self, conversation_id: i64) -> u32 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .view
            .unread_counts
            .get(&conversation_id)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn active_conversation(&self) -> Option<i64> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .view
            .active_conversation
    }

    /// Display name of `conversation` for the logged-in user.
    #[must_use]
    pub fn display_name(&self, conversation: &Conversation) -> String {
        conversation.display_name(self.session.user_id())
    }

    /// Drop all state. Used when the user changes.
    pub fn reset(&self) {
        *self.write() = Inner::default();
        debug!("messenger state reset");
    }

    // =========================================================================
    // CONVERSATIONS
    // =========================================================================

    /// Fetch the conversation list, replacing the local one.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` without a session, otherwise any correlation error.
    pub async fn load_conversations(&self) -> Result<Arc<Vec<Conversation>>, ProtocolError> {
        let user_id = self.require_user()?;
        let data = self
            .correlator
            .request(
                Frame::new(frame::GET_CONVERSATIONS, user_id),
                frame::CONVERSATIONS_LIST,
                frame::CONVERSATIONS_ERROR,
            )
            .await?;
        let list: Vec<Conversation> = decode(frame::CONVERSATIONS_LIST, data)?;

        let mut inner = self.write();
        let active = inner.view.active_conversation;
        inner.view.unread_counts = list
            .iter()
            .map(|c| {
                let unread = Some(c.id) != active && c.has_unread_for(Some(user_id));
                (c.id, u32::from(unread))
            })
            .collect();
        inner.view.conversations = Arc::new(list);
        info!(user_id, count = inner.view.conversations.len(), "conversations loaded");
        Ok(Arc::clone(&inner.view.conversations))
    }

    /// Create a conversation and put it at the head of the list.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` without a session, otherwise any correlation error.
    pub async fn create_conversation(
        &self,
        user_ids: &[i64],
        name: Option<&str>,
        is_group: bool,
    ) -> Result<Conversation, ProtocolError> {
        self.require_user()?;
        let request = Frame::with_payload(frame::CREATE_CONVERSATION, &CreateConversationRequest { user_ids, name, is_group })
            .map_err(|source| ProtocolError::Decode { event: frame::CREATE_CONVERSATION.into(), source })?;
        let data = self
            .correlator
            .request(request, frame::CONVERSATION_CREATED, frame::CREATE_CONVERSATION_ERROR)
            .await?;
        let conversation: Conversation = decode(frame::CONVERSATION_CREATED, data)?;
        self.apply_conversation(conversation.clone());
        Ok(conversation)
    }

    // =========================================================================
    // MESSAGES
    // =========================================================================

    /// Load a conversation's messages once. Later calls return what is held.
    ///
    /// Either way the conversation's unread count drops to zero.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` without a session, otherwise any correlation error.
    /// Nothing is recorded on failure, so the next call retries.
    pub async fn load_messages(
        &self,
        conversation_id: i64,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Arc<Vec<Message>>, ProtocolError> {
        self.require_user()?;
        {
            let mut inner = self.write();
            if inner.fetched.contains(&conversation_id) {
                inner.view.unread_counts.insert(conversation_id, 0);
                return Ok(inner
                    .view
                    .messages
                    .get(&conversation_id)
                    .cloned()
                    .unwrap_or_default());
            }
        }

        let request = Frame::with_payload(frame::GET_MESSAGES, &GetMessagesRequest { conversation_id, limit, offset })
            .map_err(|source| ProtocolError::Decode { event: frame::GET_MESSAGES.into(), source })?;
        let data = self
            .correlator
            .request_matching(request, frame::MESSAGES_LIST, frame::MESSAGES_ERROR, move |v| {
                field_matches(v, "conversationId", conversation_id)
            })
            .await?;
        let list: MessagesList = decode(frame::MESSAGES_LIST, data)?;

        let mut inner = self.write();
        let merged = merge_loaded(list.messages, inner.view.messages.get(&list.conversation_id));
        debug!(conversation_id, count = merged.len(), "messages loaded");
        inner.fetched.insert(conversation_id);
        inner
            .view
            .messages
            .insert(conversation_id, Arc::clone(&merged));
        inner.view.unread_counts.insert(conversation_id, 0);
        Ok(merged)
    }

    /// Append an optimistic message and write `send_message`.
    ///
    /// Returns once the request is written; the server confirms later with a
    /// `new_message` push. A failed write leaves the optimistic entry in place.
    ///
    /// # Errors
    ///
    /// `Validation` for blank content (nothing is sent), `NotAuthenticated`
    /// without a session, `ConnectionFailure` if the write failed.
    pub async fn send_message(&self, conversation_id: i64, content: &str) -> Result<Message, ProtocolError> {
        if content.trim().is_empty() {
            return Err(ProtocolError::Validation("message cannot be empty".into()));
        }
        let sender_id = self.require_user()?;
        let client_id = Uuid::new_v4();
        let request = Frame::with_payload(
            frame::SEND_MESSAGE,
            &SendMessageRequest { conversation_id, sender_id, content, client_id },
        )
        .map_err(|source| ProtocolError::Decode { event: frame::SEND_MESSAGE.into(), source })?;
        let message = Message {
            id: self.next_local_id.fetch_sub(1, Ordering::Relaxed),
            content: content.to_owned(),
            sender_id,
            conversation_id,
            is_read: false,
            created_at: OffsetDateTime::now_utc(),
            client_id: Some(client_id),
        };

        {
            let mut inner = self.write();
            push_message(&mut inner.view.messages, message.clone());
            touch_conversation(&mut inner.view.conversations, &message);
            prune_expired(&mut inner.pending_sends);
            inner.pending_sends.push(PendingSend {
                client_id,
                local_id: message.id,
                conversation_id,
                content: message.content.clone(),
                sent_at: Instant::now(),
            });
        }

        if let Err(err) = self.correlator.emit(request).await {
            self.write()
                .pending_sends
                .retain(|p| p.client_id != client_id);
            return Err(err);
        }
        debug!(conversation_id, local_id = message.id, %client_id, "message sent");
        Ok(message)
    }

    /// Mark everything the other participants wrote as read.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` without a session, otherwise any correlation error.
    pub async fn mark_messages_read(&self, conversation_id: i64) -> Result<u32, ProtocolError> {
        let user_id = self.require_user()?;
        let request = Frame::with_payload(frame::MARK_MESSAGES_READ, &MarkReadRequest { conversation_id, user_id })
            .map_err(|source| ProtocolError::Decode { event: frame::MARK_MESSAGES_READ.into(), source })?;
        let data = self
            .correlator
            .request_matching(request, frame::MESSAGES_READ, frame::MARK_MESSAGES_READ_ERROR, move |v| {
                field_matches(v, "conversationId", conversation_id) && field_matches(v, "userId", user_id)
            })
            .await?;
        let receipt: MessagesRead = decode(frame::MESSAGES_READ, data)?;

        let mut inner = self.write();
        if let Some(list) = inner.view.messages.get_mut(&receipt.conversation_id) {
            if list.iter().any(|m| m.sender_id != user_id && !m.is_read) {
                for m in Arc::make_mut(list)
                    .iter_mut()
                    .filter(|m| m.sender_id != user_id)
                {
                    m.is_read = true;
                }
            }
        }
        if let Some(conv) = find_conversation(&mut inner.view.conversations, conversation_id) {
            if let Some(last) = conv.last_message.as_mut().filter(|m| m.sender_id != user_id) {
                last.is_read = true;
            }
        }
        inner.view.unread_counts.insert(conversation_id, 0);
        debug!(conversation_id, count = receipt.count, "messages marked read");
        Ok(receipt.count)
    }

    /// Fetch per-conversation unread counts from the server.
    ///
    /// Replaces the local counts; the active conversation stays at zero.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` without a session, otherwise any correlation error.
    pub async fn get_unread_counts(&self) -> Result<HashMap<i64, u32>, ProtocolError> {
        let user_id = self.require_user()?;
        let data = self
            .correlator
            .request(
                Frame::new(frame::GET_UNREAD_COUNTS, user_id),
                frame::UNREAD_COUNTS,
                frame::UNREAD_COUNTS_ERROR,
            )
            .await?;
        let entries: Vec<UnreadCount> = decode(frame::UNREAD_COUNTS, data)?;

        let mut inner = self.write();
        let mut counts: HashMap<i64, u32> = entries
            .into_iter()
            .map(|e| (e.conversation_id, e.count))
            .collect();
        if let Some(active) = inner.view.active_conversation {
            counts.insert(active, 0);
        }
        inner.view.unread_counts = counts.clone();
        Ok(counts)
    }

    /// Rebuild server-derived state after push events were lost.
    ///
    /// Every conversation counts as unloaded again, so its next activation
    /// refetches messages. Conversations and unread counts are refetched now.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` without a session, otherwise any correlation error.
    pub async fn resync(&self) -> Result<(), ProtocolError> {
        self.require_user()?;
        self.write().fetched.clear();
        self.load_conversations().await?;
        self.get_unread_counts().await?;
        info!("messenger resynced");
        Ok(())
    }

    // =========================================================================
    // ACTIVE CONVERSATION
    // =========================================================================

    /// Switch the active conversation without touching the network.
    ///
    /// The returned plan says whether messages still need loading and whether
    /// there is anything to mark read, both judged before any load runs.
    pub fn select_conversation(&self, conversation_id: Option<i64>) -> ActivationPlan {
        let mut inner = self.write();
        inner.view.active_conversation = conversation_id;
        conversation_id.map_or_else(ActivationPlan::default, |id| ActivationPlan {
            load: !inner.fetched.contains(&id),
            mark_read: inner
                .view
                .unread_counts
                .get(&id)
                .is_some_and(|&n| n > 0),
        })
    }

    /// Select a conversation, then load its messages and mark them read as
    /// needed. The load always completes before the read receipt is sent.
    ///
    /// # Errors
    ///
    /// The first failing step's error; later steps are skipped.
    pub async fn set_active_conversation(&self, conversation_id: Option<i64>) -> Result<ActivationPlan, ProtocolError> {
        let plan = self.select_conversation(conversation_id);
        if let Some(id) = conversation_id {
            if plan.load {
                self.load_messages(id, None, None).await?;
            }
            if plan.mark_read {
                self.mark_messages_read(id).await?;
            }
        }
        Ok(plan)
    }

    // =========================================================================
    // PUSH EVENTS
    // =========================================================================

    /// Apply one unsolicited server event. Returns whether it was consumed.
    pub fn apply_push(&self, frame: &Frame) -> bool {
        let applied = match frame.event.as_str() {
            frame::NEW_MESSAGE => decode::<Message>(frame::NEW_MESSAGE, frame.data.clone()).map(|m| self.apply_new_message(m)),
            frame::PARTICIPANT_ADDED => decode::<ParticipantAdded>(frame::PARTICIPANT_ADDED, frame.data.clone())
                .map(|p| self.apply_conversation(p.conversation)),
            frame::CONVERSATION_CREATED => {
                decode::<Conversation>(frame::CONVERSATION_CREATED, frame.data.clone()).map(|c| self.apply_conversation(c))
            }
            _ => return false,
        };
        if let Err(e) = applied {
            warn!(event = %frame.event, error = %e, "ignoring malformed push");
            return false;
        }
        true
    }

    /// Record a message the server reports as posted.
    pub fn apply_new_message(&self, message: Message) {
        let user_id = self.session.user_id();
        let mut inner = self.write();
        let conversation_id = message.conversation_id;

        let known = inner
            .view
            .messages
            .get(&conversation_id)
            .is_some_and(|list| list.iter().any(|m| m.id == message.id));
        if known {
            return;
        }

        let echo = match message.client_id {
            Some(client_id) => {
                inner.pending_sends.retain(|p| p.client_id != client_id);
                find_local_by_client_id(inner.view.messages.get(&conversation_id), client_id)
            }
            None if Some(message.sender_id) == user_id => {
                prune_expired(&mut inner.pending_sends);
                take_content_match(&mut inner.pending_sends, &message)
            }
            None => None,
        };

        let mut replaced = false;
        if let Some(local_id) = echo {
            if let Some(list) = inner.view.messages.get_mut(&conversation_id) {
                if let Some(pos) = list.iter().position(|m| m.id == local_id) {
                    Arc::make_mut(list)[pos] = message.clone();
                    replaced = true;
                }
            }
        }
        if !replaced {
            push_message(&mut inner.view.messages, message.clone());
        }
        touch_conversation(&mut inner.view.conversations, &message);

        let from_other = Some(message.sender_id) != user_id;
        if from_other && inner.view.active_conversation != Some(conversation_id) {
            *inner
                .view
                .unread_counts
                .entry(conversation_id)
                .or_insert(0) += 1;
        }
        debug!(conversation_id, message_id = message.id, replaced, "new message applied");
    }

    /// Insert or refresh a conversation at the head of the list.
    pub fn apply_conversation(&self, conversation: Conversation) {
        let user_id = self.session.user_id();
        let mut inner = self.write();
        let unread = u32::from(
            inner.view.active_conversation != Some(conversation.id) && conversation.has_unread_for(user_id),
        );
        inner
            .view
            .unread_counts
            .entry(conversation.id)
            .or_insert(unread);
        let list = Arc::make_mut(&mut inner.view.conversations);
        list.retain(|c| c.id != conversation.id);
        list.insert(0, conversation);
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn require_user(&self) -> Result<i64, ProtocolError> {
        self.session
            .user_id()
            .ok_or(ProtocolError::NotAuthenticated)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// True when `key` is absent from the payload or equals `expected`.
fn field_matches(payload: &Value, key: &str, expected: i64) -> bool {
    payload
        .get(key)
        .and_then(Value::as_i64)
        .is_none_or(|v| v == expected)
}

fn push_message(messages: &mut HashMap<i64, Arc<Vec<Message>>>, message: Message) {
    Arc::make_mut(messages.entry(message.conversation_id).or_default()).push(message);
}

fn find_conversation(conversations: &mut Arc<Vec<Conversation>>, id: i64) -> Option<&mut Conversation> {
    if !conversations.iter().any(|c| c.id == id) {
        return None;
    }
    Arc::make_mut(conversations)
        .iter_mut()
        .find(|c| c.id == id)
}

fn touch_conversation(conversations: &mut Arc<Vec<Conversation>>, message: &Message) {
    if let Some(conv) = find_conversation(conversations, message.conversation_id) {
        conv.updated_at = message.created_at;
        conv.last_message = Some(message.clone());
    }
}

/// Local id of the optimistic message carrying `client_id`, however old.
fn find_local_by_client_id(list: Option<&Arc<Vec<Message>>>, client_id: Uuid) -> Option<i64> {
    list?
        .iter()
        .find(|m| m.is_local() && m.client_id == Some(client_id))
        .map(|m| m.id)
}

fn prune_expired(pending: &mut Vec<PendingSend>) {
    pending.retain(|p| p.sent_at.elapsed() <= RECONCILE_WINDOW);
}

/// Oldest unconfirmed send in the same conversation with identical content.
fn take_content_match(pending: &mut Vec<PendingSend>, message: &Message) -> Option<i64> {
    let pos = pending
        .iter()
        .position(|p| p.conversation_id == message.conversation_id && p.content == message.content)?;
    Some(pending.remove(pos).local_id)
}

/// Server list first, then anything held locally that the server did not return.
fn merge_loaded(server: Vec<Message>, local: Option<&Arc<Vec<Message>>>) -> Arc<Vec<Message>> {
    let mut merged = server;
    if let Some(local) = local {
        let confirmed: HashSet<i64> = merged.iter().map(|m| m.id).collect();
        let echoed: HashSet<Uuid> = merged.iter().filter_map(|m| m.client_id).collect();
        merged.extend(
            local
                .iter()
                .filter(|m| !confirmed.contains(&m.id) && m.client_id.is_none_or(|c| !echoed.contains(&c)))
                .cloned(),
        );
    }
    Arc::new(merged)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
