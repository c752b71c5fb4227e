//! Session protocol — login, register, logout and revalidation.
//!
//! ARCHITECTURE
//! ============
//! Every operation is one correlated exchange on the shared connection.
//! A successful login/register/check also sends an out-of-band `auth`
//! event carrying the user id, which scopes server pushes to this user.
//!
//! DESIGN
//! ======
//! - The in-memory session and the persisted copy change together: the store
//!   is written first and memory follows only if the write succeeded, inside
//!   the same lock.
//! - Operations are serialized through an async mutex (FIFO), so at most one
//!   of them is in flight per process.
//! - A failed `check_auth` (rejected or timed out) clears the session. A
//!   failed `login` leaves whatever session existed untouched.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::correlation::{Correlator, ProtocolError, decode};
use crate::frame::{self, Frame};
use crate::storage::KeyValueStore;

/// Storage key of the persisted session.
pub const SESSION_KEY: &str = "user";

// =============================================================================
// TYPES
// =============================================================================

/// The authenticated user, as persisted: `{id, email, firstName, lastName}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    Authenticating,
    Authenticated,
}

#[derive(Deserialize)]
struct AuthSuccess {
    user: Session,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    first_name: &'a str,
    last_name: &'a str,
    email: &'a str,
    password: &'a str,
}

struct SessionSlot {
    state: AuthState,
    session: Option<Arc<Session>>,
}

// =============================================================================
// SESSION PROTOCOL
// =============================================================================

pub struct SessionProtocol {
    correlator: Correlator,
    store: Arc<dyn KeyValueStore>,
    slot: RwLock<SessionSlot>,
    op_lock: tokio::sync::Mutex<()>,
}

impl SessionProtocol {
    /// Build the protocol, restoring any persisted session.
    ///
    /// A persisted session that cannot be parsed is removed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Storage`] if the store cannot be read.
    pub fn new(correlator: Correlator, store: Arc<dyn KeyValueStore>) -> Result<Self, ProtocolError> {
        let session = read_persisted(store.as_ref())?;
        let state = if session.is_some() { AuthState::Authenticated } else { AuthState::Anonymous };
        if let Some(s) = &session {
            info!(user_id = s.id, "restored persisted session");
        }
        Ok(Self {
            correlator,
            store,
            slot: RwLock::new(SessionSlot { state, session: session.map(Arc::new) }),
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<Session>> {
        self.read_slot().session.clone()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<i64> {
        self.read_slot().session.as_ref().map(|s| s.id)
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        self.read_slot().state
    }

    /// Log in with email and password.
    ///
    /// # Errors
    ///
    /// `Validation` for empty credentials, otherwise any correlation error.
    pub async fn login(&self, email: &str, password: &str) -> Result<Arc<Session>, ProtocolError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ProtocolError::Validation("email and password are required".into()));
        }
        let _op = self.op_lock.lock().await;
        let request = Frame::with_payload(frame::LOGIN, &LoginRequest { email, password })
            .map_err(|source| ProtocolError::Decode { event: frame::LOGIN.into(), source })?;
        let previous = self.begin();
        let result = self
            .correlator
            .request(request, frame::AUTH_SUCCESS, frame::AUTH_ERROR)
            .await;
        self.finish_auth(frame::LOGIN, result, previous).await
    }

    /// Create an account; on success the new user is logged in.
    ///
    /// # Errors
    ///
    /// `Validation` for empty fields, otherwise any correlation error.
    pub async fn register(
        &self,
        first_name: &str,
        last_name: &str,
        email: &str,
        password: &str,
    ) -> Result<Arc<Session>, ProtocolError> {
        if [first_name, last_name, email].iter().any(|f| f.trim().is_empty()) || password.is_empty() {
            return Err(ProtocolError::Validation("all registration fields are required".into()));
        }
        let _op = self.op_lock.lock().await;
        let payload = RegisterRequest { first_name, last_name, email, password };
        let request = Frame::with_payload(frame::REGISTER, &payload)
            .map_err(|source| ProtocolError::Decode { event: frame::REGISTER.into(), source })?;
        let previous = self.begin();
        let result = self
            .correlator
            .request(request, frame::AUTH_SUCCESS, frame::AUTH_ERROR)
            .await;
        self.finish_auth(frame::REGISTER, result, previous).await
    }

    /// [`SessionProtocol::register`] behind a password confirmation check.
    ///
    /// # Errors
    ///
    /// `Validation` if the passwords differ.
    pub async fn register_confirmed(
        &self,
        first_name: &str,
        last_name: &str,
        email: &str,
        password: &str,
        confirmation: &str,
    ) -> Result<Arc<Session>, ProtocolError> {
        if password != confirmation {
            return Err(ProtocolError::Validation("passwords do not match".into()));
        }
        self.register(first_name, last_name, email, password)
            .await
    }

    /// End the session on the server, then clear it locally.
    ///
    /// # Errors
    ///
    /// Any correlation error; the session is kept in that case.
    pub async fn logout(&self) -> Result<(), ProtocolError> {
        let _op = self.op_lock.lock().await;
        let previous = self.begin();
        match self
            .correlator
            .request(Frame::bare(frame::LOGOUT), frame::LOGOUT_SUCCESS, frame::LOGOUT_ERROR)
            .await
        {
            Ok(_) => {
                self.clear()?;
                info!("logged out");
                Ok(())
            }
            Err(e) => {
                self.set_state(previous);
                Err(e)
            }
        }
    }

    /// Revalidate the persisted session with the server.
    ///
    /// Returns `Ok(None)` when nothing is persisted.
    ///
    /// # Errors
    ///
    /// Any correlation error. On `Rejected` or `Timeout` the session is
    /// cleared before the error is returned.
    pub async fn check_auth(&self) -> Result<Option<Arc<Session>>, ProtocolError> {
        let _op = self.op_lock.lock().await;
        let Some(persisted) = read_persisted(self.store.as_ref())? else {
            self.clear()?;
            return Ok(None);
        };

        let previous = self.begin();
        let result = self
            .correlator
            .request(Frame::new(frame::CHECK_AUTH, persisted.id), frame::AUTH_SUCCESS, frame::AUTH_ERROR)
            .await;

        match result {
            Err(e @ (ProtocolError::Rejected { .. } | ProtocolError::Timeout { .. })) => {
                warn!(user_id = persisted.id, error = %e, "session revalidation failed; clearing session");
                self.clear()?;
                Err(e)
            }
            other => self
                .finish_auth(frame::CHECK_AUTH, other, previous)
                .await
                .map(Some),
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, SessionSlot> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, SessionSlot> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter Authenticating, returning the state to restore on failure.
    fn begin(&self) -> AuthState {
        let mut slot = self.write_slot();
        std::mem::replace(&mut slot.state, AuthState::Authenticating)
    }

    fn set_state(&self, state: AuthState) {
        self.write_slot().state = state;
    }

    async fn finish_auth(
        &self,
        operation: &str,
        result: Result<serde_json::Value, ProtocolError>,
        previous: AuthState,
    ) -> Result<Arc<Session>, ProtocolError> {
        let session = match result.and_then(|data| decode::<AuthSuccess>(frame::AUTH_SUCCESS, data)) {
            Ok(success) => Arc::new(success.user),
            Err(e) => {
                self.set_state(previous);
                return Err(e);
            }
        };

        if let Err(e) = self.store_session(&session) {
            self.set_state(previous);
            return Err(e);
        }
        info!(operation, user_id = session.id, "authenticated");

        // Scope pushes on this connection to the user.
        if let Err(e) = self
            .correlator
            .emit(Frame::new(frame::AUTH, json!(session.id)))
            .await
        {
            warn!(user_id = session.id, error = %e, "failed to authenticate connection");
        }
        Ok(session)
    }

    fn store_session(&self, session: &Arc<Session>) -> Result<(), ProtocolError> {
        let encoded = serde_json::to_string(session.as_ref())
            .map_err(|source| ProtocolError::Decode { event: SESSION_KEY.into(), source })?;
        let mut slot = self.write_slot();
        self.store.set(SESSION_KEY, &encoded)?;
        slot.session = Some(Arc::clone(session));
        slot.state = AuthState::Authenticated;
        Ok(())
    }

    fn clear(&self) -> Result<(), ProtocolError> {
        let mut slot = self.write_slot();
        self.store.remove(SESSION_KEY)?;
        slot.session = None;
        slot.state = AuthState::Anonymous;
        Ok(())
    }
}

fn read_persisted(store: &dyn KeyValueStore) -> Result<Option<Session>, ProtocolError> {
    let Some(raw) = store.get(SESSION_KEY)? else {
        return Ok(None);
    };
    match serde_json::from_str::<Session>(&raw) {
        Ok(session) => Ok(Some(session)),
        Err(e) => {
            warn!(error = %e, "discarding unreadable persisted session");
            store.remove(SESSION_KEY)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
