//! Client — one connection shared by the session and messaging protocols.
//!
//! LIFECYCLE
//! =========
//! `Client::new` builds the manager, correlator, session and messaging store
//! around a single `ConnectionManager`, then starts the push listener. No
//! connection is opened until the first request. `shutdown` (or drop) stops
//! the listener; `shutdown` also closes the link.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::correlation::{Correlator, ProtocolError};
use crate::frame::Frame;
use crate::messenger::{MessagingStore, spawn_push_listener};
use crate::session::{Session, SessionProtocol};
use crate::storage::{FileStore, KeyValueStore};
use crate::transport::{Connector, WsConnector};

pub struct Client {
    config: ClientConfig,
    manager: ConnectionManager,
    session: Arc<SessionProtocol>,
    messenger: Arc<MessagingStore>,
    push_task: JoinHandle<()>,
}

impl Client {
    /// Wire the protocols around `connector`. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Storage`] if the persisted session cannot be read.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ProtocolError> {
        let manager = ConnectionManager::new(connector, config.connect_attempts, config.retry_delay);
        let correlator = Correlator::new(manager.clone(), config.request_timeout);
        let session = Arc::new(SessionProtocol::new(correlator.clone(), store)?);
        let messenger = Arc::new(MessagingStore::new(correlator, Arc::clone(&session)));
        let push_task = spawn_push_listener(Arc::clone(&messenger), manager.subscribe());
        Ok(Self { config, manager, session, messenger, push_task })
    }

    /// Websocket transport and file-backed session storage, as configured.
    ///
    /// # Errors
    ///
    /// Same as [`Client::new`].
    pub fn from_config(config: ClientConfig) -> Result<Self, ProtocolError> {
        let connector = Arc::new(WsConnector::new(config.server_url.clone()));
        let store = Arc::new(FileStore::new(config.session_path.clone()));
        info!(url = %config.server_url, session_path = %config.session_path.display(), "client configured");
        Self::new(config, connector, store)
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionProtocol> {
        &self.session
    }

    #[must_use]
    pub fn messenger(&self) -> &Arc<MessagingStore> {
        &self.messenger
    }

    /// Every frame the server sends, including replies.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.manager.subscribe()
    }

    /// Log in, dropping messaging state that belonged to a different user.
    ///
    /// # Errors
    ///
    /// Same as [`SessionProtocol::login`].
    pub async fn login(&self, email: &str, password: &str) -> Result<Arc<Session>, ProtocolError> {
        let previous = self.session.user_id();
        let session = self.session.login(email, password).await?;
        if previous != Some(session.id) {
            self.messenger.reset();
        }
        Ok(session)
    }

    /// Log out and clear messaging state.
    ///
    /// # Errors
    ///
    /// Same as [`SessionProtocol::logout`]; state is kept on failure.
    pub async fn logout(&self) -> Result<(), ProtocolError> {
        self.session.logout().await?;
        self.messenger.reset();
        Ok(())
    }

    /// Stop the push listener and close the connection.
    pub fn shutdown(&self) {
        self.push_task.abort();
        self.manager.disconnect();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.push_task.abort();
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
