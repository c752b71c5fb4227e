//! Correlation — request/response on top of the shared connection.
//!
//! DESIGN
//! ======
//! `correlate` obtains a ready connection, registers one listener pair
//! (success event, error event), writes the request, and races the reply
//! against a timer. The first of {success, error, timeout} decides the
//! outcome. The listener pair is one table entry, removed atomically by
//! whichever reply arrives; timeout and every other exit path release it
//! through a drop guard, so a late server event finds nothing to resolve.
//!
//! This is the only place where event-name plumbing and listener cleanup
//! live. Session and messaging code call `request` / `request_matching`.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionError, ConnectionManager, CorrelationId, Matcher, Reply};
use crate::frame::Frame;
use crate::storage::StoreError;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

// =============================================================================
// ERRORS
// =============================================================================

/// Grepable error code and retryable flag for surfacing errors to callers.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Never reached Connected, or the link dropped mid-request.
    #[error("cannot reach server: {0}")]
    ConnectionFailure(#[from] ConnectionError),
    #[error("server did not respond in time")]
    Timeout { event: String },
    /// The server answered with an error event; message is verbatim.
    #[error("{message}")]
    Rejected { message: String },
    /// Local validation; never reaches the network.
    #[error("{0}")]
    Validation(String),
    #[error("unexpected payload for {event}: {source}")]
    Decode {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("session storage failed: {0}")]
    Storage(#[from] StoreError),
    #[error("not authenticated")]
    NotAuthenticated,
}

impl ErrorCode for ProtocolError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailure(_) => "E_CONNECTION",
            Self::Timeout { .. } => "E_TIMEOUT",
            Self::Rejected { .. } => "E_REJECTED",
            Self::Validation(_) => "E_VALIDATION",
            Self::Decode { .. } => "E_DECODE",
            Self::Storage(_) => "E_STORAGE",
            Self::NotAuthenticated => "E_NOT_AUTHENTICATED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailure(_) | Self::Timeout { .. })
    }
}

/// Decode a reply payload into a typed value.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] naming the event on shape mismatch.
pub fn decode<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::Decode { event: event.to_owned(), source })
}

// =============================================================================
// CORRELATOR
// =============================================================================

/// Releases a correlation on every exit path. No-op once it was settled.
struct PendingGuard<'a> {
    connection: &'a Connection,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.connection.release(self.id);
    }
}

#[derive(Clone)]
pub struct Correlator {
    manager: ConnectionManager,
    timeout: Duration,
}

impl Correlator {
    #[must_use]
    pub fn new(manager: ConnectionManager, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` and wait for `success_event` or `error_event`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::ConnectionFailure`] if no link could be obtained or
    ///   it closed before a reply.
    /// - [`ProtocolError::Rejected`] with the server's message on `error_event`.
    /// - [`ProtocolError::Timeout`] if neither event arrived within `timeout`.
    pub async fn correlate(
        &self,
        request: Frame,
        success_event: &str,
        error_event: &str,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        self.run(request, success_event, error_event, timeout, None)
            .await
    }

    /// Like [`Correlator::correlate`], but only replies whose payload passes
    /// `matcher` settle the call. Others are left for other listeners.
    ///
    /// # Errors
    ///
    /// Same as [`Correlator::correlate`].
    pub async fn correlate_matching(
        &self,
        request: Frame,
        success_event: &str,
        error_event: &str,
        timeout: Duration,
        matcher: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Result<Value, ProtocolError> {
        self.run(request, success_event, error_event, timeout, Some(Box::new(matcher)))
            .await
    }

    /// [`Correlator::correlate`] with the configured timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Correlator::correlate`].
    pub async fn request(&self, request: Frame, success_event: &str, error_event: &str) -> Result<Value, ProtocolError> {
        self.correlate(request, success_event, error_event, self.timeout)
            .await
    }

    /// [`Correlator::correlate_matching`] with the configured timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Correlator::correlate`].
    pub async fn request_matching(
        &self,
        request: Frame,
        success_event: &str,
        error_event: &str,
        matcher: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Result<Value, ProtocolError> {
        self.correlate_matching(request, success_event, error_event, self.timeout, matcher)
            .await
    }

    /// Fire-and-forget write on a ready connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ConnectionFailure`] if no link is available.
    pub async fn emit(&self, frame: Frame) -> Result<(), ProtocolError> {
        let connection = self.manager.connect_and_wait().await?;
        connection.emit(frame)?;
        Ok(())
    }

    async fn run(
        &self,
        request: Frame,
        success_event: &str,
        error_event: &str,
        timeout: Duration,
        matcher: Option<Matcher>,
    ) -> Result<Value, ProtocolError> {
        let connection = self.manager.connect_and_wait().await?;
        let (id, rx) = connection.register(success_event, error_event, matcher)?;
        let _guard = PendingGuard { connection: &connection, id };

        let request_event = request.event.clone();
        connection.emit(request)?;
        debug!(request = %request_event, success_event, error_event, "correlation started");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Reply::Success(data))) => Ok(data),
            Ok(Ok(Reply::Error(data))) => {
                let message = data
                    .get(crate::frame::FRAME_MESSAGE)
                    .and_then(Value::as_str)
                    .map_or_else(|| format!("{request_event} rejected by server"), ToOwned::to_owned);
                debug!(request = %request_event, %message, "correlation rejected");
                Err(ProtocolError::Rejected { message })
            }
            Ok(Err(_)) => Err(ProtocolError::ConnectionFailure(ConnectionError::Closed)),
            Err(_) => {
                warn!(request = %request_event, timeout_ms = timeout.as_millis(), "correlation timed out");
                Err(ProtocolError::Timeout { event: request_event })
            }
        }
    }
}

#[cfg(test)]
#[path = "correlation_test.rs"]
mod tests;
