//! Connection manager — one shared link to the server.
//!
//! ARCHITECTURE
//! ============
//! `ConnectionManager` owns the only transport link in the process and is the
//! sole writer of `ConnectionState`. Callers obtain a `Connection` handle via
//! `connect_and_wait`, which is idempotent: a live link is returned as-is,
//! and while an attempt sequence is running every caller awaits the same
//! shared future, so concurrent callers never open two links.
//!
//! LIFECYCLE
//! =========
//! Disconnected → Connecting → Connected → Disconnected (teardown or close)
//!                    ↓ (attempts exhausted)
//!                  Failed → Connecting (next explicit connect)
//!
//! Every lifecycle has a generation number. Attempt sequences and reader
//! tasks check it before touching state, so work belonging to a torn-down
//! lifecycle becomes a no-op.
//!
//! CORRELATION TABLE
//! =================
//! Each `Connection` carries the table of pending correlations. An inbound
//! frame resolves every entry listening for its event name (success or
//! error) and removes the entry in the same critical section, so the other
//! outcome can never fire afterwards. Closing the connection drops every
//! entry; the waiting side sees its oneshot sender vanish and reports a
//! connection failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::transport::{Connector, TransportLink};

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Capacity of the inbound-frame broadcast used by push subscribers.
const PUSH_CAPACITY: usize = 256;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Failure to obtain or keep a live link. `Clone` so one failed attempt
/// sequence can be delivered to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("gave up after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
    #[error("connection closed")]
    Closed,
    #[error("connection attempt abandoned by disconnect")]
    Aborted,
}

pub(crate) type CorrelationId = u64;

/// Predicate a reply payload must satisfy to settle a correlation.
pub(crate) type Matcher = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// How a pending correlation was settled by the server.
#[derive(Debug)]
pub(crate) enum Reply {
    Success(Value),
    Error(Value),
}

struct PendingCorrelation {
    success_event: String,
    error_event: String,
    matcher: Option<Matcher>,
    created_at: Instant,
    resolve: oneshot::Sender<Reply>,
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Handle to the live link. Cheap to clone; all clones share one link.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    id: Uuid,
    inner: Mutex<ConnectionInner>,
}

struct ConnectionInner {
    /// `None` once the connection is closed.
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    next_id: CorrelationId,
    pending: HashMap<CorrelationId, PendingCorrelation>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(outbound: mpsc::UnboundedSender<Frame>) -> Self {
        let inner = ConnectionInner { outbound: Some(outbound), next_id: 0, pending: HashMap::new() };
        Self { shared: Arc::new(ConnectionShared { id: Uuid::new_v4(), inner: Mutex::new(inner) }) }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock()
            .outbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Write a frame to the server without waiting for any reply.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the link is gone.
    pub fn emit(&self, frame: Frame) -> Result<(), ConnectionError> {
        let inner = self.lock();
        let Some(tx) = inner.outbound.as_ref() else {
            return Err(ConnectionError::Closed);
        };
        debug!(event = %frame.event, "emit");
        tx.send(frame).map_err(|_| ConnectionError::Closed)
    }

    /// Number of correlations still waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Register a one-shot listener pair. Fails if the link is already closed,
    /// so a registration can never outlive the table that would settle it.
    pub(crate) fn register(
        &self,
        success_event: &str,
        error_event: &str,
        matcher: Option<Matcher>,
    ) -> Result<(CorrelationId, oneshot::Receiver<Reply>), ConnectionError> {
        let mut inner = self.lock();
        if inner.outbound.is_none() {
            return Err(ConnectionError::Closed);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            id,
            PendingCorrelation {
                success_event: success_event.to_owned(),
                error_event: error_event.to_owned(),
                matcher,
                created_at: Instant::now(),
                resolve: tx,
            },
        );
        Ok((id, rx))
    }

    /// Drop a correlation if it is still pending. No-op once it was settled.
    pub(crate) fn release(&self, id: CorrelationId) {
        if let Some(entry) = self.lock().pending.remove(&id) {
            debug!(
                success_event = %entry.success_event,
                waited_ms = entry.created_at.elapsed().as_millis(),
                "correlation released unsettled"
            );
        }
    }

    /// Settle every pending correlation listening for this frame.
    /// Returns how many were settled.
    fn dispatch(&self, frame: &Frame) -> usize {
        let mut inner = self.lock();
        let settled: Vec<CorrelationId> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.success_event == frame.event || p.error_event == frame.event)
            .filter(|(_, p)| p.matcher.as_ref().is_none_or(|m| m(&frame.data)))
            .map(|(id, _)| *id)
            .collect();

        for id in &settled {
            let Some(entry) = inner.pending.remove(id) else {
                continue;
            };
            let reply = if entry.success_event == frame.event {
                Reply::Success(frame.data.clone())
            } else {
                Reply::Error(frame.data.clone())
            };
            // The waiter may already have timed out and gone; that is fine.
            let _ = entry.resolve.send(reply);
        }
        settled.len()
    }

    /// Close the link and fail every pending correlation.
    fn close(&self) {
        let mut inner = self.lock();
        inner.outbound = None;
        let dropped = inner.pending.len();
        inner.pending.clear();
        if dropped > 0 {
            warn!(connection_id = %self.shared.id, dropped, "connection closed with pending correlations");
        }
    }
}

// =============================================================================
// CONNECTION MANAGER
// =============================================================================

type AttemptFuture = Shared<BoxFuture<'static, Result<Connection, ConnectionError>>>;

/// Owner of the process-wide link. Construct once at startup and hand clones
/// to the protocols that need it.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    connector: Arc<dyn Connector>,
    max_attempts: u32,
    retry_delay: Duration,
    pushes: broadcast::Sender<Frame>,
    inner: Mutex<ManagerInner>,
}

struct ManagerInner {
    state: ConnectionState,
    generation: u64,
    connection: Option<Connection>,
    in_flight: Option<AttemptFuture>,
    reader: Option<JoinHandle<()>>,
}

impl ManagerShared {
    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, max_attempts: u32, retry_delay: Duration) -> Self {
        let (pushes, _) = broadcast::channel(PUSH_CAPACITY);
        let inner = ManagerInner {
            state: ConnectionState::Disconnected,
            generation: 0,
            connection: None,
            in_flight: None,
            reader: None,
        };
        Self {
            shared: Arc::new(ManagerShared {
                connector,
                max_attempts: max_attempts.max(1),
                retry_delay,
                pushes,
                inner: Mutex::new(inner),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.lock();
        inner.state == ConnectionState::Connected && inner.connection.as_ref().is_some_and(Connection::is_open)
    }

    /// Every inbound frame, across reconnects. Correlated replies are
    /// delivered here too, after the correlation table has seen them.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.shared.pushes.subscribe()
    }

    /// Return the live connection, joining or starting an attempt sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Exhausted`] when every attempt of the
    /// sequence failed, or [`ConnectionError::Aborted`] when `disconnect`
    /// ran while the sequence was in flight.
    pub async fn connect_and_wait(&self) -> Result<Connection, ConnectionError> {
        let attempt = {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Connected {
                if let Some(connection) = inner.connection.as_ref().filter(|c| c.is_open()) {
                    return Ok(connection.clone());
                }
            }
            if let Some(in_flight) = &inner.in_flight {
                debug!("joining connection attempt in progress");
                in_flight.clone()
            } else {
                // A link whose writer died still holds pending correlations
                // and a reader task; retire both before starting over.
                if let Some(reader) = inner.reader.take() {
                    reader.abort();
                }
                if let Some(stale) = inner.connection.take() {
                    debug!(connection_id = %stale.id(), "replacing dead connection");
                    stale.close();
                }
                inner.generation += 1;
                inner.state = ConnectionState::Connecting;
                let attempt = run_attempts(Arc::clone(&self.shared), inner.generation)
                    .boxed()
                    .shared();
                inner.in_flight = Some(attempt.clone());
                attempt
            }
        };
        attempt.await
    }

    /// Tear down the link, fail pending correlations, reset to Disconnected.
    /// Safe to call at any time.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        inner.in_flight = None;
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        if let Some(connection) = inner.connection.take() {
            connection.close();
        }
        if inner.state != ConnectionState::Disconnected {
            info!(previous = ?inner.state, "disconnected");
        }
        inner.state = ConnectionState::Disconnected;
    }
}

/// One bounded attempt sequence for lifecycle `generation`.
async fn run_attempts(shared: Arc<ManagerShared>, generation: u64) -> Result<Connection, ConnectionError> {
    let max_attempts = shared.max_attempts;
    let mut reason = String::new();

    for attempt in 1..=max_attempts {
        if !shared.is_current(generation) {
            return Err(ConnectionError::Aborted);
        }
        match shared.connector.connect().await {
            Ok(link) => return establish(&shared, generation, link),
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "connection attempt failed");
                reason = e.to_string();
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(shared.retry_delay).await;
        }
    }

    let mut inner = shared.lock();
    if inner.generation != generation {
        return Err(ConnectionError::Aborted);
    }
    inner.state = ConnectionState::Failed;
    inner.in_flight = None;
    warn!(attempts = max_attempts, "connection failed; attempts exhausted");
    Err(ConnectionError::Exhausted { attempts: max_attempts, reason })
}

fn establish(shared: &Arc<ManagerShared>, generation: u64, link: TransportLink) -> Result<Connection, ConnectionError> {
    let mut inner = shared.lock();
    if inner.generation != generation {
        // Dropping the link closes it.
        return Err(ConnectionError::Aborted);
    }
    let TransportLink { outbound, inbound } = link;
    let connection = Connection::new(outbound);
    let reader = spawn_reader(Arc::downgrade(shared), generation, connection.clone(), inbound);

    inner.state = ConnectionState::Connected;
    inner.connection = Some(connection.clone());
    inner.reader = Some(reader);
    inner.in_flight = None;
    info!(connection_id = %connection.id(), "connected");
    Ok(connection)
}

/// Route inbound frames until the transport closes, then retire the lifecycle.
fn spawn_reader(
    shared: Weak<ManagerShared>,
    generation: u64,
    connection: Connection,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            let settled = connection.dispatch(&frame);
            debug!(event = %frame.event, settled, "frame received");
            let Some(shared) = shared.upgrade() else {
                break;
            };
            // No subscribers is not an error.
            let _ = shared.pushes.send(frame);
        }

        connection.close();
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut inner = shared.lock();
        if inner.generation == generation && inner.state == ConnectionState::Connected {
            inner.state = ConnectionState::Disconnected;
            inner.connection = None;
            inner.reader = None;
            info!(connection_id = %connection.id(), "connection closed by transport");
        }
    })
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
