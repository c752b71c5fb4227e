//! Push listener — feeds unsolicited server events into the store.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::MessagingStore;
use crate::frame::Frame;

/// Apply every push event from `pushes` to `store` until the stream closes.
///
/// Replies to correlated requests pass through here too; `apply_push`
/// ignores events it does not own. When the receiver lags, the dropped
/// events are recovered with [`MessagingStore::resync`].
pub fn spawn_push_listener(store: Arc<MessagingStore>, mut pushes: broadcast::Receiver<Frame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match pushes.recv().await {
                Ok(frame) => {
                    if store.apply_push(&frame) {
                        debug!(event = %frame.event, "push applied");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push listener lagged; resyncing");
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        if let Err(err) = store.resync().await {
                            warn!(error = %err, "resync after lag failed");
                        }
                    });
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("push listener stopped");
    })
}
