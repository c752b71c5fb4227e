//! Transport — the duplex, message-based pipe under the connection manager.
//!
//! DESIGN
//! ======
//! A `Connector` opens one physical link and hands back a pair of channels:
//! frames pushed into `outbound` are written to the server, frames read from
//! the server arrive on `inbound`. Closing is signalled by dropping: dropping
//! `outbound` closes the link, and `inbound` yielding `None` means the server
//! side went away. The manager never sees sockets, only this pair.

pub mod ws;

use tokio::sync::mpsc;

use crate::frame::Frame;

pub use ws::WsConnector;

/// An open link to the server.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport closed")]
    Closed,
}

/// Opens physical links. One call = one transport-open attempt.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportLink, TransportError>;
}

// =============================================================================
// TEST HELPERS
// =============================================================================
