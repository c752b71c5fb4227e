//! Realtime messenger client: one shared connection, correlated requests,
//! session handling and a client-side model of conversations and messages.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! transport (Connector) -> connection (ConnectionManager) -> correlation (Correlator)
//!                                                            |-> session (SessionProtocol)
//!                                                            `-> messenger (MessagingStore)
//! ```
//! `client::Client` wires all of them around a single manager.

pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod frame;
pub mod messenger;
pub mod session;
pub mod storage;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use correlation::{ErrorCode, ProtocolError};
pub use frame::Frame;
