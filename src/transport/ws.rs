//! WebSocket connector over `tokio-tungstenite`.
//!
//! Each frame is one JSON text message. Two tasks pump the socket: a writer
//! draining the outbound channel and a reader feeding the inbound channel.
//! The writer sends a close frame once the outbound sender is dropped.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{Connector, TransportError, TransportLink};
use crate::frame::{self, Frame};

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = frame::encode_frame(&frame);
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, event = %frame.event, "ws send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => match frame::decode_frame(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable ws frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "ws recv error");
                        break;
                    }
                }
            }
            debug!("ws reader finished");
        });

        Ok(TransportLink { outbound: out_tx, inbound: in_rx })
    }
}
