//! Duplex connection to the remote conversational endpoint
//!
//! A connection is split into three handles:
//! - `TransportSink`: fire-and-forget outbound media, cloneable for producers
//! - an event receiver yielding `opened`, `message`, `error`, `closed`
//! - a `CloseHandle` that tears the connection down
//!
//! Every connection attempt builds a fresh `TransportConnection`; a failed one
//! is never reused.

pub mod messages;
pub mod websocket;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub use messages::{ClientMessage, ServerMessage, IMAGE_MIME, INPUT_AUDIO_MIME};
pub use websocket::WebSocketConnector;

/// Event observed on a connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Opened,
    Message(ServerMessage),
    Error(String),
    Closed(Option<String>),
}

/// Outbound half of a connection
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::Sender<ClientMessage>,
}

impl TransportSink {
    /// Queue a message without waiting.
    ///
    /// Returns false if the message was dropped because the connection is
    /// closed or its outbound buffer is full. Delivery is never confirmed.
    pub fn send(&self, message: ClientMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                debug!("Outbound buffer full, dropping {} message", msg.mime_type());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Tears down the connection it belongs to
#[derive(Debug)]
pub struct CloseHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CloseHandle {
    pub fn close(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A single connection attempt
pub struct TransportConnection {
    pub sink: TransportSink,
    pub events: mpsc::Receiver<TransportEvent>,
    pub closer: CloseHandle,
}

/// Remote-facing half of a `TransportConnection`, driven by a connector
pub struct TransportPeer {
    /// Messages queued by producers
    pub outbound: mpsc::Receiver<ClientMessage>,
    /// Events for the session
    pub events: mpsc::Sender<TransportEvent>,
    /// Resolves when the session closes the connection (or drops it)
    pub shutdown: oneshot::Receiver<()>,
}

impl TransportPeer {
    pub async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Transport event dropped: session no longer listening");
        }
    }
}

impl TransportConnection {
    /// Build a connection and the peer that drives it
    pub fn pair(buffer: usize) -> (TransportConnection, TransportPeer) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (ev_tx, ev_rx) = mpsc::channel(buffer);
        let (close_tx, close_rx) = oneshot::channel();

        (
            TransportConnection {
                sink: TransportSink { tx: out_tx },
                events: ev_rx,
                closer: CloseHandle { tx: Some(close_tx) },
            },
            TransportPeer {
                outbound: out_rx,
                events: ev_tx,
                shutdown: close_rx,
            },
        )
    }
}

/// Opens connections to the remote endpoint
#[async_trait::async_trait]
pub trait TransportConnector: Send + Sync {
    /// Start opening a connection authorized by `credential`.
    ///
    /// Returns as soon as the attempt is underway; `Opened` (or `Error`)
    /// arrives on the event channel.
    async fn connect(&self, credential: &str) -> Result<TransportConnection>;
}
