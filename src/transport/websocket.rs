//! WebSocket connector for a live bidirectional endpoint.
//!
//! ## Protocol
//!
//! 1. **Connect**: open the socket with an `Authorization: Bearer` header
//! 2. **Setup**: send the setup frame, wait for `setupComplete`
//! 3. **Stream**: forward queued `realtimeInput` media, surface `serverContent`
//! 4. **Close**: on request, or when either side goes away
//!
//! Some endpoints deliver JSON in Binary frames, so Binary payloads starting
//! with `{` are parsed like Text frames.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::{ServerMessage, TransportConnection, TransportConnector, TransportEvent, TransportPeer};

/// Outbound queue depth per connection
const OUTBOUND_BUFFER: usize = 256;

pub struct WebSocketConnector {
    url: String,
    model: String,
    setup_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            setup_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Setup frame: audio responses with both transcriptions enabled
    pub fn setup_message(&self) -> serde_json::Value {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };

        serde_json::json!({
            "setup": {
                "model": model,
                "generationConfig": {
                    "responseModalities": ["AUDIO"]
                },
                "inputAudioTranscription": {},
                "outputAudioTranscription": {}
            }
        })
    }
}

#[async_trait::async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, credential: &str) -> Result<TransportConnection> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("Invalid endpoint URL")?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", credential))
                .context("Credential is not a valid header value")?,
        );

        let setup = serde_json::to_string(&self.setup_message())?;
        let (connection, peer) = TransportConnection::pair(OUTBOUND_BUFFER);

        tokio::spawn(run_socket(request, setup, self.setup_timeout, peer));

        Ok(connection)
    }
}

async fn run_socket(
    request: Request<()>,
    setup: String,
    setup_timeout: Duration,
    peer: TransportPeer,
) {
    let TransportPeer {
        mut outbound,
        events,
        mut shutdown,
    } = peer;

    info!(uri = %request.uri(), "Connecting to live endpoint");

    let connected = tokio::select! {
        _ = &mut shutdown => {
            debug!("Transport closed while connecting");
            return;
        }
        connected = tokio_tungstenite::connect_async(request) => connected,
    };

    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            emit(&events, TransportEvent::Error(format!("Failed to connect: {}", e))).await;
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = ws.split();

    if let Err(e) = ws_sink.send(WsMessage::Text(setup.into())).await {
        emit(&events, TransportEvent::Error(format!("Failed to send setup: {}", e))).await;
        return;
    }

    let handshake = tokio::time::timeout(setup_timeout, async {
        while let Some(frame) = ws_stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    if parse_frame(text.as_str().as_bytes()).is_some_and(|m| m.is_setup_complete()) {
                        return Ok(());
                    }
                }
                Ok(WsMessage::Binary(data)) => {
                    if parse_frame(&data).is_some_and(|m| m.is_setup_complete()) {
                        return Ok(());
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    return Err(format!("Closed before setup completed: {:?}", frame));
                }
                Ok(_) => {}
                Err(e) => return Err(format!("Socket error before setup completed: {}", e)),
            }
        }
        Err("Stream ended before setup completed".to_string())
    });

    let handshake = tokio::select! {
        _ = &mut shutdown => {
            debug!("Transport closed during setup");
            let _ = ws_sink.send(WsMessage::Close(None)).await;
            return;
        }
        handshake = handshake => handshake,
    };

    match handshake {
        Ok(Ok(())) => {
            info!("Live endpoint setup complete");
            emit(&events, TransportEvent::Opened).await;
        }
        Ok(Err(reason)) => {
            emit(&events, TransportEvent::Error(reason)).await;
            return;
        }
        Err(_) => {
            let secs = setup_timeout.as_secs();
            emit(
                &events,
                TransportEvent::Error(format!("Setup timed out after {}s", secs)),
            )
            .await;
            return;
        }
    }

    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Transport close requested");
                let _ = ws_sink.send(WsMessage::Close(None)).await;
                break;
            }
            queued = outbound.recv() => {
                let Some(message) = queued else {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(WsMessage::Text(json.into())).await {
                    emit(&events, TransportEvent::Error(format!("Send failed: {}", e))).await;
                    break;
                }
                sent += 1;
                if sent == 1 || sent % 100 == 0 {
                    debug!("Sent {} media messages", sent);
                }
            }
            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(message) = parse_frame(text.as_str().as_bytes()) {
                            emit(&events, TransportEvent::Message(message)).await;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if let Some(message) = parse_frame(&data) {
                            emit(&events, TransportEvent::Message(message)).await;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame.map(|f| format!("{} {}", f.code, f.reason));
                        emit(&events, TransportEvent::Closed(reason)).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        emit(&events, TransportEvent::Error(format!("Socket error: {}", e))).await;
                        break;
                    }
                    None => {
                        emit(&events, TransportEvent::Closed(None)).await;
                        break;
                    }
                }
            }
        }
    }

    debug!("Socket task finished after {} media messages", sent);
}

async fn emit(events: &tokio::sync::mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if events.send(event).await.is_err() {
        debug!("Transport event dropped: session no longer listening");
    }
}

fn parse_frame(payload: &[u8]) -> Option<ServerMessage> {
    if payload.first() != Some(&b'{') {
        debug!("Ignoring non-JSON frame ({} bytes)", payload.len());
        return None;
    }
    match ServerMessage::parse(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Failed to parse server message: {}", e);
            None
        }
    }
}
