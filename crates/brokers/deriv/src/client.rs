use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use tradesync_core::*;

/// Connection settings for the Deriv WebSocket API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivConfig {
    /// WebSocket endpoint without the query string.
    pub endpoint: String,
    /// Registered application id.
    pub app_id: u32,
}

impl Default for DerivConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://ws.derivws.com/websockets/v3".to_string(),
            app_id: 70344,
        }
    }
}

impl DerivConfig {
    pub fn url(&self) -> String {
        format!("{}?app_id={}", self.endpoint, self.app_id)
    }
}

enum Outbound {
    Frame(String),
    Close,
}

/// Opens WebSocket connections on the current tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct DerivConnector;

impl DerivConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for DerivConnector {
    fn open(&self, url: &str) -> Connection {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let task = tokio::spawn(run_socket(url.to_string(), outbound_rx, event_tx, state_tx));

        Connection {
            transport: Box::new(WsTransport {
                outbound: outbound_tx,
                state: state_rx,
                task: Some(task),
            }),
            events: event_rx,
        }
    }
}

/// Handle to a socket driven by a background task.
///
/// Dropping the handle closes the socket.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl Transport for WsTransport {
    fn state(&self) -> ConnectionState {
        if self.task.is_none() {
            return ConnectionState::Closed;
        }
        *self.state.borrow()
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(TransportError::NotReady(state));
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::NotReady(ConnectionState::Closed))
    }

    fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let connecting = *self.state.borrow() == ConnectionState::Connecting;
        // An open socket gets a close frame; a pending handshake is abandoned.
        if connecting || self.outbound.send(Outbound::Close).is_err() {
            task.abort();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_socket(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
) {
    info!(url = %url, "Connecting to WebSocket");

    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "WebSocket connection failed");
            let _ = state.send(ConnectionState::Closed);
            let _ = events.send(TransportEvent::Error(format!("Connection failed: {}", e)));
            return;
        }
    };

    let _ = state.send(ConnectionState::Open);
    let _ = events.send(TransportEvent::Opened);
    info!("WebSocket connection established");

    let (mut write, mut read) = ws_stream.split();

    let terminal = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break TransportEvent::Error(format!("Write error: {}", e));
                    }
                }
                // Explicit close, or the handle was dropped.
                Some(Outbound::Close) | None => {
                    let _ = state.send(ConnectionState::Closed);
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    debug!("WebSocket closed by client");
                    break TransportEvent::Closed {
                        reason: Some("closed by client".to_string()),
                    };
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text.to_string()));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                    Err(_) => debug!(len = bytes.len(), "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break TransportEvent::Closed {
                        reason: frame.map(|f| f.reason.to_string()),
                    };
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => break TransportEvent::Error(format!("Read error: {}", e)),
                None => break TransportEvent::Closed { reason: None },
            },
        }
    };

    let _ = state.send(ConnectionState::Closed);
    if let TransportEvent::Error(ref message) = terminal {
        warn!(error = %message, "WebSocket terminated with error");
    }
    let _ = events.send(terminal);
}
