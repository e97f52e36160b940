use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use tradesync_core::*;

/// Canned account the loopback server answers with.
#[derive(Debug, Clone)]
pub struct LoopbackProfile {
    pub login_id: String,
    pub fullname: String,
    pub balance: Decimal,
    pub currency: String,
    pub is_virtual: bool,
    /// Value returned for `copy_start` / `copy_stop` (1 = success).
    pub copy_result: i64,
}

impl Default for LoopbackProfile {
    fn default() -> Self {
        Self {
            login_id: "VRTC1000001".to_string(),
            fullname: "Demo Trader".to_string(),
            balance: Decimal::new(10_000, 0),
            currency: "USD".to_string(),
            is_virtual: true,
            copy_result: 1,
        }
    }
}

/// Configuration for the simulated transport.
#[derive(Debug, Clone, Default)]
pub struct SimulatedConfig {
    /// Report the connection as open as soon as it is requested.
    pub auto_open: bool,
    /// Answer every request like a healthy back-end would.
    pub loopback: Option<LoopbackProfile>,
}

impl SimulatedConfig {
    /// Auto-opening, self-answering transport for offline runs.
    pub fn loopback(profile: LoopbackProfile) -> Self {
        Self {
            auto_open: true,
            loopback: Some(profile),
        }
    }
}

#[derive(Debug)]
struct Link {
    state: ConnectionState,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    sent: Vec<String>,
    urls: Vec<String>,
    closed_by_client: bool,
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Link {
    fn emit(&mut self, event: TransportEvent) {
        if event.is_terminal() {
            self.state = ConnectionState::Closed;
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// An in-memory connector.
///
/// Every connection it opens shares one link with the [`SimulatedServer`]
/// returned alongside it, which plays the back-end side.
pub struct SimulatedConnector {
    config: SimulatedConfig,
    link: Arc<Mutex<Link>>,
}

impl SimulatedConnector {
    pub fn new(config: SimulatedConfig) -> (Self, SimulatedServer) {
        let link = Arc::new(Mutex::new(Link {
            state: ConnectionState::Closed,
            events: None,
            sent: Vec::new(),
            urls: Vec::new(),
            closed_by_client: false,
        }));
        (
            Self {
                config,
                link: link.clone(),
            },
            SimulatedServer { link },
        )
    }
}

impl Connector for SimulatedConnector {
    fn open(&self, url: &str) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut link = lock(&self.link);
            link.urls.push(url.to_string());
            link.events = Some(tx);
            link.state = ConnectionState::Connecting;
            link.closed_by_client = false;
            if self.config.auto_open {
                link.state = ConnectionState::Open;
                link.emit(TransportEvent::Opened);
            }
        }
        debug!(url, "Simulated connection requested");

        Connection {
            transport: Box::new(SimulatedTransport {
                link: self.link.clone(),
                loopback: self.config.loopback.clone(),
                released: false,
            }),
            events: rx,
        }
    }
}

struct SimulatedTransport {
    link: Arc<Mutex<Link>>,
    loopback: Option<LoopbackProfile>,
    released: bool,
}

impl Transport for SimulatedTransport {
    fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let mut link = lock(&self.link);
        if link.state != ConnectionState::Open {
            return Err(TransportError::NotReady(link.state));
        }
        if let Some(profile) = &self.loopback {
            if let Some(reply) = loopback_reply(profile, &frame) {
                link.emit(TransportEvent::Message(reply.to_string()));
            }
        }
        link.sent.push(frame);
        Ok(())
    }

    fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut link = lock(&self.link);
        if link.state != ConnectionState::Closed {
            link.closed_by_client = true;
            link.state = ConnectionState::Closed;
        }
        // Nothing is delivered after the client hangs up.
        link.events = None;
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn loopback_reply(profile: &LoopbackProfile, frame: &str) -> Option<Value> {
    let request: Value = serde_json::from_str(frame).ok()?;
    let req_id = request.get("req_id").cloned().unwrap_or(Value::Null);

    if request.get("authorize").is_some() {
        Some(json!({
            "msg_type": "authorize",
            "req_id": req_id,
            "authorize": {
                "loginid": profile.login_id,
                "fullname": profile.fullname,
                "currency": profile.currency,
                "is_virtual": u8::from(profile.is_virtual),
            },
        }))
    } else if request.get("balance").is_some() {
        Some(json!({
            "msg_type": "balance",
            "req_id": req_id,
            "balance": {
                "balance": profile.balance,
                "currency": profile.currency,
                "loginid": profile.login_id,
            },
            "subscription": { "id": "loopback-balance" },
        }))
    } else if request.get("copy_start").is_some() {
        Some(json!({
            "msg_type": "copy_start",
            "req_id": req_id,
            "copy_start": profile.copy_result,
        }))
    } else if request.get("copy_stop").is_some() {
        Some(json!({
            "msg_type": "copy_stop",
            "req_id": req_id,
            "copy_stop": profile.copy_result,
        }))
    } else {
        None
    }
}

/// The back-end side of a simulated connection.
#[derive(Clone)]
pub struct SimulatedServer {
    link: Arc<Mutex<Link>>,
}

impl SimulatedServer {
    /// Complete the handshake.
    pub fn accept(&self) {
        let mut link = lock(&self.link);
        if link.state == ConnectionState::Connecting {
            link.state = ConnectionState::Open;
            link.emit(TransportEvent::Opened);
        }
    }

    /// Deliver a JSON frame to the client.
    pub fn push(&self, frame: Value) {
        self.push_text(frame.to_string());
    }

    pub fn push_text(&self, text: impl Into<String>) {
        lock(&self.link).emit(TransportEvent::Message(text.into()));
    }

    /// Hang up from the server side.
    pub fn close(&self, reason: Option<&str>) {
        lock(&self.link).emit(TransportEvent::Closed {
            reason: reason.map(str::to_string),
        });
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, message: &str) {
        lock(&self.link).emit(TransportEvent::Error(message.to_string()));
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    /// Every frame the client has sent, parsed as JSON.
    pub fn sent(&self) -> Vec<Value> {
        lock(&self.link)
            .sent
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Sent frames that carry `key` (e.g. `"copy_start"`).
    pub fn sent_with(&self, key: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|f| f.get(key).is_some())
            .collect()
    }

    /// `req_id` of the most recent frame carrying `key`.
    pub fn last_req_id(&self, key: &str) -> Option<u64> {
        self.sent_with(key)
            .last()
            .and_then(|f| f.get("req_id"))
            .and_then(Value::as_u64)
    }

    /// URLs of every connection requested so far.
    pub fn urls(&self) -> Vec<String> {
        lock(&self.link).urls.clone()
    }

    pub fn closed_by_client(&self) -> bool {
        lock(&self.link).closed_by_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_requires_accept() {
        let (connector, server) = SimulatedConnector::new(SimulatedConfig::default());
        let mut conn = connector.open("sim://one");
        assert_eq!(
            conn.transport.send("{}".to_string()),
            Err(TransportError::NotReady(ConnectionState::Connecting))
        );

        server.accept();
        assert_eq!(conn.events.try_recv().unwrap(), TransportEvent::Opened);
        conn.transport.send(r#"{"ping":1}"#.to_string()).unwrap();
        assert_eq!(server.sent_with("ping").len(), 1);
        assert_eq!(server.urls(), vec!["sim://one".to_string()]);
    }

    #[test]
    fn test_loopback_answers_with_matching_req_id() {
        let (connector, server) =
            SimulatedConnector::new(SimulatedConfig::loopback(LoopbackProfile::default()));
        let mut conn = connector.open("sim://loop");
        assert_eq!(conn.events.try_recv().unwrap(), TransportEvent::Opened);

        conn.transport
            .send(r#"{"copy_start":"abcdefghijklmnop","req_id":7}"#.to_string())
            .unwrap();
        match conn.events.try_recv().unwrap() {
            TransportEvent::Message(text) => {
                let reply: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(reply["msg_type"], "copy_start");
                assert_eq!(reply["req_id"], 7);
                assert_eq!(reply["copy_start"], 1);
            }
            other => panic!("Expected reply, got {other:?}"),
        }
        assert_eq!(server.last_req_id("copy_start"), Some(7));
    }

    #[test]
    fn test_drop_releases_connection() {
        let (connector, server) = SimulatedConnector::new(SimulatedConfig::default());
        let conn = connector.open("sim://drop");
        server.accept();
        drop(conn);
        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(server.closed_by_client());
    }

    #[test]
    fn test_server_close_is_terminal() {
        let (connector, server) = SimulatedConnector::new(SimulatedConfig::default());
        let mut conn = connector.open("sim://close");
        server.accept();
        server.close(Some("maintenance"));
        assert_eq!(conn.events.try_recv().unwrap(), TransportEvent::Opened);
        assert_eq!(
            conn.events.try_recv().unwrap(),
            TransportEvent::Closed {
                reason: Some("maintenance".to_string())
            }
        );
        assert_eq!(conn.transport.state(), ConnectionState::Closed);
    }
}
