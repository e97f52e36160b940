use crate::events::*;
use crate::models::*;
use tokio::sync::{broadcast, mpsc};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Errors that can occur while talking to the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection not ready ({0:?})")]
    NotReady(ConnectionState),
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Transport error: {0}")]
    Other(String),
}

/// The sending half of one duplex, message-based connection.
///
/// Implementations own the network resource and must release it when dropped,
/// whether or not `close` was called.
pub trait Transport: Send {
    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Queue a text frame. Fails with `NotReady` unless the connection is open.
    fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// A freshly opened connection: the transport handle plus its event stream.
pub struct Connection {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections. `open` returns immediately in the `Connecting` state;
/// the outcome arrives on the event stream.
pub trait Connector: Send + Sync {
    fn open(&self, url: &str) -> Connection;
}

// ---------------------------------------------------------------------------
// Credential store
// ---------------------------------------------------------------------------

/// Keys used in the credential store.
pub mod keys {
    pub const ACTIVE_TOKEN: &str = "activeToken";
    pub const ACTIVE_LOGIN_ID: &str = "active_loginid";
    pub const NAME: &str = "name";
    pub const BALANCE: &str = "balance";
    pub const CURRENCY: &str = "currency";
    pub const IS_VIRTUAL: &str = "is_virtual";
}

/// Errors from the credential store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed store file: {0}")]
    Format(#[from] serde_json::Error),
}

/// A single write to the store. `value` is `None` when the key was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub value: Option<String>,
}

/// Host key-value persistence holding the access token and cached profile.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    /// Subscribe to every subsequent `set`/`remove`.
    fn on_change(&self) -> broadcast::Receiver<StoreChange>;

    /// The long-lived access token, if the user is logged in.
    fn active_token(&self) -> Option<String> {
        self.get(keys::ACTIVE_TOKEN).filter(|t| !t.trim().is_empty())
    }

    /// Profile fields cached by a previous session.
    fn cached_profile(&self) -> CachedProfile {
        let balance = self
            .get(keys::BALANCE)
            .and_then(|raw| parse_cached_balance(&raw, self.get(keys::CURRENCY)));
        CachedProfile {
            login_id: self.get(keys::ACTIVE_LOGIN_ID),
            display_name: self.get(keys::NAME),
            balance,
            is_virtual: self.get(keys::IS_VIRTUAL).as_deref() == Some("true"),
        }
    }
}

/// Accepts either a bare amount (`"100.5"`) or the rendered form
/// (`"100.50 USD"`).
fn parse_cached_balance(raw: &str, currency: Option<String>) -> Option<Balance> {
    let mut parts = raw.split_whitespace();
    let amount = parts.next()?.parse().ok()?;
    let currency = parts
        .next()
        .map(str::to_string)
        .or(currency)
        .unwrap_or_default();
    Some(Balance::new(amount, currency))
}
