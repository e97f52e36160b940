use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::events::StatusMessage;

/// Login id the back-end (and the cached profile) uses when none is known.
pub const PLACEHOLDER_LOGIN_ID: &str = "---";

// ---------------------------------------------------------------------------
// Connection / Auth / Copy lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of the single transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Progress of the authorization handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authorizing,
    Authorized,
    AuthFailed,
}

/// State of the mirroring relationship to a trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyState {
    Idle,
    Starting,
    Copying,
    Stopping,
    StopFailed,
    StartFailed,
}

impl CopyState {
    /// Whether the UI should treat the session as mirroring a trader.
    ///
    /// A failed stop leaves the relationship in place until a retry succeeds.
    pub fn is_copying(&self) -> bool {
        matches!(
            self,
            CopyState::Copying | CopyState::Stopping | CopyState::StopFailed
        )
    }

    /// A start or stop command is outstanding.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CopyState::Starting | CopyState::Stopping)
    }
}

/// Coarse status a view renders (badge, header, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Authorizing,
    Ready,
    Copying,
    Error,
}

/// What the single start/stop button should offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyControl {
    Start,
    Stop,
    Disabled,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Locally unique identifier attached to an outbound request as `req_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a request that expects a correlated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Authorize,
    BalanceSubscribe,
    CopyStart,
    CopyStop,
}

impl RequestKind {
    /// The `msg_type` tag the back-end puts on the matching response.
    pub fn msg_type(&self) -> &'static str {
        match self {
            RequestKind::Authorize => "authorize",
            RequestKind::BalanceSubscribe => "balance",
            RequestKind::CopyStart => "copy_start",
            RequestKind::CopyStop => "copy_stop",
        }
    }

    pub fn from_msg_type(msg_type: &str) -> Option<Self> {
        match msg_type {
            "authorize" => Some(RequestKind::Authorize),
            "balance" => Some(RequestKind::BalanceSubscribe),
            "copy_start" => Some(RequestKind::CopyStart),
            "copy_stop" => Some(RequestKind::CopyStop),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.msg_type())
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Account balance as last reported by the back-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub amount: Decimal,
    pub currency: String,
}

impl Balance {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.amount.round_dp(2), self.currency)
    }
}

/// Profile fields cached in the credential store between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProfile {
    pub login_id: Option<String>,
    pub display_name: Option<String>,
    pub balance: Option<Balance>,
    pub is_virtual: bool,
}

/// Returns the login id unless it is missing or the `---` placeholder.
pub fn known_login_id(login_id: Option<&str>) -> Option<&str> {
    login_id.filter(|id| !id.is_empty() && *id != PLACEHOLDER_LOGIN_ID)
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Everything a view needs to render the session, published after every
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub connection: ConnectionState,
    pub auth: AuthState,
    pub copy: CopyState,
    pub status: SessionStatus,
    pub control: CopyControl,
    pub login_id: Option<String>,
    pub display_name: Option<String>,
    pub balance: Option<Balance>,
    pub is_virtual: bool,
    /// True until the first balance frame arrives (or no token is present).
    pub loading: bool,
    /// Heartbeat-driven approximation, not a count of real copied trades.
    pub copied_trades_estimate: u64,
    pub notice: Option<StatusMessage>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Initials for the avatar badge, `---` when the name is unknown.
    pub fn initials(&self) -> String {
        match self.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() && name != PLACEHOLDER_LOGIN_ID => name
                .split_whitespace()
                .filter_map(|part| part.chars().next())
                .flat_map(char::to_uppercase)
                .collect(),
            _ => PLACEHOLDER_LOGIN_ID.to_string(),
        }
    }
}
