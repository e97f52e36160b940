use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tradesync_brokers_deriv::{
    AuthorizeInfo, BalanceUpdate, DerivConfig, InboundFrame, Payload, Request,
};
use tradesync_core::*;
use uuid::Uuid;

use crate::correlator::{Correlator, PendingRequest, Resolution};
use crate::notifier::StatusNotifier;
use crate::ticker::CopyTicker;

pub const MSG_COPY_STARTED: &str = "Copy trading started successfully";
pub const MSG_COPY_START_FAILED: &str = "Failed to start copy trading";
pub const MSG_COPY_STOPPED: &str = "Copy trading stopped successfully";
pub const MSG_COPY_STOP_FAILED: &str = "Failed to stop copy trading";
pub const MSG_LOGIN_FIRST: &str = "Please login first";
pub const MSG_NOT_READY: &str = "Connection not ready. Please try again.";
pub const MSG_CONNECTION_ERROR: &str = "Connection error. Please refresh the page.";

/// Session tuning. Durations are whole seconds so they read naturally in TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Full WebSocket URL including the `app_id` query.
    pub url: String,
    pub status_ttl_secs: u64,
    pub copy_tick_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DerivConfig::default().url(),
            status_ttl_secs: 3,
            copy_tick_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs.max(1))
    }

    pub fn copy_tick(&self) -> Duration {
        Duration::from_secs(self.copy_tick_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Why a session operation did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Connection not ready ({0:?})")]
    TransportUnavailable(ConnectionState),
    #[error("{kind} rejected: {message}")]
    RemoteError { kind: RequestKind, message: String },
    #[error(transparent)]
    Validation(#[from] TokenError),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("{kind} request timed out")]
    Timeout { kind: RequestKind },
    #[error("Unexpected {kind} response")]
    UnexpectedResponse { kind: RequestKind },
    #[error("Please login first")]
    NotAuthorized,
    #[error("A copy command is already in flight")]
    Busy,
    #[error("Not allowed while copy state is {0:?}")]
    InvalidState(CopyState),
    #[error(transparent)]
    Transport(TransportError),
    #[error("Session has shut down")]
    Closed,
}

/// How a start or stop command that was sent finally ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub request: RequestId,
    pub kind: RequestKind,
    /// The copy state the answer led to, or why no answer will come.
    pub result: Result<CopyState, SessionError>,
}

/// One user's copy-trading session over a single connection.
///
/// Synchronous: every entry point takes the current time and returns
/// immediately. The caller feeds transport events in and wakes the session at
/// [`Session::next_deadline`].
pub struct Session {
    id: Uuid,
    transport: Option<Box<dyn Transport>>,
    connection: ConnectionState,
    connection_error: bool,
    access_token: Option<String>,
    auth: AuthState,
    copy: CopyState,
    trader_token: Option<TraderToken>,
    login_id: Option<String>,
    display_name: Option<String>,
    balance: Option<Balance>,
    is_virtual: bool,
    loading: bool,
    correlator: Correlator,
    notifier: StatusNotifier,
    ticker: CopyTicker,
}

impl Session {
    /// Read the token and cached profile, and open the connection if logged in.
    ///
    /// Returns the connection's event stream, which the caller must feed back
    /// through [`Session::handle_transport_event`].
    pub fn mount(
        config: &SessionConfig,
        store: &dyn CredentialStore,
        connector: &dyn Connector,
        now: Instant,
    ) -> (Self, Option<mpsc::UnboundedReceiver<TransportEvent>>) {
        let cached = store.cached_profile();
        let access_token = store.active_token();

        let mut session = Self {
            id: Uuid::new_v4(),
            transport: None,
            connection: ConnectionState::Closed,
            connection_error: false,
            access_token,
            auth: AuthState::Unauthenticated,
            copy: CopyState::Idle,
            trader_token: None,
            login_id: cached.login_id,
            display_name: cached.display_name,
            balance: cached.balance,
            is_virtual: cached.is_virtual,
            loading: true,
            correlator: Correlator::new(config.request_timeout()),
            notifier: StatusNotifier::new(config.status_ttl()),
            ticker: CopyTicker::new(config.copy_tick()),
        };

        if session.access_token.is_none() {
            info!(session_id = %session.id, "No access token; waiting for login");
            session.loading = false;
            session.notifier.notify(MSG_LOGIN_FIRST, Severity::Warning, now);
            return (session, None);
        }

        let Connection { transport, events } = connector.open(&config.url);
        session.transport = Some(transport);
        session.connection = ConnectionState::Connecting;
        info!(session_id = %session.id, url = %config.url, "Session mounted, connecting");
        (session, Some(events))
    }

    /// Apply one event from the connection.
    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
    ) -> Vec<CommandOutcome> {
        match event {
            TransportEvent::Opened => {
                self.on_open(now);
                Vec::new()
            }
            TransportEvent::Message(text) => match InboundFrame::parse(&text) {
                Ok(frame) => {
                    let resolution = self.correlator.resolve(frame);
                    self.on_resolution(resolution, now).into_iter().collect()
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring undecodable frame");
                    Vec::new()
                }
            },
            TransportEvent::Error(message) => self.on_connection_lost(message, now),
            TransportEvent::Closed { reason } => self.on_connection_lost(
                reason.unwrap_or_else(|| "connection closed".to_string()),
                now,
            ),
        }
    }

    fn on_open(&mut self, now: Instant) {
        if self.transport.is_none() {
            return;
        }
        self.connection = ConnectionState::Open;
        info!(session_id = %self.id, "Connection open");

        if self.auth != AuthState::Unauthenticated {
            return;
        }
        let Some(token) = self.access_token.clone() else {
            return;
        };
        match self.issue(&Request::authorize(token), now) {
            Ok(_) => {
                self.auth = AuthState::Authorizing;
                debug!("Authorization sent");
            }
            Err(e) => {
                warn!(error = %e, "Could not send authorization");
                self.auth = AuthState::AuthFailed;
                self.notifier.notify(MSG_NOT_READY, Severity::Error, now);
            }
        }
    }

    fn on_resolution(&mut self, resolution: Resolution, now: Instant) -> Option<CommandOutcome> {
        match resolution {
            Resolution::Response { request, frame } => match frame.payload {
                Payload::Authorize(info) if request.kind == RequestKind::Authorize => {
                    self.on_authorized(info, now);
                    None
                }
                Payload::Balance(update) if request.kind == RequestKind::BalanceSubscribe => {
                    self.apply_balance(update);
                    None
                }
                Payload::CopyStart(value) if request.kind == RequestKind::CopyStart => {
                    self.on_copy_started(&request, value == 1, now)
                }
                Payload::CopyStop(value) if request.kind == RequestKind::CopyStop => {
                    self.on_copy_stopped(&request, value == 1, now)
                }
                other => {
                    warn!(
                        req_id = %request.id,
                        kind = %request.kind,
                        payload = ?other,
                        "Unexpected response payload"
                    );
                    let error = SessionError::UnexpectedResponse { kind: request.kind };
                    self.fail_request(&request, error, now)
                }
            },
            Resolution::RemoteError {
                kind,
                request,
                message,
            } => self.on_remote_error(kind, request, message, now),
            Resolution::Unsolicited(frame) => {
                match frame.payload {
                    Payload::Balance(update) => self.apply_balance(update),
                    _ => debug!(msg_type = ?frame.msg_type, "Unsolicited frame ignored"),
                }
                None
            }
        }
    }

    fn on_authorized(&mut self, info: AuthorizeInfo, now: Instant) {
        if self.auth != AuthState::Authorizing {
            debug!(auth = ?self.auth, "Stale authorization response");
            return;
        }
        self.auth = AuthState::Authorized;
        self.login_id = Some(non_blank_or_placeholder(Some(info.loginid)));
        self.display_name = Some(non_blank_or_placeholder(info.fullname));
        self.is_virtual = info.is_virtual == Some(1);
        if let (Some(balance), Some(currency)) = (self.balance.as_mut(), info.currency) {
            balance.currency = currency;
        }
        info!(
            session_id = %self.id,
            login_id = ?self.login_id,
            is_virtual = self.is_virtual,
            "Authorized"
        );

        if let Err(e) = self.issue(&Request::BalanceSubscribe, now) {
            warn!(error = %e, "Could not subscribe to balance");
            self.notifier.notify(MSG_NOT_READY, Severity::Error, now);
        }
    }

    fn apply_balance(&mut self, update: BalanceUpdate) {
        if self.auth != AuthState::Authorized {
            debug!("Balance frame before authorization ignored");
            return;
        }
        let balance = Balance::new(update.balance, update.currency);
        debug!(balance = %balance, "Balance updated");
        self.balance = Some(balance);
        self.loading = false;
    }

    fn on_copy_started(
        &mut self,
        request: &PendingRequest,
        accepted: bool,
        now: Instant,
    ) -> Option<CommandOutcome> {
        if self.copy != CopyState::Starting {
            debug!(copy = ?self.copy, "Stale copy_start response");
            return None;
        }
        if accepted {
            self.copy = CopyState::Copying;
            self.ticker.start(now);
            info!(trader = ?self.trader_token, "Copy trading started");
            self.notifier.notify(MSG_COPY_STARTED, Severity::Success, now);
        } else {
            self.copy = CopyState::StartFailed;
            self.trader_token = None;
            warn!("Copy start refused");
            self.notifier.notify(MSG_COPY_START_FAILED, Severity::Error, now);
        }
        Some(outcome(request, Ok(self.copy)))
    }

    fn on_copy_stopped(
        &mut self,
        request: &PendingRequest,
        accepted: bool,
        now: Instant,
    ) -> Option<CommandOutcome> {
        if self.copy != CopyState::Stopping {
            debug!(copy = ?self.copy, "Stale copy_stop response");
            return None;
        }
        if accepted {
            self.copy = CopyState::Idle;
            self.ticker.cancel();
            self.trader_token = None;
            info!(estimate = self.ticker.estimate(), "Copy trading stopped");
            self.notifier.notify(MSG_COPY_STOPPED, Severity::Success, now);
        } else {
            // Still mirroring until a retry succeeds.
            self.copy = CopyState::StopFailed;
            warn!("Copy stop refused");
            self.notifier.notify(MSG_COPY_STOP_FAILED, Severity::Error, now);
        }
        Some(outcome(request, Ok(self.copy)))
    }

    fn on_remote_error(
        &mut self,
        kind: Option<RequestKind>,
        request: Option<PendingRequest>,
        message: String,
        now: Instant,
    ) -> Option<CommandOutcome> {
        warn!(kind = ?kind, %message, "Back-end returned an error");
        self.notifier.notify(format!("Error: {message}"), Severity::Error, now);

        // Only an error answering one of our requests moves the state.
        let request = request?;
        match request.kind {
            RequestKind::Authorize if self.auth == AuthState::Authorizing => {
                self.auth = AuthState::AuthFailed;
                self.loading = false;
                None
            }
            RequestKind::CopyStart if self.copy == CopyState::Starting => {
                self.copy = CopyState::Idle;
                self.trader_token = None;
                Some(outcome(
                    &request,
                    Err(SessionError::RemoteError {
                        kind: request.kind,
                        message,
                    }),
                ))
            }
            RequestKind::CopyStop if self.copy == CopyState::Stopping => {
                self.copy = CopyState::Copying;
                Some(outcome(
                    &request,
                    Err(SessionError::RemoteError {
                        kind: request.kind,
                        message,
                    }),
                ))
            }
            _ => None,
        }
    }

    fn on_connection_lost(&mut self, reason: String, now: Instant) -> Vec<CommandOutcome> {
        if self.transport.is_none() {
            return Vec::new();
        }
        warn!(session_id = %self.id, %reason, "Connection lost");

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.connection = ConnectionState::Closed;
        self.connection_error = true;
        self.loading = false;
        self.auth = match self.auth {
            AuthState::Authorizing | AuthState::AuthFailed => AuthState::AuthFailed,
            _ => AuthState::Unauthenticated,
        };
        self.copy = CopyState::Idle;
        self.trader_token = None;
        self.ticker.cancel();
        self.notifier.notify(MSG_CONNECTION_ERROR, Severity::Error, now);

        self.correlator
            .clear()
            .iter()
            .filter(|r| matches!(r.kind, RequestKind::CopyStart | RequestKind::CopyStop))
            .map(|r| outcome(r, Err(SessionError::ConnectionLost(reason.clone()))))
            .collect()
    }

    /// Validate `input` and ask the back-end to start mirroring that trader.
    pub fn start_copy(&mut self, input: &str, now: Instant) -> Result<RequestId, SessionError> {
        self.require_authorized(now)?;
        if self.copy.is_in_flight() {
            debug!(copy = ?self.copy, "Start ignored, command outstanding");
            return Err(SessionError::Busy);
        }
        if !matches!(self.copy, CopyState::Idle | CopyState::StartFailed) {
            return Err(SessionError::InvalidState(self.copy));
        }

        let token = match TraderToken::parse(input) {
            Ok(token) => token,
            Err(e) => {
                self.notifier.notify(e.to_string(), Severity::Warning, now);
                return Err(e.into());
            }
        };

        let request = Request::copy_start(&token, self.login_id.as_deref());
        let id = self.issue_command(&request, now)?;
        info!(req_id = %id, trader = ?token, "Copy start requested");
        self.copy = CopyState::Starting;
        self.trader_token = Some(token);
        Ok(id)
    }

    /// Ask the back-end to stop mirroring the current trader.
    pub fn stop_copy(&mut self, now: Instant) -> Result<RequestId, SessionError> {
        self.require_authorized(now)?;
        if self.copy.is_in_flight() {
            debug!(copy = ?self.copy, "Stop ignored, command outstanding");
            return Err(SessionError::Busy);
        }
        let token = match (&self.copy, &self.trader_token) {
            (CopyState::Copying | CopyState::StopFailed, Some(token)) => token.clone(),
            _ => return Err(SessionError::InvalidState(self.copy)),
        };

        let request = Request::copy_stop(&token, self.login_id.as_deref());
        let id = self.issue_command(&request, now)?;
        info!(req_id = %id, trader = ?token, "Copy stop requested");
        self.copy = CopyState::Stopping;
        Ok(id)
    }

    fn require_authorized(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.auth == AuthState::Authorized {
            return Ok(());
        }
        self.notifier.notify(MSG_LOGIN_FIRST, Severity::Warning, now);
        Err(SessionError::NotAuthorized)
    }

    fn issue_command(
        &mut self,
        request: &Request,
        now: Instant,
    ) -> Result<RequestId, SessionError> {
        self.issue(request, now).map_err(|e| {
            warn!(error = %e, kind = %request.kind(), "Command not sent");
            self.notifier.notify(MSG_NOT_READY, Severity::Error, now);
            e
        })
    }

    fn issue(&mut self, request: &Request, now: Instant) -> Result<RequestId, SessionError> {
        let Some(transport) = self.transport.as_deref_mut() else {
            return Err(SessionError::TransportUnavailable(ConnectionState::Closed));
        };
        self.correlator
            .issue(transport, request, now)
            .map_err(|e| match e {
                TransportError::NotReady(state) => SessionError::TransportUnavailable(state),
                other => SessionError::Transport(other),
            })
    }

    /// Run every timer due by `now`: status expiry, the estimate tick and
    /// request timeouts.
    pub fn on_deadline(&mut self, now: Instant) -> Vec<CommandOutcome> {
        self.notifier.expire(now);

        let fired = self.ticker.poll(now);
        if fired > 0 {
            debug!(estimate = self.ticker.estimate(), "Copy estimate tick");
        }

        let mut outcomes = Vec::new();
        for request in self.correlator.expire(now) {
            let error = SessionError::Timeout { kind: request.kind };
            outcomes.extend(self.fail_request(&request, error, now));
        }
        outcomes
    }

    /// Settle a request that will never get a usable answer.
    fn fail_request(
        &mut self,
        request: &PendingRequest,
        error: SessionError,
        now: Instant,
    ) -> Option<CommandOutcome> {
        match request.kind {
            RequestKind::Authorize if self.auth == AuthState::Authorizing => {
                self.auth = AuthState::AuthFailed;
                self.loading = false;
                self.notifier.notify(format!("Error: {error}"), Severity::Error, now);
                None
            }
            RequestKind::CopyStart if self.copy == CopyState::Starting => {
                self.copy = CopyState::StartFailed;
                self.trader_token = None;
                self.notifier.notify(MSG_COPY_START_FAILED, Severity::Error, now);
                Some(outcome(request, Err(error)))
            }
            RequestKind::CopyStop if self.copy == CopyState::Stopping => {
                self.copy = CopyState::StopFailed;
                self.notifier.notify(MSG_COPY_STOP_FAILED, Severity::Error, now);
                Some(outcome(request, Err(error)))
            }
            _ => None,
        }
    }

    /// The earliest time [`Session::on_deadline`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.notifier.deadline(),
            self.ticker.deadline(),
            self.correlator.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    pub fn copy_state(&self) -> CopyState {
        self.copy
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn status(&self) -> SessionStatus {
        if self.auth == AuthState::AuthFailed || self.connection_error {
            return SessionStatus::Error;
        }
        if self.copy.is_copying() {
            return SessionStatus::Copying;
        }
        match self.auth {
            AuthState::Authorized if self.copy == CopyState::StartFailed => SessionStatus::Error,
            AuthState::Authorized => SessionStatus::Ready,
            AuthState::Authorizing => SessionStatus::Authorizing,
            _ if self.connection == ConnectionState::Connecting => SessionStatus::Authorizing,
            _ => SessionStatus::Idle,
        }
    }

    pub fn control(&self) -> CopyControl {
        if self.auth != AuthState::Authorized || self.copy.is_in_flight() {
            CopyControl::Disabled
        } else if self.copy.is_copying() {
            CopyControl::Stop
        } else {
            CopyControl::Start
        }
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            connection: self.connection,
            auth: self.auth,
            copy: self.copy,
            status: self.status(),
            control: self.control(),
            login_id: self.login_id.clone(),
            display_name: self.display_name.clone(),
            balance: self.balance.clone(),
            is_virtual: self.is_virtual,
            loading: self.loading,
            copied_trades_estimate: self.ticker.estimate(),
            notice: self.notifier.visible(now).cloned(),
            updated_at: Utc::now(),
        }
    }

    /// Tear the session down, closing the connection.
    pub fn unmount(mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        let abandoned = self.correlator.clear().len();
        self.ticker.cancel();
        self.notifier.clear();
        info!(session_id = %self.id, abandoned, "Session unmounted");
    }
}

fn outcome(request: &PendingRequest, result: Result<CopyState, SessionError>) -> CommandOutcome {
    CommandOutcome {
        request: request.id,
        kind: request.kind,
        result,
    }
}

fn non_blank_or_placeholder(value: Option<String>) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| PLACEHOLDER_LOGIN_ID.to_string())
}
