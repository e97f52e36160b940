use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::mpsc;
use std::time::Duration;
use tokio::time::Instant;
use tradesync_brokers_common::{SimulatedConfig, SimulatedConnector, SimulatedServer};
use tradesync_core::*;
use tradesync_data::MemoryStore;
use tradesync_engine::session::{
    MSG_CONNECTION_ERROR, MSG_COPY_STARTED, MSG_COPY_STOP_FAILED, MSG_LOGIN_FIRST,
};
use tradesync_engine::{Session, SessionConfig, SessionError};

const TRADER: &str = "trader-token_0123456"; // 20 chars

struct Fixture {
    session: Session,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    server: SimulatedServer,
    now: Instant,
}

impl Fixture {
    fn new() -> Self {
        let store = MemoryStore::with_token("a1-access-token");
        let (connector, server) = SimulatedConnector::new(SimulatedConfig::default());
        let now = Instant::now();
        let (session, events) = Session::mount(&SessionConfig::default(), &store, &connector, now);
        Self {
            session,
            events: events.expect("logged-in session opens a connection"),
            server,
            now,
        }
    }

    fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.session.handle_transport_event(event, self.now);
        }
    }

    fn open(&mut self) {
        self.server.accept();
        self.pump();
        assert_eq!(self.session.auth_state(), AuthState::Authorizing);
    }

    fn ready(&mut self) {
        self.open();
        let req_id = self.server.last_req_id("authorize").unwrap();
        self.server.push(json!({
            "msg_type": "authorize",
            "req_id": req_id,
            "authorize": {"loginid": "CR123", "fullname": "Jane", "currency": "USD"}
        }));
        self.pump();
        assert_eq!(self.session.auth_state(), AuthState::Authorized);
    }

    fn copying(&mut self) {
        self.ready();
        self.session.start_copy(TRADER, self.now).unwrap();
        self.server.push(json!({"msg_type": "copy_start", "copy_start": 1}));
        self.pump();
        assert_eq!(self.session.copy_state(), CopyState::Copying);
    }

    fn notice(&self) -> Option<StatusMessage> {
        self.session.snapshot(self.now).notice
    }
}

#[test]
fn test_authorize_then_balance_push() {
    let mut f = Fixture::new();
    f.ready();
    f.server.push(json!({
        "msg_type": "balance",
        "balance": {"balance": 100.5, "currency": "USD"}
    }));
    f.pump();

    let snap = f.session.snapshot(f.now);
    assert_eq!(snap.balance, Some(Balance::new(dec!(100.50), "USD")));
    assert_eq!(snap.auth, AuthState::Authorized);
    assert_eq!(snap.connection, ConnectionState::Open);
    assert_eq!(snap.login_id.as_deref(), Some("CR123"));
    assert_eq!(snap.display_name.as_deref(), Some("Jane"));
}

#[test]
fn test_short_trader_token_rejected_locally() {
    let mut f = Fixture::new();
    f.ready();
    let sent_before = f.server.sent().len();

    let err = f.session.start_copy("abc", f.now).unwrap_err();
    assert_eq!(
        err,
        SessionError::Validation(TokenError::Length {
            len: 3,
            min: 15,
            max: 32
        })
    );
    assert_eq!(f.server.sent().len(), sent_before);
    assert!(f.server.sent_with("copy_start").is_empty());
    assert_eq!(f.session.copy_state(), CopyState::Idle);
    assert_eq!(f.notice().unwrap().severity, Severity::Warning);
}

#[test]
fn test_copy_start_success() {
    let mut f = Fixture::new();
    f.copying();

    let frame = &f.server.sent_with("copy_start")[0];
    assert_eq!(frame["copy_start"], TRADER);
    assert_eq!(frame["loginid"], "CR123");

    let notice = f.notice().unwrap();
    assert_eq!(notice.text, MSG_COPY_STARTED);
    assert_eq!(notice.severity, Severity::Success);
    assert_eq!(notice.color, "#10B981");
    assert_eq!(f.session.status(), SessionStatus::Copying);
}

#[test]
fn test_copy_stop_refused_keeps_copying() {
    let mut f = Fixture::new();
    f.copying();

    f.session.stop_copy(f.now).unwrap();
    assert_eq!(f.server.sent_with("copy_stop")[0]["copy_stop"], TRADER);
    f.server.push(json!({"msg_type": "copy_stop", "copy_stop": 0}));
    f.pump();

    assert_eq!(f.session.copy_state(), CopyState::StopFailed);
    assert_eq!(f.notice().unwrap().text, MSG_COPY_STOP_FAILED);
    let snap = f.session.snapshot(f.now);
    assert!(snap.copy.is_copying());
    assert_eq!(snap.status, SessionStatus::Copying);
    assert_eq!(snap.control, CopyControl::Stop);

    // A retry is allowed from StopFailed.
    f.session.stop_copy(f.now).unwrap();
    f.server.push(json!({"msg_type": "copy_stop", "copy_stop": 1}));
    f.pump();
    assert_eq!(f.session.copy_state(), CopyState::Idle);
}

#[test]
fn test_close_while_authorizing() {
    let mut f = Fixture::new();
    f.open();
    assert_eq!(f.session.pending_requests(), 1);

    f.server.close(None);
    f.pump();

    let snap = f.session.snapshot(f.now);
    assert_eq!(snap.connection, ConnectionState::Closed);
    assert_eq!(snap.auth, AuthState::AuthFailed);
    assert_eq!(snap.status, SessionStatus::Error);
    assert_eq!(f.session.pending_requests(), 0);
    assert_eq!(snap.notice.unwrap().text, MSG_CONNECTION_ERROR);
}

#[test]
fn test_authorize_rejected() {
    let mut f = Fixture::new();
    f.open();
    let req_id = f.server.last_req_id("authorize").unwrap();
    f.server.push(json!({
        "msg_type": "authorize",
        "req_id": req_id,
        "error": {"code": "InvalidToken", "message": "The token is invalid."}
    }));
    f.pump();

    let snap = f.session.snapshot(f.now);
    assert_eq!(snap.auth, AuthState::AuthFailed);
    assert!(!snap.loading);
    assert_eq!(snap.status, SessionStatus::Error);
    assert_eq!(snap.control, CopyControl::Disabled);
    let notice = snap.notice.unwrap();
    assert_eq!(notice.text, "Error: The token is invalid.");
    assert_eq!(notice.severity, Severity::Error);
    assert_eq!(f.session.pending_requests(), 0);
    assert!(f.server.sent_with("balance").is_empty());
}

#[test]
fn test_authorize_times_out() {
    let mut f = Fixture::new();
    f.open();

    let deadline = f.session.next_deadline().unwrap();
    assert_eq!(deadline, f.now + Duration::from_secs(30));
    assert!(f.session.on_deadline(deadline).is_empty());

    let snap = f.session.snapshot(deadline);
    assert_eq!(snap.auth, AuthState::AuthFailed);
    assert!(!snap.loading);
    assert_eq!(snap.status, SessionStatus::Error);
    assert!(snap.notice.unwrap().text.starts_with("Error: "));
    assert_eq!(f.session.pending_requests(), 0);

    // A late answer after the timeout changes nothing.
    f.server.push(json!({
        "msg_type": "authorize",
        "req_id": f.server.last_req_id("authorize").unwrap(),
        "authorize": {"loginid": "CR123"}
    }));
    f.pump();
    assert_eq!(f.session.auth_state(), AuthState::AuthFailed);
}

#[test]
fn test_untagged_copy_answer_is_typed_by_its_key() {
    let mut f = Fixture::new();
    f.ready();
    let id = f.session.start_copy(TRADER, f.now).unwrap();
    f.server.push(json!({"req_id": id.0, "copy_start": 1}));
    f.pump();

    assert_eq!(f.session.copy_state(), CopyState::Copying);
    assert_eq!(f.session.pending_requests(), 1); // balance subscription
    f.server.push(json!({"balance": {"balance": 42, "currency": "USD"}}));
    f.pump();
    assert_eq!(
        f.session.snapshot(f.now).balance,
        Some(Balance::new(dec!(42), "USD"))
    );
}

#[test]
fn test_copy_start_never_sent_unless_authorized() {
    let mut f = Fixture::new();
    f.open();

    // Balance frames arrive but authorization never succeeds.
    for _ in 0..3 {
        f.server.push(json!({
            "msg_type": "balance",
            "balance": {"balance": 5, "currency": "USD"}
        }));
        f.pump();
        assert_eq!(
            f.session.start_copy(TRADER, f.now),
            Err(SessionError::NotAuthorized)
        );
        assert_eq!(f.session.stop_copy(f.now), Err(SessionError::NotAuthorized));
    }

    assert!(f.server.sent_with("copy_start").is_empty());
    assert!(f.server.sent_with("copy_stop").is_empty());
    assert_eq!(f.notice().unwrap().text, MSG_LOGIN_FIRST);
}

#[test]
fn test_remote_error_on_start_returns_to_idle() {
    let mut f = Fixture::new();
    f.ready();
    let id = f.session.start_copy(TRADER, f.now).unwrap();
    f.server.push(json!({
        "msg_type": "copy_start",
        "req_id": id.0,
        "error": {"code": "CopyTradingNotAllowed", "message": "Trader does not allow copy trading."}
    }));
    f.pump();

    assert_eq!(f.session.copy_state(), CopyState::Idle);
    assert_eq!(
        f.notice().unwrap().text,
        "Error: Trader does not allow copy trading."
    );
}

#[test]
fn test_remote_error_on_stop_returns_to_copying() {
    let mut f = Fixture::new();
    f.copying();
    let id = f.session.stop_copy(f.now).unwrap();
    f.server.push(json!({
        "msg_type": "copy_stop",
        "req_id": id.0,
        "error": {"message": "Try again later"}
    }));
    f.pump();
    assert_eq!(f.session.copy_state(), CopyState::Copying);
}

#[test]
fn test_outstanding_command_blocks_another() {
    let mut f = Fixture::new();
    f.ready();
    f.session.start_copy(TRADER, f.now).unwrap();

    assert_eq!(f.session.start_copy(TRADER, f.now), Err(SessionError::Busy));
    assert_eq!(f.session.stop_copy(f.now), Err(SessionError::Busy));
    assert_eq!(f.server.sent_with("copy_start").len(), 1);
    assert_eq!(f.session.control(), CopyControl::Disabled);
}

#[test]
fn test_connection_loss_while_copying() {
    let mut f = Fixture::new();
    f.copying();
    f.server.fail("network down");
    f.pump();

    let snap = f.session.snapshot(f.now);
    assert_eq!(snap.connection, ConnectionState::Closed);
    assert_eq!(snap.auth, AuthState::Unauthenticated);
    assert_eq!(snap.copy, CopyState::Idle);
    assert_eq!(snap.control, CopyControl::Disabled);
    assert_eq!(f.session.start_copy(TRADER, f.now), Err(SessionError::NotAuthorized));
}
