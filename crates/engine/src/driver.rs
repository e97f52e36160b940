use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};
use tradesync_core::*;

use crate::session::{CommandOutcome, Session, SessionConfig, SessionError};

type Reply = oneshot::Sender<Result<CopyState, SessionError>>;

enum Command {
    StartCopy { trader_token: String, reply: Reply },
    StopCopy { reply: Reply },
    Shutdown,
}

/// Cloneable front door to a running [`SessionDriver`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Start mirroring a trader. Resolves once the back-end has answered.
    pub async fn start_copy(
        &self,
        trader_token: impl Into<String>,
    ) -> Result<CopyState, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartCopy {
            trader_token: trader_token.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Stop mirroring. Resolves once the back-end has answered.
    pub async fn stop_copy(&self) -> Result<CopyState, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StopCopy { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receive every snapshot the session publishes from now on.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Ask the driver to unmount the session. Returns once the request is queued.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// Owns a [`Session`] and runs its event loop: transport events, commands and
/// timers are handled one at a time on a single task.
pub struct SessionDriver {
    session: Session,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<SessionSnapshot>,
    waiting: HashMap<RequestId, Reply>,
}

impl SessionDriver {
    /// Mount a session. Nothing is processed until [`SessionDriver::run`].
    pub fn new(
        config: &SessionConfig,
        store: &dyn CredentialStore,
        connector: &dyn Connector,
    ) -> (Self, SessionHandle) {
        let now = Instant::now();
        let (session, events) = Session::mount(config, store, connector, now);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot(now));

        (
            Self {
                session,
                events,
                commands: command_rx,
                snapshots: snapshot_tx,
                waiting: HashMap::new(),
            },
            SessionHandle {
                commands: command_tx,
                snapshots: snapshot_rx,
            },
        )
    }

    /// Process until shutdown is requested or every handle is dropped, then
    /// unmount the session.
    pub async fn run(mut self) {
        info!(session_id = %self.session.id(), "Session driver started");

        loop {
            let deadline = self.session.next_deadline();

            let outcomes = tokio::select! {
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.session.handle_transport_event(event, Instant::now()),
                    None => {
                        debug!("Transport event stream ended");
                        self.events = None;
                        Vec::new()
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::StartCopy { trader_token, reply }) => {
                        let result = self.session.start_copy(&trader_token, Instant::now());
                        self.park(result, reply);
                        Vec::new()
                    }
                    Some(Command::StopCopy { reply }) => {
                        let result = self.session.stop_copy(Instant::now());
                        self.park(result, reply);
                        Vec::new()
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = sleep_until(deadline) => self.session.on_deadline(Instant::now()),
            };

            // Publish first so a caller woken by its reply sees the new state.
            self.publish();
            self.deliver(outcomes);
        }

        // Callers still waiting see `SessionError::Closed`.
        self.waiting.clear();
        self.session.unmount();
        info!("Session driver stopped");
    }

    fn park(&mut self, issued: Result<RequestId, SessionError>, reply: Reply) {
        match issued {
            Ok(id) => {
                self.waiting.insert(id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn deliver(&mut self, outcomes: Vec<CommandOutcome>) {
        for outcome in outcomes {
            if let Some(reply) = self.waiting.remove(&outcome.request) {
                let _ = reply.send(outcome.result);
            }
        }
    }

    fn publish(&self) {
        self.snapshots
            .send_replace(self.session.snapshot(Instant::now()));
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tradesync_brokers_common::{LoopbackProfile, SimulatedConfig, SimulatedConnector};

    struct TokenOnly;

    impl CredentialStore for TokenOnly {
        fn get(&self, key: &str) -> Option<String> {
            (key == keys::ACTIVE_TOKEN).then(|| "a1-token".to_string())
        }

        fn set(&mut self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Ok(())
        }

        fn remove(&mut self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        fn on_change(&self) -> tokio::sync::broadcast::Receiver<StoreChange> {
            tokio::sync::broadcast::channel(1).1
        }
    }

    async fn settle(handle: &SessionHandle, pred: impl Fn(&SessionSnapshot) -> bool) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| pred(s)))
            .await
            .expect("snapshot condition not reached")
            .expect("driver stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loopback_start_stop_round_trip() {
        let (connector, server) =
            SimulatedConnector::new(SimulatedConfig::loopback(LoopbackProfile::default()));
        let (driver, handle) =
            SessionDriver::new(&SessionConfig::default(), &TokenOnly, &connector);
        let task = tokio::spawn(driver.run());

        settle(&handle, |s| s.auth == AuthState::Authorized && !s.loading).await;
        let snap = handle.snapshot();
        assert_eq!(snap.login_id.as_deref(), Some("VRTC1000001"));
        assert!(snap.is_virtual);

        assert_eq!(
            handle.start_copy("abcdefghijklmnop").await,
            Ok(CopyState::Copying)
        );
        assert_eq!(server.sent_with("copy_start")[0]["loginid"], "VRTC1000001");

        // Paused time auto-advances to the next tick.
        settle(&handle, |s| s.copied_trades_estimate >= 2).await;

        assert_eq!(handle.stop_copy().await, Ok(CopyState::Idle));
        assert_eq!(
            server.sent_with("copy_stop")[0]["copy_stop"],
            "abcdefghijklmnop"
        );

        handle.shutdown().await;
        task.await.unwrap();
        assert!(server.closed_by_client());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_command_fails_on_connection_loss() {
        let (connector, server) = SimulatedConnector::new(SimulatedConfig::default());
        let (driver, handle) =
            SessionDriver::new(&SessionConfig::default(), &TokenOnly, &connector);
        tokio::spawn(driver.run());

        server.accept();
        settle(&handle, |s| s.auth == AuthState::Authorizing).await;
        let req_id = server.last_req_id("authorize").unwrap();
        server.push(json!({
            "msg_type": "authorize",
            "req_id": req_id,
            "authorize": {"loginid": "CR1"}
        }));
        settle(&handle, |s| s.auth == AuthState::Authorized).await;

        let starter = handle.clone();
        let pending = tokio::spawn(async move { starter.start_copy("abcdefghijklmnop").await });
        settle(&handle, |s| s.copy == CopyState::Starting).await;

        server.fail("reset by peer");
        assert_eq!(
            pending.await.unwrap(),
            Err(SessionError::ConnectionLost("reset by peer".to_string()))
        );
        let snap = handle.snapshot();
        assert_eq!(snap.connection, ConnectionState::Closed);
        assert_eq!(snap.status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_report_closed() {
        let (connector, _server) = SimulatedConnector::new(SimulatedConfig::default());
        let (driver, handle) =
            SessionDriver::new(&SessionConfig::default(), &TokenOnly, &connector);
        let task = tokio::spawn(driver.run());
        handle.shutdown().await;
        task.await.unwrap();
        assert_eq!(handle.stop_copy().await, Err(SessionError::Closed));
    }
}
