use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use tradesync_core::*;
use tradesync_engine::SessionError;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Session
        .route("/session", get(session_snapshot))
        .route("/ws", get(ws_handler))
        // Copy trading
        .route("/copy/start", post(start_copy))
        .route("/copy/stop", post(stop_copy))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A session error rendered as an HTTP response.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub SessionError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SessionError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::NotAuthorized => StatusCode::UNAUTHORIZED,
            SessionError::Busy | SessionError::InvalidState(_) => StatusCode::CONFLICT,
            SessionError::RemoteError { .. } | SessionError::UnexpectedResponse { .. } => {
                StatusCode::BAD_GATEWAY
            }
            SessionError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SessionError::TransportUnavailable(_)
            | SessionError::ConnectionLost(_)
            | SessionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(%status, error = %self.0, "Request failed");
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Health / session
// ---------------------------------------------------------------------------

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn session_snapshot(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    Json(state.session.snapshot())
}

// ---------------------------------------------------------------------------
// Copy trading
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartCopyRequest {
    pub trader_token: String,
}

#[derive(Debug, Serialize)]
pub struct CopyResponse {
    pub copy: CopyState,
    pub session: SessionSnapshot,
}

async fn start_copy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartCopyRequest>,
) -> Result<Json<CopyResponse>, ApiError> {
    let copy = state.session.start_copy(req.trader_token).await?;
    Ok(Json(CopyResponse {
        copy,
        session: state.session.snapshot(),
    }))
}

async fn stop_copy(State(state): State<Arc<AppState>>) -> Result<Json<CopyResponse>, ApiError> {
    let copy = state.session.stop_copy().await?;
    Ok(Json(CopyResponse {
        copy,
        session: state.session.snapshot(),
    }))
}

// ---------------------------------------------------------------------------
// Snapshot stream
// ---------------------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_snapshots(socket, state))
}

/// Push the current snapshot, then every new one until either side goes away.
async fn stream_snapshots(mut socket: WebSocket, state: Arc<AppState>) {
    info!("Snapshot stream client connected");
    let mut snapshots = state.session.subscribe();

    loop {
        let text = {
            let snapshot = snapshots.borrow_and_update();
            match serde_json::to_string(&*snapshot) {
                Ok(text) => text,
                Err(e) => {
                    debug!(error = %e, "Snapshot serialization failed");
                    break;
                }
            }
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }

        let changed = loop {
            tokio::select! {
                // Err once the session driver has stopped.
                changed = snapshots.changed() => break changed.is_ok(),
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break false,
                    Some(Ok(_)) => {}
                },
            }
        };
        if !changed {
            break;
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    info!("Snapshot stream client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use tradesync_brokers_common::{LoopbackProfile, SimulatedConfig, SimulatedConnector};
    use tradesync_data::MemoryStore;
    use tradesync_engine::{SessionConfig, SessionDriver, SessionHandle};

    fn spawn_session(store: MemoryStore) -> SessionHandle {
        let (connector, _server) =
            SimulatedConnector::new(SimulatedConfig::loopback(LoopbackProfile::default()));
        let (driver, handle) = SessionDriver::new(&SessionConfig::default(), &store, &connector);
        tokio::spawn(driver.run());
        handle
    }

    async fn ready_session() -> SessionHandle {
        let handle = spawn_session(MemoryStore::with_token("a1-token"));
        handle
            .subscribe()
            .wait_for(|s| s.auth == AuthState::Authorized)
            .await
            .unwrap();
        handle
    }

    async fn call(handle: SessionHandle, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = crate::build_router(handle).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let handle = spawn_session(MemoryStore::new());
        let (status, body) = call(
            handle,
            Request::get("/api/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_start_and_stop_copy() {
        let handle = ready_session().await;

        let (status, body) = call(
            handle.clone(),
            post_json(
                "/api/copy/start",
                serde_json::json!({"trader_token": "abcdefghijklmnop"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["copy"], "copying");
        assert_eq!(body["session"]["control"], "stop");

        let (status, body) = call(
            handle.clone(),
            Request::post("/api/copy/stop").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["copy"], "idle");
    }

    #[tokio::test]
    async fn test_invalid_token_is_unprocessable() {
        let handle = ready_session().await;
        let (status, body) = call(
            handle,
            post_json("/api/copy/start", serde_json::json!({"trader_token": "abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("15-32"));
    }

    #[tokio::test]
    async fn test_logged_out_session() {
        let handle = spawn_session(MemoryStore::new());

        let (status, body) = call(
            handle.clone(),
            Request::get("/api/session").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["auth"], "unauthenticated");
        assert_eq!(body["control"], "disabled");
        assert_eq!(body["loading"], false);

        let (status, _) = call(
            handle,
            Request::post("/api/copy/stop").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
