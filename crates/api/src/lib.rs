pub mod routes;
pub mod state;

use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tradesync_engine::SessionHandle;

/// Build the Axum application router.
pub fn build_router(handle: SessionHandle) -> Router {
    let app_state = Arc::new(state::AppState::new(handle));

    Router::new()
        .nest("/api", routes::api_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve the API until the listener fails.
pub async fn start_server(handle: SessionHandle, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(handle);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("API server listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
