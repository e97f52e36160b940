use tradesync_engine::SessionHandle;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    pub session: SessionHandle,
}

impl AppState {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }
}
