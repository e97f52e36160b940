//! Deriv API v3 adapter.
//!
//! A single WebSocket connection carrying JSON frames. Requests are matched to
//! responses by the `msg_type` tag and the echoed `req_id`.

pub mod client;
pub mod protocol;

pub use client::{DerivConfig, DerivConnector, WsTransport};
pub use protocol::*;
