//! Transports shared across adapters.

pub mod simulated;

pub use simulated::{LoopbackProfile, SimulatedConfig, SimulatedConnector, SimulatedServer};
