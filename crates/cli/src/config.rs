use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tradesync_brokers_deriv::DerivConfig;
use tradesync_engine::SessionConfig;

/// Contents of the TOML config file. Every table and key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connection: DerivConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Read `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Session settings pointed at the configured endpoint. The `[connection]`
    /// table always decides the URL.
    pub fn session_config(&self, app_id: Option<u32>) -> SessionConfig {
        let mut connection = self.connection.clone();
        if let Some(app_id) = app_id {
            connection.app_id = app_id;
        }
        SessionConfig {
            url: connection.url(),
            ..self.session.clone()
        }
    }
}
