use std::collections::HashMap;
use tokio::sync::broadcast;
use tradesync_core::*;

/// Volatile store, mostly for tests and `--offline` runs.
#[derive(Debug)]
pub struct MemoryStore {
    values: HashMap<String, String>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            values: HashMap::new(),
            changes,
        }
    }

    /// A store holding only an access token.
    pub fn with_token(token: &str) -> Self {
        let mut store = Self::new();
        store
            .values
            .insert(keys::ACTIVE_TOKEN.to_string(), token.to_string());
        store
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.values.remove(key).is_some() {
            let _ = self.changes.send(StoreChange {
                key: key.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    fn on_change(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
