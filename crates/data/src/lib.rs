//! Key-value credential stores and helpers for caching the session profile.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use tradesync_core::*;

/// Cache the profile fields of `snapshot` so the next session can render them
/// before it has authorized.
pub fn persist_profile(
    store: &mut dyn CredentialStore,
    snapshot: &SessionSnapshot,
) -> Result<(), StoreError> {
    if let Some(login_id) = known_login_id(snapshot.login_id.as_deref()) {
        store.set(keys::ACTIVE_LOGIN_ID, login_id)?;
    }
    if let Some(name) = snapshot
        .display_name
        .as_deref()
        .filter(|n| *n != PLACEHOLDER_LOGIN_ID)
    {
        store.set(keys::NAME, name)?;
    }
    if let Some(balance) = &snapshot.balance {
        store.set(keys::BALANCE, &balance.amount.to_string())?;
        store.set(keys::CURRENCY, &balance.currency)?;
    }
    store.set(keys::IS_VIRTUAL, if snapshot.is_virtual { "true" } else { "false" })?;
    Ok(())
}

/// Remove the access token and every cached profile field.
pub fn clear_credentials(store: &mut dyn CredentialStore) -> Result<(), StoreError> {
    for key in [
        keys::ACTIVE_TOKEN,
        keys::ACTIVE_LOGIN_ID,
        keys::NAME,
        keys::BALANCE,
        keys::CURRENCY,
        keys::IS_VIRTUAL,
    ] {
        store.remove(key)?;
    }
    Ok(())
}
