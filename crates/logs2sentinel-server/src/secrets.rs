//! Environment-backed secret store
//!
//! Default `SecretStore` for deployments where secrets are injected as
//! environment variables (container orchestrators, CI). A Key-Vault-backed
//! implementation plugs in through the same trait without touching the
//! credential cache.
//!
//! Secret `sentinel-client-secret` resolves from
//! `LOGS2SENTINEL_SECRET_SENTINEL_CLIENT_SECRET`. Writes (the cache's
//! bootstrapped encryption key) land in an in-process overlay, not the
//! environment.

use std::collections::HashMap;

use async_trait::async_trait;
use logs2sentinel_resilience::{SecretStore, SecretStoreError};
use parking_lot::Mutex;

pub const SECRET_ENV_PREFIX: &str = "LOGS2SENTINEL_SECRET_";

#[derive(Default)]
pub struct EnvSecretStore {
    overlay: Mutex<HashMap<String, String>>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn env_key(name: &str) -> String {
        format!(
            "{SECRET_ENV_PREFIX}{}",
            name.to_uppercase().replace('-', "_")
        )
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<String, SecretStoreError> {
        if let Some(value) = self.overlay.lock().get(name) {
            return Ok(value.clone());
        }
        std::env::var(Self::env_key(name))
            .map_err(|_| SecretStoreError::NotFound(name.to_string()))
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError> {
        self.overlay
            .lock()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_from_environment() {
        std::env::set_var("LOGS2SENTINEL_SECRET_TEST_SECRET_ONE", "value-1");
        let store = EnvSecretStore::new();
        assert_eq!(store.get("test-secret-one").await.unwrap(), "value-1");
        std::env::remove_var("LOGS2SENTINEL_SECRET_TEST_SECRET_ONE");
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let store = EnvSecretStore::new();
        let err = store.get("never-set").await.unwrap_err();
        assert!(matches!(err, SecretStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn writes_land_in_the_overlay() {
        let store = EnvSecretStore::new();
        store.set("cache-encryption-key", "abc").await.unwrap();
        assert_eq!(store.get("cache-encryption-key").await.unwrap(), "abc");
        // The environment itself is untouched.
        assert!(std::env::var("LOGS2SENTINEL_SECRET_CACHE_ENCRYPTION_KEY").is_err());
    }
}
