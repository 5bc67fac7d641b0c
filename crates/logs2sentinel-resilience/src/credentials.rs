//! Credential cache over a pluggable secret store
//!
//! Read-through cache with TTL, guarded by a circuit breaker. While the
//! breaker is open, a stale cache entry is better than no credential, so
//! expired entries are served with a warning. Cached values are encrypted
//! at rest with AES-256-GCM; the data key lives in the same secret store and
//! is bootstrapped on first use (the only write this component issues).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use logs2sentinel_core::Retryable;
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret store timed out")]
    Timeout,

    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

impl Retryable for SecretStoreError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            SecretStoreError::Timeout | SecretStoreError::Unavailable(_)
        )
    }
}

/// Key-Vault-compatible secret store. The store authenticates itself.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<String, SecretStoreError>;
    async fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError>;
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(transparent)]
    Store(#[from] SecretStoreError),

    #[error("secret store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("secret store circuit open since {opened_at}; retry in {retry_after:?}")]
    CircuitOpen {
        opened_at: DateTime<Utc>,
        retry_after: Duration,
    },

    #[error("cache encryption failure: {0}")]
    Encryption(String),
}

impl Retryable for CredentialError {
    fn is_retryable(&self) -> bool {
        match self {
            CredentialError::Timeout(_) => true,
            CredentialError::Store(e) => e.is_retryable(),
            CredentialError::CircuitOpen { .. } | CredentialError::Encryption(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialCacheConfig {
    pub ttl: Duration,
    /// Name of the secret holding the base64-encoded 32-byte data key.
    pub encryption_key_secret: String,
    pub breaker: CircuitBreakerConfig,
}

impl Default for CredentialCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            encryption_key_secret: "cache-encryption-key".to_string(),
            breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 2,
                half_open_max_inflight: 1,
                min_calls_before_open: 1,
                operation_timeout: Duration::from_secs(10),
            },
        }
    }
}

struct CacheEntry {
    ciphertext: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    fetched_at: Instant,
}

/// Read-through credential cache.
pub struct CredentialCache {
    store: Box<dyn SecretStore>,
    config: CredentialCacheConfig,
    breaker: CircuitBreaker,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cipher: OnceCell<Aes256Gcm>,
}

impl CredentialCache {
    pub fn new(store: Box<dyn SecretStore>, config: CredentialCacheConfig) -> Self {
        let breaker = CircuitBreaker::new("secret-store", config.breaker.clone());
        Self {
            store,
            config,
            breaker,
            cache: Mutex::new(HashMap::new()),
            cipher: OnceCell::new(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch a credential, preferring a fresh cache entry. While the breaker
    /// is open, any cached entry (fresh or stale) is served as a fallback.
    pub async fn get_credential(
        &self,
        name: &str,
        force_refresh: bool,
    ) -> Result<String, CredentialError> {
        if !force_refresh {
            if let Some(value) = self.read_cache(name, self.config.ttl)? {
                return Ok(value);
            }
        }

        let fetched = self.breaker.call(self.store.get(name)).await;
        match fetched {
            Ok(value) => {
                self.write_cache(name, &value).await;
                Ok(value)
            }
            Err(CircuitError::Open {
                opened_at,
                retry_after,
                ..
            }) => {
                tracing::warn!(credential = name, "secret store circuit open");
                if let Some(value) = self.read_cache(name, Duration::MAX)? {
                    tracing::info!(
                        credential = name,
                        "serving cached credential while circuit is open"
                    );
                    return Ok(value);
                }
                Err(CredentialError::CircuitOpen {
                    opened_at,
                    retry_after,
                })
            }
            Err(CircuitError::Timeout(timeout)) => {
                tracing::error!(
                    credential = name,
                    timeout_secs = timeout.as_secs_f64(),
                    "secret store timeout"
                );
                Err(CredentialError::Timeout(timeout))
            }
            Err(CircuitError::Inner(e)) => {
                tracing::error!(credential = name, error = %e, "secret store error");
                Err(CredentialError::Store(e))
            }
        }
    }

    /// Drop one cached entry, forcing the next read through the store.
    pub fn invalidate(&self, name: &str) {
        self.cache.lock().remove(name);
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    fn read_cache(&self, name: &str, max_age: Duration) -> Result<Option<String>, CredentialError> {
        let cache = self.cache.lock();
        let Some(entry) = cache.get(name) else {
            return Ok(None);
        };
        if entry.fetched_at.elapsed() >= max_age {
            return Ok(None);
        }
        let Some(cipher) = self.cipher.get() else {
            // Key was never bootstrapped, so nothing valid can be cached.
            return Ok(None);
        };
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&entry.nonce), entry.ciphertext.as_ref())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        let value = String::from_utf8(plaintext)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        Ok(Some(value))
    }

    async fn write_cache(&self, name: &str, value: &str) {
        let cipher = match self.ensure_cipher().await {
            Ok(cipher) => cipher,
            Err(e) => {
                // Cache is an optimization; the fetched value still flows.
                tracing::warn!(error = %e, "cache encryption unavailable, skipping cache write");
                return;
            }
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        match cipher.encrypt(Nonce::from_slice(&nonce), value.as_bytes()) {
            Ok(ciphertext) => {
                self.cache.lock().insert(
                    name.to_string(),
                    CacheEntry {
                        ciphertext,
                        nonce,
                        fetched_at: Instant::now(),
                    },
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to encrypt cache entry");
            }
        }
    }

    async fn ensure_cipher(&self) -> Result<&Aes256Gcm, CredentialError> {
        self.cipher
            .get_or_try_init(|| async {
                let key_bytes = self.fetch_or_create_key().await?;
                Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)))
            })
            .await
    }

    async fn fetch_or_create_key(&self) -> Result<[u8; KEY_LEN], CredentialError> {
        let name = &self.config.encryption_key_secret;
        match self.store.get(name).await {
            Ok(encoded) => {
                let decoded = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| CredentialError::Encryption(e.to_string()))?;
                decoded.try_into().map_err(|_| {
                    CredentialError::Encryption(format!(
                        "encryption key secret '{name}' is not {KEY_LEN} bytes"
                    ))
                })
            }
            Err(SecretStoreError::NotFound(_)) => {
                let mut key = [0u8; KEY_LEN];
                rand::rngs::OsRng.fill_bytes(&mut key);
                self.store.set(name, &BASE64.encode(key)).await?;
                tracing::info!(secret = %name, "bootstrapped cache encryption key");
                Ok(key)
            }
            Err(e) => Err(CredentialError::Store(e)),
        }
    }
}

/// In-memory secret store used by tests and local development. Supports
/// simulating an outage via [`MemorySecretStore::set_available`].
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
    available: AtomicBool,
    get_calls: AtomicU64,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self {
            secrets: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            get_calls: AtomicU64::new(0),
        }
    }

    pub fn with_secret(self, name: &str, value: &str) -> Self {
        self.secrets
            .lock()
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<String, SecretStoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(SecretStoreError::Unavailable("simulated outage".into()));
        }
        self.secrets
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SecretStoreError::Unavailable("simulated outage".into()));
        }
        self.secrets
            .lock()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct SharedStore(Arc<MemorySecretStore>);

    #[async_trait]
    impl SecretStore for SharedStore {
        async fn get(&self, name: &str) -> Result<String, SecretStoreError> {
            self.0.get(name).await
        }

        async fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError> {
            self.0.set(name, value).await
        }
    }

    fn cache_over(
        store: Arc<MemorySecretStore>,
        config: CredentialCacheConfig,
    ) -> CredentialCache {
        CredentialCache::new(Box::new(SharedStore(store)), config)
    }

    #[tokio::test]
    async fn fetches_and_caches() {
        let store = Arc::new(MemorySecretStore::new().with_secret("db-password", "hunter2"));
        let cache = cache_over(store.clone(), CredentialCacheConfig::default());

        assert_eq!(
            cache.get_credential("db-password", false).await.unwrap(),
            "hunter2"
        );
        let calls_after_first = store.get_calls();

        assert_eq!(
            cache.get_credential("db-password", false).await.unwrap(),
            "hunter2"
        );
        // Second read served from cache: no further store traffic.
        assert_eq!(store.get_calls(), calls_after_first);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let store = Arc::new(MemorySecretStore::new().with_secret("api-key", "v1"));
        let cache = cache_over(store.clone(), CredentialCacheConfig::default());

        cache.get_credential("api-key", false).await.unwrap();
        store.set("api-key", "v2").await.unwrap();

        assert_eq!(
            cache.get_credential("api-key", false).await.unwrap(),
            "v1",
            "cached value without refresh"
        );
        assert_eq!(
            cache.get_credential("api-key", true).await.unwrap(),
            "v2",
            "fresh value with force_refresh"
        );
    }

    #[tokio::test]
    async fn bootstraps_encryption_key_once() {
        let store = Arc::new(MemorySecretStore::new().with_secret("cred", "value"));
        let cache = cache_over(store.clone(), CredentialCacheConfig::default());

        cache.get_credential("cred", false).await.unwrap();

        let stored_key = store.get("cache-encryption-key").await.unwrap();
        let decoded = BASE64.decode(stored_key).unwrap();
        assert_eq!(decoded.len(), KEY_LEN);
    }

    #[tokio::test]
    async fn not_found_is_terminal() {
        let store = Arc::new(MemorySecretStore::new());
        let cache = cache_over(store, CredentialCacheConfig::default());

        let err = cache.get_credential("missing", false).await.unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Store(SecretStoreError::NotFound(_))
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn circuit_open_falls_back_to_cache() {
        let store = Arc::new(MemorySecretStore::new().with_secret("key-A", "cached-value"));
        let cache = cache_over(store.clone(), CredentialCacheConfig::default());

        // Populate the cache for key-A while the store is healthy.
        cache.get_credential("key-A", false).await.unwrap();

        // Five consecutive failures for other keys open the breaker
        // (min_calls_before_open = 1 in the default config).
        store.set_available(false);
        for i in 0..5 {
            let name = format!("other-{i}");
            let _ = cache.get_credential(&name, false).await;
        }
        assert_eq!(
            cache.breaker().state(),
            crate::circuit_breaker::CircuitState::Open
        );

        let calls_before = store.get_calls();
        // key-A still resolves from the cache without touching the store.
        assert_eq!(
            cache.get_credential("key-A", false).await.unwrap(),
            "cached-value"
        );
        assert_eq!(store.get_calls(), calls_before);

        // key-B has no cached value: the open circuit surfaces.
        let err = cache.get_credential("key-B", false).await.unwrap_err();
        assert!(matches!(err, CredentialError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn stale_entry_served_when_circuit_open() {
        let config = CredentialCacheConfig {
            ttl: Duration::from_millis(10),
            ..CredentialCacheConfig::default()
        };
        let store = Arc::new(MemorySecretStore::new().with_secret("key-A", "old-value"));
        let cache = cache_over(store.clone(), config);

        cache.get_credential("key-A", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.set_available(false);
        for i in 0..5 {
            let _ = cache.get_credential(&format!("other-{i}"), false).await;
        }

        // Entry is past TTL, but the open circuit makes staleness acceptable.
        assert_eq!(
            cache.get_credential("key-A", false).await.unwrap(),
            "old-value"
        );
    }

    #[tokio::test]
    async fn invalidate_forces_store_read() {
        let store = Arc::new(MemorySecretStore::new().with_secret("cred", "v1"));
        let cache = cache_over(store.clone(), CredentialCacheConfig::default());

        cache.get_credential("cred", false).await.unwrap();
        store.set("cred", "v2").await.unwrap();
        cache.invalidate("cred");

        assert_eq!(cache.get_credential("cred", false).await.unwrap(), "v2");
    }
}
