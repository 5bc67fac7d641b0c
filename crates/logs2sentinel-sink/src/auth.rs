//! Bearer-token acquisition for the Logs Ingestion endpoint
//!
//! OAuth2 client-credentials grant against the tenant's token endpoint. The
//! client secret comes out of the credential cache (and thus the secret
//! store); issued tokens are reused until shortly before expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use logs2sentinel_resilience::CredentialCache;

pub const DEFAULT_SCOPE: &str = "https://monitor.azure.com/.default";

// Refresh this long before the reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("token request failed: {0}")]
    Request(String),

    #[error("client secret lookup failed: {0}")]
    Credential(String),
}

/// Source of bearer tokens for the uploader.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;
}

/// Fixed token, for tests and pre-authorized environments.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// OAuth2 client-credentials token provider.
pub struct ClientCredentialsProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    scope: String,
    credentials: Arc<CredentialCache>,
    client_secret_name: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsProvider {
    pub fn new(
        tenant_id: &str,
        client_id: &str,
        credentials: Arc<CredentialCache>,
        client_secret_name: &str,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token"),
            client_id: client_id.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            credentials,
            client_secret_name: client_secret_name.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Point at a different token endpoint (tests, sovereign clouds).
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    fn cached_token(&self) -> Option<String> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|t| Instant::now() < t.expires_at)
            .map(|t| t.token.clone())
    }
}

#[async_trait]
impl AccessTokenProvider for ClientCredentialsProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let client_secret = self
            .credentials
            .get_credential(&self.client_secret_name, false)
            .await
            .map_err(|e| AuthError::Credential(e.to_string()))?;

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let expires_at = Instant::now()
            + Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        *self.cached.lock() = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });
        tracing::debug!(expires_in_secs = token.expires_in, "acquired access token");

        Ok(token.access_token)
    }
}
