//! Batch upload to the Logs Ingestion endpoint
//!
//! One POST per batch to
//! `{endpoint}/dataCollectionRules/{rule_id}/streams/{stream}?api-version=2023-01-01`
//! with a bearer token, a JSON-array body, and optional gzip encoding. The
//! endpoint is authoritative about schema validation; our preflight checks
//! are best-effort.

use async_trait::async_trait;
use bytes::Bytes;
use logs2sentinel_core::Retryable;
use thiserror::Error;

use crate::auth::AccessTokenProvider;

pub const API_VERSION: &str = "2023-01-01";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("ingestion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failure: {0}")]
    Network(String),

    #[error("token acquisition failed: {0}")]
    Auth(String),

    #[error("body encoding failed: {0}")]
    Encode(String),
}

impl UploadError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UploadError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            UploadError::Network(e.to_string())
        } else {
            UploadError::Network(e.to_string())
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Retryable for UploadError {
    fn is_retryable(&self) -> bool {
        match self {
            UploadError::Status { status, .. } => *status == 429 || *status >= 500,
            UploadError::Timeout(_) | UploadError::Network(_) => true,
            UploadError::Auth(_) | UploadError::Encode(_) => false,
        }
    }
}

/// Upload seam; the production implementation talks to a Data Collection
/// Rule, tests swap in recording fakes.
#[async_trait]
pub trait BatchUploader: Send + Sync {
    /// `body` is a JSON array of records, already gzip-compressed when
    /// `compressed` is true.
    async fn upload(&self, body: Bytes, compressed: bool) -> Result<(), UploadError>;
}

/// Production uploader for the Logs Ingestion API.
pub struct DcrUploader {
    client: reqwest::Client,
    url: String,
    token_provider: Box<dyn AccessTokenProvider>,
}

impl DcrUploader {
    pub fn new(
        dcr_endpoint: &str,
        rule_id: &str,
        stream_name: &str,
        token_provider: Box<dyn AccessTokenProvider>,
    ) -> Self {
        let url = format!(
            "{}/dataCollectionRules/{}/streams/{}?api-version={}",
            dcr_endpoint.trim_end_matches('/'),
            rule_id,
            stream_name,
            API_VERSION
        );
        Self {
            client: reqwest::Client::new(),
            url,
            token_provider,
        }
    }
}

#[async_trait]
impl BatchUploader for DcrUploader {
    async fn upload(&self, body: Bytes, compressed: bool) -> Result<(), UploadError> {
        let token = self
            .token_provider
            .access_token()
            .await
            .map_err(|e| UploadError::Auth(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if compressed {
            request = request.header(reqwest::header::CONTENT_ENCODING, "gzip");
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(UploadError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(UploadError::Status {
            status: status.as_u16(),
            body: truncate(&body, 512),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}
