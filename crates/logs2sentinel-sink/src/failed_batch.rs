//! Failed-batch persistence
//!
//! Batches whose upload terminally failed are persisted for later replay,
//! either in an S3-compatible container or a local directory (one code path
//! over an opendal operator). Persist is idempotent by batch id; PII is
//! redacted before anything touches disk.

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::TryStreamExt;
use logs2sentinel_core::Record;
use opendal::Operator;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::redact::redact_batch;

pub const ARCHIVE_SUBDIR: &str = "archived";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed-batch store I/O error: {0}")]
    Io(#[from] opendal::Error),

    #[error("failed-batch payload invalid: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The persisted document, one per failed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedBatchRecord {
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    pub error_category: String,
    pub error_message: String,
    pub retry_count: u32,
    pub data: Vec<Record>,
}

/// Stable content hash identifying a batch across persist attempts.
pub fn batch_id(records: &[Record]) -> String {
    // Records serialize deterministically (ordered maps), so the hash is
    // stable for identical content.
    let serialized = serde_json::to_vec(records).unwrap_or_default();
    blake3::hash(&serialized).to_hex().to_string()
}

fn safe_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true).replace(':', "-")
}

/// Object/directory store for failed batches.
#[derive(Clone)]
pub struct FailedBatchStore {
    operator: Operator,
}

impl FailedBatchStore {
    /// Local-directory backend.
    pub fn new_fs(root: &str) -> Result<Self, StoreError> {
        let builder = opendal::services::Fs::default().root(root);
        let operator = Operator::new(builder)?.finish();
        Ok(Self { operator })
    }

    /// S3-compatible container backend.
    pub fn new_s3(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key_id: Option<&str>,
        secret_access_key: Option<&str>,
        prefix: Option<&str>,
    ) -> Result<Self, StoreError> {
        let mut builder = opendal::services::S3::default()
            .bucket(bucket)
            .region(region);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let Some(key) = access_key_id {
            builder = builder.access_key_id(key);
        }
        if let Some(secret) = secret_access_key {
            builder = builder.secret_access_key(secret);
        }
        if let Some(prefix) = prefix {
            builder = builder.root(prefix);
        }
        let operator = Operator::new(builder)?.finish();
        Ok(Self { operator })
    }

    /// Wrap an existing operator (tests).
    pub fn from_operator(operator: Operator) -> Self {
        Self { operator }
    }

    pub(crate) fn operator(&self) -> &Operator {
        &self.operator
    }

    /// Persist one failed batch. Returns the stored object name, or `None`
    /// when a document for the same batch id already exists (idempotent
    /// re-persist).
    pub async fn persist(
        &self,
        records: &[Record],
        error_category: &str,
        error_message: &str,
        retry_count: u32,
    ) -> Result<Option<String>, StoreError> {
        let id = batch_id(records);

        if self.exists(&id).await? {
            tracing::debug!(batch_id = %id, "failed batch already persisted");
            return Ok(None);
        }

        let document = FailedBatchRecord {
            batch_id: id.clone(),
            timestamp: Utc::now(),
            error_category: error_category.to_string(),
            error_message: error_message.to_string(),
            retry_count,
            data: redact_batch(records),
        };

        let name = format!(
            "failed-batch-{}-{}.json",
            document.batch_id,
            safe_timestamp(document.timestamp)
        );
        let body = serde_json::to_vec_pretty(&document)?;
        self.operator.write(&name, body).await?;

        tracing::info!(
            batch_id = %id,
            object = %name,
            category = error_category,
            records = records.len(),
            "persisted failed batch"
        );
        Ok(Some(name))
    }

    async fn exists(&self, batch_id: &str) -> Result<bool, StoreError> {
        let prefix = format!("failed-batch-{batch_id}-");
        Ok(self
            .list_files()
            .await?
            .iter()
            .any(|name| name.starts_with(&prefix)))
    }

    /// Persisted failed-batch files at the store root (excludes the
    /// archive), sorted by name.
    pub async fn list_files(&self) -> Result<Vec<String>, StoreError> {
        let mut lister = self.operator.lister("").await?;
        let mut names = Vec::new();
        while let Some(entry) = lister.try_next().await? {
            let path = entry.path();
            if entry.metadata().mode().is_file()
                && path.ends_with(".json")
                && !path.contains(ARCHIVE_SUBDIR)
            {
                names.push(path.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn read(&self, name: &str) -> Result<FailedBatchRecord, StoreError> {
        let raw = self.operator.read(name).await?.to_vec();
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Move a replayed file under `archived/`, suffixed with the replay
    /// timestamp.
    pub async fn archive(&self, name: &str) -> Result<String, StoreError> {
        let stem = name.strip_suffix(".json").unwrap_or(name);
        let archived = format!(
            "{ARCHIVE_SUBDIR}/{stem}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%SZ")
        );
        self.operator.copy(name, &archived).await?;
        self.operator.delete(name).await?;
        tracing::info!(from = name, to = %archived, "archived replayed batch");
        Ok(archived)
    }
}
