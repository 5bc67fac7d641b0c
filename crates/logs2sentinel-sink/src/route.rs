//! Per-table routing: transform, coerce, validate, batch, upload
//!
//! `route` is the sink's single entry point. Records are transformed against
//! the table schema, dropped records are counted by reason and never resent,
//! surviving records are partitioned into batches and uploaded concurrently
//! under `max_concurrent_batches`. A batch that terminally fails upload is
//! categorised and persisted for replay.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use logs2sentinel_core::{Record, Scalar, SemanticType, TableConfig};
use logs2sentinel_resilience::{CircuitBreaker, CircuitError, CircuitState, RateLimiter};
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;

use crate::failed_batch::FailedBatchStore;
use crate::upload::{BatchUploader, UploadError};

// One structured warning per this many batch failures.
const FAILURE_WARN_EVERY: u64 = 10;

const DEGRADED_FAILURE_RATIO: f64 = 0.05;
const DEGRADED_DROP_RATIO: f64 = 0.10;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("unsupported log type: {0}")]
    UnknownLogType(String),
}

/// Terminal outcome of one `route` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub processed: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Successfully uploaded batches.
    pub batch_count: usize,
    pub drop_reasons: BTreeMap<String, usize>,
    pub failure_reasons: BTreeMap<String, usize>,
}

impl RouteReport {
    pub fn records_in(&self) -> usize {
        self.processed + self.failed + self.dropped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct SinkHealth {
    pub status: HealthStatus,
    pub failure_ratio: f64,
    pub drop_ratio: f64,
    pub circuit_state: CircuitState,
    pub records_processed: u64,
    pub failed_batch_count: u64,
    pub last_ingestion_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SinkMetrics {
    records_processed: u64,
    records_failed: u64,
    records_dropped: u64,
    batch_count: u64,
    failed_batch_count: u64,
    bytes_ingested: u64,
    drop_reasons: BTreeMap<String, u64>,
    failure_reasons: BTreeMap<String, u64>,
    last_ingestion_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SentinelSinkConfig {
    pub max_concurrent_batches: usize,
    pub data_classification: String,
}

impl Default for SentinelSinkConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 4,
            data_classification: "standard".to_string(),
        }
    }
}

/// Router from parsed records to the ingestion endpoint, one instance per
/// pipeline with one `TableConfig` per log type.
pub struct SentinelSink {
    tables: BTreeMap<String, TableConfig>,
    uploader: Box<dyn BatchUploader>,
    breaker: CircuitBreaker,
    rate_limiter: Arc<RateLimiter>,
    failed_store: FailedBatchStore,
    config: SentinelSinkConfig,
    metrics: Mutex<SinkMetrics>,
}

impl SentinelSink {
    pub fn new(
        tables: BTreeMap<String, TableConfig>,
        uploader: Box<dyn BatchUploader>,
        breaker: CircuitBreaker,
        rate_limiter: Arc<RateLimiter>,
        failed_store: FailedBatchStore,
        config: SentinelSinkConfig,
    ) -> Self {
        Self {
            tables,
            uploader,
            breaker,
            rate_limiter,
            failed_store,
            config,
            metrics: Mutex::new(SinkMetrics::default()),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn failed_store(&self) -> &FailedBatchStore {
        &self.failed_store
    }

    /// Route `records` to the table registered for `log_type`.
    pub async fn route(
        &self,
        log_type: &str,
        records: Vec<Record>,
    ) -> Result<RouteReport, SinkError> {
        let table = self
            .tables
            .get(log_type)
            .ok_or_else(|| SinkError::UnknownLogType(log_type.to_string()))?;

        let mut report = RouteReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        // Transform + coerce + required-field check; failures drop here.
        let mut prepared: Vec<Record> = Vec::with_capacity(records.len());
        for record in &records {
            match prepare_record(record, table, &self.config.data_classification) {
                Ok(out) => prepared.push(out),
                Err(reason) => {
                    tracing::warn!(log_type, reason = %reason, "dropping record");
                    report.dropped += 1;
                    *report.drop_reasons.entry(reason).or_default() += 1;
                }
            }
        }

        // Partition into bounded batches and dispatch concurrently.
        let batches: Vec<Vec<Record>> = prepared
            .chunks(table.max_batch_records.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        let outcomes: Vec<BatchOutcome> = stream::iter(
            batches
                .into_iter()
                .map(|batch| self.dispatch_batch(batch, table)),
        )
        .buffer_unordered(self.config.max_concurrent_batches.max(1))
        .collect()
        .await;

        let mut uploaded_bytes = 0u64;
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Uploaded { records, bytes } => {
                    report.processed += records;
                    report.batch_count += 1;
                    uploaded_bytes += bytes;
                }
                BatchOutcome::Failed {
                    records,
                    category,
                    ..
                } => {
                    report.failed += records;
                    *report.failure_reasons.entry(category).or_default() += 1;
                }
            }
        }

        self.update_metrics(&report, uploaded_bytes);
        counter!("sink.records.processed", report.processed as u64);
        counter!("sink.records.failed", report.failed as u64);
        counter!("sink.records.dropped", report.dropped as u64);

        Ok(report)
    }

    async fn dispatch_batch(&self, batch: Vec<Record>, table: &TableConfig) -> BatchOutcome {
        let records = batch.len();

        let body = match serde_json::to_vec(&batch) {
            Ok(body) => body,
            Err(e) => {
                return self
                    .fail_batch(batch, "validation_error".to_string(), e.to_string())
                    .await;
            }
        };
        let (body, compressed) = if table.compression {
            match gzip(&body) {
                Ok(compressed_body) => (compressed_body, true),
                Err(e) => {
                    return self
                        .fail_batch(batch, "validation_error".to_string(), e.to_string())
                        .await;
                }
            }
        } else {
            (body, false)
        };
        let bytes = body.len() as u64;
        let payload = Bytes::from(body);

        let result = self
            .breaker
            .call(async {
                self.rate_limiter
                    .acquire(1.0)
                    .await
                    .map_err(|e| UploadError::Network(format!("rate limiter: {e}")))?;
                self.uploader.upload(payload, compressed).await
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(records, bytes, table = %table.name, "batch uploaded");
                BatchOutcome::Uploaded { records, bytes }
            }
            Err(e) => {
                let category = categorize_failure(&e);
                self.fail_batch(batch, category, e.to_string()).await
            }
        }
    }

    async fn fail_batch(
        &self,
        batch: Vec<Record>,
        category: String,
        message: String,
    ) -> BatchOutcome {
        let records = batch.len();
        tracing::error!(
            records,
            category = %category,
            error = %message,
            "batch upload failed"
        );

        if let Err(e) = self
            .failed_store
            .persist(&batch, &category, &message, 0)
            .await
        {
            // Last resort: durability failed too, keep the evidence in logs.
            tracing::error!(error = %e, category = %category, "failed to persist failed batch");
        }

        BatchOutcome::Failed { records, category }
    }

    fn update_metrics(&self, report: &RouteReport, uploaded_bytes: u64) {
        let mut m = self.metrics.lock();
        m.records_processed += report.processed as u64;
        m.records_failed += report.failed as u64;
        m.records_dropped += report.dropped as u64;
        m.batch_count += report.batch_count as u64;
        m.bytes_ingested += uploaded_bytes;
        if report.processed > 0 {
            m.last_ingestion_time = Some(Utc::now());
        }
        for (reason, count) in &report.drop_reasons {
            *m.drop_reasons.entry(reason.clone()).or_default() += *count as u64;
        }

        for (reason, count) in &report.failure_reasons {
            *m.failure_reasons.entry(reason.clone()).or_default() += *count as u64;
        }
        let failed_batches_before = m.failed_batch_count;
        m.failed_batch_count += report.failure_reasons.values().sum::<usize>() as u64;

        // Cadenced warning: once per FAILURE_WARN_EVERY batch failures.
        if m.failed_batch_count / FAILURE_WARN_EVERY > failed_batches_before / FAILURE_WARN_EVERY {
            let top_failures = top_reasons(&m.failure_reasons, 3);
            let top_drops = top_reasons(&m.drop_reasons, 3);
            tracing::warn!(
                failed_batches = m.failed_batch_count,
                top_failure_reasons = %top_failures,
                top_drop_reasons = %top_drops,
                "sustained batch failures"
            );
        }
    }

    /// Continuous health derivation: degraded on elevated batch-failure or
    /// record-drop ratios, or while the breaker is not closed.
    pub fn health(&self) -> SinkHealth {
        let m = self.metrics.lock();
        let total_batches = m.batch_count + m.failed_batch_count;
        let failure_ratio = if total_batches > 0 {
            m.failed_batch_count as f64 / total_batches as f64
        } else {
            0.0
        };
        let records_in = m.records_processed + m.records_failed + m.records_dropped;
        let drop_ratio = if records_in > 0 {
            m.records_dropped as f64 / records_in as f64
        } else {
            0.0
        };
        let circuit_state = self.breaker.state();

        let degraded = failure_ratio > DEGRADED_FAILURE_RATIO
            || drop_ratio > DEGRADED_DROP_RATIO
            || circuit_state != CircuitState::Closed;

        SinkHealth {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            failure_ratio,
            drop_ratio,
            circuit_state,
            records_processed: m.records_processed,
            failed_batch_count: m.failed_batch_count,
            last_ingestion_time: m.last_ingestion_time,
        }
    }
}

enum BatchOutcome {
    Uploaded { records: usize, bytes: u64 },
    Failed { records: usize, category: String },
}

fn top_reasons(reasons: &BTreeMap<String, u64>, n: usize) -> String {
    let mut entries: Vec<(&String, &u64)> = reasons.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1));
    entries
        .into_iter()
        .take(n)
        .map(|(reason, count)| format!("{reason}={count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn categorize_failure(error: &CircuitError<UploadError>) -> String {
    match error {
        CircuitError::Open { .. } => "circuit_breaker_open".to_string(),
        CircuitError::Timeout(_) => "network_timeout".to_string(),
        CircuitError::Inner(UploadError::Status { status, .. }) => {
            format!("azure_error:{status}")
        }
        CircuitError::Inner(UploadError::Timeout(_)) => "network_timeout".to_string(),
        CircuitError::Inner(UploadError::Network(_)) => "network_connection".to_string(),
        CircuitError::Inner(UploadError::Encode(_)) => "validation_error".to_string(),
        CircuitError::Inner(UploadError::Auth(_)) => "unknown_error:auth".to_string(),
    }
}

/// Transform one record against the table schema.
///
/// Rename via `transform_map`, preserve fields the schema knows, stamp
/// metadata, coerce types, then enforce required fields. Returns the drop
/// reason on failure.
fn prepare_record(
    record: &Record,
    table: &TableConfig,
    data_classification: &str,
) -> Result<Record, String> {
    let mut out = Record::new();

    for (source, target) in &table.transform_map {
        if let Some(value) = record.get(source) {
            out.insert(target.clone(), value.clone());
        }
    }

    // Preserve fields already named by the schema; renamed values win.
    for (key, value) in record {
        if table.required_fields.contains(key) || table.type_map.contains_key(key) {
            out.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    if !out.contains_key("TimeGenerated") {
        out.insert("TimeGenerated".to_string(), Scalar::Timestamp(Utc::now()));
    }
    out.insert(
        "DataClassification".to_string(),
        Scalar::String(data_classification.to_string()),
    );
    out.insert(
        "SchemaVersion".to_string(),
        Scalar::String(table.schema_version.clone()),
    );

    for (field, semantic_type) in &table.type_map {
        if let Some(value) = out.get(field) {
            let coerced = coerce(value, *semantic_type)
                .map_err(|_| format!("preparation_error:{semantic_type}"))?;
            out.insert(field.clone(), coerced);
        }
    }

    let missing: Vec<&str> = table
        .required_fields
        .iter()
        .filter(|field| !out.contains_key(*field))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing_fields:{}", missing.join(",")));
    }

    Ok(out)
}

/// Convert one scalar to the table's semantic type. `Null` passes through
/// unchanged; the required-field check is about presence, not value.
fn coerce(value: &Scalar, target: SemanticType) -> Result<Scalar, ()> {
    if value.is_null() {
        return Ok(Scalar::Null);
    }
    match target {
        SemanticType::Datetime => match value {
            Scalar::Timestamp(ts) => Ok(Scalar::String(Scalar::to_rfc3339(ts))),
            Scalar::String(s) => Ok(Scalar::String(s.clone())),
            _ => Err(()),
        },
        SemanticType::Long => match value {
            Scalar::Int(i) => Ok(Scalar::Int(*i)),
            Scalar::Float(f) => Ok(Scalar::Int(*f as i64)),
            Scalar::Bool(b) => Ok(Scalar::Int(i64::from(*b))),
            Scalar::String(s) => s.trim().parse::<i64>().map(Scalar::Int).map_err(|_| ()),
            _ => Err(()),
        },
        SemanticType::Double => match value {
            Scalar::Float(f) => Ok(Scalar::Float(*f)),
            Scalar::Int(i) => Ok(Scalar::Float(*i as f64)),
            Scalar::Bool(b) => Ok(Scalar::Float(f64::from(u8::from(*b)))),
            Scalar::String(s) => s.trim().parse::<f64>().map(Scalar::Float).map_err(|_| ()),
            _ => Err(()),
        },
        SemanticType::Boolean => match value {
            Scalar::Bool(b) => Ok(Scalar::Bool(*b)),
            Scalar::Int(i) => Ok(Scalar::Bool(*i != 0)),
            Scalar::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Ok(Scalar::Bool(true)),
                "false" => Ok(Scalar::Bool(false)),
                _ => Err(()),
            },
            _ => Err(()),
        },
        SemanticType::String => match value {
            Scalar::String(s) => Ok(Scalar::String(s.clone())),
            Scalar::Int(i) => Ok(Scalar::String(i.to_string())),
            Scalar::Float(f) => Ok(Scalar::String(f.to_string())),
            Scalar::Bool(b) => Ok(Scalar::String(b.to_string())),
            Scalar::Timestamp(ts) => Ok(Scalar::String(Scalar::to_rfc3339(ts))),
            Scalar::Null => Ok(Scalar::Null),
        },
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
