//! Parallel fetch, decompress, and parse of listed objects
//!
//! Each object runs through: rate-limiter admission → read (with retry on
//! transient store errors) → gunzip for `.gz` keys → parse → validate →
//! per-object batch accumulation → sink hand-off. A failure is recorded
//! against the object in the cycle summary; it never aborts the cycle.

use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logs2sentinel_core::{record_json_size, LogParser, Record};
use metrics::counter;

use crate::error::SourceError;
use crate::list::ObjectDescriptor;

/// Receives parsed record batches from the source. One implementation routes
/// into the Sentinel sink; tests use in-memory collectors.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn handle(&self, records: Vec<Record>, ctx: &BatchContext) -> anyhow::Result<()>;
}

/// Context handed to the sink alongside each batch.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub key: String,
    pub log_type: String,
}

#[derive(Debug, Clone)]
pub struct ProcessedObject {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailedObject {
    pub key: String,
    pub error: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleMetrics {
    pub total_files: usize,
    pub total_bytes: i64,
    pub duration: Duration,
    pub success_rate: f64,
}

/// Outcome of one `fetch_and_parse` run.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub successful: Vec<ProcessedObject>,
    pub failed: Vec<FailedObject>,
    pub metrics: CycleMetrics,
}

impl CycleSummary {
    /// Watermark candidate: the greatest `last_modified` among successfully
    /// processed objects.
    pub fn max_successful_last_modified(&self) -> Option<DateTime<Utc>> {
        self.successful.iter().map(|o| o.last_modified).max()
    }

    pub(crate) fn finish(&mut self, started: std::time::Instant) {
        self.metrics.duration = started.elapsed();
        if self.metrics.total_files > 0 {
            self.metrics.success_rate =
                self.successful.len() as f64 / self.metrics.total_files as f64;
        }
        counter!(
            "source.objects.processed",
            self.successful.len() as u64
        );
        counter!("source.objects.failed", self.failed.len() as u64);
        tracing::info!(
            duration_secs = self.metrics.duration.as_secs_f64(),
            successful = self.successful.len(),
            failed = self.failed.len(),
            total = self.metrics.total_files,
            success_rate = self.metrics.success_rate,
            "object batch completed"
        );
        if !self.failed.is_empty() {
            let mut keys: Vec<&str> = self.failed.iter().map(|f| f.key.as_str()).collect();
            let truncated = keys.len() > 5;
            keys.truncate(5);
            tracing::warn!(
                failed_keys = keys.join(", "),
                truncated,
                "objects failed this cycle"
            );
        }
    }
}

/// How the raw payload splits into parser inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadFormat {
    /// One parser input per non-empty line (firewall exports, CSV).
    Lines,
    /// The whole payload is a single parser input (JSON documents).
    Whole,
}

/// `.gz` keys are judged by their inner extension.
pub(crate) fn payload_format(key: &str) -> PayloadFormat {
    let effective = key.strip_suffix(".gz").unwrap_or(key);
    if effective.ends_with(".json") {
        PayloadFormat::Whole
    } else {
        PayloadFormat::Lines
    }
}

pub(crate) fn decompress_gzip(key: &str, data: &[u8]) -> Result<Vec<u8>, SourceError> {
    let mut decoder = flate2::read::MultiGzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| SourceError::Decompress(format!("{key}: {e}")))?;
    Ok(out)
}

/// Parse one object's payload into batches and hand them to the sink.
///
/// Returns the number of records delivered. A parse error or sink failure
/// fails the object; a record rejected by `validate` is dropped and counted,
/// the object itself still succeeds.
pub(crate) async fn parse_into_batches(
    descriptor: &ObjectDescriptor,
    payload: &[u8],
    parser: &dyn LogParser,
    sink: &dyn BatchSink,
    ctx: &BatchContext,
    batch_max_records: usize,
    batch_max_bytes: usize,
) -> Result<usize, SourceError> {
    let mut batch: Vec<Record> = Vec::new();
    let mut batch_bytes = 0usize;
    let mut delivered = 0usize;
    let mut dropped = 0usize;

    let units: Vec<&[u8]> = match payload_format(&descriptor.key) {
        PayloadFormat::Whole => vec![payload],
        PayloadFormat::Lines => payload
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .collect(),
    };

    for unit in units {
        let record = parser.parse(unit)?;
        if !parser.validate(&record) {
            dropped += 1;
            counter!("source.records.invalid", 1);
            continue;
        }
        batch_bytes += record_json_size(&record);
        batch.push(record);

        if batch.len() >= batch_max_records || batch_bytes >= batch_max_bytes {
            delivered += batch.len();
            let full = std::mem::take(&mut batch);
            batch_bytes = 0;
            sink.handle(full, ctx)
                .await
                .map_err(|e| SourceError::Handler(e.to_string()))?;
        }
    }

    if !batch.is_empty() {
        delivered += batch.len();
        sink.handle(batch, ctx)
            .await
            .map_err(|e| SourceError::Handler(e.to_string()))?;
    }

    if dropped > 0 {
        tracing::warn!(
            key = %descriptor.key,
            dropped,
            "records failed parser validation and were dropped"
        );
    }

    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_follows_inner_extension() {
        assert_eq!(payload_format("a/b.log"), PayloadFormat::Lines);
        assert_eq!(payload_format("a/b.csv"), PayloadFormat::Lines);
        assert_eq!(payload_format("a/b.log.gz"), PayloadFormat::Lines);
        assert_eq!(payload_format("a/b.json"), PayloadFormat::Whole);
        assert_eq!(payload_format("a/b.json.gz"), PayloadFormat::Whole);
    }

    #[test]
    fn gzip_roundtrip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"line-1\nline-2\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let decompressed = decompress_gzip("x.log.gz", &compressed).unwrap();
        assert_eq!(decompressed, b"line-1\nline-2\n");
    }

    #[test]
    fn corrupt_gzip_is_a_decompress_error() {
        let err = decompress_gzip("x.log.gz", b"definitely not gzip").unwrap_err();
        assert!(matches!(err, SourceError::Decompress(_)));
    }
}
