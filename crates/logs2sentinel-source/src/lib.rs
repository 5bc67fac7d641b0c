// logs2sentinel-source - S3-compatible ingestion stage
//
// Lists new log objects since a watermark, fetches and decompresses them
// under a bounded worker pool, parses them into records, and hands batches
// to a sink callback. Per-object failures are summarized, never fatal to
// the cycle.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use logs2sentinel_core::LogParser;
use logs2sentinel_resilience::{retry, RateLimiter, RetryPolicy};
use opendal::Operator;

pub mod error;
mod fetch;
mod list;

pub use error::SourceError;
pub use fetch::{
    BatchContext, BatchSink, CycleMetrics, CycleSummary, FailedObject, ProcessedObject,
};
pub use list::ObjectDescriptor;

const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

#[derive(Debug, Clone)]
pub struct S3SourceConfig {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Bounded worker-pool width for object fetches.
    pub max_inflight_fetches: usize,
    /// Cap on raw keys examined per listing.
    pub max_keys_per_list: usize,
    /// Per-object batch bounds before the sink callback fires.
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for S3SourceConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: String::new(),
            prefix: String::new(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            max_inflight_fetches: 5,
            max_keys_per_list: 1000,
            batch_max_records: 1000,
            batch_max_bytes: 1_000_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Source stage over one (bucket, prefix) pair.
pub struct S3Source {
    operator: Operator,
    config: S3SourceConfig,
    rate_limiter: Arc<RateLimiter>,
}

impl S3Source {
    /// Build against a real S3-compatible endpoint.
    pub fn new(config: S3SourceConfig, rate_limiter: Arc<RateLimiter>) -> Result<Self, SourceError> {
        let mut builder = opendal::services::S3::default()
            .bucket(&config.bucket)
            .region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let Some(key) = &config.access_key_id {
            builder = builder.access_key_id(key);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.secret_access_key(secret);
        }

        let operator = Operator::new(builder)
            .map_err(|e| SourceError::from_opendal("failed to create S3 operator", e))?
            .finish();

        tracing::info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.prefix,
            "S3 source initialized"
        );
        Ok(Self {
            operator,
            config,
            rate_limiter,
        })
    }

    /// Build over an existing operator (tests, alternate backends).
    pub fn from_operator(
        operator: Operator,
        config: S3SourceConfig,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            operator,
            config,
            rate_limiter,
        }
    }

    /// List objects newer than `since`, filtered and sorted ascending by
    /// `last_modified`. Transient listing errors are retried under the
    /// configured policy; other errors propagate.
    pub async fn list(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ObjectDescriptor>, SourceError> {
        let descriptors = retry(&self.config.retry, || self.list_once()).await?;

        let mut filtered: Vec<ObjectDescriptor> = descriptors
            .into_iter()
            .filter(|d| list::passes_filters(d, since))
            .collect();
        filtered.sort_by_key(|d| d.last_modified);

        tracing::info!(
            count = filtered.len(),
            bucket = %self.config.bucket,
            prefix = %self.config.prefix,
            "found new objects"
        );
        Ok(filtered)
    }

    async fn list_once(&self) -> Result<Vec<ObjectDescriptor>, SourceError> {
        // Listing works on directory-style paths: non-empty prefixes need a
        // trailing slash.
        let prefix = match self.config.prefix.as_str() {
            "" => String::new(),
            p if p.ends_with('/') => p.to_string(),
            p => format!("{p}/"),
        };

        let mut lister = self
            .operator
            .lister_with(&prefix)
            .recursive(true)
            .await
            .map_err(|e| SourceError::from_opendal("list failed", e))?;

        let mut descriptors = Vec::new();
        let mut examined = 0usize;

        while let Some(entry) = lister
            .try_next()
            .await
            .map_err(|e| SourceError::from_opendal("list page failed", e))?
        {
            if examined >= self.config.max_keys_per_list {
                break;
            }
            examined += 1;

            let metadata = entry.metadata();
            if !metadata.mode().is_file() {
                continue;
            }

            // Some backends omit sizes or timestamps in listings; fall back
            // to a stat call before giving up on the object.
            let (size, last_modified, etag) =
                if metadata.last_modified().is_some() && metadata.content_length() > 0 {
                    (
                        metadata.content_length() as i64,
                        metadata.last_modified().unwrap_or_else(Utc::now),
                        metadata.etag().unwrap_or_default().to_string(),
                    )
                } else {
                    let stat = self.operator.stat(entry.path()).await;
                    let stat = stat.as_ref().unwrap_or(metadata);
                    (
                        stat.content_length() as i64,
                        stat.last_modified().unwrap_or_else(Utc::now),
                        stat.etag().unwrap_or_default().to_string(),
                    )
                };

            descriptors.push(ObjectDescriptor {
                key: entry.path().to_string(),
                size,
                last_modified,
                etag,
                storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            });
        }

        Ok(descriptors)
    }

    /// Fetch and parse `objects` in parallel, handing parsed batches to
    /// `sink`. Objects are offered to workers in ascending `last_modified`
    /// order; completion order is not guaranteed.
    pub async fn fetch_and_parse(
        &self,
        mut objects: Vec<ObjectDescriptor>,
        parser: &dyn LogParser,
        sink: &dyn BatchSink,
        log_type: &str,
    ) -> CycleSummary {
        let started = Instant::now();
        let mut summary = CycleSummary {
            metrics: CycleMetrics {
                total_files: objects.len(),
                total_bytes: objects.iter().map(|o| o.size).sum(),
                ..CycleMetrics::default()
            },
            ..CycleSummary::default()
        };

        if objects.is_empty() {
            tracing::info!("no objects to process in this batch");
            summary.finish(started);
            return summary;
        }

        objects.sort_by_key(|o| o.last_modified);

        let outcomes: Vec<(ObjectDescriptor, Result<usize, SourceError>)> =
            stream::iter(objects.into_iter().map(|descriptor| async move {
                let result = self.process_object(&descriptor, parser, sink, log_type).await;
                (descriptor, result)
            }))
            .buffer_unordered(self.config.max_inflight_fetches.max(1))
            .collect()
            .await;

        for (descriptor, result) in outcomes {
            match result {
                Ok(records) => {
                    tracing::debug!(key = %descriptor.key, records, "object processed");
                    summary.successful.push(ProcessedObject {
                        key: descriptor.key,
                        size: descriptor.size,
                        last_modified: descriptor.last_modified,
                        processed_at: Utc::now(),
                    });
                }
                Err(e) => {
                    tracing::warn!(key = %descriptor.key, error = %e, "failed to process object");
                    summary.failed.push(FailedObject {
                        key: descriptor.key,
                        error: e.to_string(),
                        time: Utc::now(),
                    });
                }
            }
        }

        summary.finish(started);
        summary
    }

    async fn process_object(
        &self,
        descriptor: &ObjectDescriptor,
        parser: &dyn LogParser,
        sink: &dyn BatchSink,
        log_type: &str,
    ) -> Result<usize, SourceError> {
        self.rate_limiter.acquire(1.0).await?;

        let raw = retry(&self.config.retry, || async {
            self.operator
                .read(&descriptor.key)
                .await
                .map_err(|e| SourceError::from_opendal("download failed", e))
        })
        .await?
        .to_vec();

        let payload = if descriptor.key.ends_with(".gz") {
            fetch::decompress_gzip(&descriptor.key, &raw)?
        } else {
            raw
        };

        let ctx = BatchContext {
            key: descriptor.key.clone(),
            log_type: log_type.to_string(),
        };
        fetch::parse_into_batches(
            descriptor,
            &payload,
            parser,
            sink,
            &ctx,
            self.config.batch_max_records,
            self.config.batch_max_bytes,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use logs2sentinel_core::{FirewallParser, JsonParser, Record};
    use parking_lot::Mutex;

    fn memory_source(config: S3SourceConfig) -> (S3Source, Operator) {
        let operator = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        let limiter = Arc::new(RateLimiter::new(1000.0, None).unwrap());
        (
            S3Source::from_operator(operator.clone(), config, limiter),
            operator,
        )
    }

    fn fast_config() -> S3SourceConfig {
        S3SourceConfig {
            max_inflight_fetches: 4,
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
                jitter: 0.0,
            },
            ..S3SourceConfig::default()
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<(String, Vec<Record>)>>,
        fail_for_key: Option<String>,
    }

    #[async_trait]
    impl BatchSink for CollectingSink {
        async fn handle(&self, records: Vec<Record>, ctx: &BatchContext) -> anyhow::Result<()> {
            if let Some(bad) = &self.fail_for_key {
                if &ctx.key == bad {
                    anyhow::bail!("simulated sink failure");
                }
            }
            self.batches.lock().push((ctx.key.clone(), records));
            Ok(())
        }
    }

    const LINE: &str = "2024-01-01T10:00:00Z|192.168.1.100|10.0.0.1|ALLOW|r1|TCP|80|443|1024";

    #[tokio::test]
    async fn lists_only_valid_objects() {
        let (source, operator) = memory_source(fast_config());
        operator.write("a.log", LINE.as_bytes().to_vec()).await.unwrap();
        operator.write("b.txt", b"nope".to_vec()).await.unwrap();
        operator.write("temp/c.log", b"wip".to_vec()).await.unwrap();
        operator.write("empty.log", Vec::<u8>::new()).await.unwrap();

        let objects = source.list(None).await.unwrap();
        let keys: Vec<&str> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a.log"]);
    }

    #[tokio::test]
    async fn listing_respects_key_cap() {
        let mut config = fast_config();
        config.max_keys_per_list = 2;
        let (source, operator) = memory_source(config);
        for i in 0..5 {
            operator
                .write(&format!("{i}.log"), LINE.as_bytes().to_vec())
                .await
                .unwrap();
        }
        let objects = source.list(None).await.unwrap();
        assert!(objects.len() <= 2);
    }

    #[tokio::test]
    async fn fetches_and_parses_line_oriented_objects() {
        let (source, operator) = memory_source(fast_config());
        let body = format!("{LINE}\n{LINE}\n");
        operator.write("fw.log", body.into_bytes()).await.unwrap();

        let objects = source.list(None).await.unwrap();
        let parser = FirewallParser::new();
        let sink = CollectingSink::default();
        let summary = source
            .fetch_and_parse(objects, &parser, &sink, "firewall")
            .await;

        assert_eq!(summary.successful.len(), 1);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.metrics.success_rate, 1.0);

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 2);
    }

    #[tokio::test]
    async fn gzip_objects_are_decompressed() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let (source, operator) = memory_source(fast_config());
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(LINE.as_bytes()).unwrap();
        operator
            .write("fw.log.gz", encoder.finish().unwrap())
            .await
            .unwrap();

        let objects = source.list(None).await.unwrap();
        let parser = FirewallParser::new();
        let sink = CollectingSink::default();
        let summary = source
            .fetch_and_parse(objects, &parser, &sink, "firewall")
            .await;

        assert_eq!(summary.successful.len(), 1);
        assert_eq!(sink.batches.lock()[0].1.len(), 1);
    }

    #[tokio::test]
    async fn json_objects_parse_as_single_documents() {
        let (source, operator) = memory_source(fast_config());
        operator
            .write("event.json", br#"{"host": "fw-1",
                "severity": 3}"#.to_vec())
            .await
            .unwrap();

        let objects = source.list(None).await.unwrap();
        let parser = JsonParser::new();
        let sink = CollectingSink::default();
        let summary = source
            .fetch_and_parse(objects, &parser, &sink, "json")
            .await;

        assert_eq!(summary.successful.len(), 1);
        assert_eq!(sink.batches.lock()[0].1.len(), 1);
    }

    #[tokio::test]
    async fn one_bad_object_does_not_abort_the_cycle() {
        let (source, operator) = memory_source(fast_config());
        operator.write("good-1.log", LINE.as_bytes().to_vec()).await.unwrap();
        operator.write("good-2.log", LINE.as_bytes().to_vec()).await.unwrap();
        operator
            .write("bad.log", b"unparseable garbage".to_vec())
            .await
            .unwrap();

        let objects = source.list(None).await.unwrap();
        let parser = FirewallParser::new();
        let sink = CollectingSink::default();
        let summary = source
            .fetch_and_parse(objects, &parser, &sink, "firewall")
            .await;

        assert_eq!(summary.successful.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].key, "bad.log");
        assert!((summary.metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_object_is_a_per_object_failure() {
        let (source, operator) = memory_source(fast_config());
        operator.write("keep.log", LINE.as_bytes().to_vec()).await.unwrap();
        operator.write("gone.log", LINE.as_bytes().to_vec()).await.unwrap();

        let objects = source.list(None).await.unwrap();
        operator.delete("gone.log").await.unwrap();

        let parser = FirewallParser::new();
        let sink = CollectingSink::default();
        let summary = source
            .fetch_and_parse(objects, &parser, &sink, "firewall")
            .await;

        assert_eq!(summary.successful.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].key, "gone.log");
        // Watermark candidate only reflects the successful object.
        assert_eq!(
            summary.max_successful_last_modified(),
            summary.successful.first().map(|o| o.last_modified)
        );
    }

    #[tokio::test]
    async fn sink_failure_fails_the_object() {
        let (source, operator) = memory_source(fast_config());
        operator.write("a.log", LINE.as_bytes().to_vec()).await.unwrap();
        operator.write("b.log", LINE.as_bytes().to_vec()).await.unwrap();

        let objects = source.list(None).await.unwrap();
        let parser = FirewallParser::new();
        let sink = CollectingSink {
            fail_for_key: Some("b.log".to_string()),
            ..CollectingSink::default()
        };
        let summary = source
            .fetch_and_parse(objects, &parser, &sink, "firewall")
            .await;

        assert_eq!(summary.successful.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].error.contains("simulated sink failure"));
    }

    #[tokio::test]
    async fn per_object_batches_split_at_record_cap() {
        let mut config = fast_config();
        config.batch_max_records = 2;
        let (source, operator) = memory_source(config);
        let body = format!("{LINE}\n{LINE}\n{LINE}\n{LINE}\n{LINE}\n");
        operator.write("fw.log", body.into_bytes()).await.unwrap();

        let objects = source.list(None).await.unwrap();
        let parser = FirewallParser::new();
        let sink = CollectingSink::default();
        source
            .fetch_and_parse(objects, &parser, &sink, "firewall")
            .await;

        let batches = sink.batches.lock();
        let sizes: Vec<usize> = batches.iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn empty_listing_yields_empty_summary() {
        let (source, _operator) = memory_source(fast_config());
        let parser = FirewallParser::new();
        let sink = CollectingSink::default();
        let summary = source
            .fetch_and_parse(Vec::new(), &parser, &sink, "firewall")
            .await;
        assert_eq!(summary.metrics.total_files, 0);
        assert!(summary.successful.is_empty());
        assert!(summary.failed.is_empty());
    }
}
