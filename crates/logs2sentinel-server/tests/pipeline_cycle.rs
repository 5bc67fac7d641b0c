//! Runner behavior over a local-filesystem source and a fake uploader:
//! watermark advancement, cycle failure handling, and graceful shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use logs2sentinel_core::{FirewallParser, TableConfig};
use logs2sentinel_resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter};
use logs2sentinel_server::runner::{PipelineRunner, ShutdownSignal};
use logs2sentinel_sink::{
    BatchUploader, FailedBatchStore, SentinelSink, SentinelSinkConfig, UploadError,
};
use logs2sentinel_source::{S3Source, S3SourceConfig};
use tempfile::TempDir;

#[derive(Default)]
struct CountingUploader {
    uploads: AtomicUsize,
}

#[async_trait]
impl BatchUploader for CountingUploader {
    async fn upload(&self, _body: Bytes, _compressed: bool) -> Result<(), UploadError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct UploaderHandle(Arc<CountingUploader>);

#[async_trait]
impl BatchUploader for UploaderHandle {
    async fn upload(&self, body: Bytes, compressed: bool) -> Result<(), UploadError> {
        self.0.upload(body, compressed).await
    }
}

const LINE: &str = "2024-01-01T10:00:00Z|192.168.1.100|10.0.0.1|ALLOW|r1|TCP|80|443|1024";

struct Harness {
    runner: PipelineRunner,
    uploader: Arc<CountingUploader>,
    // Kept alive for the duration of the test.
    _source_dir: TempDir,
}

fn harness(source_dir: TempDir) -> Harness {
    let operator = opendal::Operator::new(
        opendal::services::Fs::default().root(source_dir.path().to_str().unwrap()),
    )
    .unwrap()
    .finish();

    let rate_limiter = Arc::new(RateLimiter::new(1000.0, None).unwrap());
    let source = S3Source::from_operator(
        operator,
        S3SourceConfig {
            max_inflight_fetches: 4,
            ..S3SourceConfig::default()
        },
        Arc::clone(&rate_limiter),
    );

    let uploader = Arc::new(CountingUploader::default());
    let mut tables = BTreeMap::new();
    tables.insert("firewall".to_string(), TableConfig::firewall_default());
    let sink = SentinelSink::new(
        tables,
        Box::new(UploaderHandle(Arc::clone(&uploader))),
        CircuitBreaker::new("sentinel", CircuitBreakerConfig::default()),
        rate_limiter,
        FailedBatchStore::from_operator(
            opendal::Operator::new(opendal::services::Memory::default())
                .unwrap()
                .finish(),
        ),
        SentinelSinkConfig::default(),
    );

    let (_handle, shutdown) = ShutdownSignal::new();
    let runner = PipelineRunner::new(
        source,
        Arc::new(sink),
        Box::new(FirewallParser::new()),
        "firewall".to_string(),
        shutdown,
    );

    Harness {
        runner,
        uploader,
        _source_dir: source_dir,
    }
}

fn write_log(dir: &TempDir, name: &str, lines: usize) {
    let body = format!("{LINE}\n").repeat(lines);
    std::fs::write(dir.path().join(name), body).unwrap();
}

#[tokio::test]
async fn cycle_processes_objects_and_advances_watermark() {
    let dir = TempDir::new().unwrap();
    write_log(&dir, "a.log", 2);
    write_log(&dir, "b.log", 3);
    let h = harness(dir);

    assert_eq!(h.runner.watermark(), None);
    let summary = h.runner.run_once().await.unwrap();

    assert_eq!(summary.successful.len(), 2);
    assert!(summary.failed.is_empty());
    assert!(h.uploader.uploads.load(Ordering::SeqCst) >= 1);
    assert!(h.runner.watermark().is_some());

    let state = h.runner.state().read().clone();
    assert!(state.ready);
    assert_eq!(state.cycles_total, 1);
    assert_eq!(state.processed_files_total, 2);
    assert_eq!(state.last_error, None);
    assert!(state.last_cycle_duration_seconds >= 0.0);
}

#[tokio::test]
async fn watermark_filters_already_processed_objects() {
    let dir = TempDir::new().unwrap();
    write_log(&dir, "a.log", 1);
    let h = harness(dir);

    h.runner.run_once().await.unwrap();
    let watermark_after_first = h.runner.watermark();
    let uploads_after_first = h.uploader.uploads.load(Ordering::SeqCst);

    // Nothing new: the second cycle sees an empty listing.
    let summary = h.runner.run_once().await.unwrap();
    assert!(summary.successful.is_empty());
    assert_eq!(h.uploader.uploads.load(Ordering::SeqCst), uploads_after_first);
    // Watermark is monotonically non-decreasing.
    assert_eq!(h.runner.watermark(), watermark_after_first);
}

#[tokio::test]
async fn new_objects_are_picked_up_after_the_watermark() {
    let dir = TempDir::new().unwrap();
    write_log(&dir, "a.log", 1);
    let path = dir.path().to_path_buf();
    let h = harness(dir);

    h.runner.run_once().await.unwrap();
    let first_watermark = h.runner.watermark();

    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(path.join("c.log"), format!("{LINE}\n")).unwrap();

    let summary = h.runner.run_once().await.unwrap();
    assert_eq!(summary.successful.len(), 1);
    assert_eq!(summary.successful[0].key, "c.log");
    assert!(h.runner.watermark() >= first_watermark);
}

#[tokio::test]
async fn failed_cycle_keeps_watermark_and_clears_ready() {
    let dir = TempDir::new().unwrap();
    write_log(&dir, "a.log", 1);
    let path = dir.path().to_path_buf();
    let h = harness(dir);

    h.runner.run_once().await.unwrap();
    let watermark = h.runner.watermark();
    assert!(h.runner.state().read().ready);

    // Replace the source root with a regular file so the next listing fails
    // outright.
    std::fs::remove_dir_all(&path).unwrap();
    std::fs::write(&path, b"not a directory").unwrap();

    let result = h.runner.run_once().await;
    assert!(result.is_err());

    let state = h.runner.state().read().clone();
    assert!(!state.ready);
    assert!(state.last_error.is_some());
    // A failed cycle must not advance the watermark.
    assert_eq!(h.runner.watermark(), watermark);
}

#[tokio::test]
async fn run_forever_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    write_log(&dir, "a.log", 1);

    let operator = opendal::Operator::new(
        opendal::services::Fs::default().root(dir.path().to_str().unwrap()),
    )
    .unwrap()
    .finish();
    let rate_limiter = Arc::new(RateLimiter::new(1000.0, None).unwrap());
    let source = S3Source::from_operator(
        operator,
        S3SourceConfig::default(),
        Arc::clone(&rate_limiter),
    );

    let uploader = Arc::new(CountingUploader::default());
    let mut tables = BTreeMap::new();
    tables.insert("firewall".to_string(), TableConfig::firewall_default());
    let sink = SentinelSink::new(
        tables,
        Box::new(UploaderHandle(Arc::clone(&uploader))),
        CircuitBreaker::new("sentinel", CircuitBreakerConfig::default()),
        rate_limiter,
        FailedBatchStore::from_operator(
            opendal::Operator::new(opendal::services::Memory::default())
                .unwrap()
                .finish(),
        ),
        SentinelSinkConfig::default(),
    );

    let (handle, shutdown) = ShutdownSignal::new();
    let runner = Arc::new(PipelineRunner::new(
        source,
        Arc::new(sink),
        Box::new(FirewallParser::new()),
        "firewall".to_string(),
        shutdown,
    ));

    let loop_runner = Arc::clone(&runner);
    let run_loop = tokio::spawn(async move {
        loop_runner
            .run_forever(Duration::from_secs(60), Duration::from_secs(5))
            .await;
    });

    // Give the first cycle a moment, then request shutdown.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown();

    tokio::time::timeout(Duration::from_secs(5), run_loop)
        .await
        .expect("run_forever should stop promptly after shutdown")
        .unwrap();

    assert!(!runner.state().read().running);
}
