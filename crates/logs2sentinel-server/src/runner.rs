//! Pipeline orchestration
//!
//! One `run_once` cycle: list new objects since the watermark, fetch and
//! parse them in parallel, route parsed batches through the sink, then
//! advance the watermark to the greatest `last_modified` among successfully
//! processed objects. `run_forever` loops cycles with a cancellable poll
//! wait and honors SIGINT/SIGTERM.
//!
//! The runner alone owns the watermark and cycle-level state; the source
//! returns data but never mutates either.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logs2sentinel_core::{LogParser, Record};
use logs2sentinel_sink::SentinelSink;
use logs2sentinel_source::{BatchContext, BatchSink, CycleSummary, S3Source};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

// A failing cycle backs off by at most this much before the next attempt.
const ERROR_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Runtime state published for the health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    pub running: bool,
    pub ready: bool,
    pub started_at: DateTime<Utc>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cycles_total: u64,
    pub processed_files_total: u64,
    pub failed_files_total: u64,
    pub last_cycle_duration_seconds: f64,
    pub watermark: Option<DateTime<Utc>>,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            running: false,
            ready: false,
            started_at: Utc::now(),
            last_success_time: None,
            last_error: None,
            cycles_total: 0,
            processed_files_total: 0,
            failed_files_total: 0,
            last_cycle_duration_seconds: 0.0,
            watermark: None,
        }
    }
}

/// Process-wide shutdown flag. Cloneable receiver half; the sender side
/// lives with the signal handlers.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownHandle, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, ShutdownSignal { rx })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. If the sender half is gone,
    /// shutdown can never arrive; stay pending rather than firing spuriously.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Adapts the sink's `route` to the source's batch callback.
struct RouteSink {
    sink: Arc<SentinelSink>,
}

#[async_trait]
impl BatchSink for RouteSink {
    async fn handle(&self, records: Vec<Record>, ctx: &BatchContext) -> Result<()> {
        // Batch failures are persisted by the sink and counted in its
        // metrics; only an unknown log type propagates as an object failure.
        self.sink.route(&ctx.log_type, records).await?;
        Ok(())
    }
}

/// Owns the cycle loop, watermark, and published state.
pub struct PipelineRunner {
    source: S3Source,
    sink: Arc<SentinelSink>,
    parser: Box<dyn LogParser>,
    log_type: String,
    state: Arc<RwLock<PipelineState>>,
    watermark: RwLock<Option<DateTime<Utc>>>,
    shutdown: ShutdownSignal,
}

impl PipelineRunner {
    pub fn new(
        source: S3Source,
        sink: Arc<SentinelSink>,
        parser: Box<dyn LogParser>,
        log_type: String,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            sink,
            parser,
            log_type,
            state: Arc::new(RwLock::new(PipelineState::new())),
            watermark: RwLock::new(None),
            shutdown,
        }
    }

    /// Shared state handle for the health endpoints.
    pub fn state(&self) -> Arc<RwLock<PipelineState>> {
        Arc::clone(&self.state)
    }

    pub fn sink(&self) -> Arc<SentinelSink> {
        Arc::clone(&self.sink)
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.read()
    }

    /// Run one ingest cycle. The watermark only advances on success.
    pub async fn run_once(&self) -> Result<CycleSummary> {
        let started = Instant::now();
        {
            let mut state = self.state.write();
            state.running = true;
            state.cycles_total += 1;
        }

        let result = self.cycle(started).await;

        self.state.write().last_cycle_duration_seconds = started.elapsed().as_secs_f64();
        result
    }

    async fn cycle(&self, started: Instant) -> Result<CycleSummary> {
        let since = *self.watermark.read();

        let outcome = async {
            let objects = self.source.list(since).await?;
            let route_sink = RouteSink {
                sink: Arc::clone(&self.sink),
            };
            let summary = self
                .source
                .fetch_and_parse(objects, self.parser.as_ref(), &route_sink, &self.log_type)
                .await;
            Ok::<CycleSummary, anyhow::Error>(summary)
        }
        .await;

        match outcome {
            Ok(summary) => {
                if let Some(max_modified) = summary.max_successful_last_modified() {
                    let mut watermark = self.watermark.write();
                    let advanced = match *watermark {
                        Some(current) => current.max(max_modified),
                        None => max_modified,
                    };
                    *watermark = Some(advanced);
                }

                let mut state = self.state.write();
                state.processed_files_total += summary.successful.len() as u64;
                state.failed_files_total += summary.failed.len() as u64;
                state.last_success_time = Some(Utc::now());
                state.last_error = None;
                state.ready = true;
                state.watermark = *self.watermark.read();

                metrics::counter!("pipeline.cycles", 1);
                metrics::histogram!(
                    "pipeline.cycle.duration_seconds",
                    started.elapsed().as_secs_f64()
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(error = %e, "pipeline cycle failed");
                let mut state = self.state.write();
                state.last_error = Some(e.to_string());
                state.ready = false;
                metrics::counter!("pipeline.cycles.failed", 1);
                Err(e)
            }
        }
    }

    /// Loop `run_once` with a cancellable `poll_interval` wait until the
    /// shutdown signal fires. An in-flight cycle gets up to
    /// `shutdown_timeout` to finish once shutdown is requested.
    pub async fn run_forever(&self, poll_interval: Duration, shutdown_timeout: Duration) {
        self.state.write().running = true;
        let mut shutdown = self.shutdown.clone();

        while !shutdown.is_shutdown() {
            let cycle = self.run_once();
            tokio::pin!(cycle);

            let cycle_result = tokio::select! {
                result = &mut cycle => Some(result),
                _ = shutdown.wait() => {
                    tracing::info!(
                        grace_secs = shutdown_timeout.as_secs(),
                        "shutdown requested, draining in-flight cycle"
                    );
                    match tokio::time::timeout(shutdown_timeout, &mut cycle).await {
                        Ok(result) => Some(result),
                        Err(_) => {
                            tracing::warn!("in-flight cycle abandoned at shutdown timeout");
                            None
                        }
                    }
                }
            };

            if shutdown.is_shutdown() {
                break;
            }

            let wait = match cycle_result {
                Some(Ok(_)) => poll_interval,
                Some(Err(_)) | None => poll_interval.min(ERROR_BACKOFF_CAP),
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.wait() => break,
            }
        }

        self.state.write().running = false;
        tracing::info!("pipeline runner stopped");
    }
}

/// Install SIGINT/SIGTERM handlers that trip `handle`.
pub fn install_signal_handlers(handle: ShutdownHandle) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received Ctrl+C, starting graceful shutdown");
            },
            _ = terminate => {
                tracing::info!("received SIGTERM, starting graceful shutdown");
            },
        }
        handle.shutdown();
    });
}
