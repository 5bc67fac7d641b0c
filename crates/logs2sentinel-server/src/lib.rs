// logs2sentinel-server - service entry points
//
// Wires config into the pipeline (source, sink, resilience primitives),
// runs the poll loop with graceful shutdown, and serves the health surface.
// The CLI in main.rs calls into run / run_once / replay_failed here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use logs2sentinel_config::RuntimeConfig;
use logs2sentinel_resilience::{CredentialCache, RateLimiter};
use logs2sentinel_sink::replay_failed_batches;
use tracing::info;

pub mod http;
pub mod init;
pub mod runner;
pub mod secrets;

use http::AppState;
use init::{build_parser, build_sink, build_source, init_tracing};
use runner::{install_signal_handlers, PipelineRunner, ShutdownSignal};

/// A cycle that ran but did not fully succeed. `run-once` maps this to its
/// own exit code, distinct from startup errors.
#[derive(Debug, thiserror::Error)]
#[error("cycle failed: {0}")]
pub struct CycleFailure(pub String);

// Hot credentials are re-fetched on this cadence while the service runs.
const CREDENTIAL_REFRESH_INTERVAL: Duration = Duration::from_secs(1800);

fn build_runner(
    config: &RuntimeConfig,
    shutdown: ShutdownSignal,
) -> Result<(PipelineRunner, Arc<CredentialCache>)> {
    let rate_limiter = Arc::new(
        RateLimiter::new(config.rate_limit.rate, config.rate_limit.capacity)
            .context("Failed to initialize rate limiter")?,
    );

    let source = build_source(config, Arc::clone(&rate_limiter))?;
    let (sink, credentials) = build_sink(config, rate_limiter)?;
    let parser = build_parser(&config.pipeline.log_type);

    let runner = PipelineRunner::new(
        source,
        Arc::new(sink),
        parser,
        config.pipeline.log_type.clone(),
        shutdown,
    );
    Ok((runner, credentials))
}

/// Keep the Sentinel client secret warm in the cache so a secret-store
/// outage mid-run can fall back to a recent value. Observes the shutdown
/// token and exits cleanly.
fn spawn_credential_refresh(
    credentials: Arc<CredentialCache>,
    secret_name: String,
    mut shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CREDENTIAL_REFRESH_INTERVAL) => {
                    if let Err(e) = credentials.get_credential(&secret_name, true).await {
                        tracing::warn!(secret = %secret_name, error = %e, "credential refresh failed");
                    }
                }
                _ = shutdown.wait() => {
                    info!("credential refresh task stopped");
                    break;
                }
            }
        }
    })
}

/// Long-lived service: poll loop + health endpoints until SIGINT/SIGTERM.
pub async fn run(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);
    info!(
        log_type = %config.pipeline.log_type,
        poll_interval_secs = config.pipeline.poll_interval_secs,
        "starting logs2sentinel"
    );

    let (handle, shutdown) = ShutdownSignal::new();
    install_signal_handlers(handle);

    let (runner, credentials) = build_runner(&config, shutdown.clone())?;
    let refresh_task = spawn_credential_refresh(
        credentials,
        config.sentinel.client_secret_name.clone(),
        shutdown.clone(),
    );

    // Health surface alongside the poll loop.
    let app_state = AppState {
        pipeline: runner.state(),
        sink: runner.sink(),
    };
    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen_addr))?;
    info!("health endpoints listening on http://{}", config.server.listen_addr);

    let mut server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, http::router(app_state))
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await
    });

    runner
        .run_forever(
            config.pipeline.poll_interval(),
            config.pipeline.shutdown_timeout(),
        )
        .await;

    server
        .await
        .context("health server task panicked")?
        .context("health server error")?;
    refresh_task.await.context("refresh task panicked")?;

    info!("shutdown complete");
    Ok(())
}

/// Single ingest cycle; a cycle failure maps to its own exit code.
pub async fn run_once(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    let (_handle, shutdown) = ShutdownSignal::new();
    let (runner, _credentials) = build_runner(&config, shutdown)?;

    let summary = runner
        .run_once()
        .await
        .map_err(|e| CycleFailure(e.to_string()))?;
    info!(
        successful = summary.successful.len(),
        failed = summary.failed.len(),
        "cycle complete"
    );
    if !summary.failed.is_empty() {
        return Err(CycleFailure(format!(
            "{} of {} objects failed",
            summary.failed.len(),
            summary.metrics.total_files
        ))
        .into());
    }
    Ok(())
}

/// One-shot replay of persisted failed batches.
pub async fn replay_failed(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    let (_handle, shutdown) = ShutdownSignal::new();
    let (runner, _credentials) = build_runner(&config, shutdown)?;
    let sink = runner.sink();

    let summary = replay_failed_batches(&sink, &config.pipeline.log_type).await;
    info!(
        processed = summary.processed,
        archived = summary.archived,
        failed = summary.failed,
        "replay complete"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} of {} files failed to replay", summary.failed, summary.processed);
    }
    Ok(())
}
