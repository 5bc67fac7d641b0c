// Initialization utilities: logging setup and component wiring

use std::sync::Arc;

use anyhow::{Context, Result};
use logs2sentinel_config::{FailedBatchBackend, LogFormat, RuntimeConfig};
use logs2sentinel_core::{FirewallParser, JsonParser, LogParser};
use logs2sentinel_resilience::{
    CircuitBreaker, CircuitBreakerConfig, CredentialCache, CredentialCacheConfig, RateLimiter,
    RetryPolicy,
};
use logs2sentinel_sink::{
    ClientCredentialsProvider, DcrUploader, FailedBatchStore, SentinelSink, SentinelSinkConfig,
};
use logs2sentinel_source::{S3Source, S3SourceConfig};
use tracing::info;

use crate::secrets::EnvSecretStore;

/// Initialize tracing/logging from RuntimeConfig
pub fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.server.log_format {
        LogFormat::Json => {
            registry.with(fmt::layer().json()).init();
        }
        LogFormat::Text => {
            registry.with(fmt::layer()).init();
        }
    }
}

fn retry_policy(config: &RuntimeConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.retry.max_retries,
        base_delay: std::time::Duration::from_millis(config.retry.base_delay_ms),
        max_delay: std::time::Duration::from_millis(config.retry.max_delay_ms),
        jitter: config.retry.jitter,
    }
}

fn breaker_config(config: &RuntimeConfig) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker.failure_threshold,
        recovery_timeout: std::time::Duration::from_secs(
            config.circuit_breaker.recovery_timeout_secs,
        ),
        success_threshold: config.circuit_breaker.success_threshold,
        half_open_max_inflight: config.circuit_breaker.half_open_max_inflight,
        min_calls_before_open: config.circuit_breaker.min_calls_before_open,
        operation_timeout: std::time::Duration::from_secs(
            config.circuit_breaker.operation_timeout_secs,
        ),
    }
}

pub fn build_parser(log_type: &str) -> Box<dyn LogParser> {
    // Firewall exports have their own positional format; everything else
    // arrives as JSON documents.
    if log_type == "firewall" {
        Box::new(FirewallParser::new())
    } else {
        Box::new(JsonParser::new())
    }
}

pub fn build_source(
    config: &RuntimeConfig,
    rate_limiter: Arc<RateLimiter>,
) -> Result<S3Source> {
    info!(
        bucket = %config.s3.bucket,
        region = %config.s3.region,
        prefix = %config.s3.prefix,
        "initializing S3 source"
    );
    let source_config = S3SourceConfig {
        bucket: config.s3.bucket.clone(),
        region: config.s3.region.clone(),
        prefix: config.s3.prefix.clone(),
        endpoint: config.s3.endpoint.clone(),
        access_key_id: config.s3.access_key_id.clone(),
        secret_access_key: config.s3.secret_access_key.clone(),
        max_inflight_fetches: config.s3.max_inflight_fetches,
        max_keys_per_list: config.s3.max_keys_per_list,
        retry: retry_policy(config),
        ..S3SourceConfig::default()
    };
    S3Source::new(source_config, rate_limiter).context("Failed to initialize S3 source")
}

pub fn build_failed_batch_store(config: &RuntimeConfig) -> Result<FailedBatchStore> {
    match config.failed_batches.backend {
        FailedBatchBackend::Fs => {
            let path = config
                .failed_batches
                .path
                .as_deref()
                .context("failed_batches.path required for fs backend")?;
            info!(path, "failed batches stored on the local filesystem");
            FailedBatchStore::new_fs(path).context("Failed to open failed-batch directory")
        }
        FailedBatchBackend::S3 => {
            let bucket = config
                .failed_batches
                .bucket
                .as_deref()
                .context("failed_batches.bucket required for s3 backend")?;
            info!(bucket, "failed batches stored in object storage");
            FailedBatchStore::new_s3(
                bucket,
                &config.s3.region,
                config.s3.endpoint.as_deref(),
                config.s3.access_key_id.as_deref(),
                config.s3.secret_access_key.as_deref(),
                config.failed_batches.prefix.as_deref(),
            )
            .context("Failed to open failed-batch container")
        }
    }
}

pub fn build_sink(
    config: &RuntimeConfig,
    rate_limiter: Arc<RateLimiter>,
) -> Result<(SentinelSink, Arc<CredentialCache>)> {
    let credentials = Arc::new(CredentialCache::new(
        Box::new(EnvSecretStore::new()),
        CredentialCacheConfig::default(),
    ));

    let token_provider = ClientCredentialsProvider::new(
        &config.sentinel.tenant_id,
        &config.sentinel.client_id,
        Arc::clone(&credentials),
        &config.sentinel.client_secret_name,
    );

    let uploader = DcrUploader::new(
        &config.sentinel.dcr_endpoint,
        &config.sentinel.rule_id,
        &config.sentinel.stream_name,
        Box::new(token_provider),
    );

    let failed_store = build_failed_batch_store(config)?;

    info!(
        endpoint = %config.sentinel.dcr_endpoint,
        rule_id = %config.sentinel.rule_id,
        stream = %config.sentinel.stream_name,
        tables = config.tables.len(),
        "initializing Sentinel sink"
    );

    let sink = SentinelSink::new(
        config.tables.clone(),
        Box::new(uploader),
        CircuitBreaker::new("sentinel-ingestion", breaker_config(config)),
        rate_limiter,
        failed_store,
        SentinelSinkConfig {
            max_concurrent_batches: config.sentinel.max_concurrent_batches,
            data_classification: "standard".to_string(),
        },
    );
    Ok((sink, credentials))
}
