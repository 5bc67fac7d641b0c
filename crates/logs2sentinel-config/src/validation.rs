use anyhow::{bail, Result};

use super::{FailedBatchBackend, RuntimeConfig};

/// Validate a resolved configuration. Called once at startup; a failure here
/// is fatal to the process.
pub fn validate(config: &RuntimeConfig) -> Result<()> {
    if config.s3.bucket.is_empty() {
        bail!("s3.bucket must not be empty");
    }
    if config.s3.region.is_empty() {
        bail!("s3.region must not be empty");
    }
    if config.s3.max_inflight_fetches == 0 {
        bail!("s3.max_inflight_fetches must be at least 1");
    }
    if config.s3.max_keys_per_list == 0 {
        bail!("s3.max_keys_per_list must be at least 1");
    }

    if !config.sentinel.dcr_endpoint.starts_with("http://")
        && !config.sentinel.dcr_endpoint.starts_with("https://")
    {
        bail!(
            "sentinel.dcr_endpoint must be an http(s) URL, got '{}'",
            config.sentinel.dcr_endpoint
        );
    }
    if config.sentinel.rule_id.is_empty() {
        bail!("sentinel.rule_id must not be empty");
    }
    if config.sentinel.stream_name.is_empty() {
        bail!("sentinel.stream_name must not be empty");
    }
    if config.sentinel.tenant_id.is_empty() || config.sentinel.client_id.is_empty() {
        bail!("sentinel.tenant_id and sentinel.client_id must not be empty");
    }
    if config.sentinel.max_concurrent_batches == 0 {
        bail!("sentinel.max_concurrent_batches must be at least 1");
    }

    if config.rate_limit.rate <= 0.0 {
        bail!(
            "rate_limit.rate must be positive, got {}",
            config.rate_limit.rate
        );
    }
    if let Some(capacity) = config.rate_limit.capacity {
        if capacity <= 0.0 {
            bail!("rate_limit.capacity must be positive, got {capacity}");
        }
    }

    if config.circuit_breaker.failure_threshold == 0 {
        bail!("circuit_breaker.failure_threshold must be at least 1");
    }
    if config.circuit_breaker.success_threshold == 0 {
        bail!("circuit_breaker.success_threshold must be at least 1");
    }
    if config.circuit_breaker.half_open_max_inflight == 0 {
        bail!("circuit_breaker.half_open_max_inflight must be at least 1");
    }

    if !(0.0..1.0).contains(&config.retry.jitter) {
        bail!(
            "retry.jitter must be in [0, 1), got {}",
            config.retry.jitter
        );
    }

    match config.failed_batches.backend {
        FailedBatchBackend::Fs => {
            if config
                .failed_batches
                .path
                .as_deref()
                .unwrap_or_default()
                .is_empty()
            {
                bail!("failed_batches.path is required for the fs backend");
            }
        }
        FailedBatchBackend::S3 => {
            if config
                .failed_batches
                .bucket
                .as_deref()
                .unwrap_or_default()
                .is_empty()
            {
                bail!("failed_batches.bucket is required for the s3 backend");
            }
        }
    }

    if !config.tables.contains_key(&config.pipeline.log_type) {
        bail!(
            "pipeline.log_type '{}' has no table configured (known: {})",
            config.pipeline.log_type,
            config
                .tables
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    if config.pipeline.poll_interval_secs == 0 {
        bail!("pipeline.poll_interval_secs must be at least 1");
    }

    Ok(())
}
