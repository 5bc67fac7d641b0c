use anyhow::{anyhow, Context, Result};

use super::{FailedBatchBackend, LogFormat, RuntimeConfig};

pub const ENV_PREFIX: &str = "LOGS2SENTINEL_";

/// Abstraction over environment-variable lookups so tests can supply their
/// own source of overrides.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the LOGS2SENTINEL_ prefix.
    /// Used for AWS standard variables (AWS_ACCESS_KEY_ID, etc.)
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// The process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}{key}")).ok()
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Apply environment-variable overrides (highest priority) to the config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // S3 source
    if let Some(bucket) = get_env_string(env, "S3_BUCKET")? {
        config.s3.bucket = bucket;
    }
    if let Some(region) = get_env_string(env, "S3_REGION")? {
        config.s3.region = region;
    }
    if let Some(prefix) = get_env_string(env, "S3_PREFIX")? {
        config.s3.prefix = prefix;
    }
    if let Some(endpoint) = get_env_string(env, "S3_ENDPOINT")? {
        config.s3.endpoint = Some(endpoint);
    }
    if let Some(val) = get_env_usize(env, "S3_MAX_INFLIGHT_FETCHES")? {
        config.s3.max_inflight_fetches = val;
    }
    if let Some(val) = get_env_usize(env, "S3_MAX_KEYS_PER_LIST")? {
        config.s3.max_keys_per_list = val;
    }
    // AWS standard credentials (no LOGS2SENTINEL_ prefix, for compatibility)
    if let Some(access_key_id) = env.get_raw("AWS_ACCESS_KEY_ID") {
        config.s3.access_key_id = Some(access_key_id);
    }
    if let Some(secret_access_key) = env.get_raw("AWS_SECRET_ACCESS_KEY") {
        config.s3.secret_access_key = Some(secret_access_key);
    }

    // Sentinel ingestion
    if let Some(endpoint) = get_env_string(env, "DCR_ENDPOINT")? {
        config.sentinel.dcr_endpoint = endpoint;
    }
    if let Some(rule_id) = get_env_string(env, "DCR_RULE_ID")? {
        config.sentinel.rule_id = rule_id;
    }
    if let Some(stream) = get_env_string(env, "DCR_STREAM_NAME")? {
        config.sentinel.stream_name = stream;
    }
    if let Some(tenant) = get_env_string(env, "TENANT_ID")? {
        config.sentinel.tenant_id = tenant;
    }
    if let Some(client) = get_env_string(env, "CLIENT_ID")? {
        config.sentinel.client_id = client;
    }
    if let Some(val) = get_env_usize(env, "MAX_CONCURRENT_BATCHES")? {
        config.sentinel.max_concurrent_batches = val;
    }

    // Pipeline
    if let Some(log_type) = get_env_string(env, "LOG_TYPE")? {
        config.pipeline.log_type = log_type;
    }
    if let Some(val) = get_env_u64(env, "POLL_INTERVAL_SECS")? {
        config.pipeline.poll_interval_secs = val;
    }
    if let Some(val) = get_env_u64(env, "SHUTDOWN_TIMEOUT_SECS")? {
        config.pipeline.shutdown_timeout_secs = val;
    }

    // Rate limiter
    if let Some(val) = get_env_f64(env, "RATE_LIMIT_RPS")? {
        config.rate_limit.rate = val;
    }
    if let Some(val) = get_env_f64(env, "RATE_LIMIT_CAPACITY")? {
        config.rate_limit.capacity = Some(val);
    }

    // Failed-batch store
    if let Some(backend) = get_env_string(env, "FAILED_BATCH_BACKEND")? {
        config.failed_batches.backend = backend
            .parse::<FailedBatchBackend>()
            .context("Invalid LOGS2SENTINEL_FAILED_BATCH_BACKEND value")?;
    }
    if let Some(path) = get_env_string(env, "FAILED_BATCH_PATH")? {
        config.failed_batches.path = Some(path);
    }
    if let Some(bucket) = get_env_string(env, "FAILED_BATCH_BUCKET")? {
        config.failed_batches.bucket = Some(bucket);
    }

    // Server
    if let Some(addr) = get_env_string(env, "LISTEN_ADDR")? {
        config.server.listen_addr = addr;
    }
    if let Some(level) = get_env_string(env, "LOG_LEVEL")? {
        config.server.log_level = level;
    }
    if let Some(format) = get_env_string(env, "LOG_FORMAT")? {
        config.server.log_format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    Ok(())
}

fn get_env_string<E: EnvSource>(env: &E, key: &str) -> Result<Option<String>> {
    Ok(env.get(key).filter(|s| !s.is_empty()))
}

fn get_env_usize<E: EnvSource>(env: &E, key: &str) -> Result<Option<usize>> {
    match env.get(key) {
        Some(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|_| anyhow!("{ENV_PREFIX}{key} must be a non-negative integer, got '{val}'")),
        None => Ok(None),
    }
}

fn get_env_u64<E: EnvSource>(env: &E, key: &str) -> Result<Option<u64>> {
    match env.get(key) {
        Some(val) => val
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{ENV_PREFIX}{key} must be a non-negative integer, got '{val}'")),
        None => Ok(None),
    }
}

fn get_env_f64<E: EnvSource>(env: &E, key: &str) -> Result<Option<f64>> {
    match env.get(key) {
        Some(val) => val
            .parse::<f64>()
            .map(Some)
            .map_err(|_| anyhow!("{ENV_PREFIX}{key} must be a number, got '{val}'")),
        None => Ok(None),
    }
}
