// logs2sentinel-config - runtime configuration
//
// Configuration is resolved once, before the pipeline starts:
// 1. Environment variables (highest priority)
// 2. Config file path passed on the command line
// 3. Default config file location (./logs2sentinel.toml)
// 4. Built-in defaults (lowest priority)
//
// Hot reload is deliberately unsupported; the runner re-reads config only
// when restarted.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use logs2sentinel_core::TableConfig;
use serde::Deserialize;

mod env_overrides;
mod validation;

pub use env_overrides::{apply_env_overrides, EnvSource, ProcessEnv, ENV_PREFIX};
pub use validation::validate;

pub const DEFAULT_CONFIG_PATH: &str = "./logs2sentinel.toml";

/// Main runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub s3: S3Config,

    pub sentinel: SentinelConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    pub failed_batches: FailedBatchConfig,

    /// Per-log-type table schemas; defaults to the built-in firewall and vpn
    /// tables when absent.
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,

    #[serde(default)]
    pub server: ServerConfig,
}

/// S3-compatible source bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default = "default_max_inflight_fetches")]
    pub max_inflight_fetches: usize,
    #[serde(default = "default_max_keys_per_list")]
    pub max_keys_per_list: usize,
}

fn default_max_inflight_fetches() -> usize {
    5
}

fn default_max_keys_per_list() -> usize {
    1000
}

/// Logs Ingestion endpoint (Data Collection Rule).
#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    /// e.g. `https://my-dce.westeurope-1.ingest.monitor.azure.com`
    pub dcr_endpoint: String,
    /// DCR immutable id, e.g. `dcr-b74e0d383fc9415abaa584ec41adece3`
    pub rule_id: String,
    pub stream_name: String,
    pub tenant_id: String,
    pub client_id: String,
    /// Name of the client secret in the secret store.
    #[serde(default = "default_client_secret_name")]
    pub client_secret_name: String,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

fn default_client_secret_name() -> String {
    "sentinel-client-secret".to_string()
}

fn default_max_concurrent_batches() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Log type routed this run (selects parser and table).
    pub log_type: String,
    pub poll_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_type: "firewall".to_string(),
            poll_interval_secs: 60,
            shutdown_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens per second for outbound calls.
    pub rate: f64,
    /// Burst capacity; `None` means 2 × rate.
    pub capacity: Option<f64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            capacity: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
    pub half_open_max_inflight: u32,
    pub min_calls_before_open: u32,
    pub operation_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 2,
            half_open_max_inflight: 3,
            min_calls_before_open: 10,
            operation_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.1,
        }
    }
}

/// Where failed batches are persisted for replay.
#[derive(Debug, Clone, Deserialize)]
pub struct FailedBatchConfig {
    pub backend: FailedBatchBackend,
    /// Local directory (fs backend).
    #[serde(default)]
    pub path: Option<String>,
    /// Container/bucket (s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedBatchBackend {
    Fs,
    S3,
}

impl std::fmt::Display for FailedBatchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailedBatchBackend::Fs => write!(f, "fs"),
            FailedBatchBackend::S3 => write!(f, "s3"),
        }
    }
}

impl std::str::FromStr for FailedBatchBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" | "local" => Ok(FailedBatchBackend::Fs),
            "s3" | "object-store" => Ok(FailedBatchBackend::S3),
            _ => anyhow::bail!("unsupported failed-batch backend: {}. Supported: fs, s3", s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl RuntimeConfig {
    /// Load from an explicit file path, then apply env overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: RuntimeConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.finish()?;
        Ok(config)
    }

    /// Load from the default location; the file must exist there.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    fn finish(&mut self) -> Result<()> {
        if self.tables.is_empty() {
            self.tables
                .insert("firewall".to_string(), TableConfig::firewall_default());
            self.tables
                .insert("vpn".to_string(), TableConfig::vpn_default());
        }
        apply_env_overrides(self, &ProcessEnv)?;
        validate(self)?;
        Ok(())
    }

    /// Parse from TOML text (tests and embedded configs).
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: RuntimeConfig =
            toml::from_str(contents).context("Failed to parse config")?;
        config.finish()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [s3]
        bucket = "logs"
        region = "us-east-1"

        [sentinel]
        dcr_endpoint = "https://dce.ingest.monitor.azure.com"
        rule_id = "dcr-abc123"
        stream_name = "Custom-Firewall"
        tenant_id = "tenant"
        client_id = "client"

        [failed_batches]
        backend = "fs"
        path = "./failed_batches"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = RuntimeConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.pipeline.log_type, "firewall");
        assert_eq!(config.pipeline.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.rate_limit.rate, 10.0);
        assert_eq!(config.s3.max_inflight_fetches, 5);
        assert_eq!(config.sentinel.max_concurrent_batches, 4);
        assert!(config.tables.contains_key("firewall"));
        assert!(config.tables.contains_key("vpn"));
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
    }

    #[test]
    fn explicit_tables_replace_builtins() {
        let with_table = format!(
            "{MINIMAL}\n{}",
            r#"
            [tables.dns]
            name = "Custom_Dns_CL"
            schema_version = "1.0"
            required_fields = ["TimeGenerated", "QueryName"]
            retention_days = 14
            "#
        );
        let config = RuntimeConfig::from_toml(&with_table).unwrap();
        assert!(config.tables.contains_key("dns"));
        assert!(!config.tables.contains_key("firewall"));
    }

    #[test]
    fn missing_required_section_fails() {
        let err = RuntimeConfig::from_toml("[s3]\nbucket = \"b\"\nregion = \"r\"").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs2sentinel.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = RuntimeConfig::load_from_path(&path).unwrap();
        assert_eq!(config.s3.bucket, "logs");
    }
}
