//! Configuration structures for llmq
//!
//! Configurations are loaded from YAML files and can be overridden by
//! environment variables of the form `LLMQ__<SECTION>__<KEY>`.

use crate::error::{LlmqError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the stream inactivity timeout
pub const MAX_INACTIVITY_TIMEOUT_SECS: u64 = 300;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmqConfig {
    /// Queue and dispatcher tuning
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Model lifecycle tuning
    #[serde(default)]
    pub models: ModelsConfig,

    /// Generation stream tuning
    #[serde(default)]
    pub stream: StreamConfig,

    /// Inference backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Queue and dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Same-model jobs arriving within this window share a burst group
    #[serde(default = "default_burst_window_ms")]
    pub burst_window_ms: u64,

    /// Jobs queued longer than this are admitted ahead of priority order
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,

    /// Claim lease duration before a job is redelivered
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Fallback poll interval of the claim loop
    #[serde(default = "default_claim_poll_interval_ms")]
    pub claim_poll_interval_ms: u64,

    /// Concurrent streams against the resident model
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,

    /// How long finalized jobs are kept before being archived
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Interval of the retention purge and snapshot tick
    #[serde(default = "default_housekeeping_interval_secs")]
    pub housekeeping_interval_secs: u64,

    /// Maximum total prompt size in bytes
    #[serde(default = "default_max_prompt_bytes")]
    pub max_prompt_bytes: usize,

    /// Maximum number of messages per request
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Where the job store snapshot is persisted (disabled when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

/// Model lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Attempts per switch before giving up with a switch error
    #[serde(default = "default_switch_attempts")]
    pub switch_attempts: u32,

    /// Fixed delay between switch attempts
    #[serde(default = "default_switch_retry_delay_ms")]
    pub switch_retry_delay_ms: u64,

    /// Memory kept free on top of the model footprint
    #[serde(default = "default_memory_headroom_mb")]
    pub memory_headroom_mb: u64,

    /// Confirm a load with a one-token generation
    #[serde(default = "default_verify_on_load")]
    pub verify_on_load: bool,

    /// Prompt of the verification generation
    #[serde(default = "default_verify_prompt")]
    pub verify_prompt: String,

    /// Model made resident at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preload: Option<String>,
}

/// Generation stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Abort a stream after this long without a token
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// Transport attempts when opening a stream
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,

    /// Initial backoff between open attempts (doubles each retry)
    #[serde(default = "default_open_backoff_ms")]
    pub open_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_open_backoff_ms")]
    pub max_open_backoff_ms: u64,
}

/// Inference backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Ollama-compatible HTTP server
    Ollama,

    /// Deterministic in-process backend for dry runs
    Scripted,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Ollama
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Base URL of the HTTP backend
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for non-streaming management calls
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for a model load call
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    /// How long the backend keeps a loaded model resident
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,

    /// Accelerator memory reported by the static resource monitor
    #[serde(default = "default_accelerator_memory_mb")]
    pub accelerator_memory_mb: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default = "default_structured_logging")]
    pub structured_logging: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Textfile-collector path the metrics are written to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_textfile: Option<PathBuf>,

    /// Interval between metrics textfile writes
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

/// Default value functions
fn default_burst_window_ms() -> u64 {
    250
}

fn default_max_wait_secs() -> u64 {
    120
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_claim_poll_interval_ms() -> u64 {
    500
}

fn default_max_concurrent_streams() -> usize {
    1 // one shared accelerator
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_housekeeping_interval_secs() -> u64 {
    30
}

fn default_max_prompt_bytes() -> usize {
    1024 * 1024
}

fn default_max_messages() -> usize {
    512
}

fn default_switch_attempts() -> u32 {
    3
}

fn default_switch_retry_delay_ms() -> u64 {
    2000
}

fn default_memory_headroom_mb() -> u64 {
    512
}

fn default_verify_on_load() -> bool {
    true
}

fn default_verify_prompt() -> String {
    "ping".to_string()
}

fn default_inactivity_timeout_secs() -> u64 {
    120
}

fn default_open_attempts() -> u32 {
    3
}

fn default_open_backoff_ms() -> u64 {
    500
}

fn default_max_open_backoff_ms() -> u64 {
    8000
}

fn default_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_load_timeout_secs() -> u64 {
    600
}

fn default_keep_alive() -> String {
    "30m".to_string()
}

fn default_accelerator_memory_mb() -> u64 {
    24 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_structured_logging() -> bool {
    false
}

fn default_metrics() -> bool {
    true
}

fn default_metrics_interval_secs() -> u64 {
    15
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            burst_window_ms: default_burst_window_ms(),
            max_wait_secs: default_max_wait_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            claim_poll_interval_ms: default_claim_poll_interval_ms(),
            max_concurrent_streams: default_max_concurrent_streams(),
            retention_secs: default_retention_secs(),
            housekeeping_interval_secs: default_housekeeping_interval_secs(),
            max_prompt_bytes: default_max_prompt_bytes(),
            max_messages: default_max_messages(),
            snapshot_path: None,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            switch_attempts: default_switch_attempts(),
            switch_retry_delay_ms: default_switch_retry_delay_ms(),
            memory_headroom_mb: default_memory_headroom_mb(),
            verify_on_load: default_verify_on_load(),
            verify_prompt: default_verify_prompt(),
            preload: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            open_attempts: default_open_attempts(),
            open_backoff_ms: default_open_backoff_ms(),
            max_open_backoff_ms: default_max_open_backoff_ms(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            load_timeout_secs: default_load_timeout_secs(),
            keep_alive: default_keep_alive(),
            accelerator_memory_mb: default_accelerator_memory_mb(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: default_structured_logging(),
            enable_metrics: default_metrics(),
            metrics_textfile: None,
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

impl LlmqConfig {
    /// Load configuration from a YAML file, layered with environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(Self::env_source())
            .build()
            .map_err(|e| {
                LlmqError::Config(format!("Failed to read config file {}: {}", path.display(), e))
            })?;

        let config: LlmqConfig = settings.try_deserialize().map_err(|e| {
            LlmqError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load defaults overridden by environment variables only
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(Self::env_source())
            .build()?;

        let config: LlmqConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: LlmqConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LlmqError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn env_source() -> config::Environment {
        config::Environment::with_prefix("LLMQ").separator("__")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let stream = &self.stream;
        if stream.inactivity_timeout_secs == 0
            || stream.inactivity_timeout_secs > MAX_INACTIVITY_TIMEOUT_SECS
        {
            return Err(LlmqError::config(format!(
                "stream.inactivity_timeout_secs must be within 1..={}, got {}",
                MAX_INACTIVITY_TIMEOUT_SECS, stream.inactivity_timeout_secs
            )));
        }
        if stream.open_attempts == 0 {
            return Err(LlmqError::config("stream.open_attempts must be at least 1"));
        }

        let scheduler = &self.scheduler;
        if scheduler.max_concurrent_streams == 0 {
            return Err(LlmqError::config(
                "scheduler.max_concurrent_streams must be at least 1",
            ));
        }
        // leases are renewed every third of the timeout
        if scheduler.visibility_timeout_secs < 3 {
            return Err(LlmqError::config(
                "scheduler.visibility_timeout_secs must be at least 3",
            ));
        }
        if scheduler.burst_window_ms > scheduler.max_wait_secs.saturating_mul(1000) {
            return Err(LlmqError::config(
                "scheduler.burst_window_ms must not exceed scheduler.max_wait_secs",
            ));
        }
        if scheduler.max_messages == 0 || scheduler.max_prompt_bytes == 0 {
            return Err(LlmqError::config(
                "scheduler.max_messages and scheduler.max_prompt_bytes must be positive",
            ));
        }

        if self.models.switch_attempts == 0 {
            return Err(LlmqError::config("models.switch_attempts must be at least 1"));
        }

        if self.backend.kind == BackendKind::Ollama && self.backend.base_url.trim().is_empty() {
            return Err(LlmqError::config("backend.base_url is required for the ollama backend"));
        }

        Ok(())
    }

    /// Get burst window as Duration
    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.scheduler.burst_window_ms)
    }

    /// Get starvation guard as Duration
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.scheduler.max_wait_secs)
    }

    /// Get claim lease duration as Duration
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.visibility_timeout_secs)
    }

    /// Interval at which in-flight claims are renewed
    pub fn lease_renew_interval(&self) -> Duration {
        self.visibility_timeout() / 3
    }

    /// Get claim poll interval as Duration
    pub fn claim_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.claim_poll_interval_ms)
    }

    /// Get retention window as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.scheduler.retention_secs)
    }

    /// Get housekeeping interval as Duration
    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.housekeeping_interval_secs.max(1))
    }

    /// Get stream inactivity timeout as Duration
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.stream.inactivity_timeout_secs)
    }

    /// Get switch retry delay as Duration
    pub fn switch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.models.switch_retry_delay_ms)
    }

    /// Memory headroom in bytes
    pub fn memory_headroom_bytes(&self) -> u64 {
        self.models.memory_headroom_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = LlmqConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.burst_window(), Duration::from_millis(250));
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(120));
        assert_eq!(config.lease_renew_interval(), Duration::from_secs(100));
        assert_eq!(config.scheduler.max_concurrent_streams, 1);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
stream:
  inactivity_timeout_secs: 300
backend:
  kind: scripted
"#;
        let config = LlmqConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.stream.inactivity_timeout_secs, 300);
        assert_eq!(config.stream.open_attempts, 3);
        assert_eq!(config.backend.kind, BackendKind::Scripted);
        assert_eq!(config.models.switch_attempts, 3);
    }

    #[test]
    fn test_inactivity_timeout_upper_bound() {
        let mut config = LlmqConfig::default();
        config.stream.inactivity_timeout_secs = 301;
        assert!(config.validate().is_err());

        config.stream.inactivity_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_concurrency() {
        let mut config = LlmqConfig::default();
        config.scheduler.max_concurrent_streams = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "scheduler:\n  burst_window_ms: 100\n  max_concurrent_streams: 2\nmodels:\n  switch_attempts: 2"
        )
        .unwrap();

        let config = LlmqConfig::from_file(file.path()).unwrap();

        assert_eq!(config.burst_window(), Duration::from_millis(100));
        assert_eq!(config.scheduler.max_concurrent_streams, 2);
        assert_eq!(config.models.switch_attempts, 2);
        assert_eq!(config.scheduler.max_wait_secs, 120);
    }
}
