//! Storage Configuration
//!
//! One [`HubConfig`] is built at startup and handed to every component. Each section has serde
//! defaults so a TOML file only needs the values that differ:
//!
//! ```toml
//! [spoke]
//! write_path = "/data/spoke/write"
//! read_path = "/data/spoke/read"
//! write_ttl_minutes = 60
//!
//! [s3]
//! bucket = "chronohub-prod"
//! region = "us-east-1"
//!
//! [write_queue]
//! threads = 20
//! ```
//!
//! Environment variables prefixed with `CHRONOHUB_` override file values (see
//! [`HubConfig::apply_env`]).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub spoke: SpokeConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub write_queue: WriteQueueConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl HubConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Applies `CHRONOHUB_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(std::env::vars())
    }

    pub fn apply_vars(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (name, value) in vars {
            match name.as_str() {
                "CHRONOHUB_SERVER_ID" => self.cluster.server_id = value,
                "CHRONOHUB_SPOKE_WRITE_PATH" => self.spoke.write_path = PathBuf::from(value),
                "CHRONOHUB_SPOKE_READ_PATH" => self.spoke.read_path = PathBuf::from(value),
                "CHRONOHUB_SPOKE_TTL_MINUTES" => {
                    self.spoke.write_ttl_minutes = parse_var(&name, &value)?
                }
                "CHRONOHUB_S3_BUCKET" => self.s3.bucket = value,
                "CHRONOHUB_S3_REGION" => self.s3.region = value,
                "CHRONOHUB_S3_ENDPOINT" => self.s3.endpoint = Some(value),
                "CHRONOHUB_LOCAL_STORAGE_PATH" => self.s3.local_path = Some(PathBuf::from(value)),
                "CHRONOHUB_WRITE_QUEUE_THREADS" => {
                    self.write_queue.threads = parse_var(&name, &value)?
                }
                "CHRONOHUB_VERIFIER_ENABLED" => self.verifier.enabled = parse_var(&name, &value)?,
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{name} has invalid value {value:?}")))
}

/// Fast tier ("spoke") settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpokeConfig {
    #[serde(default = "default_write_path")]
    pub write_path: PathBuf,

    #[serde(default = "default_read_path")]
    pub read_path: PathBuf,

    /// TTL of the write cache (default: 60)
    #[serde(default = "default_spoke_ttl_minutes")]
    pub write_ttl_minutes: u32,

    /// TTL of the read cache (default: 60)
    #[serde(default = "default_spoke_ttl_minutes")]
    pub read_ttl_minutes: u32,

    #[serde(default = "default_ttl_enforcer_interval_secs")]
    pub ttl_enforcer_interval_secs: u64,

    /// Nodes holding each channel (default: 3)
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Max wait for a fast tier quorum or fan-out (default: 5s)
    #[serde(default = "default_spoke_timeout_ms")]
    pub timeout_ms: u64,
}

impl SpokeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SpokeConfig {
    fn default() -> Self {
        Self {
            write_path: default_write_path(),
            read_path: default_read_path(),
            write_ttl_minutes: default_spoke_ttl_minutes(),
            read_ttl_minutes: default_spoke_ttl_minutes(),
            ttl_enforcer_interval_secs: default_ttl_enforcer_interval_secs(),
            replicas: default_replicas(),
            timeout_ms: default_spoke_timeout_ms(),
        }
    }
}

fn default_write_path() -> PathBuf {
    PathBuf::from("/spoke/write")
}

fn default_read_path() -> PathBuf {
    PathBuf::from("/spoke/read")
}

fn default_spoke_ttl_minutes() -> u32 {
    60
}

fn default_ttl_enforcer_interval_secs() -> u64 {
    60
}

fn default_replicas() -> usize {
    3
}

fn default_spoke_timeout_ms() -> u64 {
    5_000
}

/// Long-term object storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint (MinIO, localstack)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Use a local directory instead of S3
    #[serde(default)]
    pub local_path: Option<PathBuf>,

    /// Page size for listing requests (default: 1000)
    #[serde(default = "default_max_query_items")]
    pub max_query_items: usize,

    /// How far back a backward scan may walk (default: 31 days)
    #[serde(default = "default_max_scan_days")]
    pub max_scan_days: u32,

    /// Retries for a single object store request (default: 3)
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint: None,
            local_path: None,
            max_query_items: default_max_query_items(),
            max_scan_days: default_max_scan_days(),
            request_retries: default_request_retries(),
        }
    }
}

fn default_bucket() -> String {
    "chronohub".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_query_items() -> usize {
    1000
}

fn default_max_scan_days() -> u32 {
    31
}

fn default_request_retries() -> u32 {
    3
}

/// Write-behind queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_queue_threads")]
    pub threads: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// How long a worker blocks on an empty queue before checking for shutdown
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// How long shutdown waits for the queue to drain
    #[serde(default = "default_shutdown_wait_secs")]
    pub shutdown_wait_secs: u64,
}

impl WriteQueueConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            threads: default_queue_threads(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            shutdown_wait_secs: default_shutdown_wait_secs(),
        }
    }
}

fn default_queue_size() -> usize {
    40_000
}

fn default_queue_threads() -> usize {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_poll_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_wait_secs() -> u64 {
    60
}

/// Anti-entropy verifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Run interval and default window size (default: 15)
    #[serde(default = "default_offset_minutes")]
    pub offset_minutes: u32,

    /// Max duration of one run (default: 2)
    #[serde(default = "default_base_timeout_minutes")]
    pub base_timeout_minutes: u32,

    /// Channels verified concurrently (default: 3)
    #[serde(default = "default_channel_threads")]
    pub channel_threads: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offset_minutes: default_offset_minutes(),
            base_timeout_minutes: default_base_timeout_minutes(),
            channel_threads: default_channel_threads(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_offset_minutes() -> u32 {
    15
}

fn default_base_timeout_minutes() -> u32 {
    2
}

fn default_channel_threads() -> usize {
    3
}

/// Minute archival for BATCH and BOTH channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_batch_interval_secs")]
    pub interval_secs: u64,

    /// A minute is archived once it is this far in the past
    #[serde(default = "default_batch_stable_lag_secs")]
    pub stable_lag_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_batch_interval_secs(),
            stable_lag_secs: default_batch_stable_lag_secs(),
        }
    }
}

fn default_batch_interval_secs() -> u64 {
    60
}

fn default_batch_stable_lag_secs() -> u64 {
    60
}

/// Content service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Payloads above this go to the large payload store (default: 40MB)
    #[serde(default = "default_large_payload_bytes")]
    pub large_payload_bytes: u64,

    /// Max wait for a multi-tier fan-out (default: 60s)
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Stable reads exclude data newer than this (default: 5s)
    #[serde(default = "default_stable_seconds")]
    pub stable_seconds: u64,
}

impl ContentConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            large_payload_bytes: default_large_payload_bytes(),
            query_timeout_secs: default_query_timeout_secs(),
            stable_seconds: default_stable_seconds(),
        }
    }
}

fn default_large_payload_bytes() -> u64 {
    40 * 1024 * 1024
}

fn default_query_timeout_secs() -> u64 {
    60
}

fn default_stable_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_server_id")]
    pub server_id: String,

    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_server_id() -> String {
    "localhost".to_string()
}

fn default_lease_ttl_secs() -> u64 {
    30
}
