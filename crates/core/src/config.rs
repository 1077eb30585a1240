//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// SECURITY: When enabled, ensure this endpoint is network-restricted
    /// to authorized Prometheus scraper IPs only at the infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Upload limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Server-imposed chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Authoritative maximum file size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_max_file_size() -> u64 {
    crate::DEFAULT_MAX_FILE_SIZE
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl UploadConfig {
    /// Validate upload limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size < crate::MIN_CHUNK_SIZE || self.chunk_size > crate::MAX_CHUNK_SIZE {
            return Err(format!(
                "upload.chunk_size {} out of range [{}, {}]",
                self.chunk_size,
                crate::MIN_CHUNK_SIZE,
                crate::MAX_CHUNK_SIZE
            ));
        }
        if self.max_file_size == 0 {
            return Err("upload.max_file_size cannot be 0".to_string());
        }
        if self.max_file_size < self.chunk_size {
            return Err(format!(
                "upload.max_file_size {} is smaller than chunk_size {}",
                self.max_file_size, self.chunk_size
            ));
        }
        // Chunk counts are tracked as u32; cap the implied total.
        let implied_chunks = self.max_file_size.div_ceil(self.chunk_size);
        if implied_chunks > u64::from(u32::MAX) {
            return Err(format!(
                "upload.max_file_size {} implies {} chunks, exceeding the supported bound",
                self.max_file_size, implied_chunks
            ));
        }
        Ok(())
    }
}

/// Blob storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Upload directory; staging chunks and final objects live beneath it.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/uploads"),
        }
    }
}

/// Session registry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryConfig {
    /// In-memory registry (development and testing; state dies with the process).
    Memory,
    /// SQLite-backed registry (survives restart).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/registry.db"),
        }
    }
}

/// Reaper configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between reaper passes.
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// Minutes of inactivity before a non-terminal session is reaped.
    #[serde(default = "default_stale_threshold_minutes")]
    pub stale_threshold_minutes: u64,
    /// Days a completed object is retained before its artifacts are removed.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Also delete the registry record when retention expires (default:
    /// false, the record is kept for bookkeeping).
    #[serde(default)]
    pub purge_records: bool,
    /// Maximum sessions processed per pass.
    #[serde(default = "default_reaper_batch_size")]
    pub batch_size: u32,
}

fn default_reaper_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_stale_threshold_minutes() -> u64 {
    30
}

fn default_retention_days() -> u64 {
    30
}

fn default_reaper_batch_size() -> u32 {
    500
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            stale_threshold_minutes: default_stale_threshold_minutes(),
            retention_days: default_retention_days(),
            purge_records: false,
            batch_size: default_reaper_batch_size(),
        }
    }
}

impl ReaperConfig {
    /// Interval between passes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Inactivity bound for the stale pass.
    pub fn stale_threshold(&self) -> time::Duration {
        time::Duration::minutes(self.stale_threshold_minutes.min(i64::MAX as u64) as i64)
    }

    /// Age bound for the retention pass.
    pub fn retention(&self) -> time::Duration {
        time::Duration::days(self.retention_days.min(i64::MAX as u64) as i64)
    }

    /// Validate reaper settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("reaper.interval_secs cannot be 0. \
                 This would cause a panic when creating the reaper timer. \
                 Use a value >= 1 second."
                .to_string());
        }
        if self.stale_threshold_minutes == 0 {
            return Err(
                "reaper.stale_threshold_minutes cannot be 0; live sessions would be reaped \
                 between their own requests"
                    .to_string(),
            );
        }
        if self.batch_size == 0 {
            return Err("reaper.batch_size cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Scheduler (admission control) configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global cap on chunk writes in flight across all sessions.
    #[serde(default = "default_max_parallel_writes")]
    pub max_parallel_writes: u32,
    /// Per-session cap on chunk writes in flight.
    #[serde(default = "default_max_parallel_per_session")]
    pub max_parallel_per_session: u32,
    /// Bound on admission requests queued per session; excess fails fast.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,
    /// Wall-clock deadline for an admitted write, in seconds.
    #[serde(default = "default_write_deadline_secs")]
    pub write_deadline_secs: u64,
}

fn default_max_parallel_writes() -> u32 {
    16
}

fn default_max_parallel_per_session() -> u32 {
    3
}

fn default_queue_depth() -> u32 {
    32
}

fn default_write_deadline_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_writes: default_max_parallel_writes(),
            max_parallel_per_session: default_max_parallel_per_session(),
            queue_depth: default_queue_depth(),
            write_deadline_secs: default_write_deadline_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Deadline for an admitted write.
    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }

    /// Validate scheduler settings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.max_parallel_writes == 0 {
            return Err("scheduler.max_parallel_writes cannot be 0; no write could ever be \
                 admitted"
                .to_string());
        }
        if self.max_parallel_per_session == 0 {
            return Err("scheduler.max_parallel_per_session cannot be 0".to_string());
        }
        if self.write_deadline_secs == 0 {
            return Err("scheduler.write_deadline_secs cannot be 0".to_string());
        }
        if self.max_parallel_per_session > self.max_parallel_writes {
            warnings.push(format!(
                "scheduler.max_parallel_per_session {} exceeds max_parallel_writes {}; \
                 the global cap will dominate",
                self.max_parallel_per_session, self.max_parallel_writes
            ));
        }
        if self.queue_depth == 0 {
            warnings.push(
                "scheduler.queue_depth is 0; every admission beyond the in-flight caps \
                 will fail fast"
                    .to_string(),
            );
        }
        Ok(warnings)
    }
}

/// Rate limiting configuration.
///
/// Three independent per-IP token buckets: general API traffic, the chunk
/// upload path, and monitoring reads. Each bucket refills over a one-minute
/// window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// General bucket: requests per minute per IP (init/complete/status/delete).
    #[serde(default = "default_general_per_minute")]
    pub general_per_minute: u32,
    /// Upload bucket: chunk requests per minute per IP.
    #[serde(default = "default_upload_per_minute")]
    pub upload_per_minute: u32,
    /// Monitoring bucket: requests per minute per IP.
    #[serde(default = "default_monitoring_per_minute")]
    pub monitoring_per_minute: u32,
    /// Burst size allowed above the steady rate.
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Trusted proxy IP addresses/CIDR ranges.
    /// Only requests from these IPs will have X-Forwarded-For/X-Real-IP headers trusted.
    /// If empty, forwarded headers are never trusted (only direct connection IP is used).
    /// Use ["*"] to trust all proxies (NOT recommended for production).
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Maximum number of unique IPs to track before rejecting new entries.
    /// Prevents memory exhaustion from attackers spraying unique IPs.
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    /// Interval in seconds between cleanup sweeps of stale entries.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Time-to-live in seconds for rate limit entries.
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_general_per_minute() -> u32 {
    100
}

fn default_upload_per_minute() -> u32 {
    1000
}

fn default_monitoring_per_minute() -> u32 {
    500
}

fn default_burst_size() -> u32 {
    20
}

fn default_max_entries() -> u32 {
    100_000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_entry_ttl_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            general_per_minute: default_general_per_minute(),
            upload_per_minute: default_upload_per_minute(),
            monitoring_per_minute: default_monitoring_per_minute(),
            burst_size: default_burst_size(),
            trusted_proxies: Vec::new(),
            max_entries: default_max_entries(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            entry_ttl_secs: default_entry_ttl_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Validate rate limit configuration.
    /// Returns warnings for configs that are insecure but allowed,
    /// and errors for configs that are unsafe and should be rejected.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if !self.enabled {
            return Ok(warnings);
        }

        if self.cleanup_interval_secs == 0 {
            return Err("rate_limit.cleanup_interval_secs cannot be 0. \
                 This would cause a panic when creating the cleanup timer. \
                 Use a value >= 1 second."
                .to_string());
        }

        if self.trusted_proxies.len() == 1 && self.trusted_proxies[0] == "*" {
            warnings.push(
                "rate_limit.trusted_proxies=['*'] trusts ALL forwarded headers. \
                 This allows clients to spoof their IP address and bypass rate limits. \
                 Only use this setting in development or behind a trusted reverse proxy."
                    .to_string(),
            );
        }

        if self.entry_ttl_secs < 120 {
            warnings.push(format!(
                "rate_limit.entry_ttl_secs={} is very short. \
                 Entries may be evicted before rate limits reset, \
                 allowing clients to bypass limits by waiting. \
                 Recommended minimum: 120 seconds.",
                self.entry_ttl_secs
            ));
        }

        Ok(warnings)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upload limits.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Blob storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Session registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Reaper configuration.
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses the in-memory registry and leaves rate
    /// limiting off so tests don't trip the buckets.
    pub fn for_testing() -> Self {
        Self {
            registry: RegistryConfig::Memory,
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
