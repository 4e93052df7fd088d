//! Harvest configuration system.
//!
//! Values are read once at startup and passed into each component's
//! constructor. Nothing reloads during a run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarvestError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Logical job name. Used in logs, summaries and default file names.
    #[serde(default = "default_job")]
    pub job: String,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

fn default_job() -> String { "subreddit-snapshot".into() }

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            job: default_job(),
            limiter: LimiterConfig::default(),
            lock: LockConfig::default(),
            batch: BatchConfig::default(),
            pool: PoolConfig::default(),
            report: ReportConfig::default(),
            collector: CollectorConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Load config from the default path (~/.harvest/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HarvestError::Config(format!("Failed to read config {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| HarvestError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| HarvestError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Harvest home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".harvest")
    }

    /// Reject values the engine could never run with.
    pub fn validate(&self) -> Result<()> {
        if self.job.trim().is_empty() {
            return Err(HarvestError::Config("job name must not be empty".into()));
        }
        if !(self.limiter.capacity.is_finite() && self.limiter.capacity >= 1.0) {
            return Err(HarvestError::QuotaMisconfiguration(format!(
                "limiter.capacity must be >= 1, got {}",
                self.limiter.capacity
            )));
        }
        if !(self.limiter.refill_rate.is_finite() && self.limiter.refill_rate > 0.0) {
            return Err(HarvestError::QuotaMisconfiguration(format!(
                "limiter.refill_rate must be > 0, got {}",
                self.limiter.refill_rate
            )));
        }
        if Duration::try_from_secs_f64(self.limiter.capacity / self.limiter.refill_rate).is_err() {
            return Err(HarvestError::QuotaMisconfiguration(format!(
                "limiter.refill_rate {} is too slow to ever refill {} token(s)",
                self.limiter.refill_rate, self.limiter.capacity
            )));
        }
        if !(0.0..1.0).contains(&self.limiter.jitter) {
            return Err(HarvestError::Config(format!(
                "limiter.jitter must be in [0, 1), got {}",
                self.limiter.jitter
            )));
        }
        if self.pool.concurrency_limit == 0 {
            return Err(HarvestError::Config("pool.concurrency_limit must be >= 1".into()));
        }
        if self.batch.max_size == 0 {
            return Err(HarvestError::Config("batch.max_size must be >= 1".into()));
        }
        if self.batch.batches_per_run == 0 {
            return Err(HarvestError::Config("batch.batches_per_run must be >= 1".into()));
        }
        if self.pool.backoff_base_ms > self.pool.backoff_max_ms {
            return Err(HarvestError::Config(
                "pool.backoff_base_ms must not exceed pool.backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Refill behaviour of the token bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterMode {
    /// Deterministic refill.
    #[default]
    Strict,
    /// Refill rate jittered per call to de-synchronise concurrent callers.
    Smooth,
}

/// Token bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum tokens (burst size).
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    /// Tokens added per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    #[serde(default)]
    pub mode: LimiterMode,
    /// Relative jitter applied to the refill rate in smooth mode.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

// 20 calls per 60s, the quota the collectors were tuned for.
fn default_capacity() -> f64 { 20.0 }
fn default_refill_rate() -> f64 { 20.0 / 60.0 }
fn default_jitter() -> f64 { 0.1 }

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            mode: LimiterMode::default(),
            jitter: default_jitter(),
        }
    }
}

/// How to behave when the run lock is contended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Return "lock busy" immediately.
    #[default]
    FailFast,
    /// Wait up to `timeout_secs`.
    Blocking,
}

/// Exclusive run lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock file path. Empty means `~/.harvest/locks/<job>.lock`.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub mode: LockMode,
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,
}

fn default_lock_timeout() -> u64 { 300 }

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            mode: LockMode::default(),
            timeout_secs: default_lock_timeout(),
        }
    }
}

impl LockConfig {
    pub fn resolve_path(&self, job: &str) -> PathBuf {
        if self.path.is_empty() {
            HarvestConfig::home_dir().join("locks").join(format!("{job}.lock"))
        } else {
            expand_path(&self.path)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where batch state is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Single human-readable JSON state file.
    #[default]
    Json,
    /// SQLite database.
    Sqlite,
}

/// Batch source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum items per batch.
    #[serde(default = "default_batch_size")]
    pub max_size: usize,
    /// Batches drained per run, strictly one after another.
    #[serde(default = "default_batches_per_run")]
    pub batches_per_run: usize,
    /// Start a new pass over the roster when it is exhausted.
    #[serde(default = "bool_true")]
    pub rotate: bool,
    #[serde(default)]
    pub backend: StoreBackend,
    /// State file path. Empty means `~/.harvest/state/<job>.{json,db}`.
    #[serde(default)]
    pub state_path: String,
}

fn bool_true() -> bool { true }
fn default_batch_size() -> usize { 50 }
fn default_batches_per_run() -> usize { 1 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_size(),
            batches_per_run: default_batches_per_run(),
            rotate: true,
            backend: StoreBackend::default(),
            state_path: String::new(),
        }
    }
}

impl BatchConfig {
    pub fn resolve_state_path(&self, job: &str) -> PathBuf {
        if !self.state_path.is_empty() {
            return expand_path(&self.state_path);
        }
        let ext = match self.backend {
            StoreBackend::Json => "json",
            StoreBackend::Sqlite => "db",
        };
        HarvestConfig::home_dir().join("state").join(format!("{job}.{ext}"))
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Max simultaneously in-flight processor calls.
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    /// How long in-flight items may keep running after cancellation.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Cancel the run after this many seconds (0 = no limit).
    #[serde(default)]
    pub run_timeout_secs: u64,
    /// In-process retries for transient item errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_concurrency() -> usize { 5 }
fn default_grace_period() -> u64 { 10 }
fn default_max_retries() -> u32 { 2 }
fn default_backoff_base_ms() -> u64 { 500 }
fn default_backoff_max_ms() -> u64 { 10_000 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency(),
            grace_period_secs: default_grace_period(),
            run_timeout_secs: 0,
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl PoolConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }
}

/// Run summary reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Failure details kept in a summary.
    #[serde(default = "default_max_failure_samples")]
    pub max_failure_samples: usize,
    /// Upper bound on a single notifier handoff.
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,
    /// Incoming-webhook URL. Empty means log-only.
    #[serde(default)]
    pub webhook_url: String,
    /// Message header, e.g. "Reddit: Hot Posts Pipeline".
    #[serde(default)]
    pub header: String,
}

fn default_max_failure_samples() -> usize { 10 }
fn default_notify_timeout() -> u64 { 10 }

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            max_failure_samples: default_max_failure_samples(),
            notify_timeout_secs: default_notify_timeout(),
            webhook_url: String::new(),
            header: String::new(),
        }
    }
}

impl ReportConfig {
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn header_for(&self, job: &str) -> String {
        if self.header.is_empty() {
            format!("{job} Summary")
        } else {
            self.header.clone()
        }
    }
}

/// HTTP collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// URL with an `{item}` placeholder.
    #[serde(default = "default_url_template")]
    pub url_template: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_url_template() -> String { "https://www.reddit.com/r/{item}/about.json".into() }
fn default_user_agent() -> String { format!("harvest/{}", env!("CARGO_PKG_VERSION")) }
fn default_request_timeout() -> u64 { 15 }

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Recurring schedule for `harvest watch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// 5-field cron expression (MIN HOUR DOM MON DOW).
    #[serde(default = "default_cron")]
    pub cron: String,
}

fn default_cron() -> String { "*/15 * * * *".into() }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { cron: default_cron() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarvestConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lock.mode, LockMode::FailFast);
        assert_eq!(config.batch.backend, StoreBackend::Json);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = HarvestConfig::from_toml(
            r#"
            job = "hot-posts"

            [limiter]
            capacity = 5
            refill_rate = 1.0
            mode = "smooth"

            [lock]
            mode = "blocking"
            timeout_secs = 30

            [pool]
            concurrency_limit = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.job, "hot-posts");
        assert_eq!(config.limiter.capacity, 5.0);
        assert_eq!(config.limiter.mode, LimiterMode::Smooth);
        assert_eq!(config.lock.mode, LockMode::Blocking);
        assert_eq!(config.lock.timeout(), Duration::from_secs(30));
        assert_eq!(config.pool.concurrency_limit, 2);
        // untouched sections keep defaults
        assert_eq!(config.batch.max_size, 50);
        assert_eq!(config.report.max_failure_samples, 10);
    }

    #[test]
    fn test_zero_capacity_is_quota_misconfiguration() {
        let err = HarvestConfig::from_toml("[limiter]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(err, HarvestError::QuotaMisconfiguration(_)));
    }

    #[test]
    fn test_vanishing_refill_rate_is_quota_misconfiguration() {
        let err = HarvestConfig::from_toml("[limiter]\ncapacity = 1\nrefill_rate = 1e-20\n").unwrap_err();
        assert!(matches!(err, HarvestError::QuotaMisconfiguration(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = HarvestConfig::from_toml("[pool]\nconcurrency_limit = 0\n").unwrap_err();
        assert!(matches!(err, HarvestError::Config(_)));
    }

    #[test]
    fn test_resolve_paths() {
        let config = HarvestConfig::default();
        let lock = config.lock.resolve_path("hot-posts");
        assert!(lock.ends_with("locks/hot-posts.lock"));

        let mut batch = BatchConfig::default();
        batch.backend = StoreBackend::Sqlite;
        assert!(batch.resolve_state_path("meta").ends_with("state/meta.db"));
        batch.state_path = "/var/lib/harvest/meta.db".into();
        assert_eq!(batch.resolve_state_path("meta"), PathBuf::from("/var/lib/harvest/meta.db"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = HarvestConfig::default();
        config.job = "meta-update".into();
        config.save_to(&path).unwrap();
        let loaded = HarvestConfig::load_from(&path).unwrap();
        assert_eq!(loaded.job, "meta-update");
    }
}
