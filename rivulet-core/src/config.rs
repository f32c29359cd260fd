//! Runtime configuration. Everything here is explicitly constructed and passed
//! to the pool, stores, and window managers at construction, there is no
//! process-wide singleton.

use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

const DEFAULT_WORKERS: usize = 8;
const DEFAULT_INBOX_CAPACITY: usize = 16;
const DEFAULT_POLL_TIMEOUT_MILLIS: u64 = 100;
const DEFAULT_COMMIT_INTERVAL_MILLIS: u64 = 1000;
const DEFAULT_CHANGELOG_FLUSH_SIZE: usize = 100;
const DEFAULT_CHANGELOG_FLUSH_INTERVAL_MILLIS: u64 = 100;
const DEFAULT_WINDOW_SIZE_MILLIS: u64 = 60_000;
const DEFAULT_WINDOW_RETENTION_MILLIS: u64 = 3_600_000;

/// Top-level settings for one stream runtime instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    #[serde(default)]
    pub changelog: ChangelogConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Settings {
    /// Parses settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.worker_pool.validate()?;
        self.changelog.validate()?;
        self.window.validate()
    }
}

/// Selects how records are assigned to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingStrategy {
    /// Dispatch key is derived from the record key. Finest parallelism while
    /// still serializing records that share a key.
    #[default]
    ByKey,
    /// Dispatch key is the partition id. Coarser parallelism, preserves the
    /// full per-partition order.
    ByPartition,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerPoolConfig {
    /// Number of workers. Fixed for the lifetime of the pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-worker inbox capacity. Bounds memory and provides backpressure
    /// into the source poll loop.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    #[serde(default)]
    pub order: OrderingStrategy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            order: OrderingStrategy::default(),
        }
    }
}

impl WorkerPoolConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("worker count must be non-zero".to_string()));
        }
        if self.inbox_capacity == 0 {
            return Err(Error::Config(
                "worker inbox capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangelogConfig {
    /// When disabled, stores mutate only their in-memory map and offer no
    /// crash-recovery guarantee.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Buffered durability. `None` means synchronous appends.
    #[serde(default)]
    pub buffer: Option<ChangelogBufferConfig>,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer: None,
        }
    }
}

impl ChangelogConfig {
    fn validate(&self) -> Result<()> {
        if let Some(buffer) = &self.buffer {
            if buffer.flush_size == 0 {
                return Err(Error::Config(
                    "changelog buffer flush size must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangelogBufferConfig {
    /// Number of pending appends that triggers a flush.
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
    /// Upper bound on how long an append may sit in the buffer.
    #[serde(default = "default_flush_interval", with = "millis")]
    pub flush_interval: Duration,
}

impl Default for ChangelogBufferConfig {
    fn default() -> Self {
        Self {
            flush_size: DEFAULT_CHANGELOG_FLUSH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_CHANGELOG_FLUSH_INTERVAL_MILLIS),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WindowConfig {
    /// Window size.
    #[serde(default = "default_window_size", with = "millis")]
    pub size: Duration,
    /// Advance interval between aligned window starts. Equal to `size` for
    /// tumbling windows, smaller for hopping windows.
    #[serde(default = "default_window_size", with = "millis")]
    pub advance: Duration,
    /// How long a window is kept after it ends before it is eligible for
    /// expiry.
    #[serde(default = "default_window_retention", with = "millis")]
    pub retention: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: Duration::from_millis(DEFAULT_WINDOW_SIZE_MILLIS),
            advance: Duration::from_millis(DEFAULT_WINDOW_SIZE_MILLIS),
            retention: Duration::from_millis(DEFAULT_WINDOW_RETENTION_MILLIS),
        }
    }
}

impl WindowConfig {
    fn validate(&self) -> Result<()> {
        if self.size.is_zero() {
            return Err(Error::Config("window size must be non-zero".to_string()));
        }
        if self.advance.is_zero() {
            return Err(Error::Config(
                "window advance interval must be non-zero".to_string(),
            ));
        }
        if self.advance > self.size {
            return Err(Error::Config(
                "window advance interval must not exceed window size".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Timeout handed to each source poll.
    #[serde(default = "default_poll_timeout", with = "millis")]
    pub poll_timeout: Duration,
    /// Interval between source offset commits.
    #[serde(default = "default_commit_interval", with = "millis")]
    pub commit_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MILLIS),
            commit_interval: Duration::from_millis(DEFAULT_COMMIT_INTERVAL_MILLIS),
        }
    }
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_inbox_capacity() -> usize {
    DEFAULT_INBOX_CAPACITY
}

fn default_true() -> bool {
    true
}

fn default_flush_size() -> usize {
    DEFAULT_CHANGELOG_FLUSH_SIZE
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(DEFAULT_CHANGELOG_FLUSH_INTERVAL_MILLIS)
}

fn default_window_size() -> Duration {
    Duration::from_millis(DEFAULT_WINDOW_SIZE_MILLIS)
}

fn default_window_retention() -> Duration {
    Duration::from_millis(DEFAULT_WINDOW_RETENTION_MILLIS)
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(DEFAULT_POLL_TIMEOUT_MILLIS)
}

fn default_commit_interval() -> Duration {
    Duration::from_millis(DEFAULT_COMMIT_INTERVAL_MILLIS)
}

/// Durations are configured as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
