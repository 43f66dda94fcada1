//! Engine configuration.
//!
//! One struct per component, aggregated into [`EngineConfig`], loadable
//! from a `foreman.toml` file with the resolution chain
//! env var (`FOREMAN_CONFIG`) > explicit path > defaults.
//!
//! Numeric fields are deliberately signed: invalid values (negative, or
//! zero where a positive is required) are silently replaced by defaults
//! at the point of use rather than rejected, so a bad config file never
//! takes the engine down. Name/length/count validations on task input,
//! in contrast, are strict and fail with `InvalidInput`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Coerce a millisecond value to `default` when it is not positive.
fn coerce_ms(value: i64, default: u64, what: &str) -> u64 {
    if value > 0 {
        value as u64
    } else {
        tracing::warn!(value, default, "{what} is not positive, using default");
        default
    }
}

/// Coerce a millisecond value to `default` when outside `[min, max]`.
fn coerce_ms_in_range(value: i64, min: u64, max: u64, default: u64, what: &str) -> u64 {
    if value >= min as i64 && value <= max as i64 {
        value as u64
    } else {
        tracing::warn!(value, min, max, default, "{what} out of range, using default");
        default
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running tasks. Must be >= 1.
    pub max_concurrent_tasks: i64,
    /// Per-task execution budget in milliseconds. Valid range 1s..1h.
    pub task_timeout_ms: i64,
    /// Base retry delay in milliseconds. Valid range 1s..1h.
    pub retry_delay_ms: i64,
    /// Informational flag carried for callers; dispatch width is
    /// governed solely by `max_concurrent_tasks`.
    pub enable_parallel_execution: bool,
}

impl SchedulerConfig {
    pub const DEFAULT_MAX_CONCURRENT: usize = 5;
    pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
    /// Retry backoff never exceeds this, regardless of attempt count.
    pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

    const MIN_MS: u64 = 1_000;
    const MAX_MS: u64 = 3_600_000;

    /// Effective concurrency bound (>= 1).
    pub fn max_concurrent(&self) -> usize {
        if self.max_concurrent_tasks >= 1 {
            self.max_concurrent_tasks as usize
        } else {
            tracing::warn!(
                value = self.max_concurrent_tasks,
                default = Self::DEFAULT_MAX_CONCURRENT,
                "max_concurrent_tasks must be >= 1, using default"
            );
            Self::DEFAULT_MAX_CONCURRENT
        }
    }

    /// Effective per-task timeout.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(coerce_ms_in_range(
            self.task_timeout_ms,
            Self::MIN_MS,
            Self::MAX_MS,
            Self::DEFAULT_TASK_TIMEOUT_MS,
            "task_timeout_ms",
        ))
    }

    /// Effective base retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(coerce_ms_in_range(
            self.retry_delay_ms,
            Self::MIN_MS,
            Self::MAX_MS,
            Self::DEFAULT_RETRY_DELAY_MS,
            "retry_delay_ms",
        ))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: Self::DEFAULT_MAX_CONCURRENT as i64,
            task_timeout_ms: Self::DEFAULT_TASK_TIMEOUT_MS as i64,
            retry_delay_ms: Self::DEFAULT_RETRY_DELAY_MS as i64,
            enable_parallel_execution: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Timeout manager
// ---------------------------------------------------------------------------

/// Timeout manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Sweep interval in milliseconds.
    pub check_interval_ms: i64,
    /// Running tasks older than this are considered timed out.
    pub task_timeout_ms: i64,
    /// Retry budget applied when a task record carries none.
    pub max_retries: i64,
    /// Route exhausted timeouts to the dead-letter queue when bound.
    pub enable_dlq: bool,
}

impl TimeoutConfig {
    pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 1_000;
    pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(coerce_ms(
            self.check_interval_ms,
            Self::DEFAULT_CHECK_INTERVAL_MS,
            "check_interval_ms",
        ))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(coerce_ms(
            self.task_timeout_ms,
            Self::DEFAULT_TASK_TIMEOUT_MS,
            "task_timeout_ms",
        ))
    }

    pub fn max_retries(&self) -> u32 {
        if self.max_retries >= 0 {
            self.max_retries as u32
        } else {
            Self::DEFAULT_MAX_RETRIES
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: Self::DEFAULT_CHECK_INTERVAL_MS as i64,
            task_timeout_ms: Self::DEFAULT_TASK_TIMEOUT_MS as i64,
            max_retries: Self::DEFAULT_MAX_RETRIES as i64,
            enable_dlq: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Guardian
// ---------------------------------------------------------------------------

/// Guardian configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    pub check_interval_ms: i64,
    /// Pending tasks older than this are reported as starved.
    pub max_pending_age_ms: i64,
    /// Running tasks older than this are reported as stuck.
    pub max_running_age_ms: i64,
}

impl GuardianConfig {
    pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 5_000;
    pub const DEFAULT_MAX_PENDING_AGE_MS: u64 = 60_000;
    pub const DEFAULT_MAX_RUNNING_AGE_MS: u64 = 300_000;

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(coerce_ms(
            self.check_interval_ms,
            Self::DEFAULT_CHECK_INTERVAL_MS,
            "check_interval_ms",
        ))
    }

    pub fn max_pending_age(&self) -> Duration {
        Duration::from_millis(coerce_ms(
            self.max_pending_age_ms,
            Self::DEFAULT_MAX_PENDING_AGE_MS,
            "max_pending_age_ms",
        ))
    }

    pub fn max_running_age(&self) -> Duration {
        Duration::from_millis(coerce_ms(
            self.max_running_age_ms,
            Self::DEFAULT_MAX_RUNNING_AGE_MS,
            "max_running_age_ms",
        ))
    }
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: Self::DEFAULT_CHECK_INTERVAL_MS as i64,
            max_pending_age_ms: Self::DEFAULT_MAX_PENDING_AGE_MS as i64,
            max_running_age_ms: Self::DEFAULT_MAX_RUNNING_AGE_MS as i64,
        }
    }
}

// ---------------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------------

/// Dead-letter queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Retry budget granted to entries requeued out of the DLQ.
    pub max_retries: i64,
    /// Entries whose retry count reaches this require operator action.
    pub intervention_threshold: i64,
}

impl DlqConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_INTERVENTION_THRESHOLD: u32 = 3;

    pub fn max_retries(&self) -> u32 {
        if self.max_retries >= 0 {
            self.max_retries as u32
        } else {
            Self::DEFAULT_MAX_RETRIES
        }
    }

    pub fn intervention_threshold(&self) -> u32 {
        if self.intervention_threshold >= 0 {
            self.intervention_threshold as u32
        } else {
            Self::DEFAULT_INTERVENTION_THRESHOLD
        }
    }
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES as i64,
            intervention_threshold: Self::DEFAULT_INTERVENTION_THRESHOLD as i64,
        }
    }
}

// ---------------------------------------------------------------------------
// State manager
// ---------------------------------------------------------------------------

/// State manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Autosave flush interval in milliseconds.
    pub auto_save_interval_ms: i64,
    pub max_snapshots_per_task: i64,
}

impl StateConfig {
    pub const DEFAULT_AUTO_SAVE_INTERVAL_MS: u64 = 30_000;
    pub const DEFAULT_MAX_SNAPSHOTS_PER_TASK: usize = 10;

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_millis(coerce_ms(
            self.auto_save_interval_ms,
            Self::DEFAULT_AUTO_SAVE_INTERVAL_MS,
            "auto_save_interval_ms",
        ))
    }

    pub fn max_snapshots_per_task(&self) -> usize {
        if self.max_snapshots_per_task >= 1 {
            self.max_snapshots_per_task as usize
        } else {
            Self::DEFAULT_MAX_SNAPSHOTS_PER_TASK
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            auto_save_interval_ms: Self::DEFAULT_AUTO_SAVE_INTERVAL_MS as i64,
            max_snapshots_per_task: Self::DEFAULT_MAX_SNAPSHOTS_PER_TASK as i64,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint service
// ---------------------------------------------------------------------------

/// Checkpoint service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Periodic checkpoint interval in milliseconds.
    pub checkpoint_interval_ms: i64,
    /// Oldest checkpoints are pruned past this count.
    pub max_checkpoints_per_task: i64,
    /// Informational: callers may skip writes when step state is
    /// unchanged. The service itself always honors the identity rules.
    pub enable_incremental_checkpoint: bool,
}

impl CheckpointConfig {
    pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 1_000;
    pub const DEFAULT_MAX_CHECKPOINTS_PER_TASK: usize = 10;

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(coerce_ms(
            self.checkpoint_interval_ms,
            Self::DEFAULT_CHECKPOINT_INTERVAL_MS,
            "checkpoint_interval_ms",
        ))
    }

    pub fn max_checkpoints_per_task(&self) -> usize {
        if self.max_checkpoints_per_task >= 1 {
            self.max_checkpoints_per_task as usize
        } else {
            Self::DEFAULT_MAX_CHECKPOINTS_PER_TASK
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: Self::DEFAULT_CHECKPOINT_INTERVAL_MS as i64,
            max_checkpoints_per_task: Self::DEFAULT_MAX_CHECKPOINTS_PER_TASK as i64,
            enable_incremental_checkpoint: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// Full engine configuration, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub timeout: TimeoutConfig,
    pub guardian: GuardianConfig,
    pub dlq: DlqConfig,
    pub state: StateConfig,
    pub checkpoint: CheckpointConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;
        Ok(config)
    }

    /// Resolve configuration: `FOREMAN_CONFIG` env var, then
    /// `./foreman.toml` if present, then defaults.
    pub fn resolve() -> Result<Self> {
        if let Ok(path) = std::env::var("FOREMAN_CONFIG") {
            return Self::load_from(path);
        }
        let local = Path::new("foreman.toml");
        if local.is_file() {
            return Self::load_from(local);
        }
        Ok(Self::default())
    }
}
