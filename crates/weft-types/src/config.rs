//! Engine configuration types for weft.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls retry
//! defaults, checkpoint failure handling, and emitter sizing.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `{data_dir}/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Workflow-wide retry defaults, overridden per step.
    #[serde(default)]
    pub retry: RetryConfig,

    /// What to do when a snapshot write fails.
    #[serde(default)]
    pub persistence: PersistencePolicy,

    /// Capacity of each run's broadcast channels.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Batch size used by `foreach` when none is given.
    #[serde(default = "default_foreach_concurrency")]
    pub foreach_concurrency: usize,
}

/// Default capacity of each run's broadcast channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_foreach_concurrency() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            persistence: PersistencePolicy::default(),
            event_capacity: default_event_capacity(),
            foreach_concurrency: default_foreach_concurrency(),
        }
    }
}

/// Retry configuration applied to steps without their own `retries`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first failure (0 = no retry).
    #[serde(default)]
    pub attempts: u32,
    /// Pause between attempts, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

/// Behavior when a snapshot write fails mid-run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistencePolicy {
    /// Abort the run and surface the storage error to the caller.
    #[default]
    FailClosed,
    /// Log the failure and keep executing.
    BestEffort,
}
