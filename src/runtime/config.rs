use crate::runtime::telemetry;
use anyhow::{bail, Result};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_REORG_DEPTH: usize = 16;

/// Policy applied when a subscriber callback fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskErrorHandling {
    /// Retry the same callback after `retry_delay` until it succeeds.
    #[default]
    Retry,
    /// Drop the failed callback for this event and continue with the next subscriber.
    Skip,
}

impl FromStr for TaskErrorHandling {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            other => bail!("unknown task error handling mode {other:?}; expected retry or skip"),
        }
    }
}

/// Runtime configuration for the block watcher.
///
/// All instances must be constructed via [`WatcherConfig::builder`] or [`WatcherConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    start_block: Option<u64>,
    poll_interval: Duration,
    max_reorg_depth: usize,
    retry_delay: Duration,
    task_error_handling: TaskErrorHandling,
    metrics_interval: Duration,
}

pub struct WatcherConfigParams {
    pub start_block: Option<u64>,
    pub poll_interval: Duration,
    pub max_reorg_depth: usize,
    pub retry_delay: Duration,
    pub task_error_handling: TaskErrorHandling,
    pub metrics_interval: Duration,
}

impl WatcherConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> WatcherConfigBuilder {
        WatcherConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: WatcherConfigParams) -> Result<Self> {
        let WatcherConfigParams {
            start_block,
            poll_interval,
            max_reorg_depth,
            retry_delay,
            task_error_handling,
            metrics_interval,
        } = params;

        let config = Self {
            start_block,
            poll_interval,
            max_reorg_depth,
            retry_delay,
            task_error_handling,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// First height fetched when the observed window is empty. `None` means "current chain head".
    pub fn start_block(&self) -> Option<u64> {
        self.start_block
    }

    /// Delay between cycles that found no new block.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Number of blocks retained in the observed window.
    pub fn max_reorg_depth(&self) -> usize {
        self.max_reorg_depth
    }

    /// Fixed delay between polling attempts and callback retries.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn task_error_handling(&self) -> TaskErrorHandling {
        self.task_error_handling
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.max_reorg_depth == 0 {
            bail!("max_reorg_depth must be greater than 0");
        }

        if self.retry_delay.is_zero() {
            bail!("retry_delay must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            start_block: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            task_error_handling: TaskErrorHandling::default(),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct WatcherConfigBuilder {
    start_block: Option<u64>,
    poll_interval: Option<Duration>,
    max_reorg_depth: Option<usize>,
    retry_delay: Option<Duration>,
    task_error_handling: Option<TaskErrorHandling>,
    metrics_interval: Option<Duration>,
}

impl WatcherConfigBuilder {
    pub fn start_block(mut self, height: u64) -> Self {
        self.start_block = Some(height);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn max_reorg_depth(mut self, depth: usize) -> Self {
        self.max_reorg_depth = Some(depth);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn task_error_handling(mut self, mode: TaskErrorHandling) -> Self {
        self.task_error_handling = Some(mode);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<WatcherConfig> {
        let defaults = WatcherConfig::default();
        let params = WatcherConfigParams {
            start_block: self.start_block,
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            max_reorg_depth: self.max_reorg_depth.unwrap_or(defaults.max_reorg_depth),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            task_error_handling: self
                .task_error_handling
                .unwrap_or(defaults.task_error_handling),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
        };

        WatcherConfig::new(params)
    }
}
