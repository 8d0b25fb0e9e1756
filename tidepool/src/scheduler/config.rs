//! Scheduler configuration.

use std::time::Duration;

/// How workers find work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// One shared DRR queue behind a mutex and condition variable.
    ///
    /// Simple and deterministic enough for tests, contended on many cores.
    WorkSharing,
    /// One DRR queue per worker; idle workers steal unpinned jobs from peers.
    #[default]
    WorkStealing,
}

/// Polling schedule of an idle work-stealing worker.
///
/// Idle workers first retry aggressively, then back off to short sleeps and
/// finally park until woken (or until `relaxed_sleep` elapses).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealConfig {
    /// Steal attempts with only a `yield_now` in between.
    pub aggressive_poll_attempts: usize,
    /// Steal attempts separated by `moderate_sleep`.
    pub moderate_poll_attempts: usize,
    /// Sleep between moderate attempts.
    pub moderate_sleep: Duration,
    /// Upper bound for one park in the relaxed phase.
    pub relaxed_sleep: Duration,
}

impl Default for StealConfig {
    fn default() -> Self {
        Self {
            aggressive_poll_attempts: 100,
            moderate_poll_attempts: 500,
            moderate_sleep: Duration::from_micros(50),
            relaxed_sleep: Duration::from_millis(10),
        }
    }
}

/// Scheduler configuration.
///
/// # Example
///
/// ```rust
/// use tidepool::scheduler::{SchedulerConfig, SchedulingPolicy};
///
/// let config = SchedulerConfig::builder()
///     .worker_count(4)
///     .max_throughput(50)
///     .policy(SchedulingPolicy::WorkSharing)
///     .build()
///     .expect("valid config");
/// assert_eq!(config.quantum, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads, which is also the number of shards.
    pub worker_count: usize,
    /// Messages an actor may handle per resume.
    pub max_throughput: usize,
    /// Deficit credit granted to a run queue per round.
    pub quantum: i64,
    /// Work distribution policy, fixed for the scheduler's lifetime.
    pub policy: SchedulingPolicy,
    /// Idle behavior of work-stealing workers.
    pub steal: StealConfig,
}

/// Default number of messages per resume.
pub const DEFAULT_MAX_THROUGHPUT: usize = 300;

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_count: workers,
            max_throughput: DEFAULT_MAX_THROUGHPUT,
            quantum: DEFAULT_MAX_THROUGHPUT as i64,
            policy: SchedulingPolicy::default(),
            steal: StealConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Start building a configuration.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// Errors from [`SchedulerConfigBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerConfigError {
    /// At least one worker is required.
    #[error("worker_count must be at least 1")]
    NoWorkers,
    /// Actors must be allowed to handle at least one message per resume.
    #[error("max_throughput must be at least 1")]
    ZeroThroughput,
    /// A round must grant positive credit.
    #[error("quantum must be positive, got {quantum}")]
    NonPositiveQuantum {
        /// The rejected quantum.
        quantum: i64,
    },
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfigBuilder {
    worker_count: Option<usize>,
    max_throughput: Option<usize>,
    quantum: Option<i64>,
    policy: Option<SchedulingPolicy>,
    steal: Option<StealConfig>,
}

impl SchedulerConfigBuilder {
    /// Set the number of workers (shards).
    pub fn worker_count(mut self, workers: usize) -> Self {
        self.worker_count = Some(workers);
        self
    }

    /// Set the per-resume message quota.
    pub fn max_throughput(mut self, max_throughput: usize) -> Self {
        self.max_throughput = Some(max_throughput);
        self
    }

    /// Set the per-round deficit credit. Defaults to `max_throughput`.
    pub fn quantum(mut self, quantum: i64) -> Self {
        self.quantum = Some(quantum);
        self
    }

    /// Select the scheduling policy.
    pub fn policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Tune idle polling of work-stealing workers.
    pub fn steal(mut self, steal: StealConfig) -> Self {
        self.steal = Some(steal);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// See [`SchedulerConfigError`].
    pub fn build(self) -> Result<SchedulerConfig, SchedulerConfigError> {
        let defaults = SchedulerConfig::default();
        let worker_count = self.worker_count.unwrap_or(defaults.worker_count);
        if worker_count == 0 {
            return Err(SchedulerConfigError::NoWorkers);
        }
        let max_throughput = self.max_throughput.unwrap_or(defaults.max_throughput);
        if max_throughput == 0 {
            return Err(SchedulerConfigError::ZeroThroughput);
        }
        let quantum = self.quantum.unwrap_or(max_throughput as i64);
        if quantum <= 0 {
            return Err(SchedulerConfigError::NonPositiveQuantum { quantum });
        }
        Ok(SchedulerConfig {
            worker_count,
            max_throughput,
            quantum,
            policy: self.policy.unwrap_or(defaults.policy),
            steal: self.steal.unwrap_or(defaults.steal),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantum_follows_throughput() {
        let config = SchedulerConfig::builder()
            .worker_count(2)
            .max_throughput(10)
            .build()
            .expect("valid");
        assert_eq!(config.quantum, 10);
        assert_eq!(config.policy, SchedulingPolicy::WorkStealing);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert_eq!(
            SchedulerConfig::builder().worker_count(0).build(),
            Err(SchedulerConfigError::NoWorkers)
        );
        assert_eq!(
            SchedulerConfig::builder().max_throughput(0).build(),
            Err(SchedulerConfigError::ZeroThroughput)
        );
        assert_eq!(
            SchedulerConfig::builder().quantum(-3).build(),
            Err(SchedulerConfigError::NonPositiveQuantum { quantum: -3 })
        );
    }
}
