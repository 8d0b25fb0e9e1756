//! The coordinator owns the worker pool and hands out jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use super::config::{SchedulerConfig, SchedulingPolicy};
use super::policy::Policy;
use super::resumable::ShutdownJob;
use super::work_sharing::WorkSharing;
use super::work_stealing::WorkStealing;
use super::{Job, worker};

pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) policy: Box<dyn Policy>,
    pub(crate) resumes: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Shared {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total `resume` calls across all workers.
    pub resumes: u64,
    /// Jobs taken from a peer's queue.
    pub steals: u64,
    /// Jobs waiting in run queues.
    pub queued: usize,
}

/// Handle to a running worker pool.
///
/// Cloning is cheap; every clone drives the same pool. Actors keep a clone to
/// reschedule themselves when a message arrives.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workers", &self.shared.config.worker_count)
            .field("policy", &self.shared.config.policy)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Coordinator {
    /// Spawn `config.worker_count` threads named `tidepool-worker-{n}`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a thread cannot be spawned; threads started
    /// before the failure are shut down again.
    pub fn start(config: SchedulerConfig) -> std::io::Result<Self> {
        let policy: Box<dyn Policy> = match config.policy {
            SchedulingPolicy::WorkSharing => Box::new(WorkSharing::new(config.quantum)),
            SchedulingPolicy::WorkStealing => Box::new(WorkStealing::new(
                config.worker_count,
                config.quantum,
                config.steal.clone(),
            )),
        };
        let shared = Arc::new(Shared {
            config,
            policy,
            resumes: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        let coordinator = Self { shared };

        for id in 0..coordinator.worker_count() {
            let shared = Arc::clone(&coordinator.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("tidepool-worker-{id}"))
                .spawn(move || worker::run(id, shared));
            match spawned {
                Ok(handle) => coordinator.shared.threads.lock().push(handle),
                Err(err) => {
                    coordinator.shutdown();
                    return Err(err);
                }
            }
        }
        tracing::debug!(
            workers = coordinator.worker_count(),
            policy = ?coordinator.shared.config.policy,
            "scheduler started"
        );
        Ok(coordinator)
    }

    /// Queue a job. Safe from any thread, including workers.
    ///
    /// Jobs enqueued after [`shutdown`](Self::shutdown) are dropped.
    pub fn enqueue(&self, job: Job) {
        if self.is_stopped() {
            tracing::trace!("dropping job enqueued after shutdown");
            return;
        }
        self.shared.policy.enqueue(job);
    }

    /// Number of workers, which is also the number of shards.
    pub fn worker_count(&self) -> usize {
        self.shared.config.worker_count
    }

    /// Messages an actor may handle per resume.
    pub fn max_throughput(&self) -> usize {
        self.shared.config.max_throughput
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Current counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            resumes: self.shared.resumes.load(Ordering::Relaxed),
            steals: self.shared.policy.steals(),
            queued: self.shared.policy.queued(),
        }
    }

    /// Stop every worker and drop queued jobs. Idempotent.
    ///
    /// Waits for workers to finish their current job. When called from a
    /// worker thread that thread is not joined; it exits once the caller's
    /// job returns.
    pub fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads = std::mem::take(&mut *self.shared.threads.lock());
        for worker in 0..threads.len() {
            self.shared.policy.enqueue(Arc::new(ShutdownJob {
                worker: Some(worker),
            }));
        }
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        self.shared.policy.clear();
        tracing::debug!("scheduler stopped");
    }
}
