//! Units of cooperative work.

use std::sync::Arc;

use parking_lot::Mutex;

/// Outcome of one [`Resumable::resume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    /// Still has work; put it back on a run queue.
    ResumeLater,
    /// Nothing to do until someone enqueues it again.
    AwaitingMessage,
    /// Finished for good; the queue drops its reference.
    Done,
    /// The worker that ran this job must exit.
    ShutdownExecutionUnit,
}

/// What kind of work a resumable represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumableKind {
    /// A scheduled actor draining its mailbox.
    ActorTask,
    /// Completion of an I/O operation.
    IoTask,
    /// A one-shot closure.
    FunctionObject,
}

/// The worker currently running a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionUnit {
    /// Worker index, also the shard id.
    pub worker: usize,
}

/// Minimal unit of cooperatively scheduled work.
///
/// A resumable sits in at most one run queue at a time. It is shared through
/// `Arc` because producers on other threads may race to reschedule it; the
/// implementation decides who wins (actors use their inbox block state).
///
/// `resume` must not unwind: failures have to be turned into `Done` by the
/// implementation, the scheduler has no recovery policy of its own.
pub trait Resumable: Send + Sync {
    /// Run for at most `max_throughput` units of work.
    fn resume(&self, unit: ExecutionUnit, max_throughput: usize) -> ResumeResult;

    /// What this job is.
    fn kind(&self) -> ResumableKind;

    /// Estimated cost of the next resume, in deficit units.
    fn cost(&self) -> u64 {
        1
    }

    /// Worker this job is pinned to, if any. Pinned jobs are never stolen.
    fn affinity(&self) -> Option<usize> {
        None
    }
}

/// Shared handle to a resumable, as stored in run queues.
pub type Job = Arc<dyn Resumable>;

/// Runs a closure once on a worker thread.
pub struct FunctionJob {
    func: Mutex<Option<Box<dyn FnOnce(ExecutionUnit) + Send>>>,
    affinity: Option<usize>,
}

impl FunctionJob {
    /// Wrap a closure that may run on any worker.
    pub fn new(func: impl FnOnce(ExecutionUnit) + Send + 'static) -> Job {
        Arc::new(Self {
            func: Mutex::new(Some(Box::new(func))),
            affinity: None,
        })
    }

    /// Wrap a closure that must run on `worker`.
    pub fn pinned(worker: usize, func: impl FnOnce(ExecutionUnit) + Send + 'static) -> Job {
        Arc::new(Self {
            func: Mutex::new(Some(Box::new(func))),
            affinity: Some(worker),
        })
    }
}

impl Resumable for FunctionJob {
    fn resume(&self, unit: ExecutionUnit, _max_throughput: usize) -> ResumeResult {
        if let Some(func) = self.func.lock().take() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func(unit))).is_err() {
                tracing::error!(worker = unit.worker, "function job panicked");
            }
        }
        ResumeResult::Done
    }

    fn kind(&self) -> ResumableKind {
        ResumableKind::FunctionObject
    }

    fn affinity(&self) -> Option<usize> {
        self.affinity
    }
}

/// Poison pill telling a worker to leave its loop.
pub(crate) struct ShutdownJob {
    pub(crate) worker: Option<usize>,
}

impl Resumable for ShutdownJob {
    fn resume(&self, _unit: ExecutionUnit, _max_throughput: usize) -> ResumeResult {
        ResumeResult::ShutdownExecutionUnit
    }

    fn kind(&self) -> ResumableKind {
        ResumableKind::FunctionObject
    }

    fn affinity(&self) -> Option<usize> {
        self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_function_job_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let job = FunctionJob::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let unit = ExecutionUnit { worker: 0 };
        assert_eq!(job.resume(unit, 10), ResumeResult::Done);
        assert_eq!(job.resume(unit, 10), ResumeResult::Done);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(job.kind(), ResumableKind::FunctionObject);
    }

    #[test]
    fn test_function_job_panic_is_contained() {
        let job = FunctionJob::pinned(3, |_| panic!("boom"));
        assert_eq!(job.affinity(), Some(3));
        assert_eq!(
            job.resume(ExecutionUnit { worker: 3 }, 1),
            ResumeResult::Done
        );
    }
}
