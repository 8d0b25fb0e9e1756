//! Worker thread loop.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::coordinator::Shared;
use super::{ExecutionUnit, ResumeResult};

/// Run jobs for `worker` until a shutdown job arrives.
pub(crate) fn run(worker: usize, shared: Arc<Shared>) {
    let unit = ExecutionUnit { worker };
    let max_throughput = shared.config.max_throughput;
    tracing::debug!(worker, "worker started");
    loop {
        let job = shared.policy.dequeue(worker);
        shared.resumes.fetch_add(1, Ordering::Relaxed);
        match job.resume(unit, max_throughput) {
            ResumeResult::ResumeLater => shared.policy.reschedule(worker, job),
            // The job re-enqueues itself when it has work again.
            ResumeResult::AwaitingMessage | ResumeResult::Done => drop(job),
            ResumeResult::ShutdownExecutionUnit => break,
        }
        if shared.is_stopped() {
            break;
        }
    }
    tracing::debug!(worker, "worker stopped");
}
