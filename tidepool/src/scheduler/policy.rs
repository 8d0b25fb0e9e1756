//! Queueing strategy shared by the coordinator and its workers.

use super::Job;

/// Where jobs wait between resumes.
///
/// `dequeue` blocks the calling worker until a job is available; every other
/// method returns immediately and may be called from any thread.
pub(crate) trait Policy: Send + Sync {
    /// Place a new or reactivated job and wake a worker for it.
    fn enqueue(&self, job: Job);

    /// Put back a job that returned `ResumeLater` on `worker`.
    fn reschedule(&self, worker: usize, job: Job);

    /// Next job for `worker`, blocking while there is none.
    fn dequeue(&self, worker: usize) -> Job;

    /// Jobs currently queued.
    fn queued(&self) -> usize;

    /// Drop every queued job.
    fn clear(&self);

    /// Number of successful steals, zero for policies without stealing.
    fn steals(&self) -> u64 {
        0
    }
}
