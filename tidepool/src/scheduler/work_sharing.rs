//! Work-sharing: one DRR queue for the whole pool.

use parking_lot::{Condvar, Mutex};

use super::drr_queue::DrrQueue;
use super::policy::Policy;
use super::Job;

/// Every worker pulls from the same queue, so any worker may run any job.
/// Affinity is ignored; actor exclusivity comes from the mailbox protocol.
pub(crate) struct WorkSharing {
    queue: Mutex<DrrQueue<Job>>,
    available: Condvar,
    quantum: i64,
}

impl WorkSharing {
    pub(crate) fn new(quantum: i64) -> Self {
        Self {
            queue: Mutex::new(DrrQueue::new()),
            available: Condvar::new(),
            quantum,
        }
    }
}

impl Policy for WorkSharing {
    fn enqueue(&self, job: Job) {
        self.queue.lock().push_back(job);
        self.available.notify_one();
    }

    fn reschedule(&self, _worker: usize, job: Job) {
        self.enqueue(job);
    }

    fn dequeue(&self, _worker: usize) -> Job {
        let mut queue = self.queue.lock();
        loop {
            if let Some(job) = queue.next(self.quantum) {
                return job;
            }
            self.available.wait(&mut queue);
        }
    }

    fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn clear(&self) {
        let drained = self.queue.lock().take_all();
        // Jobs may own actors whose drop re-enters the scheduler.
        drop(drained);
    }
}
