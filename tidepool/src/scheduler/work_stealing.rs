//! Work-stealing: one DRR queue per worker plus a shared injector.
//!
//! Pinned jobs land on their home worker and never move. Unpinned jobs enter
//! through the injector; idle workers drain it and then steal unpinned work
//! from the back of a randomly chosen peer's queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use super::config::StealConfig;
use super::drr_queue::DrrQueue;
use super::policy::Policy;
use super::Job;

/// Per-worker wake-up flag. `notified` survives a notify that arrives before
/// the worker parks.
struct Parker {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn unpark(&self) {
        *self.notified.lock() = true;
        self.cond.notify_one();
    }

    fn park_timeout(&self, timeout: Duration) {
        let mut notified = self.notified.lock();
        if !*notified {
            self.cond.wait_for(&mut notified, timeout);
        }
        *notified = false;
    }
}

pub(crate) struct WorkStealing {
    queues: Vec<Mutex<DrrQueue<Job>>>,
    parkers: Vec<Parker>,
    injector: Injector<Job>,
    quantum: i64,
    steal: StealConfig,
    wake_counter: AtomicUsize,
    steals: AtomicU64,
}

impl WorkStealing {
    pub(crate) fn new(workers: usize, quantum: i64, steal: StealConfig) -> Self {
        let workers = workers.max(1);
        Self {
            queues: (0..workers).map(|_| Mutex::new(DrrQueue::new())).collect(),
            parkers: (0..workers).map(|_| Parker::new()).collect(),
            injector: Injector::new(),
            quantum,
            steal,
            wake_counter: AtomicUsize::new(0),
            steals: AtomicU64::new(0),
        }
    }

    fn home(&self, job: &Job) -> Option<usize> {
        job.affinity().map(|worker| worker % self.queues.len())
    }

    fn push_local(&self, worker: usize, job: Job) {
        self.queues[worker].lock().push_back(job);
        self.parkers[worker].unpark();
    }

    /// Wake one worker, rotating so the same thread is not always picked.
    fn wake_any(&self) {
        let idx = self.wake_counter.fetch_add(1, Ordering::Relaxed) % self.parkers.len();
        self.parkers[idx].unpark();
    }

    fn try_local(&self, worker: usize) -> Option<Job> {
        self.queues[worker].lock().next(self.quantum)
    }

    fn try_injector(&self) -> Option<Job> {
        loop {
            match self.injector.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn try_steal_from_peers(&self, worker: usize) -> Option<Job> {
        let n = self.queues.len();
        if n <= 1 {
            return None;
        }
        let start = rand::rng().random_range(0..n);
        for i in 0..n {
            let victim = (start + i) % n;
            if victim == worker {
                continue;
            }
            // Never wait on a busy victim.
            let Some(mut queue) = self.queues[victim].try_lock() else {
                continue;
            };
            if let Some(job) = queue.steal_back(|job| job.affinity().is_none()) {
                self.steals.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(worker, victim, "stole job");
                return Some(job);
            }
        }
        None
    }

    fn try_find(&self, worker: usize) -> Option<Job> {
        self.try_local(worker)
            .or_else(|| self.try_injector())
            .or_else(|| self.try_steal_from_peers(worker))
    }
}

impl Policy for WorkStealing {
    fn enqueue(&self, job: Job) {
        match self.home(&job) {
            Some(worker) => self.push_local(worker, job),
            None => {
                self.injector.push(job);
                self.wake_any();
            }
        }
    }

    fn reschedule(&self, worker: usize, job: Job) {
        let target = self.home(&job).unwrap_or(worker % self.queues.len());
        self.queues[target].lock().push_back(job);
        if target != worker {
            self.parkers[target].unpark();
        }
    }

    fn dequeue(&self, worker: usize) -> Job {
        let StealConfig {
            aggressive_poll_attempts,
            moderate_poll_attempts,
            moderate_sleep,
            relaxed_sleep,
        } = self.steal;

        for _ in 0..aggressive_poll_attempts {
            if let Some(job) = self.try_find(worker) {
                return job;
            }
            std::thread::yield_now();
        }
        for _ in 0..moderate_poll_attempts {
            if let Some(job) = self.try_find(worker) {
                return job;
            }
            std::thread::sleep(moderate_sleep);
        }
        loop {
            if let Some(job) = self.try_find(worker) {
                return job;
            }
            self.parkers[worker].park_timeout(relaxed_sleep);
        }
    }

    fn queued(&self) -> usize {
        self.injector.len() + self.queues.iter().map(|q| q.lock().len()).sum::<usize>()
    }

    fn clear(&self) {
        let mut drained = Vec::new();
        while let Some(job) = self.try_injector() {
            drained.push(job);
        }
        for queue in &self.queues {
            drained.extend(queue.lock().take_all());
        }
        drop(drained);
    }

    fn steals(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::FunctionJob;
    use std::sync::Arc;

    fn quick() -> StealConfig {
        StealConfig {
            aggressive_poll_attempts: 1,
            moderate_poll_attempts: 1,
            moderate_sleep: Duration::from_micros(10),
            relaxed_sleep: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_pinned_job_goes_home() {
        let policy = WorkStealing::new(3, 10, quick());
        policy.enqueue(FunctionJob::pinned(2, |_| {}));
        assert_eq!(policy.queues[2].lock().len(), 1);
        assert!(policy.injector.is_empty());
    }

    #[test]
    fn test_pinned_job_is_not_stolen() {
        let policy = WorkStealing::new(2, 10, quick());
        policy.reschedule(0, FunctionJob::pinned(0, |_| {}));
        assert!(policy.try_steal_from_peers(1).is_none());
        policy.reschedule(0, FunctionJob::new(|_| {}));
        let stolen = policy.try_steal_from_peers(1).expect("unpinned job");
        assert_eq!(stolen.affinity(), None);
        assert_eq!(policy.steals(), 1);
    }

    #[test]
    fn test_idle_worker_is_woken() {
        let policy = Arc::new(WorkStealing::new(2, 10, quick()));
        let consumer = {
            let policy = Arc::clone(&policy);
            std::thread::spawn(move || policy.dequeue(1))
        };
        std::thread::sleep(Duration::from_millis(30));
        policy.enqueue(FunctionJob::pinned(1, |_| {}));
        let job = consumer.join().expect("join");
        assert_eq!(job.affinity(), Some(1));
    }

    #[test]
    fn test_clear_empties_every_queue() {
        let policy = WorkStealing::new(2, 10, quick());
        policy.enqueue(FunctionJob::new(|_| {}));
        policy.enqueue(FunctionJob::pinned(1, |_| {}));
        assert_eq!(policy.queued(), 2);
        policy.clear();
        assert_eq!(policy.queued(), 0);
    }
}
