//! Timer thread for request timeouts, behavior timeouts and delayed sends.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Handle for cancelling a scheduled action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

type Action = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    actions: HashMap<u64, Action>,
    next_id: u64,
    stopped: bool,
}

struct Inner {
    state: Mutex<State>,
    changed: Condvar,
}

/// Runs actions at their deadline on a dedicated thread.
///
/// Actions run outside the clock's lock, in deadline order, and must not
/// block: they usually just push a message into a mailbox.
#[derive(Clone)]
pub struct ActorClock {
    inner: Arc<Inner>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ActorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorClock")
            .field("pending", &self.pending())
            .finish()
    }
}

impl ActorClock {
    /// Spawn the `tidepool-clock` thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn start() -> std::io::Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
        });
        let handle = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("tidepool-clock".into())
                .spawn(move || run(&inner))?
        };
        Ok(Self {
            inner,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Run `action` at `deadline`. After shutdown the action is dropped.
    pub fn schedule_at(&self, deadline: Instant, action: impl FnOnce() + Send + 'static) -> TimerId {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if state.stopped {
            return TimerId(id);
        }
        let wakes_thread = state
            .deadlines
            .peek()
            .is_none_or(|Reverse((earliest, _))| deadline < *earliest);
        state.deadlines.push(Reverse((deadline, id)));
        state.actions.insert(id, Box::new(action));
        drop(state);
        if wakes_thread {
            self.inner.changed.notify_one();
        }
        TimerId(id)
    }

    /// Run `action` after `delay`.
    pub fn schedule_after(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> TimerId {
        self.schedule_at(Instant::now() + delay, action)
    }

    /// Cancel a pending action. Returns `false` if it already ran or was
    /// cancelled before.
    pub fn cancel(&self, id: TimerId) -> bool {
        // The heap entry stays and is skipped when it comes due.
        let removed = self.inner.state.lock().actions.remove(&id.0);
        removed.is_some()
    }

    /// Actions waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().actions.len()
    }

    /// Stop the thread and drop every pending action. Idempotent.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.deadlines.clear();
            std::mem::take(&mut state.actions)
        };
        self.inner.changed.notify_all();
        drop(dropped);
        if let Some(handle) = self.thread.lock().take()
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            tracing::error!("clock thread panicked");
        }
    }
}

fn run(inner: &Inner) {
    let mut state = inner.state.lock();
    loop {
        if state.stopped {
            return;
        }
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = state.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            state.deadlines.pop();
            if let Some(action) = state.actions.remove(&id) {
                due.push(action);
            }
        }
        if !due.is_empty() {
            drop(state);
            for action in due {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)).is_err() {
                    tracing::error!("timer action panicked");
                }
            }
            state = inner.state.lock();
            continue;
        }
        match state.deadlines.peek().copied() {
            Some(Reverse((deadline, _))) => {
                inner.changed.wait_until(&mut state, deadline);
            }
            None => inner.changed.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_actions_fire_in_deadline_order() {
        let clock = ActorClock::start().expect("clock");
        let (tx, rx) = mpsc::channel();
        for (label, delay) in [(3, 30), (1, 10), (2, 20)] {
            let tx = tx.clone();
            clock.schedule_after(Duration::from_millis(delay), move || {
                let _ = tx.send(label);
            });
        }
        let fired: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("fired"))
            .collect();
        assert_eq!(fired, vec![1, 2, 3]);
        clock.shutdown();
    }

    #[test]
    fn test_cancel_prevents_action() {
        let clock = ActorClock::start().expect("clock");
        let (tx, rx) = mpsc::channel::<()>();
        let id = clock.schedule_after(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });
        assert!(clock.cancel(id));
        assert!(!clock.cancel(id));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        clock.shutdown();
    }

    #[test]
    fn test_shutdown_drops_pending_actions() {
        let clock = ActorClock::start().expect("clock");
        clock.schedule_after(Duration::from_secs(60), || {});
        assert_eq!(clock.pending(), 1);
        clock.shutdown();
        assert_eq!(clock.pending(), 0);
        clock.schedule_after(Duration::from_millis(1), || {});
        assert_eq!(clock.pending(), 0);
    }
}
