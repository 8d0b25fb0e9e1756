//! Actor mailboxes.
//!
//! [`LifoInbox`] is the lock-free ingress point shared by all producers.
//! [`Mailbox`] adds the consumer-side FIFO cache that restores arrival order.

mod lifo_inbox;

pub use lifo_inbox::{LifoInbox, PushResult, TakenList};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Multi-producer, single-consumer mailbox with per-producer FIFO order.
///
/// Producers call [`push`](Self::push). Only the owning actor calls
/// [`pop`](Self::pop), [`try_block`](Self::try_block) and
/// [`close`](Self::close); the cache mutex is therefore uncontended.
pub struct Mailbox<T> {
    inbox: LifoInbox<T>,
    cache: Mutex<VecDeque<T>>,
    len: AtomicUsize,
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.len())
            .field("inbox", &self.inbox)
            .finish()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    /// Open mailbox whose consumer is awake.
    pub fn new() -> Self {
        Self::with_inbox(LifoInbox::new())
    }

    /// Open mailbox whose consumer starts asleep; the first push reports
    /// [`PushResult::UnblockedReader`].
    pub fn new_blocked() -> Self {
        Self::with_inbox(LifoInbox::new_blocked())
    }

    fn with_inbox(inbox: LifoInbox<T>) -> Self {
        Self {
            inbox,
            cache: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Enqueue a value.
    pub fn push(&self, value: T) -> PushResult<T> {
        // Count first so a consumer never sees more values than `len`.
        self.len.fetch_add(1, Ordering::AcqRel);
        let result = self.inbox.push(value);
        if matches!(result, PushResult::QueueClosed(_)) {
            self.release_one();
        }
        result
    }

    // `close` zeroes the count while pushers may still be between their
    // increment and the decrement of a refused push.
    fn release_one(&self) {
        let _ = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                Some(len.saturating_sub(1))
            });
    }

    /// Next value in arrival order, if any.
    pub fn pop(&self) -> Option<T> {
        let mut cache = self.cache.lock();
        if cache.is_empty() {
            let taken = self.inbox.take_head()?;
            cache.extend(taken.into_fifo());
        }
        let value = cache.pop_front()?;
        self.release_one();
        Some(value)
    }

    /// Values pushed and not yet popped. Zero once closed.
    pub fn len(&self) -> usize {
        if self.inbox.is_closed() {
            return 0;
        }
        self.len.load(Ordering::Acquire)
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Put the consumer to sleep if nothing is waiting, cached or queued.
    pub fn try_block(&self) -> bool {
        let cache = self.cache.lock();
        cache.is_empty() && self.inbox.try_block()
    }

    /// Undo a [`try_block`](Self::try_block).
    pub fn try_unblock(&self) -> bool {
        self.inbox.try_unblock()
    }

    /// Whether the consumer is asleep.
    pub fn is_blocked(&self) -> bool {
        self.inbox.is_blocked()
    }

    /// Whether the mailbox was closed.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Close and drain everything, cached values first. Returns `false` when
    /// already closed.
    pub fn close(&self, mut drain: impl FnMut(T)) -> bool {
        let mut drained = Vec::new();
        if !self.inbox.close(|value| drained.push(value)) {
            return false;
        }
        let cached = std::mem::take(&mut *self.cache.lock());
        self.len.store(0, Ordering::Release);
        cached.into_iter().chain(drained).for_each(&mut drain);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pop_restores_arrival_order() {
        let mailbox = Mailbox::new();
        for i in 0..5 {
            mailbox.push(i);
        }
        assert_eq!(mailbox.len(), 5);
        assert_eq!(mailbox.pop(), Some(0));
        mailbox.push(5);
        let rest: Vec<_> = std::iter::from_fn(|| mailbox.pop()).collect();
        assert_eq!(rest, vec![1, 2, 3, 4, 5]);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_try_block_fails_with_cached_values() {
        let mailbox = Mailbox::new();
        mailbox.push(1);
        mailbox.push(2);
        assert_eq!(mailbox.pop(), Some(1));
        assert!(!mailbox.try_block());
        assert_eq!(mailbox.pop(), Some(2));
        assert!(mailbox.try_block());
        assert_eq!(mailbox.push(3), PushResult::UnblockedReader);
    }

    #[test]
    fn test_close_drains_cache_then_inbox() {
        let mailbox = Mailbox::new();
        mailbox.push(1);
        mailbox.push(2);
        mailbox.push(3);
        assert_eq!(mailbox.pop(), Some(1));
        mailbox.push(4);
        let mut drained = Vec::new();
        assert!(mailbox.close(|v| drained.push(v)));
        assert_eq!(drained, vec![2, 3, 4]);
        assert_eq!(mailbox.push(5), PushResult::QueueClosed(5));
        assert_eq!(mailbox.len(), 0);
        assert!(!mailbox.close(|_| {}));
    }

    #[test]
    fn test_refused_push_after_close_does_not_wrap_len() {
        let mailbox = Mailbox::new();
        // A pusher counted itself, then lost the race with `close`.
        mailbox.len.fetch_add(1, Ordering::AcqRel);
        assert!(mailbox.close(|_: i32| {}));
        mailbox.release_one();
        assert_eq!(mailbox.len.load(Ordering::Acquire), 0);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_len_settles_at_zero_when_closed_under_pushes() {
        let mailbox = Arc::new(Mailbox::new());
        let senders: Vec<_> = (0..4)
            .map(|s| {
                let mailbox = Arc::clone(&mailbox);
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        mailbox.push((s, i));
                    }
                })
            })
            .collect();
        std::thread::yield_now();
        assert!(mailbox.close(|_| {}));
        for sender in senders {
            sender.join().expect("sender");
        }
        assert_eq!(mailbox.len(), 0);
        assert_eq!(mailbox.len.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_fifo_per_sender_under_contention() {
        let mailbox = Arc::new(Mailbox::new());
        let senders: Vec<_> = (0..8)
            .map(|s| {
                let mailbox = Arc::clone(&mailbox);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        mailbox.push((s, i));
                    }
                })
            })
            .collect();
        let mut last = [None::<i32>; 8];
        let mut received = 0;
        while received < 8 * 500 {
            if let Some((s, i)) = mailbox.pop() {
                if let Some(prev) = last[s] {
                    assert!(i > prev, "sender {s}: {i} after {prev}");
                }
                last[s] = Some(i);
                received += 1;
            }
        }
        for sender in senders {
            sender.join().expect("sender");
        }
    }
}
