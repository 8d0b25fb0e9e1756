//! Lock-free multi-producer, single-consumer LIFO inbox.
//!
//! The head pointer encodes four states:
//!
//! | head        | meaning                                          |
//! |-------------|--------------------------------------------------|
//! | null        | empty, consumer awake                            |
//! | `BLOCKED`   | empty, consumer asleep; next push must wake it   |
//! | `CLOSED`    | closed for good; pushes are rejected             |
//! | node ptr    | non-empty list, newest element first             |
//!
//! Producers only ever CAS a new node onto the head, so pushes from one thread
//! keep their relative order inside the list (reversed). The consumer takes
//! the whole list at once and reverses it into FIFO order.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

// Nodes contain a pointer, so real node addresses are at least pointer aligned
// and can never equal these tags.
fn blocked_tag<T>() -> *mut Node<T> {
    ptr::without_provenance_mut(1)
}

fn closed_tag<T>() -> *mut Node<T> {
    ptr::without_provenance_mut(2)
}

/// Result of [`LifoInbox::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushResult<T> {
    /// Enqueued; the consumer was already awake or scheduled.
    Success,
    /// Enqueued into a blocked inbox. The caller must wake the consumer.
    UnblockedReader,
    /// The inbox is closed; the value is handed back.
    QueueClosed(T),
}

/// Intrusive LIFO inbox with blocked/closed states.
pub struct LifoInbox<T> {
    head: AtomicPtr<Node<T>>,
    _owns: PhantomData<Box<Node<T>>>,
}

// SAFETY: Values are moved between threads through the list but each node is
// owned by exactly one side at a time: the producer until its CAS succeeds,
// the inbox until the consumer swaps the list out.
unsafe impl<T: Send> Send for LifoInbox<T> {}
// SAFETY: All shared access goes through the atomic head.
unsafe impl<T: Send> Sync for LifoInbox<T> {}

impl<T> Default for LifoInbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LifoInbox<T> {
    /// Empty, open, unblocked inbox.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Empty inbox in the blocked state: the first push reports
    /// [`PushResult::UnblockedReader`].
    pub fn new_blocked() -> Self {
        Self {
            head: AtomicPtr::new(blocked_tag()),
            _owns: PhantomData,
        }
    }

    /// Push a value. Safe from any number of threads.
    pub fn push(&self, value: T) -> PushResult<T> {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == closed_tag() {
                // SAFETY: `node` came from `Box::into_raw` above and was never
                // published.
                let node = unsafe { Box::from_raw(node) };
                return PushResult::QueueClosed(node.value);
            }
            let next = if head == blocked_tag() {
                ptr::null_mut()
            } else {
                head
            };
            // SAFETY: `node` is still exclusively ours until the CAS succeeds.
            unsafe { (*node).next = next };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if head == blocked_tag() => return PushResult::UnblockedReader,
                Ok(_) => return PushResult::Success,
                Err(actual) => head = actual,
            }
        }
    }

    /// Take every queued value, newest first. Consumer only.
    pub fn take_head(&self) -> Option<TakenList<T>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() || head == blocked_tag() || head == closed_tag() {
                return None;
            }
            match self.head.compare_exchange_weak(
                head,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(TakenList {
                        head,
                        _owns: PhantomData,
                    });
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Move empty → blocked. Fails if a value arrived or the inbox is closed.
    pub fn try_block(&self) -> bool {
        self.head
            .compare_exchange(
                ptr::null_mut(),
                blocked_tag(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move blocked → empty. Fails unless the inbox is currently blocked.
    pub fn try_unblock(&self) -> bool {
        self.head
            .compare_exchange(
                blocked_tag(),
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Close the inbox and feed every queued value, oldest first, to `drain`.
    ///
    /// Returns `false` if it was already closed, in which case `drain` is not
    /// called.
    pub fn close(&self, mut drain: impl FnMut(T)) -> bool {
        let old = self.head.swap(closed_tag(), Ordering::AcqRel);
        if old == closed_tag() {
            return false;
        }
        if !old.is_null() && old != blocked_tag() {
            let taken = TakenList {
                head: old,
                _owns: PhantomData,
            };
            taken.into_fifo().into_iter().for_each(&mut drain);
        }
        true
    }

    /// Whether the consumer is registered as asleep.
    pub fn is_blocked(&self) -> bool {
        self.head.load(Ordering::Acquire) == blocked_tag()
    }

    /// Whether the inbox was closed.
    pub fn is_closed(&self) -> bool {
        self.head.load(Ordering::Acquire) == closed_tag()
    }

    /// Whether no value is queued (blocked and closed inboxes are empty).
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        head.is_null() || head == blocked_tag() || head == closed_tag()
    }
}

impl<T> Drop for LifoInbox<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        if !head.is_null() && head != blocked_tag() && head != closed_tag() {
            drop(TakenList::<T> {
                head,
                _owns: PhantomData,
            });
        }
    }
}

impl<T> std::fmt::Debug for LifoInbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifoInbox")
            .field("blocked", &self.is_blocked())
            .field("closed", &self.is_closed())
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// A list taken out of an inbox, newest element first.
pub struct TakenList<T> {
    head: *mut Node<T>,
    _owns: PhantomData<Box<Node<T>>>,
}

// SAFETY: The list is exclusively owned once taken.
unsafe impl<T: Send> Send for TakenList<T> {}

impl<T> TakenList<T> {
    /// Reverse into arrival order.
    pub fn into_fifo(self) -> Vec<T> {
        let mut values: Vec<T> = self.collect();
        values.reverse();
        values
    }
}

impl<T> Iterator for TakenList<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: Every non-null pointer in a taken list is a node created by
        // `push` and owned by this list alone.
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        Some(node.value)
    }
}

impl<T> Drop for TakenList<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_taken_list_is_lifo() {
        let inbox = LifoInbox::new();
        for i in 0..3 {
            assert_eq!(inbox.push(i), PushResult::Success);
        }
        let taken: Vec<_> = inbox.take_head().expect("non-empty").collect();
        assert_eq!(taken, vec![2, 1, 0]);
        assert!(inbox.take_head().is_none());
    }

    #[test]
    fn test_blocked_inbox_reports_unblocked_reader_once() {
        let inbox = LifoInbox::new_blocked();
        assert!(inbox.is_blocked());
        assert_eq!(inbox.push(1), PushResult::UnblockedReader);
        assert_eq!(inbox.push(2), PushResult::Success);
        assert!(!inbox.try_block());
        assert_eq!(inbox.take_head().expect("values").into_fifo(), vec![1, 2]);
        assert!(inbox.try_block());
        assert!(inbox.try_unblock());
        assert!(!inbox.try_unblock());
    }

    #[test]
    fn test_close_drains_in_order_and_rejects() {
        let inbox = LifoInbox::new();
        inbox.push("a");
        inbox.push("b");
        let mut drained = Vec::new();
        assert!(inbox.close(|v| drained.push(v)));
        assert_eq!(drained, vec!["a", "b"]);
        assert!(!inbox.close(|_| panic!("closed twice")));
        assert_eq!(inbox.push("c"), PushResult::QueueClosed("c"));
        assert!(inbox.is_closed());
        assert!(!inbox.try_block());
    }

    #[test]
    fn test_drop_frees_pending_values() {
        let value = Arc::new(());
        {
            let inbox = LifoInbox::new();
            inbox.push(Arc::clone(&value));
            inbox.push(Arc::clone(&value));
            let partial = inbox.take_head();
            inbox.push(Arc::clone(&value));
            drop(partial);
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn test_concurrent_producers_keep_per_thread_order() {
        let inbox = Arc::new(LifoInbox::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let inbox = Arc::clone(&inbox);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        inbox.push((t, i));
                    }
                })
            })
            .collect();
        let mut seen = Vec::new();
        while seen.len() < 4000 {
            if let Some(list) = inbox.take_head() {
                seen.extend(list.into_fifo());
            }
        }
        for producer in producers {
            producer.join().expect("producer");
        }
        for t in 0..4 {
            let order: Vec<_> = seen.iter().filter(|(p, _)| *p == t).map(|(_, i)| *i).collect();
            assert_eq!(order, (0..1000).collect::<Vec<_>>());
        }
    }
}
