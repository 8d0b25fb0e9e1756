//! Deficit round robin queue.
//!
//! Each round grants the queue a `quantum` of credit (its deficit). Items are
//! consumed from the front while their cost fits the remaining deficit; an
//! item that does not fit waits for the next round. Because rescheduled work
//! goes to the back, every item is reached after at most one full pass over
//! the queue as long as no single cost exceeds the quantum.

use std::collections::VecDeque;

/// Something with a scheduling cost.
pub trait Costed {
    /// Deficit units charged for consuming this item.
    fn cost(&self) -> u64;
}

impl Costed for super::Job {
    fn cost(&self) -> u64 {
        super::Resumable::cost(self.as_ref())
    }
}

/// Verdict of a consumer passed to [`DrrQueue::new_round`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult<T> {
    /// Keep consuming.
    Continue,
    /// The consumer declined the item: it goes back to the front, its cost is
    /// refunded and the round ends.
    Skip(T),
    /// End this round.
    Stop,
    /// End this round and tell the caller to stop every other queue too.
    StopAll,
}

/// Summary of one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NewRoundResult {
    /// At least one item was consumed.
    pub consumed_items: bool,
    /// The consumer asked to stop all queues.
    pub stop_all: bool,
}

/// FIFO of costed items plus a deficit counter.
#[derive(Debug)]
pub struct DrrQueue<T> {
    items: VecDeque<T>,
    deficit: i64,
}

impl<T> Default for DrrQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DrrQueue<T> {
    /// Empty queue with zero deficit.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            deficit: 0,
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remaining credit for the current round.
    pub fn deficit(&self) -> i64 {
        self.deficit
    }

    /// Append an item.
    pub fn push_back(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Grant `quantum` credit. Idle queues do not accumulate credit.
    pub fn inc_deficit(&mut self, quantum: i64) {
        if !self.items.is_empty() {
            self.deficit += quantum;
        }
    }

    /// Remove and return the first item matching `pred`, searching from the back.
    ///
    /// Used by thieves, which take the work least likely to be touched soon.
    pub fn steal_back(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.items.iter().rposition(|item| pred(item))?;
        let item = self.items.remove(index);
        if self.items.is_empty() {
            self.deficit = 0;
        }
        item
    }

    /// Drop every item and reset the deficit.
    pub fn clear(&mut self) {
        self.items.clear();
        self.deficit = 0;
    }

    /// Remove every item, leaving an empty queue with zero deficit.
    pub fn take_all(&mut self) -> VecDeque<T> {
        self.deficit = 0;
        std::mem::take(&mut self.items)
    }
}

impl<T: Costed> DrrQueue<T> {
    /// Pop the front item if its cost fits the remaining deficit.
    ///
    /// Charges the item's cost. Returns `None` when the queue is empty or the
    /// front item must wait for the next [`inc_deficit`](Self::inc_deficit).
    pub fn take_front(&mut self) -> Option<T> {
        let cost = self.items.front()?.cost() as i64;
        if cost > self.deficit {
            return None;
        }
        let item = self.items.pop_front()?;
        self.deficit -= cost;
        if self.items.is_empty() {
            self.deficit = 0;
        }
        Some(item)
    }

    /// Like [`take_front`](Self::take_front) but opens new rounds until the
    /// front item fits. Only returns `None` for an empty queue.
    pub fn next(&mut self, quantum: i64) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        loop {
            if let Some(item) = self.take_front() {
                return Some(item);
            }
            self.inc_deficit(quantum.max(1));
        }
    }

    /// Run one round: grant `quantum`, then feed fitting items to `consumer`.
    pub fn new_round(
        &mut self,
        quantum: i64,
        mut consumer: impl FnMut(T) -> TaskResult<T>,
    ) -> NewRoundResult {
        let mut result = NewRoundResult::default();
        if self.items.is_empty() {
            return result;
        }
        self.inc_deficit(quantum);
        while let Some(item) = self.take_front() {
            let cost = item.cost() as i64;
            match consumer(item) {
                TaskResult::Continue => result.consumed_items = true,
                TaskResult::Skip(item) => {
                    self.deficit += cost;
                    self.items.push_front(item);
                    break;
                }
                TaskResult::Stop => {
                    result.consumed_items = true;
                    break;
                }
                TaskResult::StopAll => {
                    result.consumed_items = true;
                    result.stop_all = true;
                    break;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item {
        id: usize,
        cost: u64,
    }

    impl Costed for Item {
        fn cost(&self) -> u64 {
            self.cost
        }
    }

    fn item(id: usize, cost: u64) -> Item {
        Item { id, cost }
    }

    #[test]
    fn test_empty_queue_gets_no_credit() {
        let mut queue: DrrQueue<Item> = DrrQueue::new();
        queue.inc_deficit(10);
        assert_eq!(queue.deficit(), 0);
        let result = queue.new_round(10, |_| TaskResult::Continue);
        assert!(!result.consumed_items);
    }

    #[test]
    fn test_round_respects_deficit() {
        let mut queue = DrrQueue::new();
        for id in 0..5 {
            queue.push_back(item(id, 3));
        }
        let mut seen = Vec::new();
        let result = queue.new_round(7, |i| {
            seen.push(i.id);
            TaskResult::Continue
        });
        assert!(result.consumed_items);
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(queue.deficit(), 1);

        seen.clear();
        queue.new_round(7, |i| {
            seen.push(i.id);
            TaskResult::Continue
        });
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn test_deficit_resets_when_drained() {
        let mut queue = DrrQueue::new();
        queue.push_back(item(0, 1));
        queue.new_round(100, |_| TaskResult::Continue);
        assert!(queue.is_empty());
        assert_eq!(queue.deficit(), 0);
    }

    #[test]
    fn test_expensive_item_waits_for_credit() {
        let mut queue = DrrQueue::new();
        queue.push_back(item(0, 10));
        let result = queue.new_round(4, |_| TaskResult::Continue);
        assert!(!result.consumed_items);
        assert_eq!(queue.deficit(), 4);
        queue.new_round(4, |_| TaskResult::Continue);
        assert_eq!(queue.deficit(), 8);
        let result = queue.new_round(4, |_| TaskResult::Continue);
        assert!(result.consumed_items);
    }

    #[test]
    fn test_next_opens_rounds_until_fit() {
        let mut queue = DrrQueue::new();
        queue.push_back(item(7, 5));
        assert_eq!(queue.next(2).map(|i| i.id), Some(7));
        assert_eq!(queue.next(2), None);
    }

    #[test]
    fn test_skip_refunds_and_keeps_item() {
        let mut queue = DrrQueue::new();
        queue.push_back(item(0, 2));
        queue.push_back(item(1, 2));
        let result = queue.new_round(5, TaskResult::Skip);
        assert!(!result.consumed_items);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.deficit(), 5);
        assert_eq!(queue.take_front().map(|i| i.id), Some(0));
    }

    #[test]
    fn test_stop_all_is_reported() {
        let mut queue = DrrQueue::new();
        queue.push_back(item(0, 1));
        queue.push_back(item(1, 1));
        let result = queue.new_round(10, |_| TaskResult::StopAll);
        assert!(result.stop_all);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_steal_back_skips_filtered() {
        let mut queue = DrrQueue::new();
        queue.push_back(item(0, 1));
        queue.push_back(item(1, 1));
        queue.push_back(item(2, 1));
        let stolen = queue.steal_back(|i| i.id != 2);
        assert_eq!(stolen.map(|i| i.id), Some(1));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_no_starvation_within_n_quanta() {
        // N flows that always have more work: each consumed flow is
        // rescheduled at the back, like a worker does with ResumeLater.
        const N: usize = 8;
        const QUANTUM: i64 = 4;
        let mut queue = DrrQueue::new();
        for id in 0..N {
            queue.push_back(item(id, 1 + (id as u64 % QUANTUM as u64)));
        }

        let mut resumed = [0usize; N];
        let mut spent: i64 = 0;
        while spent < N as i64 * QUANTUM {
            let mut requeue = Vec::new();
            queue.new_round(QUANTUM, |i| {
                resumed[i.id] += 1;
                spent += i.cost as i64;
                requeue.push(i);
                TaskResult::Continue
            });
            for i in requeue {
                queue.push_back(i);
            }
        }
        assert!(resumed.iter().all(|&count| count >= 1), "{resumed:?}");
    }
}
