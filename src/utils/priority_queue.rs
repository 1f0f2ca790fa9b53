// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Priority classes for queued work. Delay-map drains are requeued `High`
/// so that a block's pending requests jump ahead of unrelated traffic;
/// writeback submissions run `Low` so they never starve reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    const COUNT: usize = 3;

    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// A blocking work queue with three priority classes and FIFO order within
/// each class. `get` drains remaining items after `close` before signalling
/// shutdown with `None`.
pub struct PriorityQueue<T> {
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

struct Inner<T> {
    lanes: [VecDeque<T>; Priority::COUNT],
    closed: bool,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        PriorityQueue {
            inner: Mutex::new(Inner {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn put(&self, item: T, priority: Priority) {
        let mut inner = self.inner.lock();
        inner.lanes[priority.lane()].push_back(item);
        drop(inner);
        self.cv.notify_one();
    }

    /// Pop the highest-priority item, blocking while the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub fn get(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            for lane in inner.lanes.iter_mut() {
                if let Some(item) = lane.pop_front() {
                    return Some(item);
                }
            }
            if inner.closed {
                return None;
            }
            self.cv.wait(&mut inner);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().lanes.iter().all(VecDeque::is_empty)
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn fifo_within_class_and_priority_across() {
        let q = PriorityQueue::new();
        q.put("n1", Priority::Normal);
        q.put("l1", Priority::Low);
        q.put("n2", Priority::Normal);
        q.put("h1", Priority::High);
        q.put("h2", Priority::High);

        assert_eq!(q.get(), Some("h1"));
        assert_eq!(q.get(), Some("h2"));
        assert_eq!(q.get(), Some("n1"));
        assert_eq!(q.get(), Some("n2"));
        assert_eq!(q.get(), Some("l1"));
        assert!(q.is_empty());
    }

    #[test]
    fn get_blocks_until_put() {
        let q = Arc::new(PriorityQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                q.put(7usize, Priority::Normal);
            })
        };
        assert_eq!(q.get(), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn close_drains_then_ends() {
        let q = PriorityQueue::new();
        q.put(1, Priority::Low);
        q.close();
        assert_eq!(q.get(), Some(1));
        assert_eq!(q.get(), None);
    }
}
