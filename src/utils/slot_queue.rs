// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use parking_lot::{Condvar, Mutex};

/// Marks a slot that is linked into neither direction.
const ABSENT: usize = usize::MAX;

/// A bounded intrusive doubly-linked list over slot indices `0..size`.
///
/// Membership is O(1): each index owns one `prev`/`next` cell, with a
/// sentinel node stored at index `size`. The head is the eviction victim
/// (least recently queued), the tail the most recent. Two instances
/// partition the cache's non-busy slots into clean and dirty.
pub struct SlotQueue {
    size: usize,
    inner: Mutex<Links>,
    cv: Condvar,
}

struct Links {
    prev: Vec<usize>,
    next: Vec<usize>,
    closed: bool,
}

impl Links {
    fn contains(&self, idx: usize) -> bool {
        self.prev[idx] != ABSENT
    }

    fn is_empty(&self, sentinel: usize) -> bool {
        self.next[sentinel] == sentinel
    }

    fn detach(&mut self, idx: usize) {
        let (p, n) = (self.prev[idx], self.next[idx]);
        self.next[p] = n;
        self.prev[n] = p;
        self.prev[idx] = ABSENT;
        self.next[idx] = ABSENT;
    }

    fn link_tail(&mut self, idx: usize, sentinel: usize) {
        let tail = self.prev[sentinel];
        self.prev[idx] = tail;
        self.next[idx] = sentinel;
        self.next[tail] = idx;
        self.prev[sentinel] = idx;
    }

    fn link_head(&mut self, idx: usize, sentinel: usize) {
        let head = self.next[sentinel];
        self.prev[idx] = sentinel;
        self.next[idx] = head;
        self.prev[head] = idx;
        self.next[sentinel] = idx;
    }
}

impl SlotQueue {
    pub fn new(size: usize) -> Self {
        let mut prev = vec![ABSENT; size + 1];
        let mut next = vec![ABSENT; size + 1];
        // Empty list: the sentinel links to itself.
        prev[size] = size;
        next[size] = size;
        SlotQueue {
            size,
            inner: Mutex::new(Links {
                prev,
                next,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Append `idx` at the tail, detaching it first if already present
    /// (move-to-tail refreshes recency).
    pub fn put(&self, idx: usize) {
        assert!(idx < self.size, "slot index {idx} out of range");
        let mut links = self.inner.lock();
        if links.contains(idx) {
            links.detach(idx);
        }
        links.link_tail(idx, self.size);
        drop(links);
        self.cv.notify_one();
    }

    /// Detach and return the head, blocking while the list is empty.
    /// Returns `None` once the queue is closed and empty.
    pub fn get(&self) -> Option<usize> {
        self.get_and(|_| {})
    }

    /// Like [`Self::get`], but runs `mark` on the detached index before
    /// the internal lock is released. Lets the caller account for the
    /// dequeue atomically with it, so an observer seeing the list empty
    /// also sees the mark.
    pub fn get_and(&self, mark: impl FnOnce(usize)) -> Option<usize> {
        let mut links = self.inner.lock();
        while links.is_empty(self.size) {
            if links.closed {
                return None;
            }
            self.cv.wait(&mut links);
        }
        let head = links.next[self.size];
        links.detach(head);
        mark(head);
        Some(head)
    }

    /// Reinsert `idx` at the head. The index must not be present; this is
    /// the writeback daemon's "not quiesced yet" path, which must preserve
    /// the queue order rather than cycling the entry to the tail.
    pub fn unget(&self, idx: usize) {
        assert!(idx < self.size, "slot index {idx} out of range");
        let mut links = self.inner.lock();
        assert!(!links.contains(idx), "unget of a linked slot {idx}");
        links.link_head(idx, self.size);
        drop(links);
        self.cv.notify_one();
    }

    /// Detach `idx` if present. Returns whether it was.
    pub fn pop(&self, idx: usize) -> bool {
        assert!(idx < self.size, "slot index {idx} out of range");
        let mut links = self.inner.lock();
        if links.contains(idx) {
            links.detach(idx);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, idx: usize) -> bool {
        assert!(idx < self.size, "slot index {idx} out of range");
        self.inner.lock().contains(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty(self.size)
    }

    /// Wake blocked getters; subsequent `get` on an empty list returns
    /// `None` instead of waiting.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cv.notify_all();
    }
}
