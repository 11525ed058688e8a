//! Indexed min-heap timeout scheduler.
//!
//! A vector-backed binary heap ordered by expiry, with a parallel id→index
//! map so any node can be rescheduled or removed in O(log n), not just the
//! root. The map mirrors the heap exactly at all times; every swap updates
//! both sides.
//!
//! `next_tick_ms` doubles as the reactor's poll timeout, letting one thread
//! serve both readiness polling and timeout enforcement.

use std::collections::HashMap;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: u64,
    expires: Instant,
    cb: Callback,
}

pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<u64, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Schedule `cb` to fire after `timeout`, or reschedule if `id` is
    /// already present (replacing both expiry and callback).
    pub fn add(&mut self, id: u64, timeout: Duration, cb: Callback) {
        let expires = Instant::now() + timeout;
        match self.index.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode { id, expires, cb });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = cb;
                // No downward move means the node may still be smaller than
                // its parent.
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Push an existing node's expiry out to `now + timeout`.
    ///
    /// # Panics
    /// Panics on an unknown id: the caller's table and this heap have
    /// desynchronized, which is unrecoverable.
    pub fn adjust(&mut self, id: u64, timeout: Duration) {
        let i = *self
            .index
            .get(&id)
            .unwrap_or_else(|| panic!("adjust on unknown timer id {id}"));
        self.heap[i].expires = Instant::now() + timeout;
        if !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
    }

    /// Remove a node without firing its callback. Returns whether the id
    /// was present.
    pub fn cancel(&mut self, id: u64) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                self.remove_at(i);
                true
            }
            None => false,
        }
    }

    /// Fire and remove every node whose expiry is at or before `now`, in
    /// non-decreasing expiry order.
    pub fn tick(&mut self, now: Instant) {
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.remove_at(0);
            (node.cb)();
        }
    }

    /// Milliseconds until the next expiry after evicting everything already
    /// due; `-1` when no timers remain. Suitable as an epoll timeout.
    pub fn next_tick_ms(&mut self) -> i32 {
        let now = Instant::now();
        self.tick(now);
        match self.heap.first() {
            None => -1,
            Some(root) => {
                let ms = root.expires.saturating_duration_since(now).as_millis();
                ms.min(i32::MAX as u128) as i32
            }
        }
    }

    /// Swap the target to the tail, shrink, and re-heapify from the vacated
    /// position (sift down, falling back to sift up).
    fn remove_at(&mut self, i: usize) -> TimerNode {
        debug_assert!(i < self.heap.len());
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_nodes(i, last);
        }
        let node = self.heap.pop().unwrap();
        self.index.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node moved down.
    fn sift_down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        loop {
            let mut child = i * 2 + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(self.heap.len(), self.index.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.index[&node.id], i);
            let child = i * 2 + 1;
            if child < self.heap.len() {
                assert!(node.expires <= self.heap[child].expires);
            }
            if child + 1 < self.heap.len() {
                assert!(node.expires <= self.heap[child + 1].expires);
            }
        }
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn noop() -> Callback {
        Box::new(|| {})
    }

    #[test]
    fn test_add_and_evict_in_expiry_order() {
        let mut timers = TimerHeap::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (id, ms) in [(1u64, 30u64), (2, 10), (3, 20), (4, 5)] {
            let fired = Arc::clone(&fired);
            timers.add(
                id,
                Duration::from_millis(ms),
                Box::new(move || fired.lock().unwrap().push(id)),
            );
            timers.check_invariants();
        }

        timers.tick(Instant::now() + Duration::from_millis(100));
        assert_eq!(*fired.lock().unwrap(), vec![4, 2, 3, 1]);
        assert!(timers.is_empty());
        timers.check_invariants();
    }

    #[test]
    fn test_tick_stops_at_first_unexpired() {
        let mut timers = TimerHeap::new();
        let count = Arc::new(AtomicUsize::new(0));

        for (id, ms) in [(1u64, 1u64), (2, 2), (3, 60_000)] {
            let count = Arc::clone(&count);
            timers.add(
                id,
                Duration::from_millis(ms),
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        timers.tick(Instant::now() + Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(timers.len(), 1);
        assert!(timers.contains(3));
    }

    #[test]
    fn test_add_known_id_reschedules_and_replaces_callback() {
        let mut timers = TimerHeap::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        {
            let fired = Arc::clone(&fired);
            timers.add(
                7,
                Duration::from_millis(5),
                Box::new(move || fired.lock().unwrap().push("old")),
            );
        }
        {
            let fired = Arc::clone(&fired);
            timers.add(
                7,
                Duration::from_millis(10),
                Box::new(move || fired.lock().unwrap().push("new")),
            );
        }
        assert_eq!(timers.len(), 1);

        timers.tick(Instant::now() + Duration::from_millis(100));
        assert_eq!(*fired.lock().unwrap(), vec!["new"]);
    }

    #[test]
    fn test_adjust_pushes_deadline_out() {
        let mut timers = TimerHeap::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            timers.add(
                1,
                Duration::from_millis(5),
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        timers.adjust(1, Duration::from_secs(60));
        timers.tick(Instant::now() + Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    #[should_panic(expected = "adjust on unknown timer id")]
    fn test_adjust_unknown_id_panics() {
        let mut timers = TimerHeap::new();
        timers.adjust(42, Duration::from_millis(1));
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerHeap::new();
        let count = Arc::new(AtomicUsize::new(0));
        for id in 0..10u64 {
            let count = Arc::clone(&count);
            timers.add(
                id,
                Duration::from_millis(id + 1),
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        assert!(timers.cancel(4));
        assert!(!timers.cancel(4));
        assert!(!timers.cancel(99));
        timers.check_invariants();

        timers.tick(Instant::now() + Duration::from_secs(1));
        assert_eq!(count.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_interleaved_operations_keep_heap_ordered() {
        let mut timers = TimerHeap::new();

        // Deterministic pseudo-random interleaving of add/adjust/cancel.
        let mut seed: u64 = 0x2545f4914f6cdd1d;
        for step in 0..500u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let id = seed % 40;
            let ms = seed % 1000 + 1;
            match step % 3 {
                0 => timers.add(id, Duration::from_millis(ms), noop()),
                1 => {
                    if timers.contains(id) {
                        timers.adjust(id, Duration::from_millis(ms));
                    }
                }
                _ => {
                    timers.cancel(id);
                }
            }
            timers.check_invariants();
        }
    }

    #[test]
    fn test_next_tick_ms() {
        let mut timers = TimerHeap::new();
        assert_eq!(timers.next_tick_ms(), -1);

        timers.add(1, Duration::from_millis(500), noop());
        let ms = timers.next_tick_ms();
        assert!(ms > 0 && ms <= 500);

        // Already expired deadlines are evicted before the result.
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            timers.add(
                2,
                Duration::from_millis(0),
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        std::thread::sleep(Duration::from_millis(1));
        let ms = timers.next_tick_ms();
        assert!(ms >= 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.contains(2));
    }
}
