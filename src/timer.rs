// src/timer.rs
//
// Indexed min-heap of per-connection idle deadlines. The heap array is
// ordered by expiry; a side map from id to heap index makes reschedule and
// cancel of an arbitrary id O(log n). All mutation happens on the reactor
// thread.
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: u64,
    expires: Instant,
    callback: TimerCallback,
}

pub struct TimerHeap {
    heap: Vec<TimerNode>,
    // id -> heap index; always mirrors `heap` exactly.
    index: HashMap<u64, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
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

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires > self.heap[i].expires {
                self.swap_nodes(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    /// Sink the node at `i` within the first `n` entries. Returns whether
    /// it moved, so callers know to try the other direction.
    fn sift_down(&mut self, i: usize, n: usize) -> bool {
        let mut index = i;
        let mut child = 2 * index + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[child].expires < self.heap[index].expires {
                self.swap_nodes(child, index);
                index = child;
                child = 2 * index + 1;
            } else {
                break;
            }
        }
        index > i
    }

    /// Remove the node at heap position `i` by swapping it with the last
    /// entry, shrinking, and re-heapifying the swapped-in node in whichever
    /// direction it needs to move.
    fn remove_at(&mut self, i: usize) -> TimerNode {
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

    /// Schedule `id` to fire after `timeout_ms`. If the id is already
    /// scheduled, its expiry and callback are replaced and the node is
    /// re-heapified; the new expiry may be later or sooner.
    pub fn add(&mut self, id: u64, timeout_ms: u64, callback: TimerCallback) {
        let expires = Instant::now() + Duration::from_millis(timeout_ms);
        if let Some(&i) = self.index.get(&id) {
            self.heap[i].expires = expires;
            self.heap[i].callback = callback;
            if !self.sift_down(i, self.heap.len()) {
                self.sift_up(i);
            }
        } else {
            let i = self.heap.len();
            self.index.insert(id, i);
            self.heap.push(TimerNode { id, expires, callback });
            self.sift_up(i);
        }
    }

    /// Reschedule `id` without touching its callback. Used to extend a
    /// connection's deadline on activity. Unknown ids are ignored.
    pub fn adjust(&mut self, id: u64, timeout_ms: u64) {
        if let Some(&i) = self.index.get(&id) {
            self.heap[i].expires = Instant::now() + Duration::from_millis(timeout_ms);
            if !self.sift_down(i, self.heap.len()) {
                self.sift_up(i);
            }
        }
    }

    /// Drop `id` without firing it. Unknown ids are ignored.
    pub fn cancel(&mut self, id: u64) {
        if let Some(&i) = self.index.get(&id) {
            self.remove_at(i);
        }
    }

    /// Fire every node whose expiry is at or before `now`, earliest first.
    pub fn tick(&mut self, now: Instant) {
        while let Some(front) = self.heap.first() {
            if front.expires > now {
                break;
            }
            let node = self.remove_at(0);
            (node.callback)();
        }
    }

    /// Tick, then report the delay until the earliest remaining expiry in
    /// milliseconds. Zero when overdue, `None` when no timers remain. The
    /// reactor feeds this straight into its readiness wait.
    pub fn next_tick(&mut self) -> Option<u64> {
        let now = Instant::now();
        self.tick(now);
        self.heap
            .first()
            .map(|node| node.expires.saturating_duration_since(now).as_millis() as u64)
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}
