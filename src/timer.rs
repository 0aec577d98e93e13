// src/timer.rs
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: Option<TimerCallback>,
}

/// Indexed min-heap of per-fd expirations.
///
/// The sibling map `index` gives O(log n) adjust and cancel by connection
/// id. Invariant: `heap[index[id]].id == id` for every mapped id. All
/// mutations happen on the reactor thread; workers never touch the heap.
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<RawFd, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Arm (or re-arm) the timer for `id`. An existing node gets its
    /// deadline and callback overwritten in place and is re-heapified.
    pub fn add<F: FnOnce() + Send + 'static>(&mut self, id: RawFd, timeout: Duration, cb: F) {
        let expires = Instant::now() + timeout;
        match self.index.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    cb: Some(Box::new(cb)),
                });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = Some(Box::new(cb));
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Extend the deadline for `id`. Callers only ever push deadlines
    /// later, so sinking suffices. Unknown ids are ignored.
    pub fn adjust(&mut self, id: RawFd, timeout: Duration) {
        if let Some(i) = self.index.get(&id).copied() {
            self.heap[i].expires = Instant::now() + timeout;
            self.sift_down(i, self.heap.len());
        }
    }

    /// Fire the callback for `id` now and drop the node.
    pub fn do_work(&mut self, id: RawFd) {
        if let Some(i) = self.index.get(&id).copied() {
            let cb = self.heap[i].cb.take();
            self.delete(i);
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    /// Pop and fire every node whose deadline has passed.
    pub fn tick(&mut self) {
        while !self.heap.is_empty() {
            if self.heap[0].expires > Instant::now() {
                break;
            }
            let cb = self.heap[0].cb.take();
            self.delete(0);
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    /// Advance expirations, then return the wait budget in milliseconds
    /// until the next deadline, or -1 when no timer is armed.
    pub fn next_tick(&mut self) -> i32 {
        self.tick();
        match self.heap.first() {
            None => -1,
            Some(node) => {
                let now = Instant::now();
                if node.expires <= now {
                    0
                } else {
                    (node.expires - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn delete(&mut self, i: usize) {
        debug_assert!(i < self.heap.len());
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_nodes(i, last);
            let gone = self.heap.pop().unwrap();
            self.index.remove(&gone.id);
            if !self.sift_down(i, self.heap.len()) {
                self.sift_up(i);
            }
        } else {
            let gone = self.heap.pop().unwrap();
            self.index.remove(&gone.id);
        }
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
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

    /// Returns true when the node actually sank.
    fn sift_down(&mut self, i: usize, n: usize) -> bool {
        let mut parent = i;
        let mut child = parent * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[parent].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(parent, child);
            parent = child;
            child = parent * 2 + 1;
        }
        parent > i
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for i in 0..self.heap.len() {
            let l = 2 * i + 1;
            let r = 2 * i + 2;
            if l < self.heap.len() {
                assert!(self.heap[i].expires <= self.heap[l].expires);
            }
            if r < self.heap.len() {
                assert!(self.heap[i].expires <= self.heap[r].expires);
            }
        }
        assert_eq!(self.index.len(), self.heap.len());
        for (&id, &i) in &self.index {
            assert_eq!(self.heap[i].id, id);
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
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn next_tick_sentinel_when_empty() {
        let mut heap = TimerHeap::new();
        assert_eq!(heap.next_tick(), -1);
    }

    #[test]
    fn next_tick_budget_bounded_by_deadline() {
        let mut heap = TimerHeap::new();
        heap.add(3, Duration::from_millis(50), || {});
        let budget = heap.next_tick();
        assert!((0..=50).contains(&budget));
    }

    #[test]
    fn tick_fires_expired_in_deadline_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut heap = TimerHeap::new();
        for (id, ms) in [(1, 2u64), (2, 0), (3, 1)] {
            let order = order.clone();
            heap.add(id, Duration::from_millis(ms), move || {
                order.lock().unwrap().push(id);
            });
        }
        heap.assert_consistent();
        std::thread::sleep(Duration::from_millis(10));
        heap.tick();
        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
        assert!(heap.is_empty());
    }

    #[test]
    fn adjust_extends_deadline() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut heap = TimerHeap::new();
        let f = fired.clone();
        heap.add(7, Duration::from_millis(1), move || {
            f.store(true, Ordering::SeqCst)
        });
        heap.adjust(7, Duration::from_millis(500));
        std::thread::sleep(Duration::from_millis(10));
        heap.tick();
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(heap.len(), 1);
        heap.assert_consistent();
    }

    #[test]
    fn do_work_fires_once_and_removes() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut heap = TimerHeap::new();
        let c = count.clone();
        heap.add(9, Duration::from_secs(60), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        heap.do_work(9);
        heap.do_work(9);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(heap.is_empty());
    }

    #[test]
    fn re_add_overwrites_in_place() {
        let mut heap = TimerHeap::new();
        for id in 0..16 {
            heap.add(id, Duration::from_millis(100 + id as u64), || {});
        }
        heap.add(5, Duration::from_secs(5), || {});
        heap.add(12, Duration::from_millis(1), || {});
        heap.assert_consistent();
        assert_eq!(heap.len(), 16);
    }
}
