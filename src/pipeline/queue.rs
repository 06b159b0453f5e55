//! Bounded queues with drop-oldest backpressure.
//!
//! Producers in this pipeline are never allowed to block on a slow consumer:
//! when a queue is full the oldest entry is discarded and a metric records
//! it. `WindowQueue` additionally keys its bound per source and hands out
//! work round-robin so one noisy source cannot starve the others.

use crate::audio::SourceId;
use crate::pipeline::AnalysisWindow;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// The classifier input queue: per-source bounds, per-source FIFO order,
/// round-robin service across sources.
pub struct WindowQueue {
    inner: Mutex<WindowQueueInner>,
    cond: Condvar,
    per_source_cap: usize,
}

struct WindowQueueInner {
    queues: HashMap<SourceId, VecDeque<AnalysisWindow>>,
    /// Round-robin order; sources are appended on first sight.
    order: Vec<SourceId>,
    next: usize,
    depth: usize,
    closed: bool,
}

impl WindowQueue {
    pub fn new(per_source_cap: usize) -> Self {
        WindowQueue {
            inner: Mutex::new(WindowQueueInner {
                queues: HashMap::new(),
                order: Vec::new(),
                next: 0,
                depth: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            per_source_cap: per_source_cap.max(1),
        }
    }

    /// Enqueue a window. When the source's queue is full the oldest queued
    /// window for that source is dropped; the newest is always preferred.
    /// Returns true when a window was dropped to make room.
    pub fn push(&self, window: AnalysisWindow) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        if !inner.queues.contains_key(&window.source) {
            inner.order.push(window.source.clone());
            inner.queues.insert(window.source.clone(), VecDeque::new());
        }
        let cap = self.per_source_cap;
        let queue = inner.queues.get_mut(&window.source).unwrap();
        let mut dropped = false;
        if queue.len() >= cap {
            queue.pop_front();
            dropped = true;
        }
        queue.push_back(window);
        if !dropped {
            inner.depth += 1;
        }
        drop(inner);
        self.cond.notify_one();
        dropped
    }

    /// Dequeue the next window, serving sources round-robin. Blocks until a
    /// window arrives or the queue is closed; None means closed.
    pub fn pop(&self) -> Option<AnalysisWindow> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.depth > 0 {
                let len = inner.order.len();
                for step in 0..len {
                    let idx = (inner.next + step) % len;
                    let source = inner.order[idx].clone();
                    if let Some(queue) = inner.queues.get_mut(&source) {
                        if let Some(window) = queue.pop_front() {
                            inner.next = (idx + 1) % len;
                            inner.depth -= 1;
                            return Some(window);
                        }
                    }
                }
            }
            if inner.closed {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Drop every queued window for a removed source.
    pub fn purge_source(&self, source: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.queues.remove(source) {
            inner.depth -= queue.len();
        }
        inner.order.retain(|s| s != source);
        if !inner.order.is_empty() {
            inner.next %= inner.order.len();
        } else {
            inner.next = 0;
        }
    }

    /// Close and discard the remainder; blocked consumers wake with None.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.queues.clear();
        inner.depth = 0;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().depth
    }
}

/// A plain bounded FIFO with drop-oldest push, used by the sink fan-out.
pub struct BoundedQueue<T> {
    inner: Mutex<BoundedInner<T>>,
    cond: Condvar,
    cap: usize,
}

struct BoundedInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(cap: usize) -> Self {
        BoundedQueue {
            inner: Mutex::new(BoundedInner { items: VecDeque::new(), closed: false }),
            cond: Condvar::new(),
            cap: cap.max(1),
        }
    }

    /// Push, discarding the oldest entry when full. Returns true on drop.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        let mut dropped = false;
        if inner.items.len() >= self.cap {
            inner.items.pop_front();
            dropped = true;
        }
        inner.items.push_back(item);
        drop(inner);
        self.cond.notify_one();
        dropped
    }

    /// Blocking pop with timeout. None on timeout; closed queues drain their
    /// remaining items before `is_closed` ends the consumer loop.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let (guard, result) = self.cond.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() {
                return inner.items.pop_front();
            }
        }
    }

    /// Close the queue; queued items remain poppable.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed_and_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.closed && inner.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn window(source: &str, index: u64) -> AnalysisWindow {
        AnalysisWindow {
            source: source.to_string(),
            start_wall: Utc::now(),
            start_mono: Duration::from_secs(index),
            index,
            pcm: Vec::new(),
        }
    }

    #[test]
    fn window_queue_drops_oldest_of_same_source() {
        let q = WindowQueue::new(2);
        assert!(!q.push(window("a", 0)));
        assert!(!q.push(window("a", 1)));
        assert!(q.push(window("a", 2))); // 0 dropped
        let first = q.pop().unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(q.pop().unwrap().index, 2);
    }

    #[test]
    fn window_queue_preserves_per_source_order_and_round_robins() {
        let q = WindowQueue::new(8);
        q.push(window("a", 0));
        q.push(window("a", 1));
        q.push(window("b", 0));
        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        for _ in 0..3 {
            let w = q.pop().unwrap();
            if w.source == "a" {
                seen_a.push(w.index);
            } else {
                seen_b.push(w.index);
            }
        }
        assert_eq!(seen_a, vec![0, 1]);
        assert_eq!(seen_b, vec![0]);
    }

    #[test]
    fn window_queue_full_bound_is_per_source() {
        let q = WindowQueue::new(1);
        q.push(window("a", 0));
        assert!(!q.push(window("b", 0)), "different source must not evict");
        assert_eq!(q.depth(), 2);
    }

    #[test]
    fn closed_window_queue_drops_remainder() {
        let q = WindowQueue::new(4);
        q.push(window("a", 0));
        q.close();
        assert!(q.pop().is_none());
        assert!(!q.push(window("a", 1)));
    }

    #[test]
    fn purge_removes_only_that_source() {
        let q = WindowQueue::new(4);
        q.push(window("a", 0));
        q.push(window("b", 7));
        q.purge_source("a");
        assert_eq!(q.depth(), 1);
        assert_eq!(q.pop().unwrap().source, "b");
    }

    #[test]
    fn bounded_queue_drop_oldest_and_drain_after_close() {
        let q = BoundedQueue::new(2);
        q.push(1);
        q.push(2);
        assert!(q.push(3));
        q.close();
        assert_eq!(q.pop_timeout(Duration::ZERO), Some(2));
        assert_eq!(q.pop_timeout(Duration::ZERO), Some(3));
        assert_eq!(q.pop_timeout(Duration::ZERO), None);
        assert!(q.is_closed_and_empty());
    }
}
