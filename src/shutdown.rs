//! Cancellation token shared by every pipeline task.
//!
//! One token is created by the supervisor and cloned into each thread. Tasks
//! either poll `is_triggered()` between atomic steps or park in
//! `wait_timeout()` for interruptible sleeps (backoff, retention schedule).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Broadcast cancellation. Idempotent; wakes every waiter.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap();
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout`, returning early if cancellation fires.
    /// Returns true when cancellation has been triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap();
        while !self.inner.triggered.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _timed_out) = self.inner.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
        true
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_false_on_timeout() {
        let s = Shutdown::new();
        assert!(!s.wait_timeout(Duration::from_millis(10)));
        assert!(!s.is_triggered());
    }

    #[test]
    fn trigger_wakes_waiter() {
        let s = Shutdown::new();
        let s2 = s.clone();
        let handle = thread::spawn(move || s2.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        s.trigger();
        assert!(handle.join().unwrap());
        assert!(s.is_triggered());
    }
}
