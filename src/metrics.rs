//! Process-wide counters, gauges and a classifier latency digest.
//!
//! Counters are keyed `(component, kind)` to match the error taxonomy; the
//! supervisor renders the whole registry as a health block on demand and at
//! shutdown. Handles are cheap atomics, safe to bump from the capture path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One named monotonically increasing counter.
pub type Counter = Arc<AtomicU64>;

/// One named gauge (queue depths, worker counts).
pub type Gauge = Arc<AtomicI64>;

/// Shared metric registry. Clone freely; all clones share storage.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    counters: Mutex<BTreeMap<(&'static str, &'static str), Counter>>,
    gauges: Mutex<BTreeMap<(&'static str, &'static str), Gauge>>,
    latency: Mutex<LatencyDigest>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Fetch (creating on first use) the counter for `(component, kind)`.
    /// Callers on hot paths should cache the returned handle.
    pub fn counter(&self, component: &'static str, kind: &'static str) -> Counter {
        let mut map = self.inner.counters.lock().unwrap();
        Arc::clone(map.entry((component, kind)).or_default())
    }

    pub fn gauge(&self, component: &'static str, kind: &'static str) -> Gauge {
        let mut map = self.inner.gauges.lock().unwrap();
        Arc::clone(map.entry((component, kind)).or_default())
    }

    /// Bump a counter without holding onto the handle.
    pub fn incr(&self, component: &'static str, kind: &'static str) {
        self.counter(component, kind).fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter_value(&self, component: &'static str, kind: &'static str) -> u64 {
        self.counter(component, kind).load(Ordering::Relaxed)
    }

    /// Record one classifier invocation's latency.
    pub fn observe_latency(&self, elapsed: Duration) {
        self.inner.latency.lock().unwrap().observe(elapsed);
    }

    pub fn latency_snapshot(&self) -> LatencySnapshot {
        self.inner.latency.lock().unwrap().snapshot()
    }

    /// Render every non-zero counter and gauge plus the latency digest as a
    /// multi-line text block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for ((component, kind), c) in self.inner.counters.lock().unwrap().iter() {
            let v = c.load(Ordering::Relaxed);
            if v > 0 {
                out.push_str(&format!("{component}/{kind}: {v}\n"));
            }
        }
        for ((component, kind), g) in self.inner.gauges.lock().unwrap().iter() {
            out.push_str(&format!("{component}/{kind}: {}\n", g.load(Ordering::Relaxed)));
        }
        let lat = self.latency_snapshot();
        if lat.count > 0 {
            out.push_str(&format!(
                "classifier/latency: n={} median={:.1}ms p99={:.1}ms\n",
                lat.count,
                lat.median.as_secs_f64() * 1000.0,
                lat.p99.as_secs_f64() * 1000.0,
            ));
        }
        out
    }
}

/// Sliding reservoir of recent classifier latencies.
///
/// A plain bounded ring of samples is enough here: windows arrive a few per
/// second, and the health endpoint only needs median and p99 over the recent
/// past, not an exact all-time histogram.
struct LatencyDigest {
    samples: Vec<Duration>,
    next: usize,
    count: u64,
}

const LATENCY_RESERVOIR: usize = 512;

impl Default for LatencyDigest {
    fn default() -> Self {
        LatencyDigest { samples: Vec::with_capacity(LATENCY_RESERVOIR), next: 0, count: 0 }
    }
}

impl LatencyDigest {
    fn observe(&mut self, elapsed: Duration) {
        self.count += 1;
        if self.samples.len() < LATENCY_RESERVOIR {
            self.samples.push(elapsed);
        } else {
            self.samples[self.next] = elapsed;
            self.next = (self.next + 1) % LATENCY_RESERVOIR;
        }
    }

    fn snapshot(&self) -> LatencySnapshot {
        if self.samples.is_empty() {
            return LatencySnapshot::default();
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let pick = |q: f64| sorted[((sorted.len() - 1) as f64 * q).round() as usize];
        LatencySnapshot { count: self.count, median: pick(0.5), p99: pick(0.99) }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySnapshot {
    /// Total observations since startup (not just those still in the reservoir).
    pub count: u64,
    pub median: Duration,
    pub p99: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_per_key() {
        let m = Metrics::new();
        let a = m.counter("dispatcher", "window-dropped");
        let b = m.counter("dispatcher", "window-dropped");
        a.fetch_add(2, Ordering::Relaxed);
        b.fetch_add(1, Ordering::Relaxed);
        assert_eq!(m.counter_value("dispatcher", "window-dropped"), 3);
        assert_eq!(m.counter_value("dispatcher", "other"), 0);
    }

    #[test]
    fn latency_percentiles_are_ordered() {
        let m = Metrics::new();
        for ms in 1..=100 {
            m.observe_latency(Duration::from_millis(ms));
        }
        let snap = m.latency_snapshot();
        assert_eq!(snap.count, 100);
        assert!(snap.median <= snap.p99);
        assert!(snap.p99 >= Duration::from_millis(99));
    }

    #[test]
    fn render_skips_zero_counters() {
        let m = Metrics::new();
        m.counter("filter", "dedup-dropped"); // touched but zero
        m.incr("filter", "privacy-suppressed");
        let text = m.render();
        assert!(text.contains("filter/privacy-suppressed: 1"));
        assert!(!text.contains("dedup-dropped"));
    }
}
