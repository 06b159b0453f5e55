//! Per-source clip ring store.
//!
//! A fixed ring of the most recent N seconds of canonical PCM. The owning
//! capture worker is the only writer and never blocks; clip extraction runs
//! on other threads against an atomic snapshot of the write cursor. Samples
//! are stored as f32 bit patterns in relaxed atomics so concurrent reads of
//! slots being overwritten are defined; the cursor re-check after copying
//! detects any overlap and reports the range as expired.

use crate::audio::{duration_to_samples, samples_to_duration, SourceId, SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub struct ClipRing {
    source: SourceId,
    /// Wall-clock time of absolute sample 0 (the stream's reference clock).
    epoch: DateTime<Utc>,
    buf: Box<[AtomicU32]>,
    /// Absolute count of samples written since the stream started. Doubles as
    /// the generation counter: a range is gone once the cursor has advanced
    /// more than `capacity` past its start.
    cursor: AtomicU64,
}

impl ClipRing {
    /// `seconds` of retention at the canonical rate.
    pub fn new(source: &str, seconds: u64, epoch: DateTime<Utc>) -> Self {
        let capacity = seconds as usize * SAMPLE_RATE as usize;
        let buf = (0..capacity).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice();
        ClipRing { source: source.to_string(), epoch, buf, cursor: AtomicU64::new(0) }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn capacity_samples(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Absolute samples written so far.
    pub fn written(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Append one frame. Single producer only.
    pub fn push(&self, samples: &[f32]) {
        let cap = self.buf.len() as u64;
        let start = self.cursor.load(Ordering::Relaxed);
        for (i, &s) in samples.iter().enumerate() {
            let idx = ((start + i as u64) % cap) as usize;
            self.buf[idx].store(s.to_bits(), Ordering::Relaxed);
        }
        self.cursor.store(start + samples.len() as u64, Ordering::Release);
    }

    /// Copy out the PCM for `[start, end)` in wall-clock terms.
    ///
    /// Blocks (up to `wait`) until the writer has produced the end of the
    /// range; a clip's post-roll usually lies slightly in the future when
    /// extraction starts. Fails with `ClipExpired` when any part of the range
    /// has been overwritten, including overwrites that race the copy itself.
    /// A range starting before the stream epoch is clamped to the epoch.
    pub fn extract(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        wait: Duration,
        shutdown: &Shutdown,
    ) -> Result<Vec<f32>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let start_sample = self.wall_to_sample(start);
        let end_sample = self.wall_to_sample(end).max(start_sample);

        // Wait for the writer to reach the end of the range.
        let deadline = Instant::now() + wait;
        let mut cursor = self.written();
        while cursor < end_sample {
            if Instant::now() >= deadline || shutdown.wait_timeout(Duration::from_millis(20)) {
                break;
            }
            cursor = self.written();
        }
        let cursor = self.written();
        let end_sample = end_sample.min(cursor).max(start_sample);

        let cap = self.buf.len() as u64;
        if start_sample + cap < cursor {
            return Err(Error::ClipExpired { source: self.source.clone() });
        }

        let mut out = Vec::with_capacity((end_sample - start_sample) as usize);
        for abs in start_sample..end_sample {
            let bits = self.buf[(abs % cap) as usize].load(Ordering::Relaxed);
            out.push(f32::from_bits(bits));
        }

        // The writer may have lapped us mid-copy; the cursor tells.
        let after = self.written();
        if start_sample + cap < after {
            return Err(Error::ClipExpired { source: self.source.clone() });
        }
        Ok(out)
    }

    /// Monotonic timestamps of the extractable horizon, for diagnostics.
    pub fn horizon(&self) -> (Duration, Duration) {
        let cursor = self.written();
        let oldest = cursor.saturating_sub(self.buf.len() as u64);
        (samples_to_duration(oldest), samples_to_duration(cursor))
    }

    fn wall_to_sample(&self, t: DateTime<Utc>) -> u64 {
        match (t - self.epoch).to_std() {
            Ok(d) => duration_to_samples(d),
            Err(_) => 0, // before stream start
        }
    }
}

/// Shared map of live rings, one per running capture worker. The detection
/// router looks rings up here at clip-materialization time; a source whose
/// worker restarted gets a fresh ring under the same id.
#[derive(Clone, Default)]
pub struct RingRegistry {
    inner: Arc<Mutex<HashMap<SourceId, Arc<ClipRing>>>>,
}

impl RingRegistry {
    pub fn new() -> Self {
        RingRegistry::default()
    }

    pub fn register(&self, ring: Arc<ClipRing>) {
        self.inner.lock().unwrap().insert(ring.source().to_string(), ring);
    }

    pub fn unregister(&self, source: &str) {
        self.inner.lock().unwrap().remove(source);
    }

    pub fn get(&self, source: &str) -> Option<Arc<ClipRing>> {
        self.inner.lock().unwrap().get(source).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_SAMPLES;

    fn ring_with_seconds(secs: u64) -> ClipRing {
        ClipRing::new("test", secs, Utc::now())
    }

    fn push_seconds(ring: &ClipRing, secs: u64, value_of: impl Fn(u64) -> f32) {
        let frames = secs as usize * SAMPLE_RATE as usize / FRAME_SAMPLES;
        let mut abs = ring.written();
        for _ in 0..frames {
            let frame: Vec<f32> = (0..FRAME_SAMPLES as u64).map(|i| value_of(abs + i)).collect();
            ring.push(&frame);
            abs += FRAME_SAMPLES as u64;
        }
    }

    #[test]
    fn extract_returns_exact_range() {
        let ring = ring_with_seconds(10);
        let epoch = ring.epoch;
        push_seconds(&ring, 5, |abs| abs as f32);
        let start = epoch + chrono::Duration::seconds(1);
        let end = epoch + chrono::Duration::seconds(3);
        let pcm = ring.extract(start, end, Duration::ZERO, &Shutdown::new()).unwrap();
        assert_eq!(pcm.len(), 2 * SAMPLE_RATE as usize);
        // Samples are the absolute indices we wrote: strictly increasing.
        assert_eq!(pcm[0], SAMPLE_RATE as f32);
        assert!(pcm.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn extract_overwritten_range_expires() {
        let ring = ring_with_seconds(2);
        let epoch = ring.epoch;
        push_seconds(&ring, 6, |_| 0.0);
        let start = epoch + chrono::Duration::seconds(1);
        let end = epoch + chrono::Duration::seconds(2);
        let err = ring.extract(start, end, Duration::ZERO, &Shutdown::new()).unwrap_err();
        assert!(matches!(err, Error::ClipExpired { .. }));
    }

    #[test]
    fn extract_clamps_range_before_epoch() {
        let ring = ring_with_seconds(10);
        let epoch = ring.epoch;
        push_seconds(&ring, 2, |_| 0.25);
        let start = epoch - chrono::Duration::seconds(5);
        let end = epoch + chrono::Duration::seconds(1);
        let pcm = ring.extract(start, end, Duration::ZERO, &Shutdown::new()).unwrap();
        assert_eq!(pcm.len(), SAMPLE_RATE as usize);
    }

    #[test]
    fn extract_truncates_at_writer_position_after_wait() {
        let ring = ring_with_seconds(10);
        let epoch = ring.epoch;
        push_seconds(&ring, 2, |_| 0.5);
        // End is a second past what the writer has produced; zero wait means
        // we get exactly the produced prefix.
        let start = epoch + chrono::Duration::seconds(1);
        let end = epoch + chrono::Duration::seconds(3);
        let pcm = ring.extract(start, end, Duration::ZERO, &Shutdown::new()).unwrap();
        assert_eq!(pcm.len(), SAMPLE_RATE as usize);
    }

    #[test]
    fn registry_replaces_ring_per_source() {
        let reg = RingRegistry::new();
        let a = Arc::new(ClipRing::new("yard", 10, Utc::now()));
        let b = Arc::new(ClipRing::new("yard", 10, Utc::now()));
        reg.register(Arc::clone(&a));
        reg.register(Arc::clone(&b));
        assert!(Arc::ptr_eq(&reg.get("yard").unwrap(), &b));
        reg.unregister("yard");
        assert!(reg.get("yard").is_none());
    }
}
