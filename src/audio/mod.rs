//! Canonical audio format and the frame type every capture variant emits.
//!
//! The pipeline runs on mono f32 at a fixed rate; capture workers convert
//! whatever their device or stream produces into this format before anything
//! downstream sees it.

pub mod decode;
pub mod device;
pub mod resampler;
pub mod ring;
pub mod stream;

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Canonical pipeline sample rate.
pub const SAMPLE_RATE: u32 = 48_000;
/// Analysis window length in seconds.
pub const WINDOW_SECS: u32 = 3;
/// Samples per analysis window.
pub const WINDOW_SAMPLES: usize = (SAMPLE_RATE * WINDOW_SECS) as usize;
/// Capture frame length: 50 ms, an exact divisor of the window.
pub const FRAME_SAMPLES: usize = SAMPLE_RATE as usize / 20;
/// Duration of one capture frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(50);

/// Stable identifier of a configured source.
pub type SourceId = String;

/// One fixed-size chunk of canonical mono PCM from a single source.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub source: SourceId,
    /// Monotonic offset from the owning stream's start.
    pub mono: Duration,
    /// Wall-clock time of the first sample, derived from the stream's
    /// reference wall clock plus `mono` so clock jumps never perturb it.
    pub wall: DateTime<Utc>,
    /// Exactly FRAME_SAMPLES mono samples.
    pub samples: Vec<f32>,
}

/// Derives per-frame timestamps for one capture stream.
///
/// The wall clock is read once at stream start; after that every frame's wall
/// time is `start_wall + sample_position / rate`, keeping intervals exact and
/// immune to NTP steps.
#[derive(Debug, Clone)]
pub struct FrameClock {
    start_wall: DateTime<Utc>,
    start_mono: Instant,
    samples_emitted: u64,
}

impl FrameClock {
    pub fn start() -> Self {
        FrameClock { start_wall: Utc::now(), start_mono: Instant::now(), samples_emitted: 0 }
    }

    /// Wall-clock reference at stream start.
    pub fn start_wall(&self) -> DateTime<Utc> {
        self.start_wall
    }

    /// Monotonic time elapsed since stream start.
    pub fn elapsed(&self) -> Duration {
        self.start_mono.elapsed()
    }

    /// Stamp the next frame of `n` samples and advance the sample position.
    pub fn stamp(&mut self, source: &str, samples: Vec<f32>) -> AudioFrame {
        let mono = samples_to_duration(self.samples_emitted);
        let wall = self.start_wall
            + chrono::Duration::from_std(mono).unwrap_or_else(|_| chrono::Duration::zero());
        self.samples_emitted += samples.len() as u64;
        AudioFrame { source: source.to_string(), mono, wall, samples }
    }
}

/// Sample count to duration at the canonical rate. Split into whole seconds
/// plus remainder so multi-day streams cannot overflow the arithmetic.
pub fn samples_to_duration(samples: u64) -> Duration {
    let rate = SAMPLE_RATE as u64;
    let secs = samples / rate;
    let rem = samples % rate;
    Duration::new(secs, (rem * 1_000_000_000 / rate) as u32)
}

/// Duration to sample count at the canonical rate, rounded to the nearest
/// sample (the sub-sample residue of the nanosecond representation).
pub fn duration_to_samples(d: Duration) -> u64 {
    let rate = SAMPLE_RATE as u64;
    let whole = d.as_secs() * rate;
    let frac = (u64::from(d.subsec_nanos()) * rate + 500_000_000) / 1_000_000_000;
    whole + frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_divides_window() {
        assert_eq!(WINDOW_SAMPLES % FRAME_SAMPLES, 0);
    }

    #[test]
    fn sample_duration_roundtrip() {
        // Includes a multi-day sample count; the conversion must not
        // truncate or overflow on long-running streams.
        for n in [0u64, 1, 2400, 48_000, 144_000, 10 * 48_000, 5 * 86_400 * 48_000 + 12_345] {
            assert_eq!(duration_to_samples(samples_to_duration(n)), n);
        }
    }

    #[test]
    fn clock_stamps_consecutive_frames_contiguously() {
        let mut clock = FrameClock::start();
        let a = clock.stamp("s", vec![0.0; FRAME_SAMPLES]);
        let b = clock.stamp("s", vec![0.0; FRAME_SAMPLES]);
        assert_eq!(a.mono, Duration::ZERO);
        assert_eq!(b.mono, FRAME_DURATION);
        assert_eq!((b.wall - a.wall).num_milliseconds(), 50);
    }
}
