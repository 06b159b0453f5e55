//! Sliding-window dispatcher: frames in, analysis windows out.
//!
//! Keeps a rolling buffer of exactly one window; every time it fills, the
//! contents are emitted and the buffer advances by the stride. The first
//! window waits for a fully primed buffer (no zero padding). A gap in the
//! incoming frame timeline (a dropped frame) re-primes the buffer rather
//! than emitting a window with a seam in it.

use crate::audio::{samples_to_duration, AudioFrame, SourceId, WINDOW_SAMPLES};
use crate::metrics::{Counter, Metrics};
use crate::pipeline::queue::WindowQueue;
use crate::pipeline::AnalysisWindow;
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Samples the window advances between emissions.
pub fn stride_samples(overlap: f32) -> usize {
    (((1.0 - overlap) * WINDOW_SAMPLES as f32).round() as usize).clamp(1, WINDOW_SAMPLES)
}

pub struct WindowDispatcher {
    source: SourceId,
    stride: usize,
    queue: Arc<WindowQueue>,
    buf: Vec<f32>,
    /// Timestamps of the first sample currently in `buf`.
    buf_start_wall: DateTime<Utc>,
    buf_start_mono: Duration,
    /// Monotonic position expected of the next incoming frame; a mismatch
    /// means frames were lost upstream.
    expected_mono: Option<Duration>,
    index: u64,
    dropped: Counter,
}

impl WindowDispatcher {
    pub fn new(source: &str, overlap: f32, queue: Arc<WindowQueue>, metrics: &Metrics) -> Self {
        WindowDispatcher {
            source: source.to_string(),
            stride: stride_samples(overlap),
            queue,
            buf: Vec::with_capacity(WINDOW_SAMPLES * 2),
            buf_start_wall: Utc::now(),
            buf_start_mono: Duration::ZERO,
            expected_mono: None,
            index: 0,
            dropped: metrics.counter("dispatcher", "window-dropped"),
        }
    }

    /// Windows emitted so far, for diagnostics.
    pub fn emitted(&self) -> u64 {
        self.index
    }

    pub fn push_frame(&mut self, frame: AudioFrame) {
        match self.expected_mono {
            Some(expected) if expected == frame.mono => {}
            Some(_) => {
                // Lost frame upstream; restart the buffer at this frame.
                debug!(source = %self.source, "frame gap, re-priming window buffer");
                self.buf.clear();
                self.anchor(&frame);
            }
            None => self.anchor(&frame),
        }
        self.expected_mono =
            Some(frame.mono + samples_to_duration(frame.samples.len() as u64));
        self.buf.extend_from_slice(&frame.samples);

        while self.buf.len() >= WINDOW_SAMPLES {
            let window = AnalysisWindow {
                source: self.source.clone(),
                start_wall: self.buf_start_wall,
                start_mono: self.buf_start_mono,
                index: self.index,
                pcm: self.buf[..WINDOW_SAMPLES].to_vec(),
            };
            self.index += 1;
            if self.queue.push(window) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            self.buf.drain(..self.stride);
            let advance = samples_to_duration(self.stride as u64);
            self.buf_start_mono += advance;
            self.buf_start_wall += chrono::Duration::from_std(advance)
                .unwrap_or_else(|_| chrono::Duration::zero());
        }
    }

    fn anchor(&mut self, frame: &AudioFrame) {
        self.buf_start_wall = frame.wall;
        self.buf_start_mono = frame.mono;
    }
}

/// Drive a dispatcher from its capture channel until the channel closes or
/// the worker is cancelled.
pub fn run_dispatcher(
    rx: &Receiver<AudioFrame>,
    dispatcher: &mut WindowDispatcher,
    stop: &Shutdown,
) {
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(frame) => dispatcher.push_frame(frame),
            Err(RecvTimeoutError::Timeout) => {
                if stop.is_triggered() {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FrameClock, FRAME_SAMPLES, SAMPLE_RATE};

    fn feed_seconds(dispatcher: &mut WindowDispatcher, clock: &mut FrameClock, secs: usize) {
        for _ in 0..(secs * SAMPLE_RATE as usize / FRAME_SAMPLES) {
            dispatcher.push_frame(clock.stamp("s", vec![0.0; FRAME_SAMPLES]));
        }
    }

    #[test]
    fn first_window_requires_full_priming() {
        let queue = Arc::new(WindowQueue::new(64));
        let mut d = WindowDispatcher::new("s", 0.0, Arc::clone(&queue), &Metrics::new());
        let mut clock = FrameClock::start();
        feed_seconds(&mut d, &mut clock, 2);
        assert_eq!(queue.depth(), 0, "no window before the buffer is primed");
        feed_seconds(&mut d, &mut clock, 1);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn window_count_matches_stride_arithmetic() {
        // 60 s at zero overlap: floor((60 - 3) / 3) + 1 = 20 windows.
        let queue = Arc::new(WindowQueue::new(1024));
        let mut d = WindowDispatcher::new("s", 0.0, Arc::clone(&queue), &Metrics::new());
        let mut clock = FrameClock::start();
        feed_seconds(&mut d, &mut clock, 60);
        assert_eq!(d.emitted(), 20);
    }

    #[test]
    fn overlap_doubles_window_rate() {
        let queue = Arc::new(WindowQueue::new(4096));
        let mut d = WindowDispatcher::new("s", 0.5, Arc::clone(&queue), &Metrics::new());
        let mut clock = FrameClock::start();
        feed_seconds(&mut d, &mut clock, 30);
        // stride 1.5 s: floor((30 - 3) / 1.5) + 1 = 19 windows.
        assert_eq!(d.emitted(), 19);
    }

    #[test]
    fn window_starts_advance_by_exact_stride() {
        let queue = Arc::new(WindowQueue::new(4096));
        let mut d = WindowDispatcher::new("s", 0.5, Arc::clone(&queue), &Metrics::new());
        let mut clock = FrameClock::start();
        feed_seconds(&mut d, &mut clock, 9);
        let mut starts = Vec::new();
        while let Some(w) = (queue.depth() > 0).then(|| queue.pop().unwrap()) {
            starts.push(w.start_mono);
            assert_eq!(w.pcm.len(), crate::audio::WINDOW_SAMPLES);
        }
        let stride = samples_to_duration(stride_samples(0.5) as u64);
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], stride);
        }
    }

    #[test]
    fn frame_gap_reprimes_buffer() {
        let queue = Arc::new(WindowQueue::new(64));
        let mut d = WindowDispatcher::new("s", 0.0, Arc::clone(&queue), &Metrics::new());
        let mut clock = FrameClock::start();
        feed_seconds(&mut d, &mut clock, 2);
        // Simulate a lost frame: skip one frame's worth of clock.
        let _lost = clock.stamp("s", vec![0.0; FRAME_SAMPLES]);
        feed_seconds(&mut d, &mut clock, 2);
        // 2 s then a gap then 2 s: neither run primed a full window.
        assert_eq!(d.emitted(), 0);
        feed_seconds(&mut d, &mut clock, 1);
        assert_eq!(d.emitted(), 1);
    }

    #[test]
    fn stride_bounds() {
        assert_eq!(stride_samples(0.0), crate::audio::WINDOW_SAMPLES);
        assert_eq!(stride_samples(0.5), crate::audio::WINDOW_SAMPLES / 2);
        // Overlap near 1 still advances at least one sample.
        assert!(stride_samples(0.999999) >= 1);
    }
}
