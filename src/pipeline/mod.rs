//! The realtime pipeline: frame streams in, raw predictions out.
//!
//! Capture workers feed per-source dispatchers; dispatchers slice frames
//! into overlapping windows on a bounded queue; the classifier pool drains
//! the queue with bounded parallelism. The source manager owns worker
//! lifecycles and health.

pub mod dispatcher;
pub mod pool;
pub mod queue;
pub mod source;

use crate::audio::SourceId;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One 3-second slice of a source's stream, ready for classification.
#[derive(Debug, Clone)]
pub struct AnalysisWindow {
    pub source: SourceId,
    /// Wall-clock time of the window's first sample.
    pub start_wall: DateTime<Utc>,
    /// Monotonic offset of the first sample within the stream.
    pub start_mono: Duration,
    /// Per-source, monotonically increasing.
    pub index: u64,
    /// Exactly WINDOW_SAMPLES canonical samples.
    pub pcm: Vec<f32>,
}
