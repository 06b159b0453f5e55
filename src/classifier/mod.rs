//! Classifier abstraction consumed by the worker pool.
//!
//! The neural network itself is an opaque collaborator: one instance per
//! worker thread, thread-unsafe per instance, replicated by the pool. Tests
//! substitute scripted implementations through the same trait.

pub mod labels;
pub mod onnx;
pub mod range;

use crate::audio::SourceId;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One (speciesCode, confidence) pair, confidence in [0, 1].
pub type Prediction = (String, f32);

/// Output of classifying a single analysis window.
#[derive(Debug, Clone)]
pub struct RawPrediction {
    pub source: SourceId,
    /// Wall-clock start of the classified window.
    pub window_start: DateTime<Utc>,
    /// Monotonic offset of the window within its stream.
    pub window_mono: Duration,
    /// Per-source monotonically increasing window number.
    pub window_index: u64,
    /// Ordered by descending confidence, truncated to top-K.
    pub pairs: Vec<Prediction>,
}

/// A species classifier instance. Owned by exactly one pool worker; the
/// worker calls it serially and reuses it for every window it processes.
pub trait Classifier: Send {
    /// Classify one window of canonical PCM (exactly sampleRate x 3 samples).
    fn classify(&mut self, pcm: &[f32]) -> anyhow::Result<Vec<Prediction>>;
}

/// Builds one classifier instance per pool worker.
pub trait ClassifierProvider: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn Classifier>>;
}

impl<F> ClassifierProvider for F
where
    F: Fn() -> anyhow::Result<Box<dyn Classifier>> + Send + Sync,
{
    fn create(&self) -> anyhow::Result<Box<dyn Classifier>> {
        self()
    }
}
