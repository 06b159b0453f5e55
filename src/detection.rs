//! Detection records: what survives the filter chain.

use crate::audio::SourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server-assigned identity of a persisted detection.
pub type DetectionId = u64;

/// Reference to a detection's audio excerpt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClipHandle {
    /// No clip: export disabled, or the ring had already overwritten it.
    None,
    /// Ring coordinates awaiting materialization by the router.
    Pending { start: DateTime<Utc>, end: DateTime<Utc> },
    /// Encoded file on disk.
    File { path: PathBuf },
}

impl ClipHandle {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ClipHandle::File { path } => Some(path),
            _ => None,
        }
    }
}

/// A confirmed observation. Created by the filter chain, persisted and
/// fanned out by the router; the clip lives under the retention policy while
/// the row itself is kept until the user deletes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub source: SourceId,
    /// Wall-clock start of the window that produced the observation.
    pub event_time: DateTime<Utc>,
    pub species_code: String,
    pub scientific_name: String,
    /// Locale-resolved at detection time.
    pub common_name: String,
    pub confidence: f32,
    /// The configured threshold that was in force at decision time.
    pub threshold: f32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub clip: ClipHandle,
    /// Set when clip materialization found the ring already overwritten.
    #[serde(default)]
    pub clip_missed: bool,
    /// User verification flag, mutable after creation.
    #[serde(default)]
    pub verified: Option<bool>,
    #[serde(default)]
    pub comment: Option<String>,
}
