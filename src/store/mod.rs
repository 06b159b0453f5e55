//! Datastore interface.
//!
//! Persistence proper is a collaborator, not part of the pipeline: the
//! router and retention manager only see this trait. Errors carry a
//! transient/permanent classification: transient faults are retried,
//! permanent ones go straight to the deadletter.

pub mod jsonl;

use crate::audio::SourceId;
use crate::detection::{ClipHandle, Detection, DetectionId};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct StoreError {
    pub message: String,
    /// Retry when true; deadletter when false.
    pub transient: bool,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> StoreError {
        StoreError { message: message.into(), transient: true }
    }

    pub fn permanent(message: impl Into<String>) -> StoreError {
        StoreError { message: message.into(), transient: false }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A persisted detection row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDetection {
    pub id: DetectionId,
    pub detection: Detection,
}

/// Conjunctive filters for `query_detections`.
#[derive(Debug, Clone, Default)]
pub struct DetectionQuery {
    pub source: Option<SourceId>,
    pub scientific_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

pub trait Datastore: Send + Sync {
    fn save_detection(&self, detection: &Detection) -> StoreResult<DetectionId>;

    fn query_detections(&self, query: &DetectionQuery) -> StoreResult<Vec<StoredDetection>>;

    /// Replace the clip handle; None records clip deletion.
    fn update_clip_handle(&self, id: DetectionId, clip: Option<ClipHandle>) -> StoreResult<()>;

    /// Raise the stored confidence (coalesced duplicates carry the max).
    fn update_confidence(&self, id: DetectionId, confidence: f32) -> StoreResult<()>;

    /// Detections older than `t` that still hold a clip file, oldest first.
    fn clips_older_than(&self, t: DateTime<Utc>) -> StoreResult<Vec<(DetectionId, PathBuf)>>;

    fn delete(&self, id: DetectionId) -> StoreResult<()>;

    /// Flush and release resources. Further calls may fail.
    fn close(&self) -> StoreResult<()>;
}
