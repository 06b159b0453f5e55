//! Append-only JSONL datastore.
//!
//! Each mutation is one JSON line: inserts, clip-handle updates, confidence
//! bumps, and delete tombstones. The full state is rebuilt by replay at
//! open, which also makes the §persist-then-read law easy to honor without
//! a relational engine. Writes are serialized by a single mutex, matching
//! the pipeline's serialized-writes contract.

use super::{Datastore, DetectionQuery, StoreError, StoreResult, StoredDetection};
use crate::detection::{ClipHandle, Detection, DetectionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Row {
    Insert { id: DetectionId, detection: Detection },
    Clip { id: DetectionId, clip: Option<ClipHandle> },
    Confidence { id: DetectionId, confidence: f32 },
    Delete { id: DetectionId },
}

struct Inner {
    file: File,
    index: BTreeMap<DetectionId, Detection>,
    next_id: DetectionId,
    closed: bool,
}

pub struct JsonlStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonlStore {
    pub fn open(path: &Path) -> StoreResult<JsonlStore> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::permanent(format!("creating {}: {e}", parent.display())))?;
        }

        let mut index = BTreeMap::new();
        let mut next_id: DetectionId = 1;
        if path.exists() {
            let file = File::open(path)
                .map_err(|e| StoreError::permanent(format!("opening {}: {e}", path.display())))?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line
                    .map_err(|e| StoreError::permanent(format!("reading {}: {e}", path.display())))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Row>(&line) {
                    Ok(row) => apply_row(&mut index, &mut next_id, row),
                    // A torn final line from a crash is tolerated; anything
                    // mid-file is suspicious but skipping keeps history.
                    Err(e) => warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping bad row"),
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::permanent(format!("opening {} for append: {e}", path.display())))?;

        Ok(JsonlStore {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, index, next_id, closed: false }),
        })
    }

    fn append(inner: &mut Inner, row: &Row) -> StoreResult<()> {
        if inner.closed {
            return Err(StoreError::permanent("store is closed"));
        }
        let line = serde_json::to_string(row)
            .map_err(|e| StoreError::permanent(format!("encoding row: {e}")))?;
        writeln!(inner.file, "{line}")
            .and_then(|_| inner.file.flush())
            .map_err(|e| StoreError::transient(format!("appending row: {e}")))?;
        Ok(())
    }
}

fn apply_row(index: &mut BTreeMap<DetectionId, Detection>, next_id: &mut DetectionId, row: Row) {
    match row {
        Row::Insert { id, detection } => {
            *next_id = (*next_id).max(id + 1);
            index.insert(id, detection);
        }
        Row::Clip { id, clip } => {
            if let Some(d) = index.get_mut(&id) {
                d.clip = clip.unwrap_or(ClipHandle::None);
            }
        }
        Row::Confidence { id, confidence } => {
            if let Some(d) = index.get_mut(&id) {
                d.confidence = d.confidence.max(confidence);
            }
        }
        Row::Delete { id } => {
            index.remove(&id);
        }
    }
}

impl Datastore for JsonlStore {
    fn save_detection(&self, detection: &Detection) -> StoreResult<DetectionId> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        let row = Row::Insert { id, detection: detection.clone() };
        Self::append(&mut inner, &row)?;
        inner.next_id += 1;
        if let Row::Insert { detection, .. } = row {
            inner.index.insert(id, detection);
        }
        Ok(id)
    }

    fn query_detections(&self, query: &DetectionQuery) -> StoreResult<Vec<StoredDetection>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .index
            .iter()
            .filter(|(_, d)| {
                query.source.as_ref().map(|s| &d.source == s).unwrap_or(true)
                    && query
                        .scientific_name
                        .as_ref()
                        .map(|s| d.scientific_name.eq_ignore_ascii_case(s))
                        .unwrap_or(true)
                    && query.since.map(|t| d.event_time >= t).unwrap_or(true)
                    && query.until.map(|t| d.event_time < t).unwrap_or(true)
            })
            .map(|(id, d)| StoredDetection { id: *id, detection: d.clone() })
            .collect())
    }

    fn update_clip_handle(&self, id: DetectionId, clip: Option<ClipHandle>) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.index.contains_key(&id) {
            return Err(StoreError::permanent(format!("no detection {id}")));
        }
        let row = Row::Clip { id, clip: clip.clone() };
        Self::append(&mut inner, &row)?;
        if let Some(d) = inner.index.get_mut(&id) {
            d.clip = clip.unwrap_or(ClipHandle::None);
        }
        Ok(())
    }

    fn update_confidence(&self, id: DetectionId, confidence: f32) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.index.contains_key(&id) {
            return Err(StoreError::permanent(format!("no detection {id}")));
        }
        Self::append(&mut inner, &Row::Confidence { id, confidence })?;
        if let Some(d) = inner.index.get_mut(&id) {
            d.confidence = d.confidence.max(confidence);
        }
        Ok(())
    }

    fn clips_older_than(&self, t: DateTime<Utc>) -> StoreResult<Vec<(DetectionId, PathBuf)>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<(DateTime<Utc>, DetectionId, PathBuf)> = inner
            .index
            .iter()
            .filter(|(_, d)| d.event_time < t)
            .filter_map(|(id, d)| d.clip.path().map(|p| (d.event_time, *id, p.clone())))
            .collect();
        rows.sort_by_key(|(at, id, _)| (*at, *id));
        Ok(rows.into_iter().map(|(_, id, path)| (id, path)).collect())
    }

    fn delete(&self, id: DetectionId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::append(&mut inner, &Row::Delete { id })?;
        inner.index.remove(&id);
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner
            .file
            .sync_all()
            .map_err(|e| StoreError::transient(format!("syncing {}: {e}", self.path.display())))?;
        Ok(())
    }
}
