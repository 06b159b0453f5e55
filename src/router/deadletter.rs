//! Disk-backed deadletter for detections persistence could not take.
//!
//! Entries are self-describing JSON lines carrying the full detection
//! payload plus the failure reason, so an operator can replay them later.
//! The file is append-only; nothing here ever truncates it.

use crate::detection::Detection;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
pub struct DeadletterEntry {
    pub at: DateTime<Utc>,
    pub reason: String,
    pub detection: Detection,
}

pub struct Deadletter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Deadletter {
    pub fn new(path: &Path) -> Deadletter {
        Deadletter { path: path.to_path_buf(), lock: Mutex::new(()) }
    }

    pub fn append(&self, detection: &Detection, reason: &str) -> Result<()> {
        let entry = DeadletterEntry {
            at: Utc::now(),
            reason: reason.to_string(),
            detection: detection.clone(),
        };
        let line = serde_json::to_string(&entry).context("encoding deadletter entry")?;
        let _guard = self.lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    /// Read every entry back, for replay tooling and tests.
    pub fn read_all(&self) -> Result<Vec<DeadletterEntry>> {
        let _guard = self.lock.lock().unwrap();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("parsing deadletter entry"))
            .collect()
    }
}
