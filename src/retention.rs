//! Clip retention: bounds on-disk storage by age or filesystem usage.
//!
//! A background thread sweeps on a schedule and opportunistically after
//! detection bursts. Deletion pairs the file removal with nulling the
//! detection's clip handle in the datastore, which is the source of truth
//! the next pass reads, so running a pass twice deletes nothing new.

use crate::config::{parse_age, RetentionConfig, RetentionPolicy};
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use crate::store::Datastore;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Filesystem utilization probe, injectable for tests.
pub trait DiskUsage: Send {
    /// (total bytes, available bytes) for the filesystem holding `path`.
    fn usage(&self, path: &Path) -> Option<(u64, u64)>;
}

/// Probe backed by sysinfo's disk list: picks the mount point that is the
/// longest prefix of the clip root.
pub struct SystemDiskUsage;

impl DiskUsage for SystemDiskUsage {
    fn usage(&self, path: &Path) -> Option<(u64, u64)> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| (d.total_space(), d.available_space()))
    }
}

pub struct RetentionManager {
    thread: JoinHandle<()>,
}

impl RetentionManager {
    pub fn start(
        cfg: RetentionConfig,
        clip_root: PathBuf,
        store: Arc<dyn Datastore>,
        disk: Box<dyn DiskUsage>,
        burst_rx: Receiver<()>,
        shutdown: Shutdown,
        metrics: Metrics,
    ) -> RetentionManager {
        let thread = std::thread::Builder::new()
            .name("retention".to_string())
            .spawn(move || {
                let sweep = Duration::from_secs(cfg.sweep_secs.max(1));
                loop {
                    // Wake on a burst signal or the sweep timer, whichever
                    // comes first; exit promptly on shutdown.
                    match burst_rx.recv_timeout(sweep) {
                        Ok(()) => debug!("retention pass triggered by detection burst"),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            if shutdown.wait_timeout(sweep) {
                                return;
                            }
                        }
                    }
                    if shutdown.is_triggered() {
                        return;
                    }
                    run_pass(&cfg.policy, &clip_root, store.as_ref(), disk.as_ref(), &metrics);
                }
            })
            .expect("spawning retention thread");
        RetentionManager { thread }
    }

    pub fn stop(self) {
        // The thread observes the shared shutdown token; just reap it.
        let _ = self.thread.join();
    }
}

/// One enforcement pass. Separated from the thread for direct testing.
pub fn run_pass(
    policy: &RetentionPolicy,
    clip_root: &Path,
    store: &dyn Datastore,
    disk: &dyn DiskUsage,
    metrics: &Metrics,
) {
    match policy {
        RetentionPolicy::None => {}
        RetentionPolicy::Age { max_age } => {
            let Ok(age) = parse_age(max_age) else {
                warn!(max_age, "unparseable retention age");
                return;
            };
            let cutoff = Utc::now()
                - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
            let clips = match store.clips_older_than(cutoff) {
                Ok(clips) => clips,
                Err(e) => {
                    warn!(error = %e, "retention query failed");
                    return;
                }
            };
            let mut deleted = 0usize;
            for (id, path) in clips {
                if delete_clip(id, &path, store, metrics) {
                    deleted += 1;
                }
            }
            if deleted > 0 {
                info!(deleted, "retention pass removed clips older than {max_age}");
            }
        }
        RetentionPolicy::Usage { high_pct, low_pct } => {
            let Some((total, available)) = disk.usage(clip_root) else {
                warn!(path = %clip_root.display(), "cannot determine filesystem usage");
                return;
            };
            if total == 0 {
                return;
            }
            let used_pct = |avail: u64| (total - avail) as f32 / total as f32 * 100.0;
            if used_pct(available) <= *high_pct {
                return;
            }
            let clips = match store.clips_older_than(Utc::now()) {
                Ok(clips) => clips,
                Err(e) => {
                    warn!(error = %e, "retention query failed");
                    return;
                }
            };
            let mut avail_now = available;
            let mut deleted = 0usize;
            for (id, path) in clips {
                if used_pct(avail_now) <= *low_pct {
                    break;
                }
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if delete_clip(id, &path, store, metrics) {
                    deleted += 1;
                    avail_now = avail_now.saturating_add(size);
                }
            }
            if deleted > 0 {
                info!(
                    deleted,
                    used_pct = used_pct(avail_now),
                    "retention pass freed space to the low-water mark"
                );
            }
        }
    }
}

/// Delete one clip file and null its stored handle. Individual failures are
/// logged and skipped; the pass continues.
fn delete_clip(
    id: crate::detection::DetectionId,
    path: &Path,
    store: &dyn Datastore,
    metrics: &Metrics,
) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Already gone; still null the handle so it stops showing up.
        }
        Err(e) => {
            metrics.incr("retention", "delete-failed");
            warn!(path = %path.display(), error = %e, "clip delete failed");
            return false;
        }
    }
    if let Err(e) = store.update_clip_handle(id, None) {
        metrics.incr("retention", "delete-failed");
        warn!(id, error = %e, "clip handle null-out failed");
        return false;
    }
    metrics.incr("retention", "clips-deleted");
    true
}
