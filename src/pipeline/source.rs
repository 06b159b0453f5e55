//! Source manager: reconciles running capture workers with configuration.
//!
//! One supervision thread per source runs the capture worker, restarting it
//! with jittered exponential backoff after non-clean exits. A paired
//! dispatcher thread slices the worker's frames into windows. `reconcile`
//! is idempotent: unchanged specs keep their workers, removed or materially
//! changed specs are torn down, new specs are started.

use crate::audio::ring::RingRegistry;
use crate::audio::{device, stream, AudioFrame, SourceId};
use crate::config::{SourceKind, SourceSpec};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::pipeline::dispatcher::{run_dispatcher, WindowDispatcher};
use crate::pipeline::queue::WindowQueue;
use crate::shutdown::Shutdown;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// A worker healthy this long gets its backoff reset.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(60);
/// Consecutive failed initializations before the source is reported failed.
const FAILED_AFTER_ATTEMPTS: u32 = 3;
/// Frames buffered between capture and dispatch: ~3 s.
const FRAME_CHANNEL_DEPTH: usize = 64;

/// Externally visible state of one source's worker.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthState {
    Starting,
    Healthy,
    BackingOff { attempt: u32, next_attempt_in: Duration },
    Failed { reason: String },
    Stopping,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Starting => write!(f, "starting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::BackingOff { attempt, next_attempt_in } => {
                write!(f, "backing-off(attempt {attempt}, retry in {next_attempt_in:?})")
            }
            HealthState::Failed { reason } => write!(f, "failed({reason})"),
            HealthState::Stopping => write!(f, "stopping"),
        }
    }
}

struct Worker {
    spec: SourceSpec,
    stop: Shutdown,
    supervisor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

pub struct SourceManager {
    registry: RingRegistry,
    window_queue: Arc<WindowQueue>,
    metrics: Metrics,
    overlap: f32,
    ring_secs: u64,
    workers: Mutex<HashMap<SourceId, Worker>>,
    health: Arc<Mutex<HashMap<SourceId, HealthState>>>,
    /// Sources with a live worker; the filter chain discards predictions
    /// from sources no longer in this set.
    active: Arc<RwLock<HashSet<SourceId>>>,
}

impl SourceManager {
    pub fn new(
        registry: RingRegistry,
        window_queue: Arc<WindowQueue>,
        metrics: Metrics,
        overlap: f32,
        ring_secs: u64,
    ) -> Self {
        SourceManager {
            registry,
            window_queue,
            metrics,
            overlap,
            ring_secs,
            workers: Mutex::new(HashMap::new()),
            health: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn active_sources(&self) -> Arc<RwLock<HashSet<SourceId>>> {
        Arc::clone(&self.active)
    }

    /// Bring the running worker set in line with `desired`.
    pub fn reconcile(&self, desired: &[SourceSpec]) {
        let desired_by_id: HashMap<&str, &SourceSpec> =
            desired.iter().map(|s| (s.id.as_str(), s)).collect();

        // Tear down removed or materially changed workers first.
        let to_stop: Vec<SourceId> = {
            let workers = self.workers.lock().unwrap();
            workers
                .iter()
                .filter(|(id, worker)| {
                    desired_by_id
                        .get(id.as_str())
                        .map(|spec| spec.materially_differs(&worker.spec))
                        .unwrap_or(true)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in to_stop {
            self.stop_worker(&id);
        }

        // Start anything not already running.
        for spec in desired {
            let running = self.workers.lock().unwrap().contains_key(&spec.id);
            if !running {
                self.start_worker(spec.clone());
            }
        }
    }

    /// Per-source health, for the supervisor's aggregate view.
    pub fn health(&self) -> HashMap<SourceId, HealthState> {
        self.health.lock().unwrap().clone()
    }

    /// Stop every worker, bounded by `deadline`.
    pub fn stop_all(&self, deadline: Duration) {
        let ids: Vec<SourceId> = self.workers.lock().unwrap().keys().cloned().collect();
        let per_worker = deadline / (ids.len().max(1) as u32);
        for id in ids {
            self.stop_worker_with_deadline(&id, per_worker);
        }
    }

    fn stop_worker(&self, id: &str) {
        self.stop_worker_with_deadline(id, Duration::from_secs(5));
    }

    fn stop_worker_with_deadline(&self, id: &str, deadline: Duration) {
        let worker = { self.workers.lock().unwrap().remove(id) };
        let Some(worker) = worker else { return };
        info!(source = id, "stopping capture worker");
        self.health.lock().unwrap().insert(id.to_string(), HealthState::Stopping);
        self.active.write().unwrap().remove(id);
        worker.stop.trigger();

        // Join with a deadline; a wedged device read must not hold up the
        // rest of shutdown.
        let done = Instant::now() + deadline;
        let mut supervisor = Some(worker.supervisor);
        while supervisor.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
            && Instant::now() < done
        {
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = supervisor.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(source = id, "capture worker did not stop within deadline");
            }
        }
        let _ = worker.dispatcher.join();

        self.window_queue.purge_source(id);
        self.health.lock().unwrap().remove(id);
    }

    fn start_worker(&self, spec: SourceSpec) {
        let id = spec.id.clone();
        info!(source = %id, "starting capture worker");
        self.health.lock().unwrap().insert(id.clone(), HealthState::Starting);
        self.active.write().unwrap().insert(id.clone());

        let stop = Shutdown::new();
        let (frame_tx, frame_rx) = mpsc::sync_channel::<AudioFrame>(FRAME_CHANNEL_DEPTH);

        let mut dispatcher =
            WindowDispatcher::new(&id, self.overlap, Arc::clone(&self.window_queue), &self.metrics);
        let dispatcher_stop = stop.clone();
        let dispatcher_handle = thread::Builder::new()
            .name(format!("dispatch-{id}"))
            .spawn(move || run_dispatcher(&frame_rx, &mut dispatcher, &dispatcher_stop))
            .expect("spawning dispatcher thread");

        let supervisor_handle = {
            let spec = spec.clone();
            let stop = stop.clone();
            let registry = self.registry.clone();
            let metrics = self.metrics.clone();
            let health = Arc::clone(&self.health);
            let ring_secs = self.ring_secs;
            thread::Builder::new()
                .name(format!("capture-{id}"))
                .spawn(move || {
                    supervise_capture(spec, stop, registry, metrics, health, ring_secs, frame_tx)
                })
                .expect("spawning capture thread")
        };

        self.workers.lock().unwrap().insert(
            id,
            Worker { spec, stop, supervisor: supervisor_handle, dispatcher: dispatcher_handle },
        );
    }
}

/// Restart loop for one source: run the capture worker, back off on faults.
fn supervise_capture(
    spec: SourceSpec,
    stop: Shutdown,
    registry: RingRegistry,
    metrics: Metrics,
    health: Arc<Mutex<HashMap<SourceId, HealthState>>>,
    ring_secs: u64,
    frame_tx: mpsc::SyncSender<AudioFrame>,
) {
    let id = spec.id.clone();
    let fatal_counter = metrics.counter("capture", "capture-fatal");
    let mut attempt: u32 = 0;
    let set_health = |state: HealthState| {
        let mut map = health.lock().unwrap();
        // Never clobber the Stopping marker placed by stop_worker.
        if map.get(&id) != Some(&HealthState::Stopping) {
            map.insert(id.clone(), state);
        }
    };

    while !stop.is_triggered() {
        set_health(HealthState::Starting);
        let run_started = Instant::now();
        let health_cb = &health;
        let id_cb = id.clone();
        let mark_healthy = move || {
            let mut map = health_cb.lock().unwrap();
            if map.get(&id_cb) != Some(&HealthState::Stopping) {
                map.insert(id_cb.clone(), HealthState::Healthy);
            }
        };

        let result = match &spec.kind {
            SourceKind::Device { name } => device::run_device_capture(
                &id, name, ring_secs, &registry, &frame_tx, &stop, &metrics, &mark_healthy,
            ),
            SourceKind::Stream { url, stall_secs } => stream::run_stream_capture(
                &id, url, *stall_secs, ring_secs, &registry, &frame_tx, &stop, &metrics,
                &mark_healthy,
            ),
        };

        match result {
            Ok(()) => break, // clean cancellation
            Err(e) => {
                fatal_counter.fetch_add(1, Ordering::Relaxed);
                log_capture_error(&e);
                if run_started.elapsed() >= BACKOFF_RESET_AFTER {
                    attempt = 0;
                }
                attempt += 1;
                let delay = backoff_delay(attempt);
                if attempt >= FAILED_AFTER_ATTEMPTS {
                    set_health(HealthState::Failed { reason: e.to_string() });
                } else {
                    set_health(HealthState::BackingOff { attempt, next_attempt_in: delay });
                }
                if stop.wait_timeout(delay) {
                    break;
                }
            }
        }
    }
}

fn log_capture_error(e: &Error) {
    warn!(
        component = e.component(),
        kind = e.kind(),
        source = e.source().unwrap_or(""),
        "capture worker exited: {e}"
    );
}

/// Exponential backoff: 1 s doubling to 60 s, with ±20 % jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_INITIAL
        .saturating_mul(1u32 << attempt.saturating_sub(1).min(6))
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(jitter).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap_with_jitter() {
        for attempt in 1..12 {
            let d = backoff_delay(attempt);
            let ideal = BACKOFF_INITIAL
                .saturating_mul(1u32 << (attempt - 1).min(6))
                .min(BACKOFF_CAP);
            assert!(d >= ideal.mul_f64(0.79), "attempt {attempt}: {d:?} below jitter floor");
            assert!(d <= BACKOFF_CAP.mul_f64(1.01), "attempt {attempt}: {d:?} above cap");
        }
    }

    #[test]
    fn reconcile_is_idempotent_on_worker_set() {
        let queue = Arc::new(WindowQueue::new(8));
        let manager = SourceManager::new(
            RingRegistry::new(),
            Arc::clone(&queue),
            Metrics::new(),
            0.0,
            30,
        );
        // A stream source pointing nowhere: the worker will spin in backoff,
        // which is fine; we only assert on the managed set.
        let spec = SourceSpec {
            id: "cam".to_string(),
            kind: SourceKind::Stream { url: "rtsp://127.0.0.1:1/none".to_string(), stall_secs: 1 },
            enabled: true,
        };
        manager.reconcile(&[spec.clone()]);
        manager.reconcile(&[spec.clone()]);
        assert_eq!(manager.workers.lock().unwrap().len(), 1);
        assert!(manager.health().contains_key("cam"));
        assert!(manager.active_sources().read().unwrap().contains("cam"));

        manager.reconcile(&[]);
        assert!(manager.workers.lock().unwrap().is_empty());
        assert!(manager.health().is_empty());
        assert!(manager.active_sources().read().unwrap().is_empty());
    }

    #[test]
    fn reconcile_restarts_materially_changed_spec() {
        let queue = Arc::new(WindowQueue::new(8));
        let manager = SourceManager::new(
            RingRegistry::new(),
            Arc::clone(&queue),
            Metrics::new(),
            0.0,
            30,
        );
        let original = SourceSpec {
            id: "cam".to_string(),
            kind: SourceKind::Stream { url: "rtsp://127.0.0.1:1/a".to_string(), stall_secs: 1 },
            enabled: true,
        };
        manager.reconcile(&[original.clone()]);
        let mut changed = original.clone();
        changed.kind =
            SourceKind::Stream { url: "rtsp://127.0.0.1:1/b".to_string(), stall_secs: 1 };
        manager.reconcile(&[changed.clone()]);
        let workers = manager.workers.lock().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers.get("cam").unwrap().spec, changed);
        drop(workers);
        manager.stop_all(Duration::from_secs(5));
    }
}
