//! Detection router: persists detections and fans out notifications.
//!
//! A single ingest thread serializes per-source persistence order: clip
//! materialization, datastore insert (with retry and deadletter), then
//! fan-out onto per-sink bounded queues. Each sink drains its own queue on
//! its own thread with an independent retry policy, so a stuck sink can
//! only ever lose its own deliveries.

pub mod aggregator;
pub mod clip;
pub mod deadletter;
pub mod mqtt;
pub mod webhook;

use crate::audio::ring::RingRegistry;
use crate::audio::SourceId;
use crate::detection::{ClipHandle, Detection, DetectionId};
use crate::filter::FilterOutput;
use crate::metrics::Metrics;
use crate::pipeline::queue::BoundedQueue;
use crate::shutdown::Shutdown;
use crate::store::Datastore;
use anyhow::Result;
use chrono::Utc;
use deadletter::Deadletter;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Delivery attempts per sink before an event is dropped.
const SINK_ATTEMPTS: u32 = 3;
/// Base backoff between sink attempts.
const SINK_BACKOFF: Duration = Duration::from_millis(500);
/// Base backoff between datastore retry attempts.
const PERSIST_BACKOFF: Duration = Duration::from_millis(100);
/// Extra slack allowed for the ring writer to reach a clip's post-roll.
const EXTRACT_MARGIN: Duration = Duration::from_secs(2);

/// What sinks receive: the persisted row id (None when deadlettered) plus
/// the full detection record.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionEvent {
    pub id: Option<DetectionId>,
    pub detection: Detection,
}

/// One external consumer of detections.
pub trait Sink: Send {
    fn kind(&self) -> &'static str;
    fn deliver(&mut self, event: &DetectionEvent) -> Result<()>;
}

/// A sink plus its queue and worker thread.
struct SinkRunner {
    queue: Arc<BoundedQueue<Arc<DetectionEvent>>>,
    thread: JoinHandle<()>,
    kind: &'static str,
}

fn start_sink(
    mut sink: Box<dyn Sink>,
    queue_depth: usize,
    shutdown: Shutdown,
    metrics: &Metrics,
) -> SinkRunner {
    let kind = sink.kind();
    let queue = Arc::new(BoundedQueue::new(queue_depth));
    let failed = metrics.counter("sink", kind);
    let thread = {
        let queue = Arc::clone(&queue);
        thread::Builder::new()
            .name(format!("sink-{kind}"))
            .spawn(move || loop {
                let Some(event) = queue.pop_timeout(Duration::from_millis(200)) else {
                    if queue.is_closed_and_empty() {
                        return;
                    }
                    continue;
                };
                let mut delivered = false;
                for attempt in 0..SINK_ATTEMPTS {
                    match sink.deliver(&event) {
                        Ok(()) => {
                            delivered = true;
                            break;
                        }
                        Err(e) => {
                            warn!(sink = kind, attempt, error = %format!("{e:#}"), "delivery failed");
                            if attempt + 1 < SINK_ATTEMPTS
                                && shutdown.wait_timeout(SINK_BACKOFF * (1 << attempt))
                            {
                                break;
                            }
                        }
                    }
                }
                if !delivered {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            })
            .expect("spawning sink thread")
    };
    SinkRunner { queue, thread, kind }
}

/// Everything the ingest loop needs besides its queues.
pub struct RouterSettings {
    pub clip_root: PathBuf,
    pub gain_db: f32,
    pub persist_retries: u32,
    pub burst_threshold: u64,
}

pub struct DetectionRouter {
    ingest: JoinHandle<()>,
    sinks: Vec<SinkRunner>,
}

impl DetectionRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        settings: RouterSettings,
        store: Arc<dyn Datastore>,
        rings: RingRegistry,
        sinks: Vec<Box<dyn Sink>>,
        sink_queue_depth: usize,
        dead: Arc<Deadletter>,
        rx: Receiver<FilterOutput>,
        burst_tx: Option<SyncSender<()>>,
        shutdown: Shutdown,
        metrics: Metrics,
    ) -> DetectionRouter {
        let runners: Vec<SinkRunner> = sinks
            .into_iter()
            .map(|s| start_sink(s, sink_queue_depth, shutdown.clone(), &metrics))
            .collect();
        let queues: Vec<(Arc<BoundedQueue<Arc<DetectionEvent>>>, &'static str)> =
            runners.iter().map(|r| (Arc::clone(&r.queue), r.kind)).collect();

        let ingest = thread::Builder::new()
            .name("detection-router".to_string())
            .spawn(move || {
                let mut worker = IngestWorker {
                    settings,
                    store,
                    rings,
                    queues,
                    dead,
                    burst_tx,
                    shutdown,
                    metrics: metrics.clone(),
                    recent: HashMap::new(),
                    since_burst: 0,
                };
                loop {
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(output) => worker.handle(output),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .expect("spawning router thread");

        DetectionRouter { ingest, sinks: runners }
    }

    /// Flush queues and stop, bounded by `deadline`. The filter-side sender
    /// must already be dropped so the ingest loop can drain to completion.
    pub fn stop(self, deadline: Duration) {
        let end = Instant::now() + deadline;
        join_with_deadline(self.ingest, end, "detection-router");
        for runner in self.sinks {
            runner.queue.close();
            join_with_deadline(runner.thread, end, runner.kind);
        }
    }
}

fn join_with_deadline(handle: JoinHandle<()>, end: Instant, name: &str) {
    while !handle.is_finished() && Instant::now() < end {
        thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!(task = name, "did not finish within shutdown deadline");
    }
}

struct IngestWorker {
    settings: RouterSettings,
    store: Arc<dyn Datastore>,
    rings: RingRegistry,
    queues: Vec<(Arc<BoundedQueue<Arc<DetectionEvent>>>, &'static str)>,
    dead: Arc<Deadletter>,
    burst_tx: Option<SyncSender<()>>,
    shutdown: Shutdown,
    metrics: Metrics,
    /// Most recent persisted id per (source, species), the target of
    /// coalesced confidence updates.
    recent: HashMap<(SourceId, String), DetectionId>,
    since_burst: u64,
}

impl IngestWorker {
    fn handle(&mut self, output: FilterOutput) {
        match output {
            FilterOutput::Detection(detection) => self.handle_detection(detection),
            FilterOutput::ConfidenceUpdate { source, scientific_name, confidence } => {
                let Some(&id) = self.recent.get(&(source, scientific_name)) else {
                    return;
                };
                if let Err(e) = self.store.update_confidence(id, confidence) {
                    warn!(id, error = %e, "confidence update failed");
                }
            }
        }
    }

    fn handle_detection(&mut self, mut detection: Detection) {
        // 1. Clip materialization.
        if let ClipHandle::Pending { start, end } = detection.clip {
            detection.clip = ClipHandle::None;
            match self.rings.get(&detection.source) {
                None => {
                    detection.clip_missed = true;
                    self.metrics.incr("router", "clip-expired");
                }
                Some(ring) => {
                    let wait = (end - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .saturating_add(EXTRACT_MARGIN);
                    match ring.extract(start, end, wait, &self.shutdown) {
                        Ok(pcm) => {
                            match clip::write_clip(
                                &self.settings.clip_root,
                                &detection,
                                &pcm,
                                self.settings.gain_db,
                            ) {
                                Ok(path) => detection.clip = ClipHandle::File { path },
                                Err(e) => {
                                    detection.clip_missed = true;
                                    self.metrics.incr("router", "clip-write-failed");
                                    error!(error = %format!("{e:#}"), "clip encode failed");
                                }
                            }
                        }
                        Err(e) => {
                            detection.clip_missed = true;
                            self.metrics.incr("router", "clip-expired");
                            warn!(source = %detection.source, "{e}");
                        }
                    }
                }
            }
        }

        // 2. Persist, retrying transient faults, deadlettering the rest.
        let id = self.persist(&detection);
        if let Some(id) = id {
            self.recent
                .insert((detection.source.clone(), detection.scientific_name.clone()), id);
            if self.recent.len() > 1024 {
                self.recent.clear();
            }
        }

        info!(
            source = %detection.source,
            species = %detection.common_name,
            confidence = detection.confidence,
            clip = detection.clip.path().map(|p| p.display().to_string()).unwrap_or_default(),
            "detection"
        );

        // 3. Sink fan-out; producers never block on a slow sink.
        let event = Arc::new(DetectionEvent { id, detection });
        for (queue, _kind) in &self.queues {
            if queue.push(Arc::clone(&event)) {
                self.metrics.incr("router", "sink-overflow");
            }
        }

        // Opportunistic retention after bursts.
        self.since_burst += 1;
        if self.since_burst >= self.settings.burst_threshold {
            self.since_burst = 0;
            if let Some(tx) = &self.burst_tx {
                let _ = tx.try_send(());
            }
        }
    }

    fn persist(&mut self, detection: &Detection) -> Option<DetectionId> {
        let mut last_error = String::new();
        for attempt in 0..=self.settings.persist_retries {
            match self.store.save_detection(detection) {
                Ok(id) => return Some(id),
                Err(e) if e.transient => {
                    last_error = e.to_string();
                    self.metrics.incr("store", "persistence-transient");
                    let backoff = PERSIST_BACKOFF
                        .saturating_mul(1 << attempt.min(6))
                        .min(Duration::from_secs(5));
                    if attempt < self.settings.persist_retries
                        && self.shutdown.wait_timeout(backoff)
                    {
                        // Shutting down: no more retries, go to deadletter so
                        // the detection is not lost in flight.
                        break;
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    self.metrics.incr("store", "persistence-permanent");
                    break;
                }
            }
        }

        self.metrics.incr("router", "deadlettered");
        if let Err(e) = self.dead.append(detection, &last_error) {
            // Both the store and the deadletter disk failed; keep running so
            // sinks still see the detection, but shout about it.
            self.metrics.incr("router", "deadletter-failed");
            error!(error = %format!("{e:#}"), "deadletter write failed; detection lost");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::ClipHandle;
    use crate::store::{DetectionQuery, StoreError, StoreResult, StoredDetection};
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    /// Store that fails transiently N times before accepting.
    struct FlakyStore {
        failures: AtomicU32,
        saved: std::sync::Mutex<Vec<Detection>>,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            FlakyStore { failures: AtomicU32::new(failures), saved: std::sync::Mutex::new(Vec::new()) }
        }
    }

    impl Datastore for FlakyStore {
        fn save_detection(&self, d: &Detection) -> StoreResult<DetectionId> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::transient("locked"));
            }
            let mut saved = self.saved.lock().unwrap();
            saved.push(d.clone());
            Ok(saved.len() as DetectionId)
        }
        fn query_detections(&self, _: &DetectionQuery) -> StoreResult<Vec<StoredDetection>> {
            Ok(Vec::new())
        }
        fn update_clip_handle(&self, _: DetectionId, _: Option<ClipHandle>) -> StoreResult<()> {
            Ok(())
        }
        fn update_confidence(&self, _: DetectionId, _: f32) -> StoreResult<()> {
            Ok(())
        }
        fn clips_older_than(
            &self,
            _: chrono::DateTime<Utc>,
        ) -> StoreResult<Vec<(DetectionId, PathBuf)>> {
            Ok(Vec::new())
        }
        fn delete(&self, _: DetectionId) -> StoreResult<()> {
            Ok(())
        }
        fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    fn detection() -> Detection {
        Detection {
            source: "yard".to_string(),
            event_time: Utc::now(),
            species_code: "amecro".to_string(),
            scientific_name: "Corvus brachyrhynchos".to_string(),
            common_name: "American Crow".to_string(),
            confidence: 0.9,
            threshold: 0.8,
            latitude: None,
            longitude: None,
            clip: ClipHandle::None,
            clip_missed: false,
            verified: None,
            comment: None,
        }
    }

    fn run_router(
        store: Arc<dyn Datastore>,
        dead: Arc<Deadletter>,
        retries: u32,
        outputs: Vec<FilterOutput>,
        clip_root: PathBuf,
    ) {
        let (tx, rx) = mpsc::sync_channel(16);
        let router = DetectionRouter::start(
            RouterSettings { clip_root, gain_db: 0.0, persist_retries: retries, burst_threshold: 1000 },
            store,
            RingRegistry::new(),
            Vec::new(),
            8,
            dead,
            rx,
            None,
            Shutdown::new(),
            Metrics::new(),
        );
        for o in outputs {
            tx.send(o).unwrap();
        }
        drop(tx);
        router.stop(Duration::from_secs(10));
    }

    #[test]
    fn transient_store_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(2));
        let dead = Arc::new(Deadletter::new(&dir.path().join("dead.jsonl")));
        run_router(
            Arc::clone(&store) as Arc<dyn Datastore>,
            Arc::clone(&dead),
            5,
            vec![FilterOutput::Detection(detection())],
            dir.path().join("clips"),
        );
        assert_eq!(store.saved.lock().unwrap().len(), 1);
        assert!(dead.read_all().unwrap().is_empty());
    }

    #[test]
    fn exhausted_retries_go_to_deadletter() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(100));
        let dead = Arc::new(Deadletter::new(&dir.path().join("dead.jsonl")));
        run_router(
            Arc::clone(&store) as Arc<dyn Datastore>,
            Arc::clone(&dead),
            2,
            vec![FilterOutput::Detection(detection())],
            dir.path().join("clips"),
        );
        assert!(store.saved.lock().unwrap().is_empty());
        let entries = dead.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].detection.scientific_name, "Corvus brachyrhynchos");
    }
}
