//! End-to-end pipeline scenarios: synthetic frames through dispatcher,
//! classifier pool, filter chain and router, with a scripted classifier and
//! no audio hardware, network, or model files.

use chrono::Utc;
use skylark::audio::ring::{ClipRing, RingRegistry};
use skylark::audio::{FrameClock, FRAME_SAMPLES, SAMPLE_RATE};
use skylark::classifier::labels::LabelTable;
use skylark::classifier::{Classifier, ClassifierProvider, Prediction, RawPrediction};
use skylark::config::Config;
use skylark::detection::ClipHandle;
use skylark::filter::{FilterChain, FilterOutput, FilterSettings};
use skylark::metrics::Metrics;
use skylark::pipeline::dispatcher::WindowDispatcher;
use skylark::pipeline::pool::ClassifierPool;
use skylark::pipeline::queue::WindowQueue;
use skylark::router::deadletter::Deadletter;
use skylark::router::{DetectionRouter, RouterSettings};
use skylark::shutdown::Shutdown;
use skylark::store::jsonl::JsonlStore;
use skylark::store::{Datastore, DetectionQuery};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Classifier that returns a fixed answer and counts invocations.
struct FixedClassifier {
    pairs: Vec<Prediction>,
    calls: Arc<AtomicUsize>,
}

impl Classifier for FixedClassifier {
    fn classify(&mut self, pcm: &[f32]) -> anyhow::Result<Vec<Prediction>> {
        assert_eq!(pcm.len(), skylark::audio::WINDOW_SAMPLES);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pairs.clone())
    }
}

struct FixedProvider {
    pairs: Vec<Prediction>,
    calls: Arc<AtomicUsize>,
}

impl ClassifierProvider for FixedProvider {
    fn create(&self) -> anyhow::Result<Box<dyn Classifier>> {
        Ok(Box::new(FixedClassifier {
            pairs: self.pairs.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

fn test_labels() -> Arc<LabelTable> {
    Arc::new(LabelTable::parse("amecro,Corvus brachyrhynchos,American Crow\n").unwrap())
}

fn active(sources: &[&str]) -> Arc<RwLock<HashSet<String>>> {
    Arc::new(RwLock::new(sources.iter().map(|s| s.to_string()).collect()))
}

fn filter_settings(coalesce_secs: u64, pre_roll: f32, post_roll: f32) -> FilterSettings {
    let mut cfg = Config::default();
    cfg.analysis.threshold = 0.8;
    cfg.filters.dedup_secs = coalesce_secs;
    cfg.clips.pre_roll_secs = pre_roll;
    cfg.clips.post_roll_secs = post_roll;
    FilterSettings::from_config(&cfg, 1)
}

/// Feed `secs` of audio through dispatcher, ring, pool and filter; return
/// everything the filter emitted.
fn run_pipeline(
    secs: usize,
    pairs: Vec<Prediction>,
    coalesce_secs: u64,
    calls: Arc<AtomicUsize>,
    ring: Option<&ClipRing>,
) -> Vec<FilterOutput> {
    let metrics = Metrics::new();
    let queue = Arc::new(WindowQueue::new(1024));
    let (pred_tx, pred_rx) = mpsc::sync_channel::<RawPrediction>(1024);
    let provider: Arc<dyn ClassifierProvider> = Arc::new(FixedProvider { pairs, calls });
    let pool = ClassifierPool::start(1, &provider, &queue, pred_tx, &metrics).unwrap();

    let mut dispatcher = WindowDispatcher::new("yard", 0.0, Arc::clone(&queue), &metrics);
    let mut clock = FrameClock::start();
    for _ in 0..(secs * SAMPLE_RATE as usize / FRAME_SAMPLES) {
        let frame = clock.stamp("yard", vec![0.0; FRAME_SAMPLES]);
        if let Some(ring) = ring {
            ring.push(&frame.samples);
        }
        dispatcher.push_frame(frame);
    }
    queue.close();
    pool.join();

    let mut chain = FilterChain::new(
        filter_settings(coalesce_secs, 1.0, 1.0),
        test_labels(),
        None,
        active(&["yard"]),
        &metrics,
    );
    let mut outputs = Vec::new();
    while let Ok(p) = pred_rx.try_recv() {
        outputs.extend(chain.process(p));
    }
    outputs.extend(chain.flush());
    outputs
}

fn detections(outputs: &[FilterOutput]) -> Vec<&skylark::detection::Detection> {
    outputs
        .iter()
        .filter_map(|o| match o {
            FilterOutput::Detection(d) => Some(d),
            _ => None,
        })
        .collect()
}

#[test]
fn silent_stream_yields_no_detections_and_exact_window_count() {
    let calls = Arc::new(AtomicUsize::new(0));
    let outputs = run_pipeline(60, Vec::new(), 10, Arc::clone(&calls), None);
    assert!(detections(&outputs).is_empty());
    // floor((60 - 3) / 3) + 1 windows at zero overlap.
    assert_eq!(calls.load(Ordering::SeqCst), 20);
}

#[test]
fn strong_detection_is_coalesced_persisted_and_clipped() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Datastore> =
        Arc::new(JsonlStore::open(&dir.path().join("detections.jsonl")).unwrap());
    let dead = Arc::new(Deadletter::new(&dir.path().join("dead.jsonl")));
    let metrics = Metrics::new();
    let registry = RingRegistry::new();

    let calls = Arc::new(AtomicUsize::new(0));
    let metrics_run = Metrics::new();
    let queue = Arc::new(WindowQueue::new(1024));
    let (pred_tx, pred_rx) = mpsc::sync_channel::<RawPrediction>(1024);
    let provider: Arc<dyn ClassifierProvider> = Arc::new(FixedProvider {
        pairs: vec![("amecro".to_string(), 0.95)],
        calls: Arc::clone(&calls),
    });
    let pool = ClassifierPool::start(1, &provider, &queue, pred_tx, &metrics_run).unwrap();

    let mut dispatcher = WindowDispatcher::new("yard", 0.0, Arc::clone(&queue), &metrics_run);
    let mut clock = FrameClock::start();
    let ring = Arc::new(ClipRing::new("yard", 30, clock.start_wall()));
    registry.register(Arc::clone(&ring));
    for _ in 0..(20 * SAMPLE_RATE as usize / FRAME_SAMPLES) {
        let frame = clock.stamp("yard", vec![0.0; FRAME_SAMPLES]);
        ring.push(&frame.samples);
        dispatcher.push_frame(frame);
    }
    queue.close();
    pool.join();

    let mut chain = FilterChain::new(
        filter_settings(10, 1.0, 1.0),
        test_labels(),
        None,
        active(&["yard"]),
        &metrics,
    );
    let (router_tx, router_rx) = mpsc::sync_channel(256);
    let router = DetectionRouter::start(
        RouterSettings {
            clip_root: dir.path().join("clips"),
            gain_db: 0.0,
            persist_retries: 3,
            burst_threshold: 1000,
        },
        Arc::clone(&store),
        registry,
        Vec::new(),
        8,
        Arc::clone(&dead),
        router_rx,
        None,
        Shutdown::new(),
        metrics.clone(),
    );

    let mut forwarded = 0usize;
    while let Ok(p) = pred_rx.try_recv() {
        for out in chain.process(p) {
            router_tx.send(out).unwrap();
            forwarded += 1;
        }
    }
    for out in chain.flush() {
        router_tx.send(out).unwrap();
        forwarded += 1;
    }
    assert!(forwarded > 0);
    drop(router_tx);
    router.stop(Duration::from_secs(30));

    // 20 s of constant 0.95 crow at coalesce 10 s: windows start at 0, 3, ...
    // 15; accepted at 0 and 12, the rest coalesced.
    let rows = store.query_detections(&DetectionQuery::default()).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.detection.scientific_name == "Corvus brachyrhynchos"));
    assert!(rows.iter().all(|r| (r.detection.confidence - 0.95).abs() < 1e-6));
    assert_eq!(metrics.counter_value("filter", "dedup-dropped") as usize, 4);
    assert!(dead.read_all().unwrap().is_empty());

    // The second detection's clip covers pre-roll + window + post-roll; the
    // first is a second short because its pre-roll predates the stream.
    let with_clips: Vec<_> =
        rows.iter().filter_map(|r| r.detection.clip.path().cloned()).collect();
    assert_eq!(with_clips.len(), 2);
    let pcm = skylark::audio::decode::decode_wav(with_clips.last().unwrap()).unwrap();
    assert_eq!(pcm.len(), 5 * SAMPLE_RATE as usize);
}

#[test]
fn privacy_suppression_blocks_detections_and_clips() {
    let metrics = Metrics::new();
    let mut cfg = Config::default();
    cfg.analysis.threshold = 0.8;
    cfg.filters.privacy.enabled = true;
    cfg.filters.privacy.threshold = 0.7;
    let settings = FilterSettings::from_config(&cfg, 1);
    let labels = Arc::new(
        LabelTable::parse(
            "amecro,Corvus brachyrhynchos,American Crow\nhuman-voice,Homo sapiens,Human\n",
        )
        .unwrap(),
    );
    let mut chain = FilterChain::new(settings, labels, None, active(&["yard"]), &metrics);
    let mut outputs = chain.process(RawPrediction {
        source: "yard".to_string(),
        window_start: Utc::now(),
        window_mono: Duration::ZERO,
        window_index: 0,
        pairs: vec![("human-voice".to_string(), 0.9), ("amecro".to_string(), 0.85)],
    });
    outputs.extend(chain.flush());
    assert!(detections(&outputs).is_empty());
    assert_eq!(metrics.counter_value("filter", "privacy-suppressed"), 1);
}

#[test]
fn expired_clip_persists_detection_with_null_handle() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Datastore> =
        Arc::new(JsonlStore::open(&dir.path().join("detections.jsonl")).unwrap());
    let dead = Arc::new(Deadletter::new(&dir.path().join("dead.jsonl")));
    let metrics = Metrics::new();

    // A 10 s ring that has advanced 30 s: the first seconds are long gone.
    let registry = RingRegistry::new();
    let epoch = Utc::now() - chrono::Duration::seconds(30);
    let ring = Arc::new(ClipRing::new("yard", 10, epoch));
    for _ in 0..(30 * SAMPLE_RATE as usize / FRAME_SAMPLES) {
        ring.push(&vec![0.1f32; FRAME_SAMPLES]);
    }
    registry.register(Arc::clone(&ring));

    let detection = skylark::detection::Detection {
        source: "yard".to_string(),
        event_time: epoch + chrono::Duration::seconds(2),
        species_code: "amecro".to_string(),
        scientific_name: "Corvus brachyrhynchos".to_string(),
        common_name: "American Crow".to_string(),
        confidence: 0.9,
        threshold: 0.8,
        latitude: None,
        longitude: None,
        clip: ClipHandle::Pending {
            start: epoch + chrono::Duration::seconds(1),
            end: epoch + chrono::Duration::seconds(6),
        },
        clip_missed: false,
        verified: None,
        comment: None,
    };

    let (tx, rx) = mpsc::sync_channel(4);
    let router = DetectionRouter::start(
        RouterSettings {
            clip_root: dir.path().join("clips"),
            gain_db: 0.0,
            persist_retries: 3,
            burst_threshold: 1000,
        },
        Arc::clone(&store),
        registry,
        Vec::new(),
        8,
        dead,
        rx,
        None,
        Shutdown::new(),
        metrics.clone(),
    );
    tx.send(FilterOutput::Detection(detection)).unwrap();
    drop(tx);
    router.stop(Duration::from_secs(10));

    let rows = store.query_detections(&DetectionQuery::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].detection.clip, ClipHandle::None);
    assert!(rows[0].detection.clip_missed);
    assert_eq!(metrics.counter_value("router", "clip-expired"), 1);
}

/// Captures delivered events for sink fan-out assertions.
struct RecordingSink {
    delivered: Arc<Mutex<Vec<Option<u64>>>>,
    fail_first: bool,
    failures: usize,
}

impl skylark::router::Sink for RecordingSink {
    fn kind(&self) -> &'static str {
        "webhook"
    }
    fn deliver(&mut self, event: &skylark::router::DetectionEvent) -> anyhow::Result<()> {
        if self.fail_first && self.failures == 0 {
            self.failures += 1;
            anyhow::bail!("first attempt fails");
        }
        self.delivered.lock().unwrap().push(event.id);
        Ok(())
    }
}

#[test]
fn sink_fanout_retries_and_delivers_with_persisted_id() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Datastore> =
        Arc::new(JsonlStore::open(&dir.path().join("detections.jsonl")).unwrap());
    let dead = Arc::new(Deadletter::new(&dir.path().join("dead.jsonl")));
    let metrics = Metrics::new();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Box::new(RecordingSink {
        delivered: Arc::clone(&delivered),
        fail_first: true,
        failures: 0,
    });

    let detection = skylark::detection::Detection {
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
    };

    let (tx, rx) = mpsc::sync_channel(4);
    let router = DetectionRouter::start(
        RouterSettings {
            clip_root: dir.path().join("clips"),
            gain_db: 0.0,
            persist_retries: 3,
            burst_threshold: 1000,
        },
        store,
        RingRegistry::new(),
        vec![sink],
        8,
        dead,
        rx,
        None,
        Shutdown::new(),
        metrics.clone(),
    );
    tx.send(FilterOutput::Detection(detection)).unwrap();
    drop(tx);
    router.stop(Duration::from_secs(10));

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1, "second attempt succeeds");
    assert_eq!(delivered[0], Some(1), "event carries the persisted row id");
    assert_eq!(metrics.counter_value("sink", "webhook"), 0, "no exhausted drops");
}
