//! Supervisor: global lifecycle, hot reload, shutdown coordination.
//!
//! Startup wires the pipeline back to front (store, classifier pool, filter,
//! router, retention, then sources) so every consumer exists before its
//! producer starts. Reload diffs the new config against the running
//! snapshot: sources and filter policy apply hot, everything else logs a
//! restart requirement. Shutdown walks the reverse order under a fixed
//! budget.

use crate::audio::ring::RingRegistry;
use crate::classifier::labels::{load_codes, LabelTable};
use crate::classifier::onnx::OnnxProvider;
use crate::classifier::range::RangeModel;
use crate::classifier::{ClassifierProvider, RawPrediction};
use crate::config::{config_root, Config, PROFILE_ENV};
use crate::error::Error;
use crate::filter::{FilterChain, FilterOutput, FilterSettings};
use crate::metrics::Metrics;
use crate::pipeline::pool::ClassifierPool;
use crate::pipeline::queue::WindowQueue;
use crate::pipeline::source::SourceManager;
use crate::retention::{RetentionManager, SystemDiskUsage};
use crate::router::deadletter::Deadletter;
use crate::router::{
    aggregator::AggregatorSink, mqtt::MqttSink, webhook::WebhookSink, DetectionRouter,
    RouterSettings, Sink,
};
use crate::shutdown::Shutdown;
use crate::store::{jsonl::JsonlStore, Datastore};
use anyhow::{Context, Result};
use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Total budget for the ordered shutdown walk.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);
/// How long the dispatcher side gets to drain in-flight frames.
const CAPTURE_DRAIN: Duration = Duration::from_secs(5);

/// Run the realtime pipeline until a signal arrives.
///
/// Returns the process exit code: 0 for a clean internal stop, 130 when a
/// signal initiated the shutdown.
pub fn run(mut cfg: Config) -> Result<i32> {
    let metrics = Metrics::new();
    let shutdown = Shutdown::new();
    let signalled = Arc::new(AtomicBool::new(false));

    {
        let shutdown = shutdown.clone();
        let signalled = Arc::clone(&signalled);
        ctrlc::set_handler(move || {
            info!("signal received, shutting down");
            signalled.store(true, Ordering::SeqCst);
            shutdown.trigger();
        })
        .context("installing signal handler")?;
    }

    // Datastore first: everything downstream of the filter needs it.
    let store: Arc<dyn Datastore> =
        Arc::new(JsonlStore::open(&cfg.store.path).context("opening datastore")?);

    // Static tables. A broken label table is a configuration fault.
    let labels = Arc::new(
        LabelTable::load(&cfg.analysis.labels_dir, &cfg.analysis.locale).map_err(|e| {
            Error::Config { field: "analysis.labels_dir".into(), message: format!("{e:#}") }
        })?,
    );
    let range = load_range_model(&cfg)?;

    // Classifier pool.
    let codes = load_codes(&cfg.analysis.labels_dir).map_err(|e| Error::Config {
        field: "analysis.labels_dir".into(),
        message: format!("{e:#}"),
    })?;
    let provider: Arc<dyn ClassifierProvider> =
        Arc::new(OnnxProvider::new(&cfg.analysis.model, codes, cfg.analysis.top_k));
    let workers = cfg.classifier_workers();
    let window_queue = Arc::new(WindowQueue::new(cfg.analysis.queue_depth));
    let (prediction_tx, prediction_rx) = mpsc::sync_channel::<RawPrediction>(256);
    let pool = ClassifierPool::start(workers, &provider, &window_queue, prediction_tx, &metrics)
        .context("starting classifier pool")?;

    // Retention.
    let (burst_tx, burst_rx) = mpsc::sync_channel::<()>(1);
    let retention = RetentionManager::start(
        cfg.retention.clone(),
        cfg.clips.root.clone(),
        Arc::clone(&store),
        Box::new(SystemDiskUsage),
        burst_rx,
        shutdown.clone(),
        metrics.clone(),
    );

    // Router and sinks.
    let rings = RingRegistry::new();
    let dead = Arc::new(Deadletter::new(&cfg.store.deadletter));
    let (router_tx, router_rx) = mpsc::sync_channel::<FilterOutput>(256);
    let router = DetectionRouter::start(
        RouterSettings {
            clip_root: cfg.clips.root.clone(),
            gain_db: cfg.clips.gain_db,
            persist_retries: cfg.store.retries,
            burst_threshold: cfg.retention.burst_threshold,
        },
        Arc::clone(&store),
        rings.clone(),
        build_sinks(&cfg),
        cfg.sinks.queue_depth,
        dead,
        router_rx,
        Some(burst_tx),
        shutdown.clone(),
        metrics.clone(),
    );

    // Source manager, then the filter thread between pool and router.
    let source_manager = Arc::new(SourceManager::new(
        rings,
        Arc::clone(&window_queue),
        metrics.clone(),
        cfg.analysis.overlap,
        cfg.clips.ring_secs,
    ));
    let mut chain = FilterChain::new(
        FilterSettings::from_config(&cfg, workers),
        labels,
        range,
        source_manager.active_sources(),
        &metrics,
    );
    let state_path = cfg.filters.persist_state.then(|| config_root().join("filter-state.json"));
    if let Some(path) = &state_path {
        if path.exists() {
            match chain.load_state(path) {
                Ok(()) => info!("restored filter state from {}", path.display()),
                Err(e) => warn!(error = %format!("{e:#}"), "ignoring saved filter state"),
            }
        }
    }
    let (settings_tx, settings_rx) = mpsc::channel::<FilterSettings>();
    let filter_thread = spawn_filter_thread(chain, prediction_rx, settings_rx, router_tx, state_path);

    source_manager.reconcile(&cfg.enabled_sources());

    // Config watcher for hot reload.
    let (reload_tx, reload_rx) = mpsc::channel::<()>();
    let _watcher = cfg.config_file_path.clone().and_then(|path| {
        start_config_watcher(&path, reload_tx)
            .map_err(|e| warn!(error = %format!("{e:#}"), "config watcher unavailable"))
            .ok()
    });

    info!(
        sources = cfg.sources.len(),
        workers,
        overlap = cfg.analysis.overlap,
        "pipeline ready"
    );

    // Steady state: service reloads, log health periodically.
    let profiling = std::env::var(PROFILE_ENV).is_ok();
    let health_every = if profiling { Duration::from_secs(10) } else { Duration::from_secs(60) };
    let mut last_health = std::time::Instant::now();
    while !shutdown.is_triggered() {
        match reload_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) => reload(&mut cfg, &source_manager, &settings_tx, workers),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                shutdown.wait_timeout(health_every);
            }
        }
        if last_health.elapsed() >= health_every {
            last_health = std::time::Instant::now();
            log_health(&source_manager, &window_queue, &metrics, profiling);
        }
    }

    // Ordered teardown under one budget.
    let teardown_started = std::time::Instant::now();
    info!("stopping capture");
    source_manager.stop_all(CAPTURE_DRAIN);
    info!("closing analysis queue");
    window_queue.close();
    pool.join();
    // The pool dropped its prediction senders; the filter thread drains,
    // flushes its hold-back buffer and exits, dropping the router sender.
    let _ = filter_thread.join();
    let remaining = SHUTDOWN_BUDGET.saturating_sub(teardown_started.elapsed());
    info!("flushing detection router");
    router.stop(remaining);
    if teardown_started.elapsed() >= SHUTDOWN_BUDGET {
        // Budget expired: skip the remaining joins and let process exit
        // reap whatever is still wedged.
        warn!("shutdown budget exceeded, force-exiting");
    } else {
        retention.stop();
    }
    if let Err(e) = store.close() {
        warn!(error = %e, "datastore close failed");
    }
    let report = metrics.render();
    if !report.is_empty() {
        info!("final counters:\n{report}");
    }

    Ok(if signalled.load(Ordering::SeqCst) { 130 } else { 0 })
}

fn load_range_model(cfg: &Config) -> Result<Option<Arc<RangeModel>>, Error> {
    if !cfg.filters.range.enabled {
        return Ok(None);
    }
    RangeModel::load(&cfg.filters.range.table, cfg.filters.range.variant, cfg.filters.range.floor)
        .map(|m| Some(Arc::new(m)))
        .map_err(|e| Error::Config { field: "filters.range.table".into(), message: format!("{e:#}") })
}

fn build_sinks(cfg: &Config) -> Vec<Box<dyn Sink>> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    if cfg.sinks.mqtt.enabled {
        match MqttSink::connect(&cfg.sinks.mqtt) {
            Ok(sink) => sinks.push(Box::new(sink)),
            Err(e) => error!(error = %format!("{e:#}"), "mqtt sink unavailable"),
        }
    }
    for webhook in &cfg.sinks.webhooks {
        match WebhookSink::new(webhook) {
            Ok(sink) => sinks.push(Box::new(sink)),
            Err(e) => error!(url = %webhook.url, error = %format!("{e:#}"), "webhook sink unavailable"),
        }
    }
    if cfg.sinks.aggregator.enabled {
        match AggregatorSink::new(&cfg.sinks.aggregator) {
            Ok(sink) => sinks.push(Box::new(sink)),
            Err(e) => error!(error = %format!("{e:#}"), "aggregator sink unavailable"),
        }
    }
    sinks
}

/// The filter thread: predictions in window order per source come from the
/// pool; detections and confidence updates go to the router. Settings
/// arriving on the side channel replace the chain policy between windows.
fn spawn_filter_thread(
    mut chain: FilterChain,
    predictions: Receiver<RawPrediction>,
    settings: Receiver<FilterSettings>,
    router_tx: SyncSender<FilterOutput>,
    state_path: Option<PathBuf>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("filter-chain".to_string())
        .spawn(move || {
            loop {
                while let Ok(new_settings) = settings.try_recv() {
                    info!("filter policy updated");
                    chain.apply_settings(new_settings);
                }
                match predictions.recv_timeout(Duration::from_millis(200)) {
                    Ok(prediction) => {
                        for output in chain.process(prediction) {
                            if router_tx.send(output).is_err() {
                                return;
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            for output in chain.flush() {
                let _ = router_tx.send(output);
            }
            if let Some(path) = state_path {
                match chain.save_state(&path) {
                    Ok(()) => info!("filter state saved to {}", path.display()),
                    Err(e) => warn!(error = %format!("{e:#}"), "filter state save failed"),
                }
            }
        })
        .expect("spawning filter thread")
}

fn start_config_watcher(
    path: &Path,
    reload_tx: mpsc::Sender<()>,
) -> Result<notify_debouncer_mini::Debouncer<notify_debouncer_mini::notify::RecommendedWatcher>> {
    let watched = path.to_path_buf();
    let mut debouncer = new_debouncer(Duration::from_millis(500), move |events| {
        if let Ok(events) = events {
            let _ = events; // any event on the file is a reload request
            let _ = reload_tx.send(());
        }
    })
    .context("creating config watcher")?;
    // Watch the parent so editors that replace the file are still seen.
    let target = watched.parent().unwrap_or(&watched);
    debouncer
        .watcher()
        .watch(target, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", target.display()))?;
    info!(path = %watched.display(), "watching config for changes");
    Ok(debouncer)
}

/// Apply a config file change to the running pipeline.
fn reload(
    cfg: &mut Config,
    source_manager: &SourceManager,
    settings_tx: &mpsc::Sender<FilterSettings>,
    workers: usize,
) {
    let Some(path) = cfg.config_file_path.clone() else { return };
    let fresh = match Config::load_from(&path) {
        Ok(fresh) => fresh,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "reload: config unreadable, keeping current");
            return;
        }
    };
    if let Err(e) = fresh.validate() {
        warn!("reload rejected: {e}");
        return;
    }

    if fresh.analysis.overlap != cfg.analysis.overlap
        || fresh.analysis.workers != cfg.analysis.workers
        || fresh.analysis.model != cfg.analysis.model
        || fresh.analysis.labels_dir != cfg.analysis.labels_dir
        || fresh.analysis.locale != cfg.analysis.locale
    {
        warn!("reload: analysis settings changed; restart required to apply");
    }
    if fresh.store != cfg.store || fresh.sinks != cfg.sinks || fresh.retention != cfg.retention {
        warn!("reload: store/sink/retention settings changed; restart required to apply");
    }

    if fresh.sources != cfg.sources {
        info!("reload: reconciling sources");
        source_manager.reconcile(&fresh.enabled_sources());
    }
    if fresh.filters != cfg.filters
        || fresh.analysis.threshold != cfg.analysis.threshold
        || fresh.latitude != cfg.latitude
        || fresh.longitude != cfg.longitude
    {
        info!("reload: applying filter policy");
        let _ = settings_tx.send(FilterSettings::from_config(&fresh, workers));
    }

    let kept_path = cfg.config_file_path.clone();
    *cfg = fresh;
    cfg.config_file_path = kept_path;
}

fn log_health(
    source_manager: &SourceManager,
    window_queue: &WindowQueue,
    metrics: &Metrics,
    verbose: bool,
) {
    let health = source_manager.health();
    let summary: Vec<String> =
        health.iter().map(|(id, state)| format!("{id}={state}")).collect();
    let latency = metrics.latency_snapshot();
    info!(
        sources = %summary.join(" "),
        queue_depth = window_queue.depth(),
        window_dropped = metrics.counter_value("dispatcher", "window-dropped"),
        classify_p99_ms = latency.p99.as_secs_f64() * 1000.0,
        "health"
    );
    if verbose {
        let report = metrics.render();
        if !report.is_empty() {
            info!("counters:\n{report}");
        }
    }
}
