//! Classifier worker pool.
//!
//! P workers share the window queue; each owns one classifier instance and
//! processes windows serially, reusing the instance's preallocated tensors.
//! A window whose classification fails or panics is dropped and counted,
//! never retried: the sound moment has passed.

use crate::classifier::{ClassifierProvider, RawPrediction};
use crate::metrics::Metrics;
use crate::pipeline::queue::WindowQueue;
use anyhow::{Context, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::warn;

pub struct ClassifierPool {
    workers: Vec<JoinHandle<()>>,
}

impl ClassifierPool {
    /// Spawn `count` workers. Each builds its own classifier instance up
    /// front so a bad model path fails startup instead of the first window.
    pub fn start(
        count: usize,
        provider: &Arc<dyn ClassifierProvider>,
        queue: &Arc<WindowQueue>,
        predictions: SyncSender<RawPrediction>,
        metrics: &Metrics,
    ) -> Result<ClassifierPool> {
        let mut workers = Vec::with_capacity(count);
        for worker_id in 0..count {
            let mut classifier = provider
                .create()
                .with_context(|| format!("creating classifier instance {worker_id}"))?;
            let queue = Arc::clone(queue);
            let predictions = predictions.clone();
            let metrics = metrics.clone();
            let failed = metrics.counter("classifier", "classify-failed");
            let handle = thread::Builder::new()
                .name(format!("classifier-{worker_id}"))
                .spawn(move || {
                    while let Some(window) = queue.pop() {
                        let started = Instant::now();
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            classifier.classify(&window.pcm)
                        }));
                        metrics.observe_latency(started.elapsed());
                        let pairs = match outcome {
                            Ok(Ok(pairs)) => pairs,
                            Ok(Err(e)) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                warn!(source = %window.source, error = %format!("{e:#}"), "classification failed");
                                continue;
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                warn!(source = %window.source, "classifier panicked on window");
                                continue;
                            }
                        };
                        let prediction = RawPrediction {
                            source: window.source,
                            window_start: window.start_wall,
                            window_mono: window.start_mono,
                            window_index: window.index,
                            pairs,
                        };
                        if predictions.send(prediction).is_err() {
                            return; // filter side gone, shutting down
                        }
                    }
                })
                .context("spawning classifier worker")?;
            workers.push(handle);
        }
        Ok(ClassifierPool { workers })
    }

    /// Wait for all workers to finish. Call after closing the window queue.
    pub fn join(self) {
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}
