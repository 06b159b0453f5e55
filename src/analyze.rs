//! Offline analysis: run the classifier and filter chain over files.
//!
//! Shares the realtime pipeline's windowing arithmetic and filter policy;
//! only the transport differs: windows come from a decoded file instead of
//! a live stream, and detections are printed instead of routed.

use crate::audio::{decode::decode_file, samples_to_duration, WINDOW_SAMPLES};
use crate::classifier::labels::{load_codes, LabelTable};
use crate::classifier::onnx::OnnxProvider;
use crate::classifier::range::RangeModel;
use crate::classifier::{Classifier, ClassifierProvider, RawPrediction};
use crate::config::Config;
use crate::filter::{FilterChain, FilterOutput, FilterSettings};
use crate::metrics::Metrics;
use crate::pipeline::dispatcher::stride_samples;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Analyze one audio file and print its detections. Returns the count.
pub fn analyze_file(cfg: &Config, path: &Path) -> Result<usize> {
    let mut session = AnalysisSession::open(cfg)?;
    let count = session.run(path)?;
    if count == 0 {
        println!("{}: no detections", path.display());
    }
    Ok(count)
}

/// Recursively analyze every audio file under `dir`.
pub fn analyze_dir(cfg: &Config, dir: &Path) -> Result<usize> {
    let mut files = Vec::new();
    collect_audio_files(dir, &mut files)
        .with_context(|| format!("walking {}", dir.display()))?;
    files.sort();
    info!(files = files.len(), "analyzing directory {}", dir.display());

    let mut session = AnalysisSession::open(cfg)?;
    let mut total = 0usize;
    for file in files {
        match session.run(&file) {
            Ok(count) => total += count,
            Err(e) => eprintln!("warn: skipping {}: {e:#}", file.display()),
        }
    }
    Ok(total)
}

/// Print the species set the current range filter admits today.
pub fn range_print(cfg: &Config) -> Result<()> {
    if !cfg.filters.range.enabled {
        println!("range filter disabled; all species admitted");
        return Ok(());
    }
    let model = RangeModel::load(
        &cfg.filters.range.table,
        cfg.filters.range.variant,
        cfg.filters.range.floor,
    )?;
    let labels = LabelTable::load(&cfg.analysis.labels_dir, &cfg.analysis.locale)?;
    let today = Utc::now();
    let admitted = model.admitted(today);
    println!(
        "{} species admitted on {} (floor {:.2}):",
        admitted.len(),
        today.format("%Y-%m-%d"),
        cfg.filters.range.floor
    );
    for (code, score) in admitted {
        match labels.resolve(code) {
            Some(label) => {
                println!("  {score:.2}  {}  ({})", label.common, label.scientific)
            }
            None => println!("  {score:.2}  {code}"),
        }
    }
    Ok(())
}

const AUDIO_EXTENSIONS: &[&str] = &["wav", "flac", "mp3", "ogg", "opus", "m4a", "aac", "wma"];

fn collect_audio_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_audio_files(&path, out)?;
        } else if path
            .extension()
            .map(|e| AUDIO_EXTENSIONS.iter().any(|a| e.eq_ignore_ascii_case(a)))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}

/// One classifier instance plus a fresh filter chain per file.
struct AnalysisSession {
    classifier: Box<dyn Classifier>,
    settings: FilterSettings,
    labels: Arc<LabelTable>,
    range: Option<Arc<RangeModel>>,
    metrics: Metrics,
    stride: usize,
}

impl AnalysisSession {
    fn open(cfg: &Config) -> Result<AnalysisSession> {
        let labels = Arc::new(LabelTable::load(&cfg.analysis.labels_dir, &cfg.analysis.locale)?);
        let range = if cfg.filters.range.enabled {
            Some(Arc::new(RangeModel::load(
                &cfg.filters.range.table,
                cfg.filters.range.variant,
                cfg.filters.range.floor,
            )?))
        } else {
            None
        };
        let codes = load_codes(&cfg.analysis.labels_dir)?;
        let provider = OnnxProvider::new(&cfg.analysis.model, codes, cfg.analysis.top_k);
        Ok(AnalysisSession {
            classifier: provider.create()?,
            settings: FilterSettings::from_config(cfg, 1),
            labels,
            range,
            metrics: Metrics::new(),
            stride: stride_samples(cfg.analysis.overlap),
        })
    }

    fn run(&mut self, path: &Path) -> Result<usize> {
        let pcm = decode_file(path)?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let active: Arc<RwLock<HashSet<String>>> =
            Arc::new(RwLock::new([source.clone()].into_iter().collect()));
        let mut chain = FilterChain::new(
            self.settings.clone(),
            Arc::clone(&self.labels),
            self.range.clone(),
            active,
            &self.metrics,
        );

        let epoch = Utc::now();
        let mut outputs = Vec::new();
        let mut offset = 0usize;
        let mut index = 0u64;
        while offset + WINDOW_SAMPLES <= pcm.len() {
            let window = &pcm[offset..offset + WINDOW_SAMPLES];
            let mono = samples_to_duration(offset as u64);
            let pairs = self.classifier.classify(window)?;
            outputs.extend(chain.process(RawPrediction {
                source: source.clone(),
                window_start: epoch
                    + chrono::Duration::from_std(mono).unwrap_or_else(|_| chrono::Duration::zero()),
                window_mono: mono,
                window_index: index,
                pairs,
            }));
            offset += self.stride;
            index += 1;
        }
        outputs.extend(chain.flush());

        let mut count = 0usize;
        for output in outputs {
            if let FilterOutput::Detection(d) = output {
                count += 1;
                let at = (d.event_time - epoch)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();
                println!(
                    "{}  {:>8.1}s  {:<28} ({})  {:.2}",
                    path.display(),
                    at,
                    d.common_name,
                    d.scientific_name,
                    d.confidence
                );
            }
        }
        Ok(count)
    }
}
