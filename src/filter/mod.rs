//! The filter chain: raw predictions in, detections out.
//!
//! Stages run in a fixed order: confidence threshold, label resolution,
//! allow/deny lists, range filter, privacy suppression, dog-bark
//! suppression, per-species dedup, clip-time alignment. A rejection at any
//! stage is a normal outcome, not an error. Because the classifier pool
//! completes windows out of order, a small per-source hold-back buffer
//! restores window order before dedup sees anything.
//!
//! Dedup and bark timelines run on window wall time, which is derived from
//! each stream's monotonic clock and therefore never jumps within a stream.

use crate::audio::{SourceId, WINDOW_SECS};
use crate::classifier::labels::LabelTable;
use crate::classifier::range::RangeModel;
use crate::classifier::RawPrediction;
use crate::config::Config;
use crate::detection::{ClipHandle, Detection};
use crate::metrics::{Counter, Metrics};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// What the chain hands to the detection router.
#[derive(Debug, Clone)]
pub enum FilterOutput {
    Detection(Detection),
    /// A coalesced duplicate raised the kept detection's confidence; the
    /// stored row is updated to the maximum observed.
    ConfidenceUpdate { source: SourceId, scientific_name: String, confidence: f32 },
}

/// Chain policy derived from configuration; rebuilt wholesale on reload.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub threshold: f32,
    /// Lowercased scientific names. Empty allow set admits everything.
    pub allow: HashSet<String>,
    pub deny: HashSet<String>,
    pub coalesce: Duration,
    pub privacy_enabled: bool,
    pub privacy_threshold: f32,
    pub privacy_codes: HashSet<String>,
    pub privacy_sources: HashSet<String>,
    pub bark_enabled: bool,
    pub bark_threshold: f32,
    pub bark_memory: Duration,
    pub bark_codes: HashSet<String>,
    pub bark_suppressed: HashSet<String>,
    pub bark_sources: HashSet<String>,
    pub pre_roll: Duration,
    pub post_roll: Duration,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Out-of-orderness bound: predictions held per source before dedup.
    /// The pool cannot reorder further than its worker count.
    pub lookback_windows: usize,
}

impl FilterSettings {
    pub fn from_config(cfg: &Config, pool_workers: usize) -> FilterSettings {
        let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect::<HashSet<_>>();
        let f = &cfg.filters;
        FilterSettings {
            threshold: cfg.analysis.threshold,
            allow: lower(&f.allow),
            deny: lower(&f.deny),
            coalesce: Duration::from_secs(f.dedup_secs),
            privacy_enabled: f.privacy.enabled,
            privacy_threshold: f.privacy.threshold,
            privacy_codes: f.privacy.codes.iter().cloned().collect(),
            privacy_sources: f.privacy.sources.iter().cloned().collect(),
            bark_enabled: f.dog_bark.enabled,
            bark_threshold: f.dog_bark.threshold,
            bark_memory: Duration::from_secs(f.dog_bark.memory_secs),
            bark_codes: f.dog_bark.codes.iter().cloned().collect(),
            bark_suppressed: f.dog_bark.suppressed.iter().cloned().collect(),
            bark_sources: f.dog_bark.sources.iter().cloned().collect(),
            pre_roll: Duration::from_secs_f32(cfg.clips.pre_roll_secs),
            post_roll: Duration::from_secs_f32(cfg.clips.post_roll_secs),
            latitude: cfg.latitude,
            longitude: cfg.longitude,
            lookback_windows: pool_workers.max(1),
        }
    }
}

/// Dedup state for one (source, species): the cooling side of the
/// idle -> cooling(until) -> idle machine, plus the best confidence seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Cooling {
    last_emit: DateTime<Utc>,
    confidence: f32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FilterStateSnapshot {
    cooling: Vec<(SourceId, String, Cooling)>,
    bark_until: Vec<(SourceId, DateTime<Utc>)>,
}

pub struct FilterChain {
    settings: FilterSettings,
    labels: Arc<LabelTable>,
    range: Option<Arc<RangeModel>>,
    active_sources: Arc<RwLock<HashSet<SourceId>>>,
    /// Hold-back: per source, predictions keyed by window index.
    pending: HashMap<SourceId, BTreeMap<u64, RawPrediction>>,
    cooling: HashMap<(SourceId, String), Cooling>,
    bark_until: HashMap<SourceId, DateTime<Utc>>,

    dedup_dropped: Counter,
    privacy_suppressed: Counter,
    bark_suppressed: Counter,
    range_rejected: Counter,
    list_rejected: Counter,
    unknown_code: Counter,
    stale_source: Counter,
}

impl FilterChain {
    pub fn new(
        settings: FilterSettings,
        labels: Arc<LabelTable>,
        range: Option<Arc<RangeModel>>,
        active_sources: Arc<RwLock<HashSet<SourceId>>>,
        metrics: &Metrics,
    ) -> FilterChain {
        FilterChain {
            settings,
            labels,
            range,
            active_sources,
            pending: HashMap::new(),
            cooling: HashMap::new(),
            bark_until: HashMap::new(),
            dedup_dropped: metrics.counter("filter", "dedup-dropped"),
            privacy_suppressed: metrics.counter("filter", "privacy-suppressed"),
            bark_suppressed: metrics.counter("filter", "bark-suppressed"),
            range_rejected: metrics.counter("filter", "range-rejected"),
            list_rejected: metrics.counter("filter", "list-rejected"),
            unknown_code: metrics.counter("filter", "unknown-code"),
            stale_source: metrics.counter("filter", "stale-source"),
        }
    }

    /// Replace the policy on configuration reload. In-flight hold-back and
    /// dedup state survive; only the rules change.
    pub fn apply_settings(&mut self, settings: FilterSettings) {
        self.settings = settings;
    }

    /// Ingest one raw prediction; returns whatever became ready to emit.
    pub fn process(&mut self, prediction: RawPrediction) -> Vec<FilterOutput> {
        // Predictions from a source that was removed mid-classification are
        // discarded cleanly here.
        if !self.active_sources.read().unwrap().contains(&prediction.source) {
            self.stale_source.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }

        let source = prediction.source.clone();
        let buffer = self.pending.entry(source.clone()).or_default();
        buffer.insert(prediction.window_index, prediction);

        // Release in window order once the hold-back bound is exceeded.
        let mut outputs = Vec::new();
        while self
            .pending
            .get(&source)
            .map(|b| b.len() > self.settings.lookback_windows)
            .unwrap_or(false)
        {
            let buffer = self.pending.get_mut(&source).unwrap();
            let (_, prediction) = buffer.pop_first().expect("buffer non-empty");
            outputs.extend(self.evaluate(prediction));
        }
        outputs
    }

    /// Drain every held prediction, in order. Used at shutdown and by the
    /// offline analyzers.
    pub fn flush(&mut self) -> Vec<FilterOutput> {
        let mut outputs = Vec::new();
        let sources: Vec<SourceId> = self.pending.keys().cloned().collect();
        for source in sources {
            let buffer = self.pending.remove(&source).unwrap_or_default();
            for (_, prediction) in buffer {
                outputs.extend(self.evaluate(prediction));
            }
        }
        outputs
    }

    /// Run the staged policy over one window's prediction.
    fn evaluate(&mut self, prediction: RawPrediction) -> Vec<FilterOutput> {
        let settings = &self.settings;
        let source = &prediction.source;
        let at = prediction.window_start;

        // Bark state is bookkeeping, not a rejection: a bark loud enough to
        // matter is recorded even when nothing in this window survives the
        // confidence threshold.
        let applies = |set: &HashSet<String>| set.is_empty() || set.contains(source);
        if settings.bark_enabled && applies(&settings.bark_sources) {
            let barked = prediction
                .pairs
                .iter()
                .any(|(code, conf)| settings.bark_codes.contains(code) && *conf >= settings.bark_threshold);
            if barked {
                let until = at
                    + chrono::Duration::from_std(settings.bark_memory)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                let entry = self.bark_until.entry(source.clone()).or_insert(until);
                if until > *entry {
                    *entry = until;
                }
            }
        }

        // Stage 1: confidence threshold.
        let survivors: Vec<&(String, f32)> = prediction
            .pairs
            .iter()
            .filter(|(_, conf)| *conf >= settings.threshold)
            .collect();
        if survivors.is_empty() {
            return Vec::new();
        }

        // Stages 2-4 winnow the survivor list per species.
        let mut resolved = Vec::new();
        for (code, conf) in survivors {
            // Stage 2: label resolution.
            let Some(label) = self.labels.resolve(code) else {
                self.unknown_code.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let sci_lower = label.scientific.to_lowercase();

            // Stage 3: allow/deny lists, case-insensitive on scientific name.
            if !settings.allow.is_empty() && !settings.allow.contains(&sci_lower) {
                self.list_rejected.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if settings.deny.contains(&sci_lower) {
                self.list_rejected.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            // Stage 4: range plausibility at (location, date).
            if let Some(range) = &self.range {
                if !range.admits(code, at) {
                    self.range_rejected.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            resolved.push((code.clone(), label.clone(), *conf));
        }
        if resolved.is_empty() {
            return Vec::new();
        }

        // Stage 5: privacy. The *top* raw prediction decides; when it is a
        // human-voice category the whole window's downstream effects are
        // suppressed, clip export included.
        if settings.privacy_enabled && applies(&settings.privacy_sources) {
            if let Some((top_code, top_conf)) = prediction.pairs.first() {
                if settings.privacy_codes.contains(top_code) && *top_conf >= settings.privacy_threshold {
                    self.privacy_suppressed.fetch_add(1, Ordering::Relaxed);
                    return Vec::new();
                }
            }
        }

        // Stage 6: dog-bark suppression window.
        if settings.bark_enabled && applies(&settings.bark_sources) {
            if let Some(until) = self.bark_until.get(source) {
                if at < *until {
                    let before = resolved.len();
                    resolved.retain(|(code, _, _)| !settings.bark_suppressed.contains(code));
                    let removed = before - resolved.len();
                    if removed > 0 {
                        self.bark_suppressed.fetch_add(removed as u64, Ordering::Relaxed);
                    }
                }
            }
        }

        // Stages 7-8: per-species dedup, then clip-time alignment.
        let coalesce = chrono::Duration::from_std(settings.coalesce)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut outputs = Vec::new();
        for (code, label, confidence) in resolved {
            let key = (source.clone(), label.scientific.clone());
            if let Some(cooling) = self.cooling.get_mut(&key) {
                let delta = at - cooling.last_emit;
                if delta >= chrono::Duration::zero() && delta < coalesce {
                    // Within the coalesce interval: drop, but carry the best
                    // confidence onto the kept detection.
                    self.dedup_dropped.fetch_add(1, Ordering::Relaxed);
                    if confidence > cooling.confidence {
                        cooling.confidence = confidence;
                        outputs.push(FilterOutput::ConfidenceUpdate {
                            source: source.clone(),
                            scientific_name: label.scientific.clone(),
                            confidence,
                        });
                    }
                    continue;
                }
            }
            self.cooling.insert(key, Cooling { last_emit: at, confidence });

            let start = at
                - chrono::Duration::from_std(settings.pre_roll)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let end = at
                + chrono::Duration::seconds(i64::from(WINDOW_SECS))
                + chrono::Duration::from_std(settings.post_roll)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            outputs.push(FilterOutput::Detection(Detection {
                source: source.clone(),
                event_time: at,
                species_code: code,
                scientific_name: label.scientific,
                common_name: label.common,
                confidence,
                threshold: settings.threshold,
                latitude: settings.latitude,
                longitude: settings.longitude,
                clip: ClipHandle::Pending { start, end },
                clip_missed: false,
                verified: None,
                comment: None,
            }));
        }

        // Keep the dedup map from growing without bound on long runs.
        if self.cooling.len() > 4096 {
            let horizon = at - coalesce * 4;
            self.cooling.retain(|_, c| c.last_emit > horizon);
        }
        outputs
    }

    /// Snapshot dedup and bark state for warm restart.
    pub fn save_state(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = FilterStateSnapshot {
            cooling: self
                .cooling
                .iter()
                .map(|((source, sci), c)| (source.clone(), sci.clone(), c.clone()))
                .collect(),
            bark_until: self.bark_until.iter().map(|(s, t)| (s.clone(), *t)).collect(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string(&snapshot).context("serializing filter state")?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Restore a snapshot; entries already outside the coalesce horizon are
    /// dropped on the way in.
    pub fn load_state(&mut self, path: &Path) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let snapshot: FilterStateSnapshot =
            serde_json::from_str(&text).context("parsing filter state")?;
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.settings.coalesce * 4)
                .unwrap_or_else(|_| chrono::Duration::zero());
        for (source, sci, cooling) in snapshot.cooling {
            if cooling.last_emit > horizon {
                self.cooling.insert((source, sci), cooling);
            }
        }
        for (source, until) in snapshot.bark_until {
            if until > Utc::now() {
                self.bark_until.insert(source, until);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RangeVariant;
    use std::time::Duration as StdDuration;

    fn labels() -> Arc<LabelTable> {
        Arc::new(
            LabelTable::parse(
                "amecro,Corvus brachyrhynchos,American Crow\n\
                 norcar,Cardinalis cardinalis,Northern Cardinal\n\
                 human-voice,Homo sapiens,Human\n\
                 dog,Canis familiaris,Dog\n",
            )
            .unwrap(),
        )
    }

    fn active(sources: &[&str]) -> Arc<RwLock<HashSet<SourceId>>> {
        Arc::new(RwLock::new(sources.iter().map(|s| s.to_string()).collect()))
    }

    fn settings() -> FilterSettings {
        let cfg = Config::default();
        let mut s = FilterSettings::from_config(&cfg, 1);
        s.threshold = 0.8;
        s.coalesce = StdDuration::from_secs(10);
        s.lookback_windows = 1;
        s
    }

    fn chain(settings: FilterSettings, metrics: &Metrics) -> FilterChain {
        FilterChain::new(settings, labels(), None, active(&["yard"]), metrics)
    }

    fn prediction(at_secs: f64, index: u64, pairs: Vec<(&str, f32)>) -> RawPrediction {
        let epoch = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 6, 1, 6, 0, 0).unwrap();
        RawPrediction {
            source: "yard".to_string(),
            window_start: epoch
                + chrono::Duration::milliseconds((at_secs * 1000.0) as i64),
            window_mono: StdDuration::from_secs_f64(at_secs),
            window_index: index,
            pairs: pairs.into_iter().map(|(c, v)| (c.to_string(), v)).collect(),
        }
    }

    fn run(chain: &mut FilterChain, preds: Vec<RawPrediction>) -> Vec<FilterOutput> {
        let mut out = Vec::new();
        for p in preds {
            out.extend(chain.process(p));
        }
        out.extend(chain.flush());
        out
    }

    fn detections(outputs: &[FilterOutput]) -> Vec<&Detection> {
        outputs
            .iter()
            .filter_map(|o| match o {
                FilterOutput::Detection(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn threshold_drops_weak_predictions() {
        let metrics = Metrics::new();
        let mut c = chain(settings(), &metrics);
        let out = run(&mut c, vec![prediction(0.0, 0, vec![("amecro", 0.5)])]);
        assert!(out.is_empty());
    }

    #[test]
    fn detection_carries_resolved_labels_and_clip_window() {
        let metrics = Metrics::new();
        let mut c = chain(settings(), &metrics);
        let out = run(&mut c, vec![prediction(10.0, 0, vec![("amecro", 0.95)])]);
        let dets = detections(&out);
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert_eq!(d.scientific_name, "Corvus brachyrhynchos");
        assert_eq!(d.common_name, "American Crow");
        assert_eq!(d.threshold, 0.8);
        match &d.clip {
            ClipHandle::Pending { start, end } => {
                assert_eq!((d.event_time - *start).num_seconds(), 3); // pre-roll
                assert_eq!((*end - d.event_time).num_seconds(), 6); // window + post-roll
            }
            other => panic!("expected pending clip, got {other:?}"),
        }
    }

    #[test]
    fn dedup_coalesces_burst_and_updates_confidence() {
        let metrics = Metrics::new();
        let mut c = chain(settings(), &metrics);
        let out = run(
            &mut c,
            vec![
                prediction(10.0, 0, vec![("amecro", 0.90)]),
                prediction(10.5, 1, vec![("amecro", 0.95)]),
            ],
        );
        let dets = detections(&out);
        assert_eq!(dets.len(), 1);
        assert_eq!(metrics.counter_value("filter", "dedup-dropped"), 1);
        let updates: Vec<_> = out
            .iter()
            .filter(|o| matches!(o, FilterOutput::ConfidenceUpdate { .. }))
            .collect();
        assert_eq!(updates.len(), 1, "later stronger duplicate bumps confidence");
    }

    #[test]
    fn dedup_reopens_after_coalesce_interval() {
        let metrics = Metrics::new();
        let mut c = chain(settings(), &metrics);
        let out = run(
            &mut c,
            vec![
                prediction(10.0, 0, vec![("amecro", 0.9)]),
                prediction(25.0, 1, vec![("amecro", 0.9)]),
            ],
        );
        assert_eq!(detections(&out).len(), 2);
    }

    #[test]
    fn privacy_suppresses_entire_window() {
        let metrics = Metrics::new();
        let mut s = settings();
        s.privacy_enabled = true;
        s.privacy_threshold = 0.7;
        let mut c = chain(s, &metrics);
        let out = run(
            &mut c,
            vec![prediction(0.0, 0, vec![("human-voice", 0.9), ("amecro", 0.85)])],
        );
        assert!(detections(&out).is_empty());
        assert_eq!(metrics.counter_value("filter", "privacy-suppressed"), 1);
    }

    #[test]
    fn bark_window_suppresses_configured_species() {
        let metrics = Metrics::new();
        let mut s = settings();
        s.bark_enabled = true;
        s.bark_threshold = 0.3;
        s.bark_memory = StdDuration::from_secs(15);
        s.bark_suppressed = ["norcar".to_string()].into_iter().collect();
        let mut c = chain(s, &metrics);
        let out = run(
            &mut c,
            vec![
                // The bark itself is below the global threshold; it still
                // opens the suppression window.
                prediction(0.0, 0, vec![("dog", 0.5)]),
                prediction(5.0, 1, vec![("norcar", 0.9)]),
                prediction(30.0, 2, vec![("norcar", 0.9)]),
            ],
        );
        let dets = detections(&out);
        assert_eq!(dets.len(), 1, "only the post-memory cardinal survives");
        assert_eq!(metrics.counter_value("filter", "bark-suppressed"), 1);
    }

    #[test]
    fn allow_and_deny_lists_are_case_insensitive() {
        let metrics = Metrics::new();
        let mut s = settings();
        s.deny = ["corvus brachyrhynchos".to_string()].into_iter().collect();
        let mut c = chain(s, &metrics);
        let out = run(
            &mut c,
            vec![prediction(0.0, 0, vec![("amecro", 0.9), ("norcar", 0.9)])],
        );
        let dets = detections(&out);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].species_code, "norcar");
        assert_eq!(metrics.counter_value("filter", "list-rejected"), 1);
    }

    #[test]
    fn range_filter_rejects_out_of_season() {
        let metrics = Metrics::new();
        let mut scores = HashMap::new();
        scores.insert("amecro".to_string(), vec![0.0f32; 48]); // never present
        let range = Arc::new(RangeModel::from_scores(scores, RangeVariant::Legacy, 0.05));
        let mut c =
            FilterChain::new(settings(), labels(), Some(range), active(&["yard"]), &metrics);
        let out = run(&mut c, vec![prediction(0.0, 0, vec![("amecro", 0.95)])]);
        assert!(detections(&out).is_empty());
        assert_eq!(metrics.counter_value("filter", "range-rejected"), 1);
    }

    #[test]
    fn out_of_order_windows_are_reordered_before_dedup() {
        let metrics = Metrics::new();
        let mut s = settings();
        s.lookback_windows = 2;
        let mut c = chain(s, &metrics);
        // Window 1 arrives before window 0; the first-emitted detection must
        // be the earlier window's.
        let out = run(
            &mut c,
            vec![
                prediction(10.5, 1, vec![("amecro", 0.99)]),
                prediction(10.0, 0, vec![("amecro", 0.90)]),
            ],
        );
        let dets = detections(&out);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].confidence, 0.90, "earlier window wins the burst");
    }

    #[test]
    fn removed_source_predictions_are_discarded() {
        let metrics = Metrics::new();
        let mut c = FilterChain::new(settings(), labels(), None, active(&[]), &metrics);
        let out = run(&mut c, vec![prediction(0.0, 0, vec![("amecro", 0.95)])]);
        assert!(out.is_empty());
        assert_eq!(metrics.counter_value("filter", "stale-source"), 1);
    }

    #[test]
    fn state_snapshot_roundtrip_keeps_cooling() {
        let metrics = Metrics::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter-state.json");
        let mut c = chain(settings(), &metrics);
        // Use a wall time near now so the reload horizon keeps it.
        let now_pred = RawPrediction {
            source: "yard".to_string(),
            window_start: Utc::now(),
            window_mono: StdDuration::ZERO,
            window_index: 0,
            pairs: vec![("amecro".to_string(), 0.9)],
        };
        let out = run(&mut c, vec![now_pred.clone()]);
        assert_eq!(detections(&out).len(), 1);
        c.save_state(&path).unwrap();

        let mut fresh = chain(settings(), &metrics);
        fresh.load_state(&path).unwrap();
        let mut dup = now_pred;
        dup.window_index = 1;
        let out = run(&mut fresh, vec![dup]);
        assert!(detections(&out).is_empty(), "warm state still coalesces the duplicate");
    }
}
