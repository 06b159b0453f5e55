//! TOML configuration: sources, analysis, filters, clips, retention, sinks.
//!
//! Every field has a serde default so partial files work; `validate()` turns
//! inconsistent values into `Error::Config` with a field path, which is fatal
//! at startup and a logged rejection on reload.

use crate::error::Error;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file path.
pub const CONFIG_ENV: &str = "SKYLARK_CONFIG";
/// Environment variable selecting a profiling mode (periodic metric dumps).
pub const PROFILE_ENV: &str = "SKYLARK_PROFILE";

/// Kind of audio input a source describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Host audio device, matched by user-facing name substring.
    Device {
        /// Device name fragment; empty selects the system default.
        #[serde(default)]
        name: String,
    },
    /// Network stream decoded by a supervised ffmpeg child.
    Stream {
        url: String,
        /// Seconds of silent pipe tolerated before the worker faults.
        #[serde(default = "default_stall_secs")]
        stall_secs: u64,
    },
}

fn default_stall_secs() -> u64 {
    15
}

/// One configured audio input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Stable identifier; used in clip paths, logs and detection rows.
    pub id: String,
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourceSpec {
    /// True when a running worker for `other` must be torn down and rebuilt.
    /// The `enabled` flag is handled separately by the source manager.
    pub fn materially_differs(&self, other: &SourceSpec) -> bool {
        self.kind != other.kind
    }
}

fn default_true() -> bool {
    true
}

/// Analysis window and classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Fraction of each 3 s window shared with its predecessor, in [0, 1).
    #[serde(default)]
    pub overlap: f32,
    /// Global confidence threshold applied by the filter chain.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Classifier worker count; 0 selects max(1, cores - 1).
    #[serde(default)]
    pub workers: usize,
    /// Path to the ONNX model file.
    #[serde(default)]
    pub model: PathBuf,
    /// Directory holding codes.txt and labels_<locale>.txt.
    #[serde(default)]
    pub labels_dir: PathBuf,
    /// Locale for common-name resolution.
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Predictions kept per window, by descending confidence.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Bound on the window queue, per source.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_threshold() -> f32 {
    0.8
}
fn default_locale() -> String {
    "en".to_string()
}
fn default_top_k() -> usize {
    10
}
fn default_queue_depth() -> usize {
    8
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            overlap: 0.0,
            threshold: default_threshold(),
            workers: 0,
            model: PathBuf::new(),
            labels_dir: PathBuf::new(),
            locale: default_locale(),
            top_k: default_top_k(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Location/season plausibility gate settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Site-specific weekly score table (JSON), exported for this location.
    #[serde(default)]
    pub table: PathBuf,
    /// Species below this modeled probability are rejected.
    #[serde(default = "default_range_floor")]
    pub floor: f32,
    /// "latest" interpolates adjacent weeks; "legacy" uses raw week buckets.
    #[serde(default)]
    pub variant: RangeVariant,
}

fn default_range_floor() -> f32 {
    0.01
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeVariant {
    #[default]
    Latest,
    Legacy,
}

/// Human-voice suppression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_privacy_threshold")]
    pub threshold: f32,
    /// Species codes treated as human voice.
    #[serde(default = "default_privacy_codes")]
    pub codes: Vec<String>,
    /// Sources the filter applies to; empty means all.
    #[serde(default)]
    pub sources: Vec<String>,
}

fn default_privacy_threshold() -> f32 {
    0.7
}
fn default_privacy_codes() -> Vec<String> {
    vec!["human-voice".to_string(), "human-vocal".to_string()]
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        PrivacyConfig {
            enabled: false,
            threshold: default_privacy_threshold(),
            codes: default_privacy_codes(),
            sources: Vec::new(),
        }
    }
}

/// Dog-bark false-positive suppression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DogBarkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bark_threshold")]
    pub threshold: f32,
    /// Seconds a bark keeps its suppression window open.
    #[serde(default = "default_bark_memory")]
    pub memory_secs: u64,
    /// Species codes recognized as barks.
    #[serde(default = "default_bark_codes")]
    pub codes: Vec<String>,
    /// Species codes suppressed while the bark window is open.
    #[serde(default)]
    pub suppressed: Vec<String>,
    /// Sources the filter applies to; empty means all.
    #[serde(default)]
    pub sources: Vec<String>,
}

fn default_bark_threshold() -> f32 {
    0.3
}
fn default_bark_memory() -> u64 {
    60
}
fn default_bark_codes() -> Vec<String> {
    vec!["dog".to_string(), "dog-bark".to_string()]
}

impl Default for DogBarkConfig {
    fn default() -> Self {
        DogBarkConfig {
            enabled: false,
            threshold: default_bark_threshold(),
            memory_secs: default_bark_memory(),
            codes: default_bark_codes(),
            suppressed: Vec::new(),
            sources: Vec::new(),
        }
    }
}

/// Filter chain settings (stages after the confidence threshold).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Scientific names; when non-empty, everything else is rejected.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Scientific names rejected outright.
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub range: RangeFilterConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub dog_bark: DogBarkConfig,
    /// Minimum seconds between accepted detections of one species on one source.
    #[serde(default = "default_dedup_secs")]
    pub dedup_secs: u64,
    /// Snapshot dedup/bark state to configRoot on shutdown for warm restart.
    #[serde(default)]
    pub persist_state: bool,
}

fn default_dedup_secs() -> u64 {
    10
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            allow: Vec::new(),
            deny: Vec::new(),
            range: RangeFilterConfig::default(),
            privacy: PrivacyConfig::default(),
            dog_bark: DogBarkConfig::default(),
            dedup_secs: default_dedup_secs(),
            persist_state: false,
        }
    }
}

/// Clip ring and export settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipConfig {
    /// Root directory for exported clips.
    #[serde(default = "default_clip_root")]
    pub root: PathBuf,
    /// Seconds of ring retention per source.
    #[serde(default = "default_ring_secs")]
    pub ring_secs: u64,
    #[serde(default = "default_pre_roll")]
    pub pre_roll_secs: f32,
    #[serde(default = "default_post_roll")]
    pub post_roll_secs: f32,
    /// Fixed gain applied before encoding, in dB; 0 disables.
    #[serde(default)]
    pub gain_db: f32,
}

fn default_clip_root() -> PathBuf {
    data_dir().join("clips")
}
fn default_ring_secs() -> u64 {
    30
}
fn default_pre_roll() -> f32 {
    3.0
}
fn default_post_roll() -> f32 {
    3.0
}

impl Default for ClipConfig {
    fn default() -> Self {
        ClipConfig {
            root: default_clip_root(),
            ring_secs: default_ring_secs(),
            pre_roll_secs: default_pre_roll(),
            post_roll_secs: default_post_roll(),
            gain_db: 0.0,
        }
    }
}

/// Clip retention policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    None,
    /// Delete clips older than `max_age` ("30d", "8w", "6M", "1y").
    Age { max_age: String },
    /// Delete oldest clips while the clip filesystem exceeds `high_pct`,
    /// stopping once below `low_pct`.
    Usage { high_pct: f32, low_pct: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(flatten)]
    pub policy: RetentionPolicy,
    /// Seconds between scheduled sweeps.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
    /// Detections since the last sweep that trigger an opportunistic pass.
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u64,
}

fn default_sweep_secs() -> u64 {
    900
}
fn default_burst_threshold() -> u64 {
    50
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            policy: RetentionPolicy::None,
            sweep_secs: default_sweep_secs(),
            burst_threshold: default_burst_threshold(),
        }
    }
}

/// Embedded datastore settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Append-only JSONL detection log.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Deadletter file for detections that exhausted their retry budget.
    #[serde(default = "default_deadletter_path")]
    pub deadletter: PathBuf,
    /// Persist retry budget before a detection is deadlettered.
    #[serde(default = "default_persist_retries")]
    pub retries: u32,
}

fn default_store_path() -> PathBuf {
    data_dir().join("detections.jsonl")
}
fn default_deadletter_path() -> PathBuf {
    data_dir().join("deadletter.jsonl")
}
fn default_persist_retries() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: default_store_path(),
            deadletter: default_deadletter_path(),
            retries: default_persist_retries(),
        }
    }
}

/// MQTT sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic template; `{source}` and `{code}` are substituted per detection.
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_topic() -> String {
    "skylark/{source}/detection".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic: default_mqtt_topic(),
            username: None,
            password: None,
            tls: false,
        }
    }
}

/// One webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Sent as the X-Webhook-Secret header when set.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

/// External aggregator upload settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Attach the encoded clip to the upload when available.
    #[serde(default = "default_true")]
    pub include_clip: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Bound on each sink's queue before drop-oldest applies.
    #[serde(default = "default_sink_queue_depth")]
    pub queue_depth: usize,
}

fn default_sink_queue_depth() -> usize {
    64
}

/// Root configuration. Serialized to ~/.config/skylark/config.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Station coordinates, recorded on every detection.
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub clips: ClipConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sinks: SinkConfig,

    /// Path the config was loaded from, set by load_from(). Used by save().
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

/// ~/.local/share/skylark
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("skylark")
}

/// ~/.config/skylark
pub fn config_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("skylark")
}

impl Config {
    /// Default config file path, overridable through SKYLARK_CONFIG.
    pub fn config_path() -> PathBuf {
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(p);
        }
        config_root().join("config.toml")
    }

    pub fn load_from(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut cfg: Config =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        cfg.config_file_path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// Persist the current config. Creates parent directories if needed.
    pub fn save(&self) -> Result<()> {
        let path = self
            .config_file_path
            .clone()
            .unwrap_or_else(Self::config_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config dir {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Check cross-field consistency. Field paths in the error match the TOML
    /// layout so reload rejections point at the offending key.
    pub fn validate(&self) -> Result<(), Error> {
        fn fail<T>(field: &str, message: String) -> Result<T, Error> {
            Err(Error::Config { field: field.to_string(), message })
        }

        if !(0.0..1.0).contains(&self.analysis.overlap) {
            return fail(
                "analysis.overlap",
                format!("must be in [0, 1), got {}", self.analysis.overlap),
            );
        }
        if !(0.0..=1.0).contains(&self.analysis.threshold) {
            return fail(
                "analysis.threshold",
                format!("must be in [0, 1], got {}", self.analysis.threshold),
            );
        }
        if self.analysis.top_k == 0 {
            return fail("analysis.top_k", "must be at least 1".into());
        }

        let mut seen = std::collections::HashSet::new();
        for (i, s) in self.sources.iter().enumerate() {
            if s.id.is_empty() {
                return fail(&format!("source[{i}].id"), "must not be empty".into());
            }
            if s.id.contains(['/', '\\']) {
                return fail(&format!("source[{i}].id"), "must not contain path separators".into());
            }
            if !seen.insert(s.id.clone()) {
                return fail(&format!("source[{i}].id"), format!("duplicate id {:?}", s.id));
            }
            if let SourceKind::Stream { url, .. } = &s.kind {
                if url.is_empty() {
                    return fail(&format!("source[{i}].url"), "must not be empty".into());
                }
            }
        }

        // The ring must cover a full exported clip (spec invariant for C3).
        let needed =
            self.clips.pre_roll_secs + crate::audio::WINDOW_SECS as f32 + self.clips.post_roll_secs;
        if (self.clips.ring_secs as f32) < needed {
            return fail(
                "clips.ring_secs",
                format!(
                    "must cover pre-roll + window + post-roll ({needed:.0}s), got {}",
                    self.clips.ring_secs
                ),
            );
        }

        if let RetentionPolicy::Age { max_age } = &self.retention.policy {
            parse_age(max_age)
                .map_err(|e| Error::Config { field: "retention.max_age".into(), message: e })?;
        }
        if let RetentionPolicy::Usage { high_pct, low_pct } = self.retention.policy {
            if !(0.0..=100.0).contains(&high_pct) || !(0.0..=100.0).contains(&low_pct) {
                return fail("retention", "high_pct and low_pct must be percentages".into());
            }
            if low_pct >= high_pct {
                return fail("retention.low_pct", "must be below high_pct".into());
            }
        }

        if self.filters.range.enabled && self.filters.range.table.as_os_str().is_empty() {
            return fail("filters.range.table", "required when the range filter is enabled".into());
        }
        for (i, w) in self.sinks.webhooks.iter().enumerate() {
            if w.url.is_empty() {
                return fail(&format!("sinks.webhooks[{i}].url"), "must not be empty".into());
            }
        }
        if self.sinks.aggregator.enabled && self.sinks.aggregator.url.is_empty() {
            return fail("sinks.aggregator.url", "required when the aggregator is enabled".into());
        }
        Ok(())
    }

    /// Enabled sources only; what the source manager reconciles against.
    pub fn enabled_sources(&self) -> Vec<SourceSpec> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn classifier_workers(&self) -> usize {
        if self.analysis.workers > 0 {
            self.analysis.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1)
        }
    }
}

/// Parse a retention age like "30d", "8w", "6M", "1y".
/// Months are 30 days, years 365; retention is coarse by nature.
pub fn parse_age(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.len() < 2 {
        return Err(format!("bad duration {text:?}"));
    }
    let (num, unit) = text.split_at(text.len() - 1);
    let n: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("bad number in duration {text:?}"))?;
    let secs = match unit {
        "h" => n * 3600,
        "d" => n * 86_400,
        "w" => n * 7 * 86_400,
        "M" => n * 30 * 86_400,
        "y" => n * 365 * 86_400,
        other => return Err(format!("unknown duration unit {other:?} (use h/d/w/M/y)")),
    };
    Ok(Duration::from_secs(secs))
}
