use anyhow::{Context, Result};
use knowyou_core::{default_model_dir, DistanceMetric, ModelPaths, DEFAULT_DISTANCE_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Session configuration.
///
/// Layered: built-in defaults, then an optional TOML file, then `KNOWYOU_*`
/// environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Requested capture width, also the overlay width.
    pub width: u32,
    /// Requested capture height, also the overlay height.
    pub height: u32,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// JSON file listing named people and their photos.
    pub dataset_path: PathBuf,
    /// A match needs a mean distance strictly below this.
    pub distance_threshold: f32,
    pub metric: DistanceMetric,
    /// Wait between the end of one cycle and the start of the next.
    pub poll_interval_ms: u64,
    /// Cycles running longer than this are cancelled. 0 disables.
    pub cycle_timeout_ms: u64,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Minimum detector score for a face.
    pub detection_confidence: f32,
    /// Where the composited frame is written after every cycle.
    pub overlay_output: Option<PathBuf>,
    /// TTF/OTF font for label text.
    pub font_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            width: 750,
            height: 560,
            model_dir: default_model_dir(),
            dataset_path: PathBuf::from("dataset.json"),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            metric: DistanceMetric::Cosine,
            poll_interval_ms: 2000,
            cycle_timeout_ms: 10_000,
            warmup_frames: 4,
            detection_confidence: knowyou_core::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            overlay_output: None,
            font_path: None,
        }
    }
}

impl Config {
    /// Load the file at `path`, or the default location when it exists,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `KNOWYOU_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("KNOWYOU_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        override_parsed(&lookup, "KNOWYOU_WIDTH", &mut self.width);
        override_parsed(&lookup, "KNOWYOU_HEIGHT", &mut self.height);
        if let Some(v) = lookup("KNOWYOU_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KNOWYOU_DATASET") {
            self.dataset_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "KNOWYOU_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        override_parsed(&lookup, "KNOWYOU_METRIC", &mut self.metric);
        override_parsed(&lookup, "KNOWYOU_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        override_parsed(&lookup, "KNOWYOU_CYCLE_TIMEOUT_MS", &mut self.cycle_timeout_ms);
        override_parsed(&lookup, "KNOWYOU_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&lookup, "KNOWYOU_DETECTION_CONFIDENCE", &mut self.detection_confidence);
        if let Some(v) = lookup("KNOWYOU_OVERLAY_OUTPUT") {
            self.overlay_output = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KNOWYOU_FONT") {
            self.font_path = Some(PathBuf::from(v));
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        (self.cycle_timeout_ms > 0).then(|| Duration::from_millis(self.cycle_timeout_ms))
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }
}

/// `$XDG_CONFIG_HOME/knowyou/config.toml`, falling back to `~/.config`.
fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()?;
    Some(base.join("knowyou").join("config.toml"))
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}
