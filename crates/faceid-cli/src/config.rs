use anyhow::{Context, Result};
use faceid_core::config::{AntiSpoofingParams, QualityAssessmentParams};
use faceid_core::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_MODEL_DIR: &str = "./models";

/// CLI configuration: an optional TOML file, then `FACEID_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Directory containing `<model_name>.onnx` files.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            pipeline: PipelineConfig::default(),
        }
    }
}

fn default_model_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MODEL_DIR)
}

impl Config {
    /// Load `path` (if given) and apply overrides from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACEID_*` overrides read through `var`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("FACEID_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }

        let p = &mut self.pipeline;
        p.detection.confidence_threshold =
            env_f32(&var, "FACEID_CONFIDENCE_THRESHOLD", p.detection.confidence_threshold);
        p.detection.iou_threshold = env_f32(&var, "FACEID_IOU_THRESHOLD", p.detection.iou_threshold);
        p.recognition.batch_size = env_usize(&var, "FACEID_RECOGNITION_BATCH_SIZE", p.recognition.batch_size);

        if let Some(enabled) = var("FACEID_ANTI_SPOOFING").map(|v| v != "0") {
            if enabled {
                p.assessment.get_or_insert_with(QualityAssessmentParams::default);
                p.anti_spoofing.get_or_insert_with(AntiSpoofingParams::default);
            } else {
                p.assessment = None;
                p.anti_spoofing = None;
            }
        }
        if let Some(a) = p.anti_spoofing.as_mut() {
            a.threshold = env_f32(&var, "FACEID_LIVENESS_THRESHOLD", a.threshold);
        }

        if let Some(secs) = var("FACEID_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
            p.detection.timeout_secs = secs;
            p.quality.timeout_secs = secs;
            p.recognition.timeout_secs = secs;
            if let Some(a) = p.assessment.as_mut() {
                a.timeout_secs = secs;
            }
            if let Some(a) = p.anti_spoofing.as_mut() {
                a.timeout_secs = secs;
            }
        }
    }
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(var: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
