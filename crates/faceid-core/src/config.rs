//! Plain parameter structs for every model-backed component.
//!
//! Defaults match the models the pipeline ships with. The core never reads
//! files itself; callers build these directly or deserialize them.

use crate::anchors::{retinaface_anchor_configs, AnchorConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Anchor configuration of one pyramid level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    pub stride: usize,
    #[serde(flatten)]
    pub anchor: AnchorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    pub model_name: String,
    pub timeout_secs: u64,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Add a half-stride shifted copy of every anchor.
    pub dense_anchor: bool,
    pub bbox_stds: [f32; 4],
    pub landmark_std: f32,
    /// Levels in the order the network emits them.
    pub levels: Vec<LevelConfig>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            model_name: "face_detection_retina".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            input_width: 640,
            input_height: 640,
            confidence_threshold: 0.7,
            iou_threshold: 0.45,
            dense_anchor: false,
            bbox_stds: [1.0; 4],
            landmark_std: 1.0,
            levels: retinaface_anchor_configs()
                .into_iter()
                .map(|(stride, anchor)| LevelConfig { stride, anchor })
                .collect(),
        }
    }
}

impl DetectionParams {
    pub fn anchor_configs(&self) -> Vec<(usize, AnchorConfig)> {
        self.levels.iter().map(|l| (l.stride, l.anchor.clone())).collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Geometric thresholds of the face selection policies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionParams {
    /// Fraction of image width left of centre a verification face may sit.
    pub margin_center_left_ratio: f32,
    pub margin_center_right_ratio: f32,
    /// Edge margin as a fraction of width, capped at `max_margin_edge` pixels.
    pub margin_edge_ratio: f32,
    pub max_margin_edge: f32,
    /// Minimum `area / (W·H)` for a verification face to be valid.
    pub min_box_area_ratio: f32,
    /// Minimum `width / W` for an enrollment face.
    pub min_box_width_ratio: f32,
    /// Tolerance in pixels when pairing a selected box back to its landmarks.
    pub landmark_match_tolerance: f32,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            margin_center_left_ratio: 0.3,
            margin_center_right_ratio: 0.3,
            margin_edge_ratio: 0.1,
            max_margin_edge: 50.0,
            min_box_area_ratio: 0.0075,
            min_box_width_ratio: 0.25,
            landmark_match_tolerance: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignParams {
    pub output_size: u32,
    /// Total pixels added around the box (half per side) in the crop fallback.
    pub margin: u32,
    /// Per-side inset used as the fallback box when no box is available.
    pub default_box_inset: f32,
}

impl Default for AlignParams {
    fn default() -> Self {
        Self {
            output_size: 112,
            margin: 44,
            default_box_inset: 0.0625,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityParams {
    pub model_name: String,
    pub timeout_secs: u64,
    pub image_size: u32,
    pub threshold: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            model_name: "face_quality".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            image_size: 112,
            threshold: 0.5,
            mean: [123.675, 116.28, 103.53],
            std: [0.01712475, 0.017507, 0.01742919],
        }
    }
}

impl QualityParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityAssessmentParams {
    pub model_name: String,
    pub timeout_secs: u64,
    pub image_size: u32,
    pub threshold: f32,
}

impl Default for QualityAssessmentParams {
    fn default() -> Self {
        Self {
            model_name: "face_quality_assessment".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            image_size: 112,
            threshold: 0.5,
        }
    }
}

impl QualityAssessmentParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionParams {
    pub model_name: String,
    pub timeout_secs: u64,
    pub image_size: u32,
    pub batch_size: usize,
}

impl Default for RecognitionParams {
    fn default() -> Self {
        Self {
            model_name: "face_identification".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            image_size: 112,
            batch_size: 1,
        }
    }
}

impl RecognitionParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One liveness model and the crop scale it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoofingScale {
    pub model_name: String,
    pub scale: f32,
    pub out_width: u32,
    pub out_height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiSpoofingParams {
    pub scales: Vec<SpoofingScale>,
    pub timeout_secs: u64,
    pub threshold: f32,
    pub batch_size: usize,
}

impl Default for AntiSpoofingParams {
    fn default() -> Self {
        let scale = |model_name: &str, scale: f32| SpoofingScale {
            model_name: model_name.to_string(),
            scale,
            out_width: 80,
            out_height: 80,
        };
        Self {
            scales: vec![
                scale("face_anti_spoofing_2_7", 2.7),
                scale("face_anti_spoofing_4_0", 4.0),
            ],
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            threshold: 0.55,
            batch_size: 1,
        }
    }
}

impl AntiSpoofingParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Everything needed to assemble an extraction pipeline.
///
/// `assessment` switches the pipeline into its anti-spoofing variant;
/// `anti_spoofing` enables liveness checks on request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: DetectionParams,
    pub selection: SelectionParams,
    pub align: AlignParams,
    pub quality: QualityParams,
    pub recognition: RecognitionParams,
    pub assessment: Option<QualityAssessmentParams>,
    pub anti_spoofing: Option<AntiSpoofingParams>,
}
