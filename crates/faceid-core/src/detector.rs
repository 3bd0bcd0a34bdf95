//! RetinaFace face detector.
//!
//! Letterboxes the image into the model canvas, runs one inference call, decodes
//! every pyramid level against its anchors, suppresses overlaps across levels and
//! maps the survivors back to original-image pixels.

use crate::anchors::{AnchorConfigError, AnchorSet};
use crate::client::{InferenceError, ModelClient, ModelOutputs};
use crate::config::DetectionParams;
use crate::decode::{DecodeError, LevelDecoder, LevelDetections, LevelOutputs};
use crate::nms::nms_dets;
use crate::preprocess::{image_tensor, letterbox, ChannelOrder, Normalization};
use crate::types::Detections;
use image::RgbImage;
use ndarray::{s, Array1, Array2, Array3, Axis};
use std::sync::Arc;
use thiserror::Error;

const SCORE_OUTPUT_PREFIX: &str = "face_rpn_cls_prob_reshape_stride";
const BBOX_OUTPUT_PREFIX: &str = "face_rpn_bbox_pred_stride";
const LANDMARK_OUTPUT_PREFIX: &str = "face_rpn_landmark_pred_stride";
const OUTPUTS_PER_LEVEL: usize = 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("anchor configuration: {0}")]
    Anchors(#[from] AnchorConfigError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("inference: {0}")]
    Inference(#[from] InferenceError),
    #[error("detector returned {got} outputs, {expected} required")]
    MissingOutputs { got: usize, expected: usize },
    #[error("image has zero width or height")]
    EmptyImage,
}

/// Output tensor indices for one level: (score, bbox, landmark).
type LevelOutputIndices = (usize, usize, usize);

pub struct FaceDetector {
    client: Arc<dyn ModelClient>,
    params: DetectionParams,
    anchors: AnchorSet,
    decoder: LevelDecoder,
}

impl FaceDetector {
    pub fn new(client: Arc<dyn ModelClient>, params: DetectionParams) -> Result<Self, DetectorError> {
        let anchors = AnchorSet::generate_with(&params.anchor_configs(), params.dense_anchor)?;
        let decoder = LevelDecoder {
            canvas: (params.input_width as usize, params.input_height as usize),
            confidence_threshold: params.confidence_threshold,
            bbox_stds: params.bbox_stds,
            landmark_std: params.landmark_std,
        };

        tracing::info!(
            model = %params.model_name,
            strides = ?anchors.strides(),
            canvas = ?decoder.canvas,
            confidence = params.confidence_threshold,
            iou = params.iou_threshold,
            "face detector ready"
        );

        Ok(Self {
            client,
            params,
            anchors,
            decoder,
        })
    }

    pub fn anchors(&self) -> &AnchorSet {
        &self.anchors
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Detect faces, returning boxes and landmarks in original-image pixels.
    pub fn detect(&self, image: &RgbImage) -> Result<Detections, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }

        let (canvas, scale) = letterbox(image, (self.params.input_width, self.params.input_height));
        let input = image_tensor(&canvas, ChannelOrder::Rgb, Normalization::RAW);
        let outputs = self
            .client
            .infer(&self.params.model_name, self.params.timeout(), input)?;

        self.decode_outputs(&outputs, scale)
    }

    /// Decode raw detector outputs produced for a canvas letterboxed by `scale`.
    pub fn decode_outputs(&self, outputs: &ModelOutputs, scale: f32) -> Result<Detections, DetectorError> {
        let levels = self.anchors.levels();
        let expected = levels.len() * OUTPUTS_PER_LEVEL;
        if outputs.len() < expected {
            return Err(DetectorError::MissingOutputs {
                got: outputs.len(),
                expected,
            });
        }

        let indices = discover_output_indices(&outputs.names(), &self.anchors.strides());
        let model = self.params.model_name.as_str();

        let mut decoded = Vec::with_capacity(levels.len());
        for (level, (score_idx, bbox_idx, landmark_idx)) in levels.iter().zip(indices) {
            let level_outputs = LevelOutputs {
                scores: outputs.require(model, score_idx)?.view(),
                bbox_deltas: outputs.require(model, bbox_idx)?.view(),
                landmark_deltas: Some(outputs.require(model, landmark_idx)?.view()),
            };
            decoded.push(self.decoder.decode(level, level_outputs)?);
        }

        Ok(pool_and_suppress(&decoded, self.params.iou_threshold, scale))
    }
}

/// Map each level to its output tensors.
///
/// RetinaFace exports name their tensors `face_rpn_cls_prob_reshape_stride32`,
/// `face_rpn_bbox_pred_stride32`, `face_rpn_landmark_pred_stride32`, ... When
/// any of those names is missing, outputs are taken positionally as
/// `(score, bbox, landmark)` triples in level order.
fn discover_output_indices(names: &[&str], strides: &[usize]) -> Vec<LevelOutputIndices> {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<LevelOutputIndices>> = strides
        .iter()
        .map(|&stride| {
            Some((
                find(SCORE_OUTPUT_PREFIX, stride)?,
                find(BBOX_OUTPUT_PREFIX, stride)?,
                find(LANDMARK_OUTPUT_PREFIX, stride)?,
            ))
        })
        .collect();

    match named {
        Some(indices) => {
            tracing::debug!(?indices, "detector: name-based output mapping");
            indices
        }
        None => {
            tracing::debug!(?names, "detector: output names not recognized, using positional mapping");
            (0..strides.len())
                .map(|i| {
                    let base = i * OUTPUTS_PER_LEVEL;
                    (base, base + 1, base + 2)
                })
                .collect()
        }
    }
}

/// Pool all levels, suppress overlaps and divide coordinates by `scale`.
///
/// Landmarks are `None` when any level was decoded without them. Zero surviving
/// candidates yields [`Detections::empty`].
pub fn pool_and_suppress(levels: &[LevelDetections], iou_threshold: f32, scale: f32) -> Detections {
    let total: usize = levels.iter().map(LevelDetections::len).sum();
    if total == 0 {
        tracing::debug!("no candidates above confidence threshold");
        return Detections::empty();
    }

    let mut dets = Array2::<f32>::zeros((total, 5));
    let mut landmarks = levels
        .iter()
        .all(|level| level.landmarks.is_some())
        .then(|| Array3::<f32>::zeros((total, 5, 2)));
    let mut row = 0;
    for level in levels {
        let n = level.len();
        dets.slice_mut(s![row..row + n, 0..4])
            .assign(&level.boxes.slice(s![.., 0..4]));
        dets.slice_mut(s![row..row + n, 4]).assign(&level.scores);
        if let (Some(pooled), Some(lms)) = (landmarks.as_mut(), &level.landmarks) {
            pooled.slice_mut(s![row..row + n, .., ..]).assign(lms);
        }
        row += n;
    }

    let keep = nms_dets(dets.view(), iou_threshold);
    tracing::debug!(candidates = total, kept = keep.len(), "suppressed overlapping faces");

    let kept = dets.select(Axis(0), &keep);
    let boxes = kept.slice(s![.., 0..4]).mapv(|v| v / scale);
    let scores: Array1<f32> = kept.column(4).to_owned();
    let landmarks = landmarks.map(|lms| lms.select(Axis(0), &keep).mapv(|v| v / scale));

    Detections {
        boxes,
        scores,
        landmarks,
    }
}
