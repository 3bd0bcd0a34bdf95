//! Multi-scale liveness (anti-spoofing) scoring.
//!
//! Each configured scale crops a window around the face, sized from the box
//! height and grown by the scale factor. Windows that would leave the image are
//! shifted back inside; when the image is too small for the requested size the
//! window shrinks and its vote is down-weighted by `achieved / requested`.

use crate::client::{InferenceError, ModelClient};
use crate::config::{AntiSpoofingParams, SpoofingScale};
use crate::preprocess::{batch_tensor, resize, ChannelOrder, Normalization};
use crate::types::FaceBox;
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Half-width of the base window as a fraction of box height.
const HALF_WIDTH_PER_HEIGHT: f32 = 0.47;
/// Index of the "real" class in each liveness model's output.
const REAL_CLASS: usize = 1;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("sum of fusion weights is zero")]
    ZeroWeightSum,
    #[error("{probabilities} probabilities for {weights} weights")]
    LengthMismatch { probabilities: usize, weights: usize },
    #[error("{images} images for {boxes} face boxes")]
    BatchMismatch { images: usize, boxes: usize },
    #[error("model {model}: expected [N, 2] probabilities for {rows} faces, got {shape:?}")]
    BadOutput {
        model: String,
        rows: usize,
        shape: Vec<usize>,
    },
    #[error("no anti-spoofing scales configured")]
    NoScales,
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("inference: {0}")]
    Inference(#[from] InferenceError),
}

/// Inclusive pixel rectangle inside the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropWindow {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl CropWindow {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1 + 1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleCrop {
    pub scale: f32,
    pub out_size: (u32, u32),
    pub window: CropWindow,
    pub weight: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessDecision {
    /// Weighted mean "real" probability across scales.
    pub probability: f32,
    pub is_real: bool,
}

/// Integer base window `(x, y, width, height)` centred horizontally on the face.
///
/// The width comes from the box height so that boxes of different aspect
/// produce comparable windows.
pub fn base_window(face: &FaceBox) -> (i64, i64, i64, i64) {
    let height = face.y2 - face.y1;
    let cx = (face.x1 + face.x2) / 2.0;
    let left = (cx - HALF_WIDTH_PER_HEIGHT * height) as i64;
    let right = (cx + HALF_WIDTH_PER_HEIGHT * height) as i64;
    let top = face.y1 as i64;
    let box_h = (face.y2 - face.y1 + 1.0) as i64;
    (left, top, (right - left + 1).max(1), box_h.max(1))
}

/// Scale the base window about its centre and keep it inside a `width × height` image.
///
/// Returns the inclusive window and `achieved / requested` scale.
pub fn scaled_window(
    (src_w, src_h): (u32, u32),
    (x, y, box_w, box_h): (i64, i64, i64, i64),
    requested: f32,
) -> (CropWindow, f32) {
    let max_x = src_w.saturating_sub(1) as f64;
    let max_y = src_h.saturating_sub(1) as f64;
    let (box_w, box_h) = (box_w.max(1) as f64, box_h.max(1) as f64);

    let scale = (max_y / box_h).min(max_x / box_w).min(requested as f64);
    let new_w = box_w * scale;
    let new_h = box_h * scale;
    let cx = box_w / 2.0 + x as f64;
    let cy = box_h / 2.0 + y as f64;

    let (mut x1, mut y1) = (cx - new_w / 2.0, cy - new_h / 2.0);
    let (mut x2, mut y2) = (cx + new_w / 2.0, cy + new_h / 2.0);

    if x1 < 0.0 {
        x2 -= x1;
        x1 = 0.0;
    }
    if y1 < 0.0 {
        y2 -= y1;
        y1 = 0.0;
    }
    if x2 > max_x {
        x1 -= x2 - max_x;
        x2 = max_x;
    }
    if y2 > max_y {
        y1 -= y2 - max_y;
        y2 = max_y;
    }

    let clamp = |v: f64, max: f64| (v.clamp(0.0, max) as i64) as u32;
    let window = CropWindow {
        x1: clamp(x1, max_x),
        y1: clamp(y1, max_y),
        x2: clamp(x2, max_x),
        y2: clamp(y2, max_y),
    };
    let weight = if requested > 0.0 {
        (scale / requested as f64) as f32
    } else {
        0.0
    };
    (window, weight)
}

/// Per-scale crop windows and weights for one face.
pub fn derive_crops(image_size: (u32, u32), face: &FaceBox, scales: &[SpoofingScale]) -> Vec<ScaleCrop> {
    let base = base_window(face);
    scales
        .iter()
        .map(|s| {
            let (window, weight) = scaled_window(image_size, base, s.scale);
            ScaleCrop {
                scale: s.scale,
                out_size: (s.out_width, s.out_height),
                window,
                weight,
            }
        })
        .collect()
}

/// Weighted average of per-scale "real" probabilities.
///
/// A face is real only when the fused probability is strictly above `threshold`.
pub fn fuse(real_probs: &[f32], weights: &[f32], threshold: f32) -> Result<LivenessDecision, LivenessError> {
    if real_probs.len() != weights.len() {
        return Err(LivenessError::LengthMismatch {
            probabilities: real_probs.len(),
            weights: weights.len(),
        });
    }
    let weight_sum: f32 = weights.iter().sum();
    if weight_sum == 0.0 {
        return Err(LivenessError::ZeroWeightSum);
    }
    let weighted: f32 = real_probs.iter().zip(weights).map(|(p, w)| p * w).sum();
    let probability = weighted / weight_sum;
    Ok(LivenessDecision {
        probability,
        is_real: probability > threshold,
    })
}

/// Runs the per-scale liveness models and fuses their votes.
pub struct LivenessScorer {
    client: Arc<dyn ModelClient>,
    params: AntiSpoofingParams,
}

impl LivenessScorer {
    pub fn new(client: Arc<dyn ModelClient>, params: AntiSpoofingParams) -> Result<Self, LivenessError> {
        if params.scales.is_empty() {
            return Err(LivenessError::NoScales);
        }
        tracing::info!(
            models = ?params.scales.iter().map(|s| s.model_name.as_str()).collect::<Vec<_>>(),
            threshold = params.threshold,
            "liveness scorer ready"
        );
        Ok(Self { client, params })
    }

    pub fn params(&self) -> &AntiSpoofingParams {
        &self.params
    }

    pub fn crops(&self, image: &RgbImage, face: &FaceBox) -> Vec<ScaleCrop> {
        derive_crops(image.dimensions(), face, &self.params.scales)
    }

    pub fn score_one(&self, image: &RgbImage, face: &FaceBox) -> Result<LivenessDecision, LivenessError> {
        let mut decisions = self.score(std::slice::from_ref(image), std::slice::from_ref(face))?;
        decisions.pop().ok_or(LivenessError::BatchMismatch { images: 1, boxes: 0 })
    }

    /// Score every `(images[i], boxes[i])` pair.
    pub fn score(&self, images: &[RgbImage], boxes: &[FaceBox]) -> Result<Vec<LivenessDecision>, LivenessError> {
        if images.len() != boxes.len() {
            return Err(LivenessError::BatchMismatch {
                images: images.len(),
                boxes: boxes.len(),
            });
        }
        if images.iter().any(|img| img.width() == 0 || img.height() == 0) {
            return Err(LivenessError::EmptyImage);
        }

        let n_scales = self.params.scales.len();
        // patches[scale][face], weights[face][scale]
        let mut patches: Vec<Vec<RgbImage>> = vec![Vec::with_capacity(images.len()); n_scales];
        let mut weights: Vec<Vec<f32>> = Vec::with_capacity(images.len());

        for (image, face) in images.iter().zip(boxes) {
            let crops = self.crops(image, face);
            for (j, crop) in crops.iter().enumerate() {
                let w = crop.window;
                let region = imageops::crop_imm(image, w.x1, w.y1, w.width(), w.height()).to_image();
                patches[j].push(resize(&region, crop.out_size.0, crop.out_size.1));
                tracing::debug!(scale = crop.scale, weight = crop.weight, window = ?w, "liveness crop");
            }
            weights.push(crops.iter().map(|c| c.weight).collect());
        }

        let mut real: Vec<Vec<f32>> = vec![Vec::with_capacity(n_scales); images.len()];
        for (scale, scale_patches) in self.params.scales.iter().zip(&patches) {
            let probs = self.real_probabilities(scale, scale_patches)?;
            for (face_probs, p) in real.iter_mut().zip(probs) {
                face_probs.push(p);
            }
        }

        real.iter()
            .zip(&weights)
            .map(|(p, w)| fuse(p, w, self.params.threshold))
            .collect()
    }

    /// "Real" class probability for each patch, batching model calls.
    fn real_probabilities(&self, scale: &SpoofingScale, patches: &[RgbImage]) -> Result<Vec<f32>, LivenessError> {
        let batch = self.params.batch_size.max(1);
        let mut probs = Vec::with_capacity(patches.len());

        for chunk in patches.chunks(batch) {
            let input = batch_tensor(
                chunk,
                batch,
                (scale.out_width, scale.out_height),
                ChannelOrder::Bgr,
                Normalization::RAW,
            );
            let outputs = self.client.infer(&scale.model_name, self.params.timeout(), input)?;
            let out = outputs.require(&scale.model_name, 0)?;

            let bad_output = || LivenessError::BadOutput {
                model: scale.model_name.clone(),
                rows: chunk.len(),
                shape: out.shape().to_vec(),
            };
            let rows = out.shape().first().copied().unwrap_or(0);
            if rows < chunk.len() || out.is_empty() {
                return Err(bad_output());
            }
            let cols = out.len() / rows;
            if cols <= REAL_CLASS {
                return Err(bad_output());
            }
            let table = out.to_shape((rows, cols)).map_err(|_| bad_output())?;
            probs.extend((0..chunk.len()).map(|r| table[[r, REAL_CLASS]]));
        }

        Ok(probs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ModelOutputs;
    use ndarray::{Array4, ArrayD, IxDyn};
    use std::sync::Mutex;
    use std::time::Duration;

    fn default_scales() -> Vec<SpoofingScale> {
        AntiSpoofingParams::default().scales
    }

    #[test]
    fn test_base_window_uses_box_height() {
        let face = FaceBox::new(100.0, 50.0, 140.0, 150.0);
        // cx = 120, h = 100 → left = 73, right = 167
        assert_eq!(base_window(&face), (73, 50, 95, 101));
    }

    #[test]
    fn test_window_fits_unchanged() {
        let (w, weight) = scaled_window((1000, 1000), (400, 400, 100, 100), 2.0);
        assert_eq!(weight, 1.0);
        assert_eq!(w, CropWindow { x1: 350, y1: 350, x2: 550, y2: 550 });
    }

    #[test]
    fn test_window_shifted_inside_left_edge() {
        let (w, weight) = scaled_window((1000, 1000), (10, 400, 100, 100), 2.0);
        assert_eq!(weight, 1.0);
        assert_eq!(w.x1, 0);
        assert_eq!(w.x2, 200);
        assert_eq!(w.y1, 350);
    }

    #[test]
    fn test_window_shifted_inside_bottom_right() {
        let (w, weight) = scaled_window((640, 480), (580, 420, 50, 50), 2.7);
        assert_eq!(weight, 1.0);
        assert_eq!(w.x2, 639);
        assert_eq!(w.y2, 479);
        assert!(w.x1 < 580 && w.y1 < 420);
    }

    #[test]
    fn test_window_shrinks_when_image_too_small() {
        let (w, weight) = scaled_window((201, 201), (50, 50, 100, 100), 4.0);
        // achieved scale 200/100 = 2.0
        assert!((weight - 0.5).abs() < 1e-6);
        assert_eq!(w, CropWindow { x1: 0, y1: 0, x2: 200, y2: 200 });
    }

    #[test]
    fn test_weight_monotonic_in_image_size() {
        let base = (100, 100, 120, 160);
        let mut last = f32::INFINITY;
        for size in (200..=1200).rev().step_by(50) {
            let (_, weight) = scaled_window((size, size), base, 4.0);
            assert!(weight <= last + 1e-6, "weight grew from {last} to {weight} at {size}");
            assert!(weight <= 1.0);
            last = weight;
        }
    }

    #[test]
    fn test_windows_stay_inside_image() {
        let faces = [
            FaceBox::new(0.0, 0.0, 30.0, 40.0),
            FaceBox::new(600.0, 440.0, 639.0, 479.0),
            FaceBox::new(300.0, 200.0, 340.0, 260.0),
        ];
        for face in &faces {
            for crop in derive_crops((640, 480), face, &default_scales()) {
                let w = crop.window;
                assert!(w.x1 <= w.x2 && w.x2 <= 639);
                assert!(w.y1 <= w.y2 && w.y2 <= 479);
                assert!(crop.weight > 0.0 && crop.weight <= 1.0);
            }
        }
    }

    #[test]
    fn test_fuse_weighted_average() {
        let d = fuse(&[0.9, 0.3], &[1.0, 0.5], 0.55).unwrap();
        assert!((d.probability - (0.9 + 0.15) / 1.5).abs() < 1e-6);
        assert!(d.is_real);
    }

    #[test]
    fn test_fuse_threshold_is_strict() {
        let d = fuse(&[0.55, 0.55], &[1.0, 1.0], 0.55).unwrap();
        assert_eq!(d.probability, 0.55);
        assert!(!d.is_real);
    }

    #[test]
    fn test_fuse_zero_weights() {
        assert!(matches!(fuse(&[0.9], &[0.0], 0.5), Err(LivenessError::ZeroWeightSum)));
        assert!(matches!(fuse(&[], &[], 0.5), Err(LivenessError::ZeroWeightSum)));
    }

    #[test]
    fn test_fuse_length_mismatch() {
        assert!(matches!(
            fuse(&[0.9, 0.1], &[1.0], 0.5),
            Err(LivenessError::LengthMismatch { probabilities: 2, weights: 1 })
        ));
    }

    /// Returns `[batch, 2]` with a fixed real probability per model.
    struct FixedProbClient {
        probs: Vec<(String, f32)>,
        calls: Mutex<Vec<(String, Vec<usize>)>>,
    }

    impl ModelClient for FixedProbClient {
        fn infer(
            &self,
            model_name: &str,
            _timeout: Duration,
            input: Array4<f32>,
        ) -> Result<ModelOutputs, InferenceError> {
            self.calls
                .lock()
                .unwrap()
                .push((model_name.to_string(), input.shape().to_vec()));
            let p = self
                .probs
                .iter()
                .find(|(m, _)| m == model_name)
                .map(|(_, p)| *p)
                .ok_or_else(|| InferenceError::Transport(format!("unknown model {model_name}")))?;
            let batch = input.shape()[0];
            let mut out = ArrayD::<f32>::zeros(IxDyn(&[batch, 3]));
            for r in 0..batch {
                out[[r, 0].as_slice()] = 1.0 - p;
                out[[r, 1].as_slice()] = p;
            }
            Ok(ModelOutputs::new(vec![("prob".to_string(), out)]))
        }
    }

    fn scorer(p27: f32, p40: f32, batch_size: usize) -> (LivenessScorer, Arc<FixedProbClient>) {
        let client = Arc::new(FixedProbClient {
            probs: vec![
                ("face_anti_spoofing_2_7".to_string(), p27),
                ("face_anti_spoofing_4_0".to_string(), p40),
            ],
            calls: Mutex::new(Vec::new()),
        });
        let params = AntiSpoofingParams {
            batch_size,
            ..AntiSpoofingParams::default()
        };
        (LivenessScorer::new(client.clone(), params).unwrap(), client)
    }

    #[test]
    fn test_scorer_fuses_model_outputs() {
        let (scorer, client) = scorer(0.9, 0.7, 1);
        let img = RgbImage::new(1000, 1000);
        let face = FaceBox::new(450.0, 450.0, 550.0, 550.0);
        let d = scorer.score_one(&img, &face).unwrap();
        // both windows fit, equal weights
        assert!((d.probability - 0.8).abs() < 1e-5);
        assert!(d.is_real);

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "face_anti_spoofing_2_7");
        assert_eq!(calls[0].1, vec![1, 3, 80, 80]);
    }

    #[test]
    fn test_scorer_batches_and_pads() {
        let (scorer, client) = scorer(0.2, 0.4, 2);
        let images = vec![RgbImage::new(300, 300), RgbImage::new(300, 300), RgbImage::new(300, 300)];
        let boxes = vec![FaceBox::new(100.0, 100.0, 200.0, 200.0); 3];
        let decisions = scorer.score(&images, &boxes).unwrap();
        assert_eq!(decisions.len(), 3);
        assert!(decisions.iter().all(|d| !d.is_real));

        let calls = client.calls.lock().unwrap();
        // two chunks per scale, each padded to the batch size
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|(_, shape)| shape[0] == 2));
    }

    #[test]
    fn test_scorer_batch_mismatch() {
        let (scorer, _) = scorer(0.9, 0.9, 1);
        let err = scorer
            .score(&[RgbImage::new(10, 10)], &[])
            .unwrap_err();
        assert!(matches!(err, LivenessError::BatchMismatch { images: 1, boxes: 0 }));
    }

    #[test]
    fn test_scorer_propagates_transport_error() {
        let client = Arc::new(FixedProbClient {
            probs: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let scorer = LivenessScorer::new(client, AntiSpoofingParams::default()).unwrap();
        let err = scorer
            .score_one(&RgbImage::new(200, 200), &FaceBox::new(50.0, 50.0, 150.0, 150.0))
            .unwrap_err();
        assert!(matches!(err, LivenessError::Inference(InferenceError::Transport(_))));
    }

    #[test]
    fn test_scorer_requires_scales() {
        let client = Arc::new(FixedProbClient {
            probs: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let params = AntiSpoofingParams {
            scales: vec![],
            ..AntiSpoofingParams::default()
        };
        assert!(matches!(LivenessScorer::new(client, params), Err(LivenessError::NoScales)));
    }
}
