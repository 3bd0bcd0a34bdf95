//! Face quality models: a four-class classifier and a binary assessor.

use crate::client::{InferenceError, ModelClient};
use crate::config::{QualityAssessmentParams, QualityParams};
use crate::preprocess::{image_tensor, resize, ChannelOrder, Normalization};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const ASSESSMENT_MEAN: f32 = 127.5;
const ASSESSMENT_SCALE: f32 = 0.007_843_137_25;

#[derive(Error, Debug)]
pub enum QualityError {
    #[error("model {0}: empty output")]
    EmptyOutput(String),
    #[error("model {model}: class index {index} out of range")]
    UnknownClass { model: String, index: usize },
    #[error("inference: {0}")]
    Inference(#[from] InferenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaceQualityClass {
    Bad,
    Good,
    WearingMask,
    WearingSunglasses,
}

impl FaceQualityClass {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Bad),
            1 => Some(Self::Good),
            2 => Some(Self::WearingMask),
            3 => Some(Self::WearingSunglasses),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityPrediction {
    pub class: FaceQualityClass,
    pub score: f32,
}

/// Argmax over class scores, demoting a low-confidence `Good` to `Bad`.
///
/// Returns `(class_index, score)`; the first maximum wins ties.
pub fn interpret_class_scores(scores: &[f32], threshold: f32) -> Option<(usize, f32)> {
    let (mut idx, mut score) = scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, s)| match best {
            Some((_, b)) if s <= b => best,
            _ => Some((i, s)),
        })?;
    if idx == FaceQualityClass::Good.index() && score < threshold {
        idx = FaceQualityClass::Bad.index();
        score = scores[idx];
    }
    Some((idx, score))
}

pub struct FaceQualityClassifier {
    client: Arc<dyn ModelClient>,
    params: QualityParams,
}

impl FaceQualityClassifier {
    pub fn new(client: Arc<dyn ModelClient>, params: QualityParams) -> Self {
        Self { client, params }
    }

    pub fn classify(&self, face: &RgbImage) -> Result<QualityPrediction, QualityError> {
        let size = self.params.image_size;
        let norm = Normalization {
            mean: self.params.mean,
            scale: self.params.std,
        };
        let input = image_tensor(&resize(face, size, size), ChannelOrder::Rgb, norm);

        let model = self.params.model_name.as_str();
        let outputs = self.client.infer(model, self.params.timeout(), input)?;
        let scores: Vec<f32> = outputs.require(model, 0)?.iter().copied().collect();

        let (index, score) = interpret_class_scores(&scores, self.params.threshold)
            .ok_or_else(|| QualityError::EmptyOutput(model.to_string()))?;
        let class = FaceQualityClass::from_index(index).ok_or_else(|| QualityError::UnknownClass {
            model: model.to_string(),
            index,
        })?;

        tracing::debug!(?class, score, "face quality");
        Ok(QualityPrediction { class, score })
    }
}

/// Binary quality gate used by the anti-spoofing pipeline.
pub struct FaceQualityAssessor {
    client: Arc<dyn ModelClient>,
    params: QualityAssessmentParams,
}

impl FaceQualityAssessor {
    pub fn new(client: Arc<dyn ModelClient>, params: QualityAssessmentParams) -> Self {
        Self { client, params }
    }

    /// `Good` iff the model score is strictly above the threshold.
    pub fn assess(&self, face: &RgbImage) -> Result<QualityPrediction, QualityError> {
        let size = self.params.image_size;
        let norm = Normalization::uniform(ASSESSMENT_MEAN, ASSESSMENT_SCALE);
        let input = image_tensor(&resize(face, size, size), ChannelOrder::Rgb, norm);

        let model = self.params.model_name.as_str();
        let outputs = self.client.infer(model, self.params.timeout(), input)?;
        let score = outputs
            .require(model, 0)?
            .iter()
            .next()
            .copied()
            .ok_or_else(|| QualityError::EmptyOutput(model.to_string()))?;

        let class = if score > self.params.threshold {
            FaceQualityClass::Good
        } else {
            FaceQualityClass::Bad
        };
        tracing::debug!(?class, score, "face quality assessment");
        Ok(QualityPrediction { class, score })
    }
}
