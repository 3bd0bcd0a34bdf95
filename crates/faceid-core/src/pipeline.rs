//! End-to-end face-ID extraction.
//!
//! detect → select → (liveness) → align → quality → (assessment) → embedding.
//! Configuring a quality assessor switches the pipeline into its stricter
//! anti-spoofing variant.

use crate::alignment::FaceAligner;
use crate::client::ModelClient;
use crate::config::PipelineConfig;
use crate::detector::{DetectorError, FaceDetector};
use crate::liveness::{LivenessDecision, LivenessError, LivenessScorer};
use crate::quality::{FaceQualityAssessor, FaceQualityClass, FaceQualityClassifier, QualityError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::selection::{FaceSelector, SelectionPolicy};
use crate::types::{Detections, Embedding, FaceBox};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("liveness error: {0}")]
    Liveness(#[from] LivenessError),
    #[error("quality error: {0}")]
    Quality(#[from] QualityError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractOptions {
    /// Use the enrollment selection policy and quality gate.
    pub enroll: bool,
    /// Score liveness of the selected face when a scorer is configured.
    pub spoofing_check: bool,
}

/// Outcome of one extraction. Absent fields were not reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub face_count: usize,
    pub selected_box: Option<FaceBox>,
    pub quality: Option<FaceQualityClass>,
    pub quality_score: Option<f32>,
    pub quality_assessment: Option<FaceQualityClass>,
    pub spoofing: Option<LivenessDecision>,
    pub embedding: Option<Embedding>,
}

pub struct ExtractPipeline {
    detector: FaceDetector,
    selector: FaceSelector,
    aligner: FaceAligner,
    quality: FaceQualityClassifier,
    recognizer: FaceRecognizer,
    assessor: Option<FaceQualityAssessor>,
    liveness: Option<LivenessScorer>,
}

impl ExtractPipeline {
    pub fn new(client: Arc<dyn ModelClient>, config: PipelineConfig) -> Result<Self, PipelineError> {
        let detector = FaceDetector::new(Arc::clone(&client), config.detection)?;
        let liveness = config
            .anti_spoofing
            .map(|params| LivenessScorer::new(Arc::clone(&client), params))
            .transpose()?;
        let assessor = config
            .assessment
            .map(|params| FaceQualityAssessor::new(Arc::clone(&client), params));

        tracing::info!(
            anti_spoofing = assessor.is_some(),
            liveness = liveness.is_some(),
            "extraction pipeline ready"
        );

        Ok(Self {
            detector,
            selector: FaceSelector::new(config.selection),
            aligner: FaceAligner::new(config.align),
            quality: FaceQualityClassifier::new(Arc::clone(&client), config.quality),
            recognizer: FaceRecognizer::new(client, config.recognition),
            assessor,
            liveness,
        })
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn detect(&self, image: &RgbImage) -> Result<Detections, PipelineError> {
        Ok(self.detector.detect(image)?)
    }

    pub fn extract(&self, image: &RgbImage, options: ExtractOptions) -> Result<ExtractionResult, PipelineError> {
        let mut result = ExtractionResult::default();

        let detections = self.detector.detect(image)?;
        result.face_count = detections.len();
        if detections.is_empty() {
            return Ok(result);
        }

        let policy = SelectionPolicy::for_enroll(options.enroll);
        let Some(face) = self.selector.select(image.dimensions(), &detections, policy) else {
            tracing::debug!(faces = result.face_count, ?policy, "no face selected");
            return Ok(result);
        };
        result.selected_box = Some(face.bbox);

        if options.spoofing_check {
            match &self.liveness {
                Some(scorer) => result.spoofing = Some(scorer.score_one(image, &face.bbox)?),
                None => tracing::warn!("spoofing check requested but no liveness models configured"),
            }
        }

        let aligned = self.aligner.align(image, Some(&face.bbox), face.landmarks.as_ref());
        let quality = self.quality.classify(&aligned)?;
        result.quality = Some(quality.class);
        result.quality_score = Some(quality.score);

        let extract = match &self.assessor {
            None => true,
            Some(assessor) => {
                let assessment = assessor.assess(&aligned)?;
                result.quality_assessment = Some(assessment.class);
                if options.enroll {
                    let passed =
                        quality.class == FaceQualityClass::Good && assessment.class == FaceQualityClass::Good;
                    if !passed {
                        result.quality_assessment = Some(FaceQualityClass::Bad);
                    }
                    passed
                } else {
                    quality.class != FaceQualityClass::WearingMask
                }
            }
        };

        if extract {
            result.embedding = Some(self.recognizer.extract(&aligned)?);
        }

        tracing::info!(
            faces = result.face_count,
            enroll = options.enroll,
            quality = ?result.quality,
            assessment = ?result.quality_assessment,
            real = ?result.spoofing.map(|s| s.is_real),
            embedded = result.embedding.is_some(),
            "extraction complete"
        );
        Ok(result)
    }
}
