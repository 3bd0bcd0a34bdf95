//! faceid-core: RetinaFace decoding, face selection and liveness fusion.
//!
//! Network forward passes go through the [`client::ModelClient`] trait; this
//! crate owns input encoding and the decoding of raw outputs into face boxes,
//! landmarks, quality classes, embeddings and liveness decisions.

pub mod alignment;
pub mod anchors;
pub mod client;
pub mod config;
pub mod decode;
pub mod detector;
pub mod liveness;
pub mod nms;
pub mod pipeline;
pub mod preprocess;
pub mod quality;
pub mod recognizer;
pub mod selection;
pub mod types;

pub use client::{InferenceError, ModelClient, ModelOutputs, OrtModelClient};
pub use config::PipelineConfig;
pub use detector::FaceDetector;
pub use pipeline::{ExtractOptions, ExtractPipeline, ExtractionResult, PipelineError};
pub use selection::{FaceSelector, SelectionPolicy};
pub use types::{Detections, Embedding, FaceBox, Landmarks, SelectedFace};
