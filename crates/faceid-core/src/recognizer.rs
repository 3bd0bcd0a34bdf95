//! ArcFace face recognizer.
//!
//! Extracts L2-normalised embeddings from aligned face crops. Crops are sent in
//! fixed-size batches; the final batch is zero-padded and the padding rows of the
//! output are discarded.

use crate::client::{InferenceError, ModelClient};
use crate::config::RecognitionParams;
use crate::preprocess::{batch_tensor, resize, ChannelOrder, Normalization};
use crate::types::Embedding;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_SCALE: f32 = 0.0078125; // 1/128, not 1/127.5

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model {model}: expected [{rows}, D] embeddings, got {shape:?}")]
    BadOutput {
        model: String,
        rows: usize,
        shape: Vec<usize>,
    },
    #[error("inference: {0}")]
    Inference(#[from] InferenceError),
}

pub struct FaceRecognizer {
    client: Arc<dyn ModelClient>,
    params: RecognitionParams,
}

impl FaceRecognizer {
    pub fn new(client: Arc<dyn ModelClient>, params: RecognitionParams) -> Self {
        Self { client, params }
    }

    pub fn extract(&self, aligned: &RgbImage) -> Result<Embedding, RecognizerError> {
        let mut embeddings = self.extract_batch(std::slice::from_ref(aligned))?;
        embeddings.pop().ok_or_else(|| RecognizerError::BadOutput {
            model: self.params.model_name.clone(),
            rows: 1,
            shape: vec![0],
        })
    }

    pub fn extract_batch(&self, aligned: &[RgbImage]) -> Result<Vec<Embedding>, RecognizerError> {
        let size = self.params.image_size;
        let batch = self.params.batch_size.max(1);
        let model = self.params.model_name.as_str();
        let norm = Normalization::uniform(ARCFACE_MEAN, ARCFACE_SCALE);

        let resized: Vec<RgbImage> = aligned.iter().map(|img| resize(img, size, size)).collect();
        let mut embeddings = Vec::with_capacity(aligned.len());

        for chunk in resized.chunks(batch) {
            let input = batch_tensor(chunk, batch, (size, size), ChannelOrder::Rgb, norm);
            let outputs = self.client.infer(model, self.params.timeout(), input)?;
            let out = outputs.require(model, 0)?;

            let bad_output = || RecognizerError::BadOutput {
                model: model.to_string(),
                rows: chunk.len(),
                shape: out.shape().to_vec(),
            };
            let rows = out.shape().first().copied().unwrap_or(0);
            if rows < chunk.len() || out.is_empty() {
                return Err(bad_output());
            }
            let dim = out.len() / rows;
            let table = out.to_shape((rows, dim)).map_err(|_| bad_output())?;

            for row in table.rows().into_iter().take(chunk.len()) {
                embeddings.push(l2_normalize(row.to_vec()));
            }
        }

        tracing::debug!(faces = aligned.len(), model, "extracted embeddings");
        Ok(embeddings)
    }
}

fn l2_normalize(raw: Vec<f32>) -> Embedding {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    let values = if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    };
    Embedding { values }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ModelOutputs;
    use image::Rgb;
    use ndarray::{Array4, ArrayD, IxDyn};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Embedding row `n` is `[first red value of input n, 3, 4]`.
    struct EchoClient {
        batches: Mutex<Vec<Vec<usize>>>,
    }

    impl ModelClient for EchoClient {
        fn infer(&self, _model: &str, _timeout: Duration, input: Array4<f32>) -> Result<ModelOutputs, InferenceError> {
            self.batches.lock().unwrap().push(input.shape().to_vec());
            let n = input.shape()[0];
            let mut out = ArrayD::<f32>::zeros(IxDyn(&[n, 3]));
            for r in 0..n {
                out[[r, 0].as_slice()] = input[[r, 0, 0, 0]];
                out[[r, 1].as_slice()] = 3.0;
                out[[r, 2].as_slice()] = 4.0;
            }
            Ok(ModelOutputs::new(vec![("embedding".to_string(), out)]))
        }
    }

    fn recognizer(batch_size: usize) -> (FaceRecognizer, Arc<EchoClient>) {
        let client = Arc::new(EchoClient {
            batches: Mutex::new(Vec::new()),
        });
        let params = RecognitionParams {
            batch_size,
            ..RecognitionParams::default()
        };
        (FaceRecognizer::new(client.clone(), params), client)
    }

    #[test]
    fn test_embedding_is_l2_normalized() {
        let (rec, _) = recognizer(1);
        let face = RgbImage::from_pixel(112, 112, Rgb([127, 127, 127]));
        let e = rec.extract(&face).unwrap();
        let norm: f32 = e.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_input_normalization() {
        // 255 → (255 - 127.5) / 128 = 0.99609375, then normalised with [3, 4]
        let (rec, _) = recognizer(1);
        let e = rec.extract(&RgbImage::from_pixel(112, 112, Rgb([255, 0, 0]))).unwrap();
        let x = 0.99609375f32;
        let norm = (x * x + 25.0).sqrt();
        assert!((e.values[0] - x / norm).abs() < 1e-5);
    }

    #[test]
    fn test_batches_are_padded_and_trimmed() {
        let (rec, client) = recognizer(4);
        let faces: Vec<RgbImage> = (0..6).map(|_| RgbImage::new(64, 64)).collect();
        let embeddings = rec.extract_batch(&faces).unwrap();
        assert_eq!(embeddings.len(), 6);

        let batches = client.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![4, 3, 112, 112]);
        assert_eq!(batches[1], vec![4, 3, 112, 112]);
    }

    #[test]
    fn test_zero_vector_left_unchanged() {
        let e = l2_normalize(vec![0.0, 0.0]);
        assert_eq!(e.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_similarity_between_extractions() {
        let (rec, _) = recognizer(2);
        let faces = vec![
            RgbImage::from_pixel(112, 112, Rgb([255, 0, 0])),
            RgbImage::from_pixel(112, 112, Rgb([255, 0, 0])),
        ];
        let e = rec.extract_batch(&faces).unwrap();
        assert!((e[0].similarity(&e[1]) - 1.0).abs() < 1e-6);
    }
}
