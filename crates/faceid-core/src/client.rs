//! Model inference boundary.
//!
//! Every forward pass in the crate goes through [`ModelClient`]. The bundled
//! [`OrtModelClient`] runs ONNX models locally; tests and remote deployments
//! provide their own implementation.

use ndarray::{Array4, ArrayD, IxDyn};
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

const ORT_INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model {model}: missing output {output}")]
    MissingOutput { model: String, output: String },
    #[error("model {model}: invalid output: {reason}")]
    InvalidOutput { model: String, reason: String },
    #[error("model {0}: session lock poisoned")]
    Poisoned(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensors of one call, in the model's declared output order.
#[derive(Debug, Clone, Default)]
pub struct ModelOutputs {
    outputs: Vec<(String, ArrayD<f32>)>,
}

impl ModelOutputs {
    pub fn new(outputs: Vec<(String, ArrayD<f32>)>) -> Self {
        Self { outputs }
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.outputs.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn get(&self, index: usize) -> Option<&ArrayD<f32>> {
        self.outputs.get(index).map(|(_, t)| t)
    }

    pub fn by_name(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Positional lookup that reports a missing output against `model`.
    pub fn require(&self, model: &str, index: usize) -> Result<&ArrayD<f32>, InferenceError> {
        self.get(index).ok_or_else(|| InferenceError::MissingOutput {
            model: model.to_string(),
            output: format!("#{index}"),
        })
    }
}

/// Synchronous tensor inference.
///
/// Errors are returned as-is to the caller; implementations must not retry.
pub trait ModelClient: Send + Sync {
    fn infer(
        &self,
        model_name: &str,
        timeout: Duration,
        input: Array4<f32>,
    ) -> Result<ModelOutputs, InferenceError>;
}

struct LoadedModel {
    session: Mutex<Session>,
    output_names: Vec<String>,
}

/// Local ONNX Runtime client. Sessions are opened on first use from
/// `<model_dir>/<model_name>.onnx` and kept for the client's lifetime.
pub struct OrtModelClient {
    model_dir: PathBuf,
    sessions: Mutex<HashMap<String, Arc<LoadedModel>>>,
}

impl OrtModelClient {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn model(&self, model_name: &str) -> Result<Arc<LoadedModel>, InferenceError> {
        if let Some(model) = self.lock_sessions(model_name)?.get(model_name) {
            return Ok(Arc::clone(model));
        }

        // Loaded without the cache lock held.
        let loaded = Arc::new(load_model(&self.model_dir, model_name)?);

        // A concurrent caller may have loaded the same model first; keep theirs.
        let mut sessions = self.lock_sessions(model_name)?;
        let model = sessions.entry(model_name.to_string()).or_insert(loaded);
        Ok(Arc::clone(model))
    }

    fn lock_sessions(
        &self,
        model_name: &str,
    ) -> Result<MutexGuard<'_, HashMap<String, Arc<LoadedModel>>>, InferenceError> {
        self.sessions
            .lock()
            .map_err(|_| InferenceError::Poisoned(model_name.to_string()))
    }
}

fn load_model(model_dir: &Path, model_name: &str) -> Result<LoadedModel, InferenceError> {
    let path = model_dir.join(format!("{model_name}.onnx"));
    if !path.exists() {
        return Err(InferenceError::ModelNotFound(path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(ORT_INTRA_THREADS)?
        .commit_from_file(&path)?;
    let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

    tracing::info!(
        model = model_name,
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?output_names,
        "loaded model"
    );

    Ok(LoadedModel {
        session: Mutex::new(session),
        output_names,
    })
}

impl ModelClient for OrtModelClient {
    fn infer(
        &self,
        model_name: &str,
        timeout: Duration,
        input: Array4<f32>,
    ) -> Result<ModelOutputs, InferenceError> {
        let model = self.model(model_name)?;
        let started = Instant::now();

        let mut session = model
            .session
            .lock()
            .map_err(|_| InferenceError::Poisoned(model_name.to_string()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut collected = Vec::with_capacity(model.output_names.len());
        for (idx, name) in model.output_names.iter().enumerate() {
            let (shape, data) = outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                InferenceError::InvalidOutput {
                    model: model_name.to_string(),
                    reason: format!("{name}: {e}"),
                }
            })?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            let tensor = ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|e| {
                InferenceError::InvalidOutput {
                    model: model_name.to_string(),
                    reason: format!("{name}: {e}"),
                }
            })?;
            collected.push((name.clone(), tensor));
        }

        let elapsed = started.elapsed();
        if elapsed > timeout {
            tracing::warn!(
                model = model_name,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "inference exceeded timeout"
            );
        } else {
            tracing::debug!(model = model_name, elapsed_ms = elapsed.as_millis() as u64, "inference done");
        }

        Ok(ModelOutputs::new(collected))
    }
}
