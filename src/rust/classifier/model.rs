use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use log::info;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;

use super::error::EngineError;
use crate::runtime::{create_session_builder, RuntimeConfig};

/// A loaded classifier graph.
///
/// Implementations are read-only after construction and are shared across
/// concurrent predictions, hence `Send + Sync`.
pub trait ForwardPass: Send + Sync {
    /// Runs one batch-of-one input and returns the raw output row
    /// (probabilities or logits, one entry per class).
    fn forward(&self, input: Array4<f32>) -> Result<Vec<f32>, EngineError>;

    /// Number of classes the model emits, when known before running it.
    fn output_width(&self) -> Option<usize> {
        None
    }
}

/// Deserializes a weights file into a [`ForwardPass`].
pub trait ModelLoader: Send + Sync {
    fn load(&self, weights_path: &Path) -> Result<Box<dyn ForwardPass>, EngineError>;
}

/// ONNX Runtime session wrapping an exported image classifier.
///
/// The ONNX model is expected to:
/// - Accept one float input of shape `[1, 256, 256, 3]` or `[1, 3, 256, 256]`
/// - Emit one output of shape `[1, num_classes]`
pub struct OnnxModel {
    session: Session,
    input_name: String,
    output_width: Option<usize>,
}

impl fmt::Debug for OnnxModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxModel")
            .field("input_name", &self.input_name)
            .field("output_width", &self.output_width)
            .finish()
    }
}

impl OnnxModel {
    pub fn from_file<P: AsRef<Path>>(path: P, config: &RuntimeConfig) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let session = create_session_builder(config)
            .map_err(EngineError::LoadError)?
            .commit_from_file(path)
            .map_err(|e| EngineError::LoadError(format!("Failed to load {:?}: {}", path, e)))?;

        Self::validate_model(&session)?;
        info!("Model structure validated successfully");

        let input_name = session.inputs[0].name.clone();
        let output_width = session.outputs[0]
            .output_type
            .tensor_dimensions()
            .and_then(|dims| dims.last().copied())
            .and_then(|width| usize::try_from(width).ok())
            .filter(|&width| width > 0);

        Ok(Self {
            session,
            input_name,
            output_width,
        })
    }

    /// Validates that the model has one input and at least one output
    fn validate_model(session: &Session) -> Result<(), EngineError> {
        // Check inputs
        if session.inputs.len() != 1 {
            return Err(EngineError::LoadError(format!(
                "Model must have exactly 1 image input, found {}",
                session.inputs.len()
            )));
        }

        // Check outputs
        if session.outputs.is_empty() {
            return Err(EngineError::LoadError(
                "Model must have at least 1 output for class scores".to_string(),
            ));
        }

        Ok(())
    }
}

impl ForwardPass for OnnxModel {
    fn forward(&self, input: Array4<f32>) -> Result<Vec<f32>, EngineError> {
        let input_dyn = input.into_dyn();
        let input_array = input_dyn.as_standard_layout();

        let mut input_tensors = HashMap::new();
        input_tensors.insert(
            self.input_name.as_str(),
            Tensor::from_array(&input_array).map_err(|e| {
                EngineError::InferenceError(format!("Failed to create input tensor: {}", e))
            })?,
        );

        let outputs = self
            .session
            .run(input_tensors)
            .map_err(|e| EngineError::InferenceError(format!("Failed to run model: {}", e)))?;
        let output_tensor = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            EngineError::InferenceError(format!("Failed to extract output tensor: {}", e))
        })?;

        let shape = output_tensor.shape();
        let batch_of_one = match shape.len() {
            1 => true,
            2 => shape[0] == 1,
            _ => false,
        };
        if !batch_of_one {
            return Err(EngineError::InferenceError(format!(
                "Unexpected output shape {:?}, expected [1, num_classes]",
                shape
            )));
        }

        Ok(output_tensor.iter().copied().collect())
    }

    fn output_width(&self) -> Option<usize> {
        self.output_width
    }
}

/// Loads `.onnx` weights through the shared ONNX Runtime environment.
#[derive(Debug, Clone, Default)]
pub struct OnnxLoader {
    pub runtime: RuntimeConfig,
}

impl OnnxLoader {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, weights_path: &Path) -> Result<Box<dyn ForwardPass>, EngineError> {
        let model = OnnxModel::from_file(weights_path, &self.runtime)?;
        Ok(Box::new(model))
    }
}
