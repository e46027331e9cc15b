use ort::Error as OrtError;
use std::fmt;

use super::class_index::ClassIndexError;

/// Errors raised while loading a model or running a prediction.
#[derive(Debug)]
pub enum EngineError {
    /// The weights or class index could not be deserialized
    LoadError(String),
    /// The input is not a readable image
    ImageDecodeError(String),
    /// The forward pass failed or produced unusable output
    InferenceError(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadError(msg) => write!(f, "Load error: {}", msg),
            Self::ImageDecodeError(msg) => write!(f, "Image decode error: {}", msg),
            Self::InferenceError(msg) => write!(f, "Inference error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<OrtError> for EngineError {
    fn from(err: OrtError) -> Self {
        EngineError::InferenceError(err.to_string())
    }
}

impl From<ClassIndexError> for EngineError {
    fn from(err: ClassIndexError) -> Self {
        EngineError::LoadError(err.to_string())
    }
}

impl From<image::ImageError> for EngineError {
    fn from(err: image::ImageError) -> Self {
        EngineError::ImageDecodeError(err.to_string())
    }
}
