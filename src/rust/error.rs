use std::io;

use serde::Serialize;

use crate::artifacts::ResolutionError;
use crate::classifier::EngineError;
use crate::sink::SinkError;

/// Errors surfaced to callers of the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No model is usable yet; the caller should retry shortly.
    #[error("Model is not ready ({state})")]
    NotReady { state: &'static str },
    /// The last load attempt failed and will not be retried on its own.
    #[error("Model not loaded - {0}")]
    LoadFailed(String),
    #[error("Missing upload: {0}")]
    MissingUpload(String),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Failed to persist result: {0}")]
    Sink(#[from] SinkError),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// JSON payload returned for every failed request.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub retryable: bool,
}

impl GatewayError {
    /// HTTP status the routing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotReady { .. } => 503,
            Self::MissingUpload(_) => 400,
            Self::Engine(EngineError::ImageDecodeError(_)) => 400,
            Self::LoadFailed(_)
            | Self::Resolution(_)
            | Self::Engine(_)
            | Self::Sink(_)
            | Self::IoError(_)
            | Self::TaskFailed(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    /// Message safe to show to the client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotReady { state } if *state == "loading" => {
                "Model is still loading, please try again in a few moments".to_string()
            }
            Self::NotReady { .. } => "Model loading has started, please try again shortly".to_string(),
            Self::LoadFailed(reason) => format!("Model not loaded - {}", reason),
            Self::MissingUpload(msg) => msg.clone(),
            Self::Engine(EngineError::ImageDecodeError(_)) => {
                "Uploaded file is not a readable image".to_string()
            }
            Self::Engine(_) | Self::TaskFailed(_) => "Prediction failed".to_string(),
            Self::Resolution(_) => "Model artifacts could not be resolved".to_string(),
            Self::Sink(_) | Self::IoError(_) => "Internal server error".to_string(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.public_message(),
            retryable: self.is_retryable(),
        }
    }
}
