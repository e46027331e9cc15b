//! A model-serving gateway for a plant leaf disease image classifier.
//!
//! The gateway resolves model artifacts (local files or a remote registry
//! with an on-disk cache), loads them in the background, gates requests on
//! a readiness state machine and serves ranked predictions over HTTP.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use leafscope::{Gateway, GatewayConfig};
//!
//! let config = GatewayConfig::local("final_model.onnx", "class_indices.json");
//! let gateway = Gateway::new(config)?;
//!
//! gateway.load().await;
//! let result = gateway.predict_path("leaf.jpg".as_ref(), Some(3))?;
//! println!("{} ({:.2}%)", result.predicted_class, result.confidence * 100.0);
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! [`Gateway`] is shared as an `Arc` between request handlers. The loaded
//! [`InferenceEngine`] is read-only and serves concurrent predictions without
//! locking; only the readiness state itself sits behind a lock.

pub mod artifacts;
pub mod classifier;
pub mod config;
pub mod error;
pub mod gateway;
pub mod readiness;
mod runtime;
pub mod server;
pub mod sink;

pub use artifacts::{ArtifactPaths, ArtifactResolver, ResolutionError};
pub use classifier::{
    ClassIndexError, ClassIndexTable, EngineError, ForwardPass, ImagePreprocessor, InferenceEngine,
    ModelLoader, Normalization, OnnxLoader, PredictionResult, RankedClass, TensorLayout,
};
pub use config::{Args, ConfigError, FallbackPolicy, GatewayConfig, ModelSource};
pub use error::{ErrorBody, GatewayError};
pub use gateway::{Gateway, HealthReport, SharedGateway};
pub use readiness::{Admission, Readiness, ReadinessState};
pub use runtime::{create_session_builder, RuntimeConfig};
pub use sink::{ResultSink, SinkError};

pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
