pub mod class_index;
pub mod engine;
pub mod error;
pub mod model;
pub mod preprocess;
pub(crate) mod utils;

pub use class_index::{ClassIndexError, ClassIndexTable};
pub use engine::{InferenceEngine, PredictionResult, RankedClass};
pub use error::EngineError;
pub use model::{ForwardPass, ModelLoader, OnnxLoader, OnnxModel};
pub use preprocess::{ImagePreprocessor, Normalization, TensorLayout, INPUT_SIZE};
