use std::fs;
use std::path::Path;
use std::time::Instant;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::class_index::ClassIndexTable;
use super::error::EngineError;
use super::model::{ForwardPass, ModelLoader};
use super::preprocess::ImagePreprocessor;
use super::utils::{is_distribution, rank_top_k, round4, softmax};
use crate::artifacts::ArtifactPaths;

/// One entry of a ranked prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedClass {
    #[serde(rename = "class")]
    pub label: String,
    pub probability: f64,
}

/// Outcome of classifying one image. This is also the on-disk format read by
/// the display consumer, so field names are part of the public contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_class: String,
    pub confidence: f64,
    pub predictions: Vec<RankedClass>,
}

/// A loaded classifier plus everything needed to turn image bytes into a
/// [`PredictionResult`].
///
/// # Thread Safety
///
/// The engine is immutable after construction and is `Send + Sync`; share it
/// with `Arc` and call `predict` from as many threads as needed.
pub struct InferenceEngine {
    model: Box<dyn ForwardPass>,
    classes: ClassIndexTable,
    preprocessor: ImagePreprocessor,
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<InferenceEngine>();
    }
};

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("num_classes", &self.classes.len())
            .field("preprocessor", &self.preprocessor)
            .finish()
    }
}

impl InferenceEngine {
    pub fn new(
        model: Box<dyn ForwardPass>,
        classes: ClassIndexTable,
        preprocessor: ImagePreprocessor,
    ) -> Self {
        if let Some(width) = model.output_width() {
            if width != classes.len() {
                warn!(
                    "Model emits {} classes but the class index has {} entries; unmatched indices get placeholder labels",
                    width,
                    classes.len()
                );
            }
        }
        Self {
            model,
            classes,
            preprocessor,
        }
    }

    /// Loads the class index and deserializes the weights. Called once per
    /// successful load attempt.
    pub fn load(
        paths: &ArtifactPaths,
        loader: &dyn ModelLoader,
        preprocessor: ImagePreprocessor,
    ) -> Result<Self, EngineError> {
        let start = Instant::now();
        let classes = ClassIndexTable::from_file(&paths.index_path)?;
        if classes.is_empty() {
            return Err(EngineError::LoadError(format!(
                "Class index {:?} has no entries",
                paths.index_path
            )));
        }

        info!("Loading model weights from {:?}", paths.weights_path);
        let model = loader.load(&paths.weights_path)?;
        info!("Model loaded in {:.2?}", start.elapsed());

        Ok(Self::new(model, classes, preprocessor))
    }

    pub fn classes(&self) -> &ClassIndexTable {
        &self.classes
    }

    /// Runs preprocessing and the forward pass, returning one probability per
    /// class. Logits are passed through softmax; the result always sums to 1.
    pub fn probabilities(&self, image_bytes: &[u8]) -> Result<Vec<f32>, EngineError> {
        let input = self.preprocessor.prepare(image_bytes)?;
        let raw = self.model.forward(input)?;

        if raw.is_empty() {
            return Err(EngineError::InferenceError("Model returned no class scores".into()));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InferenceError(
                "Model output contains non-finite values".into(),
            ));
        }

        if is_distribution(&raw) {
            Ok(raw)
        } else {
            Ok(softmax(&raw))
        }
    }

    /// Arg-max prediction; `predictions` holds the single winning class.
    pub fn predict(&self, image_bytes: &[u8]) -> Result<PredictionResult, EngineError> {
        self.predict_top_k(image_bytes, 1)
    }

    /// The `k` most likely classes, highest first. Equal probabilities keep
    /// model output order. Probabilities are rounded to 4 decimal places.
    pub fn predict_top_k(&self, image_bytes: &[u8], k: usize) -> Result<PredictionResult, EngineError> {
        let probs = self.probabilities(image_bytes)?;
        Ok(self.rank(&probs, k.max(1)))
    }

    pub fn predict_file<P: AsRef<Path>>(&self, path: P, k: usize) -> Result<PredictionResult, EngineError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            EngineError::ImageDecodeError(format!("Cannot read {:?}: {}", path, e))
        })?;
        self.predict_top_k(&bytes, k)
    }

    fn rank(&self, probs: &[f32], k: usize) -> PredictionResult {
        let predictions: Vec<RankedClass> = rank_top_k(probs, k)
            .into_iter()
            .map(|index| RankedClass {
                label: self.classes.label(index).into_owned(),
                probability: round4(probs[index]),
            })
            .collect();

        // rank_top_k never returns fewer than one index for non-empty input
        let (predicted_class, confidence) = predictions
            .first()
            .map(|top| (top.label.clone(), top.probability))
            .unwrap_or_default();

        PredictionResult {
            predicted_class,
            confidence,
            predictions,
        }
    }
}
