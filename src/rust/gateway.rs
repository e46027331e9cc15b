use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactPaths, ArtifactResolver};
use crate::classifier::{ImagePreprocessor, InferenceEngine, ModelLoader, OnnxLoader, PredictionResult};
use crate::config::{ConfigError, GatewayConfig};
use crate::error::GatewayError;
use crate::readiness::{Admission, Readiness, ReadinessState};
use crate::sink::ResultSink;

pub type SharedGateway = Arc<Gateway>;

/// Body of `GET /` and `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `not_loaded`, `loading`, `healthy` or `error`
    pub status: String,
    pub model_loaded: bool,
    pub model_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
    pub version: String,
}

/// The model-serving gateway: owns the readiness lifecycle, the loaded
/// engine and the result sink, and is shared by every request handler.
pub struct Gateway {
    config: GatewayConfig,
    resolver: ArtifactResolver,
    loader: Arc<dyn ModelLoader>,
    preprocessor: ImagePreprocessor,
    readiness: Readiness<InferenceEngine>,
    sink: ResultSink,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("source", &self.config.source)
            .field("state", &self.readiness.state())
            .finish()
    }
}

impl Gateway {
    /// Validates `config` and builds a gateway that loads ONNX weights.
    pub fn new(config: GatewayConfig) -> Result<SharedGateway, ConfigError> {
        let loader = Arc::new(OnnxLoader::new(config.runtime.clone()));
        Self::with_loader(config, loader)
    }

    pub fn with_loader(
        config: GatewayConfig,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<SharedGateway, ConfigError> {
        config.validate()?;
        info!(
            "Gateway configured: source {:?}, fallback {:?}, results {:?}",
            config.source, config.fallback, config.results_path
        );
        let resolver = ArtifactResolver::new(&config)?;
        Ok(Arc::new(Self {
            resolver,
            preprocessor: ImagePreprocessor::new(config.normalization, config.layout),
            sink: ResultSink::new(&config.results_path),
            readiness: Readiness::new(),
            loader,
            config,
        }))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn state(&self) -> ReadinessState {
        self.readiness.state()
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    /// Starts a background load if nothing has been loaded yet. Returns `true`
    /// when this call started it.
    pub fn trigger_load(self: &Arc<Self>) -> bool {
        if !self.readiness.try_begin_load() {
            return false;
        }
        self.spawn_load();
        true
    }

    /// Explicit retry: also leaves `Failed`.
    pub fn trigger_reload(self: &Arc<Self>) -> bool {
        if !self.readiness.try_begin_reload() {
            return false;
        }
        info!("Reload requested");
        self.spawn_load();
        true
    }

    fn spawn_load(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        tokio::spawn(async move { gateway.run_load().await });
    }

    /// Loads in the current task and returns the resulting state. If another
    /// load is already running or finished, returns the current state without
    /// starting a second one.
    pub async fn load(&self) -> ReadinessState {
        if self.readiness.try_begin_load() {
            self.run_load().await;
        }
        self.readiness.state()
    }

    /// Load sequence. Must only be entered by the caller that moved the state
    /// machine into `Loading`.
    async fn run_load(&self) {
        let start = Instant::now();
        match self.resolve_and_load().await {
            Ok(engine) => {
                info!("Model ready in {:.2?}", start.elapsed());
                self.readiness.complete(Arc::new(engine));
            }
            Err(e) => {
                error!("Model load failed: {}", e);
                self.readiness.fail(e.to_string());
            }
        }
    }

    async fn resolve_and_load(&self) -> Result<InferenceEngine, GatewayError> {
        let paths: ArtifactPaths = self.resolver.resolve().await?;
        let loader = Arc::clone(&self.loader);
        let preprocessor = self.preprocessor;
        let engine = tokio::task::spawn_blocking(move || {
            InferenceEngine::load(&paths, loader.as_ref(), preprocessor)
        })
        .await
        .map_err(|e| GatewayError::TaskFailed(e.to_string()))??;
        Ok(engine)
    }

    /// Returns the engine if requests may run. Observing `NotLoaded` kicks
    /// off a background load; `Failed` is reported, never retried here.
    fn admit(self: &Arc<Self>) -> Result<Arc<InferenceEngine>, GatewayError> {
        match self.readiness.admit() {
            Admission::Admitted(engine) => Ok(engine),
            Admission::Loading => Err(GatewayError::NotReady { state: "loading" }),
            Admission::NotLoaded => {
                self.trigger_load();
                Err(GatewayError::NotReady { state: "not_loaded" })
            }
            Admission::Failed(reason) => Err(GatewayError::LoadFailed(reason)),
        }
    }

    /// Health report. A probe that finds nothing loaded starts the load.
    pub fn health(self: &Arc<Self>) -> HealthReport {
        let mut state = self.readiness.state();
        if state == ReadinessState::NotLoaded && self.trigger_load() {
            state = self.readiness.state();
        }

        let (status, message) = match &state {
            ReadinessState::Ready => ("healthy", "Leaf disease detection API is running".to_string()),
            ReadinessState::Loading => ("loading", "Leaf disease detection API is loading the model".to_string()),
            ReadinessState::NotLoaded => ("not_loaded", "Model has not been loaded yet".to_string()),
            ReadinessState::Failed(reason) => ("error", format!("Model loading failed: {}", reason)),
        };

        HealthReport {
            status: status.to_string(),
            model_loaded: state.is_ready(),
            model_source: self.config.source.label().to_string(),
            hf_repo: self.config.source.repo_id().map(str::to_string),
            reason: state.failure_reason().map(str::to_string),
            message,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Classifies an uploaded image and persists the result.
    ///
    /// The upload is spooled to a temporary file under `upload_dir` for the
    /// duration of the call and removed on every exit path.
    pub async fn predict_upload(
        self: &Arc<Self>,
        upload: Vec<u8>,
        top_k: Option<usize>,
    ) -> Result<PredictionResult, GatewayError> {
        let engine = self.admit()?;
        if upload.is_empty() {
            return Err(GatewayError::MissingUpload("Uploaded file is empty".into()));
        }

        let k = top_k.unwrap_or(self.config.top_k).max(1);
        let upload_dir = self.config.upload_dir.clone();
        let sink = self.sink.clone();

        tokio::task::spawn_blocking(move || -> Result<PredictionResult, GatewayError> {
            std::fs::create_dir_all(&upload_dir)?;
            // Deleted when dropped, whichever way this closure returns
            let mut spooled = tempfile::Builder::new()
                .prefix("leafscope-upload-")
                .tempfile_in(&upload_dir)?;
            spooled.write_all(&upload)?;
            spooled.flush()?;

            let result = engine.predict_file(spooled.path(), k)?;
            sink.persist(&result)?;
            Ok(result)
        })
        .await
        .map_err(|e| GatewayError::TaskFailed(e.to_string()))?
        .map_err(|e| {
            error!("Prediction failed: {}", e);
            e
        })
    }

    /// Classifies an image file on disk and persists the result.
    pub fn predict_path(
        self: &Arc<Self>,
        path: &std::path::Path,
        top_k: Option<usize>,
    ) -> Result<PredictionResult, GatewayError> {
        let engine = self.admit()?;
        let k = top_k.unwrap_or(self.config.top_k).max(1);
        let result = engine.predict_file(path, k)?;
        if let Err(e) = self.sink.persist(&result) {
            warn!("Prediction succeeded but could not be persisted: {}", e);
            return Err(e.into());
        }
        Ok(result)
    }

    /// The last persisted prediction, if any.
    pub fn latest_prediction(&self) -> Result<Option<PredictionResult>, GatewayError> {
        Ok(self.sink.latest()?)
    }
}
