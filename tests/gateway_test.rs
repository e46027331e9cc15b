use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use env_logger::{Builder, Env};
use leafscope::{
    EngineError, ForwardPass, Gateway, GatewayConfig, GatewayError, ModelLoader, ModelSource,
    ReadinessState, SharedGateway,
};
use ndarray::Array4;

fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

struct CountingModel {
    output: Vec<f32>,
    forwards: Arc<AtomicUsize>,
}

impl ForwardPass for CountingModel {
    fn forward(&self, _input: Array4<f32>) -> Result<Vec<f32>, EngineError> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// Loader that can be held open, made to fail, and counts its invocations.
#[derive(Default)]
struct TestLoader {
    loads: AtomicUsize,
    forwards: Arc<AtomicUsize>,
    failures_left: AtomicUsize,
    gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl TestLoader {
    fn failing_once() -> Self {
        Self {
            failures_left: AtomicUsize::new(1),
            ..Self::default()
        }
    }

    fn gated() -> (Self, std::sync::mpsc::Sender<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let loader = Self {
            gate: Mutex::new(Some(rx)),
            ..Self::default()
        };
        (loader, tx)
    }
}

impl ModelLoader for TestLoader {
    fn load(&self, _weights_path: &Path) -> Result<Box<dyn ForwardPass>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(rx) = self.gate.lock().unwrap().take() {
            let _ = rx.recv();
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::LoadError("weights are corrupt".into()));
        }
        Ok(Box::new(CountingModel {
            output: vec![0.6, 0.3, 0.1],
            forwards: Arc::clone(&self.forwards),
        }))
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    gateway: SharedGateway,
    loader: Arc<TestLoader>,
}

impl Fixture {
    fn new(loader: TestLoader) -> Self {
        init();
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("final_model.onnx");
        let index = dir.path().join("class_indices.json");
        fs::write(&weights, b"weights").unwrap();
        fs::write(&index, r#"{"healthy": 0, "rust": 1, "scab": 2}"#).unwrap();

        let mut config = GatewayConfig::local(weights, index);
        config.results_path = dir.path().join("predictions.json");
        config.upload_dir = dir.path().join("uploads");
        config.top_k = 3;

        let loader = Arc::new(loader);
        let gateway = Gateway::with_loader(config, loader.clone()).unwrap();
        Self { dir, gateway, loader }
    }

    fn upload_dir(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    fn leftover_uploads(&self) -> usize {
        fs::read_dir(self.upload_dir()).map(|d| d.count()).unwrap_or(0)
    }
}

fn png_leaf() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb([40, 160, 50]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

async fn wait_until_settled(gateway: &SharedGateway) -> ReadinessState {
    for _ in 0..500 {
        let state = gateway.state();
        if !matches!(state, ReadinessState::Loading | ReadinessState::NotLoaded) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gateway never left the loading state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_during_load_are_retryable_and_skip_inference() {
    let (loader, release) = TestLoader::gated();
    let fx = Fixture::new(loader);

    assert!(fx.gateway.trigger_load());
    assert_eq!(fx.gateway.state(), ReadinessState::Loading);

    let err = fx.gateway.predict_upload(png_leaf(), None).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotReady { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.status_code(), 503);
    assert_eq!(fx.loader.forwards.load(Ordering::SeqCst), 0);

    release.send(()).unwrap();
    assert_eq!(wait_until_settled(&fx.gateway).await, ReadinessState::Ready);

    let result = fx.gateway.predict_upload(png_leaf(), None).await.unwrap();
    assert_eq!(result.predicted_class, "healthy");
    assert_eq!(fx.loader.forwards.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_load_once() {
    let fx = Fixture::new(TestLoader::default());

    let mut handles = Vec::new();
    for i in 0..16 {
        let gateway = Arc::clone(&fx.gateway);
        handles.push(tokio::spawn(async move {
            match i % 3 {
                0 => {
                    gateway.trigger_load();
                }
                1 => {
                    gateway.health();
                }
                _ => {
                    let _ = gateway.predict_upload(png_leaf(), None).await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(wait_until_settled(&fx.gateway).await, ReadinessState::Ready);
    assert_eq!(fx.loader.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_first_request_starts_lazy_load() {
    let fx = Fixture::new(TestLoader::default());
    assert_eq!(fx.gateway.state(), ReadinessState::NotLoaded);

    let err = fx.gateway.predict_upload(png_leaf(), None).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(wait_until_settled(&fx.gateway).await, ReadinessState::Ready);
}

#[tokio::test]
async fn test_failed_load_needs_explicit_reload() {
    let fx = Fixture::new(TestLoader::failing_once());

    let state = fx.gateway.load().await;
    assert!(matches!(state, ReadinessState::Failed(ref reason) if reason.contains("corrupt")));

    let err = fx.gateway.predict_upload(png_leaf(), None).await.unwrap_err();
    assert!(matches!(err, GatewayError::LoadFailed(_)));
    assert!(!err.is_retryable());
    assert_eq!(err.status_code(), 500);

    // Probes and requests do not retry a failed load on their own
    let report = fx.gateway.health();
    assert_eq!(report.status, "error");
    assert!(!fx.gateway.trigger_load());
    assert_eq!(fx.loader.loads.load(Ordering::SeqCst), 1);

    assert!(fx.gateway.trigger_reload());
    assert_eq!(wait_until_settled(&fx.gateway).await, ReadinessState::Ready);
    assert_eq!(fx.loader.loads.load(Ordering::SeqCst), 2);
    assert!(fx.gateway.predict_upload(png_leaf(), None).await.is_ok());
}

#[tokio::test]
async fn test_missing_weights_fail_the_load() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::local(dir.path().join("absent.onnx"), dir.path().join("idx.json"));
    config.results_path = dir.path().join("predictions.json");
    let gateway = Gateway::with_loader(config, Arc::new(TestLoader::default())).unwrap();

    let state = gateway.load().await;
    assert!(matches!(state, ReadinessState::Failed(ref reason) if reason.contains("absent.onnx")));
    let report = gateway.health();
    assert!(!report.model_loaded);
    assert!(report.reason.is_some());
}

#[tokio::test]
async fn test_sink_holds_latest_result() {
    let fx = Fixture::new(TestLoader::default());
    fx.gateway.load().await;

    let first = fx.gateway.predict_upload(png_leaf(), Some(3)).await.unwrap();
    assert_eq!(first.predictions.len(), 3);
    let second = fx.gateway.predict_upload(png_leaf(), Some(1)).await.unwrap();

    let on_disk = fx.gateway.latest_prediction().unwrap();
    assert_eq!(on_disk, Some(second));
}

#[tokio::test]
async fn test_uploads_are_removed_on_every_path() {
    let fx = Fixture::new(TestLoader::default());
    fx.gateway.load().await;

    fx.gateway.predict_upload(png_leaf(), None).await.unwrap();
    assert_eq!(fx.leftover_uploads(), 0);

    let err = fx
        .gateway
        .predict_upload(b"GIF89a but not really".to_vec(), None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(fx.leftover_uploads(), 0);
}

#[tokio::test]
async fn test_empty_upload_is_rejected() {
    let fx = Fixture::new(TestLoader::default());
    fx.gateway.load().await;

    let err = fx.gateway.predict_upload(Vec::new(), None).await.unwrap_err();
    assert!(matches!(err, GatewayError::MissingUpload(_)));
    assert_eq!(fx.leftover_uploads(), 0);
    assert_eq!(fx.gateway.latest_prediction().unwrap(), None);
}

#[tokio::test]
async fn test_predict_path_persists() {
    let fx = Fixture::new(TestLoader::default());
    fx.gateway.load().await;

    let image_path = fx.dir.path().join("leaf.png");
    fs::write(&image_path, png_leaf()).unwrap();
    let result = fx.gateway.predict_path(&image_path, Some(2)).unwrap();

    assert_eq!(result.predictions.len(), 2);
    assert_eq!(fx.gateway.sink().latest().unwrap(), Some(result));
}

#[tokio::test]
async fn test_silent_registry_fails_the_load() {
    init();
    // Accepts connections and never writes a byte back
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig {
        source: ModelSource::Remote {
            repo_id: "owner/leaf-model".to_string(),
        },
        cache_dir: dir.path().join("cache"),
        results_path: dir.path().join("predictions.json"),
        ..GatewayConfig::default()
    };
    config.registry.endpoint = format!("http://{}", addr);
    config.registry.download_timeout = Duration::from_millis(300);
    let gateway = Gateway::with_loader(config, Arc::new(TestLoader::default())).unwrap();

    let state = tokio::time::timeout(Duration::from_secs(10), gateway.load())
        .await
        .expect("load never finished");
    assert!(
        matches!(state, ReadinessState::Failed(ref reason) if reason.contains("Registry unavailable")),
        "got {:?}",
        state
    );

    // Leaving Failed means an explicit reload is possible again
    assert!(gateway.trigger_reload());
}
