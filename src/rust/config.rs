use std::env;
use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::classifier::{Normalization, TensorLayout};
use crate::runtime::RuntimeConfig;

pub const DEFAULT_REPO_ID: &str = "rishabh914/leaf-disease-detection";
pub const DEFAULT_REGISTRY_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_WEIGHTS_FILE: &str = "final_model.onnx";
pub const DEFAULT_INDEX_FILE: &str = "class_indices.json";
pub const DEFAULT_RESULTS_PATH: &str = "predictions.json";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_TOP_K: usize = 5;
/// Seconds allowed to establish a registry connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Seconds allowed for one artifact download, start to finish.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid registry id '{0}': expected 'owner/name'")]
    InvalidRepoId(String),
    #[error("top_k must be at least 1")]
    InvalidTopK,
    #[error("{0} file name cannot be empty")]
    EmptyFileName(&'static str),
    #[error("Invalid bind address '{0}'")]
    InvalidHost(String),
    #[error("Registry timeouts must be greater than zero")]
    InvalidTimeout,
    #[error("Failed to build registry client: {0}")]
    HttpClient(String),
}

/// Where the model artifacts come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Weights and class index are read from the configured local paths.
    Local,
    /// Weights and class index are fetched from a registry repository.
    Remote { repo_id: String },
}

impl ModelSource {
    pub fn repo_id(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Remote { repo_id } => Some(repo_id),
        }
    }

    /// Short name reported by the health endpoint.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote { .. } => "remote",
        }
    }
}

/// What to do when the registry cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FallbackPolicy {
    /// Fail the load attempt with `RegistryUnavailable`.
    #[default]
    Strict,
    /// Use the local artifact pair if it exists, logging a warning. Applies
    /// when the registry cannot be reached, times out, or serves bytes that
    /// fail the configured sha256 check. Local cache I/O errors still fail.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    Local,
    Remote,
}

/// Local artifact locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPaths {
    pub weights_path: PathBuf,
    pub index_path: PathBuf,
    /// Directory of class-named subfolders used to derive the index when
    /// `index_path` does not exist yet.
    pub class_dir: Option<PathBuf>,
}

impl Default for LocalPaths {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::from(DEFAULT_WEIGHTS_FILE),
            index_path: PathBuf::from(DEFAULT_INDEX_FILE),
            class_dir: None,
        }
    }
}

/// Registry connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub endpoint: String,
    pub revision: String,
    pub weights_file: String,
    pub index_file: String,
    pub weights_sha256: Option<String>,
    pub index_sha256: Option<String>,
    pub connect_timeout: Duration,
    /// Upper bound on a whole download, so a registry that accepts the
    /// connection and never answers fails the load instead of stalling it.
    pub download_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_REGISTRY_ENDPOINT.to_string(),
            revision: "main".to_string(),
            weights_file: DEFAULT_WEIGHTS_FILE.to_string(),
            index_file: DEFAULT_INDEX_FILE.to_string(),
            weights_sha256: None,
            index_sha256: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
        }
    }
}

/// Fully resolved gateway configuration. Build it from [`Args`] or by hand,
/// then call [`GatewayConfig::validate`] once before starting.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub source: ModelSource,
    pub fallback: FallbackPolicy,
    pub local: LocalPaths,
    pub registry: RegistryConfig,
    pub cache_dir: PathBuf,
    pub results_path: PathBuf,
    /// Scratch directory for uploaded images while they are classified.
    pub upload_dir: PathBuf,
    pub top_k: usize,
    pub normalization: Normalization,
    pub layout: TensorLayout,
    pub runtime: RuntimeConfig,
    pub host: String,
    pub port: u16,
    pub eager_load: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            source: ModelSource::Remote {
                repo_id: DEFAULT_REPO_ID.to_string(),
            },
            fallback: FallbackPolicy::default(),
            local: LocalPaths::default(),
            registry: RegistryConfig::default(),
            cache_dir: default_cache_dir(),
            results_path: PathBuf::from(DEFAULT_RESULTS_PATH),
            upload_dir: env::temp_dir(),
            top_k: DEFAULT_TOP_K,
            normalization: Normalization::default(),
            layout: TensorLayout::default(),
            runtime: RuntimeConfig::default(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            eager_load: true,
        }
    }
}

impl GatewayConfig {
    /// Config for serving the local artifact pair with no registry access.
    pub fn local(weights_path: impl Into<PathBuf>, index_path: impl Into<PathBuf>) -> Self {
        Self {
            source: ModelSource::Local,
            local: LocalPaths {
                weights_path: weights_path.into(),
                index_path: index_path.into(),
                class_dir: None,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ModelSource::Remote { repo_id } = &self.source {
            let mut parts = repo_id.split('/');
            let valid = matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(owner), Some(name), None) if !owner.trim().is_empty() && !name.trim().is_empty()
            );
            if !valid {
                return Err(ConfigError::InvalidRepoId(repo_id.clone()));
            }
            if self.registry.weights_file.is_empty() {
                return Err(ConfigError::EmptyFileName("Weights"));
            }
            if self.registry.index_file.is_empty() {
                return Err(ConfigError::EmptyFileName("Index"));
            }
            if self.registry.connect_timeout.is_zero() || self.registry.download_timeout.is_zero() {
                return Err(ConfigError::InvalidTimeout);
            }
        }
        if self.local.weights_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyFileName("Weights"));
        }
        if self.local.index_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyFileName("Index"));
        }
        if self.top_k == 0 {
            return Err(ConfigError::InvalidTopK);
        }
        if self.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }
        Ok(())
    }
}

/// Returns the default artifact cache directory
pub fn default_cache_dir() -> PathBuf {
    cache_dir_from(env::var_os("LEAFSCOPE_CACHE"))
}

/// Cache directory given the value of `LEAFSCOPE_CACHE`, if set.
pub fn cache_dir_from(override_dir: Option<OsString>) -> PathBuf {
    // 1. Explicit override
    if let Some(path) = override_dir.filter(|p| !p.is_empty()) {
        return PathBuf::from(path).join("models");
    }

    // 2. Use platform-specific cache directory
    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join("leafscope").join("models");
    }

    // 3. Fallback to user's home directory
    if let Some(home_dir) = dirs::home_dir() {
        return home_dir.join(".cache").join("leafscope").join("models");
    }

    // 4. If all else fails, use system temp directory
    env::temp_dir().join("leafscope").join("models")
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Where to load the model from
    #[arg(long, value_enum, env = "LEAFSCOPE_SOURCE", default_value = "remote")]
    pub source: SourceKind,

    /// Registry repository id (owner/name)
    #[arg(long, env = "HF_REPO_ID", default_value = DEFAULT_REPO_ID)]
    pub repo_id: String,

    /// Registry base URL
    #[arg(long, env = "LEAFSCOPE_REGISTRY", default_value = DEFAULT_REGISTRY_ENDPOINT)]
    pub registry: String,

    /// Registry revision (branch, tag or commit)
    #[arg(long, default_value = "main")]
    pub revision: String,

    /// Behaviour when the registry is unreachable
    #[arg(long, value_enum, env = "LEAFSCOPE_FALLBACK", default_value = "strict")]
    pub fallback: FallbackPolicy,

    /// Local model weights
    #[arg(long, env = "LEAFSCOPE_WEIGHTS", default_value = DEFAULT_WEIGHTS_FILE)]
    pub weights: PathBuf,

    /// Local class index JSON (label -> index)
    #[arg(long, env = "LEAFSCOPE_INDEX", default_value = DEFAULT_INDEX_FILE)]
    pub index: PathBuf,

    /// Directory of class-named subfolders used to derive a missing index
    #[arg(long)]
    pub class_dir: Option<PathBuf>,

    /// Expected sha256 of the weights file
    #[arg(long)]
    pub weights_sha256: Option<String>,

    /// Expected sha256 of the class index file
    #[arg(long)]
    pub index_sha256: Option<String>,

    /// Seconds allowed to connect to the registry
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout: u64,

    /// Seconds allowed for each artifact download
    #[arg(long, env = "LEAFSCOPE_DOWNLOAD_TIMEOUT", default_value_t = DEFAULT_DOWNLOAD_TIMEOUT_SECS)]
    pub download_timeout: u64,

    /// Artifact cache directory
    #[arg(long, env = "LEAFSCOPE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Where the latest prediction is written
    #[arg(long, env = "LEAFSCOPE_RESULTS", default_value = DEFAULT_RESULTS_PATH)]
    pub results: PathBuf,

    /// Scratch directory for uploads
    #[arg(long, env = "LEAFSCOPE_UPLOAD_DIR")]
    pub upload_dir: Option<PathBuf>,

    /// Number of ranked classes returned per prediction
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Pixel preprocessing applied before the forward pass
    #[arg(long, value_enum, default_value = "passthrough")]
    pub normalization: Normalization,

    /// Input tensor layout expected by the model
    #[arg(long, value_enum, default_value = "nhwc")]
    pub layout: TensorLayout,

    /// ONNX Runtime intra-op threads (0 lets the runtime decide)
    #[arg(long, default_value_t = 0)]
    pub intra_threads: usize,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Defer loading the model until the first health probe or request
    #[arg(long)]
    pub lazy: bool,

    /// Classify a single image file, print the result and exit
    #[arg(long)]
    pub image: Option<PathBuf>,
}

impl From<&Args> for GatewayConfig {
    fn from(args: &Args) -> Self {
        let source = match args.source {
            SourceKind::Local => ModelSource::Local,
            SourceKind::Remote => ModelSource::Remote {
                repo_id: args.repo_id.trim().to_string(),
            },
        };

        Self {
            source,
            fallback: args.fallback,
            local: LocalPaths {
                weights_path: args.weights.clone(),
                index_path: args.index.clone(),
                class_dir: args.class_dir.clone(),
            },
            registry: RegistryConfig {
                endpoint: args.registry.trim_end_matches('/').to_string(),
                revision: args.revision.clone(),
                weights_file: DEFAULT_WEIGHTS_FILE.to_string(),
                index_file: DEFAULT_INDEX_FILE.to_string(),
                weights_sha256: args.weights_sha256.clone(),
                index_sha256: args.index_sha256.clone(),
                connect_timeout: Duration::from_secs(args.connect_timeout),
                download_timeout: Duration::from_secs(args.download_timeout),
            },
            cache_dir: args.cache_dir.clone().unwrap_or_else(default_cache_dir),
            results_path: args.results.clone(),
            upload_dir: args.upload_dir.clone().unwrap_or_else(env::temp_dir),
            top_k: args.top_k,
            normalization: args.normalization,
            layout: args.layout,
            runtime: RuntimeConfig {
                intra_threads: args.intra_threads,
                ..RuntimeConfig::default()
            },
            host: args.host.clone(),
            port: args.port,
            eager_load: !args.lazy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fallback, FallbackPolicy::Strict);
        assert_eq!(config.source.repo_id(), Some(DEFAULT_REPO_ID));
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn test_rejects_malformed_repo_id() {
        for repo_id in ["", "no-slash", "a/b/c", "/name", "owner/"] {
            let config = GatewayConfig {
                source: ModelSource::Remote { repo_id: repo_id.to_string() },
                ..GatewayConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidRepoId(_))),
                "accepted {:?}",
                repo_id
            );
        }
    }

    #[test]
    fn test_rejects_zero_top_k() {
        let config = GatewayConfig {
            top_k: 0,
            ..GatewayConfig::local("w.onnx", "i.json")
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTopK)));
    }

    #[test]
    fn test_args_conversion() {
        let args = Args::parse_from([
            "leafscope",
            "--source",
            "local",
            "--weights",
            "/models/leaf.onnx",
            "--fallback",
            "local",
            "--top-k",
            "3",
            "--lazy",
        ]);
        let config = GatewayConfig::from(&args);
        assert_eq!(config.source, ModelSource::Local);
        assert_eq!(config.fallback, FallbackPolicy::Local);
        assert_eq!(config.local.weights_path, PathBuf::from("/models/leaf.onnx"));
        assert_eq!(config.top_k, 3);
        assert!(!config.eager_load);
    }

    #[test]
    fn test_cache_dir_override() {
        let path = cache_dir_from(Some(OsString::from("/tmp/leafscope-test-cache")));
        assert_eq!(path, PathBuf::from("/tmp/leafscope-test-cache/models"));
    }

    #[test]
    fn test_cache_dir_without_override() {
        for unset in [None, Some(OsString::new())] {
            let path = cache_dir_from(unset);
            assert!(path.ends_with("leafscope/models"), "got {:?}", path);
        }
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let mut config = GatewayConfig::default();
        config.registry.download_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout)));
    }

    #[test]
    fn test_timeout_args() {
        let args = Args::parse_from(["leafscope", "--download-timeout", "30"]);
        let config = GatewayConfig::from(&args);
        assert_eq!(config.registry.download_timeout, Duration::from_secs(30));
        assert_eq!(
            config.registry.connect_timeout,
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
    }
}
