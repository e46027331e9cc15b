use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::classifier::{ClassIndexError, ClassIndexTable};
use crate::config::{ConfigError, FallbackPolicy, GatewayConfig, LocalPaths, ModelSource, RegistryConfig};

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("Artifact missing: {0}")]
    ArtifactMissing(PathBuf),
    #[error("Registry unavailable for '{repo_id}': {reason}")]
    RegistryUnavailable { repo_id: String, reason: String },
    #[error("Hash mismatch: expected {expected}, got {actual} for {file}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("Invalid index mapping: {0}")]
    InvalidIndexMapping(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl ResolutionError {
    /// Failures attributable to the registry rather than the local machine.
    pub fn is_registry_failure(&self) -> bool {
        matches!(
            self,
            Self::RegistryUnavailable { .. } | Self::HashMismatch { .. }
        )
    }
}

impl From<ClassIndexError> for ResolutionError {
    fn from(err: ClassIndexError) -> Self {
        match err {
            ClassIndexError::IoError(e) => ResolutionError::IoError(e),
            other => ResolutionError::InvalidIndexMapping(other.to_string()),
        }
    }
}

/// Existing, readable locations of the weights and class index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub weights_path: PathBuf,
    pub index_path: PathBuf,
}

/// Turns a [`ModelSource`] into an [`ArtifactPaths`] pair.
///
/// Registry downloads land in `cache_dir/<owner>--<name>/<revision>/<file>`
/// and are reused on later resolutions without touching the network. The
/// first successful resolution is memoised for the lifetime of the resolver.
#[derive(Clone)]
pub struct ArtifactResolver {
    source: ModelSource,
    fallback: FallbackPolicy,
    local: LocalPaths,
    registry: RegistryConfig,
    cache_dir: PathBuf,
    client: reqwest::Client,
    download_lock: Arc<Mutex<()>>,
    resolved: Arc<StdMutex<Option<ArtifactPaths>>>,
}

impl ArtifactResolver {
    pub fn new(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.registry.connect_timeout)
            .timeout(config.registry.download_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            source: config.source.clone(),
            fallback: config.fallback,
            local: config.local.clone(),
            registry: config.registry.clone(),
            cache_dir: config.cache_dir.clone(),
            client,
            download_lock: Arc::new(Mutex::new(())),
            resolved: Arc::new(StdMutex::new(None)),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache location for `file_name` from `repo_id`.
    pub fn cached_path(&self, repo_id: &str, file_name: &str) -> PathBuf {
        self.cache_dir
            .join(repo_id.replace('/', "--"))
            .join(&self.registry.revision)
            .join(file_name)
    }

    /// Resolves the configured source, reusing an earlier success.
    pub async fn resolve(&self) -> Result<ArtifactPaths, ResolutionError> {
        if let Some(paths) = self.memoised() {
            log::debug!("Reusing resolved artifacts {:?}", paths);
            return Ok(paths);
        }

        let paths = match &self.source {
            ModelSource::Local => self.resolve_local()?,
            ModelSource::Remote { repo_id } => match self.resolve_remote(repo_id).await {
                Ok(paths) => paths,
                Err(err) if err.is_registry_failure() && self.fallback == FallbackPolicy::Local => {
                    log::warn!("{}; falling back to local artifacts", err);
                    self.resolve_local().map_err(|local_err| {
                        log::error!("Local fallback failed: {}", local_err);
                        err
                    })?
                }
                Err(err) => return Err(err),
            },
        };

        log::info!(
            "Resolved artifacts: weights {:?}, index {:?}",
            paths.weights_path,
            paths.index_path
        );
        if let Ok(mut slot) = self.resolved.lock() {
            *slot = Some(paths.clone());
        }
        Ok(paths)
    }

    fn memoised(&self) -> Option<ArtifactPaths> {
        self.resolved.lock().ok().and_then(|slot| slot.clone())
    }

    /// Checks the local pair. A missing index is derived from `class_dir`
    /// when one is configured and written next to where it was expected.
    pub fn resolve_local(&self) -> Result<ArtifactPaths, ResolutionError> {
        let weights_path = &self.local.weights_path;
        let index_path = &self.local.index_path;
        log::info!("Checking local artifacts:");
        log::info!("  Weights path: {:?} (exists: {})", weights_path, weights_path.is_file());
        log::info!("  Index path: {:?} (exists: {})", index_path, index_path.is_file());

        if !weights_path.is_file() {
            return Err(ResolutionError::ArtifactMissing(weights_path.clone()));
        }
        if !index_path.is_file() {
            match &self.local.class_dir {
                Some(class_dir) if class_dir.is_dir() => {
                    log::info!("Deriving class index from {:?}", class_dir);
                    ClassIndexTable::from_directory(class_dir)?.write_json(index_path)?;
                }
                _ => return Err(ResolutionError::ArtifactMissing(index_path.clone())),
            }
        }

        Ok(ArtifactPaths {
            weights_path: weights_path.clone(),
            index_path: index_path.clone(),
        })
    }

    async fn resolve_remote(&self, repo_id: &str) -> Result<ArtifactPaths, ResolutionError> {
        let _lock = self.download_lock.lock().await;

        let weights_path = self
            .fetch(repo_id, &self.registry.weights_file, self.registry.weights_sha256.as_deref())
            .await?;
        let index_path = self
            .fetch(repo_id, &self.registry.index_file, self.registry.index_sha256.as_deref())
            .await?;

        Ok(ArtifactPaths {
            weights_path,
            index_path,
        })
    }

    /// Returns the cached copy of `file_name`, downloading it first when it is
    /// absent or fails verification.
    async fn fetch(
        &self,
        repo_id: &str,
        file_name: &str,
        expected_hash: Option<&str>,
    ) -> Result<PathBuf, ResolutionError> {
        let path = self.cached_path(repo_id, file_name);
        if path.is_file() {
            match expected_hash {
                Some(expected) if !verify_file(&path, expected)? => {
                    log::warn!("Cached {} failed verification, redownloading", file_name);
                }
                _ => {
                    log::info!("Using cached {} at {:?}", file_name, path);
                    return Ok(path);
                }
            }
        }

        let url = format!(
            "{}/{}/resolve/{}/{}",
            self.registry.endpoint.trim_end_matches('/'),
            repo_id,
            self.registry.revision,
            file_name
        );
        self.download_and_verify_file(repo_id, &url, &path, expected_hash)
            .await?;
        Ok(path)
    }

    async fn download_and_verify_file(
        &self,
        repo_id: &str,
        url: &str,
        path: &Path,
        expected_hash: Option<&str>,
    ) -> Result<(), ResolutionError> {
        let unavailable = |reason: String| ResolutionError::RegistryUnavailable {
            repo_id: repo_id.to_string(),
            reason,
        };

        log::info!("Downloading {} to {:?}", url, path);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| unavailable(describe(&e)))?;
        log::info!("Download response status: {}", response.status());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| unavailable(describe(&e)))?;
        log::info!("Downloaded {} bytes", bytes.len());

        if let Some(expected) = expected_hash {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                log::error!("Hash mismatch for {}: expected {}, got {}", url, expected, actual);
                return Err(ResolutionError::HashMismatch {
                    file: url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        // Write to a sibling temp file and rename so a crash never leaves a
        // truncated artifact in the cache
        let parent = path
            .parent()
            .ok_or_else(|| ResolutionError::ArtifactMissing(path.to_path_buf()))?;
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.persist(path).map_err(|e| ResolutionError::IoError(e.error))?;

        log::info!("{} downloaded successfully", url);
        Ok(())
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timed out: {}", err)
    } else {
        err.to_string()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn verify_file(path: &Path, expected_hash: &str) -> Result<bool, ResolutionError> {
    log::info!("Verifying file: {:?}", path);
    let bytes = fs::read(path)?;
    let hash = sha256_hex(&bytes);
    log::debug!("Calculated hash: {}", hash);
    log::debug!("Expected hash:   {}", expected_hash);
    Ok(hash.eq_ignore_ascii_case(expected_hash))
}
