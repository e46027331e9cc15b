use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;

use crate::classifier::PredictionResult;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Keeps the most recent prediction at a fixed path for the display consumer.
///
/// Each write goes to a temporary file in the same directory which is then
/// renamed over the target, so readers see either the previous result or the
/// new one, never a partial or merged file. Concurrent predictions race:
/// whichever rename lands last wins, with no ordering relative to request
/// arrival.
#[derive(Debug, Clone)]
pub struct ResultSink {
    path: PathBuf,
}

impl ResultSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persist(&self, result: &PredictionResult) -> Result<(), SinkError> {
        self.write_json(result)?;
        info!(
            "Persisted prediction '{}' ({:.4}) to {:?}",
            result.predicted_class, result.confidence, self.path
        );
        Ok(())
    }

    /// The last persisted result, or `None` if nothing has been written yet.
    pub fn latest(&self) -> Result<Option<PredictionResult>, SinkError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_json<T: Serialize>(&self, value: &T) -> Result<(), SinkError> {
        let json = serde_json::to_vec_pretty(value)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| SinkError::IoError(e.error))?;
        debug!("Wrote {} bytes to {:?}", json.len(), self.path);
        Ok(())
    }
}
