//! Per-tick result files for continuous mode.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::PersistError;
use crate::types::AnalysisResult;

/// Writes each result as `tick_<iteration>_<request id>.json`.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// The directory is created on the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(iteration: u32, result: &AnalysisResult) -> String {
        format!("tick_{}_{}.json", iteration, result.request_id)
    }

    pub async fn save(&self, iteration: u32, result: &AnalysisResult) -> Result<PathBuf, PersistError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Self::file_name(iteration, result));
        let json = serde_json::to_vec_pretty(result)?;
        tokio::fs::write(&path, json).await?;
        debug!("Saved tick {} result to {:?}", iteration, path);
        Ok(path)
    }

    /// Read back a saved result.
    pub async fn load(path: impl AsRef<Path>) -> Result<AnalysisResult, PersistError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
