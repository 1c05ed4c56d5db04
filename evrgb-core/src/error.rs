//! Error taxonomy shared by every pipeline stage.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while building a fused event/RGB segment.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required file, directory or dataset does not exist.
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// A file exists but its structure is not what the stage expects.
    #[error("Invalid format: {0}")]
    Format(String),

    /// An external process exited unsuccessfully.
    #[error("External tool '{tool}' failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// A numeric step (e.g. homography estimation) did not produce a usable result.
    #[error("Computation failed: {0}")]
    Computation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Builds a `MissingInput` error naming the absent path.
    pub fn missing(what: &str, path: &Path) -> Self {
        Self::MissingInput(format!("{} not found: {}", what, path.display()))
    }

    /// Maps an IO error on `path` to `MissingInput` when the file is absent.
    pub fn from_io_at(err: io::Error, path: &Path) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::MissingInput(path.display().to_string())
        } else {
            Self::Io(err)
        }
    }
}

/// Fails with `MissingInput` unless `path` exists.
pub fn require_file(what: &str, path: &Path) -> Result<PathBuf, PipelineError> {
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(PipelineError::missing(what, path))
    }
}
