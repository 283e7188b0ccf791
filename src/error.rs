use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy for a batch run.
///
/// Only `Configuration` is meant to reach the caller of a batch. The other
/// variants are contained per subject by the dispatcher.
#[derive(Error, Debug)]
pub(crate) enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("integrity error: {path} references missing output {missing}")]
    Integrity { path: PathBuf, missing: PathBuf },

    #[error("engine error in {stage}: {message}")]
    Engine { stage: String, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn engine(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Attach a path to `std::io::Error` results.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| PipelineError::io(path, e))
    }
}
