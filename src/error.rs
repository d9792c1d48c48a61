use std::path::PathBuf;

use polars::prelude::PolarsError;
use smartcore::error::Failed;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrokeError {
    #[error("cannot access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed record at line {line}: {message}")]
    Record { line: u64, message: String },
    #[error("invalid configuration {path:?}: {message}")]
    Config { path: PathBuf, message: String },
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("failed to draw {path:?}: {message}")]
    Plot { path: PathBuf, message: String },
    #[error("model failure: {0}")]
    Model(#[from] Failed),
    #[error("serialization failure: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Polars(#[from] PolarsError),
}

impl StrokeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StrokeError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StrokeError::InvalidData(message.into())
    }
}

impl From<csv::Error> for StrokeError {
    fn from(e: csv::Error) -> Self {
        let line = e.position().map(|p| p.line()).unwrap_or(0);
        StrokeError::Record {
            line,
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrokeError>;
