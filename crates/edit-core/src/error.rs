use std::path::PathBuf;
use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown parameter: {0}")]
    MissingParameter(String),
    #[error("shape mismatch for {name}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("invalid tensor: shape {shape:?} holds {expected} elements, data has {found}")]
    InvalidTensor {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },
    #[error("expected a 2-d tensor, got shape {0:?}")]
    NotAMatrix(Vec<usize>),
    #[error("invalid record at {path}: {reason}")]
    InvalidRecord { path: PathBuf, reason: String },
    #[error("unknown dataset name: {0}")]
    UnknownDataset(String),
    #[error("artifact already exists: {0}")]
    AlreadyExists(PathBuf),
}
