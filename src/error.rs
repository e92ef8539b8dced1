//! Error types for scour

use thiserror::Error;

/// Result type for scour operations
pub type Result<T> = std::result::Result<T, ScourError>;

/// Scour error types
#[derive(Error, Debug)]
pub enum ScourError {
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Unparseable path: {0}")]
    UnparseablePath(String),

    #[error("Link verification failed for {path}: expected {expected}, got {actual}")]
    LinkMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Layer {layer} not found reference from manifest {manifest}")]
    LayerNotFound { layer: String, manifest: String },

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Task error: {0}")]
    Task(String),
}
