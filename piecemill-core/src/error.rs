use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("file universe is empty or cannot reach the target size")]
    EmptyUniverse,

    #[error("invalid piece size: {0}")]
    InvalidPieceSize(String),

    #[error("payload of {0} bytes is too small to commit")]
    PayloadTooSmall(u64),

    #[error("source file not found: {}", .0.display())]
    MissingSourceFile(PathBuf),

    #[error("commitment mismatch: expected {expected}, got {actual}")]
    CommitmentMismatch { expected: String, actual: String },

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("deal tool failed: {0}")]
    DealTool(String),

    #[error("failed to parse deal tool response: {0}")]
    ParseResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PieceError>;
