use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unreadable document: {0}")]
    Unreadable(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("embedding request failed: {0}")]
    Embedding(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ocr fallback failed: {0}")]
    OcrFailed(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no index artifact at {0}; run `case-qa build-index` first")]
    Missing(PathBuf),

    #[error("index artifact is corrupt: {0}")]
    Corrupt(String),

    #[error("another build already holds the lock for {0}")]
    BuildInProgress(PathBuf),

    #[error("index directory path is not usable: {0}")]
    InvalidIndexDir(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message is required")]
    EmptyMessage,

    #[error("unsupported upload: {0}")]
    UnsupportedUpload(String),

    #[error("supply either an uploaded document or raw document text, not both")]
    ConflictingContextInputs,

    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("retrieval failed: {0}")]
    Retrieval(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
