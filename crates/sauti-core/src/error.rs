//! Error types shared by the queue, scheduler and storage layers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Job item not found: {0}")]
    ItemNotFound(String),

    #[error("Job item {item_id} already finished with status '{status}'")]
    ItemAlreadyFinished { item_id: String, status: String },

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Engine not registered: {0}")]
    EngineNotRegistered(String),

    #[error("Inference error: {0}")]
    InferenceError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
