use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Format error: {0}")]
    Format(String),
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Unknown chunk: {0}")]
    UnknownChunk(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Permission error: {0}")]
    Permission(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
