//! Error types for segue-engine.
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. The audio callback never sees these; it degrades to silence
//! and leaves reporting to the worker threads.

use thiserror::Error;

/// Main error type for segue-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Audio device could not be opened or started
    #[error("Audio device error: {0}")]
    Device(String),

    /// File could not be read from disk
    #[error("File read error: {path}: {source}")]
    FileRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No registered decoder accepted the file
    #[error("Unsupported format: {path}")]
    UnsupportedFormat { path: std::path::PathBuf },

    /// Audio decoding errors (general)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Track scanner could not open its reader
    #[error("Scan error: {0}")]
    Scan(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using segue-engine Error
pub type Result<T> = std::result::Result<T, Error>;
