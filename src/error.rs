//! Error types for vocoder training.
//!
//! Checkpoint-identity errors are fatal and propagate to the process
//! boundary; restarting against the latest checkpoint is the only recovery
//! mechanism. Gradient anomalies are handled locally in the training loop
//! and never surface here.

use thiserror::Error;

/// Main error type for training operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TrainError {
    /// Errors from the candle tensor library
    #[error("candle error: {0}")]
    Candle(String),

    /// Exactly one of the paired checkpoint artifacts exists
    #[error("the {identity} checkpoint is corrupted: {message}")]
    CorruptedCheckpoint { identity: String, message: String },

    /// Neither checkpoint artifact exists and creation was not requested
    #[error("the {identity} checkpoint could not be found")]
    MissingCheckpoint { identity: String },

    /// Batch size not divisible by the visible parallel device count
    #[error("batch size {batch_size} is not evenly divisible by {device_count} parallel devices")]
    InvalidBatchSize {
        batch_size: usize,
        device_count: usize,
    },

    /// Malformed checkpoint contents (readable pair, bad payload)
    #[error("checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// Configuration validation failures
    #[error("configuration error: {0}")]
    Config(String),

    /// Data loading failures
    #[error("data loading error: {0}")]
    DataLoading(String),
}

/// Result type alias for training operations.
pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        TrainError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        TrainError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

/// Helper trait for adding path context to IO operations.
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T> {
        self.map_err(|e| TrainError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint-content errors.
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> TrainError {
    TrainError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        let train_result: TrainResult<()> = result.with_path("/tmp/missing.txt");

        match train_result {
            Err(TrainError::Io { path, .. }) => assert_eq!(path, "/tmp/missing.txt"),
            _ => panic!("Expected IO error with path"),
        }
    }

    #[test]
    fn test_checkpoint_identity_messages() {
        let err = TrainError::MissingCheckpoint {
            identity: "latest".to_string(),
        };
        assert!(err.to_string().contains("latest"));

        let err = TrainError::InvalidBatchSize {
            batch_size: 33,
            device_count: 2,
        };
        assert!(err.to_string().contains("33"));
        assert!(err.to_string().contains("2"));
    }
}
