//! Error types for taintflow-engine
//!
//! Fatal conditions surface as [`EngineError`] and abort the analysis.
//! Malformed user models are deliberately NOT fatal: they are collected
//! as [`ModelError`] values per callable, reported, and the engine
//! continues with a safe default for the offending callable.

use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Scheduler error (pool construction, worker crash)
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Snapshot error (serialization, corrupt image)
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Create a scheduler error
    pub fn scheduler(msg: impl Into<String>) -> Self {
        EngineError::Scheduler(msg.into())
    }

    /// Create a snapshot error
    pub fn snapshot(msg: impl Into<String>) -> Self {
        EngineError::Snapshot(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        EngineError::Snapshot(format!("encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        EngineError::Snapshot(format!("decode error: {}", err))
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Recoverable defect in a user-supplied model for one callable.
///
/// Collected during model ingestion and reported alongside the analysis
/// results; the engine substitutes a default model and keeps going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelError {
    pub callable: String,
    pub message: String,
}

impl ModelError {
    pub fn new(callable: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            callable: callable.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid model for `{}`: {}", self.callable, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::scheduler("worker thread panicked");
        assert_eq!(format!("{}", err), "Scheduler error: worker thread panicked");
    }

    #[test]
    fn test_io_conversion() {
        fn read_missing() -> Result<Vec<u8>> {
            Ok(std::fs::read("/nonexistent/image.img")?)
        }
        let err = read_missing().unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn test_model_error_display() {
        let err = ModelError::new("app.views.render", "sink index 7 out of range");
        let msg = format!("{}", err);
        assert!(msg.contains("app.views.render"));
        assert!(msg.contains("sink index 7"));
    }
}
