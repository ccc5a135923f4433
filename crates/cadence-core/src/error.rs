//! Error type shared by every Cadence crate.

use thiserror::Error;

/// Cadence error type.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used across Cadence.
pub type Result<T> = std::result::Result<T, CadenceError>;

impl CadenceError {
    /// Shorthand for a store error from any displayable backend error.
    pub fn store(e: impl std::fmt::Display) -> Self {
        Self::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_variant_context() {
        let e = CadenceError::InvalidTransition {
            from: "completed".into(),
            to: "pending".into(),
        };
        assert_eq!(e.to_string(), "Invalid transition: completed -> pending");
        assert_eq!(CadenceError::store("locked").to_string(), "Store error: locked");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: CadenceError = io.into();
        assert!(matches!(e, CadenceError::Io(_)));
    }
}
