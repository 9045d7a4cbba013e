//! Error types for the table editor.

use std::io;
use thiserror::Error;

/// Boxed error returned by external collaborators (validator, renderer, merger).
pub type ExternalError = Box<dyn std::error::Error + Send + Sync>;

/// Editor error type
#[derive(Error, Debug)]
pub enum EditorError {
    /// A referenced session, document, row, cell or item does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is well-formed but cannot be applied to the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A document does not follow the table markup contract.
    #[error("Parse failure: {0}")]
    ParseFailure(String),

    #[error("{collaborator} failed: {message}")]
    ExternalFailure {
        collaborator: &'static str,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] bincode::Error),
}

impl EditorError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EditorError::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        EditorError::InvalidState(what.into())
    }

    pub fn parse(what: impl Into<String>) -> Self {
        EditorError::ParseFailure(what.into())
    }

    /// Wrap a collaborator failure with the collaborator's name as context.
    pub fn external(collaborator: &'static str, err: ExternalError) -> Self {
        EditorError::ExternalFailure {
            collaborator,
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EditorError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EditorError>;
