//! Protocol error types.

use thiserror::Error;

/// Errors raised while building or decoding collaborator messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A row's width does not match the result set header.
    #[error("row width mismatch: expected {expected} columns, got {actual}")]
    RowWidth { expected: usize, actual: usize },

    /// A parameter name was bound twice in one command.
    #[error("duplicate parameter: {0}")]
    DuplicateParameter(String),

    /// The connection reported a failure.
    #[error("connection error: {0}")]
    Connection(String),
}
