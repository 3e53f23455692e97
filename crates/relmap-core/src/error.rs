//! Core error types.

use thiserror::Error;

/// Errors raised while compiling or executing queries and change batches.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] relmap_proto::Error),

    /// Entity type is not part of the model.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Property is not declared on the entity type.
    #[error("unknown property {property} on entity type {entity}")]
    UnknownProperty { entity: String, property: String },

    /// Navigation is not declared on the entity type.
    #[error("unknown navigation {navigation} on entity type {entity}")]
    UnknownNavigation { entity: String, navigation: String },

    /// Model metadata is inconsistent.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// The query cannot be translated.
    #[error("translation error: {0}")]
    Translation(String),

    /// An include was requested on a source backed by literal SQL that cannot be composed.
    #[error("include is not supported on source '{source_name}' backed by non-composable SQL")]
    IncludeOnRawSql { source_name: String },

    /// An operation was called out of order.
    #[error("usage error: {0}")]
    Usage(&'static str),

    /// The compiled query was executed in the wrong mode.
    #[error("query was compiled for {compiled} execution but run {requested}")]
    ExecutionMode {
        compiled: &'static str,
        requested: &'static str,
    },

    /// A query parameter was not supplied.
    #[error("missing value for query parameter '{0}'")]
    MissingParameter(String),

    /// A modification command is malformed.
    #[error("invalid modification command: {0}")]
    InvalidCommand(String),

    /// The affected-row count did not match the expectation.
    #[error("concurrency failure on {table}: expected {expected} affected row(s), got {actual}")]
    Concurrency {
        table: String,
        expected: u64,
        actual: u64,
    },

    /// The result sets returned by the server do not line up with the batch.
    #[error("unexpected result shape: {0}")]
    ResultShape(String),

    /// First/Single on an empty sequence.
    #[error("sequence contains no elements")]
    NoElements,

    /// Single on a sequence with more than one element.
    #[error("sequence contains more than one element")]
    MoreThanOneElement,

    /// Client evaluation failed.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection reported a failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
