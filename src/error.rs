use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::query::errors::{PlanningError, ScopeError, SyntaxError};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Category of a [`SourceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Reading the backing store failed.
    Io,
    /// The backing data could not be parsed.
    Parse,
    /// The remote endpoint answered with an error or could not be reached.
    Remote,
    /// A source descriptor could not be turned into an adapter.
    Resolution,
    /// The adapter was asked for a pattern shape it cannot answer.
    Unsupported,
}

impl SourceErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            SourceErrorKind::Io => "io",
            SourceErrorKind::Parse => "parse",
            SourceErrorKind::Remote => "remote",
            SourceErrorKind::Resolution => "resolution",
            SourceErrorKind::Unsupported => "unsupported",
        }
    }
}

/// Failure reported by a source adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("source '{source_name}' {} error: {message}", kind.as_str())]
pub struct SourceError {
    /// Name of the adapter that failed.
    pub source_name: String,
    /// Failure category.
    pub kind: SourceErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl SourceError {
    /// Creates a source error.
    pub fn new(source_name: impl Into<String>, kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            kind,
            message: message.into(),
        }
    }

    /// Wraps an I/O failure.
    pub fn io(source_name: impl Into<String>, err: &io::Error) -> Self {
        Self::new(source_name, SourceErrorKind::Io, err.to_string())
    }
}

/// Any failure surfaced by the query engine.
///
/// Cloneable so a failed result stream can report its terminal error on every
/// subsequent pull.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Query text is malformed or uses an unsupported construct.
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    /// Static scoping rule violated.
    #[error(transparent)]
    Scope(#[from] ScopeError),
    /// No viable physical plan.
    #[error(transparent)]
    Planning(#[from] PlanningError),
    /// A source adapter failed.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// The execution deadline passed.
    #[error("query exceeded its {budget:?} time budget")]
    Timeout {
        /// Configured budget.
        budget: Duration,
    },
    /// Execution stopped by a cancel request. Result handles report this as
    /// a stream state rather than an error.
    #[error("query was cancelled")]
    Cancelled,
    /// API misuse, e.g. asking an ASK result for bindings.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl QueryError {
    /// Returns a machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Syntax(err) => err.code(),
            QueryError::Scope(err) => err.code(),
            QueryError::Planning(err) => err.code(),
            QueryError::Source(_) => "SourceError",
            QueryError::Timeout { .. } => "Timeout",
            QueryError::Cancelled => "Cancelled",
            QueryError::Invalid(_) => "Invalid",
        }
    }

    /// Whether the error was raised before execution began.
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            QueryError::Syntax(_) | QueryError::Scope(_) | QueryError::Planning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_error_display_names_source_and_kind() {
        let err = SourceError::new("people.nt", SourceErrorKind::Parse, "bad line 3");
        assert_eq!(err.to_string(), "source 'people.nt' parse error: bad line 3");
        assert_eq!(QueryError::from(err).code(), "SourceError");
    }
}
