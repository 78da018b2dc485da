#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Location inside the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Byte offset from the start of the text.
    pub offset: usize,
    /// One-based line number.
    pub line: usize,
    /// One-based column, counted in characters.
    pub column: usize,
}

impl Position {
    /// Resolves a byte offset into line/column coordinates.
    pub fn locate(text: &str, offset: usize) -> Self {
        let offset = offset.min(text.len());
        let mut line = 1;
        let mut column = 1;
        for (idx, ch) in text.char_indices() {
            if idx >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Self {
            offset,
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Malformed or unsupported query text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("syntax error at {position}: {message}")]
pub struct SyntaxError {
    /// What went wrong.
    pub message: String,
    /// Where it went wrong.
    pub position: Position,
}

impl SyntaxError {
    pub(crate) fn at(text: &str, offset: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: Position::locate(text, offset),
        }
    }

    /// Returns a machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        "SyntaxError"
    }
}

/// Static scoping violations detected during algebra translation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// An expression references a variable that is never bound where it is evaluated.
    #[error("variable '?{var}' used in {context} is not bound in its scope")]
    UnboundVariable { var: String, context: &'static str },
    /// BIND or a select expression assigns to a variable already in scope.
    #[error("variable '?{var}' is already bound before {context}")]
    AlreadyBound { var: String, context: &'static str },
    /// Aggregate query projects a variable that is neither grouped nor aggregated.
    #[error("variable '?{var}' is projected but neither grouped nor aggregated")]
    UngroupedVariable { var: String },
    /// The same output name appears twice in the projection.
    #[error("variable '?{var}' is projected more than once")]
    DuplicateProjection { var: String },
    /// Aggregate function used outside SELECT, HAVING or ORDER BY of a grouped query.
    #[error("aggregate used in {context}")]
    MisplacedAggregate { context: &'static str },
}

impl ScopeError {
    /// Builds an [`ScopeError::UnboundVariable`] for a specific context.
    pub fn unbound(var: impl Into<String>, context: &'static str) -> Self {
        ScopeError::UnboundVariable {
            var: var.into(),
            context,
        }
    }

    /// Builds an [`ScopeError::AlreadyBound`] for a specific context.
    pub fn rebound(var: impl Into<String>, context: &'static str) -> Self {
        ScopeError::AlreadyBound {
            var: var.into(),
            context,
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            ScopeError::UnboundVariable { .. } => "UnboundVariable",
            ScopeError::AlreadyBound { .. } => "AlreadyBound",
            ScopeError::UngroupedVariable { .. } => "UngroupedVariable",
            ScopeError::DuplicateProjection { .. } => "DuplicateProjection",
            ScopeError::MisplacedAggregate { .. } => "MisplacedAggregate",
        }
    }
}

/// Failures while choosing algorithms and adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanningError {
    /// The query needs data but the context names no source.
    #[error("query has no data sources")]
    NoSources,
    /// No adapter can answer a pattern in the shape it is evaluated with.
    #[error("no source can answer pattern {pattern} with shape {shape}")]
    NoCapableSource { pattern: String, shape: String },
    /// The algebra tree violates an operator's arity.
    #[error("malformed algebra: {0}")]
    Malformed(String),
}

impl PlanningError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            PlanningError::NoSources => "NoSources",
            PlanningError::NoCapableSource { .. } => "NoCapableSource",
            PlanningError::Malformed(_) => "MalformedAlgebra",
        }
    }
}

/// Convenience wrapper that formats stage errors with their codes.
pub struct ErrorWithCode<'a, E>(pub &'a E);

impl fmt::Display for ErrorWithCode<'_, ScopeError> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

impl fmt::Display for ErrorWithCode<'_, PlanningError> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
