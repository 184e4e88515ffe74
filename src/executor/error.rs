//! Executor error types

use crate::catalog::CatalogError;

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Executor errors
///
/// Runtime errors abort the current statement; the catalog is left
/// intact and no partial rows are delivered.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Catalog lookup failed at execution time
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Runtime evaluation failure (division by zero, bad operand)
    #[error("evaluation error: {0}")]
    Eval(String),

    /// A scalar subquery produced more than one row
    #[error("scalar subquery produced more than one row")]
    SubqueryMultipleRows,

    /// External file could not be read
    #[error("cannot read '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A CSV field failed to parse as its column type
    #[error("cannot parse '{value}' as {ty}")]
    FieldParse { value: String, ty: String },

    /// Plan/executor inconsistency
    #[error("internal executor error: {0}")]
    Internal(String),
}
