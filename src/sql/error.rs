//! SQL error types

use crate::catalog::DataType;

/// Errors raised while parsing and binding a statement
#[derive(Debug, Clone, thiserror::Error)]
pub enum SqlError {
    /// Parse error from sqlparser or statement lowering
    #[error("parse error: {0}")]
    Parse(String),
    /// Table not found during binding
    #[error("table '{0}' not found")]
    UnknownTable(String),
    /// Column not found during binding
    #[error("column '{0}' not found")]
    UnknownColumn(String),
    /// Column exists in more than one table in scope
    #[error("column '{0}' is ambiguous")]
    AmbiguousColumn(String),
    /// Duplicate alias in one FROM clause
    #[error("table alias '{0}' already used in this scope")]
    TableAliasConflict(String),
    /// Bind-time type check failed
    #[error("type mismatch: {left} vs {right} in {context}")]
    TypeMismatch {
        left: DataType,
        right: DataType,
        context: String,
    },
    /// Scalar or IN subquery with other than one output column
    #[error("subquery must produce exactly one column, got {0}")]
    SubqueryShape(usize),
    /// Unsupported SQL feature
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<sqlparser::parser::ParserError> for SqlError {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        SqlError::Parse(err.to_string())
    }
}

/// Result type for SQL operations
pub type SqlResult<T> = Result<T, SqlError>;
