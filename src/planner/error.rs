//! Planner error types

/// Planner error
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlannerError {
    /// A non-aggregated column survived the group-by rewrite
    #[error("column '{0}' must appear in GROUP BY or an aggregate")]
    MissingGroupBy(String),
    /// Memo extraction found a group with no physical member
    #[error("no physical plan for group {0}")]
    NoPhysicalPlan(usize),
    /// A requested expression could not be resolved against a child
    #[error("cannot resolve '{0}' against child output")]
    UnresolvedExpr(String),
    /// Unsupported plan shape
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Invalid plan structure
    #[error("internal planner error: {0}")]
    Internal(String),
}

/// Result type for planner operations
pub type PlannerResult<T> = Result<T, PlannerError>;
