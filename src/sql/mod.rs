//! SQL layer - parsing and binding
//!
//! This module provides:
//! - `Parser`: parses SQL text and lowers it into the crate's AST
//! - `Binder`: resolves names and types against the catalog, producing
//!   bound expressions and the statement's table-ref arena
//! - `Expr`: the bound expression algebra shared by planner and executor

pub mod ast;
pub mod binder;
pub mod error;
pub mod expr;
pub mod parser;

pub use binder::{Binder, Bound, BoundQuery, BoundSelect, FromNode, TableRefData, TableRefKind};
pub use error::{SqlError, SqlResult};
pub use expr::{Expr, ExprKind, SubqueryKind, TableRefId};
pub use parser::Parser;
