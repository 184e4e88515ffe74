//! opaldb - an in-memory analytical SQL query engine
//!
//! The crate is the compiler pipeline of a small SQL engine: name
//! binding, a bound expression algebra with correlated subqueries, a
//! logical plan with top-down ordinal resolution, a Cascades-style
//! memo optimizer, and a pull-model row executor.

pub mod catalog;
pub mod engine;
pub mod executor;
pub mod planner;
pub mod sql;

pub use engine::{Database, Error};
pub use executor::{Datum, Row};
pub use planner::{ExplainOptions, QueryOptions};
