//! Query executor - pull-model row engine
//!
//! Each operator exposes `exec(ctx, cb)`: it drives its children and
//! invokes the callback once per output row. The callback receives the
//! execution context back, so nested operators (and the expression
//! interpreter underneath them) can publish and read correlation
//! parameters without fighting the borrow checker.
//!
//! Execution is single-threaded and cooperative: a statement runs to
//! completion inside one `Collect::run` call.

pub mod aggregate;
pub mod datum;
pub mod ddl;
pub mod error;
pub mod eval;
pub mod filter;
pub mod insert;
pub mod join;
pub mod limit;
pub mod row;
pub mod scan;
pub mod sort;

pub use datum::Datum;
pub use error::{ExecutorError, ExecutorResult};
pub use row::Row;
pub use scan::read_csv;

use std::collections::HashMap;
use std::rc::Rc;

use crate::catalog::Catalog;
use crate::planner::{PhysicNode, PhysicOp};
use crate::sql::expr::{Expr, TableRefId};

use eval::eval;

/// Cached result of an uncorrelated subquery
#[derive(Debug, Clone)]
pub enum SubqueryResult {
    Scalar(Datum),
    Exists(bool),
    Set(std::collections::HashSet<Datum>),
}

/// Per-execution state
///
/// `params` carries the current driving row of every table ref that is
/// the target of outer references; an outer-ref column always observes
/// the row written by the most recent enclosing publish.
pub struct ExecContext<'a> {
    /// Catalog the statement runs against
    pub catalog: &'a Catalog,
    /// Published rows, keyed by table ref id
    pub params: HashMap<TableRefId, Row>,
    /// Compiled plans for every subquery expression, keyed by id
    pub subplans: HashMap<usize, Rc<PhysicNode>>,
    /// Results of cacheable subqueries
    pub cache: HashMap<usize, SubqueryResult>,
}

impl<'a> ExecContext<'a> {
    /// Create a fresh context for one statement execution
    pub fn new(catalog: &'a Catalog) -> Self {
        ExecContext {
            catalog,
            params: HashMap::new(),
            subplans: HashMap::new(),
            cache: HashMap::new(),
        }
    }
}

/// Row callback: invoked once per output row, with the context
/// threaded back through
pub type RowCallback<'c> = &'c mut dyn FnMut(&mut ExecContext, &Row) -> ExecutorResult<()>;

/// Evaluate an operator's output list against a source row
pub(crate) fn project(
    output: &[Expr],
    ctx: &mut ExecContext,
    row: &Row,
) -> ExecutorResult<Row> {
    let mut values = Vec::with_capacity(output.len());
    for e in output {
        values.push(eval(e, ctx, row)?);
    }
    Ok(Row::new(values))
}

/// Drive one operator, pushing each output row through the callback
pub fn exec(node: &PhysicNode, ctx: &mut ExecContext, cb: RowCallback) -> ExecutorResult<()> {
    match &node.op {
        PhysicOp::ScanTable {
            table,
            tabref,
            filter,
            publish,
            ..
        } => scan::exec_scan_table(node, table, *tabref, filter, *publish, ctx, cb),

        PhysicOp::ScanFile {
            path,
            types,
            tabref,
            filter,
            publish,
            ..
        } => scan::exec_scan_file(node, path, types, *tabref, filter, *publish, ctx, cb),

        PhysicOp::IndexSeek {
            table,
            tabref,
            index,
            key,
            filter,
            publish,
            ..
        } => scan::exec_index_seek(node, table, *tabref, index, key, filter, *publish, ctx, cb),

        PhysicOp::NLJoin { join_type, filter } => {
            join::exec_nl_join(node, *join_type, filter, ctx, cb)
        }

        PhysicOp::HashJoin {
            join_type,
            left_keys,
            right_keys,
            filter,
        } => join::exec_hash_join(node, *join_type, left_keys, right_keys, filter, ctx, cb),

        PhysicOp::HashAgg { keys, aggs, having } => {
            aggregate::exec_hash_agg(node, keys, aggs, having, ctx, cb)
        }

        PhysicOp::Sort { keys, descends } => sort::exec_sort(node, keys, descends, ctx, cb),

        PhysicOp::Filter { pred } => filter::exec_filter(node, pred, ctx, cb),

        PhysicOp::Limit { limit } => limit::exec_limit(node, *limit, ctx, cb),

        PhysicOp::FromQuery {
            tabref, publish, ..
        } => exec_from_query(node, *tabref, *publish, ctx, cb),

        PhysicOp::Result { .. } => {
            let out = project(&node.output, ctx, &Row::empty())?;
            cb(ctx, &out)
        }

        PhysicOp::Profile { rows, loops } => {
            loops.set(loops.get() + 1);
            let child = &node.children[0];
            exec(child, ctx, &mut |ctx, row| {
                rows.set(rows.get() + 1);
                cb(ctx, row)
            })
        }

        PhysicOp::Insert { .. } => Err(ExecutorError::Internal(
            "INSERT plans run through the engine, not the row loop".to_string(),
        )),

        PhysicOp::MemoRef { group } => Err(ExecutorError::Internal(format!(
            "unextracted memo group {} reached the executor",
            group
        ))),
    }
}

/// Derived-table execution: run the inner plan, publishing rows for
/// correlated references into the derived table
fn exec_from_query(
    node: &PhysicNode,
    tabref: TableRefId,
    publish: bool,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let child = &node.children[0];
    exec(child, ctx, &mut |ctx, row| {
        if publish {
            ctx.params.insert(tabref, row.clone());
        }
        let out = project(&node.output, ctx, row)?;
        cb(ctx, &out)
    })
}

/// Terminal operator: accumulates final rows, dropping columns that
/// were carried only for binding plumbing
pub struct Collect;

impl Collect {
    pub fn run(plan: &PhysicNode, ctx: &mut ExecContext) -> ExecutorResult<Vec<Row>> {
        let visible: Vec<usize> = plan
            .output
            .iter()
            .enumerate()
            .filter(|(_, e)| e.visible)
            .map(|(i, _)| i)
            .collect();
        let all_visible = visible.len() == plan.output.len();

        let mut rows = Vec::new();
        exec(plan, ctx, &mut |_, row| {
            if all_visible {
                rows.push(row.clone());
            } else {
                rows.push(Row::new(
                    visible
                        .iter()
                        .map(|&i| row.get(i).cloned().unwrap_or(Datum::Null))
                        .collect(),
                ));
            }
            Ok(())
        })?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataType;
    use crate::sql::ast::JoinType;
    use crate::sql::expr::ExprKind;

    fn scan(table: &str, tabref: usize, cols: usize) -> PhysicNode {
        let output = (0..cols)
            .map(|i| {
                let col = Expr::col(
                    table,
                    format!("{}{}", table, i + 1),
                    tabref,
                    i,
                    DataType::Int,
                    false,
                );
                Expr::reference(col, i)
            })
            .collect();
        PhysicNode::new(
            PhysicOp::ScanTable {
                table: table.to_string(),
                alias: table.to_string(),
                tabref,
                filter: None,
                publish: false,
            },
            vec![],
            output,
        )
    }

    fn combined_ref(ordinal: usize) -> Expr {
        let col = Expr::col("x", format!("c{}", ordinal), 0, ordinal, DataType::Int, false);
        Expr::reference(col, ordinal)
    }

    #[test]
    fn test_scan_produces_fixture_rows() {
        let catalog = Catalog::with_test_tables();
        let mut ctx = ExecContext::new(&catalog);
        let rows = Collect::run(&scan("a", 0, 4), &mut ctx).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            Row::new(vec![
                Datum::Int(0),
                Datum::Int(1),
                Datum::Int(2),
                Datum::Int(3)
            ])
        );
    }

    #[test]
    fn test_nl_join_cross_product() {
        let catalog = Catalog::with_test_tables();
        let mut ctx = ExecContext::new(&catalog);
        let output = vec![combined_ref(0), combined_ref(4)];
        let join = PhysicNode::new(
            PhysicOp::NLJoin {
                join_type: JoinType::Cross,
                filter: None,
            },
            vec![scan("a", 0, 4), scan("b", 1, 4)],
            output,
        );
        let rows = Collect::run(&join, &mut ctx).unwrap();
        assert_eq!(rows.len(), 9);
    }

    #[test]
    fn test_nl_mark_join_appends_mark_column() {
        use crate::sql::ast::BinOp;
        let catalog = Catalog::with_test_tables();
        let mut ctx = ExecContext::new(&catalog);

        // a1 = b2 matches only for a1 in {1, 2}
        let filter = Expr::binary(BinOp::Eq, combined_ref(0), combined_ref(5));
        // Left columns plus the mark at combined position 8
        let output = vec![combined_ref(0), combined_ref(8)];
        let join = PhysicNode::new(
            PhysicOp::NLJoin {
                join_type: JoinType::Mark,
                filter: Some(filter),
            },
            vec![scan("a", 0, 4), scan("b", 1, 4)],
            output,
        );
        let rows = Collect::run(&join, &mut ctx).unwrap();
        assert_eq!(rows.len(), 3);
        let marks: Vec<_> = rows.iter().map(|r| r.get(1).cloned().unwrap()).collect();
        assert_eq!(
            marks,
            vec![Datum::Bool(false), Datum::Bool(true), Datum::Bool(true)]
        );
    }

    #[test]
    fn test_nl_single_join_rejects_duplicates() {
        let catalog = Catalog::with_test_tables();
        let mut ctx = ExecContext::new(&catalog);
        // No filter: every left row matches all three right rows
        let join = PhysicNode::new(
            PhysicOp::NLJoin {
                join_type: JoinType::Single,
                filter: None,
            },
            vec![scan("a", 0, 4), scan("b", 1, 4)],
            vec![combined_ref(0)],
        );
        let err = Collect::run(&join, &mut ctx);
        assert!(matches!(err, Err(ExecutorError::SubqueryMultipleRows)));
    }

    #[test]
    fn test_collect_trims_invisible_columns() {
        let catalog = Catalog::with_test_tables();
        let mut ctx = ExecContext::new(&catalog);
        let mut node = scan("a", 0, 2);
        node.output[1] = node.output[1].clone().invisible();
        let rows = Collect::run(&node, &mut ctx).unwrap();
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[1], Row::new(vec![Datum::Int(1)]));
    }

    #[test]
    fn test_profile_counts_rows_and_loops() {
        let catalog = Catalog::with_test_tables();
        let mut ctx = ExecContext::new(&catalog);
        let profiled = crate::planner::add_profile_deep(scan("a", 0, 4));
        Collect::run(&profiled, &mut ctx).unwrap();
        match &profiled.op {
            PhysicOp::Profile { rows, loops } => {
                assert_eq!(rows.get(), 3);
                assert_eq!(loops.get(), 1);
            }
            _ => unreachable!(),
        }
        // Re-driving the same plan bumps the loop counter
        Collect::run(&profiled, &mut ctx).unwrap();
        if let PhysicOp::Profile { loops, .. } = &profiled.op {
            assert_eq!(loops.get(), 2);
        }
    }

    #[test]
    fn test_published_row_reaches_outer_ref() {
        let catalog = Catalog::with_test_tables();
        let mut ctx = ExecContext::new(&catalog);
        let mut outer_scan = scan("a", 0, 4);
        if let PhysicOp::ScanTable { publish, .. } = &mut outer_scan.op {
            *publish = true;
        }
        // The projection includes an outer-style read of the published row
        let outer_col = Expr::col("a", "a3", 0, 2, DataType::Int, true);
        outer_scan.output = vec![outer_col];
        let rows = Collect::run(&outer_scan, &mut ctx).unwrap();
        assert_eq!(
            rows,
            vec![
                Row::new(vec![Datum::Int(2)]),
                Row::new(vec![Datum::Int(3)]),
                Row::new(vec![Datum::Int(4)])
            ]
        );
    }

    #[test]
    fn test_visible_flag_survives_ref_wrapping() {
        let col = Expr::col("a", "a1", 0, 0, DataType::Int, false).invisible();
        let wrapped = Expr::reference(col, 0);
        assert!(!wrapped.visible);
        assert!(matches!(wrapped.kind, ExprKind::Ref { .. }));
    }
}
