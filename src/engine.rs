//! Statement orchestration
//!
//! `Database` owns the catalog and runs the per-statement pipeline:
//! parse, bind, plan, resolve ordinals, optionally explore the memo,
//! lower to physical, execute. DDL, INSERT, COPY, and ANALYZE take the
//! catalog write lock; queries run under a read lock held for the
//! statement.

use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::{Catalog, CatalogError};
use crate::executor::{ddl, insert, Collect, ExecContext, ExecutorError, Row};
use crate::planner::{
    add_profile_deep, build_select_plan, default_rules, direct_to_physical, extract_best,
    planned_selection, ExplainOptions, ExplainOutput, Memo, PhysicNode, PlannerError, QueryOptions,
};
use crate::sql::ast::{SelectStmt, SetOpKind, Statement};
use crate::sql::binder::{Binder, BoundQuery, BoundSelect, TableRefData};
use crate::sql::expr::ExprKind;
use crate::sql::{Parser, SqlError};

/// Top-level error: any phase's failure aborts the statement
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An in-memory analytical SQL engine instance
pub struct Database {
    catalog: Arc<RwLock<Catalog>>,
    pub options: QueryOptions,
    pub explain_options: ExplainOptions,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Create an engine with an empty catalog
    pub fn new() -> Self {
        Database {
            catalog: Arc::new(RwLock::new(Catalog::new())),
            options: QueryOptions::default(),
            explain_options: ExplainOptions::default(),
        }
    }

    /// Create an engine with the `a`..`d` test tables loaded
    pub fn with_test_tables() -> Self {
        Database {
            catalog: Arc::new(RwLock::new(Catalog::with_test_tables())),
            options: QueryOptions::default(),
            explain_options: ExplainOptions::default(),
        }
    }

    /// Shared handle to the catalog
    pub fn catalog(&self) -> Arc<RwLock<Catalog>> {
        self.catalog.clone()
    }

    /// Run one SQL statement
    ///
    /// Queries return their rows; EXPLAIN returns one text row; DDL
    /// and DML return no rows.
    pub fn run(&self, sql: &str) -> Result<Vec<Row>> {
        tracing::debug!(sql, "running statement");
        match Parser::parse_one(sql)? {
            Statement::Select(stmt) => {
                let catalog = self.catalog.read();
                run_query(&catalog, &stmt, &self.options)
            }

            Statement::Explain(stmt) => {
                let catalog = self.catalog.read();
                let text = explain_select(&catalog, &stmt, &self.options, &self.explain_options)?;
                Ok(vec![Row::new(vec![crate::executor::Datum::Str(text)])])
            }

            Statement::CreateTable { name, columns } => {
                let mut catalog = self.catalog.write();
                ddl::create_table(&mut catalog, &name, &columns)?;
                Ok(vec![])
            }

            Statement::DropTable { name } => {
                let mut catalog = self.catalog.write();
                ddl::drop_table(&mut catalog, &name)?;
                Ok(vec![])
            }

            Statement::CreateIndex {
                name,
                table,
                column,
                unique,
            } => {
                let mut catalog = self.catalog.write();
                ddl::create_index(&mut catalog, &name, &table, &column, unique)?;
                Ok(vec![])
            }

            Statement::Analyze { table } => {
                let mut catalog = self.catalog.write();
                ddl::analyze(&mut catalog, &table)?;
                Ok(vec![])
            }

            Statement::Insert {
                table,
                columns,
                values,
                query,
            } => {
                let mut catalog = self.catalog.write();
                let affected = match query {
                    None => {
                        let bound_rows = bind_value_rows(&catalog, &values)?;
                        insert::insert_values(&mut catalog, &table, &columns, &bound_rows)?
                    }
                    Some(select) => {
                        let (physical, subplans) =
                            prepare_insert(&catalog, &table, &select, &self.options)?;
                        insert::exec_insert(&physical, &mut catalog, &columns, subplans)?
                    }
                };
                tracing::debug!(table = %table, affected, "insert finished");
                Ok(vec![])
            }

            Statement::Copy {
                table,
                path,
                delimiter,
            } => {
                let mut catalog = self.catalog.write();
                let loaded = insert::copy_from(&mut catalog, &table, &path, delimiter)?;
                tracing::debug!(table = %table, loaded, "copy finished");
                Ok(vec![])
            }
        }
    }

    /// EXPLAIN a query given either the bare SELECT or an EXPLAIN
    /// statement
    pub fn explain(&self, sql: &str) -> Result<String> {
        let stmt = match Parser::parse_one(sql)? {
            Statement::Select(s) | Statement::Explain(s) => s,
            _ => {
                return Err(SqlError::Unsupported(
                    "EXPLAIN applies to SELECT statements".to_string(),
                )
                .into())
            }
        };
        let catalog = self.catalog.read();
        explain_select(&catalog, &stmt, &self.options, &self.explain_options)
    }

    /// Run a SELECT with profiling on, returning the rows and the
    /// counter-annotated plan
    pub fn run_profiled(&self, sql: &str) -> Result<(Vec<Row>, String)> {
        let stmt = match Parser::parse_one(sql)? {
            Statement::Select(s) => s,
            _ => {
                return Err(SqlError::Unsupported(
                    "profiling applies to SELECT statements".to_string(),
                )
                .into())
            }
        };
        if stmt.setop.is_some() {
            return Err(SqlError::Unsupported(
                "profiling a set operation".to_string(),
            )
            .into());
        }
        let mut opts = self.options.clone();
        opts.profile = true;

        let catalog = self.catalog.read();
        let bound = Binder::new(&catalog).bind(&stmt)?;
        let sel = match &bound.query {
            BoundQuery::Select(s) => s,
            BoundQuery::SetOp { .. } => unreachable!(),
        };
        let physical = prepare_select(&catalog, sel, &bound.tables, &opts)?;
        let mut ctx = ExecContext::new(&catalog);
        compile_subqueries(&physical, &bound.tables, &opts, &catalog, &mut ctx.subplans)?;
        let mut rows = Collect::run(&physical, &mut ctx)?;
        if sel.distinct {
            rows = dedup_rows(rows);
        }
        let text = ExplainOutput::format(&physical, &self.explain_options, &catalog);
        Ok((rows, text))
    }
}

fn run_query(catalog: &Catalog, stmt: &SelectStmt, opts: &QueryOptions) -> Result<Vec<Row>> {
    let bound = Binder::new(catalog).bind(stmt)?;
    run_bound_query(catalog, &bound.query, &bound.tables, opts)
}

fn run_bound_query(
    catalog: &Catalog,
    query: &BoundQuery,
    tables: &[TableRefData],
    opts: &QueryOptions,
) -> Result<Vec<Row>> {
    match query {
        BoundQuery::Select(sel) => run_bound_select(catalog, sel, tables, opts),
        BoundQuery::SetOp {
            kind,
            all,
            left,
            right,
        } => {
            let l = run_bound_query(catalog, left, tables, opts)?;
            let r = run_bound_query(catalog, right, tables, opts)?;
            Ok(combine_setop(*kind, *all, l, r))
        }
    }
}

fn run_bound_select(
    catalog: &Catalog,
    sel: &BoundSelect,
    tables: &[TableRefData],
    opts: &QueryOptions,
) -> Result<Vec<Row>> {
    let physical = prepare_select(catalog, sel, tables, opts)?;
    let mut ctx = ExecContext::new(catalog);
    compile_subqueries(&physical, tables, opts, catalog, &mut ctx.subplans)?;
    let mut rows = Collect::run(&physical, &mut ctx)?;
    if sel.distinct {
        rows = dedup_rows(rows);
    }
    Ok(rows)
}

/// Bind, plan, resolve, and lower one SELECT to a physical plan
fn prepare_select(
    catalog: &Catalog,
    sel: &BoundSelect,
    tables: &[TableRefData],
    opts: &QueryOptions,
) -> Result<PhysicNode> {
    let mut plan = build_select_plan(sel, tables, opts)?;
    let selection = planned_selection(sel, tables, opts);
    plan.resolve_output(&selection, false)?;

    let mut physical = if opts.use_memo {
        let mut memo = Memo::new();
        memo.enqueue_root(plan);
        memo.optimize(&default_rules(), opts, catalog);
        tracing::debug!(groups = memo.group_count(), "memo explored");
        extract_best(&memo, catalog)?
    } else {
        direct_to_physical(&plan, opts, catalog)?
    };
    if opts.profile {
        physical = add_profile_deep(physical);
    }
    Ok(physical)
}

/// Plan an INSERT ... SELECT as an Insert node over the select's plan
fn prepare_insert(
    catalog: &Catalog,
    table: &str,
    select: &SelectStmt,
    opts: &QueryOptions,
) -> Result<(PhysicNode, std::collections::HashMap<usize, Rc<PhysicNode>>)> {
    if select.setop.is_some() {
        return Err(SqlError::Unsupported("INSERT from a set operation".to_string()).into());
    }
    let bound = Binder::new(catalog).bind(select)?;
    let sel = match &bound.query {
        BoundQuery::Select(s) => s,
        BoundQuery::SetOp { .. } => unreachable!(),
    };
    let mut child = build_select_plan(sel, &bound.tables, opts)?;
    let selection = planned_selection(sel, &bound.tables, opts);
    child.resolve_output(&selection, false)?;
    let insert_plan = crate::planner::LogicNode::new(
        crate::planner::LogicOp::Insert {
            table: table.to_string(),
        },
        vec![child],
    );
    let physical = direct_to_physical(&insert_plan, opts, catalog)?;
    let mut subplans = std::collections::HashMap::new();
    compile_subqueries(&physical, &bound.tables, opts, catalog, &mut subplans)?;
    Ok((physical, subplans))
}

fn explain_select(
    catalog: &Catalog,
    stmt: &SelectStmt,
    opts: &QueryOptions,
    explain_opts: &ExplainOptions,
) -> Result<String> {
    if stmt.setop.is_some() {
        return Err(SqlError::Unsupported("EXPLAIN of a set operation".to_string()).into());
    }
    let bound = Binder::new(catalog).bind(stmt)?;
    let sel = match &bound.query {
        BoundQuery::Select(s) => s,
        BoundQuery::SetOp { .. } => unreachable!(),
    };
    let physical = prepare_select(catalog, sel, &bound.tables, opts)?;
    Ok(ExplainOutput::format(&physical, explain_opts, catalog))
}

/// Compile the inner plan of every subquery expression the plan
/// evaluates, nested subqueries included; plans land in the execution
/// context keyed by subquery id
fn compile_subqueries(
    plan: &PhysicNode,
    tables: &[TableRefData],
    opts: &QueryOptions,
    catalog: &Catalog,
    subplans: &mut std::collections::HashMap<usize, Rc<PhysicNode>>,
) -> Result<()> {
    let mut found: Vec<(usize, BoundSelect)> = Vec::new();
    for e in plan.op_exprs() {
        e.visit_each(&mut |n| {
            if let ExprKind::Subquery { id, query, .. } = &n.kind {
                if !subplans.contains_key(id) && !found.iter().any(|(i, _)| i == id) {
                    found.push((*id, query.as_ref().clone()));
                }
            }
        });
    }
    for c in &plan.children {
        compile_subqueries(c, tables, opts, catalog, subplans)?;
    }
    for (id, query) in found {
        let mut inner = build_select_plan(&query, tables, opts)?;
        let inner_sel = planned_selection(&query, tables, opts);
        inner.resolve_output(&inner_sel, false)?;
        // Subquery plans always lower directly; the memo explores the
        // outer statement only
        let phys = direct_to_physical(&inner, opts, catalog)?;
        compile_subqueries(&phys, tables, opts, catalog, subplans)?;
        tracing::debug!(subquery = id, "compiled subquery plan");
        subplans.insert(id, Rc::new(phys));
    }
    Ok(())
}

fn bind_value_rows(
    catalog: &Catalog,
    rows: &[Vec<crate::sql::ast::Expr>],
) -> Result<Vec<Vec<crate::sql::expr::Expr>>> {
    let mut binder = Binder::new(catalog);
    let mut bound_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let mut bound = Vec::with_capacity(row.len());
        for e in row {
            let b = binder.bind_value(e)?;
            if b.has_subquery() {
                return Err(
                    SqlError::Unsupported("subquery in INSERT VALUES".to_string()).into(),
                );
            }
            bound.push(b);
        }
        bound_rows.push(bound);
    }
    Ok(bound_rows)
}

/// Set-operation combination over materialized arms
fn combine_setop(kind: SetOpKind, all: bool, left: Vec<Row>, right: Vec<Row>) -> Vec<Row> {
    match kind {
        SetOpKind::Union => {
            let mut out = left;
            out.extend(right);
            if all {
                out
            } else {
                dedup_rows(out)
            }
        }
        SetOpKind::Intersect => {
            let rset: HashSet<Row> = right.into_iter().collect();
            dedup_rows(left.into_iter().filter(|r| rset.contains(r)).collect())
        }
        SetOpKind::Except => {
            let rset: HashSet<Row> = right.into_iter().collect();
            dedup_rows(left.into_iter().filter(|r| !rset.contains(r)).collect())
        }
    }
}

/// Drop duplicate rows, keeping first occurrences in order
fn dedup_rows(rows: Vec<Row>) -> Vec<Row> {
    let mut seen = HashSet::new();
    rows.into_iter().filter(|r| seen.insert(r.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Datum;

    fn ints(values: &[i64]) -> Row {
        Row::new(values.iter().map(|&v| Datum::Int(v)).collect())
    }

    #[test]
    fn test_combine_union() {
        let l = vec![ints(&[1]), ints(&[2])];
        let r = vec![ints(&[2]), ints(&[3])];
        let all = combine_setop(SetOpKind::Union, true, l.clone(), r.clone());
        assert_eq!(all.len(), 4);
        let distinct = combine_setop(SetOpKind::Union, false, l, r);
        assert_eq!(distinct, vec![ints(&[1]), ints(&[2]), ints(&[3])]);
    }

    #[test]
    fn test_combine_intersect_and_except() {
        let l = vec![ints(&[1]), ints(&[2]), ints(&[2])];
        let r = vec![ints(&[2]), ints(&[3])];
        assert_eq!(
            combine_setop(SetOpKind::Intersect, false, l.clone(), r.clone()),
            vec![ints(&[2])]
        );
        assert_eq!(
            combine_setop(SetOpKind::Except, false, l, r),
            vec![ints(&[1])]
        );
    }

    #[test]
    fn test_dedup_rows_keeps_order() {
        let rows = vec![ints(&[3]), ints(&[1]), ints(&[3]), ints(&[2])];
        assert_eq!(
            dedup_rows(rows),
            vec![ints(&[3]), ints(&[1]), ints(&[2])]
        );
    }
}
