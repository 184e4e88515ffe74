//! Logical plan representation
//!
//! Logical plans represent the structure of a query before physical
//! implementation details are decided. Every node is a `LogicNode`
//! with explicit children and an `output` list filled in by ordinal
//! resolution: after `resolve_output` runs, no expression below the
//! base scans refers to a column by name, only by child position.

use std::collections::BTreeSet;

use crate::catalog::DataType;
use crate::planner::error::{PlannerError, PlannerResult};
use crate::planner::QueryOptions;
use crate::sql::ast::JoinType;
use crate::sql::binder::{BoundSelect, FromNode, TableRefData, TableRefKind};
use crate::sql::expr::{Expr, ExprKind, SubqueryKind, TableRefId};

/// Logical operator kinds
#[derive(Debug, Clone)]
pub enum LogicOp {
    /// Scan of a base or external table
    Get {
        table: String,
        alias: String,
        tabref: TableRefId,
        /// Column names and types in ordinal order
        columns: Vec<(String, DataType)>,
        /// Pushed-down predicate applied during the scan
        filter: Option<Expr>,
        /// Scan publishes its current row for correlated inner plans
        publish: bool,
        /// Backing file for external tables
        source: Option<String>,
    },
    /// Derived table or CTE reference; the child is the inner plan
    FromQuery {
        alias: String,
        tabref: TableRefId,
        /// The inner query's projection, used as the child request
        selection: Vec<Expr>,
        publish: bool,
    },
    /// Row filter
    Filter { pred: Expr },
    /// Join of the two children
    Join {
        join_type: JoinType,
        filter: Option<Expr>,
    },
    /// Hash aggregation with grouping keys and an optional having
    Agg {
        keys: Vec<Expr>,
        aggs: Vec<Expr>,
        having: Option<Expr>,
    },
    /// Sort
    Order {
        keys: Vec<Expr>,
        descends: Vec<bool>,
    },
    /// Row-count limit
    Limit { limit: usize },
    /// Constant result, for FROM-less selects
    Result { exprs: Vec<Expr> },
    /// Insert the child plan's rows into a table
    Insert { table: String },
    /// Placeholder for a memo group during optimization
    MemoRef { group: usize },
}

/// Logical plan node
#[derive(Debug, Clone)]
pub struct LogicNode {
    pub op: LogicOp,
    pub children: Vec<LogicNode>,
    /// Set by `resolve_output`
    pub output: Vec<Expr>,
}

impl LogicNode {
    pub fn new(op: LogicOp, children: Vec<LogicNode>) -> Self {
        LogicNode {
            op,
            children,
            output: Vec::new(),
        }
    }

    /// Table refs contributed by this subtree
    pub fn tabrefs(&self) -> BTreeSet<TableRefId> {
        let mut set = BTreeSet::new();
        match &self.op {
            LogicOp::Get { tabref, .. } | LogicOp::FromQuery { tabref, .. } => {
                set.insert(*tabref);
            }
            _ => {}
        }
        for c in &self.children {
            set.extend(c.tabrefs());
        }
        set
    }

    /// Does any scan in this subtree publish rows for correlation?
    pub fn has_outer_publishers(&self) -> bool {
        match &self.op {
            LogicOp::Get { publish: true, .. } | LogicOp::FromQuery { publish: true, .. } => {
                return true
            }
            _ => {}
        }
        self.children.iter().any(|c| c.has_outer_publishers())
    }

    /// Top-down ordinal resolution
    ///
    /// `req` is the list of expressions this node must produce. Each
    /// node derives its child requests, recurses, then rewrites its own
    /// expressions into positional refs against the child output.
    /// With `remove_redundant`, duplicate requests collapse first.
    pub fn resolve_output(&mut self, req: &[Expr], remove_redundant: bool) -> PlannerResult<()> {
        let req: Vec<Expr> = if remove_redundant {
            dedup(req.to_vec())
        } else {
            req.to_vec()
        };

        match &mut self.op {
            LogicOp::Get {
                tabref,
                filter,
                table,
                ..
            } => {
                let me = *tabref;
                for e in &req {
                    validate_get_request(e, me, table)?;
                }
                self.output = req.iter().map(|e| rewrite_to_scan(e, me)).collect();
                if let Some(f) = filter {
                    let r = rewrite_to_scan(f, me);
                    *f = r;
                }
                Ok(())
            }

            LogicOp::FromQuery {
                tabref, selection, ..
            } => {
                let me = *tabref;
                let inner_req = selection.clone();
                self.children[0].resolve_output(&inner_req, false)?;
                self.output = req.iter().map(|e| rewrite_to_scan(e, me)).collect();
                Ok(())
            }

            LogicOp::Filter { pred } => {
                let mut child_req = req.clone();
                child_req.extend(non_outer_cols(pred));
                let child_req = dedup(child_req);
                let pred = pred.clone();
                self.children[0].resolve_output(&child_req, true)?;
                let child_out = self.children[0].output.clone();
                if let LogicOp::Filter { pred: p } = &mut self.op {
                    *p = rewrite_against(&pred, &child_out)?;
                }
                self.output = rewrite_all(&req, &child_out)?;
                Ok(())
            }

            LogicOp::Join { filter, .. } => {
                let filter_snapshot = filter.clone();
                let mut all = req.clone();
                if let Some(f) = &filter_snapshot {
                    // Predicates partition conjunct by conjunct
                    all.extend(f.and_list().iter().map(|c| (*c).clone()));
                }

                let left_set = self.children[0].tabrefs();
                let right_set = self.children[1].tabrefs();
                let mut left_req = Vec::new();
                let mut right_req = Vec::new();
                for e in &all {
                    partition_request(e, &left_set, &right_set, &mut left_req, &mut right_req);
                }
                self.children[0].resolve_output(&dedup(left_req), true)?;
                self.children[1].resolve_output(&dedup(right_req), true)?;

                let mut combined = self.children[0].output.clone();
                combined.extend(self.children[1].output.iter().cloned());
                if let LogicOp::Join { filter: f, .. } = &mut self.op {
                    if let Some(p) = &filter_snapshot {
                        *f = Some(rewrite_against(p, &combined)?);
                    }
                }
                self.output = rewrite_all(&req, &combined)?;
                Ok(())
            }

            LogicOp::Agg { keys, aggs, having } => {
                let keys_snapshot = keys.clone();
                let aggs_snapshot = aggs.clone();
                let having_snapshot = having.clone();

                // Children only see grouping keys and aggregate inputs
                let mut child_req = keys_snapshot.clone();
                for a in &aggs_snapshot {
                    if let ExprKind::Agg { arg: Some(arg), .. } = &a.kind {
                        child_req.push(arg.as_ref().clone());
                    }
                }
                self.children[0].resolve_output(&dedup(child_req), true)?;
                let child_out = self.children[0].output.clone();

                // The node's intermediate row is keys then aggregates
                let mut virt = keys_snapshot.clone();
                virt.extend(aggs_snapshot.iter().cloned());

                let rewritten_output = req
                    .iter()
                    .map(|e| {
                        let e = rewrite_lenient(e, &virt);
                        ensure_grouped(&e)?;
                        Ok(e)
                    })
                    .collect::<PlannerResult<Vec<_>>>()?;
                let rewritten_having = having_snapshot
                    .map(|h| {
                        let h = rewrite_lenient(&h, &virt);
                        ensure_grouped(&h)?;
                        Ok::<_, PlannerError>(h)
                    })
                    .transpose()?;

                let rewritten_keys = rewrite_all(&keys_snapshot, &child_out)?;
                let rewritten_aggs = aggs_snapshot
                    .iter()
                    .map(|a| rewrite_agg_arg(a, &child_out))
                    .collect::<PlannerResult<Vec<_>>>()?;

                if let LogicOp::Agg { keys, aggs, having } = &mut self.op {
                    *keys = rewritten_keys;
                    *aggs = rewritten_aggs;
                    *having = rewritten_having;
                }
                self.output = rewritten_output;
                Ok(())
            }

            LogicOp::Order { keys, .. } => {
                let keys_snapshot = keys.clone();
                let mut child_req = req.clone();
                child_req.extend(keys_snapshot.iter().cloned());
                self.children[0].resolve_output(&dedup(child_req), true)?;
                let child_out = self.children[0].output.clone();
                if let LogicOp::Order { keys, .. } = &mut self.op {
                    *keys = rewrite_all(&keys_snapshot, &child_out)?;
                }
                self.output = rewrite_all(&req, &child_out)?;
                Ok(())
            }

            LogicOp::Limit { .. } => {
                self.children[0].resolve_output(&req, true)?;
                let child_out = self.children[0].output.clone();
                self.output = rewrite_all(&req, &child_out)?;
                Ok(())
            }

            LogicOp::Result { exprs } => {
                let exprs = exprs.clone();
                self.output = if req.is_empty() { exprs } else { req };
                Ok(())
            }

            LogicOp::Insert { .. } => {
                // The engine resolves the child against the target shape
                Ok(())
            }

            LogicOp::MemoRef { .. } => Err(PlannerError::Internal(
                "resolve on a memo reference".to_string(),
            )),
        }
    }
}

/// Drop duplicate request expressions, keeping first occurrences
fn dedup(req: Vec<Expr>) -> Vec<Expr> {
    let mut out: Vec<Expr> = Vec::new();
    for e in req {
        if !out.contains(&e) {
            out.push(e);
        }
    }
    out
}

/// Column nodes of an expression, outer references excluded
fn non_outer_cols(e: &Expr) -> Vec<Expr> {
    e.collect_cols()
        .into_iter()
        .filter(|c| !matches!(c.kind, ExprKind::Col { outer: true, .. }))
        .collect()
}

/// A scan request must be constant, a subquery, or reference only the
/// scanned table
fn validate_get_request(e: &Expr, me: TableRefId, table: &str) -> PlannerResult<()> {
    let mut ok = true;
    e.visit_each(&mut |node| {
        if let ExprKind::Col { tabref, outer, .. } = &node.kind {
            if !*outer && *tabref != me {
                ok = false;
            }
        }
    });
    if !ok {
        return Err(PlannerError::Internal(format!(
            "request '{}' does not belong to scan of '{}'",
            e, table
        )));
    }
    Ok(())
}

/// Rewrite columns of the scanned table into positional refs on the
/// base row; outer references stay by-name
fn rewrite_to_scan(e: &Expr, me: TableRefId) -> Expr {
    match &e.kind {
        ExprKind::Col {
            tabref,
            ordinal,
            outer: false,
            ..
        } if *tabref == me => Expr::reference(e.clone(), *ordinal),
        _ => {
            let mut out = e.clone();
            for c in out.children_mut() {
                let r = rewrite_to_scan(c, me);
                *c = r;
            }
            out
        }
    }
}

/// Find a column that survived rewriting, treating positional refs as
/// leaves (the expression a ref wraps is provenance, already resolved)
fn find_bare_col(e: &Expr) -> Option<String> {
    match &e.kind {
        ExprKind::Ref { .. } => None,
        ExprKind::Col { outer: false, .. } => Some(format!("{}", e)),
        _ => e.children().into_iter().find_map(find_bare_col),
    }
}

/// Rewrite an expression against a child output list: every
/// subexpression equal to an output entry becomes a positional ref
fn rewrite_against(e: &Expr, child_out: &[Expr]) -> PlannerResult<Expr> {
    let out = rewrite_lenient(e, child_out);
    // Any surviving bound column means the request fan-out missed it
    match find_bare_col(&out) {
        Some(name) => Err(PlannerError::UnresolvedExpr(name)),
        None => Ok(out),
    }
}

fn rewrite_all(req: &[Expr], child_out: &[Expr]) -> PlannerResult<Vec<Expr>> {
    req.iter().map(|e| rewrite_against(e, child_out)).collect()
}

/// Like `rewrite_against` but leaves unmatched columns in place
fn rewrite_lenient(e: &Expr, child_out: &[Expr]) -> Expr {
    if let ExprKind::Col { outer: true, .. } = &e.kind {
        return e.clone();
    }
    if let Some(i) = child_out.iter().position(|o| o == e) {
        return Expr::reference(e.clone(), i);
    }
    let mut out = e.clone();
    for c in out.children_mut() {
        let r = rewrite_lenient(c, child_out);
        *c = r;
    }
    out
}

/// Rewrite an aggregate call's argument against the child output
fn rewrite_agg_arg(agg: &Expr, child_out: &[Expr]) -> PlannerResult<Expr> {
    let mut out = agg.clone();
    if let ExprKind::Agg { arg: Some(arg), .. } = &mut out.kind {
        let r = rewrite_against(arg, child_out)?;
        *arg = Box::new(r);
    }
    Ok(out)
}

/// After the key/aggregate rewrite no raw column may remain
fn ensure_grouped(e: &Expr) -> PlannerResult<()> {
    match find_bare_col(e) {
        Some(name) => Err(PlannerError::MissingGroupBy(name)),
        None => Ok(()),
    }
}

/// Partition a join request between the two sides; straddling
/// expressions fan out as their individual columns
fn partition_request(
    e: &Expr,
    left: &BTreeSet<TableRefId>,
    right: &BTreeSet<TableRefId>,
    left_req: &mut Vec<Expr>,
    right_req: &mut Vec<Expr>,
) {
    if e.tabrefs.is_empty() {
        // Constants and outer references can ride on either side
        if e.is_const() {
            left_req.push(e.clone());
        }
        return;
    }
    if e.tabrefs.is_subset(left) {
        left_req.push(e.clone());
    } else if e.tabrefs.is_subset(right) {
        right_req.push(e.clone());
    } else {
        for col in e.collect_cols() {
            if let ExprKind::Col { outer: true, .. } = &col.kind {
                continue;
            }
            if col.tabrefs.is_subset(left) {
                left_req.push(col);
            } else if col.tabrefs.is_subset(right) {
                right_req.push(col);
            }
        }
    }
}

// ============ Plan construction ============

/// The selection list a plan for `sel` will be resolved against;
/// differs from the bound selection only under FROM flattening
pub fn planned_selection(
    sel: &BoundSelect,
    tables: &[TableRefData],
    opts: &QueryOptions,
) -> Vec<Expr> {
    if opts.remove_from {
        sel.selection
            .iter()
            .map(|e| remap_derived(e, tables))
            .collect()
    } else {
        sel.selection.clone()
    }
}

/// Build a logical plan for a bound SELECT
pub fn build_select_plan(
    sel: &BoundSelect,
    tables: &[TableRefData],
    opts: &QueryOptions,
) -> PlannerResult<LogicNode> {
    // Under FROM flattening, rewrite references to flattened derived
    // tables onto their inner selections before planning anything.
    let remap = |e: &Expr| -> Expr {
        if opts.remove_from {
            remap_derived(e, tables)
        } else {
            e.clone()
        }
    };

    let selection = planned_selection(sel, tables, opts);

    // FROM tree
    let mut node = match &sel.from {
        Some(from) => build_from(from, tables, opts)?,
        None => LogicNode::new(
            LogicOp::Result {
                exprs: selection.clone(),
            },
            vec![],
        ),
    };

    // WHERE, with aggregate conjuncts migrating to HAVING
    let mut having_parts: Vec<Expr> = Vec::new();
    let mut where_parts: Vec<Expr> = Vec::new();
    if let Some(filter) = &sel.filter {
        for conjunct in remap(filter).and_list() {
            if conjunct.has_agg() {
                having_parts.push(conjunct.clone());
            } else {
                where_parts.push(conjunct.clone());
            }
        }
    }
    if let Some(h) = &sel.having {
        having_parts.extend(remap(h).and_list().iter().map(|e| (*e).clone()));
    }

    // Uncorrelated EXISTS / IN subqueries become semi joins
    if opts.enable_subquery_to_markjoin {
        let mut kept = Vec::new();
        for pred in where_parts {
            match try_subquery_to_join(&pred, tables, opts)? {
                Some((right, join_type, condition)) => {
                    tracing::debug!(join = %join_type, "rewrote subquery predicate to join");
                    node = LogicNode::new(
                        LogicOp::Join {
                            join_type,
                            filter: condition,
                        },
                        vec![node, right],
                    );
                }
                None => kept.push(pred),
            }
        }
        where_parts = kept;
    }

    if let Some(pred) = Expr::combine_and(where_parts) {
        node = merge_filter(node, pred);
    }

    // Aggregation: collect every aggregate call the statement computes
    let orders: Vec<(Expr, bool)> = sel
        .orders
        .iter()
        .map(|(k, d)| (remap(k), *d))
        .collect();
    let mut aggs: Vec<Expr> = Vec::new();
    let agg_sources = selection
        .iter()
        .chain(having_parts.iter())
        .chain(orders.iter().map(|(k, _)| k));
    for e in agg_sources {
        for agg in e.collect_aggs() {
            if !aggs.contains(&agg) {
                aggs.push(agg);
            }
        }
    }
    if !sel.group_by.is_empty() || !aggs.is_empty() {
        node = LogicNode::new(
            LogicOp::Agg {
                keys: sel.group_by.iter().map(|k| remap(k)).collect(),
                aggs,
                having: Expr::combine_and(having_parts),
            },
            vec![node],
        );
    } else if let Some(pred) = Expr::combine_and(having_parts) {
        // HAVING without grouping degenerates to a filter
        node = LogicNode::new(LogicOp::Filter { pred }, vec![node]);
    }

    // ORDER BY / LIMIT
    if !orders.is_empty() {
        let (keys, descends) = orders.into_iter().unzip();
        node = LogicNode::new(LogicOp::Order { keys, descends }, vec![node]);
    }
    if let Some(limit) = sel.limit {
        node = LogicNode::new(LogicOp::Limit { limit }, vec![node]);
    }

    Ok(node)
}

fn build_from(
    from: &FromNode,
    tables: &[TableRefData],
    opts: &QueryOptions,
) -> PlannerResult<LogicNode> {
    match from {
        FromNode::Single(id) => build_table_ref(*id, tables, opts),
        FromNode::Join {
            join_type,
            left,
            right,
            condition,
        } => {
            let l = build_from(left, tables, opts)?;
            let r = build_from(right, tables, opts)?;
            Ok(LogicNode::new(
                LogicOp::Join {
                    join_type: *join_type,
                    filter: condition.clone(),
                },
                vec![l, r],
            ))
        }
    }
}

fn build_table_ref(
    id: TableRefId,
    tables: &[TableRefData],
    opts: &QueryOptions,
) -> PlannerResult<LogicNode> {
    let t = &tables[id];
    let publish = !t.outer_refs.is_empty();
    match &t.kind {
        TableRefKind::Base { table } => Ok(LogicNode::new(
            LogicOp::Get {
                table: table.clone(),
                alias: t.alias.clone(),
                tabref: id,
                columns: t.columns.clone(),
                filter: None,
                publish,
                source: None,
            },
            vec![],
        )),
        TableRefKind::External { table, path } => Ok(LogicNode::new(
            LogicOp::Get {
                table: table.clone(),
                alias: t.alias.clone(),
                tabref: id,
                columns: t.columns.clone(),
                filter: None,
                publish,
                source: Some(path.clone()),
            },
            vec![],
        )),
        TableRefKind::Derived { query } | TableRefKind::Cte { query, .. } => {
            let inner = build_select_plan(query, tables, opts)?;
            if opts.remove_from && is_flattenable(&tables[id]) {
                // References were already remapped onto the inner
                // selection, so the inner plan stands in directly.
                return Ok(inner);
            }
            Ok(LogicNode::new(
                LogicOp::FromQuery {
                    alias: t.alias.clone(),
                    tabref: id,
                    selection: planned_selection(query, tables, opts),
                    publish,
                },
                vec![inner],
            ))
        }
    }
}

/// Predicate placement: a WHERE predicate merges into a lone scan or
/// into the top inner join (turning a comma cross join into an inner
/// join); everything else gets a Filter node
fn merge_filter(mut node: LogicNode, pred: Expr) -> LogicNode {
    let and = |existing: &Option<Expr>, pred: Expr| match existing {
        None => pred,
        Some(e) => Expr::binary(crate::sql::ast::BinOp::And, e.clone(), pred),
    };
    match &mut node.op {
        LogicOp::Get { filter, .. } => {
            let merged = and(filter, pred);
            *filter = Some(merged);
            node
        }
        LogicOp::Join {
            join_type: join_type @ (JoinType::Inner | JoinType::Cross),
            filter,
        } => {
            let merged = and(filter, pred);
            *filter = Some(merged);
            *join_type = JoinType::Inner;
            node
        }
        _ => LogicNode::new(LogicOp::Filter { pred }, vec![node]),
    }
}

/// A derived table collapses into its input only when its query is a
/// plain projection of columns
fn is_flattenable(t: &TableRefData) -> bool {
    // A correlated derived table publishes parameter rows under its
    // own ref id and must stay in place
    if !t.outer_refs.is_empty() {
        return false;
    }
    match &t.kind {
        TableRefKind::Derived { query } | TableRefKind::Cte { query, .. } => {
            query.group_by.is_empty()
                && query.orders.is_empty()
                && query.limit.is_none()
                && query.having.is_none()
                && !query.distinct
                && query
                    .selection
                    .iter()
                    .all(|e| matches!(e.kind, ExprKind::Col { outer: false, .. }))
        }
        _ => false,
    }
}

/// Remap references to flattenable derived tables onto their inner
/// selections, transitively
pub fn remap_derived(e: &Expr, tables: &[TableRefData]) -> Expr {
    if let ExprKind::Col {
        tabref,
        ordinal,
        outer: false,
        ..
    } = &e.kind
    {
        if is_flattenable(&tables[*tabref]) {
            if let TableRefKind::Derived { query } | TableRefKind::Cte { query, .. } =
                &tables[*tabref].kind
            {
                let target = &query.selection[*ordinal];
                return remap_derived(target, tables);
            }
        }
    }
    let mut out = e.clone();
    for c in out.children_mut() {
        let r = remap_derived(c, tables);
        *c = r;
    }
    out
}

/// Rewrite an uncorrelated EXISTS / IN predicate into a semi or
/// anti-semi join against the subquery's plan
fn try_subquery_to_join(
    pred: &Expr,
    tables: &[TableRefData],
    opts: &QueryOptions,
) -> PlannerResult<Option<(LogicNode, JoinType, Option<Expr>)>> {
    if let ExprKind::Subquery {
        kind,
        query,
        cacheable: true,
        ..
    } = &pred.kind
    {
        let right = build_select_plan(query, tables, opts)?;
        match kind {
            SubqueryKind::Exists { negated } => {
                let join_type = if *negated {
                    JoinType::AntiSemi
                } else {
                    JoinType::Semi
                };
                return Ok(Some((right, join_type, None)));
            }
            SubqueryKind::In { probe, negated } => {
                let inner_col = query.selection[0].clone();
                let join_type = if *negated {
                    JoinType::AntiSemi
                } else {
                    JoinType::Semi
                };
                let cond = Expr::binary(
                    crate::sql::ast::BinOp::Eq,
                    probe.as_ref().clone(),
                    inner_col,
                );
                return Ok(Some((right, join_type, Some(cond))));
            }
            SubqueryKind::Scalar => {}
        }
    }
    Ok(None)
}
