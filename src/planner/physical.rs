//! Physical plan representation
//!
//! Physical plans mirror the logical tree and pin down algorithm
//! choices: nested-loop versus hash join, full scan versus index seek.
//! `direct_to_physical` is the honest one-to-one lowering; the memo
//! rules reuse the same per-node lowering for their implementation
//! members.

use std::cell::Cell;

use crate::catalog::{Catalog, DataType};
use crate::planner::error::{PlannerError, PlannerResult};
use crate::planner::logical::{LogicNode, LogicOp};
use crate::planner::QueryOptions;
use crate::sql::ast::{BinOp, JoinType};
use crate::sql::expr::{Expr, ExprKind, TableRefId};

/// Physical operator kinds
#[derive(Debug, Clone)]
pub enum PhysicOp {
    /// Heap scan of a base table
    ScanTable {
        table: String,
        alias: String,
        tabref: TableRefId,
        filter: Option<Expr>,
        publish: bool,
    },
    /// Scan of an external file, fields parsed per column type
    ScanFile {
        table: String,
        tabref: TableRefId,
        path: String,
        types: Vec<DataType>,
        filter: Option<Expr>,
        publish: bool,
    },
    /// Equality lookup through an index
    IndexSeek {
        table: String,
        alias: String,
        tabref: TableRefId,
        index: String,
        /// Constant key expression
        key: Expr,
        /// Residual predicate applied after the lookup
        filter: Option<Expr>,
        publish: bool,
    },
    /// Nested-loop join; handles every join type
    NLJoin {
        join_type: JoinType,
        filter: Option<Expr>,
    },
    /// Hash join: build on the right input, probe with the left
    HashJoin {
        join_type: JoinType,
        /// Keys evaluated against the probe row
        left_keys: Vec<Expr>,
        /// Keys evaluated against the build row
        right_keys: Vec<Expr>,
        /// Residual predicate over the combined row
        filter: Option<Expr>,
    },
    /// Hash aggregation
    HashAgg {
        keys: Vec<Expr>,
        aggs: Vec<Expr>,
        having: Option<Expr>,
    },
    /// In-memory sort
    Sort {
        keys: Vec<Expr>,
        descends: Vec<bool>,
    },
    /// Row filter
    Filter { pred: Expr },
    /// Derived table execution
    FromQuery {
        alias: String,
        tabref: TableRefId,
        publish: bool,
    },
    /// Row-count limit
    Limit { limit: usize },
    /// Constant result
    Result { exprs: Vec<Expr> },
    /// Insert child rows into a table
    Insert { table: String },
    /// Wrapper counting rows produced and times driven
    Profile {
        rows: Cell<u64>,
        loops: Cell<u64>,
    },
    /// Placeholder for a memo group during optimization
    MemoRef { group: usize },
}

/// Physical plan node
#[derive(Debug, Clone)]
pub struct PhysicNode {
    pub op: PhysicOp,
    pub children: Vec<PhysicNode>,
    /// Output expressions, carried over from the logical node
    pub output: Vec<Expr>,
}

impl PhysicNode {
    pub fn new(op: PhysicOp, children: Vec<PhysicNode>, output: Vec<Expr>) -> Self {
        PhysicNode {
            op,
            children,
            output,
        }
    }

    /// Every expression this operator evaluates, output included
    ///
    /// Used to discover subquery expressions that need compiling.
    pub fn op_exprs(&self) -> Vec<&Expr> {
        let mut exprs: Vec<&Expr> = self.output.iter().collect();
        match &self.op {
            PhysicOp::ScanTable { filter, .. }
            | PhysicOp::ScanFile { filter, .. }
            | PhysicOp::NLJoin { filter, .. } => exprs.extend(filter.iter()),
            PhysicOp::IndexSeek { key, filter, .. } => {
                exprs.push(key);
                exprs.extend(filter.iter());
            }
            PhysicOp::HashJoin {
                left_keys,
                right_keys,
                filter,
                ..
            } => {
                exprs.extend(left_keys.iter());
                exprs.extend(right_keys.iter());
                exprs.extend(filter.iter());
            }
            PhysicOp::HashAgg { keys, aggs, having } => {
                exprs.extend(keys.iter());
                exprs.extend(aggs.iter());
                exprs.extend(having.iter());
            }
            PhysicOp::Sort { keys, .. } => exprs.extend(keys.iter()),
            PhysicOp::Filter { pred } => exprs.push(pred),
            PhysicOp::Result { exprs: rs } => exprs.extend(rs.iter()),
            PhysicOp::FromQuery { .. }
            | PhysicOp::Limit { .. }
            | PhysicOp::Insert { .. }
            | PhysicOp::Profile { .. }
            | PhysicOp::MemoRef { .. } => {}
        }
        exprs
    }

    /// Operator name for explain output
    pub fn name(&self) -> &'static str {
        match &self.op {
            PhysicOp::ScanTable { .. } => "ScanTable",
            PhysicOp::ScanFile { .. } => "ScanFile",
            PhysicOp::IndexSeek { .. } => "IndexSeek",
            PhysicOp::NLJoin { .. } => "NLJoin",
            PhysicOp::HashJoin { .. } => "HashJoin",
            PhysicOp::HashAgg { .. } => "HashAgg",
            PhysicOp::Sort { .. } => "Order",
            PhysicOp::Filter { .. } => "Filter",
            PhysicOp::FromQuery { .. } => "FromQuery",
            PhysicOp::Limit { .. } => "Limit",
            PhysicOp::Result { .. } => "Result",
            PhysicOp::Insert { .. } => "Insert",
            PhysicOp::Profile { .. } => "Profile",
            PhysicOp::MemoRef { .. } => "MemoRef",
        }
    }
}

/// What a join lowering needs to know about a child subtree without
/// holding the subtree itself
#[derive(Debug, Clone, Copy)]
pub struct ChildInfo {
    pub width: usize,
    /// Subtree contains a scan publishing rows for correlation
    pub publishes: bool,
}

impl ChildInfo {
    pub fn of(node: &LogicNode) -> Self {
        ChildInfo {
            width: node.output.len(),
            publishes: node.has_outer_publishers(),
        }
    }
}

/// Lower one logical operator, children described by `ChildInfo`
///
/// Shared between direct lowering and the memo's implementation rules.
pub fn lower_single(
    node: &LogicNode,
    children: &[ChildInfo],
    opts: &QueryOptions,
    catalog: &Catalog,
) -> PlannerResult<PhysicOp> {
    match &node.op {
        LogicOp::Get {
            table,
            alias,
            tabref,
            filter,
            publish,
            source,
            columns,
        } => {
            if let Some(path) = source {
                return Ok(PhysicOp::ScanFile {
                    table: table.clone(),
                    tabref: *tabref,
                    path: path.clone(),
                    types: columns.iter().map(|(_, t)| *t).collect(),
                    filter: filter.clone(),
                    publish: *publish,
                });
            }
            if opts.enable_indexseek {
                if let Some((index, key, residual)) = find_index_seek(table, filter, catalog) {
                    return Ok(PhysicOp::IndexSeek {
                        table: table.clone(),
                        alias: alias.clone(),
                        tabref: *tabref,
                        index,
                        key,
                        filter: residual,
                        publish: *publish,
                    });
                }
            }
            Ok(PhysicOp::ScanTable {
                table: table.clone(),
                alias: alias.clone(),
                tabref: *tabref,
                filter: filter.clone(),
                publish: *publish,
            })
        }

        LogicOp::Join { join_type, filter } => {
            lower_join(*join_type, filter, children, opts)
        }

        LogicOp::Filter { pred } => Ok(PhysicOp::Filter { pred: pred.clone() }),

        LogicOp::Agg { keys, aggs, having } => Ok(PhysicOp::HashAgg {
            keys: keys.clone(),
            aggs: aggs.clone(),
            having: having.clone(),
        }),

        LogicOp::Order { keys, descends } => Ok(PhysicOp::Sort {
            keys: keys.clone(),
            descends: descends.clone(),
        }),

        LogicOp::Limit { limit } => Ok(PhysicOp::Limit { limit: *limit }),

        LogicOp::FromQuery {
            alias,
            tabref,
            publish,
            ..
        } => Ok(PhysicOp::FromQuery {
            alias: alias.clone(),
            tabref: *tabref,
            publish: *publish,
        }),

        LogicOp::Result { exprs } => Ok(PhysicOp::Result {
            exprs: exprs.clone(),
        }),

        LogicOp::Insert { table } => Ok(PhysicOp::Insert {
            table: table.clone(),
        }),

        LogicOp::MemoRef { .. } => Err(PlannerError::Internal(
            "cannot lower a memo reference".to_string(),
        )),
    }
}

/// Join implementation choice
///
/// Hash join requires an equi-join conjunct and a left subtree free of
/// outer references: correlated scans need the row-at-a-time parameter
/// passing only the nested loop provides.
fn lower_join(
    join_type: JoinType,
    filter: &Option<Expr>,
    children: &[ChildInfo],
    opts: &QueryOptions,
) -> PlannerResult<PhysicOp> {
    let left = children[0];
    if opts.enable_hashjoin && !left.publishes {
        if let Some(f) = filter {
            let (left_keys, right_keys, residual) = split_equi_conjuncts(f, left.width);
            if !left_keys.is_empty() {
                return Ok(PhysicOp::HashJoin {
                    join_type,
                    left_keys,
                    right_keys,
                    filter: residual,
                });
            }
        }
    }
    if !opts.enable_nljoin {
        return Err(PlannerError::Unsupported(
            "join has no hash implementation and nested-loop is disabled".to_string(),
        ));
    }
    Ok(PhysicOp::NLJoin {
        join_type,
        filter: filter.clone(),
    })
}

/// Split a resolved join predicate into equi-join key pairs and a
/// residual
///
/// After ordinal resolution every leaf is a positional ref into the
/// combined row; a conjunct `x = y` with all of x's refs on the left
/// side and all of y's on the right (or swapped) becomes a key pair.
/// Right-side keys shift down by the left width so they evaluate
/// against the build row alone.
pub(crate) fn split_equi_conjuncts(
    filter: &Expr,
    left_width: usize,
) -> (Vec<Expr>, Vec<Expr>, Option<Expr>) {
    let mut left_keys = Vec::new();
    let mut right_keys = Vec::new();
    let mut residual = Vec::new();

    for conj in filter.and_list() {
        if let ExprKind::Binary {
            op: BinOp::Eq,
            left,
            right,
        } = &conj.kind
        {
            let l_side = ref_side(left, left_width);
            let r_side = ref_side(right, left_width);
            match (l_side, r_side) {
                (Some(false), Some(true)) => {
                    left_keys.push(left.as_ref().clone());
                    right_keys.push(shift_refs(right, left_width));
                    continue;
                }
                (Some(true), Some(false)) => {
                    left_keys.push(right.as_ref().clone());
                    right_keys.push(shift_refs(left, left_width));
                    continue;
                }
                _ => {}
            }
        }
        residual.push(conj.clone());
    }
    (left_keys, right_keys, Expr::combine_and(residual))
}

/// Which side of the combined row an expression reads: Some(false) for
/// left-only, Some(true) for right-only, None for mixed or ref-free
fn ref_side(e: &Expr, left_width: usize) -> Option<bool> {
    let mut any = false;
    let mut left = false;
    let mut right = false;
    e.visit_each(&mut |n| {
        if let ExprKind::Ref { ordinal, .. } = &n.kind {
            any = true;
            if *ordinal < left_width {
                left = true;
            } else {
                right = true;
            }
        }
    });
    match (any, left, right) {
        (true, true, false) => Some(false),
        (true, false, true) => Some(true),
        _ => None,
    }
}

/// Shift every positional ref down by `delta`
fn shift_refs(e: &Expr, delta: usize) -> Expr {
    let mut out = e.clone();
    if let ExprKind::Ref { ordinal, .. } = &mut out.kind {
        *ordinal -= delta;
        return out;
    }
    for c in out.children_mut() {
        let r = shift_refs(c, delta);
        *c = r;
    }
    out
}

/// Index seek detection: a conjunct `col = const` over an indexed
/// column turns the scan into a lookup
fn find_index_seek(
    table: &str,
    filter: &Option<Expr>,
    catalog: &Catalog,
) -> Option<(String, Expr, Option<Expr>)> {
    let filter = filter.as_ref()?;
    let def = catalog.try_table(table)?;
    let mut residual: Vec<Expr> = Vec::new();
    let mut hit: Option<(String, Expr)> = None;
    for conj in filter.and_list() {
        if hit.is_none() {
            if let ExprKind::Binary {
                op: BinOp::Eq,
                left,
                right,
            } = &conj.kind
            {
                let as_seek = |col: &Expr, key: &Expr| -> Option<(String, Expr)> {
                    if !key.is_const() {
                        return None;
                    }
                    if let ExprKind::Ref { ordinal, .. } = &col.kind {
                        let idx = def.index_on(*ordinal)?;
                        return Some((idx.name.clone(), key.clone()));
                    }
                    None
                };
                if let Some(found) = as_seek(left, right).or_else(|| as_seek(right, left)) {
                    hit = Some(found);
                    continue;
                }
            }
        }
        residual.push(conj.clone());
    }
    hit.map(|(index, key)| (index, key, Expr::combine_and(residual)))
}

/// Honest one-to-one lowering of a resolved logical plan
pub fn direct_to_physical(
    node: &LogicNode,
    opts: &QueryOptions,
    catalog: &Catalog,
) -> PlannerResult<PhysicNode> {
    let infos: Vec<ChildInfo> = node.children.iter().map(ChildInfo::of).collect();
    let op = lower_single(node, &infos, opts, catalog)?;
    let children = node
        .children
        .iter()
        .map(|c| direct_to_physical(c, opts, catalog))
        .collect::<PlannerResult<Vec<_>>>()?;
    Ok(PhysicNode::new(op, children, node.output.clone()))
}

/// Wrap every operator in a row/loop counter
pub fn add_profile_deep(mut node: PhysicNode) -> PhysicNode {
    node.children = node.children.drain(..).map(add_profile_deep).collect();
    let output = node.output.clone();
    PhysicNode::new(
        PhysicOp::Profile {
            rows: Cell::new(0),
            loops: Cell::new(0),
        },
        vec![node],
        output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::planner::logical::build_select_plan;
    use crate::sql::ast::Statement;
    use crate::sql::binder::{Binder, BoundQuery};
    use crate::sql::parser::Parser;

    fn lower(sql: &str, opts: &QueryOptions) -> PhysicNode {
        let catalog = Catalog::with_test_tables();
        let stmt = Parser::parse_one(sql).unwrap();
        let select = match stmt {
            Statement::Select(s) => s,
            _ => panic!("expected SELECT"),
        };
        let bound = Binder::new(&catalog).bind(&select).unwrap();
        let sel = match &bound.query {
            BoundQuery::Select(s) => s.clone(),
            _ => panic!("expected plain select"),
        };
        let mut node = build_select_plan(&sel, &bound.tables, opts).unwrap();
        node.resolve_output(&sel.selection, false).unwrap();
        direct_to_physical(&node, opts, &catalog).unwrap()
    }

    fn find_op<'a>(node: &'a PhysicNode, name: &str) -> Option<&'a PhysicNode> {
        if node.name() == name {
            return Some(node);
        }
        node.children.iter().find_map(|c| find_op(c, name))
    }

    #[test]
    fn test_equi_join_lowers_to_hash_join() {
        let plan = lower(
            "SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1",
            &QueryOptions::default(),
        );
        let join = find_op(&plan, "HashJoin").expect("hash join");
        match &join.op {
            PhysicOp::HashJoin {
                left_keys,
                right_keys,
                ..
            } => {
                assert_eq!(left_keys.len(), 1);
                assert_eq!(right_keys.len(), 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_non_equi_join_lowers_to_nl_join() {
        let plan = lower(
            "SELECT x.a1 FROM a x, b y WHERE x.a1 < y.b1",
            &QueryOptions::default(),
        );
        assert!(find_op(&plan, "NLJoin").is_some());
        assert!(find_op(&plan, "HashJoin").is_none());
    }

    #[test]
    fn test_hashjoin_disabled_falls_back() {
        let opts = QueryOptions {
            enable_hashjoin: false,
            ..QueryOptions::default()
        };
        let plan = lower("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1", &opts);
        assert!(find_op(&plan, "NLJoin").is_some());
    }

    #[test]
    fn test_correlated_left_side_forces_nl_join() {
        // The scan of `a` publishes rows for the correlated subquery,
        // so a join above it cannot hash the left side.
        let plan = lower(
            "SELECT x.a1 FROM a x, b y \
             WHERE x.a1 = y.b1 AND EXISTS (SELECT 1 FROM c WHERE c1 = x.a2)",
            &QueryOptions::default(),
        );
        assert!(find_op(&plan, "NLJoin").is_some());
        assert!(find_op(&plan, "HashJoin").is_none());
    }

    #[test]
    fn test_profile_wraps_every_operator() {
        let opts = QueryOptions::default();
        let plan = add_profile_deep(lower("SELECT a1 FROM a WHERE a1 > 0", &opts));
        fn check(node: &PhysicNode, parent_is_profile: bool) {
            match &node.op {
                PhysicOp::Profile { .. } => {
                    for c in &node.children {
                        check(c, true);
                    }
                }
                _ => {
                    assert!(parent_is_profile, "{} not wrapped", node.name());
                    for c in &node.children {
                        check(c, false);
                    }
                }
            }
        }
        check(&plan, false);
    }

    #[test]
    fn test_index_seek_lowering() {
        let mut catalog = Catalog::with_test_tables();
        catalog
            .table_mut("a")
            .unwrap()
            .build_index("idx_a1", 0, false)
            .unwrap();
        let opts = QueryOptions {
            enable_indexseek: true,
            ..QueryOptions::default()
        };
        let stmt = Parser::parse_one("SELECT a2 FROM a WHERE a1 = 1").unwrap();
        let select = match stmt {
            Statement::Select(s) => s,
            _ => unreachable!(),
        };
        let bound = Binder::new(&catalog).bind(&select).unwrap();
        let sel = match &bound.query {
            BoundQuery::Select(s) => s.clone(),
            _ => unreachable!(),
        };
        let mut node = build_select_plan(&sel, &bound.tables, &opts).unwrap();
        node.resolve_output(&sel.selection, false).unwrap();
        let plan = direct_to_physical(&node, &opts, &catalog).unwrap();
        match &plan.op {
            PhysicOp::IndexSeek { index, filter, .. } => {
                assert_eq!(index, "idx_a1");
                assert!(filter.is_none());
            }
            other => panic!("expected index seek, got {:?}", other),
        }
    }
}
