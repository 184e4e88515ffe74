//! Name binding against the catalog
//!
//! The binder takes a parsed statement and resolves:
//! - FROM items to table refs (base tables, external tables, derived
//!   tables, CTE references), each with a statement-unique id
//! - column names to (table ref, ordinal, type), walking the scope
//!   chain outward; a hit in an enclosing scope becomes an outer
//!   reference recorded on the owning table ref
//! - every expression to a typed `Expr`, with SELECT * expanded away
//!
//! Subqueries are numbered by a counter on the statement root, so
//! binding is free of process statics and safe under parallel tests.

use crate::catalog::{Catalog, DataType};
use crate::sql::ast::{self, AggKind, BinOp, Cte, FromItem, JoinType, Literal, SelectStmt, SetOpKind};
use crate::sql::error::{SqlError, SqlResult};
use crate::sql::expr::{Expr, ExprKind, SubqueryKind, TableRefId};

/// What a table ref stands for
#[derive(Debug, Clone)]
pub enum TableRefKind {
    /// Base table in the catalog
    Base { table: String },
    /// File-backed table in the catalog
    External { table: String, path: String },
    /// Derived table: (SELECT ...) alias
    Derived { query: Box<BoundSelect> },
    /// CTE reference, re-bound per use
    Cte {
        name: String,
        query: Box<BoundSelect>,
    },
}

/// A column captured from an enclosing scope
#[derive(Debug, Clone, PartialEq)]
pub struct OuterRef {
    pub name: String,
    pub ordinal: usize,
}

/// One table in a FROM clause, addressable by id for the whole
/// statement's lifetime
#[derive(Debug, Clone)]
pub struct TableRefData {
    pub id: TableRefId,
    pub alias: String,
    pub kind: TableRefKind,
    /// Column names and types, in ordinal order
    pub columns: Vec<(String, DataType)>,
    /// Columns of this table referenced from nested scopes
    ///
    /// A back-reference collection: descriptors, not owners. Non-empty
    /// means the scan publishes its current row for inner plans.
    pub outer_refs: Vec<OuterRef>,
}

impl TableRefData {
    /// All columns of this ref as bound expressions
    pub fn all_columns(&self) -> Vec<Expr> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| {
                Expr::col(self.alias.clone(), name.clone(), self.id, i, *ty, false)
                    .with_alias(name.clone())
            })
            .collect()
    }

    /// Locate a column by name
    pub fn locate_column(&self, name: &str) -> Option<(usize, DataType)> {
        self.columns
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| (i, self.columns[i].1))
    }
}

/// Bound FROM tree; joins are left-deep
#[derive(Debug, Clone)]
pub enum FromNode {
    Single(TableRefId),
    Join {
        join_type: JoinType,
        left: Box<FromNode>,
        right: Box<FromNode>,
        condition: Option<Expr>,
    },
}

/// Bound SELECT
#[derive(Debug, Clone)]
pub struct BoundSelect {
    pub selection: Vec<Expr>,
    pub from: Option<FromNode>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    /// (key, descending)
    pub orders: Vec<(Expr, bool)>,
    pub limit: Option<usize>,
    pub distinct: bool,
}

/// Bound query: a SELECT or a tree of set operations over SELECTs
#[derive(Debug, Clone)]
pub enum BoundQuery {
    Select(BoundSelect),
    SetOp {
        kind: SetOpKind,
        all: bool,
        left: Box<BoundQuery>,
        right: Box<BoundQuery>,
    },
}

impl BoundQuery {
    /// Output columns of the query
    pub fn output(&self) -> &[Expr] {
        match self {
            BoundQuery::Select(s) => &s.selection,
            BoundQuery::SetOp { left, .. } => left.output(),
        }
    }
}

/// A fully bound statement: the query plus the statement-global table
/// ref arena and subquery count
#[derive(Debug, Clone)]
pub struct Bound {
    pub query: BoundQuery,
    pub tables: Vec<TableRefData>,
    pub subquery_count: usize,
}

/// One level in the scope chain
#[derive(Debug)]
struct Scope {
    /// alias -> table ref, in registration order
    entries: Vec<(String, TableRefId)>,
    /// CTEs visible from this scope
    ctes: Vec<Cte>,
    parent: Option<usize>,
}

/// Name binder
///
/// Owns the table-ref arena and scope chain while binding one
/// statement; both the arena and counters are rooted here rather than
/// in process statics.
pub struct Binder<'a> {
    catalog: &'a Catalog,
    tables: Vec<TableRefData>,
    scopes: Vec<Scope>,
    next_subquery: usize,
    cte_stack: Vec<String>,
}

impl<'a> Binder<'a> {
    /// Create a new binder
    pub fn new(catalog: &'a Catalog) -> Self {
        Binder {
            catalog,
            tables: Vec::new(),
            scopes: Vec::new(),
            next_subquery: 0,
            cte_stack: Vec::new(),
        }
    }

    /// Bind a SELECT statement, set operations included
    pub fn bind(mut self, stmt: &SelectStmt) -> SqlResult<Bound> {
        let query = self.bind_query(stmt, None)?;
        tracing::debug!(
            tables = self.tables.len(),
            subqueries = self.next_subquery,
            "statement bound"
        );
        Ok(Bound {
            query,
            tables: self.tables,
            subquery_count: self.next_subquery,
        })
    }

    fn bind_query(&mut self, stmt: &SelectStmt, parent: Option<usize>) -> SqlResult<BoundQuery> {
        let left = BoundQuery::Select(self.bind_select(stmt, parent)?);
        match &stmt.setop {
            None => Ok(left),
            Some(chain) => {
                let (kind, all, rhs) = chain.as_ref();
                let right = self.bind_query(rhs, parent)?;
                check_setop_shape(left.output(), right.output())?;
                Ok(BoundQuery::SetOp {
                    kind: *kind,
                    all: *all,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
        }
    }

    /// Bind one SELECT in a fresh scope under `parent`
    pub fn bind_select(
        &mut self,
        stmt: &SelectStmt,
        parent: Option<usize>,
    ) -> SqlResult<BoundSelect> {
        let scope = self.scopes.len();
        self.scopes.push(Scope {
            entries: Vec::new(),
            ctes: stmt.ctes.clone(),
            parent,
        });

        // Register every FROM item before binding any expression so
        // join constraints can see the whole scope.
        let mut from: Option<FromNode> = None;
        for item in &stmt.from {
            let id = self.bind_from_item(item, scope)?;
            from = Some(match from {
                None => FromNode::Single(id),
                Some(prev) => FromNode::Join {
                    join_type: JoinType::Cross,
                    left: Box::new(prev),
                    right: Box::new(FromNode::Single(id)),
                    condition: None,
                },
            });
        }
        let mut pending_joins = Vec::new();
        for join in &stmt.joins {
            let id = self.bind_from_item(&join.item, scope)?;
            pending_joins.push((join, id));
        }
        for (join, id) in pending_joins {
            let condition = join
                .condition
                .as_ref()
                .map(|c| self.bind_expr(c, scope))
                .transpose()?;
            if let Some(c) = &condition {
                require_bool(c, "join condition")?;
            }
            let prev = from.ok_or_else(|| {
                SqlError::Parse("JOIN without a preceding FROM item".to_string())
            })?;
            from = Some(FromNode::Join {
                join_type: join.join_type,
                left: Box::new(prev),
                right: Box::new(FromNode::Single(id)),
                condition,
            });
        }

        // Expand * and bind the projection
        let mut selection = Vec::new();
        for item in &stmt.selection {
            match &item.expr {
                ast::Expr::Star { table } => {
                    selection.extend(self.expand_star(table.as_deref(), scope)?);
                }
                e => {
                    let mut bound = self.bind_expr(e, scope)?;
                    if let Some(alias) = &item.alias {
                        bound = bound.with_alias(alias.clone());
                    } else if bound.alias.is_none() {
                        if let ExprKind::Col { name, .. } = &bound.kind {
                            let name = name.clone();
                            bound = bound.with_alias(name);
                        }
                    }
                    selection.push(bound);
                }
            }
        }
        debug_assert!(selection
            .iter()
            .all(|e| !matches!(e.kind, ExprKind::Star { .. })));

        let filter = stmt
            .filter
            .as_ref()
            .map(|f| self.bind_expr(f, scope))
            .transpose()?;
        if let Some(f) = &filter {
            require_bool(f, "where clause")?;
        }

        let group_by = stmt
            .group_by
            .iter()
            .map(|g| self.bind_expr(g, scope))
            .collect::<SqlResult<Vec<_>>>()?;

        let having = stmt
            .having
            .as_ref()
            .map(|h| self.bind_expr(h, scope))
            .transpose()?;

        let mut orders = Vec::new();
        for (i, key) in stmt.orders.iter().enumerate() {
            let desc = stmt.descends.get(i).copied().unwrap_or(false);
            let bound = match self.bind_expr(key, scope) {
                Ok(e) => e,
                // ORDER BY may name a projection alias
                Err(SqlError::UnknownColumn(name)) => selection
                    .iter()
                    .find(|s| s.alias.as_deref() == Some(name.as_str()))
                    .cloned()
                    .ok_or(SqlError::UnknownColumn(name))?,
                Err(e) => return Err(e),
            };
            orders.push((bound, desc));
        }

        let limit = stmt
            .limit
            .as_ref()
            .map(|l| match l {
                ast::Expr::Literal(Literal::Int(n)) if *n >= 0 => Ok(*n as usize),
                _ => Err(SqlError::Parse("LIMIT must be a non-negative integer".into())),
            })
            .transpose()?;

        Ok(BoundSelect {
            selection,
            from,
            filter,
            group_by,
            having,
            orders,
            limit,
            distinct: stmt.distinct,
        })
    }

    /// Bind an expression with no tables in scope (INSERT ... VALUES)
    pub fn bind_value(&mut self, expr: &ast::Expr) -> SqlResult<Expr> {
        if self.scopes.is_empty() {
            self.scopes.push(Scope {
                entries: Vec::new(),
                ctes: Vec::new(),
                parent: None,
            });
        }
        self.bind_expr(expr, 0)
    }

    fn bind_from_item(&mut self, item: &FromItem, scope: usize) -> SqlResult<TableRefId> {
        match item {
            FromItem::Table { name, alias } => {
                let alias = alias.clone().unwrap_or_else(|| name.clone());
                if let Some(def) = self.catalog.try_table(name) {
                    let columns: Vec<_> = def
                        .columns
                        .iter()
                        .map(|c| (c.name.clone(), c.data_type))
                        .collect();
                    let kind = match &def.source {
                        Some(path) => TableRefKind::External {
                            table: name.clone(),
                            path: path.clone(),
                        },
                        None => TableRefKind::Base {
                            table: name.clone(),
                        },
                    };
                    self.register_table(scope, alias, kind, columns)
                } else if let Some(cte) = self.find_cte(name, scope) {
                    if self.cte_stack.iter().any(|n| n == name) {
                        return Err(SqlError::Unsupported(format!(
                            "recursive CTE '{}'",
                            name
                        )));
                    }
                    self.cte_stack.push(name.clone());
                    let bound = self.bind_select(&cte.query, Some(scope))?;
                    self.cte_stack.pop();
                    let columns = derived_columns(&bound);
                    self.register_table(
                        scope,
                        alias,
                        TableRefKind::Cte {
                            name: name.clone(),
                            query: Box::new(bound),
                        },
                        columns,
                    )
                } else {
                    Err(SqlError::UnknownTable(name.clone()))
                }
            }
            FromItem::Subquery { query, alias } => {
                let bound = self.bind_select(query, Some(scope))?;
                let columns = derived_columns(&bound);
                self.register_table(
                    scope,
                    alias.clone(),
                    TableRefKind::Derived {
                        query: Box::new(bound),
                    },
                    columns,
                )
            }
        }
    }

    fn register_table(
        &mut self,
        scope: usize,
        alias: String,
        kind: TableRefKind,
        columns: Vec<(String, DataType)>,
    ) -> SqlResult<TableRefId> {
        if self.scopes[scope].entries.iter().any(|(a, _)| *a == alias) {
            return Err(SqlError::TableAliasConflict(alias));
        }
        let id = self.tables.len();
        self.tables.push(TableRefData {
            id,
            alias: alias.clone(),
            kind,
            columns,
            outer_refs: Vec::new(),
        });
        self.scopes[scope].entries.push((alias, id));
        Ok(id)
    }

    fn find_cte(&self, name: &str, scope: usize) -> Option<Cte> {
        let mut cur = Some(scope);
        while let Some(s) = cur {
            if let Some(cte) = self.scopes[s].ctes.iter().find(|c| c.name == name) {
                return Some(cte.clone());
            }
            cur = self.scopes[s].parent;
        }
        None
    }

    fn expand_star(&mut self, table: Option<&str>, scope: usize) -> SqlResult<Vec<Expr>> {
        let entries = self.scopes[scope].entries.clone();
        match table {
            Some(alias) => {
                let (_, id) = entries
                    .iter()
                    .find(|(a, _)| a == alias)
                    .ok_or_else(|| SqlError::UnknownTable(alias.to_string()))?;
                Ok(self.tables[*id].all_columns())
            }
            None => {
                if entries.is_empty() {
                    return Err(SqlError::Parse("SELECT * without FROM".to_string()));
                }
                let mut out = Vec::new();
                for (_, id) in entries {
                    out.extend(self.tables[id].all_columns());
                }
                Ok(out)
            }
        }
    }

    fn bind_expr(&mut self, expr: &ast::Expr, scope: usize) -> SqlResult<Expr> {
        match expr {
            ast::Expr::Column { table, name } => {
                self.resolve_column(table.as_deref(), name, scope)
            }
            ast::Expr::Literal(lit) => Ok(Expr::literal(lit.clone())),
            ast::Expr::Binary { op, left, right } => {
                let l = self.bind_expr(left, scope)?;
                let r = self.bind_expr(right, scope)?;
                check_binary(*op, &l, &r)?;
                Ok(Expr::binary(*op, l, r))
            }
            ast::Expr::Unary { neg, expr } => {
                let e = self.bind_expr(expr, scope)?;
                if *neg {
                    if !e.ty.is_numeric() && e.ty != DataType::TimeSpan {
                        return Err(type_mismatch(e.ty, DataType::Int, "unary minus"));
                    }
                    let ty = e.ty;
                    let tabrefs = e.tabrefs.clone();
                    Ok(Expr {
                        kind: ExprKind::Neg(Box::new(e)),
                        ty,
                        alias: None,
                        visible: true,
                        tabrefs,
                    })
                } else {
                    require_bool(&e, "NOT")?;
                    let tabrefs = e.tabrefs.clone();
                    Ok(Expr {
                        kind: ExprKind::Not(Box::new(e)),
                        ty: DataType::Bool,
                        alias: None,
                        visible: true,
                        tabrefs,
                    })
                }
            }
            ast::Expr::Function { name, args } => self.bind_function(name, args, scope),
            ast::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let probe = self.bind_expr(expr, scope)?;
                let mut bound_list = Vec::new();
                for item in list {
                    let b = self.bind_expr(item, scope)?;
                    if !probe.ty.compatible(&b.ty) {
                        return Err(type_mismatch(probe.ty, b.ty, "IN list"));
                    }
                    bound_list.push(b);
                }
                let mut tabrefs = probe.tabrefs.clone();
                for b in &bound_list {
                    tabrefs.extend(b.tabrefs.iter().copied());
                }
                let e = Expr {
                    kind: ExprKind::In {
                        expr: Box::new(probe),
                        list: bound_list,
                    },
                    ty: DataType::Bool,
                    alias: None,
                    visible: true,
                    tabrefs,
                };
                Ok(if *negated { not(e) } else { e })
            }
            ast::Expr::InSubquery {
                expr,
                query,
                negated,
            } => {
                let probe = self.bind_expr(expr, scope)?;
                let probe_refs = probe.tabrefs.clone();
                let (query, id, cacheable, inner_ty) = self.bind_subquery(query, scope)?;
                if !probe.ty.compatible(&inner_ty) {
                    return Err(type_mismatch(probe.ty, inner_ty, "IN subquery"));
                }
                Ok(Expr {
                    kind: ExprKind::Subquery {
                        kind: SubqueryKind::In {
                            probe: Box::new(probe),
                            negated: *negated,
                        },
                        query: Box::new(query),
                        id,
                        cacheable,
                    },
                    ty: DataType::Bool,
                    alias: None,
                    visible: true,
                    tabrefs: probe_refs,
                })
            }
            ast::Expr::Exists { query, negated } => {
                let (query, id, cacheable, _) = self.bind_subquery_any_shape(query, scope)?;
                Ok(Expr {
                    kind: ExprKind::Subquery {
                        kind: SubqueryKind::Exists { negated: *negated },
                        query: Box::new(query),
                        id,
                        cacheable,
                    },
                    ty: DataType::Bool,
                    alias: None,
                    visible: true,
                    tabrefs: Default::default(),
                })
            }
            ast::Expr::ScalarSubquery(query) => {
                let (query, id, cacheable, inner_ty) = self.bind_subquery(query, scope)?;
                Ok(Expr {
                    kind: ExprKind::Subquery {
                        kind: SubqueryKind::Scalar,
                        query: Box::new(query),
                        id,
                        cacheable,
                    },
                    ty: inner_ty,
                    alias: None,
                    visible: true,
                    tabrefs: Default::default(),
                })
            }
            ast::Expr::Case {
                operand,
                whens,
                thens,
                els,
            } => self.bind_case(operand.as_deref(), whens, thens, els.as_deref(), scope),
            ast::Expr::Star { .. } => Err(SqlError::Parse(
                "* is only allowed in the SELECT list".to_string(),
            )),
        }
    }

    fn bind_case(
        &mut self,
        operand: Option<&ast::Expr>,
        whens: &[ast::Expr],
        thens: &[ast::Expr],
        els: Option<&ast::Expr>,
        scope: usize,
    ) -> SqlResult<Expr> {
        let operand = operand.map(|o| self.bind_expr(o, scope)).transpose()?;
        let whens = whens
            .iter()
            .map(|w| self.bind_expr(w, scope))
            .collect::<SqlResult<Vec<_>>>()?;
        let thens = thens
            .iter()
            .map(|t| self.bind_expr(t, scope))
            .collect::<SqlResult<Vec<_>>>()?;
        let els = els.map(|e| self.bind_expr(e, scope)).transpose()?;

        for w in &whens {
            match &operand {
                Some(op) => {
                    if !op.ty.compatible(&w.ty) {
                        return Err(type_mismatch(op.ty, w.ty, "CASE comparison"));
                    }
                }
                None => require_bool(w, "CASE WHEN")?,
            }
        }
        let result_ty = thens.first().map(|t| t.ty).unwrap_or(DataType::Int);
        for t in thens.iter().skip(1) {
            if !result_ty.compatible(&t.ty) {
                return Err(type_mismatch(result_ty, t.ty, "CASE arms"));
            }
        }
        if let Some(e) = &els {
            if !result_ty.compatible(&e.ty) {
                return Err(type_mismatch(result_ty, e.ty, "CASE else"));
            }
        }

        let mut tabrefs = std::collections::BTreeSet::new();
        for e in operand.iter().chain(whens.iter()).chain(thens.iter()).chain(els.iter()) {
            tabrefs.extend(e.tabrefs.iter().copied());
        }
        Ok(Expr {
            kind: ExprKind::Case {
                operand: operand.map(Box::new),
                whens,
                thens,
                els: els.map(Box::new),
            },
            ty: result_ty,
            alias: None,
            visible: true,
            tabrefs,
        })
    }

    fn bind_function(&mut self, name: &str, args: &[ast::Expr], scope: usize) -> SqlResult<Expr> {
        let lower = name.to_lowercase();
        let agg = match lower.as_str() {
            "count" => Some(AggKind::Count),
            "sum" => Some(AggKind::Sum),
            "avg" => Some(AggKind::Avg),
            "min" => Some(AggKind::Min),
            "max" => Some(AggKind::Max),
            _ => None,
        };
        if let Some(kind) = agg {
            // COUNT(*) arrives with no argument
            let arg = match args.len() {
                0 => None,
                1 => Some(self.bind_expr(&args[0], scope)?),
                n => {
                    return Err(SqlError::Parse(format!(
                        "{} takes at most one argument, got {}",
                        lower, n
                    )))
                }
            };
            if matches!(kind, AggKind::Sum | AggKind::Avg) {
                if let Some(a) = &arg {
                    if !a.ty.is_numeric() {
                        return Err(type_mismatch(a.ty, DataType::Int, "aggregate argument"));
                    }
                }
            }
            let ty = match kind {
                AggKind::Count => DataType::Int,
                AggKind::Avg => DataType::Double,
                AggKind::Sum | AggKind::Min | AggKind::Max => {
                    arg.as_ref().map(|a| a.ty).unwrap_or(DataType::Int)
                }
            };
            let tabrefs = arg
                .as_ref()
                .map(|a| a.tabrefs.clone())
                .unwrap_or_default();
            return Ok(Expr {
                kind: ExprKind::Agg {
                    kind,
                    arg: arg.map(Box::new),
                },
                ty,
                alias: None,
                visible: true,
                tabrefs,
            });
        }

        let args = args
            .iter()
            .map(|a| self.bind_expr(a, scope))
            .collect::<SqlResult<Vec<_>>>()?;
        let ty = match lower.as_str() {
            "upper" | "lower" => DataType::Char(0),
            "abs" => args.first().map(|a| a.ty).unwrap_or(DataType::Int),
            "round" => DataType::Double,
            "coalesce" => args.first().map(|a| a.ty).unwrap_or(DataType::Int),
            "year" => DataType::Int,
            _ => return Err(SqlError::Unsupported(format!("function '{}'", name))),
        };
        let mut tabrefs = std::collections::BTreeSet::new();
        for a in &args {
            tabrefs.extend(a.tabrefs.iter().copied());
        }
        Ok(Expr {
            kind: ExprKind::Func { name: lower, args },
            ty,
            alias: None,
            visible: true,
            tabrefs,
        })
    }

    /// Bind a subquery that must produce exactly one column
    fn bind_subquery(
        &mut self,
        query: &SelectStmt,
        scope: usize,
    ) -> SqlResult<(BoundSelect, usize, bool, DataType)> {
        let (bound, id, cacheable, _) = self.bind_subquery_any_shape(query, scope)?;
        let visible = bound.selection.iter().filter(|e| e.visible).count();
        if visible != 1 {
            return Err(SqlError::SubqueryShape(visible));
        }
        let ty = bound.selection[0].ty;
        Ok((bound, id, cacheable, ty))
    }

    fn bind_subquery_any_shape(
        &mut self,
        query: &SelectStmt,
        scope: usize,
    ) -> SqlResult<(BoundSelect, usize, bool, DataType)> {
        if query.setop.is_some() {
            return Err(SqlError::Unsupported(
                "set operation inside a subquery".to_string(),
            ));
        }
        self.next_subquery += 1;
        let id = self.next_subquery;
        let watermark = self.tables.len();
        let bound = self.bind_select(query, Some(scope))?;
        // Cacheable iff nothing in the subquery (transitively) reaches
        // a table outside its own scope.
        let cacheable = !self.correlated_below(&bound, watermark);
        tracing::debug!(id, cacheable, "subquery bound");
        Ok((bound, id, cacheable, DataType::Bool))
    }

    /// Does any expression under `sel` reference a table ref created
    /// before `watermark` as an outer reference?
    fn correlated_below(&self, sel: &BoundSelect, watermark: usize) -> bool {
        let mut correlated = false;
        self.walk_select(sel, &mut |e: &Expr| {
            e.visit_each(&mut |node| {
                if let ExprKind::Col { tabref, outer, .. } = &node.kind {
                    if *outer && *tabref < watermark {
                        correlated = true;
                    }
                }
            });
        });
        correlated
    }

    /// Walk every expression under a bound select, nested derived
    /// tables and subquery expressions included
    fn walk_select<F: FnMut(&Expr)>(&self, sel: &BoundSelect, f: &mut F) {
        fn walk_expr<F: FnMut(&Expr)>(e: &Expr, f: &mut F, walker: &dyn Fn(&BoundSelect, &mut F)) {
            f(e);
            if let ExprKind::Subquery { query, .. } = &e.kind {
                walker(query, f);
            }
            for c in e.children() {
                walk_expr(c, f, walker);
            }
        }
        fn walk_from<F: FnMut(&Expr)>(
            node: &FromNode,
            tables: &[TableRefData],
            f: &mut F,
            walker: &dyn Fn(&BoundSelect, &mut F),
        ) {
            match node {
                FromNode::Single(id) => match &tables[*id].kind {
                    TableRefKind::Derived { query } | TableRefKind::Cte { query, .. } => {
                        walker(query, f)
                    }
                    _ => {}
                },
                FromNode::Join {
                    left,
                    right,
                    condition,
                    ..
                } => {
                    walk_from(left, tables, f, walker);
                    walk_from(right, tables, f, walker);
                    if let Some(c) = condition {
                        walk_expr(c, f, walker);
                    }
                }
            }
        }

        let tables = &self.tables;
        fn walker_impl<F: FnMut(&Expr)>(sel: &BoundSelect, f: &mut F, tables: &[TableRefData]) {
            let walker = |s: &BoundSelect, f: &mut F| walker_impl(s, f, tables);
            for e in sel
                .selection
                .iter()
                .chain(sel.filter.iter())
                .chain(sel.group_by.iter())
                .chain(sel.having.iter())
                .chain(sel.orders.iter().map(|(e, _)| e))
            {
                walk_expr(e, f, &walker);
            }
            if let Some(from) = &sel.from {
                walk_from(from, tables, f, &walker);
            }
        }
        walker_impl(sel, f, tables);
    }

    /// Resolve a column reference, walking the scope chain outward
    ///
    /// First match wins; two candidate tables in the same scope is an
    /// error. A hit in an ancestor scope becomes an outer reference
    /// and is recorded on the owning table ref.
    fn resolve_column(
        &mut self,
        table: Option<&str>,
        name: &str,
        scope: usize,
    ) -> SqlResult<Expr> {
        let mut cur = Some(scope);
        let mut depth = 0usize;
        let mut saw_alias = false;
        while let Some(s) = cur {
            let mut found: Option<(TableRefId, usize, DataType, String)> = None;
            for (alias, id) in &self.scopes[s].entries {
                if let Some(t) = table {
                    if alias != t {
                        continue;
                    }
                    saw_alias = true;
                }
                if let Some((ordinal, ty)) = self.tables[*id].locate_column(name) {
                    if found.is_some() {
                        return Err(SqlError::AmbiguousColumn(name.to_string()));
                    }
                    found = Some((*id, ordinal, ty, alias.clone()));
                }
            }
            if let Some((tabref, ordinal, ty, alias)) = found {
                let outer = depth > 0;
                if outer {
                    let rec = OuterRef {
                        name: name.to_string(),
                        ordinal,
                    };
                    let refs = &mut self.tables[tabref].outer_refs;
                    if !refs.contains(&rec) {
                        refs.push(rec);
                    }
                }
                return Ok(Expr::col(alias, name, tabref, ordinal, ty, outer));
            }
            cur = self.scopes[s].parent;
            depth += 1;
        }
        match table {
            Some(t) if !saw_alias => Err(SqlError::UnknownTable(t.to_string())),
            _ => Err(SqlError::UnknownColumn(name.to_string())),
        }
    }
}

/// Wrap a boolean expression in NOT
fn not(e: Expr) -> Expr {
    let tabrefs = e.tabrefs.clone();
    Expr {
        kind: ExprKind::Not(Box::new(e)),
        ty: DataType::Bool,
        alias: None,
        visible: true,
        tabrefs,
    }
}

/// Column list a derived table or CTE exposes: the inner selection's
/// output names and types
fn derived_columns(bound: &BoundSelect) -> Vec<(String, DataType)> {
    bound
        .selection
        .iter()
        .filter(|e| e.visible)
        .map(|e| (e.output_name(), e.ty))
        .collect()
}

fn check_setop_shape(left: &[Expr], right: &[Expr]) -> SqlResult<()> {
    if left.len() != right.len() {
        return Err(SqlError::Parse(format!(
            "set operation arms have {} vs {} columns",
            left.len(),
            right.len()
        )));
    }
    for (l, r) in left.iter().zip(right) {
        if !l.ty.compatible(&r.ty) {
            return Err(type_mismatch(l.ty, r.ty, "set operation"));
        }
    }
    Ok(())
}

fn check_binary(op: BinOp, left: &Expr, right: &Expr) -> SqlResult<()> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let date_math = matches!(
                (left.ty, right.ty),
                (DataType::DateTime, DataType::TimeSpan)
                    | (DataType::TimeSpan, DataType::DateTime)
                    | (DataType::DateTime, DataType::DateTime)
            ) && matches!(op, BinOp::Add | BinOp::Sub);
            if !date_math && (!left.ty.is_numeric() || !right.ty.is_numeric()) {
                return Err(type_mismatch(left.ty, right.ty, "arithmetic"));
            }
        }
        BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            if !left.ty.compatible(&right.ty) {
                return Err(type_mismatch(left.ty, right.ty, "comparison"));
            }
        }
        BinOp::And | BinOp::Or => {
            require_bool(left, "logical operand")?;
            require_bool(right, "logical operand")?;
        }
        BinOp::Like | BinOp::NotLike => {
            if !matches!(left.ty, DataType::Char(_)) || !matches!(right.ty, DataType::Char(_)) {
                return Err(type_mismatch(left.ty, right.ty, "LIKE"));
            }
        }
    }
    Ok(())
}

fn require_bool(e: &Expr, context: &str) -> SqlResult<()> {
    if e.ty != DataType::Bool {
        return Err(type_mismatch(e.ty, DataType::Bool, context));
    }
    Ok(())
}

fn type_mismatch(left: DataType, right: DataType, context: &str) -> SqlError {
    SqlError::TypeMismatch {
        left,
        right,
        context: context.to_string(),
    }
}

/// Sanity helper for tests: every outer reference is captured exactly
/// once on some table ref
#[cfg(test)]
pub(crate) fn outer_ref_capture_count(bound: &Bound, name: &str) -> usize {
    bound
        .tables
        .iter()
        .map(|t| t.outer_refs.iter().filter(|r| r.name == name).count())
        .sum::<usize>()
}
