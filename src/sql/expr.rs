//! Bound expression algebra
//!
//! `Expr` is the post-binding expression form: every node carries its
//! resolved type and the set of table refs it touches. The planner
//! rewrites bound expressions into positional `Ref` nodes during
//! ordinal resolution; the executor interprets them against rows.
//!
//! Equality and hashing are structural (operator plus children),
//! ignore the envelope, and see through `Ref` wrappers, so a rewritten
//! expression still compares equal to its original.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use crate::catalog::DataType;
use crate::sql::ast::{AggKind, BinOp, Literal};
use crate::sql::binder::BoundSelect;

/// Identifies a table ref within one statement (statement-unique)
pub type TableRefId = usize;

/// What a subquery expression computes
#[derive(Debug, Clone)]
pub enum SubqueryKind {
    /// Single value; more than one row is a runtime error
    Scalar,
    /// Row-existence test
    Exists { negated: bool },
    /// Membership of the probe expression in the subquery's column
    In { probe: Box<Expr>, negated: bool },
}

/// Expression node kinds
#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Literal value
    Literal(Literal),
    /// Resolved column reference
    ///
    /// `ordinal` is the position within the owning table ref's columns.
    /// Outer references evaluate against the execution context's
    /// parameter row instead of the current row, and contribute nothing
    /// to `tabrefs`.
    Col {
        table: Option<String>,
        name: String,
        tabref: TableRefId,
        ordinal: usize,
        outer: bool,
    },
    /// Positional reference into the child operator's output
    ///
    /// Wraps the expression it replaced; never wraps another Ref.
    Ref { child: Box<Expr>, ordinal: usize },
    /// Binary operation
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary minus
    Neg(Box<Expr>),
    /// Logical NOT
    Not(Box<Expr>),
    /// IN (list)
    In { expr: Box<Expr>, list: Vec<Expr> },
    /// CASE expression
    Case {
        operand: Option<Box<Expr>>,
        whens: Vec<Expr>,
        thens: Vec<Expr>,
        els: Option<Box<Expr>>,
    },
    /// Scalar function call
    Func { name: String, args: Vec<Expr> },
    /// Aggregate call; `arg` is None for COUNT(*)
    Agg {
        kind: AggKind,
        arg: Option<Box<Expr>>,
    },
    /// Subquery; compared by statement-unique id
    Subquery {
        kind: SubqueryKind,
        query: Box<BoundSelect>,
        id: usize,
        cacheable: bool,
    },
    /// SELECT * placeholder; expanded by the binder, never planned
    Star { table: Option<String> },
}

/// Bound expression with its envelope
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    /// Resolved type
    pub ty: DataType,
    /// Output name, from an AS clause or derived from the expression
    pub alias: Option<String>,
    /// Invisible columns are carried for plumbing and trimmed by Collect
    pub visible: bool,
    /// Table refs this expression touches; empty for outer references
    pub tabrefs: BTreeSet<TableRefId>,
}

impl Expr {
    fn make(kind: ExprKind, ty: DataType, tabrefs: BTreeSet<TableRefId>) -> Self {
        Expr {
            kind,
            ty,
            alias: None,
            visible: true,
            tabrefs,
        }
    }

    /// Literal expression
    pub fn literal(lit: Literal) -> Self {
        let ty = match &lit {
            Literal::Null => DataType::Int,
            Literal::Bool(_) => DataType::Bool,
            Literal::Int(_) => DataType::Int,
            Literal::Double(_) => DataType::Double,
            Literal::Str(s) => DataType::Char(s.len() as u32),
            Literal::Date(_) => DataType::DateTime,
            Literal::Interval(_) => DataType::TimeSpan,
        };
        Self::make(ExprKind::Literal(lit), ty, BTreeSet::new())
    }

    /// Resolved column reference
    pub fn col(
        table: impl Into<String>,
        name: impl Into<String>,
        tabref: TableRefId,
        ordinal: usize,
        ty: DataType,
        outer: bool,
    ) -> Self {
        let mut tabrefs = BTreeSet::new();
        if !outer {
            tabrefs.insert(tabref);
        }
        Self::make(
            ExprKind::Col {
                table: Some(table.into()),
                name: name.into(),
                tabref,
                ordinal,
                outer,
            },
            ty,
            tabrefs,
        )
    }

    /// Binary operation; computes the result type
    ///
    /// Comparison, logic, and LIKE produce Bool; arithmetic keeps the
    /// left operand's type, promoting mixed numerics to Double.
    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        let ty = if op.is_boolean() {
            DataType::Bool
        } else {
            match (left.ty, right.ty) {
                (DataType::DateTime, DataType::DateTime) => DataType::TimeSpan,
                (DataType::DateTime, DataType::TimeSpan)
                | (DataType::TimeSpan, DataType::DateTime) => DataType::DateTime,
                (DataType::Double, _) | (_, DataType::Double) => DataType::Double,
                (l, _) => l,
            }
        };
        let mut tabrefs = left.tabrefs.clone();
        tabrefs.extend(right.tabrefs.iter().copied());
        Self::make(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
            tabrefs,
        )
    }

    /// Positional reference wrapping the expression it replaced
    pub fn reference(child: Expr, ordinal: usize) -> Self {
        // A Ref must never wrap another Ref
        let child = child.strip_ref().clone();
        debug_assert!(!matches!(child.kind, ExprKind::Ref { .. }));
        let ty = child.ty;
        let tabrefs = child.tabrefs.clone();
        let alias = child.alias.clone();
        let visible = child.visible;
        Expr {
            kind: ExprKind::Ref {
                child: Box::new(child),
                ordinal,
            },
            ty,
            alias,
            visible,
            tabrefs,
        }
    }

    /// Set the output alias
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Mark the expression as plumbing-only
    #[must_use]
    pub fn invisible(mut self) -> Self {
        self.visible = false;
        self
    }

    /// Descend through Ref wrappers to the underlying expression
    pub fn strip_ref(&self) -> &Expr {
        match &self.kind {
            ExprKind::Ref { child, .. } => child.strip_ref(),
            _ => self,
        }
    }

    /// Immediate child expressions
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Col { .. } | ExprKind::Star { .. } => vec![],
            ExprKind::Ref { child, .. } => vec![child.as_ref()],
            ExprKind::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            ExprKind::Neg(e) | ExprKind::Not(e) => vec![e.as_ref()],
            ExprKind::In { expr, list } => {
                let mut v = vec![expr.as_ref()];
                v.extend(list.iter());
                v
            }
            ExprKind::Case {
                operand,
                whens,
                thens,
                els,
            } => {
                let mut v: Vec<&Expr> = Vec::new();
                if let Some(o) = operand {
                    v.push(o.as_ref());
                }
                v.extend(whens.iter());
                v.extend(thens.iter());
                if let Some(e) = els {
                    v.push(e.as_ref());
                }
                v
            }
            ExprKind::Func { args, .. } => args.iter().collect(),
            ExprKind::Agg { arg, .. } => arg.iter().map(|b| b.as_ref()).collect(),
            // The inner statement is a separate plan; only the probe
            // participates in this expression tree.
            ExprKind::Subquery { kind, .. } => match kind {
                SubqueryKind::In { probe, .. } => vec![probe.as_ref()],
                _ => vec![],
            },
        }
    }

    /// Immediate child expressions, mutably
    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match &mut self.kind {
            ExprKind::Literal(_) | ExprKind::Col { .. } | ExprKind::Star { .. } => vec![],
            ExprKind::Ref { child, .. } => vec![child.as_mut()],
            ExprKind::Binary { left, right, .. } => vec![left.as_mut(), right.as_mut()],
            ExprKind::Neg(e) | ExprKind::Not(e) => vec![e.as_mut()],
            ExprKind::In { expr, list } => {
                let mut v = vec![expr.as_mut()];
                v.extend(list.iter_mut());
                v
            }
            ExprKind::Case {
                operand,
                whens,
                thens,
                els,
            } => {
                let mut v: Vec<&mut Expr> = Vec::new();
                if let Some(o) = operand {
                    v.push(o.as_mut());
                }
                v.extend(whens.iter_mut());
                v.extend(thens.iter_mut());
                if let Some(e) = els {
                    v.push(e.as_mut());
                }
                v
            }
            ExprKind::Func { args, .. } => args.iter_mut().collect(),
            ExprKind::Agg { arg, .. } => arg.iter_mut().map(|b| b.as_mut()).collect(),
            ExprKind::Subquery { kind, .. } => match kind {
                SubqueryKind::In { probe, .. } => vec![probe.as_mut()],
                _ => vec![],
            },
        }
    }

    /// Pre-order traversal over every node
    pub fn visit_each<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        for c in self.children() {
            c.visit_each(f);
        }
    }

    /// Pre-order traversal, short-circuiting on the first `true`
    pub fn visit_each_exists<F: FnMut(&Expr) -> bool>(&self, f: &mut F) -> bool {
        if f(self) {
            return true;
        }
        self.children().iter().any(|c| c.visit_each_exists(f))
    }

    /// Clone with every subexpression equal to `from` replaced by `to`
    ///
    /// Matching is whole-expression equality; the traversal does not
    /// descend into replaced nodes.
    pub fn search_replace(&self, from: &Expr, to: &Expr) -> Expr {
        if self == from {
            return to.clone();
        }
        let mut out = self.clone();
        for c in out.children_mut() {
            let replaced = c.search_replace(from, to);
            *c = replaced;
        }
        out
    }

    /// Clone with every node aliased `key` replaced by `to`
    ///
    /// The replacement keeps the alias so downstream name lookups still
    /// find it.
    pub fn replace_by_alias(&self, key: &str, to: &Expr) -> Expr {
        if self.alias.as_deref() == Some(key) {
            return to.clone().with_alias(key);
        }
        let mut out = self.clone();
        for c in out.children_mut() {
            let replaced = c.replace_by_alias(key, to);
            *c = replaced;
        }
        out
    }

    /// Whether any node satisfies the predicate on its kind
    pub fn any_kind<F: Fn(&ExprKind) -> bool>(&self, f: F) -> bool {
        self.visit_each_exists(&mut |e| f(&e.kind))
    }

    /// Whether the expression contains an aggregate call
    pub fn has_agg(&self) -> bool {
        self.any_kind(|k| matches!(k, ExprKind::Agg { .. }))
    }

    /// Whether the expression contains a subquery
    pub fn has_subquery(&self) -> bool {
        self.any_kind(|k| matches!(k, ExprKind::Subquery { .. }))
    }

    /// Whether the expression references no columns at all
    pub fn is_const(&self) -> bool {
        !self.any_kind(|k| matches!(k, ExprKind::Col { .. } | ExprKind::Subquery { .. }))
    }

    /// Collect every column node, outer references included
    pub fn collect_cols(&self) -> Vec<Expr> {
        let mut cols = Vec::new();
        self.visit_each(&mut |e| {
            if matches!(e.kind, ExprKind::Col { .. }) {
                cols.push(e.clone());
            }
        });
        cols
    }

    /// Collect every aggregate call in the expression
    pub fn collect_aggs(&self) -> Vec<Expr> {
        let mut aggs = Vec::new();
        self.visit_each(&mut |e| {
            if matches!(e.kind, ExprKind::Agg { .. }) {
                aggs.push(e.clone());
            }
        });
        aggs
    }

    /// Split a conjunction into its AND-list
    pub fn and_list(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Binary {
                op: BinOp::And,
                left,
                right,
            } => {
                let mut list = left.and_list();
                list.extend(right.and_list());
                list
            }
            _ => vec![self],
        }
    }

    /// Fold a list of predicates back into one AND chain
    pub fn combine_and(mut exprs: Vec<Expr>) -> Option<Expr> {
        let first = if exprs.is_empty() {
            return None;
        } else {
            exprs.remove(0)
        };
        Some(
            exprs
                .into_iter()
                .fold(first, |acc, e| Expr::binary(BinOp::And, acc, e)),
        )
    }

    /// Output name for display: the alias, else a rendering of the node
    pub fn output_name(&self) -> String {
        if let Some(a) = &self.alias {
            return a.clone();
        }
        format!("{}", self)
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        let a = self.strip_ref();
        let b = other.strip_ref();
        match (&a.kind, &b.kind) {
            (ExprKind::Literal(x), ExprKind::Literal(y)) => x == y,
            (
                ExprKind::Col {
                    table: t1,
                    name: n1,
                    ..
                },
                ExprKind::Col {
                    table: t2,
                    name: n2,
                    ..
                },
            ) => {
                // A missing qualifier on either side is tolerated
                if n1 != n2 {
                    return false;
                }
                match (t1, t2) {
                    (Some(x), Some(y)) => x == y,
                    _ => true,
                }
            }
            (
                ExprKind::Binary {
                    op: o1,
                    left: l1,
                    right: r1,
                },
                ExprKind::Binary {
                    op: o2,
                    left: l2,
                    right: r2,
                },
            ) => o1 == o2 && l1 == l2 && r1 == r2,
            (ExprKind::Neg(x), ExprKind::Neg(y)) => x == y,
            (ExprKind::Not(x), ExprKind::Not(y)) => x == y,
            (ExprKind::In { expr: e1, list: l1 }, ExprKind::In { expr: e2, list: l2 }) => {
                e1 == e2 && l1 == l2
            }
            (
                ExprKind::Case {
                    operand: o1,
                    whens: w1,
                    thens: t1,
                    els: e1,
                },
                ExprKind::Case {
                    operand: o2,
                    whens: w2,
                    thens: t2,
                    els: e2,
                },
            ) => o1 == o2 && w1 == w2 && t1 == t2 && e1 == e2,
            (ExprKind::Func { name: n1, args: a1 }, ExprKind::Func { name: n2, args: a2 }) => {
                n1 == n2 && a1 == a2
            }
            (
                ExprKind::Agg {
                    kind: k1,
                    arg: arg1,
                },
                ExprKind::Agg {
                    kind: k2,
                    arg: arg2,
                },
            ) => k1 == k2 && arg1 == arg2,
            (ExprKind::Subquery { id: i1, .. }, ExprKind::Subquery { id: i2, .. }) => i1 == i2,
            (ExprKind::Star { table: t1 }, ExprKind::Star { table: t2 }) => t1 == t2,
            _ => false,
        }
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let e = self.strip_ref();
        std::mem::discriminant(&e.kind).hash(state);
        match &e.kind {
            ExprKind::Literal(lit) => match lit {
                Literal::Null => 0u8.hash(state),
                Literal::Bool(b) => b.hash(state),
                Literal::Int(i) => i.hash(state),
                Literal::Double(f) => f.to_bits().hash(state),
                Literal::Str(s) => s.hash(state),
                Literal::Date(d) => d.hash(state),
                Literal::Interval(d) => d.hash(state),
            },
            // Only the column name: equality tolerates a missing table
            ExprKind::Col { name, .. } => name.hash(state),
            ExprKind::Ref { .. } => unreachable!("strip_ref removed Ref wrappers"),
            ExprKind::Binary { op, left, right } => {
                op.hash(state);
                left.hash(state);
                right.hash(state);
            }
            ExprKind::Neg(x) | ExprKind::Not(x) => x.hash(state),
            ExprKind::In { expr, list } => {
                expr.hash(state);
                list.hash(state);
            }
            ExprKind::Case {
                operand,
                whens,
                thens,
                els,
            } => {
                operand.hash(state);
                whens.hash(state);
                thens.hash(state);
                els.hash(state);
            }
            ExprKind::Func { name, args } => {
                name.hash(state);
                args.hash(state);
            }
            ExprKind::Agg { kind, arg } => {
                kind.hash(state);
                arg.hash(state);
            }
            ExprKind::Subquery { id, .. } => id.hash(state),
            ExprKind::Star { table } => table.hash(state),
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ExprKind::Literal(lit) => match lit {
                Literal::Null => write!(f, "null"),
                Literal::Bool(b) => write!(f, "{}", b),
                Literal::Int(i) => write!(f, "{}", i),
                Literal::Double(d) => write!(f, "{}", d),
                Literal::Str(s) => write!(f, "'{}'", s),
                Literal::Date(d) => write!(f, "date'{}'", d),
                Literal::Interval(d) => write!(f, "interval'{} days'", d),
            },
            ExprKind::Col { table, name, .. } => match table {
                Some(t) => write!(f, "{}.{}", t, name),
                None => write!(f, "{}", name),
            },
            ExprKind::Ref { child, ordinal } => write!(f, "{}@{}", child, ordinal),
            ExprKind::Binary { op, left, right } => write!(f, "{} {} {}", left, op, right),
            ExprKind::Neg(e) => write!(f, "-{}", e),
            ExprKind::Not(e) => write!(f, "not {}", e),
            ExprKind::In { expr, list } => {
                write!(f, "{} in (", expr)?;
                for (i, e) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            ExprKind::Case { .. } => write!(f, "case"),
            ExprKind::Func { name, args } => {
                write!(f, "{}(", name)?;
                for (i, e) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            ExprKind::Agg { kind, arg } => match arg {
                Some(a) => write!(f, "{}({})", kind, a),
                None => write!(f, "{}(*)", kind),
            },
            ExprKind::Subquery { kind, id, .. } => match kind {
                SubqueryKind::Scalar => write!(f, "subquery#{}", id),
                SubqueryKind::Exists { negated: false } => write!(f, "exists#{}", id),
                SubqueryKind::Exists { negated: true } => write!(f, "not exists#{}", id),
                SubqueryKind::In { probe, negated } => {
                    if *negated {
                        write!(f, "{} not in subquery#{}", probe, id)
                    } else {
                        write!(f, "{} in subquery#{}", probe, id)
                    }
                }
            },
            ExprKind::Star { table } => match table {
                Some(t) => write!(f, "{}.*", t),
                None => write!(f, "*"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(e: &Expr) -> u64 {
        let mut h = DefaultHasher::new();
        e.hash(&mut h);
        h.finish()
    }

    fn col(name: &str) -> Expr {
        Expr::col("a", name, 0, 0, DataType::Int, false)
    }

    fn lit(i: i64) -> Expr {
        Expr::literal(Literal::Int(i))
    }

    #[test]
    fn test_clone_preserves_equality_and_hash() {
        let e = Expr::binary(BinOp::Add, col("a1"), lit(3));
        let c = e.clone();
        assert_eq!(e, c);
        assert_eq!(hash_of(&e), hash_of(&c));
    }

    #[test]
    fn test_ref_is_transparent_to_equality() {
        let c = col("a1");
        let wrapped = Expr::reference(c.clone(), 2);
        assert_eq!(wrapped, c);
        assert_eq!(hash_of(&wrapped), hash_of(&c));
    }

    #[test]
    fn test_ref_never_wraps_ref() {
        let c = col("a1");
        let once = Expr::reference(c, 1);
        let twice = Expr::reference(once, 4);
        assert!(matches!(
            &twice.kind,
            ExprKind::Ref { child, .. } if !matches!(child.kind, ExprKind::Ref { .. })
        ));
    }

    #[test]
    fn test_col_equality_tolerates_missing_table() {
        let qualified = col("a1");
        let mut bare = qualified.clone();
        if let ExprKind::Col { table, .. } = &mut bare.kind {
            *table = None;
        }
        assert_eq!(qualified, bare);
        assert_eq!(hash_of(&qualified), hash_of(&bare));
    }

    #[test]
    fn test_search_replace_identity() {
        let x = col("a2");
        let e = Expr::binary(BinOp::Gt, Expr::binary(BinOp::Add, col("a1"), x.clone()), lit(0));
        assert_eq!(e.search_replace(&x, &x), e);
    }

    #[test]
    fn test_search_replace_swaps_subtree() {
        let from = col("a1");
        let to = lit(7);
        let e = Expr::binary(BinOp::Add, from.clone(), col("a2"));
        let replaced = e.search_replace(&from, &to);
        match &replaced.kind {
            ExprKind::Binary { left, .. } => {
                assert!(matches!(left.kind, ExprKind::Literal(Literal::Int(7))))
            }
            _ => panic!("expected binary"),
        }
    }

    #[test]
    fn test_replace_by_alias() {
        let aliased = col("a1").with_alias("total");
        let e = Expr::binary(BinOp::Gt, aliased, lit(1));
        let replaced = e.replace_by_alias("total", &lit(42));
        match &replaced.kind {
            ExprKind::Binary { left, .. } => {
                assert!(matches!(left.kind, ExprKind::Literal(Literal::Int(42))));
                assert_eq!(left.alias.as_deref(), Some("total"));
            }
            _ => panic!("expected binary"),
        }
    }

    #[test]
    fn test_visit_each_exists_short_circuits() {
        let e = Expr::binary(BinOp::Add, col("a1"), lit(3));
        let mut seen = 0;
        let found = e.visit_each_exists(&mut |_| {
            seen += 1;
            true
        });
        assert!(found);
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_and_list() {
        let p1 = Expr::binary(BinOp::Gt, col("a1"), lit(0));
        let p2 = Expr::binary(BinOp::Lt, col("a2"), lit(9));
        let p3 = Expr::binary(BinOp::Eq, col("a3"), lit(5));
        let conj = Expr::combine_and(vec![p1.clone(), p2.clone(), p3.clone()]).unwrap();
        let list = conj.and_list();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0], &p1);
        assert_eq!(list[2], &p3);
    }

    #[test]
    fn test_binary_result_types() {
        let d = Expr::literal(Literal::Double(1.5));
        assert_eq!(Expr::binary(BinOp::Add, lit(1), d).ty, DataType::Double);
        assert_eq!(Expr::binary(BinOp::Add, lit(1), lit(2)).ty, DataType::Int);
        assert_eq!(Expr::binary(BinOp::Gt, lit(1), lit(2)).ty, DataType::Bool);
    }

    #[test]
    fn test_collect_and_predicates() {
        let agg = Expr {
            kind: ExprKind::Agg {
                kind: AggKind::Sum,
                arg: Some(Box::new(col("a2"))),
            },
            ty: DataType::Int,
            alias: None,
            visible: true,
            tabrefs: BTreeSet::new(),
        };
        let e = Expr::binary(BinOp::Gt, agg, lit(1));
        assert!(e.has_agg());
        assert!(!e.has_subquery());
        assert_eq!(e.collect_aggs().len(), 1);
        assert_eq!(e.collect_cols().len(), 1);
        assert!(!e.is_const());
        assert!(lit(3).is_const());
    }
}
