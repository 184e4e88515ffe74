//! Expression evaluation
//!
//! Evaluates a bound expression against the current row. Outer
//! references read the parameter row their table ref published into
//! the execution context; subquery expressions drive their compiled
//! inner plan through the same context.

use chrono::Duration;

use crate::executor::{exec, ExecContext, SubqueryResult};
use crate::sql::ast::{AggKind, BinOp, Literal};
use crate::sql::expr::{Expr, ExprKind, SubqueryKind};

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};
use super::row::Row;

/// Evaluate an expression against a row
pub fn eval(expr: &Expr, ctx: &mut ExecContext, row: &Row) -> ExecutorResult<Datum> {
    match &expr.kind {
        ExprKind::Literal(lit) => Ok(Datum::from_literal(lit)),

        ExprKind::Ref { ordinal, .. } => row.get(*ordinal).cloned().ok_or_else(|| {
            ExecutorError::Internal(format!(
                "ref @{} out of bounds for row of {}",
                ordinal,
                row.len()
            ))
        }),

        ExprKind::Col {
            tabref,
            ordinal,
            outer,
            name,
            ..
        } => {
            if !*outer {
                return Err(ExecutorError::Internal(format!(
                    "unresolved column '{}' reached the executor",
                    name
                )));
            }
            let param = ctx.params.get(tabref).ok_or_else(|| {
                ExecutorError::Internal(format!(
                    "no parameter row published for outer reference '{}'",
                    name
                ))
            })?;
            param.get(*ordinal).cloned().ok_or_else(|| {
                ExecutorError::Internal(format!("outer reference '{}' out of bounds", name))
            })
        }

        ExprKind::Binary { op, left, right } => {
            let l = eval(left, ctx, row)?;
            let r = eval(right, ctx, row)?;
            eval_binary(*op, &l, &r)
        }

        ExprKind::Neg(e) => {
            let v = eval(e, ctx, row)?;
            v.negate()
                .ok_or_else(|| ExecutorError::Eval(format!("cannot negate {}", v)))
        }

        ExprKind::Not(e) => {
            let v = eval(e, ctx, row)?;
            v.not()
                .ok_or_else(|| ExecutorError::Eval(format!("NOT requires boolean, got {}", v)))
        }

        ExprKind::In { expr, list } => {
            let v = eval(expr, ctx, row)?;
            if v.is_null() {
                return Ok(Datum::Null);
            }
            for item in list {
                let item_val = eval(item, ctx, row)?;
                if item_val.is_null() {
                    continue;
                }
                if v == item_val {
                    return Ok(Datum::Bool(true));
                }
            }
            Ok(Datum::Bool(false))
        }

        ExprKind::Case {
            operand,
            whens,
            thens,
            els,
        } => {
            match operand {
                Some(op) => {
                    let v = eval(op, ctx, row)?;
                    for (w, t) in whens.iter().zip(thens) {
                        if eval(w, ctx, row)? == v {
                            return eval(t, ctx, row);
                        }
                    }
                }
                None => {
                    for (w, t) in whens.iter().zip(thens) {
                        if eval(w, ctx, row)?.as_bool().unwrap_or(false) {
                            return eval(t, ctx, row);
                        }
                    }
                }
            }
            match els {
                Some(e) => eval(e, ctx, row),
                None => Ok(Datum::Null),
            }
        }

        ExprKind::Func { name, args } => {
            let vals = args
                .iter()
                .map(|a| eval(a, ctx, row))
                .collect::<ExecutorResult<Vec<_>>>()?;
            eval_function(name, &vals)
        }

        ExprKind::Agg { kind, .. } => Err(ExecutorError::Internal(format!(
            "aggregate {} outside an aggregation",
            kind
        ))),

        ExprKind::Subquery {
            kind,
            id,
            cacheable,
            ..
        } => eval_subquery(kind, *id, *cacheable, ctx, row),

        ExprKind::Star { .. } => Err(ExecutorError::Internal(
            "unexpanded * reached the executor".to_string(),
        )),
    }
}

/// Evaluate an aggregate call's input for one row; COUNT(*) counts
/// rows regardless of values
pub fn eval_agg_input(agg: &Expr, ctx: &mut ExecContext, row: &Row) -> ExecutorResult<Datum> {
    match &agg.kind {
        ExprKind::Agg { arg: Some(arg), .. } => eval(arg, ctx, row),
        ExprKind::Agg { arg: None, .. } => Ok(Datum::Int(1)),
        _ => Err(ExecutorError::Internal(
            "aggregate input requested from a non-aggregate".to_string(),
        )),
    }
}

/// The aggregate kind of a collected aggregate expression
pub fn agg_kind(agg: &Expr) -> ExecutorResult<AggKind> {
    match &agg.kind {
        ExprKind::Agg { kind, .. } => Ok(*kind),
        _ => Err(ExecutorError::Internal(
            "expected an aggregate expression".to_string(),
        )),
    }
}

fn eval_binary(op: BinOp, left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    // NULL propagation for everything except AND/OR
    if !matches!(op, BinOp::And | BinOp::Or) && (left.is_null() || right.is_null()) {
        return Ok(Datum::Null);
    }

    match op {
        BinOp::Add => eval_add(left, right),
        BinOp::Sub => eval_sub(left, right),
        BinOp::Mul => eval_mul(left, right),
        BinOp::Div => eval_div(left, right),

        BinOp::Eq => Ok(Datum::Bool(left == right)),
        BinOp::Neq => Ok(Datum::Bool(left != right)),
        BinOp::Lt => Ok(Datum::Bool(left < right)),
        BinOp::Le => Ok(Datum::Bool(left <= right)),
        BinOp::Gt => Ok(Datum::Bool(left > right)),
        BinOp::Ge => Ok(Datum::Bool(left >= right)),

        BinOp::And => eval_and(left, right),
        BinOp::Or => eval_or(left, right),

        BinOp::Like => left
            .like(right)
            .ok_or_else(|| ExecutorError::Eval("LIKE requires strings".to_string())),
        BinOp::NotLike => match left.like(right) {
            Some(Datum::Bool(b)) => Ok(Datum::Bool(!b)),
            Some(Datum::Null) => Ok(Datum::Null),
            _ => Err(ExecutorError::Eval("LIKE requires strings".to_string())),
        },
    }
}

fn eval_add(left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    match (left, right) {
        (Datum::Int(a), Datum::Int(b)) => Ok(Datum::Int(a + b)),
        (Datum::Double(a), Datum::Double(b)) => Ok(Datum::Double(a + b)),
        (Datum::Int(a), Datum::Double(b)) | (Datum::Double(b), Datum::Int(a)) => {
            Ok(Datum::Double(*a as f64 + b))
        }
        (Datum::Date(d), Datum::Interval(n)) | (Datum::Interval(n), Datum::Date(d)) => {
            Ok(Datum::Date(*d + Duration::days(*n)))
        }
        (Datum::Interval(a), Datum::Interval(b)) => Ok(Datum::Interval(a + b)),
        _ => Err(ExecutorError::Eval(format!(
            "cannot add {} and {}",
            left, right
        ))),
    }
}

fn eval_sub(left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    match (left, right) {
        (Datum::Int(a), Datum::Int(b)) => Ok(Datum::Int(a - b)),
        (Datum::Double(a), Datum::Double(b)) => Ok(Datum::Double(a - b)),
        (Datum::Int(a), Datum::Double(b)) => Ok(Datum::Double(*a as f64 - b)),
        (Datum::Double(a), Datum::Int(b)) => Ok(Datum::Double(a - *b as f64)),
        (Datum::Date(d), Datum::Interval(n)) => Ok(Datum::Date(*d - Duration::days(*n))),
        (Datum::Date(a), Datum::Date(b)) => {
            Ok(Datum::Interval(a.signed_duration_since(*b).num_days()))
        }
        (Datum::Interval(a), Datum::Interval(b)) => Ok(Datum::Interval(a - b)),
        _ => Err(ExecutorError::Eval(format!(
            "cannot subtract {} from {}",
            right, left
        ))),
    }
}

fn eval_mul(left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    match (left, right) {
        (Datum::Int(a), Datum::Int(b)) => Ok(Datum::Int(a * b)),
        (Datum::Double(a), Datum::Double(b)) => Ok(Datum::Double(a * b)),
        (Datum::Int(a), Datum::Double(b)) | (Datum::Double(b), Datum::Int(a)) => {
            Ok(Datum::Double(*a as f64 * b))
        }
        _ => Err(ExecutorError::Eval(format!(
            "cannot multiply {} and {}",
            left, right
        ))),
    }
}

fn eval_div(left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    match right {
        Datum::Int(0) => return Err(ExecutorError::Eval("division by zero".to_string())),
        Datum::Double(f) if *f == 0.0 => {
            return Err(ExecutorError::Eval("division by zero".to_string()))
        }
        _ => {}
    }
    match (left, right) {
        (Datum::Int(a), Datum::Int(b)) => Ok(Datum::Int(a / b)),
        (Datum::Double(a), Datum::Double(b)) => Ok(Datum::Double(a / b)),
        (Datum::Int(a), Datum::Double(b)) => Ok(Datum::Double(*a as f64 / b)),
        (Datum::Double(a), Datum::Int(b)) => Ok(Datum::Double(a / *b as f64)),
        _ => Err(ExecutorError::Eval(format!(
            "cannot divide {} by {}",
            left, right
        ))),
    }
}

/// SQL AND with three-valued logic
fn eval_and(left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    match (left.as_bool(), right.as_bool()) {
        (Some(false), _) | (_, Some(false)) => Ok(Datum::Bool(false)),
        (Some(true), Some(true)) => Ok(Datum::Bool(true)),
        _ => Ok(Datum::Null),
    }
}

/// SQL OR with three-valued logic
fn eval_or(left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    match (left.as_bool(), right.as_bool()) {
        (Some(true), _) | (_, Some(true)) => Ok(Datum::Bool(true)),
        (Some(false), Some(false)) => Ok(Datum::Bool(false)),
        _ => Ok(Datum::Null),
    }
}

fn eval_function(name: &str, args: &[Datum]) -> ExecutorResult<Datum> {
    match name {
        "upper" => match args {
            [Datum::Str(s)] => Ok(Datum::Str(s.to_uppercase())),
            [Datum::Null] => Ok(Datum::Null),
            _ => Err(ExecutorError::Eval("upper requires a string".to_string())),
        },
        "lower" => match args {
            [Datum::Str(s)] => Ok(Datum::Str(s.to_lowercase())),
            [Datum::Null] => Ok(Datum::Null),
            _ => Err(ExecutorError::Eval("lower requires a string".to_string())),
        },
        "abs" => match args {
            [Datum::Int(i)] => Ok(Datum::Int(i.abs())),
            [Datum::Double(f)] => Ok(Datum::Double(f.abs())),
            [Datum::Null] => Ok(Datum::Null),
            _ => Err(ExecutorError::Eval("abs requires a number".to_string())),
        },
        "round" => match args {
            [Datum::Double(f)] => Ok(Datum::Double(f.round())),
            [Datum::Int(i)] => Ok(Datum::Double(*i as f64)),
            [Datum::Null] => Ok(Datum::Null),
            _ => Err(ExecutorError::Eval("round requires a number".to_string())),
        },
        "coalesce" => {
            for a in args {
                if !a.is_null() {
                    return Ok(a.clone());
                }
            }
            Ok(Datum::Null)
        }
        "year" => match args {
            [Datum::Date(d)] => {
                use chrono::Datelike;
                Ok(Datum::Int(d.year() as i64))
            }
            [Datum::Null] => Ok(Datum::Null),
            _ => Err(ExecutorError::Eval("year requires a date".to_string())),
        },
        other => Err(ExecutorError::Eval(format!("unknown function '{}'", other))),
    }
}

/// Run a subquery's compiled plan, consulting the per-statement cache
/// for uncorrelated subqueries
fn eval_subquery(
    kind: &SubqueryKind,
    id: usize,
    cacheable: bool,
    ctx: &mut ExecContext,
    row: &Row,
) -> ExecutorResult<Datum> {
    match kind {
        SubqueryKind::Scalar => {
            let value = if let Some(SubqueryResult::Scalar(v)) = ctx.cache.get(&id) {
                v.clone()
            } else {
                let v = run_scalar(id, ctx)?;
                if cacheable {
                    ctx.cache.insert(id, SubqueryResult::Scalar(v.clone()));
                }
                v
            };
            Ok(value)
        }
        SubqueryKind::Exists { negated } => {
            let found = if let Some(SubqueryResult::Exists(b)) = ctx.cache.get(&id) {
                *b
            } else {
                let b = run_exists(id, ctx)?;
                if cacheable {
                    ctx.cache.insert(id, SubqueryResult::Exists(b));
                }
                b
            };
            Ok(Datum::Bool(found != *negated))
        }
        SubqueryKind::In { probe, negated } => {
            let v = eval(probe, ctx, row)?;
            if v.is_null() {
                return Ok(Datum::Null);
            }
            let found = if let Some(SubqueryResult::Set(set)) = ctx.cache.get(&id) {
                set.contains(&v)
            } else {
                let set = run_set(id, ctx)?;
                let found = set.contains(&v);
                if cacheable {
                    ctx.cache.insert(id, SubqueryResult::Set(set));
                }
                found
            };
            Ok(Datum::Bool(found != *negated))
        }
    }
}

fn subplan(id: usize, ctx: &ExecContext) -> ExecutorResult<std::rc::Rc<crate::planner::PhysicNode>> {
    ctx.subplans
        .get(&id)
        .cloned()
        .ok_or_else(|| ExecutorError::Internal(format!("no compiled plan for subquery #{}", id)))
}

fn run_scalar(id: usize, ctx: &mut ExecContext) -> ExecutorResult<Datum> {
    let plan = subplan(id, ctx)?;
    let mut result: Option<Datum> = None;
    let mut extra = false;
    exec(&plan, ctx, &mut |_, row| {
        if result.is_some() {
            extra = true;
        } else {
            result = Some(row.get(0).cloned().unwrap_or(Datum::Null));
        }
        Ok(())
    })?;
    if extra {
        return Err(ExecutorError::SubqueryMultipleRows);
    }
    Ok(result.unwrap_or(Datum::Null))
}

fn run_exists(id: usize, ctx: &mut ExecContext) -> ExecutorResult<bool> {
    let plan = subplan(id, ctx)?;
    let mut found = false;
    exec(&plan, ctx, &mut |_, _| {
        found = true;
        Ok(())
    })?;
    Ok(found)
}

fn run_set(id: usize, ctx: &mut ExecContext) -> ExecutorResult<std::collections::HashSet<Datum>> {
    let plan = subplan(id, ctx)?;
    let mut set = std::collections::HashSet::new();
    exec(&plan, ctx, &mut |_, row| {
        if let Some(v) = row.get(0) {
            if !v.is_null() {
                set.insert(v.clone());
            }
        }
        Ok(())
    })?;
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, DataType};

    fn ctx_catalog() -> Catalog {
        Catalog::with_test_tables()
    }

    fn make_row() -> Row {
        Row::new(vec![
            Datum::Int(42),
            Datum::Str("hello".to_string()),
            Datum::Double(2.5),
            Datum::Null,
        ])
    }

    fn ref_expr(ordinal: usize, ty: DataType) -> Expr {
        Expr::reference(Expr::col("t", format!("c{}", ordinal), 0, ordinal, ty, false), ordinal)
    }

    fn lit(i: i64) -> Expr {
        Expr::literal(Literal::Int(i))
    }

    #[test]
    fn test_eval_ref_and_literal() {
        let catalog = ctx_catalog();
        let mut ctx = ExecContext::new(&catalog);
        let row = make_row();
        assert_eq!(
            eval(&ref_expr(0, DataType::Int), &mut ctx, &row).unwrap(),
            Datum::Int(42)
        );
        assert_eq!(eval(&lit(7), &mut ctx, &row).unwrap(), Datum::Int(7));
    }

    #[test]
    fn test_eval_arithmetic_and_promotion() {
        let catalog = ctx_catalog();
        let mut ctx = ExecContext::new(&catalog);
        let row = make_row();
        let add = Expr::binary(BinOp::Add, ref_expr(0, DataType::Int), lit(8));
        assert_eq!(eval(&add, &mut ctx, &row).unwrap(), Datum::Int(50));

        let mixed = Expr::binary(
            BinOp::Mul,
            ref_expr(0, DataType::Int),
            ref_expr(2, DataType::Double),
        );
        assert_eq!(eval(&mixed, &mut ctx, &row).unwrap(), Datum::Double(105.0));
    }

    #[test]
    fn test_eval_null_propagation_and_three_valued_and() {
        let catalog = ctx_catalog();
        let mut ctx = ExecContext::new(&catalog);
        let row = make_row();

        let add_null = Expr::binary(BinOp::Add, ref_expr(3, DataType::Int), lit(1));
        assert!(eval(&add_null, &mut ctx, &row).unwrap().is_null());

        let false_and_null = Expr::binary(
            BinOp::And,
            Expr::literal(Literal::Bool(false)),
            Expr::binary(BinOp::Gt, ref_expr(3, DataType::Int), lit(0)),
        );
        assert_eq!(
            eval(&false_and_null, &mut ctx, &row).unwrap(),
            Datum::Bool(false)
        );
    }

    #[test]
    fn test_eval_division_by_zero() {
        let catalog = ctx_catalog();
        let mut ctx = ExecContext::new(&catalog);
        let row = make_row();
        let div = Expr::binary(BinOp::Div, ref_expr(0, DataType::Int), lit(0));
        assert!(matches!(
            eval(&div, &mut ctx, &row),
            Err(ExecutorError::Eval(_))
        ));
    }

    #[test]
    fn test_eval_outer_reference_reads_param() {
        let catalog = ctx_catalog();
        let mut ctx = ExecContext::new(&catalog);
        ctx.params
            .insert(5, Row::new(vec![Datum::Int(1), Datum::Int(9)]));
        let outer = Expr::col("a", "a2", 5, 1, DataType::Int, true);
        let row = Row::empty();
        assert_eq!(eval(&outer, &mut ctx, &row).unwrap(), Datum::Int(9));
    }

    #[test]
    fn test_eval_date_arithmetic() {
        use chrono::NaiveDate;
        let catalog = ctx_catalog();
        let mut ctx = ExecContext::new(&catalog);
        let row = Row::empty();
        let d = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
        let e = Expr::binary(
            BinOp::Add,
            Expr::literal(Literal::Date(d)),
            Expr::literal(Literal::Interval(2)),
        );
        assert_eq!(
            eval(&e, &mut ctx, &row).unwrap(),
            Datum::Date(NaiveDate::from_ymd_opt(2020, 3, 3).unwrap())
        );
    }

    #[test]
    fn test_eval_case() {
        let catalog = ctx_catalog();
        let mut ctx = ExecContext::new(&catalog);
        let row = make_row();
        let case = Expr {
            kind: ExprKind::Case {
                operand: None,
                whens: vec![Expr::binary(BinOp::Gt, ref_expr(0, DataType::Int), lit(40))],
                thens: vec![lit(1)],
                els: Some(Box::new(lit(0))),
            },
            ty: DataType::Int,
            alias: None,
            visible: true,
            tabrefs: Default::default(),
        };
        assert_eq!(eval(&case, &mut ctx, &row).unwrap(), Datum::Int(1));
    }

    #[test]
    fn test_eval_in_list() {
        let catalog = ctx_catalog();
        let mut ctx = ExecContext::new(&catalog);
        let row = make_row();
        let e = Expr {
            kind: ExprKind::In {
                expr: Box::new(ref_expr(0, DataType::Int)),
                list: vec![lit(1), lit(42)],
            },
            ty: DataType::Bool,
            alias: None,
            visible: true,
            tabrefs: Default::default(),
        };
        assert_eq!(eval(&e, &mut ctx, &row).unwrap(), Datum::Bool(true));
    }
}
