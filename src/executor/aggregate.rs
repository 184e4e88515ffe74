//! Hash aggregate executor
//!
//! Groups child rows by the key list, folds each aggregate, then
//! projects `keys ++ aggregate results` through the node's output,
//! applying HAVING on the intermediate row.

use std::collections::BTreeMap;

use crate::planner::PhysicNode;
use crate::sql::ast::AggKind;
use crate::sql::expr::Expr;

use super::datum::Datum;
use super::error::ExecutorResult;
use super::eval::{agg_kind, eval, eval_agg_input};
use super::row::Row;
use super::{exec, project, ExecContext, RowCallback};

/// Folding state for one aggregate
#[derive(Debug, Clone)]
pub(super) enum Accumulator {
    Count(i64),
    /// Sum keeps integer inputs integral
    Sum(Option<Datum>),
    Avg { sum: f64, count: i64 },
    Min(Option<Datum>),
    Max(Option<Datum>),
}

impl Accumulator {
    pub(super) fn new(kind: AggKind) -> Self {
        match kind {
            AggKind::Count => Accumulator::Count(0),
            AggKind::Sum => Accumulator::Sum(None),
            AggKind::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggKind::Min => Accumulator::Min(None),
            AggKind::Max => Accumulator::Max(None),
        }
    }

    pub(super) fn accumulate(&mut self, value: &Datum) {
        if value.is_null() {
            return;
        }
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(sum) => {
                *sum = Some(match sum.take() {
                    None => value.clone(),
                    Some(Datum::Int(a)) => match value {
                        Datum::Int(b) => Datum::Int(a + b),
                        _ => Datum::Double(a as f64 + value.as_double().unwrap_or(0.0)),
                    },
                    Some(Datum::Double(a)) => {
                        Datum::Double(a + value.as_double().unwrap_or(0.0))
                    }
                    Some(other) => other,
                });
            }
            Accumulator::Avg { sum, count } => {
                if let Some(v) = value.as_double() {
                    *sum += v;
                    *count += 1;
                }
            }
            Accumulator::Min(min) => match min {
                None => *min = Some(value.clone()),
                Some(m) if value < m => *min = Some(value.clone()),
                _ => {}
            },
            Accumulator::Max(max) => match max {
                None => *max = Some(value.clone()),
                Some(m) if value > m => *max = Some(value.clone()),
                _ => {}
            },
        }
    }

    pub(super) fn finalize(&self) -> Datum {
        match self {
            Accumulator::Count(n) => Datum::Int(*n),
            Accumulator::Sum(sum) => sum.clone().unwrap_or(Datum::Null),
            Accumulator::Avg { sum, count } => {
                if *count == 0 {
                    Datum::Null
                } else {
                    Datum::Double(*sum / *count as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) => v.clone().unwrap_or(Datum::Null),
        }
    }
}

/// Hash aggregation over the child
#[allow(clippy::too_many_arguments)]
pub(super) fn exec_hash_agg(
    node: &PhysicNode,
    keys: &[Expr],
    aggs: &[Expr],
    having: &Option<Expr>,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let kinds = aggs.iter().map(agg_kind).collect::<ExecutorResult<Vec<_>>>()?;

    // BTreeMap keeps group output deterministic
    let mut groups: BTreeMap<Vec<Datum>, Vec<Accumulator>> = BTreeMap::new();
    let child = &node.children[0];
    exec(child, ctx, &mut |ctx, row| {
        let key_vals = keys
            .iter()
            .map(|k| eval(k, ctx, row))
            .collect::<ExecutorResult<Vec<_>>>()?;
        let accs = groups
            .entry(key_vals)
            .or_insert_with(|| kinds.iter().map(|k| Accumulator::new(*k)).collect());
        for (acc, agg) in accs.iter_mut().zip(aggs) {
            let value = eval_agg_input(agg, ctx, row)?;
            acc.accumulate(&value);
        }
        Ok(())
    })?;

    // Aggregates without GROUP BY over empty input still produce one row
    if groups.is_empty() && keys.is_empty() && !aggs.is_empty() {
        groups.insert(
            Vec::new(),
            kinds.iter().map(|k| Accumulator::new(*k)).collect(),
        );
    }

    for (key_vals, accs) in &groups {
        let mut mid = key_vals.clone();
        mid.extend(accs.iter().map(|a| a.finalize()));
        let mid = Row::new(mid);
        if let Some(h) = having {
            if !eval(h, ctx, &mid)?.as_bool().unwrap_or(false) {
                continue;
            }
        }
        let out = project(&node.output, ctx, &mid)?;
        cb(ctx, &out)?;
    }
    Ok(())
}
