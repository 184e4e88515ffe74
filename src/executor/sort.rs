//! Sort executor
//!
//! Buffers every child row, sorts by the precomputed key tuples with
//! per-key direction, then emits in order.

use std::cmp::Ordering;

use crate::planner::PhysicNode;
use crate::sql::expr::Expr;

use super::datum::Datum;
use super::error::ExecutorResult;
use super::eval::eval;
use super::row::Row;
use super::{exec, project, ExecContext, RowCallback};

pub(super) fn exec_sort(
    node: &PhysicNode,
    keys: &[Expr],
    descends: &[bool],
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let child = &node.children[0];
    let mut buffered: Vec<(Vec<Datum>, Row)> = Vec::new();
    exec(child, ctx, &mut |ctx, row| {
        let key = keys
            .iter()
            .map(|k| eval(k, ctx, row))
            .collect::<ExecutorResult<Vec<_>>>()?;
        buffered.push((key, row.clone()));
        Ok(())
    })?;

    buffered.sort_by(|(a, _), (b, _)| compare_keys(a, b, descends));

    for (_, row) in &buffered {
        let out = project(&node.output, ctx, row)?;
        cb(ctx, &out)?;
    }
    Ok(())
}

fn compare_keys(a: &[Datum], b: &[Datum], descends: &[bool]) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let mut ord = x.cmp(y);
        if descends.get(i).copied().unwrap_or(false) {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
