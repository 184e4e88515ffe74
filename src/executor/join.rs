//! Join executors
//!
//! The nested-loop join re-drives its right child once per left row,
//! which is what lets correlated scans under the right side observe
//! the parameter row published by the left. The hash join materializes
//! the right side once (build) and probes with the left, so it is only
//! planned when the left subtree publishes nothing.

use std::collections::HashMap;

use crate::planner::PhysicNode;
use crate::sql::ast::JoinType;
use crate::sql::expr::Expr;

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};
use super::eval::eval;
use super::row::Row;
use super::{exec, project, ExecContext, RowCallback};

fn passes(
    filter: &Option<Expr>,
    ctx: &mut ExecContext,
    combined: &Row,
) -> ExecutorResult<bool> {
    match filter {
        Some(f) => Ok(eval(f, ctx, combined)?.as_bool().unwrap_or(false)),
        None => Ok(true),
    }
}

/// Nested-loop join; implements every join type
pub(super) fn exec_nl_join(
    node: &PhysicNode,
    join_type: JoinType,
    filter: &Option<Expr>,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let left = &node.children[0];
    let right = &node.children[1];
    let right_width = right.output.len();
    let left_width = left.output.len();

    match join_type {
        // Right and full joins track which build rows matched, so the
        // right side is materialized once up front.
        JoinType::Right | JoinType::Full => {
            let mut right_rows = Vec::new();
            exec(right, ctx, &mut |_, r| {
                right_rows.push(r.clone());
                Ok(())
            })?;
            let mut right_matched = vec![false; right_rows.len()];

            exec(left, ctx, &mut |ctx, l| {
                let mut matched = false;
                for (i, r) in right_rows.iter().enumerate() {
                    let combined = Row::concat(l, r);
                    if passes(filter, ctx, &combined)? {
                        matched = true;
                        right_matched[i] = true;
                        let out = project(&node.output, ctx, &combined)?;
                        cb(ctx, &out)?;
                    }
                }
                if !matched && join_type == JoinType::Full {
                    let combined = Row::concat(l, &Row::nulls(right_width));
                    let out = project(&node.output, ctx, &combined)?;
                    cb(ctx, &out)?;
                }
                Ok(())
            })?;

            for (i, r) in right_rows.iter().enumerate() {
                if !right_matched[i] {
                    let combined = Row::concat(&Row::nulls(left_width), r);
                    let out = project(&node.output, ctx, &combined)?;
                    cb(ctx, &out)?;
                }
            }
            Ok(())
        }

        _ => exec(left, ctx, &mut |ctx, l| {
            let lrow = l.clone();
            let mut matched = 0usize;
            let mut first_match: Option<Row> = None;
            exec(right, ctx, &mut |ctx, r| {
                let combined = Row::concat(&lrow, r);
                if !passes(filter, ctx, &combined)? {
                    return Ok(());
                }
                matched += 1;
                match join_type {
                    JoinType::Inner | JoinType::Cross | JoinType::Left => {
                        let out = project(&node.output, ctx, &combined)?;
                        cb(ctx, &out)?;
                    }
                    // One output row per left row at most; emitted
                    // after the right side finishes
                    JoinType::Semi | JoinType::Single => {
                        if first_match.is_none() {
                            first_match = Some(combined);
                        }
                    }
                    JoinType::AntiSemi | JoinType::Mark => {}
                    JoinType::Right | JoinType::Full => unreachable!(),
                }
                Ok(())
            })?;

            match join_type {
                JoinType::Left if matched == 0 => {
                    let combined = Row::concat(&lrow, &Row::nulls(right_width));
                    let out = project(&node.output, ctx, &combined)?;
                    cb(ctx, &out)?;
                }
                JoinType::Semi => {
                    if let Some(combined) = first_match {
                        let out = project(&node.output, ctx, &combined)?;
                        cb(ctx, &out)?;
                    }
                }
                JoinType::AntiSemi if matched == 0 => {
                    let combined = Row::concat(&lrow, &Row::nulls(right_width));
                    let out = project(&node.output, ctx, &combined)?;
                    cb(ctx, &out)?;
                }
                JoinType::Single => {
                    if matched > 1 {
                        return Err(ExecutorError::SubqueryMultipleRows);
                    }
                    let combined = first_match
                        .unwrap_or_else(|| Row::concat(&lrow, &Row::nulls(right_width)));
                    let out = project(&node.output, ctx, &combined)?;
                    cb(ctx, &out)?;
                }
                // The mark column rides after the left columns
                JoinType::Mark => {
                    let mut marked = Row::concat(&lrow, &Row::nulls(right_width));
                    marked.push(Datum::Bool(matched > 0));
                    let out = project(&node.output, ctx, &marked)?;
                    cb(ctx, &out)?;
                }
                _ => {}
            }
            Ok(())
        }),
    }
}

/// Hash join: build a table over the right child's equi-key values,
/// probe with the left
pub(super) fn exec_hash_join(
    node: &PhysicNode,
    join_type: JoinType,
    left_keys: &[Expr],
    right_keys: &[Expr],
    filter: &Option<Expr>,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let left = &node.children[0];
    let right = &node.children[1];
    let right_width = right.output.len();
    let left_width = left.output.len();

    // Build side
    let mut build_rows: Vec<Row> = Vec::new();
    let mut table: HashMap<Vec<Datum>, Vec<usize>> = HashMap::new();
    exec(right, ctx, &mut |ctx, r| {
        let key = eval_keys(right_keys, ctx, r)?;
        let pos = build_rows.len();
        build_rows.push(r.clone());
        if !key.iter().any(|d| d.is_null()) {
            table.entry(key).or_default().push(pos);
        }
        Ok(())
    })?;
    let mut build_matched = vec![false; build_rows.len()];

    // Probe side
    exec(left, ctx, &mut |ctx, l| {
        let key = eval_keys(left_keys, ctx, l)?;
        let candidates: &[usize] = if key.iter().any(|d| d.is_null()) {
            &[]
        } else {
            table.get(&key).map(|v| v.as_slice()).unwrap_or(&[])
        };

        let mut matched = false;
        for &pos in candidates {
            let combined = Row::concat(l, &build_rows[pos]);
            if !passes(filter, ctx, &combined)? {
                continue;
            }
            matched = true;
            build_matched[pos] = true;
            match join_type {
                JoinType::Inner | JoinType::Left | JoinType::Right | JoinType::Full => {
                    let out = project(&node.output, ctx, &combined)?;
                    cb(ctx, &out)?;
                }
                JoinType::Semi => {
                    let out = project(&node.output, ctx, &combined)?;
                    cb(ctx, &out)?;
                    break;
                }
                JoinType::AntiSemi => break,
                other => {
                    return Err(ExecutorError::Internal(format!(
                        "hash join cannot implement {} join",
                        other
                    )))
                }
            }
        }

        if !matched && matches!(join_type, JoinType::Left | JoinType::Full) {
            let combined = Row::concat(l, &Row::nulls(right_width));
            let out = project(&node.output, ctx, &combined)?;
            cb(ctx, &out)?;
        }
        if !matched && join_type == JoinType::AntiSemi {
            let combined = Row::concat(l, &Row::nulls(right_width));
            let out = project(&node.output, ctx, &combined)?;
            cb(ctx, &out)?;
        }
        Ok(())
    })?;

    if matches!(join_type, JoinType::Right | JoinType::Full) {
        for (pos, r) in build_rows.iter().enumerate() {
            if !build_matched[pos] {
                let combined = Row::concat(&Row::nulls(left_width), r);
                let out = project(&node.output, ctx, &combined)?;
                cb(ctx, &out)?;
            }
        }
    }
    Ok(())
}

fn eval_keys(keys: &[Expr], ctx: &mut ExecContext, row: &Row) -> ExecutorResult<Vec<Datum>> {
    keys.iter().map(|k| eval(k, ctx, row)).collect()
}
