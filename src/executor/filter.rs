//! Filter executor

use crate::planner::PhysicNode;
use crate::sql::expr::Expr;

use super::error::ExecutorResult;
use super::eval::eval;
use super::{exec, project, ExecContext, RowCallback};

pub(super) fn exec_filter(
    node: &PhysicNode,
    pred: &Expr,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let child = &node.children[0];
    exec(child, ctx, &mut |ctx, row| {
        if eval(pred, ctx, row)?.as_bool().unwrap_or(false) {
            let out = project(&node.output, ctx, row)?;
            cb(ctx, &out)?;
        }
        Ok(())
    })
}
