//! Limit executor
//!
//! Counts emitted rows and goes quiet once the limit is reached; the
//! child still runs to completion under the callback model.

use crate::planner::PhysicNode;

use super::error::ExecutorResult;
use super::{exec, project, ExecContext, RowCallback};

pub(super) fn exec_limit(
    node: &PhysicNode,
    limit: usize,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let child = &node.children[0];
    let mut emitted = 0usize;
    exec(child, ctx, &mut |ctx, row| {
        if emitted >= limit {
            return Ok(());
        }
        emitted += 1;
        let out = project(&node.output, ctx, row)?;
        cb(ctx, &out)
    })
}
