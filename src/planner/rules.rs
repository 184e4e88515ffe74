//! Optimization rules for the memo
//!
//! Two kinds of rule grow a group: transformations produce new logical
//! members (join commutativity), implementations produce physical
//! members through the shared per-node lowering. Rule application must
//! preserve the group's logical signature; the memo asserts it.

use crate::catalog::Catalog;
use crate::planner::logical::{LogicNode, LogicOp};
use crate::planner::memo::{GroupMember, Memo};
use crate::planner::physical::{lower_single, ChildInfo, PhysicNode, PhysicOp};
use crate::planner::QueryOptions;
use crate::sql::ast::JoinType;
use crate::sql::expr::{Expr, ExprKind};

/// Optimization rule
pub trait Rule {
    /// Rule name for debugging
    fn name(&self) -> &'static str;

    /// Whether this rule fires on the member
    fn applicable(&self, member: &GroupMember, memo: &Memo, opts: &QueryOptions) -> bool;

    /// Produce a new member for the same group, or None
    fn apply(
        &self,
        member: &GroupMember,
        memo: &Memo,
        opts: &QueryOptions,
        catalog: &Catalog,
    ) -> Option<GroupMember>;
}

/// The default rule set
pub fn default_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(JoinCommute),
        Box::new(JoinToNL),
        Box::new(JoinToHash),
        Box::new(Implementation),
    ]
}

fn join_child_infos(node: &LogicNode, memo: &Memo) -> Vec<ChildInfo> {
    node.children
        .iter()
        .map(|c| match &c.op {
            LogicOp::MemoRef { group } => ChildInfo {
                width: memo.group_width(*group),
                publishes: memo.group_publishes(*group),
            },
            _ => ChildInfo::of(c),
        })
        .collect()
}

fn memo_ref_children(node: &LogicNode) -> Vec<PhysicNode> {
    node.children
        .iter()
        .map(|c| match &c.op {
            LogicOp::MemoRef { group } => PhysicNode::new(
                PhysicOp::MemoRef { group: *group },
                vec![],
                c.output.clone(),
            ),
            _ => unreachable!("memo members have group-ref children"),
        })
        .collect()
}

/// Implement a join as a nested loop; handles every join type
pub struct JoinToNL;

impl Rule for JoinToNL {
    fn name(&self) -> &'static str {
        "join_to_nl"
    }

    fn applicable(&self, member: &GroupMember, _memo: &Memo, opts: &QueryOptions) -> bool {
        opts.enable_nljoin
            && matches!(
                member,
                GroupMember::Logic(LogicNode {
                    op: LogicOp::Join { .. },
                    ..
                })
            )
    }

    fn apply(
        &self,
        member: &GroupMember,
        _memo: &Memo,
        _opts: &QueryOptions,
        _catalog: &Catalog,
    ) -> Option<GroupMember> {
        let node = match member {
            GroupMember::Logic(n) => n,
            _ => return None,
        };
        let (join_type, filter) = match &node.op {
            LogicOp::Join { join_type, filter } => (*join_type, filter.clone()),
            _ => return None,
        };
        Some(GroupMember::Phys(PhysicNode::new(
            PhysicOp::NLJoin { join_type, filter },
            memo_ref_children(node),
            node.output.clone(),
        )))
    }
}

/// Implement a join as a hash join when an equi-conjunct exists and the
/// probe side is free of correlated scans
pub struct JoinToHash;

impl Rule for JoinToHash {
    fn name(&self) -> &'static str {
        "join_to_hash"
    }

    fn applicable(&self, member: &GroupMember, memo: &Memo, opts: &QueryOptions) -> bool {
        if !opts.enable_hashjoin {
            return false;
        }
        let node = match member {
            GroupMember::Logic(
                n @ LogicNode {
                    op: LogicOp::Join { filter: Some(_), .. },
                    ..
                },
            ) => n,
            _ => return false,
        };
        let infos = join_child_infos(node, memo);
        !infos[0].publishes
    }

    fn apply(
        &self,
        member: &GroupMember,
        memo: &Memo,
        _opts: &QueryOptions,
        _catalog: &Catalog,
    ) -> Option<GroupMember> {
        let node = match member {
            GroupMember::Logic(n) => n,
            _ => return None,
        };
        let (join_type, filter) = match &node.op {
            LogicOp::Join { join_type, filter } => (*join_type, filter.as_ref()?),
            _ => return None,
        };
        let infos = join_child_infos(node, memo);
        let (left_keys, right_keys, residual) =
            crate::planner::physical::split_equi_conjuncts(filter, infos[0].width);
        if left_keys.is_empty() {
            return None;
        }
        Some(GroupMember::Phys(PhysicNode::new(
            PhysicOp::HashJoin {
                join_type,
                left_keys,
                right_keys,
                filter: residual,
            },
            memo_ref_children(node),
            node.output.clone(),
        )))
    }
}

/// Inner-join commutativity: `A JOIN B ON p` gains the member
/// `B JOIN A ON p`, with positional refs remapped onto the swapped
/// combined row
pub struct JoinCommute;

impl Rule for JoinCommute {
    fn name(&self) -> &'static str {
        "join_commute"
    }

    fn applicable(&self, member: &GroupMember, _memo: &Memo, opts: &QueryOptions) -> bool {
        match member {
            GroupMember::Logic(LogicNode {
                op:
                    LogicOp::Join {
                        join_type: JoinType::Inner | JoinType::Cross,
                        filter,
                    },
                ..
            }) => !(opts.memo_disable_crossjoin && filter.is_none()),
            _ => false,
        }
    }

    fn apply(
        &self,
        member: &GroupMember,
        _memo: &Memo,
        _opts: &QueryOptions,
        _catalog: &Catalog,
    ) -> Option<GroupMember> {
        let node = match member {
            GroupMember::Logic(n) => n,
            _ => return None,
        };
        let lw = node.children[0].output.len();
        let rw = node.children[1].output.len();

        let mut swapped = node.clone();
        swapped.children.swap(0, 1);
        if let LogicOp::Join { filter, .. } = &mut swapped.op {
            if let Some(f) = filter {
                let r = remap_swapped(f, lw, rw);
                *f = r;
            }
        }
        swapped.output = swapped
            .output
            .iter()
            .map(|e| remap_swapped(e, lw, rw))
            .collect();
        Some(GroupMember::Logic(swapped))
    }
}

/// Remap combined-row refs after swapping join sides: left ordinals
/// move past the (new) left side, right ordinals move to the front
pub fn remap_swapped(e: &Expr, left_width: usize, right_width: usize) -> Expr {
    let mut out = e.clone();
    if let ExprKind::Ref { ordinal, .. } = &mut out.kind {
        if *ordinal < left_width {
            *ordinal += right_width;
        } else {
            *ordinal -= left_width;
        }
        return out;
    }
    for c in out.children_mut() {
        let r = remap_swapped(c, left_width, right_width);
        *c = r;
    }
    out
}

/// Implementation rule: lower a logical member to a physical member
/// with the same group refs as children
pub struct Implementation;

impl Rule for Implementation {
    fn name(&self) -> &'static str {
        "implementation"
    }

    fn applicable(&self, member: &GroupMember, _memo: &Memo, _opts: &QueryOptions) -> bool {
        // Joins have their own implementation rules
        matches!(
            member,
            GroupMember::Logic(LogicNode {
                op: LogicOp::Get { .. }
                    | LogicOp::FromQuery { .. }
                    | LogicOp::Filter { .. }
                    | LogicOp::Agg { .. }
                    | LogicOp::Order { .. }
                    | LogicOp::Limit { .. }
                    | LogicOp::Result { .. },
                ..
            })
        )
    }

    fn apply(
        &self,
        member: &GroupMember,
        memo: &Memo,
        opts: &QueryOptions,
        catalog: &Catalog,
    ) -> Option<GroupMember> {
        let node = match member {
            GroupMember::Logic(n) => n,
            _ => return None,
        };
        let infos: Vec<ChildInfo> = node
            .children
            .iter()
            .map(|c| match &c.op {
                LogicOp::MemoRef { group } => ChildInfo {
                    width: memo.group_width(*group),
                    publishes: memo.group_publishes(*group),
                },
                _ => ChildInfo::of(c),
            })
            .collect();
        let op = lower_single(node, &infos, opts, catalog).ok()?;
        let children = node
            .children
            .iter()
            .map(|c| match &c.op {
                LogicOp::MemoRef { group } => PhysicNode::new(
                    PhysicOp::MemoRef { group: *group },
                    vec![],
                    c.output.clone(),
                ),
                _ => unreachable!("memo members have group-ref children"),
            })
            .collect();
        Some(GroupMember::Phys(PhysicNode::new(
            op,
            children,
            node.output.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataType;
    use crate::sql::ast::BinOp;

    fn col(name: &str, tabref: usize, ordinal: usize) -> Expr {
        Expr::col("t", name, tabref, ordinal, DataType::Int, false)
    }

    #[test]
    fn test_remap_swapped_moves_sides() {
        // Combined row (l0, l1 | r0): refs 0,1 left, ref 2 right
        let l = Expr::reference(col("x", 0, 0), 1);
        let r = Expr::reference(col("y", 1, 0), 2);
        let pred = Expr::binary(BinOp::Eq, l, r);

        let remapped = remap_swapped(&pred, 2, 1);
        let mut ords = Vec::new();
        remapped.visit_each(&mut |e| {
            if let ExprKind::Ref { ordinal, .. } = &e.kind {
                ords.push(*ordinal);
            }
        });
        // Left ref 1 -> 1+1=2, right ref 2 -> 2-2=0
        assert_eq!(ords, vec![2, 0]);
    }
}
