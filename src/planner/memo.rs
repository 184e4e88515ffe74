//! Memo - equivalence groups for the Cascades-style optimizer
//!
//! `enqueue` recurses a resolved logical plan, registering each node
//! as a group keyed by its logical signature and replacing children
//! with `MemoRef` placeholders. Rules then grow each group with
//! logically equivalent members (logical rewrites and physical
//! implementations); extraction picks the cheapest physical member per
//! group.
//!
//! Signature law: the signature hashes the operator kind, the
//! unordered set of child groups (flattened through inner-join
//! chains), and the commutative normal form of the predicate AND-list,
//! so `A JOIN B ON p` and `B JOIN A ON p` land in one group.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use crate::catalog::Catalog;
use crate::planner::error::{PlannerError, PlannerResult};
use crate::planner::logical::{LogicNode, LogicOp};
use crate::planner::physical::{PhysicNode, PhysicOp};
use crate::planner::rules::Rule;
use crate::planner::QueryOptions;
use crate::sql::ast::JoinType;
use crate::sql::expr::Expr;

/// A member of an equivalence group: a logical or physical plan whose
/// non-leaf children are `MemoRef`s
#[derive(Debug, Clone)]
pub enum GroupMember {
    Logic(LogicNode),
    Phys(PhysicNode),
}

/// Equivalence group
#[derive(Debug)]
pub struct Group {
    pub id: usize,
    pub signature: u64,
    pub members: Vec<GroupMember>,
    pub explored: bool,
}

/// The memo: groups indexed by signature plus the exploration stack
#[derive(Debug, Default)]
pub struct Memo {
    pub groups: Vec<Group>,
    sig_index: HashMap<u64, usize>,
    pub root: Option<usize>,
    to_explore: Vec<usize>,
}

impl Memo {
    pub fn new() -> Self {
        Memo::default()
    }

    /// Register a plan as the memo root
    pub fn enqueue_root(&mut self, node: LogicNode) -> usize {
        let gid = self.enqueue(node);
        self.root = Some(gid);
        gid
    }

    /// Register a plan bottom-up, replacing children with group refs
    pub fn enqueue(&mut self, mut node: LogicNode) -> usize {
        for c in node.children.iter_mut() {
            let child = std::mem::replace(
                c,
                LogicNode::new(LogicOp::MemoRef { group: 0 }, vec![]),
            );
            let output = child.output.clone();
            let gid = self.enqueue(child);
            let mut memo_ref = LogicNode::new(LogicOp::MemoRef { group: gid }, vec![]);
            memo_ref.output = output;
            *c = memo_ref;
        }
        let sig = self.signature(&node);
        match self.sig_index.get(&sig) {
            Some(&gid) => {
                self.insert_member(gid, GroupMember::Logic(node));
                gid
            }
            None => {
                let gid = self.groups.len();
                tracing::debug!(group = gid, signature = sig, "new memo group");
                self.groups.push(Group {
                    id: gid,
                    signature: sig,
                    members: vec![GroupMember::Logic(node)],
                    explored: false,
                });
                self.sig_index.insert(sig, gid);
                self.to_explore.push(gid);
                gid
            }
        }
    }

    /// Insert a member unless a structurally identical one exists
    pub fn insert_member(&mut self, gid: usize, member: GroupMember) -> bool {
        if let GroupMember::Logic(node) = &member {
            debug_assert_eq!(
                self.signature(node),
                self.groups[gid].signature,
                "rule application changed the logical signature"
            );
        }
        let key = member_key(&member);
        let exists = self.groups[gid]
            .members
            .iter()
            .any(|m| member_key(m) == key);
        if exists {
            return false;
        }
        self.groups[gid].members.push(member);
        true
    }

    /// Drive rule application until the exploration stack drains
    pub fn optimize(&mut self, rules: &[Box<dyn Rule>], opts: &QueryOptions, catalog: &Catalog) {
        while let Some(gid) = self.to_explore.pop() {
            let mut i = 0;
            // Members appended during the pass are picked up by the
            // growing bound
            while i < self.groups[gid].members.len() {
                let member = self.groups[gid].members[i].clone();
                for rule in rules {
                    if !rule.applicable(&member, self, opts) {
                        continue;
                    }
                    if let Some(new_member) = rule.apply(&member, self, opts, catalog) {
                        if self.insert_member(gid, new_member) {
                            tracing::debug!(group = gid, rule = rule.name(), "rule applied");
                        }
                    }
                }
                i += 1;
            }
            self.groups[gid].explored = true;
        }
    }

    /// Output expressions of a group (shared by all members)
    pub fn group_output(&self, gid: usize) -> &[Expr] {
        match &self.groups[gid].members[0] {
            GroupMember::Logic(n) => &n.output,
            GroupMember::Phys(n) => &n.output,
        }
    }

    /// Output width of a group
    pub fn group_width(&self, gid: usize) -> usize {
        self.group_output(gid).len()
    }

    /// Does any scan in the group's subtree publish rows for
    /// correlated evaluation?
    pub fn group_publishes(&self, gid: usize) -> bool {
        for m in &self.groups[gid].members {
            if let GroupMember::Logic(node) = m {
                return self.node_publishes(node);
            }
        }
        false
    }

    fn node_publishes(&self, node: &LogicNode) -> bool {
        match &node.op {
            LogicOp::Get { publish: true, .. } | LogicOp::FromQuery { publish: true, .. } => {
                return true
            }
            LogicOp::MemoRef { group } => return self.group_publishes(*group),
            _ => {}
        }
        node.children.iter().any(|c| self.node_publishes(c))
    }

    /// Logical signature of a memo-ized node
    pub fn signature(&self, node: &LogicNode) -> u64 {
        let mut h = DefaultHasher::new();
        match &node.op {
            LogicOp::Join {
                join_type: JoinType::Inner | JoinType::Cross,
                ..
            } => {
                let mut leaves = BTreeSet::new();
                let mut pred_sum = 0u64;
                self.flatten_join(node, &mut leaves, &mut pred_sum);
                "join".hash(&mut h);
                for leaf in &leaves {
                    leaf.hash(&mut h);
                }
                pred_sum.hash(&mut h);
            }
            op => {
                std::mem::discriminant(op).hash(&mut h);
                hash_op_content(op, &mut h);
                for c in &node.children {
                    if let LogicOp::MemoRef { group } = &c.op {
                        group.hash(&mut h);
                    }
                }
            }
        }
        h.finish()
    }

    /// Collect the leaf groups and predicate multiset of an inner-join
    /// chain, looking through child groups that are themselves joins
    fn flatten_join(&self, node: &LogicNode, leaves: &mut BTreeSet<usize>, pred_sum: &mut u64) {
        if let LogicOp::Join { filter, .. } = &node.op {
            if let Some(f) = filter {
                for conj in f.and_list() {
                    *pred_sum = pred_sum.wrapping_add(expr_hash(conj));
                }
            }
        }
        for c in &node.children {
            if let LogicOp::MemoRef { group } = &c.op {
                self.flatten_group(*group, leaves, pred_sum);
            }
        }
    }

    fn flatten_group(&self, gid: usize, leaves: &mut BTreeSet<usize>, pred_sum: &mut u64) {
        if let Some(GroupMember::Logic(node)) = self.groups[gid].members.first() {
            if matches!(
                &node.op,
                LogicOp::Join {
                    join_type: JoinType::Inner | JoinType::Cross,
                    ..
                }
            ) {
                self.flatten_join(node, leaves, pred_sum);
                return;
            }
        }
        leaves.insert(gid);
    }
}

fn expr_hash(e: &Expr) -> u64 {
    let mut h = DefaultHasher::new();
    e.hash(&mut h);
    h.finish()
}

fn hash_op_content(op: &LogicOp, h: &mut DefaultHasher) {
    match op {
        LogicOp::Get { tabref, filter, .. } => {
            tabref.hash(h);
            filter.hash(h);
        }
        LogicOp::FromQuery { tabref, .. } => tabref.hash(h),
        LogicOp::Filter { pred } => pred.hash(h),
        LogicOp::Join { join_type, filter } => {
            join_type.hash(h);
            if let Some(f) = filter {
                let mut sum = 0u64;
                for conj in f.and_list() {
                    sum = sum.wrapping_add(expr_hash(conj));
                }
                sum.hash(h);
            }
        }
        LogicOp::Agg { keys, aggs, having } => {
            keys.hash(h);
            aggs.hash(h);
            having.hash(h);
        }
        LogicOp::Order { keys, descends } => {
            keys.hash(h);
            descends.hash(h);
        }
        LogicOp::Limit { limit } => limit.hash(h),
        LogicOp::Result { exprs } => exprs.hash(h),
        LogicOp::Insert { table } => table.hash(h),
        LogicOp::MemoRef { group } => group.hash(h),
    }
}

/// Structural identity of a member, for duplicate suppression
fn member_key(m: &GroupMember) -> u64 {
    let mut h = DefaultHasher::new();
    match m {
        GroupMember::Logic(node) => {
            0u8.hash(&mut h);
            hash_logic(node, &mut h);
        }
        GroupMember::Phys(node) => {
            1u8.hash(&mut h);
            hash_phys(node, &mut h);
        }
    }
    h.finish()
}

fn hash_logic(node: &LogicNode, h: &mut DefaultHasher) {
    std::mem::discriminant(&node.op).hash(h);
    hash_op_content(&node.op, h);
    // Children are refs; their order distinguishes A JOIN B from
    // B JOIN A within the group
    for c in &node.children {
        if let LogicOp::MemoRef { group } = &c.op {
            group.hash(h);
        }
    }
}

fn hash_phys(node: &PhysicNode, h: &mut DefaultHasher) {
    std::mem::discriminant(&node.op).hash(h);
    match &node.op {
        PhysicOp::ScanTable { tabref, filter, .. } => {
            tabref.hash(h);
            filter.hash(h);
        }
        PhysicOp::ScanFile { tabref, .. } => tabref.hash(h),
        PhysicOp::IndexSeek { tabref, key, .. } => {
            tabref.hash(h);
            key.hash(h);
        }
        PhysicOp::NLJoin { join_type, filter } => {
            join_type.hash(h);
            filter.hash(h);
        }
        PhysicOp::HashJoin {
            join_type,
            left_keys,
            right_keys,
            filter,
        } => {
            join_type.hash(h);
            left_keys.hash(h);
            right_keys.hash(h);
            filter.hash(h);
        }
        PhysicOp::HashAgg { keys, aggs, having } => {
            keys.hash(h);
            aggs.hash(h);
            having.hash(h);
        }
        PhysicOp::Sort { keys, descends } => {
            keys.hash(h);
            descends.hash(h);
        }
        PhysicOp::Filter { pred } => pred.hash(h),
        PhysicOp::FromQuery { tabref, .. } => tabref.hash(h),
        PhysicOp::Limit { limit } => limit.hash(h),
        PhysicOp::Result { exprs } => exprs.hash(h),
        PhysicOp::Insert { table } => table.hash(h),
        PhysicOp::Profile { .. } | PhysicOp::MemoRef { .. } => {}
    }
    for c in &node.children {
        if let PhysicOp::MemoRef { group } = &c.op {
            group.hash(h);
        }
    }
}

impl Memo {
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn root_group(&self) -> PlannerResult<usize> {
        self.root
            .ok_or_else(|| PlannerError::Internal("memo has no root".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::planner::logical::build_select_plan;
    use crate::planner::rules::default_rules;
    use crate::sql::ast::Statement;
    use crate::sql::binder::{Binder, BoundQuery};
    use crate::sql::parser::Parser;

    fn resolved_plan(sql: &str) -> LogicNode {
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
        let opts = QueryOptions::default();
        let mut node = build_select_plan(&sel, &bound.tables, &opts).unwrap();
        node.resolve_output(&sel.selection, false).unwrap();
        node
    }

    #[test]
    fn test_enqueue_builds_groups() {
        let plan = resolved_plan("SELECT a1 FROM a WHERE a1 > 0");
        let mut memo = Memo::new();
        memo.enqueue_root(plan);
        // Filter merged into the scan: a single group
        assert_eq!(memo.group_count(), 1);
        assert!(memo.root.is_some());
    }

    #[test]
    fn test_commuted_join_keeps_signature() {
        use crate::planner::rules::JoinCommute;
        use crate::planner::rules::Rule;

        let plan = resolved_plan("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1");
        let catalog = Catalog::with_test_tables();
        let opts = QueryOptions::default();
        let mut memo = Memo::new();
        memo.enqueue_root(plan);

        let (gid, member) = memo
            .groups
            .iter()
            .find_map(|g| {
                g.members.iter().find_map(|m| match m {
                    GroupMember::Logic(n) if matches!(n.op, LogicOp::Join { .. }) => {
                        Some((g.id, m.clone()))
                    }
                    _ => None,
                })
            })
            .expect("join member");

        let commuted = JoinCommute
            .apply(&member, &memo, &opts, &catalog)
            .expect("commute applies");
        let commuted_node = match &commuted {
            GroupMember::Logic(n) => n,
            _ => unreachable!(),
        };
        assert_eq!(
            memo.signature(commuted_node),
            memo.groups[gid].signature,
            "commute must preserve the signature"
        );
        // Commuting twice restores the original member
        let back = JoinCommute
            .apply(&commuted, &memo, &opts, &catalog)
            .unwrap();
        let back_node = match &back {
            GroupMember::Logic(n) => n,
            _ => unreachable!(),
        };
        let orig_node = match &member {
            GroupMember::Logic(n) => n,
            _ => unreachable!(),
        };
        assert_eq!(memo.signature(back_node), memo.signature(orig_node));
    }

    #[test]
    fn test_associated_join_chains_share_signature() {
        use crate::catalog::DataType;
        use crate::sql::ast::BinOp;
        use crate::sql::expr::Expr;

        let scan = |table: &str, tabref: usize| {
            let mut node = LogicNode::new(
                LogicOp::Get {
                    table: table.to_string(),
                    alias: table.to_string(),
                    tabref,
                    columns: vec![(format!("{}1", table), DataType::Int)],
                    filter: None,
                    publish: false,
                    source: None,
                },
                vec![],
            );
            node.output = vec![Expr::col(
                table,
                format!("{}1", table),
                tabref,
                0,
                DataType::Int,
                false,
            )];
            node
        };
        let col = |table: &str, tabref: usize| {
            Expr::col(table, format!("{}1", table), tabref, 0, DataType::Int, false)
        };
        let join = |l: LogicNode, r: LogicNode, pred: Expr| {
            let mut node = LogicNode::new(
                LogicOp::Join {
                    join_type: JoinType::Inner,
                    filter: Some(pred),
                },
                vec![l, r],
            );
            node.output = vec![];
            node
        };

        let p1 = Expr::binary(BinOp::Eq, col("a", 0), col("b", 1));
        let p3 = Expr::binary(BinOp::Eq, col("b", 1), col("c", 2));

        // (A JOIN B on p1) JOIN C on p3  vs  A JOIN (B JOIN C on p3) on p1
        let left_deep = join(join(scan("a", 0), scan("b", 1), p1.clone()), scan("c", 2), p3.clone());
        let right_deep = join(scan("a", 0), join(scan("b", 1), scan("c", 2), p3), p1);

        let mut memo = Memo::new();
        let g1 = memo.enqueue(left_deep);
        let g2 = memo.enqueue(right_deep);
        // Same leaf multiset and same AND-list multiset: one group
        assert_eq!(g1, g2);
    }

    #[test]
    fn test_optimize_adds_physical_members() {
        let plan = resolved_plan("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1");
        let catalog = Catalog::with_test_tables();
        let opts = QueryOptions::default();
        let mut memo = Memo::new();
        memo.enqueue_root(plan);
        memo.optimize(&default_rules(), &opts, &catalog);

        for group in &memo.groups {
            assert!(group.explored);
            assert!(
                group
                    .members
                    .iter()
                    .any(|m| matches!(m, GroupMember::Phys(_))),
                "group {} has no physical member",
                group.id
            );
        }
    }

    #[test]
    fn test_commute_rule_grows_join_group() {
        let plan = resolved_plan("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1");
        let catalog = Catalog::with_test_tables();
        let opts = QueryOptions::default();
        let mut memo = Memo::new();
        memo.enqueue_root(plan);
        memo.optimize(&default_rules(), &opts, &catalog);

        let join_group = memo
            .groups
            .iter()
            .find(|g| {
                g.members.iter().any(|m| {
                    matches!(
                        m,
                        GroupMember::Logic(LogicNode {
                            op: LogicOp::Join { .. },
                            ..
                        })
                    )
                })
            })
            .expect("join group");
        let logic_joins = join_group
            .members
            .iter()
            .filter(|m| matches!(m, GroupMember::Logic(_)))
            .count();
        // The original ordering plus the commuted one
        assert_eq!(logic_joins, 2);
    }
}
