//! EXPLAIN output formatting
//!
//! Formats a physical plan as an indented tree. Profile counters show
//! up after execution when the plan was run with profiling on.

use std::fmt::Write;

use crate::planner::physical::{PhysicNode, PhysicOp};

/// Knobs for EXPLAIN rendering
#[derive(Debug, Clone)]
pub struct ExplainOptions {
    /// Print the scanned table and alias on scan nodes
    pub show_tablename: bool,
    /// Print each node's estimated cost
    pub show_cost: bool,
    /// Print each node's output expressions
    pub show_output: bool,
}

impl Default for ExplainOptions {
    fn default() -> Self {
        ExplainOptions {
            show_tablename: true,
            show_cost: false,
            show_output: false,
        }
    }
}

/// Format a physical plan for EXPLAIN output
pub struct ExplainOutput;

impl ExplainOutput {
    /// Format a physical plan as a string
    pub fn format(
        plan: &PhysicNode,
        opts: &ExplainOptions,
        catalog: &crate::catalog::Catalog,
    ) -> String {
        let mut out = String::new();
        Self::format_node(plan, 0, opts, catalog, &mut out);
        out
    }

    fn format_node(
        node: &PhysicNode,
        indent: usize,
        opts: &ExplainOptions,
        catalog: &crate::catalog::Catalog,
        out: &mut String,
    ) {
        // Profile wrappers render as annotations on their child
        if let PhysicOp::Profile { rows, loops } = &node.op {
            let prefix = "  ".repeat(indent);
            let child = &node.children[0];
            Self::write_head(child, indent, opts, catalog, out);
            writeln!(
                out,
                "{}  (rows={}, loops={})",
                prefix,
                rows.get(),
                loops.get()
            )
            .unwrap();
            Self::write_details(child, indent, opts, out);
            for c in &child.children {
                Self::format_node(c, indent + 1, opts, catalog, out);
            }
            return;
        }

        Self::write_head(node, indent, opts, catalog, out);
        Self::write_details(node, indent, opts, out);
        for c in &node.children {
            Self::format_node(c, indent + 1, opts, catalog, out);
        }
    }

    fn write_head(
        node: &PhysicNode,
        indent: usize,
        opts: &ExplainOptions,
        catalog: &crate::catalog::Catalog,
        out: &mut String,
    ) {
        let prefix = "  ".repeat(indent);
        write!(out, "{}{}", prefix, node.name()).unwrap();
        if opts.show_tablename {
            match &node.op {
                PhysicOp::ScanTable { table, alias, .. }
                | PhysicOp::IndexSeek { table, alias, .. } => {
                    if table == alias {
                        write!(out, " {}", table).unwrap();
                    } else {
                        write!(out, " {} as {}", table, alias).unwrap();
                    }
                }
                PhysicOp::ScanFile { path, .. } => {
                    write!(out, " '{}'", path).unwrap();
                }
                PhysicOp::FromQuery { alias, .. } => {
                    write!(out, " {}", alias).unwrap();
                }
                PhysicOp::NLJoin { join_type, .. } | PhysicOp::HashJoin { join_type, .. } => {
                    write!(out, " ({})", join_type).unwrap();
                }
                _ => {}
            }
        }
        if opts.show_cost {
            let cost = crate::planner::cost::plan_cost(node, catalog);
            write!(out, " (cost={})", cost).unwrap();
        }
        writeln!(out).unwrap();
    }

    fn write_details(node: &PhysicNode, indent: usize, opts: &ExplainOptions, out: &mut String) {
        let prefix = "  ".repeat(indent);
        match &node.op {
            PhysicOp::ScanTable { filter: Some(f), .. }
            | PhysicOp::ScanFile { filter: Some(f), .. }
            | PhysicOp::NLJoin { filter: Some(f), .. }
            | PhysicOp::HashJoin { filter: Some(f), .. }
            | PhysicOp::Filter { pred: f } => {
                writeln!(out, "{}  filter: {}", prefix, f).unwrap();
            }
            PhysicOp::IndexSeek {
                key, filter, index, ..
            } => {
                writeln!(out, "{}  index: {} = {}", prefix, index, key).unwrap();
                if let Some(f) = filter {
                    writeln!(out, "{}  filter: {}", prefix, f).unwrap();
                }
            }
            PhysicOp::HashAgg { keys, aggs, having } => {
                if !keys.is_empty() {
                    writeln!(out, "{}  group by: {}", prefix, join_exprs(keys)).unwrap();
                }
                if !aggs.is_empty() {
                    writeln!(out, "{}  aggregates: {}", prefix, join_exprs(aggs)).unwrap();
                }
                if let Some(h) = having {
                    writeln!(out, "{}  having: {}", prefix, h).unwrap();
                }
            }
            PhysicOp::Sort { keys, descends } => {
                let rendered: Vec<String> = keys
                    .iter()
                    .zip(descends)
                    .map(|(k, d)| format!("{}{}", k, if *d { " desc" } else { "" }))
                    .collect();
                writeln!(out, "{}  order by: {}", prefix, rendered.join(", ")).unwrap();
            }
            PhysicOp::Limit { limit } => {
                writeln!(out, "{}  limit: {}", prefix, limit).unwrap();
            }
            _ => {}
        }
        if opts.show_output && !node.output.is_empty() {
            writeln!(out, "{}  output: {}", prefix, join_exprs(&node.output)).unwrap();
        }
    }
}

fn join_exprs(exprs: &[crate::sql::expr::Expr]) -> String {
    exprs
        .iter()
        .map(|e| format!("{}", e))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::planner::logical::build_select_plan;
    use crate::planner::physical::direct_to_physical;
    use crate::planner::QueryOptions;
    use crate::sql::ast::Statement;
    use crate::sql::binder::{Binder, BoundQuery};
    use crate::sql::parser::Parser;

    fn physical(sql: &str) -> (PhysicNode, Catalog) {
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
        let plan = direct_to_physical(&node, &opts, &catalog).unwrap();
        (plan, catalog)
    }

    #[test]
    fn test_explain_simple_scan() {
        let (plan, catalog) = physical("SELECT a1 FROM a WHERE a1 > 0");
        let text = ExplainOutput::format(&plan, &ExplainOptions::default(), &catalog);
        assert!(text.contains("ScanTable a"));
        assert!(text.contains("filter:"));
    }

    #[test]
    fn test_explain_join_tree_indents() {
        let (plan, catalog) = physical("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1");
        let text = ExplainOutput::format(&plan, &ExplainOptions::default(), &catalog);
        assert!(text.contains("HashJoin (inner)"));
        assert!(text.contains("\n  ScanTable a as x"));
        assert!(text.contains("\n  ScanTable b as y"));
    }

    #[test]
    fn test_explain_cost_and_output_options() {
        let (plan, catalog) = physical("SELECT a1 FROM a ORDER BY a2 DESC LIMIT 2");
        let opts = ExplainOptions {
            show_tablename: true,
            show_cost: true,
            show_output: true,
        };
        let text = ExplainOutput::format(&plan, &opts, &catalog);
        assert!(text.contains("(cost="));
        assert!(text.contains("output:"));
        assert!(text.contains("order by:"));
        assert!(text.contains("limit: 2"));
    }
}
