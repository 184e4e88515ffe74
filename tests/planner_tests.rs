//! Planner integration tests: memo behavior, explain output, and
//! option-driven plan shapes

use opaldb::{Database, Datum, Row};

fn ints(values: &[i64]) -> Row {
    Row::new(values.iter().map(|&v| Datum::Int(v)).collect())
}

fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| a.values().cmp(b.values()));
    rows
}

#[test]
fn test_memo_plan_matches_direct_plan_for_simple_scan() {
    // Under equal cost the memo must not change a single-scan plan
    let direct = Database::with_test_tables();
    let mut memo = Database::with_test_tables();
    memo.options.use_memo = true;

    let sql = "SELECT a1, a2 FROM a WHERE a1 > 0";
    assert_eq!(direct.explain(sql).unwrap(), memo.explain(sql).unwrap());
    assert_eq!(
        sorted(direct.run(sql).unwrap()),
        sorted(memo.run(sql).unwrap())
    );
}

#[test]
fn test_memo_picks_cheaper_join_ordering() {
    // b is analyzed down to 3 rows while a keeps the default estimate;
    // with both orderings in the memo, the hash join must build on the
    // cheaper side available to it and the result stays correct.
    let mut db = Database::with_test_tables();
    db.options.use_memo = true;
    db.run("ANALYZE TABLE a").unwrap();
    db.run("ANALYZE TABLE b").unwrap();

    let rows = db
        .run("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1")
        .unwrap();
    assert_eq!(sorted(rows), vec![ints(&[0]), ints(&[1]), ints(&[2])]);

    let plan = db
        .explain("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1")
        .unwrap();
    assert!(plan.contains("HashJoin"), "plan was:\n{}", plan);
}

#[test]
fn test_memo_join_results_match_direct() {
    let direct = Database::with_test_tables();
    let mut memo = Database::with_test_tables();
    memo.options.use_memo = true;

    for sql in [
        "SELECT x.a1, y.b2 FROM a x, b y WHERE x.a1 = y.b1",
        "SELECT x.a1 FROM a x, b y WHERE x.a2 = y.b1 AND x.a1 > 0",
        "SELECT x.a1, y.b1, z.c1 FROM a x, b y, c z WHERE x.a1 = y.b1 AND y.b1 = z.c1",
    ] {
        assert_eq!(
            sorted(direct.run(sql).unwrap()),
            sorted(memo.run(sql).unwrap()),
            "memo changed results of {}",
            sql
        );
    }
}

#[test]
fn test_nljoin_only_when_hash_disabled() {
    let mut db = Database::with_test_tables();
    db.options.enable_hashjoin = false;
    let plan = db
        .explain("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1")
        .unwrap();
    assert!(plan.contains("NLJoin"));
    assert!(!plan.contains("HashJoin"));
}

#[test]
fn test_explain_shape() {
    let db = Database::with_test_tables();
    let plan = db
        .explain("SELECT a1 FROM a WHERE a1 > 0 ORDER BY a2 DESC LIMIT 2")
        .unwrap();
    // Limit over Order over the filtered scan, with indentation
    let limit_pos = plan.find("Limit").unwrap();
    let order_pos = plan.find("Order").unwrap();
    let scan_pos = plan.find("ScanTable a").unwrap();
    assert!(limit_pos < order_pos && order_pos < scan_pos);
    assert!(plan.contains("filter:"));
}

#[test]
fn test_explain_statement_returns_text_row() {
    let db = Database::with_test_tables();
    let rows = db.run("EXPLAIN SELECT a1 FROM a").unwrap();
    assert_eq!(rows.len(), 1);
    match rows[0].get(0) {
        Some(Datum::Str(text)) => assert!(text.contains("ScanTable")),
        other => panic!("expected text row, got {:?}", other),
    }
}

#[test]
fn test_explain_cost_option() {
    let mut db = Database::with_test_tables();
    db.explain_options.show_cost = true;
    let plan = db.explain("SELECT a1 FROM a").unwrap();
    assert!(plan.contains("(cost="));
}

#[test]
fn test_explain_output_option() {
    let mut db = Database::with_test_tables();
    db.explain_options.show_output = true;
    let plan = db.explain("SELECT a1, a2 FROM a").unwrap();
    assert!(plan.contains("output:"));
}

#[test]
fn test_index_seek_plan_and_results() {
    let mut db = Database::with_test_tables();
    db.options.enable_indexseek = true;
    db.run("CREATE INDEX idx_a1 ON a (a1)").unwrap();

    let plan = db.explain("SELECT a2 FROM a WHERE a1 = 1").unwrap();
    assert!(plan.contains("IndexSeek"), "plan was:\n{}", plan);

    let rows = db.run("SELECT a2 FROM a WHERE a1 = 1").unwrap();
    assert_eq!(rows, vec![ints(&[2])]);
}

#[test]
fn test_index_seek_respects_residual_filter() {
    let mut db = Database::with_test_tables();
    db.options.enable_indexseek = true;
    db.run("CREATE INDEX idx_a1 ON a (a1)").unwrap();
    let rows = db
        .run("SELECT a2 FROM a WHERE a1 = 1 AND a2 > 5")
        .unwrap();
    assert!(rows.is_empty());
}

#[test]
fn test_profiled_run_reports_counters() {
    let db = Database::with_test_tables();
    let (rows, plan) = db.run_profiled("SELECT a1 FROM a WHERE a1 > 0").unwrap();
    assert_eq!(rows.len(), 2);
    assert!(plan.contains("(rows=2, loops=1)"), "plan was:\n{}", plan);
}

#[test]
fn test_profiled_nl_join_counts_loops() {
    let mut db = Database::with_test_tables();
    db.options.enable_hashjoin = false;
    let (rows, plan) = db
        .run_profiled("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1")
        .unwrap();
    assert_eq!(rows.len(), 3);
    // The inner scan is driven once per outer row
    assert!(plan.contains("loops=3"), "plan was:\n{}", plan);
}

#[test]
fn test_semi_join_rewrite_plan_shape() {
    let mut db = Database::with_test_tables();
    db.options.enable_subquery_to_markjoin = true;
    let plan = db
        .explain("SELECT a1 FROM a WHERE a1 IN (SELECT b2 FROM b)")
        .unwrap();
    assert!(plan.contains("(semi)"), "plan was:\n{}", plan);

    let rows = db
        .run("SELECT a1 FROM a WHERE a1 IN (SELECT b2 FROM b)")
        .unwrap();
    assert_eq!(sorted(rows), vec![ints(&[1]), ints(&[2])]);
}

#[test]
fn test_anti_semi_rewrite_for_not_in() {
    let mut db = Database::with_test_tables();
    db.options.enable_subquery_to_markjoin = true;
    let rows = db
        .run("SELECT a1 FROM a WHERE a1 NOT IN (SELECT b2 FROM b)")
        .unwrap();
    assert_eq!(rows, vec![ints(&[0])]);
}

#[test]
fn test_remove_from_flattens_plan() {
    let mut db = Database::with_test_tables();
    db.options.remove_from = true;
    let plan = db
        .explain("SELECT s.x FROM (SELECT a1 AS x FROM a) s WHERE s.x > 0")
        .unwrap();
    assert!(!plan.contains("FromQuery"), "plan was:\n{}", plan);

    // An aggregating subquery must keep its FromQuery barrier
    let plan = db
        .explain("SELECT s.x FROM (SELECT SUM(a1) AS x FROM a) s")
        .unwrap();
    assert!(plan.contains("FromQuery"), "plan was:\n{}", plan);
}

#[test]
fn test_memo_crossjoin_toggle_preserves_results() {
    let mut db = Database::with_test_tables();
    db.options.use_memo = true;
    db.options.memo_disable_crossjoin = true;
    let rows = db
        .run("SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1")
        .unwrap();
    assert_eq!(sorted(rows), vec![ints(&[0]), ints(&[1]), ints(&[2])]);
}
