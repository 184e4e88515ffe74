//! Executor integration tests: DDL, DML, bulk loading, and external
//! tables driven through the engine

use std::io::Write;

use opaldb::catalog::{DataType, TableDef};
use opaldb::{Database, Datum, Row};

fn ints(values: &[i64]) -> Row {
    Row::new(values.iter().map(|&v| Datum::Int(v)).collect())
}

fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| a.values().cmp(b.values()));
    rows
}

#[test]
fn test_create_insert_select_roundtrip() {
    let db = Database::new();
    db.run("CREATE TABLE t (x INT, y INT)").unwrap();
    db.run("INSERT INTO t VALUES (1, 10), (2, 20), (3, 30)")
        .unwrap();

    let rows = db.run("SELECT x, y FROM t WHERE x > 1").unwrap();
    assert_eq!(sorted(rows), vec![ints(&[2, 20]), ints(&[3, 30])]);
}

#[test]
fn test_insert_with_column_list() {
    let db = Database::new();
    db.run("CREATE TABLE t (x INT, y INT, z INT)").unwrap();
    db.run("INSERT INTO t (z, x) VALUES (30, 1)").unwrap();

    let rows = db.run("SELECT x, y, z FROM t").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&Datum::Int(1)));
    assert!(rows[0].get(1).unwrap().is_null());
    assert_eq!(rows[0].get(2), Some(&Datum::Int(30)));
}

#[test]
fn test_insert_select() {
    let db = Database::with_test_tables();
    db.run("CREATE TABLE t (x INT, y INT)").unwrap();
    db.run("INSERT INTO t SELECT a1, a2 FROM a WHERE a1 > 0")
        .unwrap();

    let rows = db.run("SELECT x, y FROM t").unwrap();
    assert_eq!(sorted(rows), vec![ints(&[1, 2]), ints(&[2, 3])]);
}

#[test]
fn test_drop_table() {
    let db = Database::new();
    db.run("CREATE TABLE t (x INT)").unwrap();
    db.run("DROP TABLE t").unwrap();
    assert!(db.run("SELECT x FROM t").is_err());
}

#[test]
fn test_unique_index_rejects_duplicates() {
    let db = Database::new();
    db.run("CREATE TABLE t (x INT)").unwrap();
    db.run("INSERT INTO t VALUES (1)").unwrap();
    db.run("CREATE UNIQUE INDEX u ON t (x)").unwrap();

    assert!(db.run("INSERT INTO t VALUES (1)").is_err());
    db.run("INSERT INTO t VALUES (2)").unwrap();
    let rows = db.run("SELECT COUNT(*) FROM t").unwrap();
    assert_eq!(rows, vec![ints(&[2])]);
}

#[test]
fn test_copy_from_file() {
    let path = std::env::temp_dir().join("opaldb_exec_copy.tbl");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "1|alpha|1.5|").unwrap();
    writeln!(f, "2|beta|2.5|").unwrap();
    drop(f);

    let db = Database::new();
    db.run("CREATE TABLE t (id INT, name CHAR(20), score DOUBLE)")
        .unwrap();
    db.run(&format!("COPY t FROM '{}'", path.display())).unwrap();
    std::fs::remove_file(&path).ok();

    let rows = db.run("SELECT id, score FROM t WHERE name = 'beta'").unwrap();
    assert_eq!(
        rows,
        vec![Row::new(vec![Datum::Int(2), Datum::Double(2.5)])]
    );
}

#[test]
fn test_external_table_scan() {
    let path = std::env::temp_dir().join("opaldb_external.tbl");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "1|10|").unwrap();
    writeln!(f, "2|20|").unwrap();
    writeln!(f, "3|30|").unwrap();
    drop(f);

    let db = Database::new();
    {
        let catalog = db.catalog();
        let mut catalog = catalog.write();
        let def = TableDef::new("ext")
            .column("k", DataType::Int)
            .column("v", DataType::Int)
            .source(path.to_str().unwrap());
        catalog.create_table(def).unwrap();
    }

    let rows = db.run("SELECT k, v FROM ext WHERE v > 10").unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(sorted(rows), vec![ints(&[2, 20]), ints(&[3, 30])]);
}

#[test]
fn test_analyze_then_query() {
    let db = Database::with_test_tables();
    db.run("ANALYZE TABLE a").unwrap();
    let rows = db.run("SELECT a1 FROM a WHERE a1 = 1").unwrap();
    assert_eq!(rows, vec![ints(&[1])]);
}

#[test]
fn test_hash_and_nl_join_agree() {
    let queries = [
        "SELECT x.a1, y.b2 FROM a x JOIN b y ON x.a1 = y.b1",
        "SELECT x.a1, y.b1 FROM a x LEFT JOIN b y ON x.a1 = y.b1 AND y.b1 > 0",
        "SELECT x.a1 FROM a x, b y WHERE x.a1 = y.b1 AND x.a2 > 1",
    ];
    let hash_db = Database::with_test_tables();
    let mut nl_db = Database::with_test_tables();
    nl_db.options.enable_hashjoin = false;

    for q in queries {
        assert_eq!(
            sorted(hash_db.run(q).unwrap()),
            sorted(nl_db.run(q).unwrap()),
            "join strategies disagree on {}",
            q
        );
    }
}

#[test]
fn test_right_and_full_outer_joins() {
    let db = Database::new();
    db.run("CREATE TABLE l (x INT)").unwrap();
    db.run("CREATE TABLE r (y INT)").unwrap();
    db.run("INSERT INTO l VALUES (1), (2)").unwrap();
    db.run("INSERT INTO r VALUES (2), (3)").unwrap();

    let rows = db
        .run("SELECT l.x, r.y FROM l RIGHT JOIN r ON l.x = r.y")
        .unwrap();
    let rows = sorted(rows);
    assert_eq!(rows.len(), 2);
    // The unmatched right row carries a null left side
    assert!(rows[0].get(0).unwrap().is_null());
    assert_eq!(rows[0].get(1), Some(&Datum::Int(3)));
    assert_eq!(rows[1], ints(&[2, 2]));

    let rows = db
        .run("SELECT l.x, r.y FROM l FULL JOIN r ON l.x = r.y")
        .unwrap();
    assert_eq!(rows.len(), 3);
}

#[test]
fn test_nested_correlated_subquery() {
    let db = Database::with_test_tables();
    // The inner-inner subquery correlates two levels up
    let rows = db
        .run(
            "SELECT a1 FROM a WHERE EXISTS \
             (SELECT 1 FROM b WHERE b1 = a1 AND EXISTS \
               (SELECT 1 FROM c WHERE c1 = a1))",
        )
        .unwrap();
    assert_eq!(sorted(rows), vec![ints(&[0]), ints(&[1]), ints(&[2])]);
}

#[test]
fn test_subquery_against_derived_table() {
    let db = Database::with_test_tables();
    let rows = db
        .run(
            "SELECT s.x FROM (SELECT a1 AS x FROM a) s \
             WHERE EXISTS (SELECT 1 FROM b WHERE b1 = s.x AND b1 > 0)",
        )
        .unwrap();
    assert_eq!(sorted(rows), vec![ints(&[1]), ints(&[2])]);
}

#[test]
fn test_uncorrelated_subquery_cached_result_is_stable() {
    let db = Database::with_test_tables();
    // The same uncorrelated subquery gates every outer row
    let rows = db
        .run("SELECT a1 FROM a WHERE a1 < (SELECT MAX(b1) FROM b)")
        .unwrap();
    assert_eq!(sorted(rows), vec![ints(&[0]), ints(&[1])]);
}

#[test]
fn test_string_functions_and_like() {
    let db = Database::new();
    db.run("CREATE TABLE s (name CHAR(20))").unwrap();
    db.run("INSERT INTO s VALUES ('alpha'), ('beta'), ('alps')")
        .unwrap();

    let rows = db
        .run("SELECT upper(name) FROM s WHERE name LIKE 'al%'")
        .unwrap();
    let mut names: Vec<String> = rows
        .iter()
        .map(|r| match r.get(0) {
            Some(Datum::Str(s)) => s.clone(),
            other => panic!("expected string, got {:?}", other),
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["ALPHA".to_string(), "ALPS".to_string()]);
}
