//! INSERT and COPY execution
//!
//! VALUES rows are evaluated against an empty row (constants and
//! subquery-free expressions only by this point); COPY streams the
//! external reader's fields through per-column parsing into the heap.

use crate::catalog::Catalog;
use crate::sql::expr::Expr;

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};
use super::eval::eval;
use super::row::Row;
use super::scan::{parse_field, read_csv};
use super::ExecContext;

/// Insert evaluated VALUES rows
///
/// `columns` maps each provided value to a target ordinal; omitted
/// columns are filled with NULL.
pub fn insert_values(
    catalog: &mut Catalog,
    table: &str,
    columns: &Option<Vec<String>>,
    rows: &[Vec<Expr>],
) -> ExecutorResult<u64> {
    let (width, ordinals) = target_ordinals(catalog, table, columns)?;

    let mut inserted = 0u64;
    let mut staged = Vec::with_capacity(rows.len());
    {
        let mut ctx = ExecContext::new(catalog);
        for row in rows {
            if row.len() != ordinals.len() {
                return Err(ExecutorError::Internal(format!(
                    "INSERT supplies {} values for {} columns",
                    row.len(),
                    ordinals.len()
                )));
            }
            let mut values = vec![Datum::Null; width];
            for (expr, &ord) in row.iter().zip(&ordinals) {
                values[ord] = eval(expr, &mut ctx, &Row::empty())?;
            }
            staged.push(Row::new(values));
        }
    }
    for row in staged {
        catalog.table_mut(table)?.append(row)?;
        inserted += 1;
    }
    Ok(inserted)
}

/// Execute an INSERT plan: drive the child plan to completion, then
/// append its rows to the target table
pub fn exec_insert(
    plan: &crate::planner::PhysicNode,
    catalog: &mut Catalog,
    columns: &Option<Vec<String>>,
    subplans: std::collections::HashMap<usize, std::rc::Rc<crate::planner::PhysicNode>>,
) -> ExecutorResult<u64> {
    let table = match &plan.op {
        crate::planner::PhysicOp::Insert { table } => table.clone(),
        other => {
            return Err(ExecutorError::Internal(format!(
                "expected an insert plan, got {:?}",
                std::mem::discriminant(other)
            )))
        }
    };
    let rows = {
        let mut ctx = ExecContext::new(catalog);
        ctx.subplans = subplans;
        crate::executor::Collect::run(&plan.children[0], &mut ctx)?
    };
    insert_rows(catalog, &table, columns, rows)
}

/// Append rows produced by an INSERT ... SELECT
pub fn insert_rows(
    catalog: &mut Catalog,
    table: &str,
    columns: &Option<Vec<String>>,
    rows: Vec<Row>,
) -> ExecutorResult<u64> {
    let (width, ordinals) = target_ordinals(catalog, table, columns)?;
    let mut inserted = 0u64;
    for row in rows {
        if row.len() != ordinals.len() {
            return Err(ExecutorError::Internal(format!(
                "SELECT produces {} columns for {} target columns",
                row.len(),
                ordinals.len()
            )));
        }
        let mut values = vec![Datum::Null; width];
        for (v, &ord) in row.iter().zip(&ordinals) {
            values[ord] = v.clone();
        }
        catalog.table_mut(table)?.append(Row::new(values))?;
        inserted += 1;
    }
    Ok(inserted)
}

/// Bulk-load a delimited file
pub fn copy_from(
    catalog: &mut Catalog,
    table: &str,
    path: &str,
    delimiter: char,
) -> ExecutorResult<u64> {
    let types: Vec<_> = catalog
        .table(table)?
        .columns
        .iter()
        .map(|c| c.data_type)
        .collect();

    let mut staged: Vec<Row> = Vec::new();
    let mut pending: ExecutorResult<()> = Ok(());
    read_csv(path, delimiter, &mut |fields| {
        if pending.is_err() {
            return;
        }
        pending = (|| {
            if fields.len() != types.len() {
                return Err(ExecutorError::Internal(format!(
                    "line has {} fields, table '{}' has {} columns",
                    fields.len(),
                    table,
                    types.len()
                )));
            }
            let mut values = Vec::with_capacity(types.len());
            for (f, ty) in fields.iter().zip(&types) {
                values.push(parse_field(f, *ty)?);
            }
            staged.push(Row::new(values));
            Ok(())
        })();
    })?;
    pending?;

    let loaded = staged.len() as u64;
    for row in staged {
        catalog.table_mut(table)?.append(row)?;
    }
    tracing::debug!(table, rows = loaded, "bulk load finished");
    Ok(loaded)
}

fn target_ordinals(
    catalog: &Catalog,
    table: &str,
    columns: &Option<Vec<String>>,
) -> ExecutorResult<(usize, Vec<usize>)> {
    let def = catalog.table(table)?;
    let width = def.columns.len();
    let ordinals = match columns {
        None => (0..width).collect(),
        Some(names) => {
            let mut ords = Vec::with_capacity(names.len());
            for n in names {
                ords.push(catalog.column(table, n)?.ordinal);
            }
            ords
        }
    };
    Ok((width, ordinals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::Literal;
    use std::io::Write;

    fn lit(i: i64) -> Expr {
        Expr::literal(Literal::Int(i))
    }

    #[test]
    fn test_insert_values_full_row() {
        let mut catalog = Catalog::with_test_tables();
        let n = insert_values(
            &mut catalog,
            "a",
            &None,
            &[vec![lit(7), lit(8), lit(9), lit(10)]],
        )
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(catalog.table("a").unwrap().heap.len(), 4);
    }

    #[test]
    fn test_insert_values_partial_columns_pad_null() {
        let mut catalog = Catalog::with_test_tables();
        insert_values(
            &mut catalog,
            "a",
            &Some(vec!["a3".to_string(), "a1".to_string()]),
            &[vec![lit(30), lit(10)]],
        )
        .unwrap();
        let row = catalog.table("a").unwrap().heap.last().unwrap().clone();
        assert_eq!(row.get(0), Some(&Datum::Int(10)));
        assert!(row.get(1).unwrap().is_null());
        assert_eq!(row.get(2), Some(&Datum::Int(30)));
    }

    #[test]
    fn test_copy_from_parses_fields() {
        let mut catalog = Catalog::with_test_tables();
        let path = std::env::temp_dir().join("opaldb_copy_test.tbl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "10|11|12|13|").unwrap();
        writeln!(f, "20|21|22|23|").unwrap();
        drop(f);

        let n = copy_from(&mut catalog, "a", path.to_str().unwrap(), '|').unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(n, 2);
        let heap = &catalog.table("a").unwrap().heap;
        assert_eq!(heap.len(), 5);
        assert_eq!(heap[4].get(3), Some(&Datum::Int(23)));
    }

    #[test]
    fn test_copy_from_bad_field_aborts() {
        let mut catalog = Catalog::with_test_tables();
        let path = std::env::temp_dir().join("opaldb_copy_bad.tbl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "10|oops|12|13|").unwrap();
        drop(f);

        let err = copy_from(&mut catalog, "a", path.to_str().unwrap(), '|');
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, Err(ExecutorError::FieldParse { .. })));
        // Nothing was appended
        assert_eq!(catalog.table("a").unwrap().heap.len(), 3);
    }
}
