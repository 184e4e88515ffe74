//! DDL and maintenance statements
//!
//! CREATE/DROP TABLE, CREATE INDEX, and ANALYZE run directly against
//! the catalog; none of them go through the planner.

use crate::catalog::{Catalog, DataType, TableDef};

use super::error::{ExecutorError, ExecutorResult};

pub fn create_table(
    catalog: &mut Catalog,
    name: &str,
    columns: &[(String, DataType)],
) -> ExecutorResult<()> {
    let mut def = TableDef::new(name);
    for (col, ty) in columns {
        def = def.column(col.clone(), *ty);
    }
    catalog.create_table(def)?;
    tracing::debug!(table = name, "created table");
    Ok(())
}

pub fn drop_table(catalog: &mut Catalog, name: &str) -> ExecutorResult<()> {
    catalog.drop_table(name)?;
    tracing::debug!(table = name, "dropped table");
    Ok(())
}

pub fn create_index(
    catalog: &mut Catalog,
    name: &str,
    table: &str,
    column: &str,
    unique: bool,
) -> ExecutorResult<()> {
    let ordinal = catalog.column(table, column)?.ordinal;
    catalog.table_mut(table)?.build_index(name, ordinal, unique)?;
    tracing::debug!(index = name, table, column, unique, "created index");
    Ok(())
}

/// ANALYZE records the heap row count; scan costing reads it
pub fn analyze(catalog: &mut Catalog, table: &str) -> ExecutorResult<()> {
    let def = catalog.table_mut(table)?;
    if def.source.is_some() {
        return Err(ExecutorError::Internal(
            "ANALYZE of external tables is not supported".to_string(),
        ));
    }
    def.row_count = Some(def.heap.len());
    tracing::debug!(table, rows = def.heap.len(), "analyzed table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Datum, Row};

    #[test]
    fn test_create_and_drop_table() {
        let mut catalog = Catalog::new();
        create_table(
            &mut catalog,
            "t",
            &[("x".to_string(), DataType::Int), ("y".to_string(), DataType::Char(10))],
        )
        .unwrap();
        assert_eq!(catalog.table("t").unwrap().columns.len(), 2);

        drop_table(&mut catalog, "t").unwrap();
        assert!(catalog.try_table("t").is_none());
    }

    #[test]
    fn test_create_index_resolves_column() {
        let mut catalog = Catalog::with_test_tables();
        create_index(&mut catalog, "idx", "a", "a2", false).unwrap();
        assert!(catalog.table("a").unwrap().index_on(1).is_some());

        assert!(create_index(&mut catalog, "idx2", "a", "nosuch", false).is_err());
    }

    #[test]
    fn test_analyze_records_row_count() {
        let mut catalog = Catalog::with_test_tables();
        analyze(&mut catalog, "a").unwrap();
        assert_eq!(catalog.table("a").unwrap().row_count, Some(3));

        catalog
            .table_mut("a")
            .unwrap()
            .append(Row::new(vec![
                Datum::Int(9),
                Datum::Int(9),
                Datum::Int(9),
                Datum::Int(9),
            ]))
            .unwrap();
        analyze(&mut catalog, "a").unwrap();
        assert_eq!(catalog.table("a").unwrap().row_count, Some(4));
    }
}
