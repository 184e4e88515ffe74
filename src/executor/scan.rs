//! Scan executors: heap scan, external file scan, index seek
//!
//! Scans of table refs that are targets of outer references publish
//! each raw row into the execution context before filtering, so
//! correlated inner plans observe the driving row.

use std::fs::File;
use std::io::{BufRead, BufReader};

use chrono::NaiveDate;

use crate::catalog::DataType;
use crate::planner::PhysicNode;
use crate::sql::expr::{Expr, TableRefId};

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};
use super::eval::eval;
use super::row::Row;
use super::{project, ExecContext, RowCallback};

/// Heap scan over a base table
#[allow(clippy::too_many_arguments)]
pub(super) fn exec_scan_table(
    node: &PhysicNode,
    table: &str,
    tabref: TableRefId,
    filter: &Option<Expr>,
    publish: bool,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let catalog = ctx.catalog;
    let def = catalog.table(table)?;
    for row in &def.heap {
        emit_scanned(node, row, tabref, filter, publish, ctx, cb)?;
    }
    Ok(())
}

/// Index seek: equality lookup, residual filter applied after
#[allow(clippy::too_many_arguments)]
pub(super) fn exec_index_seek(
    node: &PhysicNode,
    table: &str,
    tabref: TableRefId,
    index: &str,
    key: &Expr,
    filter: &Option<Expr>,
    publish: bool,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let catalog = ctx.catalog;
    let def = catalog.table(table)?;
    let idx = def.indexes.get(index).ok_or_else(|| {
        ExecutorError::Internal(format!("index '{}' vanished from '{}'", index, table))
    })?;
    let key_val = eval(key, ctx, &Row::empty())?;
    let Some(positions) = idx.entries.get(&key_val) else {
        return Ok(());
    };
    for &pos in positions {
        let row = &def.heap[pos];
        emit_scanned(node, row, tabref, filter, publish, ctx, cb)?;
    }
    Ok(())
}

/// External file scan; fields are parsed per column type
#[allow(clippy::too_many_arguments)]
pub(super) fn exec_scan_file(
    node: &PhysicNode,
    path: &str,
    types: &[DataType],
    tabref: TableRefId,
    filter: &Option<Expr>,
    publish: bool,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    let mut pending = Ok(());
    read_csv(path, '|', &mut |fields| {
        if pending.is_err() {
            return;
        }
        pending = (|| {
            let row = parse_row(&fields, types)?;
            emit_scanned(node, &row, tabref, filter, publish, ctx, cb)
        })();
    })?;
    pending
}

fn emit_scanned(
    node: &PhysicNode,
    row: &Row,
    tabref: TableRefId,
    filter: &Option<Expr>,
    publish: bool,
    ctx: &mut ExecContext,
    cb: RowCallback,
) -> ExecutorResult<()> {
    if publish {
        ctx.params.insert(tabref, row.clone());
    }
    if let Some(f) = filter {
        if !eval(f, ctx, row)?.as_bool().unwrap_or(false) {
            return Ok(());
        }
    }
    let out = project(&node.output, ctx, row)?;
    cb(ctx, &out)
}

/// Read a delimited file, invoking the callback with each line's
/// fields
///
/// The format is plain delimiter-separated text with no quoting; a
/// trailing delimiter (TPC-style .tbl files) is tolerated.
pub fn read_csv(
    path: &str,
    delimiter: char,
    each_line: &mut dyn FnMut(Vec<String>),
) -> ExecutorResult<()> {
    let file = File::open(path).map_err(|source| ExecutorError::FileRead {
        path: path.to_string(),
        source,
    })?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| ExecutorError::FileRead {
            path: path.to_string(),
            source,
        })?;
        if line.is_empty() {
            continue;
        }
        let trimmed = line.strip_suffix(delimiter).unwrap_or(&line);
        each_line(trimmed.split(delimiter).map(|s| s.to_string()).collect());
    }
    Ok(())
}

/// Parse one text field as a column type
pub fn parse_field(value: &str, ty: DataType) -> ExecutorResult<Datum> {
    let bad = || ExecutorError::FieldParse {
        value: value.to_string(),
        ty: ty.to_string(),
    };
    match ty {
        DataType::Int => value.trim().parse::<i64>().map(Datum::Int).map_err(|_| bad()),
        DataType::Double => value
            .trim()
            .parse::<f64>()
            .map(Datum::Double)
            .map_err(|_| bad()),
        DataType::Bool => match value.trim() {
            "true" | "t" | "1" => Ok(Datum::Bool(true)),
            "false" | "f" | "0" => Ok(Datum::Bool(false)),
            _ => Err(bad()),
        },
        DataType::Char(_) => Ok(Datum::Str(value.to_string())),
        DataType::DateTime => NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
            .map(Datum::Date)
            .map_err(|_| bad()),
        DataType::TimeSpan => value
            .trim()
            .parse::<i64>()
            .map(Datum::Interval)
            .map_err(|_| bad()),
    }
}

fn parse_row(fields: &[String], types: &[DataType]) -> ExecutorResult<Row> {
    if fields.len() != types.len() {
        return Err(ExecutorError::Internal(format!(
            "line has {} fields, table has {} columns",
            fields.len(),
            types.len()
        )));
    }
    let mut values = Vec::with_capacity(types.len());
    for (f, ty) in fields.iter().zip(types) {
        values.push(parse_field(f, *ty)?);
    }
    Ok(Row::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_field_types() {
        assert_eq!(parse_field("42", DataType::Int).unwrap(), Datum::Int(42));
        assert_eq!(
            parse_field("2.5", DataType::Double).unwrap(),
            Datum::Double(2.5)
        );
        assert_eq!(
            parse_field("abc", DataType::Char(10)).unwrap(),
            Datum::Str("abc".to_string())
        );
        assert!(parse_field("abc", DataType::Int).is_err());
        assert_eq!(
            parse_field("2020-01-05", DataType::DateTime).unwrap(),
            Datum::Date(NaiveDate::from_ymd_opt(2020, 1, 5).unwrap())
        );
    }

    #[test]
    fn test_read_csv_pipe_delimited() {
        let dir = std::env::temp_dir();
        let path = dir.join("opaldb_scan_test.tbl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "1|one|").unwrap();
        writeln!(f, "2|two|").unwrap();
        drop(f);

        let mut lines = Vec::new();
        read_csv(path.to_str().unwrap(), '|', &mut |fields| {
            lines.push(fields);
        })
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], vec!["1".to_string(), "one".to_string()]);
    }

    #[test]
    fn test_read_csv_missing_file() {
        let err = read_csv("/nonexistent/opaldb.tbl", '|', &mut |_| {});
        assert!(matches!(err, Err(ExecutorError::FileRead { .. })));
    }
}
