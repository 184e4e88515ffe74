//! SQL parser wrapper around the sqlparser crate
//!
//! Parses with the generic dialect, then lowers the sqlparser AST into
//! the crate's own `ast` types. Only the surface the engine executes is
//! lowered; anything else is reported as unsupported.

use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;

use chrono::NaiveDate;

use crate::catalog::DataType;
use crate::sql::ast::{
    BinOp, Cte, Expr, FromItem, Join, JoinType, Literal, SelectItem, SelectStmt, SetOpKind,
    Statement,
};
use crate::sql::error::{SqlError, SqlResult};

/// SQL parser
pub struct Parser;

impl Parser {
    /// Parse a single SQL statement
    pub fn parse_one(sql: &str) -> SqlResult<Statement> {
        let dialect = GenericDialect {};
        let mut ast = SqlParser::parse_sql(&dialect, sql)?;

        if ast.is_empty() {
            return Err(SqlError::Parse("empty SQL statement".to_string()));
        }
        if ast.len() > 1 {
            return Err(SqlError::Parse(
                "multiple statements not supported".to_string(),
            ));
        }
        lower_statement(ast.remove(0))
    }
}

fn lower_statement(stmt: sp::Statement) -> SqlResult<Statement> {
    match stmt {
        sp::Statement::Query(q) => Ok(Statement::Select(Box::new(lower_query(*q)?))),

        sp::Statement::Explain { statement, .. } => match *statement {
            sp::Statement::Query(q) => Ok(Statement::Explain(Box::new(lower_query(*q)?))),
            other => Err(SqlError::Unsupported(format!("EXPLAIN of '{}'", other))),
        },

        sp::Statement::CreateTable(ct) => {
            let name = object_name(&ct.name);
            let mut columns = Vec::new();
            for col in &ct.columns {
                columns.push((col.name.value.clone(), lower_data_type(&col.data_type)?));
            }
            Ok(Statement::CreateTable { name, columns })
        }

        sp::Statement::Drop {
            object_type: sp::ObjectType::Table,
            names,
            ..
        } => {
            let name = names
                .first()
                .map(object_name)
                .ok_or_else(|| SqlError::Parse("DROP TABLE without a name".to_string()))?;
            Ok(Statement::DropTable { name })
        }

        sp::Statement::CreateIndex(ci) => {
            let name = ci
                .name
                .as_ref()
                .map(object_name)
                .ok_or_else(|| SqlError::Parse("CREATE INDEX requires a name".to_string()))?;
            let table = object_name(&ci.table_name);
            if ci.columns.len() != 1 {
                return Err(SqlError::Unsupported(
                    "multi-column indexes".to_string(),
                ));
            }
            let column = match &ci.columns[0].expr {
                sp::Expr::Identifier(id) => id.value.clone(),
                _ => {
                    return Err(SqlError::Unsupported(
                        "expression indexes".to_string(),
                    ))
                }
            };
            Ok(Statement::CreateIndex {
                name,
                table,
                column,
                unique: ci.unique,
            })
        }

        sp::Statement::Insert(ins) => {
            let table = object_name(&ins.table_name);
            let columns = if ins.columns.is_empty() {
                None
            } else {
                Some(ins.columns.iter().map(|c| c.value.clone()).collect())
            };
            let source = ins
                .source
                .ok_or_else(|| SqlError::Parse("INSERT without a source".to_string()))?;
            match *source.body {
                sp::SetExpr::Values(values) => {
                    let mut rows = Vec::new();
                    for row in values.rows {
                        rows.push(
                            row.into_iter()
                                .map(lower_expr)
                                .collect::<SqlResult<Vec<_>>>()?,
                        );
                    }
                    Ok(Statement::Insert {
                        table,
                        columns,
                        values: rows,
                        query: None,
                    })
                }
                // INSERT ... SELECT: the source's ORDER BY/LIMIT are
                // irrelevant to the inserted set
                body => Ok(Statement::Insert {
                    table,
                    columns,
                    values: Vec::new(),
                    query: Some(Box::new(lower_set_expr(body)?)),
                }),
            }
        }

        sp::Statement::Copy {
            source: sp::CopySource::Table { table_name, .. },
            to: false,
            target: sp::CopyTarget::File { filename },
            options,
            legacy_options,
            ..
        } => {
            let mut delimiter = '|';
            for opt in &options {
                if let sp::CopyOption::Delimiter(c) = opt {
                    delimiter = *c;
                }
            }
            for opt in &legacy_options {
                if let sp::CopyLegacyOption::Delimiter(c) = opt {
                    delimiter = *c;
                }
            }
            Ok(Statement::Copy {
                table: object_name(&table_name),
                path: filename,
                delimiter,
            })
        }

        sp::Statement::Analyze { table_name, .. } => Ok(Statement::Analyze {
            table: object_name(&table_name),
        }),

        other => Err(SqlError::Unsupported(format!("statement '{}'", other))),
    }
}

/// Map a parsed column type onto the engine's type set
fn lower_data_type(dt: &sp::DataType) -> SqlResult<DataType> {
    Ok(match dt {
        sp::DataType::Boolean => DataType::Bool,
        sp::DataType::TinyInt(_)
        | sp::DataType::SmallInt(_)
        | sp::DataType::Int(_)
        | sp::DataType::Integer(_)
        | sp::DataType::BigInt(_) => DataType::Int,
        sp::DataType::Float(_) | sp::DataType::Real | sp::DataType::Double => DataType::Double,
        sp::DataType::Char(len) | sp::DataType::Character(len) | sp::DataType::Varchar(len) => {
            let n = match len {
                Some(sp::CharacterLength::IntegerLength { length, .. }) => *length as u32,
                _ => 255,
            };
            DataType::Char(n)
        }
        sp::DataType::Text => DataType::Char(65535),
        sp::DataType::Date | sp::DataType::Datetime(_) => DataType::DateTime,
        sp::DataType::Interval => DataType::TimeSpan,
        other => return Err(SqlError::Unsupported(format!("data type '{}'", other))),
    })
}

fn lower_query(query: sp::Query) -> SqlResult<SelectStmt> {
    let mut stmt = lower_set_expr(*query.body)?;

    if let Some(with) = query.with {
        if with.recursive {
            return Err(SqlError::Unsupported("recursive CTEs".to_string()));
        }
        for cte in with.cte_tables {
            stmt.ctes.push(Cte {
                name: cte.alias.name.value.clone(),
                query: lower_query(*cte.query)?,
            });
        }
    }

    if let Some(order_by) = query.order_by {
        for item in order_by.exprs {
            stmt.orders.push(lower_expr(item.expr)?);
            stmt.descends.push(!item.asc.unwrap_or(true));
        }
    }

    if let Some(limit) = query.limit {
        stmt.limit = Some(lower_expr(limit)?);
    }

    Ok(stmt)
}

fn lower_set_expr(body: sp::SetExpr) -> SqlResult<SelectStmt> {
    match body {
        sp::SetExpr::Select(select) => lower_select(*select),
        sp::SetExpr::Query(q) => lower_query(*q),
        sp::SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => {
            let kind = match op {
                sp::SetOperator::Union => SetOpKind::Union,
                sp::SetOperator::Intersect => SetOpKind::Intersect,
                sp::SetOperator::Except => SetOpKind::Except,
            };
            let all = matches!(set_quantifier, sp::SetQuantifier::All);
            let mut l = lower_set_expr(*left)?;
            let r = lower_set_expr(*right)?;
            append_setop(&mut l, kind, all, r);
            Ok(l)
        }
        sp::SetExpr::Values(_) => Err(SqlError::Unsupported(
            "VALUES outside INSERT".to_string(),
        )),
        _ => Err(SqlError::Unsupported("query form".to_string())),
    }
}

/// Attach a set-op arm at the end of the left-associative chain
fn append_setop(stmt: &mut SelectStmt, kind: SetOpKind, all: bool, rhs: SelectStmt) {
    match &mut stmt.setop {
        Some(chain) => append_setop(&mut chain.2, kind, all, rhs),
        None => stmt.setop = Some(Box::new((kind, all, rhs))),
    }
}

fn lower_select(select: sp::Select) -> SqlResult<SelectStmt> {
    let mut stmt = SelectStmt::default();

    stmt.distinct = match select.distinct {
        None => false,
        Some(sp::Distinct::Distinct) => true,
        Some(sp::Distinct::On(_)) => {
            return Err(SqlError::Unsupported("DISTINCT ON".to_string()))
        }
    };

    for item in select.projection {
        stmt.selection.push(lower_select_item(item)?);
    }

    for twj in select.from {
        stmt.from.push(lower_table_factor(twj.relation)?);
        for join in twj.joins {
            let (join_type, condition) = lower_join_operator(join.join_operator)?;
            stmt.joins.push(Join {
                item: lower_table_factor(join.relation)?,
                join_type,
                condition,
            });
        }
    }

    stmt.filter = select.selection.map(lower_expr).transpose()?;

    if let sp::GroupByExpr::Expressions(exprs, _) = select.group_by {
        for e in exprs {
            stmt.group_by.push(lower_expr(e)?);
        }
    }

    stmt.having = select.having.map(lower_expr).transpose()?;

    Ok(stmt)
}

fn lower_select_item(item: sp::SelectItem) -> SqlResult<SelectItem> {
    match item {
        sp::SelectItem::UnnamedExpr(e) => Ok(SelectItem {
            expr: lower_expr(e)?,
            alias: None,
        }),
        sp::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem {
            expr: lower_expr(expr)?,
            alias: Some(alias.value),
        }),
        sp::SelectItem::Wildcard(_) => Ok(SelectItem {
            expr: Expr::Star { table: None },
            alias: None,
        }),
        sp::SelectItem::QualifiedWildcard(name, _) => Ok(SelectItem {
            expr: Expr::Star {
                table: Some(object_name(&name)),
            },
            alias: None,
        }),
    }
}

fn lower_table_factor(factor: sp::TableFactor) -> SqlResult<FromItem> {
    match factor {
        sp::TableFactor::Table { name, alias, .. } => Ok(FromItem::Table {
            name: object_name(&name),
            alias: alias.map(|a| a.name.value),
        }),
        sp::TableFactor::Derived {
            subquery, alias, ..
        } => {
            let alias = alias
                .map(|a| a.name.value)
                .ok_or_else(|| SqlError::Parse("derived table requires an alias".to_string()))?;
            Ok(FromItem::Subquery {
                query: Box::new(lower_query(*subquery)?),
                alias,
            })
        }
        other => Err(SqlError::Unsupported(format!("FROM item '{}'", other))),
    }
}

fn lower_join_operator(op: sp::JoinOperator) -> SqlResult<(JoinType, Option<Expr>)> {
    let (ty, constraint) = match op {
        sp::JoinOperator::Inner(c) => (JoinType::Inner, c),
        sp::JoinOperator::LeftOuter(c) => (JoinType::Left, c),
        sp::JoinOperator::RightOuter(c) => (JoinType::Right, c),
        sp::JoinOperator::FullOuter(c) => (JoinType::Full, c),
        sp::JoinOperator::CrossJoin => return Ok((JoinType::Cross, None)),
        _ => return Err(SqlError::Unsupported("join operator".to_string())),
    };
    let condition = match constraint {
        sp::JoinConstraint::On(e) => Some(lower_expr(e)?),
        sp::JoinConstraint::None => None,
        sp::JoinConstraint::Using(_) | sp::JoinConstraint::Natural => {
            return Err(SqlError::Unsupported("USING / NATURAL joins".to_string()))
        }
    };
    Ok((ty, condition))
}

fn lower_expr(expr: sp::Expr) -> SqlResult<Expr> {
    match expr {
        sp::Expr::Identifier(id) => Ok(Expr::Column {
            table: None,
            name: id.value,
        }),
        sp::Expr::CompoundIdentifier(parts) => {
            if parts.len() != 2 {
                return Err(SqlError::Parse(format!(
                    "unsupported identifier depth {}",
                    parts.len()
                )));
            }
            Ok(Expr::Column {
                table: Some(parts[0].value.clone()),
                name: parts[1].value.clone(),
            })
        }
        sp::Expr::Value(v) => Ok(Expr::Literal(lower_value(v)?)),
        sp::Expr::TypedString { data_type, value } => match data_type {
            sp::DataType::Date => {
                let date = NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                    .map_err(|e| SqlError::Parse(format!("bad date literal '{}': {}", value, e)))?;
                Ok(Expr::Literal(Literal::Date(date)))
            }
            other => Err(SqlError::Unsupported(format!(
                "typed string {:?}",
                other
            ))),
        },
        sp::Expr::Interval(interval) => Ok(Expr::Literal(Literal::Interval(lower_interval(
            interval,
        )?))),
        sp::Expr::BinaryOp { left, op, right } => {
            let op = lower_bin_op(op)?;
            Ok(Expr::Binary {
                op,
                left: Box::new(lower_expr(*left)?),
                right: Box::new(lower_expr(*right)?),
            })
        }
        sp::Expr::UnaryOp { op, expr } => match op {
            sp::UnaryOperator::Minus => Ok(Expr::Unary {
                neg: true,
                expr: Box::new(lower_expr(*expr)?),
            }),
            sp::UnaryOperator::Not => Ok(Expr::Unary {
                neg: false,
                expr: Box::new(lower_expr(*expr)?),
            }),
            sp::UnaryOperator::Plus => lower_expr(*expr),
            other => Err(SqlError::Unsupported(format!("unary operator {:?}", other))),
        },
        sp::Expr::Nested(e) => lower_expr(*e),
        sp::Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => Ok(Expr::Binary {
            op: if negated { BinOp::NotLike } else { BinOp::Like },
            left: Box::new(lower_expr(*expr)?),
            right: Box::new(lower_expr(*pattern)?),
        }),
        sp::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            // BETWEEN is sugar for a pair of comparisons
            let e = lower_expr(*expr)?;
            let ge = Expr::Binary {
                op: BinOp::Ge,
                left: Box::new(e.clone()),
                right: Box::new(lower_expr(*low)?),
            };
            let le = Expr::Binary {
                op: BinOp::Le,
                left: Box::new(e),
                right: Box::new(lower_expr(*high)?),
            };
            let both = Expr::Binary {
                op: BinOp::And,
                left: Box::new(ge),
                right: Box::new(le),
            };
            Ok(if negated {
                Expr::Unary {
                    neg: false,
                    expr: Box::new(both),
                }
            } else {
                both
            })
        }
        sp::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Expr::InList {
            expr: Box::new(lower_expr(*expr)?),
            list: list.into_iter().map(lower_expr).collect::<SqlResult<_>>()?,
            negated,
        }),
        sp::Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => Ok(Expr::InSubquery {
            expr: Box::new(lower_expr(*expr)?),
            query: Box::new(lower_query(*subquery)?),
            negated,
        }),
        sp::Expr::Exists { subquery, negated } => Ok(Expr::Exists {
            query: Box::new(lower_query(*subquery)?),
            negated,
        }),
        sp::Expr::Subquery(q) => Ok(Expr::ScalarSubquery(Box::new(lower_query(*q)?))),
        sp::Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => Ok(Expr::Case {
            operand: operand.map(|o| lower_expr(*o).map(Box::new)).transpose()?,
            whens: conditions
                .into_iter()
                .map(lower_expr)
                .collect::<SqlResult<_>>()?,
            thens: results
                .into_iter()
                .map(lower_expr)
                .collect::<SqlResult<_>>()?,
            els: else_result
                .map(|e| lower_expr(*e).map(Box::new))
                .transpose()?,
        }),
        sp::Expr::Function(f) => lower_function(f),
        sp::Expr::Wildcard => Ok(Expr::Star { table: None }),
        other => Err(SqlError::Unsupported(format!("expression '{}'", other))),
    }
}

fn lower_function(f: sp::Function) -> SqlResult<Expr> {
    let name = f
        .name
        .0
        .last()
        .map(|i| i.value.clone())
        .ok_or_else(|| SqlError::Parse("empty function name".to_string()))?;
    let mut args = Vec::new();
    match f.args {
        sp::FunctionArguments::None => {}
        sp::FunctionArguments::List(list) => {
            for arg in list.args {
                match arg {
                    sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e)) => {
                        args.push(lower_expr(e)?)
                    }
                    // COUNT(*) lowers to a zero-argument call
                    sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => {}
                    other => {
                        return Err(SqlError::Unsupported(format!(
                            "function argument '{}'",
                            other
                        )))
                    }
                }
            }
        }
        sp::FunctionArguments::Subquery(_) => {
            return Err(SqlError::Unsupported(
                "subquery function arguments".to_string(),
            ))
        }
    }
    Ok(Expr::Function { name, args })
}

fn lower_value(v: sp::Value) -> SqlResult<Literal> {
    match v {
        sp::Value::Number(s, _) => {
            if let Ok(i) = s.parse::<i64>() {
                Ok(Literal::Int(i))
            } else {
                s.parse::<f64>()
                    .map(Literal::Double)
                    .map_err(|_| SqlError::Parse(format!("bad number '{}'", s)))
            }
        }
        sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => Ok(Literal::Str(s)),
        sp::Value::Boolean(b) => Ok(Literal::Bool(b)),
        sp::Value::Null => Ok(Literal::Null),
        other => Err(SqlError::Unsupported(format!("literal {:?}", other))),
    }
}

/// Normalize an interval literal to days: months are 30 days, years 365
fn lower_interval(interval: sp::Interval) -> SqlResult<i64> {
    let text = match *interval.value {
        sp::Expr::Value(sp::Value::SingleQuotedString(s)) => s,
        sp::Expr::Value(sp::Value::Number(s, _)) => s,
        other => {
            return Err(SqlError::Parse(format!(
                "unsupported interval value '{}'",
                other
            )))
        }
    };

    // Either the unit rides in the literal ('2 years') or as a
    // trailing field (INTERVAL '2' YEAR).
    let mut parts = text.split_whitespace();
    let n: i64 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| SqlError::Parse(format!("bad interval '{}'", text)))?;
    let unit_word = parts.next().map(|s| s.to_lowercase());

    let unit = match (&unit_word, &interval.leading_field) {
        (Some(w), _) => w.clone(),
        (None, Some(field)) => format!("{:?}", field).to_lowercase(),
        (None, None) => "day".to_string(),
    };

    let days = match unit.trim_end_matches('s') {
        "day" => n,
        "week" => n * 7,
        "month" => n * 30,
        "year" => n * 365,
        other => return Err(SqlError::Parse(format!("bad interval unit '{}'", other))),
    };
    Ok(days)
}

fn lower_bin_op(op: sp::BinaryOperator) -> SqlResult<BinOp> {
    Ok(match op {
        sp::BinaryOperator::Plus => BinOp::Add,
        sp::BinaryOperator::Minus => BinOp::Sub,
        sp::BinaryOperator::Multiply => BinOp::Mul,
        sp::BinaryOperator::Divide => BinOp::Div,
        sp::BinaryOperator::Eq => BinOp::Eq,
        sp::BinaryOperator::NotEq => BinOp::Neq,
        sp::BinaryOperator::Lt => BinOp::Lt,
        sp::BinaryOperator::LtEq => BinOp::Le,
        sp::BinaryOperator::Gt => BinOp::Gt,
        sp::BinaryOperator::GtEq => BinOp::Ge,
        sp::BinaryOperator::And => BinOp::And,
        sp::BinaryOperator::Or => BinOp::Or,
        other => {
            return Err(SqlError::Unsupported(format!(
                "binary operator {:?}",
                other
            )))
        }
    })
}

fn object_name(name: &sp::ObjectName) -> String {
    name.0
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}
