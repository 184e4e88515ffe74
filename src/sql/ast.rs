//! Internal AST types
//!
//! These types represent parsed SQL statements in a form that's easier
//! to work with than the sqlparser AST. Everything here is unbound:
//! names are strings, types are unknown, subqueries are nested
//! statements.

use chrono::NaiveDate;

use crate::catalog::DataType;

/// Literal value
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    /// date'YYYY-MM-DD'
    Date(NaiveDate),
    /// interval literal, normalized to days (months 30, years 365)
    Interval(i64),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    // Comparison
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical
    And,
    Or,
    // String
    Like,
    NotLike,
}

impl BinOp {
    /// Arithmetic operators produce a numeric result
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
    }

    /// Comparison, logical, and LIKE operators produce a boolean
    pub fn is_boolean(&self) -> bool {
        !self.is_arithmetic()
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "=",
            BinOp::Neq => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Like => "like",
            BinOp::NotLike => "not like",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl std::fmt::Display for AggKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Avg => "avg",
            AggKind::Min => "min",
            AggKind::Max => "max",
        };
        write!(f, "{}", s)
    }
}

/// Expression (before binding)
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference, optionally qualified with a table alias
    Column { table: Option<String>, name: String },
    /// Literal value
    Literal(Literal),
    /// Binary operation
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary minus / NOT
    Unary { neg: bool, expr: Box<Expr> },
    /// Scalar or aggregate function call
    Function { name: String, args: Vec<Expr> },
    /// IN (list)
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// IN (subquery)
    InSubquery {
        expr: Box<Expr>,
        query: Box<SelectStmt>,
        negated: bool,
    },
    /// EXISTS (subquery)
    Exists {
        query: Box<SelectStmt>,
        negated: bool,
    },
    /// Scalar subquery
    ScalarSubquery(Box<SelectStmt>),
    /// CASE [operand] WHEN .. THEN .. [ELSE ..] END
    Case {
        operand: Option<Box<Expr>>,
        whens: Vec<Expr>,
        thens: Vec<Expr>,
        els: Option<Box<Expr>>,
    },
    /// Wildcard (SELECT *), optionally qualified (SELECT t.*)
    Star { table: Option<String> },
}

/// SELECT item: expression with optional alias
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

/// JOIN type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
    /// Keep left rows with at least one match
    Semi,
    /// Keep left rows with no match, null-padded
    AntiSemi,
    /// Left rows plus a boolean match-mark column
    Mark,
    /// Left outer with at most one match allowed
    Single,
}

impl std::fmt::Display for JoinType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
            JoinType::Full => "full",
            JoinType::Cross => "cross",
            JoinType::Semi => "semi",
            JoinType::AntiSemi => "antisemi",
            JoinType::Mark => "mark",
            JoinType::Single => "single",
        };
        write!(f, "{}", s)
    }
}

/// One item in the FROM clause
#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    /// Base table (or CTE reference, disambiguated by the binder)
    Table { name: String, alias: Option<String> },
    /// Derived table: (SELECT ...) alias
    Subquery {
        query: Box<SelectStmt>,
        alias: String,
    },
}

/// JOIN clause attached to the previous FROM item
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub item: FromItem,
    pub join_type: JoinType,
    pub condition: Option<Expr>,
}

/// Common table expression
#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub query: SelectStmt,
}

/// Set operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    Intersect,
    Except,
}

/// SELECT statement
///
/// `setop` chains another SELECT onto this one (UNION etc.); the chain
/// is left-associative.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStmt {
    pub ctes: Vec<Cte>,
    pub selection: Vec<SelectItem>,
    pub from: Vec<FromItem>,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub orders: Vec<Expr>,
    pub descends: Vec<bool>,
    pub limit: Option<Expr>,
    pub distinct: bool,
    pub setop: Option<Box<(SetOpKind, bool, SelectStmt)>>, // (kind, all, rhs)
}

/// SQL statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// CREATE TABLE
    CreateTable {
        name: String,
        columns: Vec<(String, DataType)>,
    },
    /// DROP TABLE
    DropTable { name: String },
    /// CREATE [UNIQUE] INDEX
    CreateIndex {
        name: String,
        table: String,
        column: String,
        unique: bool,
    },
    /// INSERT ... VALUES / INSERT ... SELECT
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        values: Vec<Vec<Expr>>,
        query: Option<Box<SelectStmt>>,
    },
    /// COPY table FROM 'file'
    Copy {
        table: String,
        path: String,
        delimiter: char,
    },
    /// ANALYZE TABLE
    Analyze { table: String },
    /// EXPLAIN SELECT
    Explain(Box<SelectStmt>),
    /// SELECT
    Select(Box<SelectStmt>),
}
