//! Datum type - runtime values in the executor

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;

use crate::catalog::DataType;
use crate::sql::ast::Literal;

/// A single value in a row
#[derive(Debug, Clone, Default)]
pub enum Datum {
    /// NULL value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Double(f64),
    /// String value
    Str(String),
    /// Calendar date
    Date(NaiveDate),
    /// Duration in days
    Interval(i64),
}

impl Datum {
    /// Check if this datum is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Numeric tag for ordering across types
    fn type_tag(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) => 2,
            Datum::Double(_) => 3,
            Datum::Str(_) => 4,
            Datum::Date(_) => 5,
            Datum::Interval(_) => 6,
        }
    }

    /// Get the data type of this datum
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Bool(_) => Some(DataType::Bool),
            Datum::Int(_) => Some(DataType::Int),
            Datum::Double(_) => Some(DataType::Double),
            Datum::Str(s) => Some(DataType::Char(s.len() as u32)),
            Datum::Date(_) => Some(DataType::DateTime),
            Datum::Interval(_) => Some(DataType::TimeSpan),
        }
    }

    /// Convert to boolean, None if NULL or not convertible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Bool(b) => Some(*b),
            Datum::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Convert to i64, None if NULL or not convertible
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Datum::Int(i) => Some(*i),
            Datum::Double(f) => Some(*f as i64),
            Datum::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Convert to f64, None if NULL or not convertible
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Datum::Double(f) => Some(*f),
            Datum::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Convert to string reference, None if not a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Create a Datum from a parsed literal
    pub fn from_literal(lit: &Literal) -> Self {
        match lit {
            Literal::Null => Datum::Null,
            Literal::Bool(b) => Datum::Bool(*b),
            Literal::Int(i) => Datum::Int(*i),
            Literal::Double(f) => Datum::Double(*f),
            Literal::Str(s) => Datum::Str(s.clone()),
            Literal::Date(d) => Datum::Date(*d),
            Literal::Interval(days) => Datum::Interval(*days),
        }
    }

    /// Negate this datum (unary minus)
    pub fn negate(&self) -> Option<Datum> {
        match self {
            Datum::Int(i) => Some(Datum::Int(-i)),
            Datum::Double(f) => Some(Datum::Double(-f)),
            Datum::Interval(d) => Some(Datum::Interval(-d)),
            Datum::Null => Some(Datum::Null),
            _ => None,
        }
    }

    /// Logical NOT
    pub fn not(&self) -> Option<Datum> {
        match self {
            Datum::Bool(b) => Some(Datum::Bool(!b)),
            Datum::Null => Some(Datum::Null),
            _ => None,
        }
    }

    /// SQL LIKE pattern matching
    pub fn like(&self, pattern: &Datum) -> Option<Datum> {
        match (self, pattern) {
            (Datum::Str(s), Datum::Str(p)) => Some(Datum::Bool(like_match(s, p))),
            (Datum::Null, _) | (_, Datum::Null) => Some(Datum::Null),
            _ => None,
        }
    }
}

/// SQL LIKE matching without regex
/// % matches any sequence of characters
/// _ matches any single character
fn like_match(s: &str, pattern: &str) -> bool {
    let s_chars: Vec<char> = s.chars().collect();
    let p_chars: Vec<char> = pattern.chars().collect();
    like_match_impl(&s_chars, &p_chars)
}

fn like_match_impl(s: &[char], p: &[char]) -> bool {
    if p.is_empty() {
        return s.is_empty();
    }

    match p[0] {
        '%' => {
            for i in 0..=s.len() {
                if like_match_impl(&s[i..], &p[1..]) {
                    return true;
                }
            }
            false
        }
        '_' => !s.is_empty() && like_match_impl(&s[1..], &p[1..]),
        c => !s.is_empty() && s[0] == c && like_match_impl(&s[1..], &p[1..]),
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Bool(a), Datum::Bool(b)) => a == b,
            (Datum::Int(a), Datum::Int(b)) => a == b,
            (Datum::Double(a), Datum::Double(b)) => a.to_bits() == b.to_bits(),
            (Datum::Str(a), Datum::Str(b)) => a == b,
            (Datum::Date(a), Datum::Date(b)) => a == b,
            (Datum::Interval(a), Datum::Interval(b)) => a == b,
            // Cross-type numeric comparisons
            (Datum::Int(a), Datum::Double(b)) | (Datum::Double(b), Datum::Int(a)) => {
                (*a as f64).to_bits() == b.to_bits()
            }
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            // NULLs sort first
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,

            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Double(a), Datum::Double(b)) => a.total_cmp(b),
            (Datum::Str(a), Datum::Str(b)) => a.cmp(b),
            (Datum::Date(a), Datum::Date(b)) => a.cmp(b),
            (Datum::Interval(a), Datum::Interval(b)) => a.cmp(b),

            (Datum::Int(a), Datum::Double(b)) => (*a as f64).total_cmp(b),
            (Datum::Double(a), Datum::Int(b)) => a.total_cmp(&(*b as f64)),

            _ => self.type_tag().cmp(&other.type_tag()),
        }
    }
}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Datum::Null => 0u8.hash(state),
            Datum::Bool(b) => b.hash(state),
            // Int and Double hash alike so cross-type equality holds
            Datum::Int(i) => (*i as f64).to_bits().hash(state),
            Datum::Double(f) => f.to_bits().hash(state),
            Datum::Str(s) => s.hash(state),
            Datum::Date(d) => d.hash(state),
            Datum::Interval(d) => d.hash(state),
        }
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "null"),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Int(i) => write!(f, "{}", i),
            Datum::Double(d) => write!(f, "{}", d),
            Datum::Str(s) => write!(f, "{}", s),
            Datum::Date(d) => write!(f, "{}", d),
            Datum::Interval(d) => write!(f, "{} days", d),
        }
    }
}
