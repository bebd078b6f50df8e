//! Predicate and value expressions.
//!
//! Expressions are plain data: query descriptors carry them to storage,
//! and storage engines without a SQL layer evaluate them against rows with
//! [`Expr::evaluate`] / [`Expr::matches`].

use persist_core::{Error, QueryError, QueryErrorKind, Result, Row, Value};
use regex::Regex;
use std::cmp::Ordering;

/// An expression usable in filters and bulk assignments.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference
    Column(String),

    /// Literal value
    Literal(Value),

    /// Binary operation (e.g., a = b, a + b)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// Unary operation (NOT a, -a)
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// IN expression
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// BETWEEN expression (inclusive)
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// LIKE / NOT LIKE pattern with `%` and `_` wildcards
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
    },
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical
    And,
    Or,

    // Arithmetic
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl Expr {
    // ==================== Constructors ====================

    /// Create a column reference expression.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    /// Create a literal value expression.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    // ==================== Comparison Operators ====================

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    // ==================== Logical Operators ====================

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    // ==================== Arithmetic ====================

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn neg(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }

    // ==================== Predicates ====================

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// LIKE pattern (`%` matches any run, `_` a single character).
    pub fn like(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: true,
        }
    }

    /// Set membership (IN list).
    pub fn in_list<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in_list<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
            negated: false,
        }
    }

    // ==================== Inspection ====================

    /// Every column name the expression reads.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column(name) => out.push(name),
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Like { expr, .. } => {
                expr.collect_columns(out);
            }
            Expr::In { expr, values, .. } => {
                expr.collect_columns(out);
                for v in values {
                    v.collect_columns(out);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.collect_columns(out);
                low.collect_columns(out);
                high.collect_columns(out);
            }
        }
    }

    // ==================== Evaluation ====================

    /// Does `row` satisfy this predicate? NULL results count as false.
    #[allow(clippy::result_large_err)]
    pub fn matches(&self, row: &Row) -> Result<bool> {
        Ok(self.evaluate(row)?.as_bool().unwrap_or(false))
    }

    /// Evaluate against a row using SQL three-valued logic.
    #[allow(clippy::result_large_err)]
    pub fn evaluate(&self, row: &Row) -> Result<Value> {
        match self {
            Expr::Column(name) => row.get_by_name(name).cloned().ok_or_else(|| {
                Error::Query(QueryError {
                    kind: QueryErrorKind::NotFound,
                    table: None,
                    message: format!("unknown column '{name}'"),
                })
            }),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Binary { left, op, right } => match op {
                BinaryOp::And => {
                    let l = left.evaluate(row)?.as_bool();
                    if l == Some(false) {
                        return Ok(Value::Bool(false));
                    }
                    let r = right.evaluate(row)?.as_bool();
                    Ok(match (l, r) {
                        (_, Some(false)) => Value::Bool(false),
                        (Some(true), Some(true)) => Value::Bool(true),
                        _ => Value::Null,
                    })
                }
                BinaryOp::Or => {
                    let l = left.evaluate(row)?.as_bool();
                    if l == Some(true) {
                        return Ok(Value::Bool(true));
                    }
                    let r = right.evaluate(row)?.as_bool();
                    Ok(match (l, r) {
                        (_, Some(true)) => Value::Bool(true),
                        (Some(false), Some(false)) => Value::Bool(false),
                        _ => Value::Null,
                    })
                }
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
                    arithmetic(*op, &left.evaluate(row)?, &right.evaluate(row)?)
                }
                cmp => Ok(compare(*cmp, &left.evaluate(row)?, &right.evaluate(row)?)),
            },
            Expr::Unary { op, expr } => {
                let v = expr.evaluate(row)?;
                Ok(match op {
                    UnaryOp::Not => v.as_bool().map_or(Value::Null, |b| Value::Bool(!b)),
                    UnaryOp::Neg => match v {
                        Value::Int(n) => Value::Int(-n),
                        Value::BigInt(n) => Value::BigInt(-n),
                        Value::Double(n) => Value::Double(-n),
                        _ => Value::Null,
                    },
                })
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                let needle = expr.evaluate(row)?;
                if needle.is_null() {
                    return Ok(Value::Null);
                }
                let mut found = false;
                for candidate in values {
                    if needle.same_as(&candidate.evaluate(row)?) {
                        found = true;
                        break;
                    }
                }
                Ok(Value::Bool(found != *negated))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let v = expr.evaluate(row)?;
                let lo = v.compare(&low.evaluate(row)?);
                let hi = v.compare(&high.evaluate(row)?);
                Ok(match (lo, hi) {
                    (Some(lo), Some(hi)) => {
                        let inside = lo != Ordering::Less && hi != Ordering::Greater;
                        Value::Bool(inside != *negated)
                    }
                    _ => Value::Null,
                })
            }
            Expr::IsNull { expr, negated } => {
                Ok(Value::Bool(expr.evaluate(row)?.is_null() != *negated))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let v = expr.evaluate(row)?;
                let Some(text) = v.as_str() else {
                    return Ok(Value::Null);
                };
                Ok(Value::Bool(like_regex(pattern)?.is_match(text) != *negated))
            }
        }
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Value {
    let Some(ord) = left.compare(right) else {
        return Value::Null;
    };
    Value::Bool(match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::Ne => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Le => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::Ge => ord != Ordering::Less,
        _ => return Value::Null,
    })
}

#[allow(clippy::result_large_err)]
fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let out = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            _ => a.checked_mul(*b),
        };
        return out.map(Value::Int).ok_or_else(|| overflow(op));
    }
    if let (Some(a), Some(b)) = (integral(left), integral(right)) {
        let out = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            _ => a.checked_mul(b),
        };
        return out.map(Value::BigInt).ok_or_else(|| overflow(op));
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Double(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            _ => a * b,
        })),
        _ => Err(Error::Query(QueryError {
            kind: QueryErrorKind::Database,
            table: None,
            message: format!(
                "cannot apply '{}' to {} and {}",
                op.as_str(),
                left.type_name(),
                right.type_name()
            ),
        })),
    }
}

fn integral(v: &Value) -> Option<i64> {
    match v {
        Value::Int(_) | Value::BigInt(_) => v.as_i64(),
        _ => None,
    }
}

fn overflow(op: BinaryOp) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        table: None,
        message: format!("integer overflow in '{}'", op.as_str()),
    })
}

/// Translate a LIKE pattern into an anchored regex.
#[allow(clippy::result_large_err)]
fn like_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| {
        Error::Query(QueryError {
            kind: QueryErrorKind::Database,
            table: None,
            message: format!("invalid LIKE pattern '{pattern}': {e}"),
        })
    })
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::Text(s.to_string()))
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Literal(Value::Text(s))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::BigInt(n))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}
