//! Boolean predicates over row fields.
//!
//! A [`Predicate`] is a small expression tree of comparisons joined by
//! `AND`/`OR`. It has two consumers that must agree exactly:
//!
//! - [`Predicate::compile`] renders the tree as a SQL `WHERE` fragment that the
//!   server uses to filter rows before sending them.
//! - [`Predicate::bind`] resolves column names against a [`TableSchema`] and
//!   yields a [`BoundPredicate`] that the diff applier evaluates locally to
//!   reclassify rows as they change.
//!
//! # Semantics
//!
//! Comparisons follow SQL three-valued logic. A comparison involving `NULL`
//! (or a NaN float) is UNKNOWN, which a `WHERE` clause filters out. Because the
//! grammar has no `NOT`, treating UNKNOWN as `false` at every node gives the
//! same answer as full three-valued evaluation, so local evaluation returns a
//! plain `bool`.
//!
//! Integers and floats compare numerically; every other pairing must have the
//! same type. Mismatches and unknown columns are rejected at bind time.

mod parse;

use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::schema::{ColumnType, Row, TableSchema, Value};

pub use parse::{QueryError, QueryFilter, QueryScope, SubscriptionQuery};

// ---------------------------------------------------------------------------
// CmpOp
// ---------------------------------------------------------------------------

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl CmpOp {
    /// SQL spelling of the operator.
    #[must_use]
    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        }
    }

    /// Returns `true` if `ordering` (left relative to right) satisfies the operator.
    #[must_use]
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::NotEq => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::LtEq => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::GtEq => ordering != Ordering::Less,
        }
    }
}

// ---------------------------------------------------------------------------
// Operand
// ---------------------------------------------------------------------------

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Reference to a column by name.
    Column(String),
    /// Constant value.
    Literal(Value),
}

/// Shorthand for [`Operand::Column`].
#[must_use]
pub fn col(name: impl Into<String>) -> Operand {
    Operand::Column(name.into())
}

/// Shorthand for [`Operand::Literal`].
#[must_use]
pub fn lit(value: impl Into<Value>) -> Operand {
    Operand::Literal(value.into())
}

macro_rules! operand_from_literal {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for Operand {
            fn from(v: $ty) -> Self {
                Operand::Literal(v.into())
            }
        })*
    };
}

operand_from_literal!(Value, bool, i64, i32, u32, f64, &str, String, Vec<u8>);

impl Operand {
    fn compare(self, op: CmpOp, right: impl Into<Operand>) -> Predicate {
        Predicate::Compare {
            left: self,
            op,
            right: right.into(),
        }
    }

    /// `self = right`
    #[must_use]
    pub fn eq(self, right: impl Into<Operand>) -> Predicate {
        self.compare(CmpOp::Eq, right)
    }

    /// `self != right`
    #[must_use]
    pub fn ne(self, right: impl Into<Operand>) -> Predicate {
        self.compare(CmpOp::NotEq, right)
    }

    /// `self < right`
    #[must_use]
    pub fn lt(self, right: impl Into<Operand>) -> Predicate {
        self.compare(CmpOp::Lt, right)
    }

    /// `self <= right`
    #[must_use]
    pub fn le(self, right: impl Into<Operand>) -> Predicate {
        self.compare(CmpOp::LtEq, right)
    }

    /// `self > right`
    #[must_use]
    pub fn gt(self, right: impl Into<Operand>) -> Predicate {
        self.compare(CmpOp::Gt, right)
    }

    /// `self >= right`
    #[must_use]
    pub fn ge(self, right: impl Into<Operand>) -> Predicate {
        self.compare(CmpOp::GtEq, right)
    }
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// Predicate expression tree.
///
/// ```
/// use rowmirror::predicate::col;
///
/// let open_and_large = col("status").eq("open").and(col("amount").gt(100));
/// assert_eq!(
///     open_and_large.compile().unwrap(),
///     r#"("status" = 'open') AND (amount > 100)"#,
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Binary comparison.
    Compare {
        /// Left operand.
        left: Operand,
        /// Operator.
        op: CmpOp,
        /// Right operand.
        right: Operand,
    },
    /// Conjunction.
    And(Box<Predicate>, Box<Predicate>),
    /// Disjunction.
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// `self AND other`
    #[must_use]
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    #[must_use]
    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// Parses a SQL boolean expression (a `WHERE` clause body).
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Parse`] for invalid SQL and
    /// [`QueryError::Unsupported`] for constructs outside the predicate grammar.
    pub fn parse(expr: &str) -> Result<Predicate, QueryError> {
        parse::parse_predicate(expr)
    }

    /// Column names referenced anywhere in the tree, in first-seen order.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        self.visit_columns(&mut |name| {
            if !out.contains(&name) {
                out.push(name);
            }
        });
        out
    }

    fn visit_columns<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Predicate::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Column(name) = operand {
                        f(name);
                    }
                }
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.visit_columns(f);
                b.visit_columns(f);
            }
        }
    }

    /// Renders the predicate as a SQL boolean expression.
    ///
    /// Sub-expressions of `AND`/`OR` are always parenthesized, so the output
    /// does not depend on operator precedence.
    ///
    /// # Errors
    ///
    /// Returns [`PredicateError::Unrepresentable`] for literals with no SQL
    /// spelling (non-finite floats, lists).
    pub fn compile(&self) -> Result<String, PredicateError> {
        let mut out = String::new();
        self.write_sql(&mut out)?;
        Ok(out)
    }

    /// Renders `SELECT * FROM <table> WHERE <predicate>`.
    ///
    /// # Errors
    ///
    /// Same as [`Predicate::compile`].
    pub fn to_query(&self, table: &str) -> Result<String, PredicateError> {
        Ok(format!(
            "SELECT * FROM {} WHERE {}",
            quote_ident(table),
            self.compile()?
        ))
    }

    fn write_sql(&self, out: &mut String) -> Result<(), PredicateError> {
        match self {
            Predicate::Compare { left, op, right } => {
                write_operand(left, out)?;
                out.push(' ');
                out.push_str(op.sql());
                out.push(' ');
                write_operand(right, out)?;
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                let joiner = if matches!(self, Predicate::And(..)) {
                    " AND "
                } else {
                    " OR "
                };
                out.push('(');
                a.write_sql(out)?;
                out.push(')');
                out.push_str(joiner);
                out.push('(');
                b.write_sql(out)?;
                out.push(')');
            }
        }
        Ok(())
    }

    /// Resolves column references against `schema` and type-checks every
    /// comparison.
    ///
    /// # Errors
    ///
    /// - [`PredicateError::UnknownColumn`] if a column is not in the schema.
    /// - [`PredicateError::TypeMismatch`] if two operands cannot be compared.
    pub fn bind(&self, schema: &TableSchema) -> Result<BoundPredicate, PredicateError> {
        Ok(BoundPredicate {
            root: bind_node(self, schema)?,
            source: self.clone(),
        })
    }

    /// Evaluates the predicate against a row of `schema`.
    ///
    /// # Errors
    ///
    /// Returns the bind error if the predicate does not fit the schema.
    pub fn evaluate(&self, schema: &TableSchema, row: &Row) -> Result<bool, PredicateError> {
        Ok(self.bind(schema)?.matches(row))
    }
}

// ---------------------------------------------------------------------------
// SQL rendering helpers
// ---------------------------------------------------------------------------

/// Quotes an identifier unless it is a plain, non-keyword name.
pub(crate) fn quote_ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    let upper = name.to_ascii_uppercase();
    if plain && !sqlparser::keywords::ALL_KEYWORDS.contains(&upper.as_str()) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn write_operand(operand: &Operand, out: &mut String) -> Result<(), PredicateError> {
    match operand {
        Operand::Column(name) => out.push_str(&quote_ident(name)),
        Operand::Literal(value) => write_literal(value, out)?,
    }
    Ok(())
}

fn write_literal(value: &Value, out: &mut String) -> Result<(), PredicateError> {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Bool(true) => out.push_str("TRUE"),
        Value::Bool(false) => out.push_str("FALSE"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) if f.is_finite() => {
            // `{:?}` always keeps a fractional part or exponent, so the
            // literal reads back as a float rather than an integer.
            let _ = write!(out, "{f:?}");
        }
        Value::Float(f) => {
            return Err(PredicateError::Unrepresentable(format!("float {f}")));
        }
        Value::String(s) => {
            out.push('\'');
            out.push_str(&s.replace('\'', "''"));
            out.push('\'');
        }
        Value::Bytes(bytes) => {
            out.push_str("X'");
            for b in bytes {
                let _ = write!(out, "{b:02X}");
            }
            out.push('\'');
        }
        Value::List(_) => {
            return Err(PredicateError::Unrepresentable("list literal".to_string()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// BoundPredicate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum BoundOperand {
    Column(usize),
    Literal(Value),
}

#[derive(Debug, Clone)]
enum BoundNode {
    Compare {
        left: BoundOperand,
        op: CmpOp,
        right: BoundOperand,
    },
    And(Box<BoundNode>, Box<BoundNode>),
    Or(Box<BoundNode>, Box<BoundNode>),
}

/// A predicate whose column references have been resolved to row positions.
///
/// Evaluation is infallible: every type question was settled by
/// [`Predicate::bind`].
#[derive(Debug, Clone)]
pub struct BoundPredicate {
    root: BoundNode,
    source: Predicate,
}

impl BoundPredicate {
    /// Returns `true` if `row` satisfies the predicate.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        eval_node(&self.root, row)
    }

    /// Returns the unbound predicate this was built from.
    #[must_use]
    pub fn predicate(&self) -> &Predicate {
        &self.source
    }
}

/// Evaluates an optional scope: an absent predicate matches every row.
#[must_use]
pub fn scope_matches(scope: Option<&BoundPredicate>, row: &Row) -> bool {
    scope.map_or(true, |p| p.matches(row))
}

fn eval_node(node: &BoundNode, row: &Row) -> bool {
    match node {
        BoundNode::Compare { left, op, right } => {
            let (Some(l), Some(r)) = (resolve(left, row), resolve(right, row)) else {
                debug_assert!(false, "row narrower than bound schema");
                return false;
            };
            l.sql_cmp(r).is_some_and(|ord| op.holds(ord))
        }
        BoundNode::And(a, b) => eval_node(a, row) && eval_node(b, row),
        BoundNode::Or(a, b) => eval_node(a, row) || eval_node(b, row),
    }
}

fn resolve<'a>(operand: &'a BoundOperand, row: &'a Row) -> Option<&'a Value> {
    match operand {
        BoundOperand::Column(i) => row.get(*i),
        BoundOperand::Literal(v) => Some(v),
    }
}

fn bind_node(pred: &Predicate, schema: &TableSchema) -> Result<BoundNode, PredicateError> {
    match pred {
        Predicate::Compare { left, op, right } => {
            let (left, left_ty) = bind_operand(left, schema)?;
            let (right, right_ty) = bind_operand(right, schema)?;
            if let (Some(l), Some(r)) = (left_ty, right_ty) {
                if !l.is_comparable_with(r) {
                    return Err(PredicateError::TypeMismatch {
                        table: schema.name.clone(),
                        left: l,
                        right: r,
                    });
                }
            }
            Ok(BoundNode::Compare {
                left,
                op: *op,
                right,
            })
        }
        Predicate::And(a, b) => Ok(BoundNode::And(
            Box::new(bind_node(a, schema)?),
            Box::new(bind_node(b, schema)?),
        )),
        Predicate::Or(a, b) => Ok(BoundNode::Or(
            Box::new(bind_node(a, schema)?),
            Box::new(bind_node(b, schema)?),
        )),
    }
}

fn bind_operand(
    operand: &Operand,
    schema: &TableSchema,
) -> Result<(BoundOperand, Option<ColumnType>), PredicateError> {
    match operand {
        Operand::Column(name) => {
            let idx = schema
                .column_index(name)
                .ok_or_else(|| PredicateError::UnknownColumn {
                    table: schema.name.clone(),
                    column: name.clone(),
                })?;
            Ok((BoundOperand::Column(idx), Some(schema.columns[idx].ty)))
        }
        Operand::Literal(value) => {
            Ok((BoundOperand::Literal(value.clone()), value.column_type()))
        }
    }
}

// ---------------------------------------------------------------------------
// PredicateError
// ---------------------------------------------------------------------------

/// Predicate binding and compilation errors.
///
/// These indicate a programming error in the caller (a predicate written
/// against the wrong schema), not a runtime condition to retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    /// Column does not exist in the table schema.
    #[error("table {table} has no column {column}")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Operands of a comparison have incompatible types.
    #[error("table {table}: cannot compare {left} with {right}")]
    TypeMismatch {
        /// Table name.
        table: String,
        /// Left operand type.
        left: ColumnType,
        /// Right operand type.
        right: ColumnType,
    },
    /// Literal has no SQL spelling.
    #[error("unrepresentable literal: {0}")]
    Unrepresentable(String),
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableSchema {
        TableSchema::new("orders")
            .column("id", ColumnType::Int)
            .column("status", ColumnType::String)
            .nullable_column("amount", ColumnType::Float)
            .column("limit_amount", ColumnType::Int)
            .primary_key("id")
    }

    fn row(id: i64, status: &str, amount: Option<f64>, limit: i64) -> Row {
        Row::new(vec![id.into(), status.into(), amount.into(), limit.into()])
    }

    #[test]
    fn test_compile_comparison() {
        assert_eq!(col("amount").gt(100).compile().unwrap(), "amount > 100");
        assert_eq!(
            col("status").eq("it's").compile().unwrap(),
            r#""status" = 'it''s'"#
        );
        assert_eq!(col("amount").le(-2.5).compile().unwrap(), "amount <= -2.5");
        assert_eq!(col("flag").ne(true).compile().unwrap(), "flag != TRUE");
        assert_eq!(
            col("payload").eq(vec![0xABu8, 0x01]).compile().unwrap(),
            "payload = X'AB01'"
        );
    }

    #[test]
    fn test_compile_nested() {
        let p = col("a").eq(1).or(col("b").lt(2).and(col("c").ge(3)));
        assert_eq!(
            p.compile().unwrap(),
            "(a = 1) OR ((b < 2) AND (c >= 3))"
        );
    }

    #[test]
    fn test_compile_quotes_keywords_and_odd_names() {
        assert_eq!(quote_ident("select"), "\"select\"");
        assert_eq!(quote_ident("has space"), "\"has space\"");
        assert_eq!(quote_ident("q\"uote"), "\"q\"\"uote\"");
        assert_eq!(quote_ident("amount"), "amount");
    }

    #[test]
    fn test_compile_rejects_non_finite() {
        assert!(matches!(
            col("a").eq(f64::INFINITY).compile(),
            Err(PredicateError::Unrepresentable(_))
        ));
        assert!(col("a")
            .eq(Value::List(vec![]))
            .compile()
            .is_err());
    }

    #[test]
    fn test_to_query() {
        let q = col("amount").gt(100).to_query("orders").unwrap();
        assert_eq!(q, "SELECT * FROM orders WHERE amount > 100");
    }

    #[test]
    fn test_evaluate_basic() {
        let schema = orders();
        let p = col("amount").gt(100);
        assert!(p.evaluate(&schema, &row(1, "open", Some(150.0), 0)).unwrap());
        assert!(!p.evaluate(&schema, &row(1, "open", Some(50.0), 0)).unwrap());
    }

    #[test]
    fn test_evaluate_null_is_unknown() {
        let schema = orders();
        let r = row(1, "open", None, 0);
        assert!(!col("amount").gt(1).evaluate(&schema, &r).unwrap());
        assert!(!col("amount").ne(1).evaluate(&schema, &r).unwrap());
        // UNKNOWN OR TRUE is TRUE.
        let p = col("amount").eq(1).or(col("status").eq("open"));
        assert!(p.evaluate(&schema, &r).unwrap());
    }

    #[test]
    fn test_evaluate_column_vs_column() {
        let schema = orders();
        let p = col("amount").gt(col("limit_amount"));
        assert!(p.evaluate(&schema, &row(1, "x", Some(10.5), 10)).unwrap());
        assert!(!p.evaluate(&schema, &row(1, "x", Some(9.5), 10)).unwrap());
    }

    #[test]
    fn test_bind_unknown_column_fails_loudly() {
        let err = col("missing").eq(1).bind(&orders()).unwrap_err();
        assert_eq!(
            err,
            PredicateError::UnknownColumn {
                table: "orders".into(),
                column: "missing".into()
            }
        );
    }

    #[test]
    fn test_bind_type_mismatch() {
        let err = col("status").gt(5).bind(&orders()).unwrap_err();
        assert!(matches!(err, PredicateError::TypeMismatch { .. }));
        // Int and float are mutually comparable.
        assert!(col("id").lt(2.5).bind(&orders()).is_ok());
    }

    #[test]
    fn test_columns() {
        let p = col("a").eq(1).and(col("b").eq(col("a")));
        assert_eq!(p.columns(), vec!["a", "b"]);
    }

    #[test]
    fn test_scope_matches_absent_predicate() {
        assert!(scope_matches(None, &row(1, "x", None, 0)));
    }
}
