//! Parsing of subscription query strings.
//!
//! The server accepts `SELECT * FROM <table> [WHERE <expr>]` and the special
//! form `SELECT * FROM *`. Queries are parsed with `sqlparser` so that a
//! string subscription recovers the same [`Predicate`] a typed subscription
//! would have built. A `WHERE` clause outside the predicate grammar is kept as
//! [`QueryFilter::Opaque`]: the server still filters by it, but the cache
//! cannot evaluate it locally.

use sqlparser::ast::{
    BinaryOperator, Expr, GroupByExpr, SelectItem, SetExpr, Statement, TableFactor,
    UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::{quote_ident, CmpOp, Operand, Predicate, PredicateError};
use crate::schema::Value;

/// Tables a query reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// A single named table.
    Table(String),
    /// `SELECT * FROM *`: every table the server knows.
    AllTables,
}

/// Row filter of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFilter {
    /// No `WHERE` clause.
    None,
    /// `WHERE` clause expressible as a local predicate.
    Predicate(Predicate),
    /// `WHERE` clause the server understands but the cache cannot evaluate.
    Opaque(String),
}

/// A parsed subscription query.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionQuery {
    sql: String,
    scope: QueryScope,
    filter: QueryFilter,
}

impl SubscriptionQuery {
    /// Parses a query string.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Parse`] if the string is not valid SQL.
    /// - [`QueryError::Unsupported`] if it is not a plain single-table
    ///   `SELECT *`.
    pub fn parse(sql: &str) -> Result<Self, QueryError> {
        if is_all_tables(sql) {
            return Ok(Self::all_tables());
        }

        let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
            .map_err(|e| QueryError::Parse(e.to_string()))?;
        if statements.len() != 1 {
            return Err(QueryError::Unsupported(format!(
                "expected one statement, got {}",
                statements.len()
            )));
        }
        let Some(Statement::Query(query)) = statements.pop() else {
            return Err(QueryError::Unsupported("not a SELECT".to_string()));
        };
        if query.with.is_some()
            || query.order_by.is_some()
            || query.limit.is_some()
            || query.offset.is_some()
            || query.fetch.is_some()
        {
            return Err(QueryError::Unsupported(
                "WITH, ORDER BY, LIMIT and OFFSET are not supported".to_string(),
            ));
        }
        let SetExpr::Select(select) = *query.body else {
            return Err(QueryError::Unsupported("not a simple SELECT".to_string()));
        };

        let grouped = !matches!(&select.group_by, GroupByExpr::Expressions(e, _) if e.is_empty());
        if select.distinct.is_some() || grouped || select.having.is_some() {
            return Err(QueryError::Unsupported(
                "DISTINCT, GROUP BY and HAVING are not supported".to_string(),
            ));
        }
        if !matches!(select.projection.as_slice(), [SelectItem::Wildcard(_)]) {
            return Err(QueryError::Unsupported(
                "projection must be `*`".to_string(),
            ));
        }

        let [from] = select.from.as_slice() else {
            return Err(QueryError::Unsupported(
                "expected exactly one table".to_string(),
            ));
        };
        if !from.joins.is_empty() {
            return Err(QueryError::Unsupported("joins are not supported".to_string()));
        }
        let TableFactor::Table { name, args: None, .. } = &from.relation else {
            return Err(QueryError::Unsupported(
                "FROM must name a table".to_string(),
            ));
        };
        let [ident] = name.0.as_slice() else {
            return Err(QueryError::Unsupported(format!(
                "qualified table name {name}"
            )));
        };

        let filter = match &select.selection {
            None => QueryFilter::None,
            Some(expr) => match lower_expr(expr) {
                Ok(predicate) => QueryFilter::Predicate(predicate),
                Err(reason) => {
                    tracing::debug!(%sql, %reason, "WHERE clause not evaluable locally");
                    QueryFilter::Opaque(expr.to_string())
                }
            },
        };

        Ok(Self {
            sql: sql.to_string(),
            scope: QueryScope::Table(ident.value.clone()),
            filter,
        })
    }

    /// Builds the query for `table`, optionally filtered by `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`PredicateError::Unrepresentable`] if the predicate has a
    /// literal with no SQL spelling.
    pub fn for_table(
        table: impl Into<String>,
        predicate: Option<Predicate>,
    ) -> Result<Self, PredicateError> {
        let table = table.into();
        let (sql, filter) = match predicate {
            Some(p) => (p.to_query(&table)?, QueryFilter::Predicate(p)),
            None => (format!("SELECT * FROM {}", quote_ident(&table)), QueryFilter::None),
        };
        Ok(Self {
            sql,
            scope: QueryScope::Table(table),
            filter,
        })
    }

    /// `SELECT * FROM *`.
    #[must_use]
    pub fn all_tables() -> Self {
        Self {
            sql: "SELECT * FROM *".to_string(),
            scope: QueryScope::AllTables,
            filter: QueryFilter::None,
        }
    }

    /// Query text as sent to the server.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Tables the query reads.
    #[must_use]
    pub fn scope(&self) -> &QueryScope {
        &self.scope
    }

    /// Row filter.
    #[must_use]
    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    /// The locally evaluable predicate, if the query has one.
    ///
    /// `None` means either "every row of the table" or an opaque filter; in
    /// both cases the cache must treat every received row as covered.
    #[must_use]
    pub fn predicate(&self) -> Option<&Predicate> {
        match &self.filter {
            QueryFilter::Predicate(p) => Some(p),
            QueryFilter::None | QueryFilter::Opaque(_) => None,
        }
    }

    /// Name of the single table read, or `None` for `SELECT * FROM *`.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        match &self.scope {
            QueryScope::Table(t) => Some(t),
            QueryScope::AllTables => None,
        }
    }

    /// Returns `true` if the query reads `table`.
    #[must_use]
    pub fn covers(&self, table: &str) -> bool {
        match &self.scope {
            QueryScope::Table(t) => t == table,
            QueryScope::AllTables => true,
        }
    }
}

fn is_all_tables(sql: &str) -> bool {
    let sql = sql.trim().trim_end_matches(';');
    let words: Vec<&str> = sql.split_whitespace().collect();
    matches!(
        words.as_slice(),
        [select, "*", from, "*"]
            if select.eq_ignore_ascii_case("select") && from.eq_ignore_ascii_case("from")
    )
}

/// Parses a bare boolean expression into a [`Predicate`].
pub(super) fn parse_predicate(expr: &str) -> Result<Predicate, QueryError> {
    let parsed = Parser::new(&GenericDialect {})
        .try_with_sql(expr)
        .and_then(|mut p| p.parse_expr())
        .map_err(|e| QueryError::Parse(e.to_string()))?;
    lower_expr(&parsed).map_err(QueryError::Unsupported)
}

// ---------------------------------------------------------------------------
// AST lowering
// ---------------------------------------------------------------------------

fn lower_expr(expr: &Expr) -> Result<Predicate, String> {
    match expr {
        Expr::Nested(inner) => lower_expr(inner),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                BinaryOperator::And => {
                    return Ok(lower_expr(left)?.and(lower_expr(right)?));
                }
                BinaryOperator::Or => {
                    return Ok(lower_expr(left)?.or(lower_expr(right)?));
                }
                BinaryOperator::Eq => CmpOp::Eq,
                BinaryOperator::NotEq => CmpOp::NotEq,
                BinaryOperator::Lt => CmpOp::Lt,
                BinaryOperator::LtEq => CmpOp::LtEq,
                BinaryOperator::Gt => CmpOp::Gt,
                BinaryOperator::GtEq => CmpOp::GtEq,
                other => return Err(format!("operator {other}")),
            };
            Ok(Predicate::Compare {
                left: lower_operand(left)?,
                op: cmp,
                right: lower_operand(right)?,
            })
        }
        other => Err(format!("expression {other}")),
    }
}

fn lower_operand(expr: &Expr) -> Result<Operand, String> {
    match expr {
        Expr::Nested(inner) => lower_operand(inner),
        Expr::Identifier(ident) => Ok(Operand::Column(ident.value.clone())),
        // `orders.amount`: the table qualifier is implied by the FROM clause.
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| Operand::Column(ident.value.clone()))
            .ok_or_else(|| "empty identifier".to_string()),
        Expr::Value(value) => lower_literal(value, false).map(Operand::Literal),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(value @ SqlValue::Number(..)) => {
                lower_literal(value, true).map(Operand::Literal)
            }
            other => Err(format!("negation of {other}")),
        },
        other => Err(format!("operand {other}")),
    }
}

fn lower_literal(value: &SqlValue, negate: bool) -> Result<Value, String> {
    match value {
        SqlValue::Number(digits, _) => {
            let text = if negate {
                format!("-{digits}")
            } else {
                digits.clone()
            };
            if let Ok(i) = text.parse::<i64>() {
                Ok(Value::Int(i))
            } else {
                text.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| format!("number {text}"))
            }
        }
        SqlValue::SingleQuotedString(s) => Ok(Value::String(s.clone())),
        SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
        SqlValue::Null => Ok(Value::Null),
        SqlValue::HexStringLiteral(hex) => decode_hex(hex).map(Value::Bytes),
        other => Err(format!("literal {other}")),
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err(format!("odd-length hex literal {hex}"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex literal {hex}"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// QueryError
// ---------------------------------------------------------------------------

/// Subscription query parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The string is not valid SQL.
    #[error("invalid query: {0}")]
    Parse(String),
    /// Valid SQL outside the subscription grammar.
    #[error("unsupported query: {0}")]
    Unsupported(String),
}

// ===========================================================================
// Tests
// ===========================================================================
