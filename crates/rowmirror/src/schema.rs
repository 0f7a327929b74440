//! Declared row schemas and row values.
//!
//! Every mirrored table has a [`TableSchema`] fixed when the cache is built.
//! Rows are positional: a [`Row`] holds one [`Value`] per column, in schema
//! order. Row payloads live behind an `Arc` so one diff can fan out to many
//! observers without copying.
//!
//! # Row identity
//!
//! Tables that declare a primary key are keyed by that column's value.
//! Tables without one are keyed by the whole row (structural equality).
//! Both cases are expressed by [`RowKey`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ColumnType
// ---------------------------------------------------------------------------

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit floating point.
    Float,
    /// UTF-8 string.
    String,
    /// Opaque byte string.
    Bytes,
    /// Ordered list of values (composite).
    List,
}

impl ColumnType {
    /// Returns the lowercase type name used in error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
        }
    }

    /// Returns `true` for `Int` and `Float`.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }

    /// Returns `true` if values of `self` and `other` can be ordered against
    /// each other by a predicate comparison.
    ///
    /// Numeric types compare across `Int`/`Float`. Lists are never comparable.
    #[must_use]
    pub fn is_comparable_with(self, other: Self) -> bool {
        if self == Self::List || other == Self::List {
            return false;
        }
        self == other || (self.is_numeric() && other.is_numeric())
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single field value.
///
/// Equality and hashing are structural. Floats compare by bit pattern so that
/// a `Value` can be used as a map key; predicate comparisons go through
/// [`Value::sql_cmp`] instead, which follows SQL semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
}

impl Value {
    /// Returns the column type this value inhabits, or `None` for `Null`.
    #[must_use]
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(ColumnType::Bool),
            Self::Int(_) => Some(ColumnType::Int),
            Self::Float(_) => Some(ColumnType::Float),
            Self::String(_) => Some(ColumnType::String),
            Self::Bytes(_) => Some(ColumnType::Bytes),
            Self::List(_) => Some(ColumnType::List),
        }
    }

    /// Returns `true` if this is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// SQL-style comparison.
    ///
    /// Returns `None` when the comparison is UNKNOWN: either side is `NULL`,
    /// a float is NaN, or the types are not comparable. Integers and floats
    /// compare by exact numeric value.
    #[must_use]
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Float(b)) => cmp_int_float(*a, *b),
            (Self::Float(a), Self::Int(b)) => cmp_int_float(*b, *a).map(Ordering::reverse),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::String(_) => 4,
            Self::Bytes(_) => 5,
            Self::List(_) => 6,
        }
    }
}

/// Orders an integer against a float without rounding the integer.
#[allow(clippy::cast_possible_truncation)]
fn cmp_int_float(int: i64, float: f64) -> Option<Ordering> {
    // 2^63, exactly representable.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if float.is_nan() {
        return None;
    }
    if float >= LIMIT {
        return Some(Ordering::Less);
    }
    if float < -LIMIT {
        return Some(Ordering::Greater);
    }
    let whole = float.trunc();
    match int.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(float - whole)),
        ord => Some(ord),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::String(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::List(l) => l.hash(state),
        }
    }
}

/// Total order used for deterministic row ordering in views.
///
/// Values of different variants order by variant; floats use `total_cmp`.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::String(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Row / RowKey
// ---------------------------------------------------------------------------

/// One record of a table, positional in schema column order.
///
/// Cloning a `Row` is a reference-count bump.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Row(Arc<[Value]>);

impl Row {
    /// Creates a row from its column values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.into())
    }

    /// Returns the column values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Returns the value at a column index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

impl<V: Into<Value>> FromIterator<V> for Row {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

/// Identity of a row inside a table mirror.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    /// Value of the declared primary key column.
    Primary(Value),
    /// Whole-row identity for tables without a primary key.
    Row(Row),
}

// ---------------------------------------------------------------------------
// ColumnDef / TableSchema
// ---------------------------------------------------------------------------

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Whether `NULL` is allowed.
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDef {
    /// Creates a non-nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }

    /// Marks the column nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Declared schema of one table: column names, types and optional primary key.
///
/// Shared between the predicate evaluator (for binding column references) and
/// the table mirror (for keying and validating rows).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in row order.
    pub columns: Vec<ColumnDef>,
    /// Name of the primary key column, if the table declares one.
    #[serde(default)]
    pub primary_key: Option<String>,
}

impl TableSchema {
    /// Creates a schema with no columns.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
        }
    }

    /// Appends a non-nullable column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef::new(name, ty));
        self
    }

    /// Appends a nullable column.
    #[must_use]
    pub fn nullable_column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef::new(name, ty).nullable());
        self
    }

    /// Declares the primary key column.
    #[must_use]
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = Some(name.into());
        self
    }

    /// Checks internal consistency: unique column names and an existing,
    /// non-nullable primary key column.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DuplicateColumn`] or
    /// [`SchemaError::UnknownPrimaryKey`].
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (i, col) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == col.name) {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.clone(),
                    column: col.name.clone(),
                });
            }
        }
        if let Some(pk) = &self.primary_key {
            match self.columns.iter().find(|c| &c.name == pk) {
                Some(col) if !col.nullable && col.ty != ColumnType::List => {}
                _ => {
                    return Err(SchemaError::UnknownPrimaryKey {
                        table: self.name.clone(),
                        column: pk.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Returns the index of a column by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Returns a column definition by name.
    #[must_use]
    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the primary key column index, if any.
    #[must_use]
    pub fn primary_key_index(&self) -> Option<usize> {
        self.primary_key
            .as_deref()
            .and_then(|pk| self.column_index(pk))
    }

    /// Computes the identity of a row in this table.
    #[must_use]
    pub fn row_key(&self, row: &Row) -> RowKey {
        match self.primary_key_index().and_then(|i| row.get(i)) {
            Some(value) => RowKey::Primary(value.clone()),
            None => RowKey::Row(row.clone()),
        }
    }

    /// Validates a row's arity, types and nullability.
    ///
    /// # Errors
    ///
    /// Returns the first [`SchemaError`] found.
    pub fn check_row(&self, row: &Row) -> Result<(), SchemaError> {
        if row.len() != self.columns.len() {
            return Err(SchemaError::Arity {
                table: self.name.clone(),
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        for (col, value) in self.columns.iter().zip(row.values()) {
            match value.column_type() {
                None if col.nullable => {}
                None => {
                    return Err(SchemaError::UnexpectedNull {
                        table: self.name.clone(),
                        column: col.name.clone(),
                    })
                }
                Some(ty) if ty == col.ty => {}
                Some(ty) => {
                    return Err(SchemaError::TypeMismatch {
                        table: self.name.clone(),
                        column: col.name.clone(),
                        expected: col.ty,
                        actual: ty,
                    })
                }
            }
        }
        Ok(())
    }

    /// Builds a row and validates it against this schema.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if the values do not fit the schema.
    pub fn row(&self, values: Vec<Value>) -> Result<Row, SchemaError> {
        let row = Row::new(values);
        self.check_row(&row)?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// SchemaError
// ---------------------------------------------------------------------------

/// Schema declaration and row validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Two columns share a name.
    #[error("table {table}: duplicate column {column}")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// The primary key names a missing, nullable or list column.
    #[error("table {table}: invalid primary key column {column}")]
    UnknownPrimaryKey {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Two schemas were declared for the same table.
    #[error("table {0} declared twice")]
    DuplicateTable(String),
    /// Row has the wrong number of columns.
    #[error("table {table}: row has {actual} columns, expected {expected}")]
    Arity {
        /// Table name.
        table: String,
        /// Declared column count.
        expected: usize,
        /// Received column count.
        actual: usize,
    },
    /// A value does not have the declared column type.
    #[error("table {table}: column {column} is {expected}, got {actual}")]
    TypeMismatch {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Declared type.
        expected: ColumnType,
        /// Received type.
        actual: ColumnType,
    },
    /// `NULL` in a non-nullable column.
    #[error("table {table}: column {column} is not nullable")]
    UnexpectedNull {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
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
            .primary_key("id")
    }

    #[test]
    fn test_schema_validate_ok() {
        assert!(orders().validate().is_ok());
    }

    #[test]
    fn test_schema_duplicate_column() {
        let schema = TableSchema::new("t")
            .column("a", ColumnType::Int)
            .column("a", ColumnType::String);
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_schema_bad_primary_key() {
        let missing = TableSchema::new("t")
            .column("a", ColumnType::Int)
            .primary_key("b");
        assert!(matches!(
            missing.validate(),
            Err(SchemaError::UnknownPrimaryKey { .. })
        ));

        let nullable = TableSchema::new("t")
            .nullable_column("a", ColumnType::Int)
            .primary_key("a");
        assert!(nullable.validate().is_err());
    }

    #[test]
    fn test_check_row() {
        let schema = orders();
        assert!(schema
            .row(vec![1.into(), "open".into(), Value::Null])
            .is_ok());
        assert!(matches!(
            schema.row(vec![1.into(), "open".into()]),
            Err(SchemaError::Arity {
                expected: 3,
                actual: 2,
                ..
            })
        ));
        assert!(matches!(
            schema.row(vec!["x".into(), "open".into(), Value::Null]),
            Err(SchemaError::TypeMismatch {
                expected: ColumnType::Int,
                actual: ColumnType::String,
                ..
            })
        ));
        assert!(matches!(
            schema.row(vec![Value::Null, "open".into(), Value::Null]),
            Err(SchemaError::UnexpectedNull { .. })
        ));
    }

    #[test]
    fn test_row_key_primary_and_structural() {
        let schema = orders();
        let row = Row::new(vec![7.into(), "open".into(), 1.5.into()]);
        assert_eq!(schema.row_key(&row), RowKey::Primary(Value::Int(7)));

        let keyless = TableSchema::new("log").column("msg", ColumnType::String);
        let row = Row::new(vec!["hi".into()]);
        assert_eq!(keyless.row_key(&row), RowKey::Row(row.clone()));
    }

    #[test]
    fn test_sql_cmp() {
        assert_eq!(Value::Int(1).sql_cmp(&Value::Float(1.5)), Some(Ordering::Less));
        assert_eq!(
            Value::String("b".into()).sql_cmp(&Value::String("a".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Null.sql_cmp(&Value::Null), None);
        assert_eq!(Value::Int(1).sql_cmp(&Value::String("1".into())), None);
        assert_eq!(Value::Float(f64::NAN).sql_cmp(&Value::Float(1.0)), None);
    }

    #[test]
    fn test_int_float_cmp_is_exact() {
        // 2^53 + 1 rounds to 2^53 as a float.
        let big = Value::Int(9_007_199_254_740_993);
        let near = Value::Float(9_007_199_254_740_992.0);
        assert_eq!(big.sql_cmp(&near), Some(Ordering::Greater));
        assert_eq!(near.sql_cmp(&big), Some(Ordering::Less));

        assert_eq!(Value::Int(3).sql_cmp(&Value::Float(3.0)), Some(Ordering::Equal));
        assert_eq!(Value::Int(-3).sql_cmp(&Value::Float(-2.5)), Some(Ordering::Less));
        assert_eq!(Value::Int(-2).sql_cmp(&Value::Float(-2.5)), Some(Ordering::Greater));
        assert_eq!(
            Value::Int(i64::MAX).sql_cmp(&Value::Float(9_223_372_036_854_775_808.0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Int(i64::MIN).sql_cmp(&Value::Float(f64::NEG_INFINITY)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Int(0).sql_cmp(&Value::Float(f64::NAN)), None);
    }

    #[test]
    fn test_value_structural_eq() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert!(Value::Null < Value::Bool(false));
    }

    #[test]
    fn test_schema_from_json() {
        let json = r#"{
            "name": "orders",
            "columns": [
                {"name": "id", "type": "int"},
                {"name": "status", "type": "string"},
                {"name": "amount", "type": "float", "nullable": true}
            ],
            "primary_key": "id"
        }"#;
        let schema: TableSchema = serde_json::from_str(json).unwrap();
        assert_eq!(schema, orders());
    }
}
