//! A small, dynamically typed model of metadata query results.
//!
//! System tables queried by the control connection only use a handful of
//! CQL types, so rows are represented as column name to [`CqlValue`] maps
//! rather than through a full typed deserialization framework.

use std::collections::HashMap;
use std::net::IpAddr;

use thiserror::Error;
use uuid::Uuid;

/// A CQL value as found in system tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqlValue {
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    Uuid(Uuid),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Elements of a list or a set.
    pub fn as_collection(&self) -> Option<&[CqlValue]> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(CqlValue, CqlValue)]> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// Error returned when a column is missing or holds an unexpected type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ColumnAccessError {
    #[error("Column {0} is not present in the row")]
    Missing(String),
    #[error("Column {column} has unexpected type, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
    },
}

/// One row of a query result. Absent and `null` columns are not stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: HashMap<String, CqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter, handy when assembling rows by hand.
    pub fn with(mut self, column: impl Into<String>, value: CqlValue) -> Self {
        self.columns.insert(column.into(), value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: CqlValue) {
        self.columns.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&CqlValue> {
        self.columns.get(column)
    }

    /// Typed access to a nullable column: `Ok(None)` if the column is null or absent.
    pub fn get_opt<'a, T>(
        &'a self,
        column: &str,
        expected: &'static str,
        convert: impl FnOnce(&'a CqlValue) -> Option<T>,
    ) -> Result<Option<T>, ColumnAccessError> {
        match self.columns.get(column) {
            None => Ok(None),
            Some(value) => convert(value)
                .map(Some)
                .ok_or_else(|| ColumnAccessError::TypeMismatch {
                    column: column.to_owned(),
                    expected,
                }),
        }
    }

    /// Typed access to a required column.
    pub fn get_required<'a, T>(
        &'a self,
        column: &str,
        expected: &'static str,
        convert: impl FnOnce(&'a CqlValue) -> Option<T>,
    ) -> Result<T, ColumnAccessError> {
        self.get_opt(column, expected, convert)?
            .ok_or_else(|| ColumnAccessError::Missing(column.to_owned()))
    }
}

/// Result of a metadata query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows.first()
    }
}

impl FromIterator<Row> for QueryResult {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}
