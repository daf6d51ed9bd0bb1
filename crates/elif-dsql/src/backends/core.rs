//! Core Connection Traits
//!
//! The connection-provider abstraction the adapter runs against. A connection
//! follows JDBC-style autocommit semantics: with autocommit off the first
//! statement implicitly opens a transaction that lasts until `commit` or
//! `rollback`, and switching autocommit back on commits whatever is open.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{DsqlError, DsqlResult};

/// Abstract database connection
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Execute a statement and return the affected row count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DsqlResult<u64>;

    /// Execute a query and return all result rows
    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DsqlResult<Vec<DatabaseRow>>;

    /// Current autocommit flag
    fn autocommit(&self) -> bool;

    /// Change the autocommit flag, committing any open transaction when enabling it
    async fn set_autocommit(&mut self, autocommit: bool) -> DsqlResult<()>;

    /// Commit the open transaction, if any
    async fn commit(&mut self) -> DsqlResult<()>;

    /// Roll back the open transaction, if any
    async fn rollback(&mut self) -> DsqlResult<()>;
}

/// Source of connections for transaction groups
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Acquire a connection, typically a pool checkout
    async fn acquire(&self) -> DsqlResult<Box<dyn DatabaseConnection>>;
}

/// Parameter and column value
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null(SqlType),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

/// Declared type of a NULL parameter, needed so the backend can type the placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bool,
    Int32,
    Int64,
    Text,
    Timestamp,
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(i64::from(*i)),
            DatabaseValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<Option<i32>> for DatabaseValue {
    fn from(value: Option<i32>) -> Self {
        value.map_or(DatabaseValue::Null(SqlType::Int32), DatabaseValue::Int32)
    }
}

impl From<Option<String>> for DatabaseValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(DatabaseValue::Null(SqlType::Text), DatabaseValue::String)
    }
}

impl From<Option<&str>> for DatabaseValue {
    fn from(value: Option<&str>) -> Self {
        value.map(str::to_string).into()
    }
}

/// Result row with positional values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl DatabaseRow {
    pub fn new(columns: Vec<String>, values: Vec<DatabaseValue>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Get a column value by index
    pub fn get_by_index(&self, index: usize) -> DsqlResult<&DatabaseValue> {
        self.values
            .get(index)
            .ok_or_else(|| DsqlError::database(format!("Column index {} out of bounds", index)))
    }

    /// Get a column value by name
    pub fn get_by_name(&self, name: &str) -> DsqlResult<&DatabaseValue> {
        let index = self
            .columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| DsqlError::database(format!("Column '{}' not found", name)))?;
        self.get_by_index(index)
    }

    /// Get a non-null text column
    pub fn get_string(&self, index: usize) -> DsqlResult<String> {
        self.get_optional_string(index)?
            .ok_or_else(|| DsqlError::database(format!("Column {} is NULL", index)))
    }

    pub fn get_optional_string(&self, index: usize) -> DsqlResult<Option<String>> {
        match self.get_by_index(index)? {
            DatabaseValue::Null(_) => Ok(None),
            DatabaseValue::String(s) => Ok(Some(s.clone())),
            other => Err(DsqlError::database(format!(
                "Column {} is not text: {:?}",
                index, other
            ))),
        }
    }

    /// Get a non-null integer column, widened to i64
    pub fn get_i64(&self, index: usize) -> DsqlResult<i64> {
        self.get_optional_i64(index)?
            .ok_or_else(|| DsqlError::database(format!("Column {} is NULL", index)))
    }

    pub fn get_optional_i64(&self, index: usize) -> DsqlResult<Option<i64>> {
        match self.get_by_index(index)? {
            DatabaseValue::Null(_) => Ok(None),
            value => value.as_i64().map(Some).ok_or_else(|| {
                DsqlError::database(format!("Column {} is not an integer: {:?}", index, value))
            }),
        }
    }

    pub fn get_bool(&self, index: usize) -> DsqlResult<bool> {
        let value = self.get_by_index(index)?;
        value
            .as_bool()
            .ok_or_else(|| {
                DsqlError::database(format!("Column {} is not a boolean: {:?}", index, value))
            })
    }

    pub fn get_optional_datetime(&self, index: usize) -> DsqlResult<Option<DateTime<Utc>>> {
        match self.get_by_index(index)? {
            DatabaseValue::Null(_) => Ok(None),
            DatabaseValue::DateTime(dt) => Ok(Some(*dt)),
            other => Err(DsqlError::database(format!(
                "Column {} is not a timestamp: {:?}",
                index, other
            ))),
        }
    }
}

/// Quote an identifier with double quotes, doubling embedded quotes
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Schema-qualified, quoted object name
pub fn qualified_name(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(name))
}

/// Put the autocommit flag back to `original` once `result` is known.
///
/// Runs on every exit path of a scoped autocommit change. When both the
/// operation and the restore fail, the operation's error wins.
pub(crate) async fn restore_autocommit<T>(
    conn: &mut dyn DatabaseConnection,
    original: bool,
    result: DsqlResult<T>,
) -> DsqlResult<T> {
    let restored = conn.set_autocommit(original).await;
    match (result, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(restore_err)) => Err(restore_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(restore_err)) => {
            warn!("Failed to restore autocommit to {}: {}", original, restore_err);
            Err(err)
        }
    }
}
