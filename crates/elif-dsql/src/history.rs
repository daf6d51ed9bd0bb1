//! Coordination store adapter for the migration history table
//!
//! Generates the history table DDL and insert, and runs the bookkeeping
//! queries the engine needs. Aurora DSQL has no advisory or predicate locks:
//! the lock hook is a pass-through, and two writers racing for the same
//! `installed_rank` are separated by the backend's commit-time conflict check
//! on the primary key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use tracing::{debug, info};

use crate::backends::{
    qualified_name, quote_identifier, ConnectionProvider, DatabaseRow, DatabaseValue,
};
use crate::error::{DsqlError, DsqlResult};
use crate::executor::run_in_transaction;
use crate::statement::{MigrationUnit, Statement};

/// Columns written by the insert, in bind order
pub const INSERT_COLUMNS: [&str; 9] = [
    "installed_rank",
    "version",
    "description",
    "type",
    "script",
    "checksum",
    "installed_by",
    "execution_time",
    "success",
];

/// All columns, in table order
pub const HISTORY_COLUMNS: [&str; 10] = [
    "installed_rank",
    "version",
    "description",
    "type",
    "script",
    "checksum",
    "installed_by",
    "installed_on",
    "execution_time",
    "success",
];

/// Kind of history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationType {
    Sql,
    Baseline,
    Schema,
    Delete,
    UndoSql,
    Jdbc,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::Sql => "SQL",
            MigrationType::Baseline => "BASELINE",
            MigrationType::Schema => "SCHEMA",
            MigrationType::Delete => "DELETE",
            MigrationType::UndoSql => "UNDO_SQL",
            MigrationType::Jdbc => "JDBC",
        }
    }
}

impl std::fmt::Display for MigrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MigrationType {
    type Err = DsqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SQL" => Ok(MigrationType::Sql),
            "BASELINE" => Ok(MigrationType::Baseline),
            "SCHEMA" => Ok(MigrationType::Schema),
            "DELETE" => Ok(MigrationType::Delete),
            "UNDO_SQL" => Ok(MigrationType::UndoSql),
            "JDBC" => Ok(MigrationType::Jdbc),
            other => Err(DsqlError::database(format!("Unknown migration type '{}'", other))),
        }
    }
}

/// One row of the history table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub installed_rank: i32,
    pub version: Option<String>,
    pub description: String,
    pub migration_type: MigrationType,
    pub script: String,
    pub checksum: Option<i32>,
    pub installed_by: String,
    /// Set by the database default on insert
    pub installed_on: Option<DateTime<Utc>>,
    pub execution_time: i32,
    pub success: bool,
}

impl HistoryRecord {
    /// Successful SQL entry for a migration unit
    pub fn for_unit(
        installed_rank: i32,
        unit: &MigrationUnit,
        installed_by: impl Into<String>,
    ) -> Self {
        Self {
            installed_rank,
            version: unit.version().map(str::to_string),
            description: unit.description().to_string(),
            migration_type: MigrationType::Sql,
            script: unit.script().to_string(),
            checksum: unit.checksum(),
            installed_by: installed_by.into(),
            installed_on: None,
            execution_time: 0,
            success: true,
        }
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time = i32::try_from(execution_time_ms).unwrap_or(i32::MAX);
        self
    }

    pub fn with_type(mut self, migration_type: MigrationType) -> Self {
        self.migration_type = migration_type;
        self
    }

    /// Bind values matching [`INSERT_COLUMNS`]
    pub fn params(&self) -> Vec<DatabaseValue> {
        vec![
            DatabaseValue::Int32(self.installed_rank),
            DatabaseValue::from(self.version.clone()),
            DatabaseValue::from(self.description.as_str()),
            DatabaseValue::from(self.migration_type.as_str()),
            DatabaseValue::from(self.script.as_str()),
            DatabaseValue::from(self.checksum),
            DatabaseValue::from(self.installed_by.as_str()),
            DatabaseValue::Int32(self.execution_time),
            DatabaseValue::Bool(self.success),
        ]
    }

    /// Read a row selected in [`HISTORY_COLUMNS`] order
    pub fn from_row(row: &DatabaseRow) -> DsqlResult<Self> {
        Ok(Self {
            installed_rank: to_i32(row.get_i64(0)?)?,
            version: row.get_optional_string(1)?,
            description: row.get_string(2)?,
            migration_type: row.get_string(3)?.parse()?,
            script: row.get_string(4)?,
            checksum: row.get_optional_i64(5)?.map(to_i32).transpose()?,
            installed_by: row.get_string(6)?,
            installed_on: row.get_optional_datetime(7)?,
            execution_time: to_i32(row.get_i64(8)?)?,
            success: row.get_bool(9)?,
        })
    }
}

fn to_i32(value: i64) -> DsqlResult<i32> {
    i32::try_from(value)
        .map_err(|_| DsqlError::database(format!("Value {} out of INTEGER range", value)))
}

/// Name and generated SQL of the history table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTable {
    schema: String,
    name: String,
}

impl HistoryTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified_name(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }

    /// Single CREATE TABLE with the primary key declared inline
    pub fn create_statement(&self) -> Statement {
        Statement::ddl(format!(
            "CREATE TABLE {} (\n\
             \x20   installed_rank INTEGER NOT NULL PRIMARY KEY,\n\
             \x20   version VARCHAR(50),\n\
             \x20   description VARCHAR(200) NOT NULL,\n\
             \x20   type VARCHAR(20) NOT NULL,\n\
             \x20   script VARCHAR(1000) NOT NULL,\n\
             \x20   checksum INTEGER,\n\
             \x20   installed_by VARCHAR(100) NOT NULL,\n\
             \x20   installed_on TIMESTAMP NOT NULL DEFAULT now(),\n\
             \x20   execution_time INTEGER NOT NULL,\n\
             \x20   success BOOLEAN NOT NULL\n\
             )",
            self.qualified_name()
        ))
    }

    /// Create script handed to the engine.
    ///
    /// `baseline` is ignored: the baseline row is DML and goes in a later group.
    pub fn raw_create_script(&self, _baseline: bool) -> String {
        self.create_statement().sql().to_string()
    }

    /// Optional follow-up index on `success`, its own DDL statement
    pub fn success_index_statement(&self) -> Statement {
        Statement::ddl(format!(
            "CREATE INDEX ASYNC IF NOT EXISTS {} ON {} (success)",
            quote_identifier(&format!("{}_s_idx", self.name)),
            self.qualified_name()
        ))
    }

    /// Parameterized insert naming every written column
    pub fn insert_sql(&self) -> String {
        let columns: Vec<String> = INSERT_COLUMNS.iter().map(|c| quote_identifier(c)).collect();
        let placeholders: Vec<String> = (1..=INSERT_COLUMNS.len())
            .map(|i| format!("${}", i))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified_name(),
            columns.join(", "),
            placeholders.join(", ")
        )
    }

    pub fn insert(&self, record: &HistoryRecord) -> Statement {
        Statement::dml(self.insert_sql()).with_params(record.params())
    }

    pub fn exists_sql(&self) -> &'static str {
        "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2"
    }

    pub fn next_rank_sql(&self) -> String {
        format!(
            "SELECT COALESCE(MAX({}), 0) + 1 FROM {}",
            quote_identifier("installed_rank"),
            self.qualified_name()
        )
    }

    pub fn applied_sql(&self) -> String {
        let columns: Vec<String> = HISTORY_COLUMNS.iter().map(|c| quote_identifier(c)).collect();
        format!(
            "SELECT {} FROM {} ORDER BY {}",
            columns.join(", "),
            self.qualified_name(),
            quote_identifier("installed_rank")
        )
    }
}

/// Result of the lock hook; never grants exclusivity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLock {
    pub table: String,
    pub predicate: String,
    pub enforced: bool,
}

/// History table operations over a connection provider
#[derive(Debug, Clone)]
pub struct HistoryStore {
    table: HistoryTable,
}

impl HistoryStore {
    pub fn new(table: HistoryTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &HistoryTable {
        &self.table
    }

    pub async fn exists(&self, provider: &dyn ConnectionProvider) -> DsqlResult<bool> {
        let mut conn = provider.acquire().await?;
        let rows = conn
            .fetch_all(
                self.table.exists_sql(),
                &[
                    DatabaseValue::from(self.table.schema()),
                    DatabaseValue::from(self.table.name()),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Create the table in its own committed transaction
    pub async fn create(&self, provider: &dyn ConnectionProvider) -> DsqlResult<()> {
        let mut conn = provider.acquire().await?;
        run_in_transaction(conn.as_mut(), 0, &[self.table.create_statement()]).await?;
        info!("Created history table {}", self.table.qualified_name());
        Ok(())
    }

    /// Create the optional `success` index in its own committed transaction
    pub async fn create_success_index(&self, provider: &dyn ConnectionProvider) -> DsqlResult<()> {
        let mut conn = provider.acquire().await?;
        run_in_transaction(conn.as_mut(), 0, &[self.table.success_index_statement()]).await
    }

    /// Next free rank; only a hint, the primary key decides who wins
    pub async fn next_rank(&self, provider: &dyn ConnectionProvider) -> DsqlResult<i32> {
        let mut conn = provider.acquire().await?;
        let rows = conn.fetch_all(&self.table.next_rank_sql(), &[]).await?;
        match rows.first() {
            Some(row) => to_i32(row.get_i64(0)?),
            None => Ok(1),
        }
    }

    /// Insert a record in its own transaction.
    ///
    /// Losing the race for a rank yields [`DsqlError::Conflict`]; the caller
    /// should abort rather than retry the same rank.
    pub async fn insert(
        &self,
        provider: &dyn ConnectionProvider,
        record: &HistoryRecord,
    ) -> DsqlResult<()> {
        let mut conn = provider.acquire().await?;
        let statement = self.table.insert(record);

        match run_in_transaction(conn.as_mut(), 0, &[statement]).await {
            Ok(()) => {
                debug!(
                    "Recorded {} at rank {} in {}",
                    record.script,
                    record.installed_rank,
                    self.table.qualified_name()
                );
                Ok(())
            }
            Err(e) if e.is_write_conflict() => Err(DsqlError::Conflict {
                table: self.table.qualified_name(),
                rank: record.installed_rank,
                statements_committed: 0,
                message: e.message(),
            }),
            Err(e) => Err(e),
        }
    }

    /// All records ordered by rank
    pub async fn applied(
        &self,
        provider: &dyn ConnectionProvider,
    ) -> DsqlResult<Vec<HistoryRecord>> {
        let mut conn = provider.acquire().await?;
        let rows = conn.fetch_all(&self.table.applied_sql(), &[]).await?;
        rows.iter().map(HistoryRecord::from_row).collect()
    }

    /// Lock hook: logs and returns without touching the database
    pub fn acquire_row_lock(&self, predicate: &str) -> RowLock {
        debug!(
            "Row lock on {} where {} not taken: relying on commit-time conflict detection",
            self.table.qualified_name(),
            predicate
        );
        RowLock {
            table: self.table.qualified_name(),
            predicate: predicate.to_string(),
            enforced: false,
        }
    }

    /// Run `operation` under the (unenforced) lock hook
    pub async fn with_lock<F, Fut, T>(&self, predicate: &str, operation: F) -> DsqlResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DsqlResult<T>>,
    {
        let _lock = self.acquire_row_lock(predicate);
        operation().await
    }
}
