//! # elif-dsql: Aurora DSQL migration support for elif.rs
//!
//! Adapts an ordered schema-migration engine to Aurora DSQL, which allows one
//! DDL statement per transaction, never mixes DDL and DML in a transaction,
//! offers no row or advisory locks, and fixes the session role at connect time.
//!
//! Migration units are split into backend-legal transaction groups, each
//! committed on its own; the history row is written last, in its own group.
//! Concurrent runners are separated by DSQL's commit-time conflict detection
//! on the history table's primary key instead of a lock.

pub mod backends;
pub mod capabilities;
pub mod cleanup;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod history;
pub mod partition;
pub mod session;
pub mod statement;

// Re-export core traits and types
pub use backends::{
    handles_url, BackendKind, ConnectionProvider, DatabaseConnection, DatabaseRow, DatabaseValue,
    MemoryDatabase, PostgresProvider, SqlType, PLUGIN_VERSION,
};
pub use capabilities::{BackendCapabilities, AURORA_DSQL};
pub use cleanup::{CleanReport, SchemaCleaner, SchemaInventory, SchemaObjectKind};
pub use config::{DsqlConfig, PoolConfig};
pub use database::{DsqlDatabase, MigrationDatabase};
pub use error::{DsqlError, DsqlResult};
pub use executor::{ExecutionReport, GroupExecutor};
pub use history::{HistoryRecord, HistoryStore, HistoryTable, MigrationType, RowLock};
pub use partition::{GroupScope, Partitioner, TransactionGroup};
pub use session::SessionStateShim;
pub use statement::{split_statements, MigrationUnit, Statement, StatementKind};
