//! Error types for the DSQL migration adapter
//!
//! Statement failures are never swallowed. Every variant that can follow a
//! committed transaction group carries how far execution got, so the caller
//! can tell a clean failure from a partially applied migration.

use crate::cleanup::SchemaObjectKind;

/// Result type alias for adapter operations
pub type DsqlResult<T> = Result<T, DsqlError>;

/// SQLSTATE reported for serialization and optimistic-concurrency failures
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE reported when a primary key value already exists
pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// Error kinds surfaced by the adapter
#[derive(Debug, Clone, thiserror::Error)]
pub enum DsqlError {
    /// Error reported by the backend outside of group execution
    #[error("Database error: {message}")]
    Database {
        code: Option<String>,
        message: String,
    },

    /// Connection acquisition or pool error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single statement failed inside a transaction group
    #[error(
        "Statement {position} of transaction group {group_index} failed: {message} \
         (statement: {statement})"
    )]
    StatementExecution {
        group_index: usize,
        position: usize,
        statement: String,
        code: Option<String>,
        message: String,
    },

    /// Earlier groups committed before a later group failed
    #[error(
        "Migration partially applied: {groups_committed} transaction group(s) with \
         {statements_committed} statement(s) committed before failure, \
         manual reconciliation required: {source}"
    )]
    PartialApplication {
        groups_committed: usize,
        statements_committed: usize,
        #[source]
        source: Box<DsqlError>,
    },

    /// Another writer inserted the same history rank first
    #[error(
        "Write conflict on {table} for installed_rank {rank}: \
         another process is migrating ({message})"
    )]
    Conflict {
        table: String,
        rank: i32,
        statements_committed: usize,
        message: String,
    },

    /// A single DROP failed during cleanup
    #[error("Failed to drop {kind} {object} after {dropped} {kind}(s) were dropped: {message}")]
    CleanupObject {
        kind: SchemaObjectKind,
        object: String,
        dropped: usize,
        message: String,
    },
}

impl DsqlError {
    /// Create a database error without a SQLSTATE
    pub fn database(message: impl Into<String>) -> Self {
        DsqlError::Database {
            code: None,
            message: message.into(),
        }
    }

    /// Create a database error carrying a SQLSTATE
    pub fn database_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        DsqlError::Database {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// SQLSTATE of the underlying backend error, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            DsqlError::Database { code, .. } | DsqlError::StatementExecution { code, .. } => {
                code.as_deref()
            }
            DsqlError::PartialApplication { source, .. } => source.sqlstate(),
            _ => None,
        }
    }

    /// Whether this error means another writer won an optimistic-concurrency race.
    ///
    /// Aurora DSQL reports commit-time conflicts as SQLSTATE 40001 with an
    /// `OC000`/`OC001` detail; a rank already committed by the winner shows up
    /// as a unique violation instead.
    pub fn is_write_conflict(&self) -> bool {
        match self {
            DsqlError::Conflict { .. } => true,
            DsqlError::PartialApplication { source, .. } => source.is_write_conflict(),
            DsqlError::Database { code, message }
            | DsqlError::StatementExecution { code, message, .. } => {
                matches!(
                    code.as_deref(),
                    Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_UNIQUE_VIOLATION)
                ) || message.contains("OC000")
                    || message.contains("OC001")
            }
            _ => false,
        }
    }

    /// Number of statements durably committed before this error occurred
    pub fn statements_committed(&self) -> usize {
        match self {
            DsqlError::PartialApplication {
                statements_committed,
                ..
            }
            | DsqlError::Conflict {
                statements_committed,
                ..
            } => *statements_committed,
            _ => 0,
        }
    }

    /// Whether the schema may have been left partially migrated
    pub fn is_partial_application(&self) -> bool {
        self.statements_committed() > 0
    }

    pub(crate) fn message(&self) -> String {
        match self {
            DsqlError::Database { message, .. } | DsqlError::StatementExecution { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for DsqlError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => DsqlError::Database {
                code: db_err.code().map(|code| code.into_owned()),
                message: db_err.message().to_string(),
            },
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => DsqlError::Connection(err.to_string()),
            sqlx::Error::Configuration(e) => DsqlError::Configuration(e.to_string()),
            other => DsqlError::database(other.to_string()),
        }
    }
}
