//! Engine hook surface
//!
//! [`MigrationDatabase`] is the set of backend hooks a migration engine calls.
//! [`DsqlDatabase`] answers them for Aurora DSQL and can also drive a whole
//! migration unit through partitioning, execution and history recording.

use async_trait::async_trait;
use std::time::Instant;
use tracing::{info, warn};

use crate::backends::{
    connect_url, ConnectionProvider, DatabaseConnection, PostgresProvider, PLUGIN_VERSION,
};
use crate::capabilities::{BackendCapabilities, AURORA_DSQL};
use crate::cleanup::{CleanReport, SchemaCleaner};
use crate::config::DsqlConfig;
use crate::error::{DsqlError, DsqlResult};
use crate::executor::{elapsed_ms, partial_failure, ExecutionReport, GroupExecutor};
use crate::history::{HistoryRecord, HistoryStore, HistoryTable, RowLock};
use crate::partition::{Partitioner, TransactionGroup};
use crate::session::SessionStateShim;
use crate::statement::MigrationUnit;

/// Backend hooks consumed by the migration engine
#[async_trait]
pub trait MigrationDatabase: Send + Sync {
    fn capabilities(&self) -> &BackendCapabilities;

    /// Whether DDL may run inside the engine's migration transaction
    fn supports_ddl_transactions(&self) -> bool {
        self.capabilities().supports_ddl_in_transaction
    }

    /// Whether history-table DDL and bookkeeping DML may share one connection
    fn use_single_connection(&self) -> bool {
        self.capabilities().use_single_connection()
    }

    fn raw_create_script(&self, baseline: bool) -> String;

    fn insert_statement(&self) -> String;

    /// Lock the history table rows matching `predicate` before mutating them
    async fn lock(&self, predicate: &str) -> DsqlResult<RowLock>;

    /// Drop every object in the configured schema
    async fn clean(&self, conn: &mut dyn DatabaseConnection) -> DsqlResult<CleanReport>;

    /// Put a pooled connection back into its original session state
    async fn restore_original_state(&self, conn: &mut dyn DatabaseConnection) -> DsqlResult<()>;
}

/// Aurora DSQL implementation of the engine hooks
#[derive(Debug, Clone)]
pub struct DsqlDatabase {
    capabilities: BackendCapabilities,
    partitioner: Partitioner,
    history: HistoryStore,
    cleaner: SchemaCleaner,
    session: SessionStateShim,
    schema: String,
    installed_by: String,
}

impl DsqlDatabase {
    pub fn new(config: &DsqlConfig) -> Self {
        info!("Using Aurora DSQL migration support v{}", PLUGIN_VERSION);

        Self {
            capabilities: AURORA_DSQL,
            partitioner: Partitioner::new(AURORA_DSQL),
            history: HistoryStore::new(HistoryTable::new(&config.schema, &config.history_table)),
            cleaner: SchemaCleaner::new(),
            session: SessionStateShim::new(),
            schema: config.schema.clone(),
            installed_by: config.installed_by(),
        }
    }

    /// Open a sqlx pool for the configured DSQL endpoint
    pub async fn connect(config: &DsqlConfig) -> DsqlResult<PostgresProvider> {
        config.validate()?;
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| DsqlError::Configuration("database_url is required".to_string()))?;
        PostgresProvider::connect(&connect_url(url)?, &config.pool).await
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Create the history table unless it already exists; true when created
    pub async fn ensure_history_table(
        &self,
        provider: &dyn ConnectionProvider,
    ) -> DsqlResult<bool> {
        if self.history.exists(provider).await? {
            return Ok(false);
        }
        self.history.create(provider).await?;
        Ok(true)
    }

    /// Clean the configured schema on a fresh connection
    pub async fn clean_schema(&self, provider: &dyn ConnectionProvider) -> DsqlResult<CleanReport> {
        let mut conn = provider.acquire().await?;
        self.cleaner.clean(conn.as_mut(), &self.schema).await
    }

    /// Apply a unit and record it at the next free rank
    pub async fn apply_migration(
        &self,
        provider: &dyn ConnectionProvider,
        unit: &MigrationUnit,
    ) -> DsqlResult<ExecutionReport> {
        self.apply_migration_with_rank(provider, unit, None).await
    }

    /// Apply a unit group by group, then write its history row as the last group.
    ///
    /// `rank` pins the history rank; `None` reads the next free one right
    /// before the insert. Losing the rank to another runner yields
    /// [`DsqlError::Conflict`].
    pub async fn apply_migration_with_rank(
        &self,
        provider: &dyn ConnectionProvider,
        unit: &MigrationUnit,
        rank: Option<i32>,
    ) -> DsqlResult<ExecutionReport> {
        let started = Instant::now();
        let executor = GroupExecutor::new(provider);
        let groups = self.partitioner.partition_statements(unit.statements());

        let mut report = executor.execute(&groups).await?;

        let rank = match rank {
            Some(rank) => rank,
            None => self
                .history
                .next_rank(provider)
                .await
                .map_err(|e| partial_failure(&report, e))?,
        };
        let record = HistoryRecord::for_unit(rank, unit, &self.installed_by)
            .with_execution_time(elapsed_ms(started));
        let history_group = TransactionGroup::history_insert(self.history.table().insert(&record));

        if let Err(e) = executor.execute_group(groups.len(), &history_group).await {
            if e.is_write_conflict() {
                warn!(
                    "Lost history rank {} to another runner; \
                     {} statement(s) of {} already committed",
                    rank,
                    report.statements_committed,
                    unit.script()
                );
                return Err(DsqlError::Conflict {
                    table: self.history.table().qualified_name(),
                    rank,
                    statements_committed: report.statements_committed,
                    message: e.message(),
                });
            }
            return Err(partial_failure(&report, e));
        }

        report.groups_committed += 1;
        report.statements_committed += history_group.len();
        report.history_recorded = true;
        report.execution_time_ms = elapsed_ms(started);

        info!(
            "Applied {} in {} transaction group(s) ({} ms)",
            unit.script(),
            report.groups_committed,
            report.execution_time_ms
        );
        Ok(report)
    }

    /// Run `operation` under the history lock hook
    pub async fn with_lock<F, Fut, T>(&self, predicate: &str, operation: F) -> DsqlResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DsqlResult<T>>,
    {
        self.history.with_lock(predicate, operation).await
    }
}

#[async_trait]
impl MigrationDatabase for DsqlDatabase {
    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn raw_create_script(&self, baseline: bool) -> String {
        self.history.table().raw_create_script(baseline)
    }

    fn insert_statement(&self) -> String {
        self.history.table().insert_sql()
    }

    async fn lock(&self, predicate: &str) -> DsqlResult<RowLock> {
        Ok(self.history.acquire_row_lock(predicate))
    }

    async fn clean(&self, conn: &mut dyn DatabaseConnection) -> DsqlResult<CleanReport> {
        self.cleaner.clean(conn, &self.schema).await
    }

    async fn restore_original_state(&self, _conn: &mut dyn DatabaseConnection) -> DsqlResult<()> {
        self.session.restore()
    }
}
