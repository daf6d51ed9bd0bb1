//! Transaction Group Executor
//!
//! Runs transaction groups strictly in order, each on a freshly acquired
//! connection and committed before the next one starts. A failure stops the
//! run; groups already committed stay committed.

use std::time::Instant;
use tracing::{debug, error, warn};

use crate::backends::core::restore_autocommit;
use crate::backends::{ConnectionProvider, DatabaseConnection};
use crate::error::{DsqlError, DsqlResult};
use crate::partition::TransactionGroup;
use crate::session::SessionStateShim;
use crate::statement::Statement;

/// Outcome of a successful run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub groups_committed: usize,
    pub statements_committed: usize,
    pub history_recorded: bool,
    pub execution_time_ms: u64,
}

/// Sequential executor over a connection provider
pub struct GroupExecutor<'a> {
    provider: &'a dyn ConnectionProvider,
    session: SessionStateShim,
}

impl<'a> GroupExecutor<'a> {
    pub fn new(provider: &'a dyn ConnectionProvider) -> Self {
        Self {
            provider,
            session: SessionStateShim::new(),
        }
    }

    /// Execute and commit one group on its own connection
    pub async fn execute_group(
        &self,
        group_index: usize,
        group: &TransactionGroup,
    ) -> DsqlResult<()> {
        let mut conn = self.provider.acquire().await?;
        self.session.restore()?;

        debug!(
            "Executing {} group {} ({} statement(s))",
            group.scope(),
            group_index,
            group.len()
        );
        run_in_transaction(conn.as_mut(), group_index, group.statements()).await
    }

    /// Execute groups in order, stopping at the first failure.
    ///
    /// A failure before anything committed is returned as is; after that it
    /// is wrapped in [`DsqlError::PartialApplication`].
    pub async fn execute(&self, groups: &[TransactionGroup]) -> DsqlResult<ExecutionReport> {
        let started = Instant::now();
        let mut report = ExecutionReport::default();

        for (index, group) in groups.iter().enumerate() {
            if let Err(e) = self.execute_group(index, group).await {
                return Err(partial_failure(&report, e));
            }

            report.groups_committed += 1;
            report.statements_committed += group.len();
            report.history_recorded |= group.is_history();
        }

        report.execution_time_ms = elapsed_ms(started);
        Ok(report)
    }
}

/// Return `e` as is when nothing committed yet, otherwise wrap it with the
/// progress in `report`
pub(crate) fn partial_failure(report: &ExecutionReport, e: DsqlError) -> DsqlError {
    if report.groups_committed == 0 {
        error!("Transaction group failed, nothing committed: {}", e);
        return e;
    }

    warn!(
        "Migration partially applied: {} group(s) with {} statement(s) committed before failure",
        report.groups_committed, report.statements_committed
    );
    DsqlError::PartialApplication {
        groups_committed: report.groups_committed,
        statements_committed: report.statements_committed,
        source: Box::new(e),
    }
}

/// Run statements as one transaction with autocommit off, restoring the flag afterwards
pub(crate) async fn run_in_transaction(
    conn: &mut dyn DatabaseConnection,
    group_index: usize,
    statements: &[Statement],
) -> DsqlResult<()> {
    let original = conn.autocommit();
    let result = match conn.set_autocommit(false).await {
        Ok(()) => run_statements(conn, group_index, statements).await,
        Err(e) => Err(e),
    };
    restore_autocommit(conn, original, result).await
}

async fn run_statements(
    conn: &mut dyn DatabaseConnection,
    group_index: usize,
    statements: &[Statement],
) -> DsqlResult<()> {
    for (position, statement) in statements.iter().enumerate() {
        debug!("Executing {} statement: {}", statement.kind(), statement.sql());

        if let Err(e) = conn.execute(statement.sql(), statement.params()).await {
            rollback_quietly(conn).await;
            return Err(statement_error(group_index, position, statement.sql(), e));
        }
    }

    if let Err(e) = conn.commit().await {
        rollback_quietly(conn).await;
        return Err(statement_error(group_index, statements.len(), "COMMIT", e));
    }

    Ok(())
}

async fn rollback_quietly(conn: &mut dyn DatabaseConnection) {
    if let Err(e) = conn.rollback().await {
        warn!("Rollback after failed statement also failed: {}", e);
    }
}

fn statement_error(
    group_index: usize,
    position: usize,
    statement: &str,
    e: DsqlError,
) -> DsqlError {
    DsqlError::StatementExecution {
        group_index,
        position,
        statement: statement.to_string(),
        code: e.sqlstate().map(str::to_string),
        message: e.message(),
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
