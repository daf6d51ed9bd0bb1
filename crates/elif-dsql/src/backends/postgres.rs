//! PostgreSQL-wire Backend Implementation
//!
//! Connection provider for Aurora DSQL built on sqlx's PostgreSQL driver.
//! The autocommit flag is emulated: with autocommit on, every statement runs
//! on the pool and commits on its own; with it off, the first statement opens
//! a sqlx transaction that is held until commit or rollback.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, Transaction, TypeInfo};
use std::time::Duration;
use tracing::debug;

use super::core::*;
use crate::config::PoolConfig;
use crate::error::{DsqlError, DsqlResult};

/// sqlx pool-backed connection provider
#[derive(Debug, Clone)]
pub struct PostgresProvider {
    pool: PgPool,
}

impl PostgresProvider {
    /// Connect a pool to the given URL
    pub async fn connect(database_url: &str, config: &PoolConfig) -> DsqlResult<Self> {
        let mut options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .test_before_acquire(config.test_before_acquire);

        if let Some(idle_timeout) = config.idle_timeout_seconds {
            options = options.idle_timeout(Duration::from_secs(idle_timeout));
        }

        if let Some(max_lifetime) = config.max_lifetime_seconds {
            options = options.max_lifetime(Duration::from_secs(max_lifetime));
        }

        let pool = options
            .connect(database_url)
            .await
            .map_err(|e| {
                DsqlError::Connection(format!("Failed to create connection pool: {}", e))
            })?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ConnectionProvider for PostgresProvider {
    async fn acquire(&self) -> DsqlResult<Box<dyn DatabaseConnection>> {
        Ok(Box::new(PostgresConnection::new(self.pool.clone())))
    }
}

/// Connection handle with an emulated autocommit flag
pub struct PostgresConnection {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    autocommit: bool,
}

impl PostgresConnection {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tx: None,
            autocommit: true,
        }
    }

    async fn open_transaction(&mut self) -> DsqlResult<()> {
        if !self.autocommit && self.tx.is_none() {
            debug!("Opening transaction");
            self.tx = Some(self.pool.begin().await?);
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DsqlResult<u64> {
        self.open_transaction().await?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };

        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DsqlResult<Vec<DatabaseRow>> {
        self.open_transaction().await?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        rows.iter().map(convert_row).collect()
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> DsqlResult<()> {
        if autocommit && !self.autocommit {
            self.commit().await?;
        }
        self.autocommit = autocommit;
        Ok(())
    }

    async fn commit(&mut self) -> DsqlResult<()> {
        if let Some(tx) = self.tx.take() {
            debug!("Committing transaction");
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DsqlResult<()> {
        if let Some(tx) = self.tx.take() {
            debug!("Rolling back transaction");
            tx.rollback().await?;
        }
        Ok(())
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null(SqlType::Bool) => query.bind(Option::<bool>::None),
        DatabaseValue::Null(SqlType::Int32) => query.bind(Option::<i32>::None),
        DatabaseValue::Null(SqlType::Int64) => query.bind(Option::<i64>::None),
        DatabaseValue::Null(SqlType::Text) => query.bind(Option::<String>::None),
        DatabaseValue::Null(SqlType::Timestamp) => query.bind(Option::<DateTime<Utc>>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}

fn convert_row(row: &PgRow) -> DsqlResult<DatabaseRow> {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = (0..columns.len())
        .map(|index| convert_value(row, index))
        .collect::<DsqlResult<Vec<_>>>()?;
    Ok(DatabaseRow::new(columns, values))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn convert_value(row: &PgRow, index: usize) -> DsqlResult<DatabaseValue> {
    let type_name = row.columns()[index].type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)?
            .map_or(DatabaseValue::Null(SqlType::Bool), DatabaseValue::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)?
            .map_or(DatabaseValue::Null(SqlType::Int32), |v| DatabaseValue::Int32(i32::from(v))),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)?
            .map_or(DatabaseValue::Null(SqlType::Int32), DatabaseValue::Int32),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)?
            .map_or(DatabaseValue::Null(SqlType::Int64), DatabaseValue::Int64),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map_or(DatabaseValue::Null(SqlType::Timestamp), DatabaseValue::DateTime),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map_or(DatabaseValue::Null(SqlType::Timestamp), |naive| {
                DatabaseValue::DateTime(DateTime::from_naive_utc_and_offset(naive, Utc))
            }),
        _ => row
            .try_get_unchecked::<Option<String>, _>(index)
            .map_err(|e| {
                DsqlError::database(format!(
                    "Failed to read column {} of type '{}' as text: {}",
                    index, type_name, e
                ))
            })?
            .map_or(DatabaseValue::Null(SqlType::Text), DatabaseValue::String),
    };

    Ok(value)
}
