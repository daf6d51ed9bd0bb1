//! Adapter configuration
//!
//! Loaded from the environment or deserialized from the engine's own config
//! file. Everything except the database URL has a default.

use serde::{Deserialize, Serialize};
use std::env;

use crate::backends::handles_url;
use crate::error::{DsqlError, DsqlResult};

const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_HISTORY_TABLE: &str = "flyway_schema_history";
const DEFAULT_INSTALLED_BY: &str = "admin";

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            idle_timeout_seconds: Some(600),  // 10 minutes
            max_lifetime_seconds: Some(1800), // 30 minutes
            test_before_acquire: true,
        }
    }
}

/// Adapter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsqlConfig {
    pub database_url: Option<String>,
    pub schema: String,
    pub history_table: String,
    pub installed_by: Option<String>,
    pub pool: PoolConfig,
}

impl Default for DsqlConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            schema: DEFAULT_SCHEMA.to_string(),
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            installed_by: None,
            pool: PoolConfig::default(),
        }
    }
}

impl DsqlConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> DsqlResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> DsqlResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.database_url = lookup("DATABASE_URL");

        if let Some(schema) = lookup("DSQL_SCHEMA") {
            config.schema = schema;
        }

        if let Some(history_table) = lookup("DSQL_HISTORY_TABLE") {
            config.history_table = history_table;
        }

        config.installed_by = lookup("DSQL_INSTALLED_BY");

        if let Some(max_connections) = lookup("DSQL_MAX_CONNECTIONS") {
            config.pool.max_connections = max_connections.parse().map_err(|_| {
                DsqlError::Configuration(format!(
                    "DSQL_MAX_CONNECTIONS must be a positive integer, got '{}'",
                    max_connections
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> DsqlResult<()> {
        if self.schema.trim().is_empty() {
            return Err(DsqlError::Configuration("schema must not be empty".to_string()));
        }

        if self.history_table.trim().is_empty() {
            return Err(DsqlError::Configuration(
                "history_table must not be empty".to_string(),
            ));
        }

        if self.pool.max_connections == 0 {
            return Err(DsqlError::Configuration(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }

        if self.pool.min_connections > self.pool.max_connections {
            return Err(DsqlError::Configuration(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }

        if let Some(url) = &self.database_url {
            if !handles_url(url) {
                return Err(DsqlError::Configuration(
                    "database_url is not an Aurora DSQL endpoint".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Principal recorded in the history table.
    ///
    /// Falls back to the user name embedded in the database URL, then `admin`.
    pub fn installed_by(&self) -> String {
        if let Some(installed_by) = &self.installed_by {
            return installed_by.clone();
        }

        self.database_url
            .as_deref()
            .and_then(url_user)
            .unwrap_or_else(|| DEFAULT_INSTALLED_BY.to_string())
    }
}

fn url_user(database_url: &str) -> Option<String> {
    let url = database_url.strip_prefix("jdbc:").unwrap_or(database_url);
    let url = url.strip_prefix("aws-dsql:").unwrap_or(url);
    let url = if url.starts_with("//") {
        format!("postgresql:{}", url)
    } else {
        url.to_string()
    };

    let parsed = url::Url::parse(&url).ok()?;
    let user = parsed.username();
    if user.is_empty() {
        parsed
            .query_pairs()
            .find(|(key, _)| key == "user")
            .map(|(_, value)| value.into_owned())
    } else {
        Some(user.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DsqlConfig::default();
        assert_eq!(config.schema, "public");
        assert_eq!(config.history_table, "flyway_schema_history");
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.pool.idle_timeout_seconds, Some(600));
        assert!(config.validate().is_ok());
        assert_eq!(config.installed_by(), "admin");
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = DsqlConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://admin@abc.dsql.us-east-1.on.aws/postgres"),
            ("DSQL_SCHEMA", "app"),
            ("DSQL_HISTORY_TABLE", "schema_history"),
            ("DSQL_MAX_CONNECTIONS", "4"),
        ]))
        .unwrap();

        assert_eq!(config.schema, "app");
        assert_eq!(config.history_table, "schema_history");
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.installed_by(), "admin");
    }

    #[test]
    fn test_installed_by_prefers_explicit_value() {
        let config = DsqlConfig::from_lookup(lookup_from(&[
            (
                "DATABASE_URL",
                "jdbc:aws-dsql:postgresql://abc.dsql.us-east-1.on.aws/postgres?user=deployer",
            ),
            ("DSQL_INSTALLED_BY", "ci"),
        ]))
        .unwrap();
        assert_eq!(config.installed_by(), "ci");

        let config = DsqlConfig {
            installed_by: None,
            ..config
        };
        assert_eq!(config.installed_by(), "deployer");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err =
            DsqlConfig::from_lookup(lookup_from(&[("DSQL_MAX_CONNECTIONS", "many")])).unwrap_err();
        assert!(matches!(err, DsqlError::Configuration(_)));

        assert!(DsqlConfig::from_lookup(lookup_from(&[("DSQL_SCHEMA", " ")])).is_err());
        let plain_postgres = lookup_from(&[("DATABASE_URL", "postgres://localhost/app")]);
        assert!(DsqlConfig::from_lookup(plain_postgres).is_err());

        let mut config = DsqlConfig::default();
        config.pool.min_connections = 20;
        assert!(config.validate().is_err());
    }
}
