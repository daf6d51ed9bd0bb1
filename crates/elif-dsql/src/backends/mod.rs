//! Database Backend Abstractions
//!
//! Connection traits, endpoint detection, and the two connection providers:
//! sqlx/PostgreSQL for real clusters and an in-memory backend for dry runs
//! and tests.

pub mod core;
pub mod memory;
pub mod postgres;

pub use self::core::*;
pub use memory::{MemoryConnection, MemoryDatabase};
pub use postgres::{PostgresConnection, PostgresProvider};

use crate::error::{DsqlError, DsqlResult};

/// Version reported in the startup banner
pub const PLUGIN_VERSION: &str = "1.0.0";

/// Backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    AuroraDsql,
    PostgreSQL,
}

impl BackendKind {
    /// Detect the backend from a connection URL.
    ///
    /// DSQL is recognized either by an explicit `aws-dsql:` scheme or by a
    /// PostgreSQL URL whose host is a DSQL endpoint (public or PrivateLink).
    pub fn detect(url: &str) -> Option<Self> {
        let url = url.strip_prefix("jdbc:").unwrap_or(url);

        if url.starts_with("aws-dsql:") {
            return Some(BackendKind::AuroraDsql);
        }

        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            if is_dsql_host(url) {
                return Some(BackendKind::AuroraDsql);
            }
            return Some(BackendKind::PostgreSQL);
        }

        None
    }

    /// Human-readable backend name
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::AuroraDsql => "Aurora DSQL",
            BackendKind::PostgreSQL => "PostgreSQL",
        }
    }

    /// Matching priority; DSQL outranks plain PostgreSQL so its URLs match first
    pub fn priority(&self) -> i32 {
        match self {
            BackendKind::AuroraDsql => 1,
            BackendKind::PostgreSQL => 0,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether the URL names an Aurora DSQL cluster
pub fn handles_url(url: &str) -> bool {
    BackendKind::detect(url) == Some(BackendKind::AuroraDsql)
}

/// Rewrite a DSQL URL into the `postgresql://` form sqlx connects with
pub fn connect_url(url: &str) -> DsqlResult<String> {
    if !handles_url(url) {
        return Err(DsqlError::Configuration(format!(
            "Not an Aurora DSQL connection URL: {}",
            redact(url)
        )));
    }

    let url = url.strip_prefix("jdbc:").unwrap_or(url);
    let rest = url.strip_prefix("aws-dsql:").unwrap_or(url);

    if rest.starts_with("postgresql://") || rest.starts_with("postgres://") {
        Ok(rest.to_string())
    } else if let Some(authority) = rest.strip_prefix("//") {
        Ok(format!("postgresql://{}", authority))
    } else {
        Err(DsqlError::Configuration(format!(
            "Unsupported Aurora DSQL URL form: {}",
            redact(url)
        )))
    }
}

fn is_dsql_host(url: &str) -> bool {
    let host = match url::Url::parse(url) {
        Ok(parsed) => parsed.host_str().map(str::to_string),
        Err(_) => None,
    };

    host.map_or(false, |host| {
        host.split('.')
            .skip(1)
            .any(|label| label == "dsql" || label.starts_with("dsql-"))
    })
}

fn redact(url: &str) -> String {
    match url.find('@') {
        Some(at) => match url[..at].rfind(':') {
            Some(colon) if url[..colon].contains("//") => {
                format!("{}:***{}", &url[..colon], &url[at..])
            }
            _ => url.to_string(),
        },
        None => url.to_string(),
    }
}
