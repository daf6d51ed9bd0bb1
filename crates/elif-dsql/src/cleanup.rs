//! Dependency-ordered schema cleanup
//!
//! Views go first because they may reference tables. Each DROP runs in its own
//! committed transaction with autocommit forced on, and the connection's
//! original autocommit flag is put back on every exit path.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backends::core::restore_autocommit;
use crate::backends::{qualified_name, DatabaseConnection, DatabaseValue};
use crate::error::{DsqlError, DsqlResult};

/// Kind of schema object removed by cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaObjectKind {
    View,
    Table,
}

impl SchemaObjectKind {
    /// Drop order: dependents before what they depend on
    pub const DROP_ORDER: [SchemaObjectKind; 2] = [SchemaObjectKind::View, SchemaObjectKind::Table];

    pub fn keyword(&self) -> &'static str {
        match self {
            SchemaObjectKind::View => "VIEW",
            SchemaObjectKind::Table => "TABLE",
        }
    }

    /// Catalog query listing objects of this kind in a schema (`$1`)
    pub fn inventory_query(&self) -> &'static str {
        match self {
            SchemaObjectKind::View => {
                "SELECT table_name::text FROM information_schema.views \
                 WHERE table_schema = $1 ORDER BY table_name"
            }
            SchemaObjectKind::Table => {
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name"
            }
        }
    }
}

impl std::fmt::Display for SchemaObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaObjectKind::View => write!(f, "view"),
            SchemaObjectKind::Table => write!(f, "table"),
        }
    }
}

/// Views and tables present in a schema right before cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaInventory {
    pub views: Vec<String>,
    pub tables: Vec<String>,
}

impl SchemaInventory {
    pub fn is_empty(&self) -> bool {
        self.views.is_empty() && self.tables.is_empty()
    }
}

/// Objects dropped by one cleanup run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub views_dropped: usize,
    pub tables_dropped: usize,
}

/// Drops every view and table in a schema
#[derive(Debug, Clone, Default)]
pub struct SchemaCleaner;

impl SchemaCleaner {
    pub fn new() -> Self {
        Self
    }

    /// `DROP <kind> IF EXISTS "schema"."name"`
    pub fn drop_statement(kind: SchemaObjectKind, schema: &str, name: &str) -> String {
        format!("DROP {} IF EXISTS {}", kind.keyword(), qualified_name(schema, name))
    }

    /// Names of the objects of one kind in the schema
    pub async fn list(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: &str,
        kind: SchemaObjectKind,
    ) -> DsqlResult<Vec<String>> {
        let rows = conn
            .fetch_all(kind.inventory_query(), &[DatabaseValue::from(schema)])
            .await?;
        rows.iter().map(|row| row.get_string(0)).collect()
    }

    pub async fn inventory(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: &str,
    ) -> DsqlResult<SchemaInventory> {
        Ok(SchemaInventory {
            views: self.list(conn, schema, SchemaObjectKind::View).await?,
            tables: self.list(conn, schema, SchemaObjectKind::Table).await?,
        })
    }

    /// Drop all views, then all tables, of `schema`
    pub async fn clean(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: &str,
    ) -> DsqlResult<CleanReport> {
        let original = conn.autocommit();
        let result = match conn.set_autocommit(true).await {
            Ok(()) => self.drop_all(conn, schema).await,
            Err(e) => Err(e),
        };
        let report = restore_autocommit(conn, original, result).await?;

        info!(
            "Cleaned schema {}: {} view(s), {} table(s) dropped",
            schema, report.views_dropped, report.tables_dropped
        );
        Ok(report)
    }

    async fn drop_all(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: &str,
    ) -> DsqlResult<CleanReport> {
        let mut report = CleanReport::default();

        for kind in SchemaObjectKind::DROP_ORDER {
            let names = self.list(conn, schema, kind).await?;
            let dropped = self.drop_objects(conn, schema, kind, &names).await?;
            match kind {
                SchemaObjectKind::View => report.views_dropped = dropped,
                SchemaObjectKind::Table => report.tables_dropped = dropped,
            }
        }

        Ok(report)
    }

    async fn drop_objects(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: &str,
        kind: SchemaObjectKind,
        names: &[String],
    ) -> DsqlResult<usize> {
        for (dropped, name) in names.iter().enumerate() {
            let sql = Self::drop_statement(kind, schema, name);
            debug!("Dropping {}: {}", kind, sql);

            if let Err(e) = conn.execute(&sql, &[]).await {
                return Err(DsqlError::CleanupObject {
                    kind,
                    object: qualified_name(schema, name),
                    dropped,
                    message: e.message(),
                });
            }
        }
        Ok(names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryDatabase;

    #[test]
    fn test_drop_statement_uses_if_exists() {
        assert_eq!(
            SchemaCleaner::drop_statement(SchemaObjectKind::View, "public", "v"),
            "DROP VIEW IF EXISTS \"public\".\"v\""
        );
        assert_eq!(
            SchemaCleaner::drop_statement(SchemaObjectKind::Table, "app", "t"),
            "DROP TABLE IF EXISTS \"app\".\"t\""
        );
    }

    #[tokio::test]
    async fn test_clean_drops_views_before_tables() {
        let db = MemoryDatabase::new()
            .with_table("public", "t")
            .with_view("public", "v", &["t"]);
        let mut conn = db.connect();

        let report = SchemaCleaner::new().clean(&mut conn, "public").await.unwrap();
        assert_eq!(report, CleanReport { views_dropped: 1, tables_dropped: 1 });

        let drops: Vec<String> = db
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("DROP"))
            .collect();
        assert_eq!(
            drops,
            vec!["DROP VIEW IF EXISTS \"public\".\"v\"", "DROP TABLE IF EXISTS \"public\".\"t\""]
        );
    }

    #[tokio::test]
    async fn test_clean_restores_autocommit_after_failure() {
        let db = MemoryDatabase::new()
            .with_table("public", "a")
            .with_table("public", "b");
        db.fail_on_with("\"b\"", "42501", "permission denied for table b");
        let mut conn = db.connect();
        conn.set_autocommit(false).await.unwrap();

        let err = SchemaCleaner::new().clean(&mut conn, "public").await.unwrap_err();
        match err {
            DsqlError::CleanupObject { kind, object, dropped, .. } => {
                assert_eq!(kind, SchemaObjectKind::Table);
                assert_eq!(object, "\"public\".\"b\"");
                assert_eq!(dropped, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(!conn.autocommit());
        assert!(!db.has_object("public", "a"));
        assert!(db.has_object("public", "b"));
    }
}
