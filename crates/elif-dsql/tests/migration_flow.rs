use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use elif_dsql::{
    ConnectionProvider, DatabaseConnection, DatabaseRow, DatabaseValue, DsqlConfig, DsqlDatabase,
    DsqlError, DsqlResult, HistoryRecord, HistoryStore, HistoryTable, MemoryDatabase,
    MigrationDatabase, MigrationUnit, Partitioner, Statement, StatementKind, AURORA_DSQL,
};

const HISTORY_INSERT: &str = "INSERT INTO \"public\".\"schema_history\"";

/// A second runner that records its unit at the same rank
struct Rival {
    db: MemoryDatabase,
    store: HistoryStore,
    record: HistoryRecord,
    committed: AtomicBool,
}

/// Provider whose history transactions lose to the rival: right before such a
/// transaction commits, the rival commits the same rank on another connection
struct RacingProvider {
    rival: Arc<Rival>,
}

impl RacingProvider {
    fn new(db: &MemoryDatabase, rank: i32) -> Self {
        let record = HistoryRecord::for_unit(rank, &data_unit(&rank.to_string(), "a"), "rival");
        Self {
            rival: Arc::new(Rival {
                db: db.clone(),
                store: HistoryStore::new(HistoryTable::new("public", "schema_history")),
                record,
                committed: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl ConnectionProvider for RacingProvider {
    async fn acquire(&self) -> DsqlResult<Box<dyn DatabaseConnection>> {
        Ok(Box::new(RacingConnection {
            inner: self.rival.db.acquire().await?,
            rival: Arc::clone(&self.rival),
            writes_history: false,
        }))
    }
}

struct RacingConnection {
    inner: Box<dyn DatabaseConnection>,
    rival: Arc<Rival>,
    writes_history: bool,
}

#[async_trait]
impl DatabaseConnection for RacingConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DsqlResult<u64> {
        self.writes_history |= sql.starts_with(HISTORY_INSERT);
        self.inner.execute(sql, params).await
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DsqlResult<Vec<DatabaseRow>> {
        self.inner.fetch_all(sql, params).await
    }

    fn autocommit(&self) -> bool {
        self.inner.autocommit()
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> DsqlResult<()> {
        self.inner.set_autocommit(autocommit).await
    }

    async fn commit(&mut self) -> DsqlResult<()> {
        if self.writes_history && !self.rival.committed.swap(true, Ordering::SeqCst) {
            let rival = Arc::clone(&self.rival);
            rival.store.insert(&rival.db, &rival.record).await?;
        }
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> DsqlResult<()> {
        self.inner.rollback().await
    }
}

fn runner(installed_by: &str) -> DsqlDatabase {
    DsqlDatabase::new(&DsqlConfig {
        history_table: "schema_history".to_string(),
        installed_by: Some(installed_by.to_string()),
        ..DsqlConfig::default()
    })
}

fn data_unit(version: &str, table: &str) -> MigrationUnit {
    MigrationUnit::new(
        Some(version.to_string()),
        format!("seed {}", table),
        format!("V{}__seed_{}.sql", version, table),
        vec![Statement::dml(format!("INSERT INTO {} VALUES (1)", table))],
    )
}

#[test]
fn test_script_partitions_into_three_groups() {
    let unit = MigrationUnit::from_sql(
        Some("1".to_string()),
        "create t",
        "V1__create_t.sql",
        "CREATE TABLE t (id INT PRIMARY KEY);\n\
         INSERT INTO t VALUES (1);\n\
         INSERT INTO t VALUES (2);\n",
    );
    let record = HistoryRecord::for_unit(1, &unit, "admin");
    let history = runner("admin").history().table().insert(&record);
    let groups = Partitioner::new(AURORA_DSQL).partition(unit.statements(), history);

    assert_eq!(groups.len(), 3);
    assert_eq!(groups[0].len(), 1);
    assert_eq!(groups[0].statements()[0].kind(), StatementKind::Ddl);
    assert_eq!(groups[1].len(), 2);
    assert!(groups[1].statements().iter().all(|s| s.kind() == StatementKind::Dml));
    assert!(groups[2].is_history());
}

#[test]
fn test_history_create_script_is_one_statement() {
    let script = runner("admin").raw_create_script(true);

    assert!(script.contains("installed_rank INTEGER NOT NULL PRIMARY KEY"));
    assert!(!script.contains("ALTER TABLE"));
    assert!(!script.contains("CREATE INDEX"));
    assert_eq!(elif_dsql::split_statements(&script).len(), 1);
}

#[tokio::test]
async fn test_each_ddl_commits_alone_and_history_comes_last() {
    let memory = MemoryDatabase::new();
    let db = runner("admin");
    db.ensure_history_table(&memory).await.unwrap();
    memory.clear_statements();

    let unit = MigrationUnit::from_sql(
        Some("1".to_string()),
        "orders",
        "V1__orders.sql",
        "CREATE TABLE orders (id INT PRIMARY KEY);\n\
         CREATE INDEX ASYNC orders_idx ON orders (id);\n\
         INSERT INTO orders VALUES (1);",
    );
    let report = db.apply_migration(&memory, &unit).await.unwrap();
    assert_eq!(report.groups_committed, 4);
    assert_eq!(report.statements_committed, 4);

    let log = memory.statements();
    let commits = log.iter().filter(|s| *s == "COMMIT").count();
    assert_eq!(commits, 4);

    let last_insert = log
        .iter()
        .rposition(|s| s.starts_with("INSERT INTO \"public\".\"schema_history\""))
        .unwrap();
    let last_user_statement = log
        .iter()
        .rposition(|s| s == "INSERT INTO orders VALUES (1)")
        .unwrap();
    assert!(last_insert > last_user_statement);
}

#[tokio::test]
async fn test_sequential_migrations_take_increasing_ranks() {
    let memory = MemoryDatabase::new().with_table("public", "a").with_table("public", "b");
    let db = runner("admin");
    db.ensure_history_table(&memory).await.unwrap();

    db.apply_migration(&memory, &data_unit("1", "a")).await.unwrap();
    db.apply_migration(&memory, &data_unit("2", "b")).await.unwrap();

    assert_eq!(memory.history_ranks("public", "schema_history"), vec![1, 2]);
    let applied = db.history().applied(&memory).await.unwrap();
    assert_eq!(applied[1].script, "V2__seed_b.sql");
}

#[tokio::test]
async fn test_concurrent_runner_loses_rank_and_stops() {
    let memory = MemoryDatabase::new().with_table("public", "a").with_table("public", "b");
    let first = runner("first");
    let second = runner("second");
    first.ensure_history_table(&memory).await.unwrap();

    first
        .apply_migration_with_rank(&memory, &data_unit("7", "a"), Some(7))
        .await
        .unwrap();

    let err = second
        .apply_migration_with_rank(&memory, &data_unit("7", "b"), Some(7))
        .await
        .unwrap_err();

    match &err {
        DsqlError::Conflict { rank, statements_committed, .. } => {
            assert_eq!(*rank, 7);
            assert_eq!(*statements_committed, 1);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert!(err.is_write_conflict());

    let log = memory.statements();
    let failed_insert = log
        .iter()
        .rposition(|s| s.starts_with("INSERT INTO \"public\".\"schema_history\""))
        .unwrap();
    assert_eq!(&log[failed_insert + 1..], ["ROLLBACK".to_string()]);

    let applied = first.history().applied(&memory).await.unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].installed_by, "first");
}

fn assert_lost_at_commit(memory: &MemoryDatabase) {
    let log = memory.statements();
    assert_eq!(log.iter().filter(|s| s.starts_with(HISTORY_INSERT)).count(), 2);
    assert_eq!(log.last().map(String::as_str), Some("COMMIT"));
    assert_eq!(memory.history_ranks("public", "schema_history"), vec![7]);
}

#[tokio::test]
async fn test_history_insert_losing_at_commit_is_conflict() {
    let memory = MemoryDatabase::new();
    let store = HistoryStore::new(HistoryTable::new("public", "schema_history"));
    store.create(&memory).await.unwrap();
    let racing = RacingProvider::new(&memory, 7);

    let unit = data_unit("7", "b");
    let err = store
        .insert(&racing, &HistoryRecord::for_unit(7, &unit, "second"))
        .await
        .unwrap_err();

    match &err {
        DsqlError::Conflict { rank, statements_committed, message, .. } => {
            assert_eq!(*rank, 7);
            assert_eq!(*statements_committed, 0);
            assert!(message.contains("OC000"));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_lost_at_commit(&memory);

    let applied = store.applied(&memory).await.unwrap();
    assert_eq!(applied[0].installed_by, "rival");
}

#[tokio::test]
async fn test_runner_losing_rank_at_commit_stops() {
    let memory = MemoryDatabase::new().with_table("public", "b");
    let db = runner("second");
    db.ensure_history_table(&memory).await.unwrap();
    let racing = RacingProvider::new(&memory, 7);

    let err = db
        .apply_migration_with_rank(&racing, &data_unit("7", "b"), Some(7))
        .await
        .unwrap_err();

    match &err {
        DsqlError::Conflict { rank, statements_committed, message, .. } => {
            assert_eq!(*rank, 7);
            assert_eq!(*statements_committed, 1);
            assert!(message.contains("OC000"));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert!(err.is_write_conflict());
    assert_lost_at_commit(&memory);
}

#[tokio::test]
async fn test_lock_and_restore_hooks_are_silent() {
    let memory = MemoryDatabase::new();
    let db = runner("admin");
    let mut conn = memory.connect();

    for _ in 0..3 {
        db.restore_original_state(&mut conn).await.unwrap();
    }
    let value = db
        .with_lock("installed_rank = 1", || async { Ok::<_, DsqlError>("ran") })
        .await
        .unwrap();

    assert_eq!(value, "ran");
    assert!(db.lock("success = false").await.is_ok());
    assert!(memory.statements().is_empty());
}

#[tokio::test]
async fn test_failure_reports_position_and_progress() {
    let memory = MemoryDatabase::new();
    let db = runner("admin");
    db.ensure_history_table(&memory).await.unwrap();
    memory.fail_on_with("orders_idx", "42703", "column \"missing\" does not exist");

    let unit = MigrationUnit::from_sql(
        Some("3".to_string()),
        "orders",
        "V3__orders.sql",
        "CREATE TABLE orders (id INT PRIMARY KEY);\n\
         CREATE INDEX ASYNC orders_idx ON orders (missing);",
    );
    let err = db.apply_migration(&memory, &unit).await.unwrap_err();

    match &err {
        DsqlError::PartialApplication { groups_committed, source, .. } => {
            assert_eq!(*groups_committed, 1);
            match source.as_ref() {
                DsqlError::StatementExecution { group_index, position, statement, .. } => {
                    assert_eq!(*group_index, 1);
                    assert_eq!(*position, 0);
                    assert!(statement.contains("orders_idx"));
                }
                other => panic!("unexpected source: {:?}", other),
            }
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.sqlstate(), Some("42703"));
    assert!(memory.has_object("public", "orders"));
    assert!(memory.history_ranks("public", "schema_history").is_empty());
}
