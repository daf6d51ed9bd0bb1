use elif_dsql::{
    CleanReport, DatabaseConnection, DsqlConfig, DsqlDatabase, DsqlError, MemoryDatabase,
    MigrationDatabase, SchemaCleaner, SchemaObjectKind,
};

fn drops(memory: &MemoryDatabase) -> Vec<String> {
    memory
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("DROP"))
        .collect()
}

#[tokio::test]
async fn test_view_is_dropped_before_its_table() {
    let memory = MemoryDatabase::new()
        .with_table("public", "t")
        .with_view("public", "v", &["t"]);
    let db = DsqlDatabase::new(&DsqlConfig::default());

    let report = db.clean_schema(&memory).await.unwrap();

    assert_eq!(report, CleanReport { views_dropped: 1, tables_dropped: 1 });
    assert_eq!(
        drops(&memory),
        vec!["DROP VIEW IF EXISTS \"public\".\"v\"", "DROP TABLE IF EXISTS \"public\".\"t\""]
    );
}

#[tokio::test]
async fn test_clean_empties_the_schema_and_is_idempotent() {
    let memory = MemoryDatabase::new()
        .with_table("app", "orders")
        .with_table("app", "customers")
        .with_view("app", "order_totals", &["orders"])
        .with_view("app", "vip_customers", &["customers", "orders"])
        .with_table("other", "keep_me");
    let db = DsqlDatabase::new(&DsqlConfig {
        schema: "app".to_string(),
        ..DsqlConfig::default()
    });

    let first = db.clean_schema(&memory).await.unwrap();
    assert_eq!(first, CleanReport { views_dropped: 2, tables_dropped: 2 });

    let mut conn = memory.connect();
    let inventory = SchemaCleaner::new().inventory(&mut conn, "app").await.unwrap();
    assert!(inventory.is_empty());
    assert!(memory.has_object("other", "keep_me"));

    let second = db.clean_schema(&memory).await.unwrap();
    assert_eq!(second, CleanReport::default());

    let log = drops(&memory);
    let last_view = log.iter().rposition(|s| s.starts_with("DROP VIEW")).unwrap();
    let first_table = log.iter().position(|s| s.starts_with("DROP TABLE")).unwrap();
    assert!(last_view < first_table);
}

#[tokio::test]
async fn test_drops_tolerate_objects_already_gone() {
    let memory = MemoryDatabase::new().with_table("public", "t");
    let mut conn = memory.connect();

    conn.execute("DROP TABLE IF EXISTS \"public\".\"t\"", &[]).await.unwrap();
    conn.execute("DROP TABLE IF EXISTS \"public\".\"t\"", &[]).await.unwrap();
    conn.execute("DROP VIEW IF EXISTS \"public\".\"never_existed\"", &[]).await.unwrap();

    assert!(memory.object_names("public", SchemaObjectKind::Table).is_empty());
}

#[tokio::test]
async fn test_failed_drop_keeps_earlier_drops_and_restores_autocommit() {
    let memory = MemoryDatabase::new()
        .with_table("public", "t")
        .with_view("public", "a_view", &["t"])
        .with_view("public", "b_view", &["t"]);
    memory.fail_on_with("\"b_view\"", "42501", "must be owner of view b_view");
    let db = DsqlDatabase::new(&DsqlConfig::default());

    let mut conn = memory.connect();
    conn.set_autocommit(false).await.unwrap();
    let err = db.clean(&mut conn).await.unwrap_err();

    match &err {
        DsqlError::CleanupObject { kind, object, dropped, message } => {
            assert_eq!(*kind, SchemaObjectKind::View);
            assert_eq!(object, "\"public\".\"b_view\"");
            assert_eq!(*dropped, 1);
            assert_eq!(message, "must be owner of view b_view");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert!(!conn.autocommit());
    assert!(!memory.has_object("public", "a_view"));
    assert!(memory.has_object("public", "b_view"));
    assert!(memory.has_object("public", "t"));
    assert!(!drops(&memory).iter().any(|s| s.starts_with("DROP TABLE")));
}
