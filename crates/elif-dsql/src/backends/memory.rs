//! In-memory backend implementation for dry runs and testing
//!
//! Models the parts of Aurora DSQL the adapter depends on: a catalog of views
//! and tables per schema, history rows keyed by rank, snapshot reads inside a
//! transaction, commit-time conflict detection, and the one-DDL-per-transaction
//! rule. Every statement sent to a connection is recorded, together with the
//! implicit `BEGIN`/`COMMIT`/`ROLLBACK` markers.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::core::*;
use crate::cleanup::SchemaObjectKind;
use crate::error::{
    DsqlError, DsqlResult, SQLSTATE_SERIALIZATION_FAILURE, SQLSTATE_UNIQUE_VIOLATION,
};
use crate::statement::StatementKind;

const SQLSTATE_FEATURE_NOT_SUPPORTED: &str = "0A000";
const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";
const SQLSTATE_DUPLICATE_TABLE: &str = "42P07";
const SQLSTATE_WRONG_OBJECT_TYPE: &str = "42809";
const SQLSTATE_DEPENDENT_OBJECTS: &str = "2BP01";
const SQLSTATE_INTERNAL_ERROR: &str = "XX000";

const DEFAULT_SCHEMA: &str = "public";

type ObjectKey = (String, String);
type HistoryRow = HashMap<String, DatabaseValue>;

#[derive(Debug, Clone)]
struct CatalogObject {
    kind: SchemaObjectKind,
    depends_on: Vec<ObjectKey>,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    objects: BTreeMap<ObjectKey, CatalogObject>,
    history: BTreeMap<ObjectKey, BTreeMap<i64, HistoryRow>>,
}

impl Catalog {
    fn names(&self, schema: &str, kind: SchemaObjectKind) -> Vec<String> {
        self.objects
            .iter()
            .filter(|((object_schema, _), object)| object_schema == schema && object.kind == kind)
            .map(|((_, name), _)| name.clone())
            .collect()
    }

    fn apply(&mut self, effect: &Effect) -> DsqlResult<u64> {
        match effect {
            Effect::Create {
                kind,
                key,
                if_not_exists,
                depends_on,
            } => {
                if self.objects.contains_key(key) {
                    if *if_not_exists {
                        return Ok(0);
                    }
                    return Err(DsqlError::database_with_code(
                        SQLSTATE_DUPLICATE_TABLE,
                        format!("relation \"{}\" already exists", key.1),
                    ));
                }
                self.objects.insert(
                    key.clone(),
                    CatalogObject {
                        kind: *kind,
                        depends_on: depends_on.clone(),
                    },
                );
                Ok(0)
            }
            Effect::Drop { kind, key, if_exists } => {
                let existing = match self.objects.get(key) {
                    Some(object) => object.kind,
                    None if *if_exists => return Ok(0),
                    None => {
                        return Err(DsqlError::database_with_code(
                            SQLSTATE_UNDEFINED_TABLE,
                            format!("{} \"{}\" does not exist", kind, key.1),
                        ))
                    }
                };
                if existing != *kind {
                    return Err(DsqlError::database_with_code(
                        SQLSTATE_WRONG_OBJECT_TYPE,
                        format!("\"{}\" is not a {}", key.1, kind),
                    ));
                }
                let has_dependents = self
                    .objects
                    .values()
                    .any(|object| object.depends_on.contains(key));
                if has_dependents {
                    return Err(DsqlError::database_with_code(
                        SQLSTATE_DEPENDENT_OBJECTS,
                        format!(
                            "cannot drop {} {} because other objects depend on it",
                            kind, key.1
                        ),
                    ));
                }
                self.objects.remove(key);
                self.history.remove(key);
                Ok(0)
            }
            Effect::Write { key } => {
                self.require_table(key)?;
                Ok(1)
            }
            Effect::HistoryInsert { key, row } => {
                self.require_table(key)?;
                let rank = row
                    .get("installed_rank")
                    .and_then(DatabaseValue::as_i64)
                    .ok_or_else(|| {
                        DsqlError::database_with_code(
                            "23502",
                            "null value in column \"installed_rank\" violates not-null constraint",
                        )
                    })?;
                let rows = self.history.entry(key.clone()).or_default();
                if rows.contains_key(&rank) {
                    return Err(DsqlError::database_with_code(
                        SQLSTATE_UNIQUE_VIOLATION,
                        format!(
                            "duplicate key value violates unique constraint \"{}_pkey\"",
                            key.1
                        ),
                    ));
                }
                let mut row = row.clone();
                row.entry("installed_on".to_string())
                    .or_insert_with(|| DatabaseValue::DateTime(Utc::now()));
                rows.insert(rank, row);
                Ok(1)
            }
            Effect::None => Ok(0),
        }
    }

    fn require_table(&self, key: &ObjectKey) -> DsqlResult<()> {
        match self.objects.get(key) {
            Some(object) if object.kind == SchemaObjectKind::Table => Ok(()),
            _ => Err(DsqlError::database_with_code(
                SQLSTATE_UNDEFINED_TABLE,
                format!("relation \"{}.{}\" does not exist", key.0, key.1),
            )),
        }
    }
}

/// Catalog change a statement makes once committed
#[derive(Debug, Clone)]
enum Effect {
    Create {
        kind: SchemaObjectKind,
        key: ObjectKey,
        if_not_exists: bool,
        depends_on: Vec<ObjectKey>,
    },
    Drop {
        kind: SchemaObjectKind,
        key: ObjectKey,
        if_exists: bool,
    },
    Write {
        key: ObjectKey,
    },
    HistoryInsert {
        key: ObjectKey,
        row: HistoryRow,
    },
    None,
}

#[derive(Debug, Clone)]
struct FailureRule {
    pattern: String,
    code: String,
    message: String,
}

#[derive(Debug, Default)]
struct SharedState {
    catalog: Catalog,
    log: Vec<String>,
    failures: Vec<FailureRule>,
}

/// Shared in-memory database; every connection acquired from it sees the same catalog
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<SharedState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table
    pub fn with_table(self, schema: &str, name: &str) -> Self {
        let effect = Effect::Create {
            kind: SchemaObjectKind::Table,
            key: (schema.to_string(), name.to_string()),
            if_not_exists: true,
            depends_on: Vec::new(),
        };
        let _ = self.state.lock().catalog.apply(&effect);
        self
    }

    /// Seed a view that depends on tables of the same schema
    pub fn with_view(self, schema: &str, name: &str, depends_on: &[&str]) -> Self {
        let effect = Effect::Create {
            kind: SchemaObjectKind::View,
            key: (schema.to_string(), name.to_string()),
            if_not_exists: true,
            depends_on: depends_on
                .iter()
                .map(|table| (schema.to_string(), table.to_string()))
                .collect(),
        };
        let _ = self.state.lock().catalog.apply(&effect);
        self
    }

    /// Fail every statement containing `pattern` with an internal error
    pub fn fail_on(&self, pattern: &str) {
        self.fail_on_with(pattern, SQLSTATE_INTERNAL_ERROR, "injected failure");
    }

    /// Fail every statement containing `pattern` with the given SQLSTATE and message
    pub fn fail_on_with(&self, pattern: &str, code: &str, message: &str) {
        self.state.lock().failures.push(FailureRule {
            pattern: pattern.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Every statement and transaction marker received so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn clear_statements(&self) {
        self.state.lock().log.clear();
    }

    /// Committed object names of one kind in a schema, sorted
    pub fn object_names(&self, schema: &str, kind: SchemaObjectKind) -> Vec<String> {
        self.state.lock().catalog.names(schema, kind)
    }

    pub fn has_object(&self, schema: &str, name: &str) -> bool {
        self.state
            .lock()
            .catalog
            .objects
            .contains_key(&(schema.to_string(), name.to_string()))
    }

    /// Committed history ranks of a table, ascending
    pub fn history_ranks(&self, schema: &str, table: &str) -> Vec<i64> {
        self.state
            .lock()
            .catalog
            .history
            .get(&(schema.to_string(), table.to_string()))
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Open a connection directly, without the provider trait
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            state: Arc::clone(&self.state),
            autocommit: true,
            tx: None,
        }
    }
}

#[async_trait]
impl ConnectionProvider for MemoryDatabase {
    async fn acquire(&self) -> DsqlResult<Box<dyn DatabaseConnection>> {
        Ok(Box::new(self.connect()))
    }
}

#[derive(Debug)]
struct OpenTransaction {
    snapshot: Catalog,
    effects: Vec<Effect>,
    ddl_statements: usize,
    dml_statements: usize,
}

/// Connection to a [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<Mutex<SharedState>>,
    autocommit: bool,
    tx: Option<OpenTransaction>,
}

impl MemoryConnection {
    fn begin_if_needed(&mut self, state: &mut SharedState) {
        if !self.autocommit && self.tx.is_none() {
            state.log.push("BEGIN".to_string());
            self.tx = Some(OpenTransaction {
                snapshot: state.catalog.clone(),
                effects: Vec::new(),
                ddl_statements: 0,
                dml_statements: 0,
            });
        }
    }

    fn commit_open(&mut self, state: &mut SharedState) -> DsqlResult<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        state.log.push("COMMIT".to_string());

        let mut catalog = state.catalog.clone();
        for effect in &tx.effects {
            if catalog.apply(effect).is_err() {
                return Err(DsqlError::database_with_code(
                    SQLSTATE_SERIALIZATION_FAILURE,
                    "change conflicts with another transaction, please retry: (OC000)",
                ));
            }
        }
        state.catalog = catalog;
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DsqlResult<u64> {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock();
        self.begin_if_needed(&mut state);
        state.log.push(sql.to_string());
        check_failures(&state, sql)?;

        let effect = parse_effect(sql, params)?;
        let kind = StatementKind::classify(sql);

        match self.tx.as_mut() {
            Some(tx) => {
                if kind.is_ddl() && tx.ddl_statements > 0 {
                    return Err(DsqlError::database_with_code(
                        SQLSTATE_FEATURE_NOT_SUPPORTED,
                        "multiple ddl statements are not supported in a transaction",
                    ));
                }
                let mixes = if kind.is_ddl() {
                    tx.dml_statements > 0
                } else {
                    tx.ddl_statements > 0
                };
                if mixes {
                    return Err(DsqlError::database_with_code(
                        SQLSTATE_FEATURE_NOT_SUPPORTED,
                        "ddl and dml are not supported in the same transaction",
                    ));
                }

                let affected = tx.snapshot.apply(&effect)?;
                if kind.is_ddl() {
                    tx.ddl_statements += 1;
                } else {
                    tx.dml_statements += 1;
                }
                tx.effects.push(effect);
                Ok(affected)
            }
            None => state.catalog.apply(&effect),
        }
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DsqlResult<Vec<DatabaseRow>> {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock();
        self.begin_if_needed(&mut state);
        state.log.push(sql.to_string());
        check_failures(&state, sql)?;

        let catalog = match self.tx.as_ref() {
            Some(tx) => &tx.snapshot,
            None => &state.catalog,
        };
        answer_query(catalog, sql, params)
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> DsqlResult<()> {
        if autocommit && !self.autocommit {
            let shared = Arc::clone(&self.state);
            let mut state = shared.lock();
            self.commit_open(&mut state)?;
        }
        self.autocommit = autocommit;
        Ok(())
    }

    async fn commit(&mut self) -> DsqlResult<()> {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock();
        self.commit_open(&mut state)
    }

    async fn rollback(&mut self) -> DsqlResult<()> {
        if self.tx.take().is_some() {
            self.state.lock().log.push("ROLLBACK".to_string());
        }
        Ok(())
    }
}

fn check_failures(state: &SharedState, sql: &str) -> DsqlResult<()> {
    match state.failures.iter().find(|rule| sql.contains(&rule.pattern)) {
        Some(rule) => Err(DsqlError::database_with_code(
            rule.code.clone(),
            rule.message.clone(),
        )),
        None => Ok(()),
    }
}

/// Answer the introspection and history queries the adapter issues
fn answer_query(
    catalog: &Catalog,
    sql: &str,
    params: &[DatabaseValue],
) -> DsqlResult<Vec<DatabaseRow>> {
    let lower = sql.to_ascii_lowercase();
    let schema_param = params.first().and_then(DatabaseValue::as_str).unwrap_or(DEFAULT_SCHEMA);

    if lower.contains("information_schema.views") {
        return Ok(name_rows(catalog.names(schema_param, SchemaObjectKind::View)));
    }

    if lower.contains("information_schema.tables") {
        if let Some(table) = params.get(1).and_then(DatabaseValue::as_str) {
            let key = (schema_param.to_string(), table.to_string());
            let exists = catalog
                .objects
                .get(&key)
                .map_or(false, |object| object.kind == SchemaObjectKind::Table);
            return Ok(if exists {
                vec![DatabaseRow::new(vec!["exists".to_string()], vec![DatabaseValue::Int32(1)])]
            } else {
                Vec::new()
            });
        }
        return Ok(name_rows(catalog.names(schema_param, SchemaObjectKind::Table)));
    }

    let Some(from) = find_keyword(&lower, "from") else {
        return Ok(Vec::new());
    };
    let Some((key, _)) = parse_object_name(&sql[from + "from".len()..]) else {
        return Ok(Vec::new());
    };
    catalog.require_table(&key)?;
    let rows = catalog.history.get(&key);

    if lower.contains("max(") {
        let next = rows
            .and_then(|rows| rows.keys().next_back().copied())
            .unwrap_or(0)
            + 1;
        let next = i32::try_from(next)
            .map_err(|_| DsqlError::database("installed_rank out of range"))?;
        return Ok(vec![DatabaseRow::new(
            vec!["?column?".to_string()],
            vec![DatabaseValue::Int32(next)],
        )]);
    }

    let select = lower.find("select").map_or(0, |i| i + "select".len());
    let columns: Vec<String> = sql[select..from]
        .split(',')
        .map(|column| column.trim().trim_matches('"').to_ascii_lowercase())
        .filter(|column| !column.is_empty())
        .collect();

    Ok(rows
        .into_iter()
        .flat_map(|rows| rows.values())
        .map(|row| {
            let values = columns
                .iter()
                .map(|column| {
                    row.get(column)
                        .cloned()
                        .unwrap_or(DatabaseValue::Null(SqlType::Text))
                })
                .collect();
            DatabaseRow::new(columns.clone(), values)
        })
        .collect())
}

fn name_rows(names: Vec<String>) -> Vec<DatabaseRow> {
    names
        .into_iter()
        .map(|name| {
            DatabaseRow::new(vec!["table_name".to_string()], vec![DatabaseValue::String(name)])
        })
        .collect()
}

/// Work out what a statement does to the catalog
fn parse_effect(sql: &str, params: &[DatabaseValue]) -> DsqlResult<Effect> {
    let unparsable = || DsqlError::database_with_code("42601", format!("syntax error in: {}", sql));

    if let Some(rest) = take_keyword(sql, "DROP") {
        let Some((kind, rest)) = take_object_kind(rest) else {
            return Ok(Effect::None);
        };
        let if_exists = take_keyword(rest, "IF").and_then(|r| take_keyword(r, "EXISTS"));
        let (if_exists, rest) = match if_exists {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let (key, _) = parse_object_name(rest).ok_or_else(unparsable)?;
        return Ok(Effect::Drop { kind, key, if_exists });
    }

    if let Some(rest) = take_keyword(sql, "CREATE") {
        let rest = take_keyword(rest, "OR")
            .and_then(|r| take_keyword(r, "REPLACE"))
            .unwrap_or(rest);
        let Some((kind, rest)) = take_object_kind(rest) else {
            return Ok(Effect::None);
        };
        let (if_not_exists, rest) = match take_keyword(rest, "IF")
            .and_then(|r| take_keyword(r, "NOT"))
            .and_then(|r| take_keyword(r, "EXISTS"))
        {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let (key, body) = parse_object_name(rest).ok_or_else(unparsable)?;
        let depends_on = match kind {
            SchemaObjectKind::View => referenced_tables(body),
            SchemaObjectKind::Table => Vec::new(),
        };
        return Ok(Effect::Create {
            kind,
            key,
            if_not_exists,
            depends_on,
        });
    }

    if let Some(rest) = take_keyword(sql, "INSERT").and_then(|r| take_keyword(r, "INTO")) {
        let (key, rest) = parse_object_name(rest).ok_or_else(unparsable)?;
        let columns = column_list(rest);
        if columns.iter().any(|column| column == "installed_rank") {
            let row = columns.into_iter().zip(params.iter().cloned()).collect();
            return Ok(Effect::HistoryInsert { key, row });
        }
        return Ok(Effect::Write { key });
    }

    Ok(Effect::None)
}

fn take_object_kind(s: &str) -> Option<(SchemaObjectKind, &str)> {
    if let Some(rest) = take_keyword(s, "VIEW") {
        Some((SchemaObjectKind::View, rest))
    } else {
        take_keyword(s, "TABLE").map(|rest| (SchemaObjectKind::Table, rest))
    }
}

/// Strip a case-insensitive leading keyword followed by a word boundary
fn take_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let s = s.trim_start();
    let head = s.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &s[keyword.len()..];
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() || c == '(' || c == '"' => Some(rest.trim_start()),
        _ => None,
    }
}

/// Byte offset of a standalone keyword in lowercased SQL
fn find_keyword(lower: &str, keyword: &str) -> Option<usize> {
    lower.match_indices(keyword).map(|(i, _)| i).find(|&i| {
        let before = lower[..i].chars().next_back();
        let after = lower[i + keyword.len()..].chars().next();
        before.map_or(true, char::is_whitespace) && after.map_or(true, char::is_whitespace)
    })
}

fn parse_identifier(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    if let Some(body) = s.strip_prefix('"') {
        let mut ident = String::new();
        let mut chars = body.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c != '"' {
                ident.push(c);
            } else if matches!(chars.peek(), Some((_, '"'))) {
                chars.next();
                ident.push('"');
            } else {
                return Some((ident, &body[i + 1..]));
            }
        }
        None
    } else {
        let end = s
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
            .unwrap_or(s.len());
        if end == 0 {
            return None;
        }
        Some((s[..end].to_lowercase(), &s[end..]))
    }
}

/// Parse `name` or `schema.name`, unquoted parts folded to lower case
fn parse_object_name(s: &str) -> Option<(ObjectKey, &str)> {
    let (first, rest) = parse_identifier(s)?;
    match rest.strip_prefix('.') {
        Some(after_dot) => {
            let (second, rest) = parse_identifier(after_dot)?;
            Some(((first, second), rest))
        }
        None => Some(((DEFAULT_SCHEMA.to_string(), first), rest)),
    }
}

fn column_list(s: &str) -> Vec<String> {
    let s = s.trim_start();
    let Some(body) = s.strip_prefix('(') else {
        return Vec::new();
    };
    let Some(end) = body.find(')') else {
        return Vec::new();
    };
    body[..end]
        .split(',')
        .filter_map(|column| parse_identifier(column).map(|(name, _)| name))
        .collect()
}

/// Tables named after FROM or JOIN in a view body
fn referenced_tables(body: &str) -> Vec<ObjectKey> {
    let upper = body.to_ascii_uppercase();
    let mut tables = Vec::new();
    for keyword in ["FROM", "JOIN"] {
        for (i, _) in upper.match_indices(keyword) {
            let before = upper[..i].chars().next_back();
            let after = upper[i + keyword.len()..].chars().next();
            if !before.map_or(true, char::is_whitespace)
                || !after.map_or(false, char::is_whitespace)
            {
                continue;
            }
            if let Some((key, _)) = parse_object_name(&body[i + keyword.len()..]) {
                if !tables.contains(&key) {
                    tables.push(key);
                }
            }
        }
    }
    tables
}
