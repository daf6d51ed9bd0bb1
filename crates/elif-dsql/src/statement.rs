//! Migration Units and Tagged Statements
//!
//! A migration unit is the ordered list of statements the engine considers one
//! logical change. Each statement is tagged DDL or DML; the tag drives how the
//! partitioner builds transaction groups. Scripts can be split and tagged
//! here, but statement text is never rewritten.

use serde::{Deserialize, Serialize};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Location, Token, Tokenizer};
use tracing::warn;

use crate::backends::DatabaseValue;

/// Statement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    /// Schema-altering statement (create/alter/drop object)
    Ddl,
    /// Data statement (insert/update/delete/select)
    Dml,
}

impl StatementKind {
    /// Classify a single statement by its leading keyword
    pub fn classify(sql: &str) -> Self {
        let dialect = PostgreSqlDialect {};
        match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => tokens
                .iter()
                .find_map(|token| match token {
                    Token::Word(word) => Some(Self::from_keyword(word.keyword)),
                    Token::Whitespace(_) | Token::LParen => None,
                    _ => Some(StatementKind::Dml),
                })
                .unwrap_or(StatementKind::Dml),
            Err(_) => Self::classify_naive(sql),
        }
    }

    fn from_keyword(keyword: Keyword) -> Self {
        match keyword {
            Keyword::CREATE
            | Keyword::ALTER
            | Keyword::DROP
            | Keyword::TRUNCATE
            | Keyword::COMMENT
            | Keyword::GRANT
            | Keyword::REVOKE => StatementKind::Ddl,
            _ => StatementKind::Dml,
        }
    }

    fn classify_naive(sql: &str) -> Self {
        let first = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match first.as_str() {
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "COMMENT" | "GRANT" | "REVOKE" => {
                StatementKind::Ddl
            }
            _ => StatementKind::Dml,
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self, StatementKind::Ddl)
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatementKind::Ddl => write!(f, "DDL"),
            StatementKind::Dml => write!(f, "DML"),
        }
    }
}

/// A single tagged statement with optional bind parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    kind: StatementKind,
    params: Vec<DatabaseValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, kind: StatementKind) -> Self {
        Self {
            sql: sql.into(),
            kind,
            params: Vec::new(),
        }
    }

    pub fn ddl(sql: impl Into<String>) -> Self {
        Self::new(sql, StatementKind::Ddl)
    }

    pub fn dml(sql: impl Into<String>) -> Self {
        Self::new(sql, StatementKind::Dml)
    }

    /// Tag the statement by inspecting its leading keyword
    pub fn classified(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let kind = StatementKind::classify(&sql);
        Self::new(sql, kind)
    }

    pub fn with_params(mut self, params: Vec<DatabaseValue>) -> Self {
        self.params = params;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn params(&self) -> &[DatabaseValue] {
        &self.params
    }

    pub fn is_ddl(&self) -> bool {
        self.kind.is_ddl()
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// Versioned or repeatable migration, immutable once loaded
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationUnit {
    version: Option<String>,
    description: String,
    checksum: Option<i32>,
    script: String,
    statements: Vec<Statement>,
}

impl MigrationUnit {
    pub fn new(
        version: Option<String>,
        description: impl Into<String>,
        script: impl Into<String>,
        statements: Vec<Statement>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            checksum: None,
            script: script.into(),
            statements,
        }
    }

    /// Build a unit from script text, splitting and tagging its statements
    pub fn from_sql(
        version: Option<String>,
        description: impl Into<String>,
        script: impl Into<String>,
        sql: &str,
    ) -> Self {
        Self::new(version, description, script, split_statements(sql))
    }

    /// Attach the checksum computed by the engine
    pub fn with_checksum(mut self, checksum: Option<i32>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn checksum(&self) -> Option<i32> {
        self.checksum
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Repeatable units carry no version
    pub fn is_repeatable(&self) -> bool {
        self.version.is_none()
    }
}

/// Split a script into tagged statements at top-level semicolons.
///
/// Semicolons inside string literals, quoted identifiers, comments and
/// dollar-quoted bodies do not split. Comment-only fragments are dropped.
pub fn split_statements(sql: &str) -> Vec<Statement> {
    let dialect = PostgreSqlDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("SQL tokenizing failed, using naive semicolon splitting: {}", e);
            return split_naive(sql);
        }
    };

    let line_starts = line_starts(sql);
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_content = false;

    for token in &tokens {
        match &token.token {
            Token::SemiColon => {
                let Some(end) = byte_offset(sql, &line_starts, &token.location) else {
                    warn!("Unable to locate statement boundary, using naive semicolon splitting");
                    return split_naive(sql);
                };
                if has_content {
                    statements.push(Statement::classified(sql[start..end].trim()));
                }
                start = end + 1;
                has_content = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => has_content = true,
        }
    }

    if has_content {
        statements.push(Statement::classified(sql[start..].trim()));
    }

    statements
}

fn split_naive(sql: &str) -> Vec<Statement> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Statement::classified)
        .collect()
}

fn line_starts(sql: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Byte offset of a 1-based line/column (columns count characters)
fn byte_offset(sql: &str, line_starts: &[usize], location: &Location) -> Option<usize> {
    let line = usize::try_from(location.line.checked_sub(1)?).ok()?;
    let column = usize::try_from(location.column.checked_sub(1)?).ok()?;
    let start = *line_starts.get(line)?;
    sql[start..]
        .char_indices()
        .nth(column)
        .map(|(offset, _)| start + offset)
}
