//! Statement Partitioner
//!
//! Splits a migration unit into transaction groups the backend accepts. Each
//! DDL statement is committed alone, consecutive DML statements share a group,
//! and the history insert always runs last in a group of its own.

use serde::{Deserialize, Serialize};

use crate::capabilities::BackendCapabilities;
use crate::statement::Statement;

/// What a transaction group changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupScope {
    Schema,
    Data,
}

impl std::fmt::Display for GroupScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupScope::Schema => write!(f, "schema"),
            GroupScope::Data => write!(f, "data"),
        }
    }
}

/// Statements executed and committed together
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionGroup {
    scope: GroupScope,
    statements: Vec<Statement>,
    history: bool,
}

impl TransactionGroup {
    fn new(scope: GroupScope) -> Self {
        Self {
            scope,
            statements: Vec::new(),
            history: false,
        }
    }

    /// Final group holding only the history insert
    pub fn history_insert(statement: Statement) -> Self {
        Self {
            scope: GroupScope::Data,
            statements: vec![statement],
            history: true,
        }
    }

    pub fn scope(&self) -> GroupScope {
        self.scope
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Whether this group records the unit in the history table
    pub fn is_history(&self) -> bool {
        self.history
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    fn ddl_count(&self) -> usize {
        self.statements.iter().filter(|s| s.is_ddl()).count()
    }

    fn dml_count(&self) -> usize {
        self.statements.len() - self.ddl_count()
    }
}

/// Builds backend-legal transaction groups from the capability descriptor
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    capabilities: BackendCapabilities,
}

impl Partitioner {
    pub fn new(capabilities: BackendCapabilities) -> Self {
        Self { capabilities }
    }

    fn ddl_limit(&self) -> usize {
        if self.capabilities.supports_ddl_in_transaction {
            self.capabilities.max_ddl_statements_per_transaction.max(1)
        } else {
            1
        }
    }

    /// Partition a unit's statements, appending `history_insert` as the final group
    pub fn partition(
        &self,
        statements: &[Statement],
        history_insert: Statement,
    ) -> Vec<TransactionGroup> {
        let mut groups = self.partition_statements(statements);
        groups.push(TransactionGroup::history_insert(history_insert));
        groups
    }

    /// Partition a unit's own statements, without the history group
    pub fn partition_statements(&self, statements: &[Statement]) -> Vec<TransactionGroup> {
        let mut groups = Vec::new();
        let mut open: Option<TransactionGroup> = None;
        let mixing = self.capabilities.allows_ddl_and_dml_in_same_transaction;

        for statement in statements {
            let fits = match &open {
                Some(group) if statement.is_ddl() => {
                    group.ddl_count() < self.ddl_limit() && (mixing || group.dml_count() == 0)
                }
                Some(group) => mixing || group.ddl_count() == 0,
                None => false,
            };

            if !fits {
                groups.extend(open.take());
            }

            let group = open.get_or_insert_with(|| {
                TransactionGroup::new(if statement.is_ddl() {
                    GroupScope::Schema
                } else {
                    GroupScope::Data
                })
            });
            if statement.is_ddl() {
                group.scope = GroupScope::Schema;
            }
            group.statements.push(statement.clone());
        }

        groups.extend(open);
        groups
    }

    /// Whether the backend accepts the group as one transaction
    pub fn is_legal(&self, group: &TransactionGroup) -> bool {
        let ddl = group.ddl_count();
        let dml = group.dml_count();

        if group.is_empty() || ddl > self.ddl_limit() {
            return false;
        }
        if ddl > 0 && dml > 0 && !self.capabilities.allows_ddl_and_dml_in_same_transaction {
            return false;
        }
        !(group.history && ddl > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::AURORA_DSQL;

    fn history() -> Statement {
        Statement::dml("INSERT INTO history VALUES (1)")
    }

    fn sql(group: &TransactionGroup) -> Vec<&str> {
        group.statements().iter().map(|s| s.sql()).collect()
    }

    #[test]
    fn test_create_then_inserts_make_three_groups() {
        let statements = vec![
            Statement::ddl("CREATE TABLE t (id INT)"),
            Statement::dml("INSERT INTO t VALUES (1)"),
            Statement::dml("INSERT INTO t VALUES (2)"),
        ];
        let groups = Partitioner::new(AURORA_DSQL).partition(&statements, history());

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].scope(), GroupScope::Schema);
        assert_eq!(sql(&groups[0]), vec!["CREATE TABLE t (id INT)"]);
        assert_eq!(groups[1].scope(), GroupScope::Data);
        assert_eq!(sql(&groups[1]), vec!["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"]);
        assert!(groups[2].is_history());
        assert!(!groups[1].is_history());
    }

    #[test]
    fn test_ddl_flushes_open_dml_group() {
        let statements = vec![
            Statement::dml("INSERT INTO a VALUES (1)"),
            Statement::ddl("CREATE TABLE b (id INT)"),
            Statement::ddl("CREATE INDEX ASYNC b_idx ON b (id)"),
            Statement::dml("INSERT INTO b VALUES (1)"),
            Statement::dml("UPDATE b SET id = 2"),
        ];
        let partitioner = Partitioner::new(AURORA_DSQL);
        let groups = partitioner.partition(&statements, history());

        let shapes: Vec<(GroupScope, usize)> =
            groups.iter().map(|g| (g.scope(), g.len())).collect();
        assert_eq!(
            shapes,
            vec![
                (GroupScope::Data, 1),
                (GroupScope::Schema, 1),
                (GroupScope::Schema, 1),
                (GroupScope::Data, 2),
                (GroupScope::Data, 1),
            ]
        );
        assert!(groups.iter().all(|g| partitioner.is_legal(g)));
    }

    #[test]
    fn test_group_counts_for_any_mix() {
        let partitioner = Partitioner::new(AURORA_DSQL);
        let patterns = ["", "D", "M", "DDD", "MMM", "DMD", "MDM", "DMMDMMM", "MMDDMM"];

        for pattern in patterns {
            let statements: Vec<Statement> = pattern
                .chars()
                .map(|c| match c {
                    'D' => Statement::ddl("CREATE TABLE x (id INT)"),
                    _ => Statement::dml("INSERT INTO x VALUES (1)"),
                })
                .collect();
            let groups = partitioner.partition(&statements, history());

            let ddl_groups = groups.iter().filter(|g| g.scope() == GroupScope::Schema).count();
            assert_eq!(ddl_groups, pattern.matches('D').count(), "pattern {}", pattern);
            assert!(groups
                .iter()
                .filter(|g| g.scope() == GroupScope::Schema)
                .all(|g| g.len() == 1));
            assert!(groups.iter().all(|g| partitioner.is_legal(g)), "pattern {}", pattern);
            assert_eq!(groups.iter().filter(|g| g.is_history()).count(), 1);
            assert!(groups.last().map_or(false, TransactionGroup::is_history));

            let total: usize = groups.iter().map(TransactionGroup::len).sum();
            assert_eq!(total, pattern.len() + 1);
        }
    }

    #[test]
    fn test_empty_unit_only_records_history() {
        let groups = Partitioner::new(AURORA_DSQL).partition(&[], history());
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_history());
    }

    #[test]
    fn test_transactional_backend_merges_everything_but_history() {
        let caps = BackendCapabilities {
            supports_ddl_in_transaction: true,
            supports_advisory_lock: true,
            max_ddl_statements_per_transaction: usize::MAX,
            allows_ddl_and_dml_in_same_transaction: true,
            mutable_session_role: true,
        };
        let statements = vec![
            Statement::ddl("CREATE TABLE t (id INT)"),
            Statement::dml("INSERT INTO t VALUES (1)"),
            Statement::ddl("ALTER TABLE t ADD COLUMN c TEXT"),
        ];
        let groups = Partitioner::new(caps).partition(&statements, history());

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[0].scope(), GroupScope::Schema);
    }

    #[test]
    fn test_illegal_groups_are_detected() {
        let partitioner = Partitioner::new(AURORA_DSQL);
        let mut group = TransactionGroup::new(GroupScope::Schema);
        group.statements.push(Statement::ddl("CREATE TABLE a (id INT)"));
        group.statements.push(Statement::dml("INSERT INTO a VALUES (1)"));
        assert!(!partitioner.is_legal(&group));

        assert!(!partitioner.is_legal(&TransactionGroup::new(GroupScope::Data)));
    }
}
