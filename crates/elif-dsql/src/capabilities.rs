//! Backend capability descriptor
//!
//! Static facts about the target backend. Components read these instead of
//! checking which backend they run against.

use serde::{Deserialize, Serialize};

/// Transactional capabilities of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_ddl_in_transaction: bool,
    pub supports_advisory_lock: bool,
    pub max_ddl_statements_per_transaction: usize,
    pub allows_ddl_and_dml_in_same_transaction: bool,
    /// Whether the session role can change after connect and needs restoring
    pub mutable_session_role: bool,
}

/// Aurora DSQL: one DDL per transaction, no DDL/DML mixing, optimistic
/// concurrency instead of locks, role fixed by IAM authentication
pub const AURORA_DSQL: BackendCapabilities = BackendCapabilities {
    supports_ddl_in_transaction: false,
    supports_advisory_lock: false,
    max_ddl_statements_per_transaction: 1,
    allows_ddl_and_dml_in_same_transaction: false,
    mutable_session_role: false,
};

impl BackendCapabilities {
    /// Whether a whole migration unit may run inside one transaction
    pub fn wraps_migration_in_single_transaction(&self) -> bool {
        self.supports_ddl_in_transaction && self.allows_ddl_and_dml_in_same_transaction
    }

    /// Whether migration DDL and the history write may share a connection and transaction
    pub fn use_single_connection(&self) -> bool {
        self.wraps_migration_in_single_transaction()
    }
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        AURORA_DSQL
    }
}
