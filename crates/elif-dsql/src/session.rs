//! Session state shim
//!
//! Aurora DSQL binds role and privileges to the IAM identity at connect time,
//! so a pooled connection never carries session state that needs resetting.

use tracing::debug;

use crate::capabilities::BackendCapabilities;
use crate::error::DsqlResult;

/// Replacement for the engine's "restore original connection state" step
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStateShim;

impl SessionStateShim {
    pub fn new() -> Self {
        Self
    }

    /// Never sends a statement, not even a check.
    pub fn restore(&self) -> DsqlResult<()> {
        debug!("Session state restore skipped: role is fixed at connect time");
        Ok(())
    }

    /// Whether the backend needs a real restore step
    pub fn required(capabilities: &BackendCapabilities) -> bool {
        capabilities.mutable_session_role
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::AURORA_DSQL;

    #[test]
    fn test_restore_is_a_no_op() {
        assert!(SessionStateShim::new().restore().is_ok());
        assert!(!SessionStateShim::required(&AURORA_DSQL));
    }
}
