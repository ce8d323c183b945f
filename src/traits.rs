//! External collaborator traits
//!
//! The subsystem never decides business authorization and never persists
//! messages itself; both concerns are delegated through these seams.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Room-join authorization, answered by the platform's policy layer.
///
/// The subsystem enforces whatever answer it receives; it does not second-
/// guess tenancy or role rules beyond the rooms it derives from the trusted
/// identity itself.
#[async_trait]
pub trait JoinPolicy: Send + Sync + 'static {
    async fn can_join(&self, user_id: &str, role: &str, tenant_id: &str, room_id: &str) -> bool;
}

/// Permits every join. For tests and single-tenant development setups.
pub struct AllowAll;

#[async_trait]
impl JoinPolicy for AllowAll {
    async fn can_join(&self, _user_id: &str, _role: &str, _tenant_id: &str, _room_id: &str) -> bool {
        true
    }
}

/// Pre-dispatch persistence hook for message-kind events.
///
/// Called before fan-out; dispatch itself never blocks on a database write
/// beyond this call, and failures here abort the send (the client is told)
/// rather than producing a broadcast nobody can reload from history.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn persist(&self, room_id: &str, user_id: &str, payload: &Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all_permits_everything() {
        let policy = AllowAll;
        assert!(policy.can_join("user-1", "student", "tenant-1", "conv:7").await);
    }
}
