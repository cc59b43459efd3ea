//! The cluster membership authorization interface.

use async_trait::async_trait;

use crate::NodeId;

/// A hook consulted by the leader before a new node is brought into the cluster.
///
/// This is where an application enforces its admission policy — certificate checks, pre-shared
/// keys, allow lists. The core does not interpret credentials; it only acts on the verdict. A
/// refusal fails the admin command with `ChangeConfigError::NotAuthorized` before any
/// replication state is created for the target.
#[async_trait]
pub trait MembershipAuthorizer: Send + Sync + 'static {
    /// Decide whether the target node may join the cluster.
    async fn authorize(&self, id: NodeId) -> bool;
}

/// The default authorization policy: admit every node.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl MembershipAuthorizer for AcceptAll {
    async fn authorize(&self, _id: NodeId) -> bool {
        true
    }
}
