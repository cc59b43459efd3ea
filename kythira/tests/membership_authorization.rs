mod fixtures;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kythira::async_trait::async_trait;
use kythira::error::ChangeConfigError;
use kythira::error::ResponseError;
use kythira::Config;
use kythira::MembershipAuthorizer;
use kythira::NodeId;
use maplit::btreeset;

use fixtures::RaftRouter;

/// An admission policy refusing a fixed set of nodes.
struct DenyList {
    denied: BTreeSet<NodeId>,
}

#[async_trait]
impl MembershipAuthorizer for DenyList {
    async fn authorize(&self, id: NodeId) -> bool {
        !self.denied.contains(&id)
    }
}

/// Membership authorization test.
///
/// What does this test do?
///
/// - brings up a leader whose admission policy refuses node 2.
/// - asserts an authorized node joins normally.
/// - asserts the refused node is rejected with `NotAuthorized` before any syncing begins.
///
/// RUST_LOG=kythira,memstore,membership_authorization=trace cargo test -p kythira --test membership_authorization
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_authorization() -> Result<()> {
    fixtures::init_tracing();

    // Setup test dependencies.
    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router
        .new_raft_node_with_authorizer(0, Arc::new(DenyList { denied: btreeset![2] }))
        .await;
    router.initialize_with(0, btreeset![0]).await?;
    let mut want = 1;
    router.wait_for_log(&btreeset![0], want, Some(Duration::from_millis(1000)), "init").await?;

    tracing::info!("--- adding an authorized node");
    router.new_raft_node(1).await;
    router.add_non_voter(0, 1).await?;
    router.change_membership(0, btreeset![0, 1]).await?;
    want += 2;
    router.wait_for_log(&btreeset![0, 1], want, Some(Duration::from_millis(3000)), "add node 1").await?;

    tracing::info!("--- attempting to add a refused node");
    router.new_raft_node(2).await;
    let res = router.add_non_voter(0, 2).await;
    match res {
        Err(ResponseError::ChangeConfig(ChangeConfigError::NotAuthorized)) => (),
        other => panic!("expected NotAuthorized for the refused node, got {:?}", other),
    }

    // The refused node never received any replication: it is still pristine.
    let metrics = router.latest_metrics().await;
    let node2 = metrics.iter().find(|m| m.id == 2).unwrap();
    assert_eq!(node2.last_log_index, 0);
    assert_eq!(node2.current_term, 0);

    // The change_membership path enforces the same policy.
    let res = router.change_membership(0, btreeset![0, 1, 2]).await;
    match res {
        Err(ResponseError::ChangeConfig(ChangeConfigError::NotAuthorized)) => (),
        other => panic!("expected NotAuthorized from change_membership, got {:?}", other),
    }

    Ok(())
}
