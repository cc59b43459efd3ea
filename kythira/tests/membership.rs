mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kythira::raft::EntryPayload;
use kythira::Config;
use kythira::RaftStorage;
use kythira::State;
use maplit::btreeset;

use fixtures::RaftRouter;

/// Joint-consensus membership change test.
///
/// What does this test do?
///
/// - brings a 3-node cluster online.
/// - adds node 3: a joint config entry commits first, then the final uniform config.
/// - asserts the log carries the two-entry change and every node converges on the new config.
/// - removes node 3 again and asserts it reverts to non-voter.
///
/// RUST_LOG=kythira,memstore,membership=trace cargo test -p kythira --test membership
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn membership() -> Result<()> {
    fixtures::init_tracing();

    // Setup test dependencies.
    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let old_members = btreeset![0, 1, 2];
    let new_members = btreeset![0, 1, 2, 3];
    let mut want = router.new_nodes_from_single(old_members.clone(), btreeset![]).await?;

    tracing::info!("--- adding node 3 to the cluster");
    router.new_raft_node(3).await;
    router.add_non_voter(0, 3).await?;
    router.change_membership(0, new_members.clone()).await?;
    want += 2; // The joint config entry, then the final config entry.

    router.wait_for_log(&new_members, want, Some(Duration::from_millis(5000)), "add node 3").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    // The membership change is two log entries: the joint config, then the uniform config.
    let sto = router.get_storage_handle(&0).await?;
    let entries = sto.get_log_entries(want - 1..=want).await?;
    match &entries[0].payload {
        EntryPayload::ConfigChange(change) => {
            assert_eq!(change.membership.members, old_members);
            assert_eq!(change.membership.members_after_consensus, Some(new_members.clone()));
        }
        other => panic!("expected a joint config entry at index {}, got {:?}", want - 1, other),
    }
    match &entries[1].payload {
        EntryPayload::ConfigChange(change) => {
            assert_eq!(change.membership.members, new_members);
            assert_eq!(change.membership.members_after_consensus, None);
        }
        other => panic!("expected a uniform config entry at index {}, got {:?}", want, other),
    }

    // Every node has adopted the final config.
    for metrics in router.latest_metrics().await {
        assert_eq!(
            metrics.membership_config.members, new_members,
            "node {} has not adopted the new config",
            metrics.id
        );
        assert!(metrics.membership_config.members_after_consensus.is_none());
    }

    tracing::info!("--- removing node 3 from the cluster");
    router.change_membership(0, old_members.clone()).await?;
    want += 2;

    router.wait_for_log(&old_members, want, Some(Duration::from_millis(5000)), "remove node 3").await?;

    // The removed node reverts to non-voter once the config which excludes it reaches its log.
    router
        .wait_for_metrics(
            &3,
            |x| x.state == State::NonVoter,
            Some(Duration::from_millis(5000)),
            "node 3 reverts to non-voter",
        )
        .await?;

    Ok(())
}
