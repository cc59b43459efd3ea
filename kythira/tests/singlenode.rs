mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kythira::Config;
use kythira::LogId;
use kythira::RaftStorageDebug;
use kythira::State;
use maplit::btreeset;

use fixtures::RaftRouter;

/// Single-node cluster commit test.
///
/// What does this test do?
///
/// - brings 1 node online, initializes it as a single-member cluster, and waits for it to become
///   leader at term 1.
/// - submits a client payload and asserts the completion resolves with the state machine's
///   output only after the entry is both committed and applied.
///
/// RUST_LOG=kythira,memstore,singlenode=trace cargo test -p kythira --test singlenode
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn singlenode() -> Result<()> {
    fixtures::init_tracing();

    // Setup test dependencies.
    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;

    let mut want = 0;

    // Assert all nodes are in non-voter state & have no entries.
    router.wait_for_log(&btreeset![0], want, Some(Duration::from_millis(1000)), "empty").await?;
    router.wait_for_state(&btreeset![0], State::NonVoter, Some(Duration::from_millis(1000)), "empty").await?;
    router.assert_pristine_cluster().await;

    // Initialize the cluster, then assert that a stable cluster was formed & held.
    tracing::info!("--- initializing cluster");
    router.initialize_from_single_node(0).await?;
    want += 1;

    router.wait_for_log(&btreeset![0], want, Some(Duration::from_millis(1000)), "init").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    // Write some data to the single node cluster.
    router.client_request_many(0, "0", 1).await;
    want += 1;

    router.wait_for_log(&btreeset![0], want, Some(Duration::from_millis(1000)), "client request").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;
    router
        .assert_storage_state(1, want, Some(0), LogId { term: 1, index: want }, None)
        .await;

    // The applied command is visible in the state machine.
    let sto = router.get_storage_handle(&0).await?;
    let sm = sto.get_state_machine().await;
    assert_eq!(sm.client_status.get("0"), Some(&"request-0".to_string()));

    Ok(())
}
