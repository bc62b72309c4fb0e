use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use rafter::Config;
use rafter::RaftStorageDebug;

use fixtures::RaftRouter;

mod fixtures;

/// Cluster formation and first client write.
///
/// What does this test do?
///
/// - brings a 3-voter cluster online from bootstrapped stores.
/// - waits for the cluster to elect a leader on its own.
/// - writes one command to the leader.
/// - asserts that every node's state machine observes the command at index 2 — index 1 being
///   the barrier the new leader appends on stepping up — and that the cluster is stable there.
///
/// RUST_LOG=rafter,memstore,initial_election_and_apply=trace cargo test -p rafter --test initial_election_and_apply
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initial_election_and_apply() -> Result<()> {
    fixtures::init_tracing();

    // Setup test dependencies.
    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(btreeset![1, 2, 3]).await?;

    tracing::info!("--- waiting for the initial barrier to be applied everywhere");
    router.wait_for_log(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(10)), "initial barrier").await?;

    tracing::info!("--- writing one command to the leader");
    let req = ClientRequest {
        client: "c0".into(),
        serial: 0,
        status: "hello".into(),
    };
    router.send_client_request(leader, req).await.expect("client write should succeed on the leader");

    router.wait_for_log(&btreeset![1, 2, 3], 2, Some(Duration::from_secs(10)), "hello applied").await?;

    for id in 1..=3u64 {
        let sto = router.get_storage_handle(&id).await?;
        let sm = sto.get_state_machine().await;
        assert_eq!(sm.last_applied_log.index, 2, "node {} should have applied through index 2", id);
        assert_eq!(
            sm.client_status.get("c0"),
            Some(&"hello".to_string()),
            "node {} should observe the written status",
            id
        );
    }

    router.assert_stable_cluster(None, Some(2)).await;
    Ok(())
}
