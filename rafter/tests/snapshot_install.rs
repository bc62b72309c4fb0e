use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use rafter::Config;
use rafter::RaftStorageDebug;
use rafter::SnapshotPolicy;

use fixtures::RaftRouter;

mod fixtures;

/// A lagging follower is brought back through a one-shot snapshot install.
///
/// What does this test do?
///
/// - brings a 3-voter cluster online with an aggressive snapshot policy and a short trailing
///   tail.
/// - isolates one follower, then writes enough commands that the leader snapshots and prunes
///   the log the follower would have needed.
/// - restores the follower and asserts it converges: it reports an installed snapshot, its log
///   restarts above the boundary, and its state machine equals the leader's.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_install_on_lagging_follower() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(50))
            .snapshot_trailing(10)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(btreeset![1, 2, 3]).await?;
    router.wait_for_log(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(10)), "initial barrier").await?;

    let lagging = *btreeset![1u64, 2, 3].iter().find(|id| **id != leader).unwrap();
    tracing::info!(lagging, "--- isolating one follower");
    router.isolate_node(lagging).await;

    tracing::info!("--- writing 200 commands; the leader snapshots along the way");
    router.client_request_many(leader, "c0", 200).await;

    let leader_metrics = router
        .wait_for_metrics(
            &leader,
            |m| m.snapshot.index > 0,
            Some(Duration::from_secs(10)),
            "leader snapshot taken",
        )
        .await?;
    let boundary = leader_metrics.snapshot;
    tracing::info!(boundary=%boundary, "--- leader snapshot boundary");

    tracing::info!("--- restoring the follower");
    router.restore_node(lagging).await;

    // The follower converges: a snapshot install followed by ordinary replication. Leadership
    // may have moved while the follower was campaigning in isolation, so track whatever the
    // cluster currently reports.
    router
        .wait_for_metrics(
            &lagging,
            |m| m.snapshot.index >= boundary.index,
            Some(Duration::from_secs(10)),
            "follower installed a snapshot",
        )
        .await?;

    let current_leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let want = router.wait_for_metrics(&current_leader, |_| true, None, "leader metrics").await?.last_log_index;
    router.wait_for_log(&btreeset![lagging], want, Some(Duration::from_secs(10)), "follower caught up").await?;

    // The follower's log restarts above the boundary it received.
    let follower_metrics = router.wait_for_metrics(&lagging, |_| true, None, "follower metrics").await?;
    assert!(follower_metrics.snapshot.index >= boundary.index);

    // State machine parity with the leader over everything written.
    let leader_sm = router.get_storage_handle(&current_leader).await?.get_state_machine().await;
    let follower_sm = router.get_storage_handle(&lagging).await?.get_state_machine().await;
    assert_eq!(leader_sm.client_status, follower_sm.client_status);
    assert_eq!(follower_sm.client_status.get("c0"), Some(&"request-199".to_string()));
    Ok(())
}
