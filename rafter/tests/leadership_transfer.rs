use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use rafter::Config;
use rafter::State;

use fixtures::RaftRouter;

mod fixtures;

/// Leadership transfer: TimeoutNow makes the chosen voter campaign immediately.
///
/// What does this test do?
///
/// - brings a 3-voter cluster online and waits for its leader.
/// - flushes the pipeline with a barrier so the transfer target is fully caught up.
/// - transfers leadership to a chosen follower.
/// - asserts the target becomes leader in a higher term and the old leader steps down, with
///   the cluster stable afterwards.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfer_to_chosen_voter() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(btreeset![1, 2, 3]).await?;
    router.wait_for_log(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(10)), "initial barrier").await?;

    let old_term = router.wait_for_metrics(&leader, |_| true, None, "leader metrics").await?.current_term;

    // A barrier flushes the pipeline, so every follower has replicated the full log.
    router.barrier(leader).await.expect("barrier should succeed on the leader");

    let target = *btreeset![1u64, 2, 3].iter().find(|id| **id != leader).unwrap();
    tracing::info!(leader, target, "--- transferring leadership");
    router.transfer_leadership(leader, Some(target)).await.expect("transfer should be dispatched");

    router
        .wait_for_metrics(
            &target,
            |m| m.state == State::Leader && m.current_term > old_term,
            Some(Duration::from_secs(10)),
            "target took over leadership",
        )
        .await?;

    router
        .wait_for_metrics(
            &leader,
            |m| m.state == State::Follower && m.current_leader == Some(target),
            Some(Duration::from_secs(10)),
            "old leader stepped down",
        )
        .await?;

    // The new leader's barrier commits across the cluster and everything settles.
    let want = router.wait_for_metrics(&target, |_| true, None, "new leader metrics").await?.last_log_index;
    router.wait_for_log(&btreeset![1, 2, 3], want, Some(Duration::from_secs(10)), "cluster stable").await?;
    router.assert_stable_cluster(None, None).await;
    Ok(())
}
