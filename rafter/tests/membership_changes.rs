use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use rafter::membership::Role;
use rafter::Config;

use fixtures::RaftRouter;

mod fixtures;

/// Single-server membership changes: add a spare, then promote it to voter.
///
/// What does this test do?
///
/// - brings a 3-voter cluster online and waits for its leader.
/// - adds node 4 as a spare; the config entry lands at index 2, right after the barrier.
/// - promotes node 4 to voter; the promotion runs catch-up rounds first and its config entry
///   lands at index 3.
/// - asserts the final configuration has 4 servers with node 4 voting, and that node 4 has
///   replicated and applied the whole log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_spare_then_promote_to_voter() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(btreeset![1, 2, 3]).await?;
    router.wait_for_log(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(10)), "initial barrier").await?;

    tracing::info!("--- adding node 4 as a spare");
    router.new_raft_node(4).await;
    let index = router.add_server(leader, 4).await.expect("add_server should succeed");
    assert_eq!(index, 2, "the add-server config entry should follow the barrier");

    let metrics = router
        .wait_for_metrics(
            &leader,
            |m| m.membership_config.servers.len() == 4,
            Some(Duration::from_secs(10)),
            "node 4 added",
        )
        .await?;
    assert_eq!(metrics.membership_config.get(&4).map(|s| s.role), Some(Role::Spare));

    tracing::info!("--- promoting node 4 to voter");
    let index = router.assign_role(leader, 4, Role::Voter).await.expect("assign_role should succeed");
    assert_eq!(index, 3, "the promotion config entry should follow the add");

    let metrics = router
        .wait_for_metrics(
            &leader,
            |m| m.membership_config.is_voter(&4),
            Some(Duration::from_secs(10)),
            "node 4 promoted",
        )
        .await?;
    assert_eq!(metrics.membership_config.servers.len(), 4);
    assert_eq!(metrics.membership_config.voter_ids().len(), 4);

    tracing::info!("--- waiting for node 4 to apply the full log");
    router.wait_for_log(&btreeset![4], 3, Some(Duration::from_secs(10)), "node 4 caught up").await?;
    Ok(())
}

/// Remove a voter, then backfill the voter set from a spare.
///
/// What does this test do?
///
/// - brings a 3-voter cluster online and registers node 4 as a spare.
/// - removes one non-leader voter.
/// - promotes node 4 to voter.
/// - asserts the final configuration has exactly 3 voters, including node 4 and excluding the
///   removed server.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_voter_then_promote_spare() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(btreeset![1, 2, 3]).await?;
    router.wait_for_log(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(10)), "initial barrier").await?;

    router.new_raft_node(4).await;
    router.add_server(leader, 4).await.expect("add_server should succeed");

    let victim = *btreeset![1u64, 2, 3].iter().find(|id| **id != leader).unwrap();
    tracing::info!(victim, "--- removing a non-leader voter");
    router.remove_server(leader, victim).await.expect("remove_server should succeed");

    tracing::info!("--- promoting node 4 to voter");
    router.assign_role(leader, 4, Role::Voter).await.expect("assign_role should succeed");

    let metrics = router
        .wait_for_metrics(
            &leader,
            |m| {
                let voters = m.membership_config.voter_ids();
                voters.len() == 3 && voters.contains(&4) && !voters.contains(&victim)
            },
            Some(Duration::from_secs(10)),
            "final configuration",
        )
        .await?;
    assert!(!metrics.membership_config.contains(&victim));
    assert_eq!(metrics.membership_config.servers.len(), 3);

    // The removed node drops out of the replicating set; the survivors stay in sync.
    router.wait_for_log(&btreeset![4], metrics.last_log_index, Some(Duration::from_secs(10)), "node 4 in sync").await?;
    Ok(())
}
