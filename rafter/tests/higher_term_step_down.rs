use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use rafter::error::ClientWriteError;
use rafter::raft::AppendEntriesRequest;
use rafter::Config;
use rafter::LogId;
use rafter::RaftStorageDebug;
use rafter::State;

use fixtures::RaftRouter;

mod fixtures;

/// The universal term rule: any message with a higher term deposes the leader.
///
/// What does this test do?
///
/// - brings a 3-voter cluster online and waits for its leader.
/// - delivers an AppendEntries carrying `term + 1` straight to the leader.
/// - asserts the leader instantly becomes a follower in the new term with its vote cleared,
///   and that client writes submitted to it now fail as not-leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn higher_term_steps_leader_down() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(btreeset![1, 2, 3]).await?;
    router.wait_for_log(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(10)), "initial barrier").await?;

    let old_metrics = router.wait_for_metrics(&leader, |_| true, None, "leader metrics").await?;
    let old_term = old_metrics.current_term;
    let other = *btreeset![1u64, 2, 3].iter().find(|id| **id != leader).unwrap();

    tracing::info!(leader, old_term, "--- delivering an AppendEntries with a higher term to the leader");
    let raft = router.get_raft_handle(&leader).await?;
    let resp = raft
        .append_entries(AppendEntriesRequest {
            term: old_term + 1,
            leader_id: other,
            prev_log_id: LogId::new(0, 0),
            entries: vec![],
            leader_commit: 0,
        })
        .await?;
    assert_eq!(resp.term, old_term + 1);

    // The step-down is synchronous with the request: the old leader is a follower in the new
    // term before the response leaves it.
    let metrics = raft.metrics().borrow().clone();
    assert_eq!(metrics.state, State::Follower, "leader should have stepped down");
    assert_eq!(metrics.current_term, old_term + 1);

    let hs = router
        .get_storage_handle(&leader)
        .await?
        .read_hard_state()
        .await
        .expect("hard state should exist");
    assert_eq!(hs.current_term, old_term + 1);
    assert_eq!(hs.voted_for, None, "the vote must be cleared when the term advances");

    // Client writes against the deposed leader fail as not-leader.
    let res = router
        .send_client_request(leader, ClientRequest {
            client: "c0".into(),
            serial: 0,
            status: "rejected".into(),
        })
        .await;
    assert!(
        matches!(res, Err(ClientWriteError::ForwardToLeader(_, _))),
        "write against a deposed leader must be forwarded: {:?}",
        res
    );
    Ok(())
}
