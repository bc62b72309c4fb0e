//! End-to-end tests of the on-disk store: durability round-trips, crash recovery, compaction
//! boundaries, snapshot pruning and the prepare-pool bound.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use rafter::membership::Configuration;
use rafter::membership::Role;
use rafter::membership::Server;
use rafter::raft::Entry;
use rafter::raft::EntryNormal;
use rafter::raft::EntryPayload;
use rafter::storage::HardState;
use rafter::storage::RaftStorage;
use rafter::storage::RaftStorageDebug;
use rafter::AppData;
use rafter::AppDataResponse;
use rafter::LogId;
use rafter::StorageError;
use segstore::SegStore;
use segstore::SegStoreOptions;
use segstore::StateMachine;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Cmd(String);

impl AppData for Cmd {}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CmdResponse(u64);

impl AppDataResponse for CmdResponse {}

/// A state machine which records every applied command with its index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Recorder {
    applied: Vec<(u64, String)>,
}

impl StateMachine<Cmd, CmdResponse> for Recorder {
    fn apply(&mut self, index: u64, data: &Cmd) -> CmdResponse {
        self.applied.push((index, data.0.clone()));
        CmdResponse(index)
    }

    fn blank_response(&self) -> CmdResponse {
        CmdResponse(0)
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("recorder serializes")
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), StorageError> {
        *self = serde_json::from_slice(data).map_err(|err| StorageError::Corrupt(err.to_string()))?;
        Ok(())
    }
}

type Store = SegStore<Cmd, CmdResponse, Recorder>;

/// Options sized so one 10-entry batch fills a segment: every append of 10 commands with
/// 5-character payloads seals the previous segment.
fn ten_per_segment() -> SegStoreOptions {
    SegStoreOptions {
        block_size: 30,
        blocks_per_segment: 10,
    }
}

async fn open_store(dir: &Path, options: SegStoreOptions) -> Store {
    SegStore::open(dir.to_path_buf(), options, Recorder::default()).await.expect("store opens")
}

fn command_entry(term: u64, index: u64) -> Entry<Cmd> {
    Entry {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Normal(EntryNormal {
            data: Cmd(format!("{:05}", index)),
        }),
    }
}

/// Append commands covering `[start, end]` in batches of 10.
async fn append_range(store: &Store, start: u64, end: u64) {
    let mut next = start;
    while next <= end {
        let batch: Vec<Entry<Cmd>> = (next..=end.min(next + 9)).map(|i| command_entry(1, i)).collect();
        let refs: Vec<&Entry<Cmd>> = batch.iter().collect();
        store.append_to_log(&refs).await.expect("append succeeds");
        next += batch.len() as u64;
    }
}

/// Append `count` commands starting at index 1.
async fn append_commands(store: &Store, count: u64) {
    append_range(store, 1, count).await;
}

async fn apply_through(store: &Store, upto: u64) {
    let entries = store.get_log_entries(1..=upto).await.unwrap();
    let refs: Vec<&Entry<Cmd>> = entries.iter().collect();
    store.apply_to_state_machine(&refs).await.unwrap();
}

fn count_snapshot_metas(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|ent| ent.ok())
        .filter(|ent| {
            ent.file_name()
                .to_str()
                .map(|name| name.starts_with("snapshot-") && name.ends_with(".meta"))
                .unwrap_or(false)
        })
        .count()
}

fn active_segment_path(dir: &Path) -> PathBuf {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|ent| ent.ok())
        .map(|ent| ent.path())
        .filter(|path| {
            path.file_name().and_then(|name| name.to_str()).map(|name| name.starts_with("open-")).unwrap_or(false)
        })
        .find(|path| {
            // The active segment is the open file with written content.
            fs::read(path).map(|buf| buf.iter().take(16).any(|b| *b != 0)).unwrap_or(false)
        })
        .expect("an active segment exists")
}

#[tokio::test(flavor = "multi_thread")]
async fn durability_round_trip() -> Result<()> {
    let tmp = tempfile::tempdir()?;

    let store = open_store(tmp.path(), ten_per_segment()).await;
    let hs = HardState {
        current_term: 3,
        voted_for: Some(2),
    };
    store.save_hard_state(&hs).await?;
    store
        .bootstrap(Configuration {
            servers: vec![
                Server { id: 1, address: "n1".into(), role: Role::Voter },
                Server { id: 2, address: "n2".into(), role: Role::Voter },
                Server { id: 3, address: "n3".into(), role: Role::Standby },
            ],
        })
        .await?;
    append_commands(&store, 25).await;
    let written = store.get_log_entries(..).await?;
    store.close().await;

    let store = open_store(tmp.path(), ten_per_segment()).await;
    let state = store.get_initial_state().await?;
    assert_eq!(state.hard_state, hs);
    assert_eq!(state.last_log_id, LogId::new(1, 25));
    assert_eq!(state.membership.servers.len(), 3);
    assert!(state.membership.is_voter(&2));

    let reloaded = store.get_log_entries(..).await?;
    assert_eq!(reloaded, written);
    store.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_recovery_truncates_torn_entry() -> Result<()> {
    let tmp = tempfile::tempdir()?;

    let store = open_store(tmp.path(), ten_per_segment()).await;
    store
        .save_hard_state(&HardState {
            current_term: 5,
            voted_for: Some(1),
        })
        .await?;
    append_commands(&store, 50).await;
    store.close().await;

    // Simulate a crash mid-write of entry 51: garbage bytes at the end of the active segment's
    // content.
    let path = active_segment_path(tmp.path());
    let mut buf = fs::read(&path)?;
    let end = buf.iter().rposition(|b| *b != 0).unwrap() + 1;
    buf[end..end + 12].copy_from_slice(b"torn-entry51");
    fs::write(&path, &buf)?;

    let store = open_store(tmp.path(), ten_per_segment()).await;
    let state = store.get_initial_state().await?;
    assert_eq!(state.last_log_id.index, 50);
    assert_eq!(state.hard_state.current_term, 5);
    assert_eq!(state.hard_state.voted_for, Some(1));
    assert_eq!(store.get_log_entries(..).await?.len(), 50);
    store.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn compaction_keeps_trailing_entries() -> Result<()> {
    let tmp = tempfile::tempdir()?;

    let store = open_store(tmp.path(), ten_per_segment()).await;
    append_commands(&store, 100).await;
    apply_through(&store, 100).await;

    let snapshot = store.do_log_compaction(10).await?;
    assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 100));

    let log_state = store.get_log_state().await?;
    assert_eq!(log_state.first_log_index, 91);
    assert_eq!(log_state.snapshot_last_log_id, LogId::new(1, 100));

    // The next roll seals the trailing tail: on disk the log now starts at 91.
    let batch: Vec<Entry<Cmd>> = (101..=110).map(|i| command_entry(1, i)).collect();
    let refs: Vec<&Entry<Cmd>> = batch.iter().collect();
    store.append_to_log(&refs).await?;
    let ranges = store.closed_segment_ranges().await;
    assert_eq!(ranges.first(), Some(&(91, 100)));
    store.close().await;

    // Recovery reads the trailing tail plus the new entries, with the state machine coming
    // from the snapshot.
    let store = open_store(tmp.path(), ten_per_segment()).await;
    let state = store.get_initial_state().await?;
    assert_eq!(state.last_log_id.index, 110);
    assert_eq!(state.last_applied_log, LogId::new(1, 100));
    let sm = store.get_state_machine().await;
    assert_eq!(sm.applied.len(), 100);
    store.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_prune_keeps_two() -> Result<()> {
    let tmp = tempfile::tempdir()?;

    let store = open_store(tmp.path(), ten_per_segment()).await;
    append_commands(&store, 100).await;

    for upto in [20u64, 40, 60, 80, 100] {
        apply_through(&store, upto).await;
        store.do_log_compaction(5).await?;
    }

    assert_eq!(count_snapshot_metas(tmp.path()), 2);

    // The newest snapshot wins on reload.
    store.close().await;
    let store = open_store(tmp.path(), ten_per_segment()).await;
    let snapshot = store.get_current_snapshot().await?.expect("snapshot survives restart");
    assert_eq!(snapshot.meta.last_log_id.index, 100);
    store.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn prepare_pool_stays_within_bounds() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = open_store(tmp.path(), ten_per_segment()).await;

    // Let the pool settle, then roll through a number of segments; at every quiescent point
    // at most two segments are ready and at most one allocation runs.
    for round in 0..6u64 {
        append_range(&store, round * 10 + 1, round * 10 + 10).await;
        let stats = store.pool_stats().await?;
        assert!(stats.ready <= 2, "round {}: ready={}", round, stats.ready);
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    }

    let stats = store.pool_stats().await?;
    assert!(stats.ready <= 2);
    store.close().await;

    // Close unlinks the pooled segments; only sealed and active segments remain.
    let opens: Vec<_> = fs::read_dir(tmp.path())?
        .filter_map(|ent| ent.ok())
        .filter(|ent| {
            ent.file_name().to_str().map(|name| name.starts_with("open-")).unwrap_or(false)
        })
        .collect();
    assert!(opens.len() <= 1, "at most the active segment survives close: {:?}", opens);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn install_snapshot_resets_follower_state() -> Result<()> {
    let leader_dir = tempfile::tempdir()?;
    let follower_dir = tempfile::tempdir()?;

    // Leader: 100 applied entries, snapshot with a 10-entry trailing tail.
    let leader = open_store(leader_dir.path(), ten_per_segment()).await;
    append_commands(&leader, 100).await;
    apply_through(&leader, 100).await;
    let snapshot = leader.do_log_compaction(10).await?;

    // Follower: far behind, receives the snapshot whole.
    let follower = open_store(follower_dir.path(), ten_per_segment()).await;
    append_commands(&follower, 20).await;
    apply_through(&follower, 20).await;
    follower.install_snapshot(&snapshot.meta, snapshot.data.as_ref().clone()).await?;

    let state = follower.get_log_state().await?;
    assert_eq!(state.first_log_index, 101);
    assert_eq!(state.snapshot_last_log_id, LogId::new(1, 100));

    let follower_sm = follower.get_state_machine().await;
    let leader_sm = leader.get_state_machine().await;
    assert_eq!(follower_sm.applied, leader_sm.applied);

    // The installed state survives a restart.
    follower.close().await;
    let follower = open_store(follower_dir.path(), ten_per_segment()).await;
    let state = follower.get_initial_state().await?;
    assert_eq!(state.last_applied_log, LogId::new(1, 100));
    assert_eq!(follower.get_state_machine().await.applied.len(), 100);

    follower.close().await;
    leader.close().await;
    Ok(())
}
