//! The in-memory log: a ring buffer of entries indexed by raft index.
//!
//! The buffer holds the contiguous range `[first_index ..= last_index]` and pins the snapshot
//! boundary below it. After a compaction the buffer keeps a trailing tail of entries at or
//! below the boundary, so slightly lagging followers can still be served from the log.

use std::collections::VecDeque;

use rafter::raft::Entry;
use rafter::AppData;
use rafter::LogId;

pub struct InMemLog<D: AppData> {
    entries: VecDeque<Entry<D>>,
    /// The raft index of `entries[0]`; meaningless while the buffer is empty.
    first_index: u64,
    /// The id of the last entry covered by the current snapshot, `(0, 0)` if none.
    snapshot_last: LogId,
}

impl<D: AppData> InMemLog<D> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_last: LogId::default(),
        }
    }

    /// Seed the log from recovered entries. `entries` must be contiguous.
    pub fn load(entries: Vec<Entry<D>>, snapshot_last: LogId) -> Self {
        let first_index = entries.first().map(|e| e.log_id.index).unwrap_or(snapshot_last.index + 1);
        Self {
            entries: entries.into(),
            first_index,
            snapshot_last,
        }
    }

    /// The first index still held, `last_index + 1` when the buffer is empty.
    pub fn first_index(&self) -> u64 {
        if self.entries.is_empty() {
            self.last_log_id().index + 1
        } else {
            self.first_index
        }
    }

    /// The id of the last entry, or the snapshot boundary if the buffer is empty.
    pub fn last_log_id(&self) -> LogId {
        self.entries.back().map(|e| e.log_id).unwrap_or(self.snapshot_last)
    }

    pub fn snapshot_last_log_id(&self) -> LogId {
        self.snapshot_last
    }

    /// Append one entry. The index must be exactly `last_index + 1`.
    pub fn append(&mut self, entry: Entry<D>) {
        debug_assert_eq!(entry.log_id.index, self.last_log_id().index + 1);
        if self.entries.is_empty() {
            self.first_index = entry.log_id.index;
        }
        self.entries.push_back(entry);
    }

    /// Get the entry at the given raft index.
    pub fn get(&self, index: u64) -> Option<&Entry<D>> {
        if self.entries.is_empty() || index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Collect the entries in `[start, stop)`, clipped to what the buffer holds.
    pub fn range(&self, start: u64, stop: u64) -> Vec<Entry<D>> {
        let mut out = Vec::new();
        let mut index = start.max(self.first_index());
        while index < stop {
            match self.get(index) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
            index += 1;
        }
        out
    }

    /// Drop the entry at `from` and everything above it.
    ///
    /// Also serves as the rollback for a failed disk append: dropping the tail reclaims the
    /// payloads through ordinary ownership.
    pub fn truncate(&mut self, from: u64) {
        if self.entries.is_empty() || from > self.last_log_id().index {
            return;
        }
        let keep = from.saturating_sub(self.first_index) as usize;
        self.entries.truncate(keep);
    }

    /// Drop entries below `first_retained` after a compaction.
    ///
    /// The snapshot boundary moves to `boundary`; entries in
    /// `[first_retained ..= boundary.index]` stay as the trailing tail.
    pub fn compact(&mut self, first_retained: u64, boundary: LogId) {
        while let Some(front) = self.entries.front() {
            if front.log_id.index >= first_retained {
                break;
            }
            self.entries.pop_front();
            self.first_index += 1;
        }
        if boundary > self.snapshot_last {
            self.snapshot_last = boundary;
        }
    }

    /// Reset the boundary after a snapshot install: entries at or below it are dropped and the
    /// prefix is re-pinned. Entries above the boundary are kept and reconciled by the leader's
    /// next AppendEntries.
    pub fn snapshot_restored(&mut self, boundary: LogId) {
        while let Some(front) = self.entries.front() {
            if front.log_id.index > boundary.index {
                break;
            }
            self.entries.pop_front();
            self.first_index += 1;
        }
        if self.entries.is_empty() {
            self.first_index = boundary.index + 1;
        }
        if boundary > self.snapshot_last {
            self.snapshot_last = boundary;
        }
    }

    /// Iterate over the held entries in index order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Entry<D>> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use rafter::raft::EntryNormal;
    use rafter::raft::EntryPayload;
    use serde::Deserialize;
    use serde::Serialize;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Payload(u64);

    impl AppData for Payload {}

    fn entry(term: u64, index: u64) -> Entry<Payload> {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Normal(EntryNormal { data: Payload(index) }),
        }
    }

    fn log_with(range: std::ops::RangeInclusive<u64>, term: u64) -> InMemLog<Payload> {
        let mut log = InMemLog::new();
        for index in range {
            log.append(entry(term, index));
        }
        log
    }

    #[test]
    fn test_empty_log_boundaries() {
        let log = InMemLog::<Payload>::new();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_log_id(), LogId::default());
    }

    #[test]
    fn test_append_and_get() {
        let log = log_with(1..=5, 1);
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_log_id().index, 5);
        assert_eq!(log.get(3).unwrap().log_id, LogId::new(1, 3));
        assert!(log.get(6).is_none());
        assert!(log.get(0).is_none());
    }

    #[test]
    fn test_range_is_clipped() {
        let log = log_with(1..=5, 1);
        let got = log.range(3, 10);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].log_id.index, 3);
        assert_eq!(got[2].log_id.index, 5);
    }

    #[test]
    fn test_truncate_drops_suffix() {
        let mut log = log_with(1..=5, 1);
        log.truncate(3);
        assert_eq!(log.last_log_id().index, 2);
        assert!(log.get(3).is_none());
        // The log accepts appends at the cut point again.
        log.append(entry(2, 3));
        assert_eq!(log.last_log_id(), LogId::new(2, 3));
    }

    #[test]
    fn test_compact_keeps_trailing_tail() {
        let mut log = log_with(1..=100, 1);
        log.compact(91, LogId::new(1, 100));
        assert_eq!(log.first_index(), 91);
        assert_eq!(log.snapshot_last_log_id(), LogId::new(1, 100));
        assert_eq!(log.last_log_id().index, 100);
        assert!(log.get(90).is_none());
        assert!(log.get(91).is_some());
    }

    #[test]
    fn test_snapshot_restored_drops_covered_prefix() {
        let mut log = log_with(1..=20, 1);
        log.snapshot_restored(LogId::new(1, 100));
        assert_eq!(log.first_index(), 101);
        assert_eq!(log.last_log_id(), LogId::new(1, 100));
        // The next append continues above the boundary.
        log.append(entry(2, 101));
        assert_eq!(log.last_log_id(), LogId::new(2, 101));
    }
}
