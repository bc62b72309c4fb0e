//! The prepare pool: a background producer of preallocated, zero-filled open segments.
//!
//! Appends must never wait on file allocation, so the pool keeps up to two segments fully
//! allocated ahead of time, running at most one allocation at a time. Consumers pop a ready
//! segment or queue FIFO behind the next allocation.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;

use rafter::StorageError;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::meta::fsync_dir;
use crate::segment::open_filename;

/// How many segments the pool keeps allocated and ready.
const POOL_TARGET: usize = 2;

/// A preallocated open segment, ready for adoption as the active segment.
pub struct PreparedSegment {
    pub counter: u64,
    pub path: PathBuf,
    pub file: File,
}

enum PoolCmd {
    Acquire(oneshot::Sender<Result<PreparedSegment, StorageError>>),
    Stats(oneshot::Sender<PoolStats>),
    Close(oneshot::Sender<()>),
}

/// A point-in-time view of the pool, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Segments allocated and waiting for adoption.
    pub ready: usize,
    /// Whether an allocation is currently running.
    pub allocating: bool,
    /// Acquire requests waiting for the next allocation.
    pub waiting: usize,
}

/// Handle to the pool task.
pub struct PreparePool {
    cmd_tx: mpsc::UnboundedSender<PoolCmd>,
}

impl PreparePool {
    /// Spawn the pool over the given directory. `next_counter` continues the open-segment
    /// numbering found during recovery.
    pub fn spawn(dir: PathBuf, segment_size: u64, next_counter: u64) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = PoolTask {
            dir,
            segment_size,
            next_counter,
            pool: Vec::new(),
            waiters: Vec::new(),
            errored: false,
            cmd_rx,
        };
        tokio::spawn(task.run());
        Self { cmd_tx }
    }

    /// Take a prepared segment, waiting for an allocation if the pool is empty.
    pub async fn acquire(&self) -> Result<PreparedSegment, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(PoolCmd::Acquire(tx)).map_err(|_| StorageError::Shutdown)?;
        rx.await.map_err(|_| StorageError::Canceled)?
    }

    /// Observe the pool's current state.
    pub async fn stats(&self) -> Result<PoolStats, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(PoolCmd::Stats(tx)).map_err(|_| StorageError::Shutdown)?;
        rx.await.map_err(|_| StorageError::Shutdown)
    }

    /// Shut the pool down: pending acquires fail with `Canceled`, pooled files are unlinked,
    /// and an in-flight allocation is discarded once it completes.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(PoolCmd::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct PoolTask {
    dir: PathBuf,
    segment_size: u64,
    next_counter: u64,
    pool: Vec<PreparedSegment>,
    waiters: Vec<oneshot::Sender<Result<PreparedSegment, StorageError>>>,
    errored: bool,
    cmd_rx: mpsc::UnboundedReceiver<PoolCmd>,
}

impl PoolTask {
    #[tracing::instrument(level = "trace", skip(self), fields(dir=?self.dir))]
    async fn run(mut self) {
        let mut inflight: Option<JoinHandle<Result<PreparedSegment, StorageError>>> = None;

        loop {
            // Keep the pool topped up, one allocation at a time.
            if inflight.is_none() && !self.errored && (self.pool.len() < POOL_TARGET || !self.waiters.is_empty()) {
                let counter = self.next_counter;
                self.next_counter += 1;
                let dir = self.dir.clone();
                let size = self.segment_size;
                inflight = Some(tokio::task::spawn_blocking(move || allocate_segment(&dir, counter, size)));
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(PoolCmd::Acquire(tx)) => {
                        if self.errored {
                            let _ = tx.send(Err(StorageError::Shutdown));
                        } else if !self.pool.is_empty() {
                            let segment = self.pool.remove(0);
                            let _ = tx.send(Ok(segment));
                        } else {
                            self.waiters.push(tx);
                        }
                    }
                    Some(PoolCmd::Stats(tx)) => {
                        let _ = tx.send(PoolStats {
                            ready: self.pool.len(),
                            allocating: inflight.is_some(),
                            waiting: self.waiters.len(),
                        });
                    }
                    Some(PoolCmd::Close(done)) => {
                        self.shutdown(inflight).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown(inflight).await;
                        return;
                    }
                },
                res = async { inflight.as_mut().expect("inflight allocation").await }, if inflight.is_some() => {
                    inflight = None;
                    match res {
                        Ok(Ok(segment)) => {
                            if let Some(waiter) = self.first_live_waiter() {
                                if let Err(Ok(segment)) = waiter.send(Ok(segment)) {
                                    self.pool.push(segment);
                                }
                            } else {
                                self.pool.push(segment);
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::error!(error=%err, "segment allocation failed, refusing further prepares");
                            self.fail_all_waiters(&err);
                            self.errored = true;
                        }
                        Err(err) => {
                            tracing::error!(error=%err, "segment allocation task panicked, refusing further prepares");
                            let err = StorageError::Io(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "segment allocation task failed",
                            ));
                            self.fail_all_waiters(&err);
                            self.errored = true;
                        }
                    }
                }
            }
        }
    }

    /// Pop waiters until one with a live receiver is found.
    fn first_live_waiter(&mut self) -> Option<oneshot::Sender<Result<PreparedSegment, StorageError>>> {
        while !self.waiters.is_empty() {
            let waiter = self.waiters.remove(0);
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    fn fail_all_waiters(&mut self, err: &StorageError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("segment allocation failed: {}", err),
            ))));
        }
    }

    /// Cancel everything: waiters drain as `Canceled`, pool files are unlinked, and the result
    /// of an in-flight allocation is discarded and its file removed.
    async fn shutdown(&mut self, inflight: Option<JoinHandle<Result<PreparedSegment, StorageError>>>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(StorageError::Canceled));
        }
        for segment in self.pool.drain(..) {
            drop(segment.file);
            let _ = fs::remove_file(&segment.path);
        }
        if let Some(handle) = inflight {
            if let Ok(Ok(segment)) = handle.await {
                drop(segment.file);
                let _ = fs::remove_file(&segment.path);
            }
        }
        let _ = fsync_dir(&self.dir);
    }
}

/// Allocate one zero-filled open segment and make it durable.
///
/// Any failure on the allocate→sync path is a hard error for the segment; a partially created
/// file is removed.
fn allocate_segment(dir: &Path, counter: u64, size: u64) -> Result<PreparedSegment, StorageError> {
    let path = dir.join(open_filename(counter));
    let res = (|| {
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        file.set_len(size)?;
        file.sync_all()?;
        fsync_dir(dir)?;
        Ok(PreparedSegment { counter, path: path.clone(), file })
    })();
    if res.is_err() {
        let _ = fs::remove_file(&path);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_prepares_up_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PreparePool::spawn(dir.path().to_path_buf(), 4096, 1);

        // Wait for the pool to fill.
        let mut stats = pool.stats().await.unwrap();
        for _ in 0..100 {
            if stats.ready == POOL_TARGET && !stats.allocating {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
            stats = pool.stats().await.unwrap();
        }
        assert_eq!(stats.ready, POOL_TARGET);
        assert!(!stats.allocating);

        // A quiescent pool never holds more than the target nor runs parallel allocations.
        let segment = pool.acquire().await.unwrap();
        assert!(segment.path.exists());
        let stats = pool.stats().await.unwrap();
        assert!(stats.ready <= POOL_TARGET);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_pool_close_unlinks_ready_segments() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PreparePool::spawn(dir.path().to_path_buf(), 4096, 1);

        // Hold one segment across the close; the pool must not touch it.
        let held = pool.acquire().await.unwrap();
        pool.close().await;

        assert!(held.path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|ent| ent.ok())
            .filter(|ent| ent.path() != held.path)
            .collect();
        assert!(leftovers.is_empty(), "pooled segments must be unlinked on close: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_pool_acquire_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PreparePool::spawn(dir.path().to_path_buf(), 4096, 1);
        pool.close().await;
        assert!(pool.acquire().await.is_err());
    }
}
