//! Dedicated database writer thread.
//!
//! The simulation thread hands [`ChangeRecord`]s over an unbounded channel;
//! this thread is the only one that writes to the store, so changes reach the
//! database in exactly the order they were queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use location_schema::ChangeRecord;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::store::{BlockStore, StoreError};

#[derive(Debug, Default)]
struct WriterStats {
    applied: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    failed_statements: AtomicU64,
    discarded: AtomicU64,
    batches: AtomicU64,
}

impl WriterStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Release);
    }

    fn snapshot(&self) -> WriterCounters {
        WriterCounters {
            applied: self.applied.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            failed_statements: self.failed_statements.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time copy of the writer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterCounters {
    /// Block changes executed, including ones later rolled back.
    pub applied: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub failed_statements: u64,
    /// Changes skipped because an earlier statement in their batch failed.
    pub discarded: u64,
    /// Commit markers handled, whether or not the batch held any changes.
    pub batches: u64,
}

pub struct WriterHandle {
    sender: Sender<ChangeRecord>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<WriterStats>,
}

pub fn spawn_writer(store: BlockStore, thread_name: &str) -> Result<WriterHandle, StoreError> {
    let (sender, receiver) = unbounded::<ChangeRecord>();
    let (done_tx, done) = bounded::<()>(1);
    let stats = Arc::new(WriterStats::default());
    let thread_stats = Arc::clone(&stats);

    let thread = thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            run_writer(store, receiver, &thread_stats);
            let _ = done_tx.send(());
        })
        .map_err(StoreError::WriterSpawn)?;

    info!(
        target: "block_store::writer",
        thread = thread_name,
        "writer.started"
    );

    Ok(WriterHandle {
        sender,
        done,
        thread: Some(thread),
        stats,
    })
}

impl WriterHandle {
    /// Queues a record. Returns `false` if the writer thread has already exited.
    pub fn send(&self, record: ChangeRecord) -> bool {
        match self.sender.send(record) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    target: "block_store::writer",
                    record = ?err.into_inner(),
                    "writer.send_failed=thread_gone"
                );
                false
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn counters(&self) -> WriterCounters {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Queues a shutdown marker and waits up to `timeout` for the thread to drain.
    ///
    /// Returns `true` if the thread finished in time. On timeout the thread is
    /// left to finish on its own.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        self.send(ChangeRecord::Shutdown);
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    error!(target: "block_store::writer", "writer.panicked");
                    return false;
                }
                info!(
                    target: "block_store::writer",
                    counters = ?self.stats.snapshot(),
                    "writer.stopped"
                );
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    target: "block_store::writer",
                    timeout_ms = timeout.as_millis() as u64,
                    queued = self.sender.len(),
                    "writer.shutdown_timeout"
                );
                false
            }
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.sender.send(ChangeRecord::Shutdown);
        }
    }
}

fn run_writer(store: BlockStore, receiver: Receiver<ChangeRecord>, stats: &WriterStats) {
    // Set after a failed statement; the rest of that batch is skipped until the next commit marker.
    let mut discarding = false;

    while let Ok(record) = receiver.recv() {
        match record {
            ChangeRecord::Apply(change) => {
                if discarding {
                    WriterStats::bump(&stats.discarded);
                    continue;
                }
                if !store.in_transaction() {
                    if let Err(err) = store.begin() {
                        error!(
                            target: "block_store::writer",
                            error = %err,
                            "writer.begin_failed"
                        );
                        WriterStats::bump(&stats.failed_statements);
                        WriterStats::bump(&stats.discarded);
                        discarding = true;
                        continue;
                    }
                }
                match store.apply(&change) {
                    Ok(()) => {
                        WriterStats::bump(&stats.applied);
                    }
                    Err(err) => {
                        error!(
                            target: "block_store::writer",
                            op = %change.op,
                            key = %change.key,
                            error = %err,
                            "writer.statement_failed"
                        );
                        WriterStats::bump(&stats.failed_statements);
                        rollback_open(&store, stats);
                        discarding = true;
                    }
                }
            }
            ChangeRecord::Commit => {
                discarding = false;
                commit_open(&store, stats);
                WriterStats::bump(&stats.batches);
            }
            ChangeRecord::Shutdown => {
                debug!(target: "block_store::writer", "writer.shutdown_marker");
                break;
            }
        }
    }

    if !discarding {
        commit_open(&store, stats);
    } else {
        rollback_open(&store, stats);
    }

    if let Err(err) = store.close() {
        error!(
            target: "block_store::writer",
            error = %err,
            "writer.close_failed"
        );
    }
}

fn commit_open(store: &BlockStore, stats: &WriterStats) {
    if !store.in_transaction() {
        return;
    }
    match store.commit() {
        Ok(()) => {
            WriterStats::bump(&stats.commits);
        }
        Err(err) => {
            error!(
                target: "block_store::writer",
                error = %err,
                "writer.commit_failed"
            );
            rollback_open(store, stats);
        }
    }
}

fn rollback_open(store: &BlockStore, stats: &WriterStats) {
    if !store.in_transaction() {
        return;
    }
    WriterStats::bump(&stats.rollbacks);
    if let Err(err) = store.rollback() {
        error!(
            target: "block_store::writer",
            error = %err,
            "writer.rollback_failed"
        );
    }
}
