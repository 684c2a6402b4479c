//! Deferred reclamation of committed history.
//!
//! Commit moves a transaction's staged todos into the queue of the worker that
//! ran it. A batch becomes runnable once its commit timestamp falls below the OLTP
//! watermark; tasks rescheduled by their hook additionally wait for the global
//! watermark, so analytical readers keep seeing relocated tombstones.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::types::{CommitTs, DtId, Result, TxId, WorkerId};

use super::{StagedEntry, TodoOutcome, TxManager};

/// One deferred hook call.
#[derive(Clone, Debug)]
pub(super) struct GcTask {
    pub(super) dt_id: DtId,
    pub(super) bytes: Vec<u8>,
    pub(super) called_before: bool,
}

#[derive(Debug)]
struct GcBatch {
    tx_id: TxId,
    commit_ts: CommitTs,
    tasks: Vec<GcTask>,
}

/// Counters from one [`TxManager::collect_garbage`] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Todos that finished.
    pub done: usize,
    /// Todos that asked to run again later.
    pub rescheduled: usize,
    /// Todos kept because their transaction is not old enough yet.
    pub deferred: usize,
    /// Todos whose data structure is gone.
    pub dropped: usize,
    /// Commit-table entries pruned.
    pub pruned: usize,
}

/// Per-worker queues of committed todo batches, oldest first.
pub(super) struct GcQueue {
    workers: Vec<Mutex<VecDeque<GcBatch>>>,
}

impl GcQueue {
    pub(super) fn new(workers: usize) -> Self {
        Self {
            workers: (0..workers).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    pub(super) fn push(
        &self,
        worker_id: WorkerId,
        tx_id: TxId,
        commit_ts: CommitTs,
        todos: Vec<StagedEntry>,
    ) {
        if todos.is_empty() {
            return;
        }
        let Some(queue) = self.workers.get(worker_id as usize) else {
            return;
        };
        let tasks = todos
            .into_iter()
            .map(|entry| GcTask {
                dt_id: entry.dt_id,
                bytes: entry.bytes,
                called_before: false,
            })
            .collect::<Vec<_>>();
        trace!(worker = worker_id, tx = tx_id, tasks = tasks.len(), "gc.queue.push");
        queue.lock().push_back(GcBatch {
            tx_id,
            commit_ts,
            tasks,
        });
    }

    pub(super) fn pending(&self) -> usize {
        self.workers
            .iter()
            .map(|q| q.lock().iter().map(|b| b.tasks.len()).sum::<usize>())
            .sum()
    }

    /// Runs every ready task through `run`. `Ok(None)` from `run` drops the task.
    pub(super) fn drain(
        &self,
        oltp_watermark: TxId,
        global_watermark: TxId,
        mut run: impl FnMut(&GcTask, WorkerId, TxId) -> Result<Option<TodoOutcome>>,
    ) -> Result<GcStats> {
        let mut stats = GcStats::default();
        for (worker, queue) in self.workers.iter().enumerate() {
            let worker_id = worker as WorkerId;
            let ready: Vec<GcBatch> = {
                let mut queue = queue.lock();
                let n = queue
                    .iter()
                    .take_while(|b| b.commit_ts < oltp_watermark)
                    .count();
                queue.drain(..n).collect()
            };
            let mut kept: Vec<GcBatch> = Vec::new();
            let mut failure = None;
            for mut batch in ready {
                if failure.is_some() {
                    kept.push(batch);
                    continue;
                }
                let mut remaining = Vec::new();
                let mut tasks = std::mem::take(&mut batch.tasks).into_iter();
                for mut task in tasks.by_ref() {
                    if task.called_before && batch.commit_ts >= global_watermark {
                        stats.deferred += 1;
                        remaining.push(task);
                        continue;
                    }
                    match run(&task, worker_id, batch.tx_id) {
                        Ok(Some(TodoOutcome::Done)) => stats.done += 1,
                        Ok(Some(TodoOutcome::Reschedule)) => {
                            stats.rescheduled += 1;
                            task.called_before = true;
                            remaining.push(task);
                        }
                        Ok(None) => stats.dropped += 1,
                        Err(err) => {
                            remaining.push(task);
                            failure = Some(err);
                            break;
                        }
                    }
                }
                remaining.extend(tasks);
                if !remaining.is_empty() {
                    batch.tasks = remaining;
                    kept.push(batch);
                }
            }
            if !kept.is_empty() {
                let mut queue = queue.lock();
                for batch in kept.into_iter().rev() {
                    queue.push_front(batch);
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
        if stats.done + stats.rescheduled + stats.dropped > 0 {
            debug!(
                done = stats.done,
                rescheduled = stats.rescheduled,
                deferred = stats.deferred,
                dropped = stats.dropped,
                "gc.drain"
            );
        }
        Ok(stats)
    }
}

struct Signal {
    stop: Mutex<bool>,
    wakeup: Condvar,
}

/// Background thread that periodically runs [`TxManager::collect_garbage`].
pub struct GcWorker {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    /// Spawns the worker; it drains every `interval` or when woken.
    pub fn spawn(manager: Arc<TxManager>, interval: Duration) -> Self {
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = thread::spawn(move || Self::worker_loop(manager, thread_signal, interval));
        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Requests an immediate pass.
    pub fn wake(&self) {
        self.signal.wakeup.notify_one();
    }

    /// Stops the thread and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        *self.signal.stop.lock() = true;
        self.signal.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("gc.worker.panicked");
            }
        }
    }

    fn worker_loop(manager: Arc<TxManager>, signal: Arc<Signal>, interval: Duration) {
        loop {
            {
                let mut stop = signal.stop.lock();
                if *stop {
                    break;
                }
                signal.wakeup.wait_for(&mut stop, interval);
                if *stop {
                    break;
                }
            }
            if let Err(err) = manager.collect_garbage() {
                warn!(error = %err, "gc.worker.error");
            }
        }
        debug!("gc.worker.exit");
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
