//! Crash recovery over the manager's WAL.
//!
//! Analysis classifies transactions by their final frame. Redo replays the data
//! frames of every transaction that was not already rolled back, in log order,
//! against the (empty) registered structures. Undo then rolls back the
//! transactions that were still running at the crash, newest record first.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::primitives::wal::FrameKind;
use crate::types::{DtId, Result, TxId};

use super::TxManager;

/// Summary of a recovery run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Frames read from the log.
    pub frames: usize,
    /// Transactions with a commit frame.
    pub committed: usize,
    /// Transactions that were running at the crash and got rolled back.
    pub losers: usize,
    /// Data frames replayed.
    pub redone: usize,
    /// Data frames undone.
    pub undone: usize,
}

impl TxManager {
    /// Replays the WAL into the registered data structures.
    ///
    /// Every data structure named by the log must be registered before calling.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let frames = self.wal.frames();
        let mut report = RecoveryReport {
            frames: frames.len(),
            ..RecoveryReport::default()
        };

        let mut committed = FxHashSet::default();
        let mut aborted = FxHashSet::default();
        let mut writers = BTreeSet::new();
        let mut max_tx: TxId = 0;
        for frame in &frames {
            max_tx = max_tx.max(frame.tx_id);
            match frame.kind {
                FrameKind::Commit => {
                    committed.insert(frame.tx_id);
                }
                FrameKind::Abort => {
                    aborted.insert(frame.tx_id);
                }
                FrameKind::Data => {
                    writers.insert(frame.tx_id);
                }
            }
        }
        report.committed = committed.len();

        // runtime aborts finished their undo before the abort frame was written
        for frame in frames
            .iter()
            .filter(|f| f.kind == FrameKind::Data && !aborted.contains(&f.tx_id))
        {
            self.hooks(frame.dt_id)?
                .redo(&frame.payload, frame.worker_id, frame.tx_id)?;
            report.redone += 1;
        }

        let losers: BTreeSet<TxId> = writers
            .into_iter()
            .filter(|tx| !committed.contains(tx) && !aborted.contains(tx))
            .collect();
        for frame in frames
            .iter()
            .rev()
            .filter(|f| f.kind == FrameKind::Data && losers.contains(&f.tx_id))
        {
            self.hooks(frame.dt_id)?
                .undo(&frame.payload, frame.worker_id, frame.tx_id)?;
            report.undone += 1;
        }
        for tx in &losers {
            let worker = frames
                .iter()
                .find(|f| f.tx_id == *tx)
                .map(|f| f.worker_id)
                .unwrap_or_default();
            self.wal.append(FrameKind::Abort, *tx, worker, DtId(0), &[])?;
            debug!(tx, "recovery.abort_loser");
        }
        report.losers = losers.len();
        self.resume_after_recovery(max_tx, &losers);
        info!(
            frames = report.frames,
            committed = report.committed,
            losers = report.losers,
            redone = report.redone,
            undone = report.undone,
            "recovery.complete"
        );
        Ok(report)
    }
}
