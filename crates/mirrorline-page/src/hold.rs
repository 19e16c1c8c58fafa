use mirrorline_core::TaskBatch;
use parking_lot::RwLock;
use tracing::debug;

use crate::queue::{BatchQueue, QueueRejected};

/// Where an enqueued batch ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Placement {
    Queued,
    Held,
    /// The admission check failed; the batch is handed back untouched.
    Refused(TaskBatch),
}

/// Result of merging the hold buffer into the main queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged_batches: usize,
    pub merged_bytes: usize,
}

/// Hold counter plus the queue of batches produced while held.
///
/// Producers take the read side of the counter lock, so many can enqueue at
/// once. Merging takes the write side, which keeps a batch from landing in the
/// hold queue after the merge emptied it.
pub struct HoldBuffer {
    holds: RwLock<usize>,
    held: Box<dyn BatchQueue>,
}

impl HoldBuffer {
    pub fn new(held: Box<dyn BatchQueue>) -> Self {
        Self {
            holds: RwLock::new(0),
            held,
        }
    }

    /// Routes a batch to the hold queue while held, else to `main`.
    pub fn offer(
        &self,
        batch: TaskBatch,
        main: &dyn BatchQueue,
    ) -> Result<Placement, QueueRejected> {
        self.offer_if(batch, main, || true)
    }

    /// Like `offer`, but first runs `admit` while producers are still excluded
    /// from `discard_all`.
    pub fn offer_if(
        &self,
        batch: TaskBatch,
        main: &dyn BatchQueue,
        admit: impl FnOnce() -> bool,
    ) -> Result<Placement, QueueRejected> {
        let holds = self.holds.read();
        if !admit() {
            return Ok(Placement::Refused(batch));
        }
        if *holds > 0 {
            self.held.push_back(batch)?;
            Ok(Placement::Held)
        } else {
            main.push_back(batch)?;
            Ok(Placement::Queued)
        }
    }

    /// Increments the hold count and returns the new value.
    pub fn hold(&self) -> usize {
        let mut holds = self.holds.write();
        *holds += 1;
        *holds
    }

    /// Decrements the hold count (never below zero), merging when it reaches zero.
    pub fn unhold(&self, main: &dyn BatchQueue) -> Result<MergeReport, QueueRejected> {
        let mut holds = self.holds.write();
        *holds = holds.saturating_sub(1);
        if *holds > 0 {
            return Ok(MergeReport::default());
        }
        self.merge_into(main)
    }

    /// Merges held batches into `main` without touching the hold count.
    pub fn flush(&self, main: &dyn BatchQueue) -> Result<MergeReport, QueueRejected> {
        let _holds = self.holds.write();
        self.merge_into(main)
    }

    pub fn is_held(&self) -> bool {
        *self.holds.read() > 0
    }

    pub fn hold_count(&self) -> usize {
        *self.holds.read()
    }

    /// Held batch count; approximate for disk-backed hold queues.
    pub fn depth(&self) -> usize {
        self.held.len()
    }

    /// Unsent bytes of held entries the backing store lost since the last call.
    pub fn take_dropped_bytes(&self) -> usize {
        self.held.take_dropped_bytes()
    }

    /// Drops every held batch and everything in `main`, returning the unsent bytes discarded.
    pub fn discard_all(&self, main: &dyn BatchQueue) -> usize {
        let _holds = self.holds.write();
        self.held.clear() + main.clear()
    }

    pub fn dispose(&self) {
        self.held.dispose();
    }

    fn merge_into(&self, main: &dyn BatchQueue) -> Result<MergeReport, QueueRejected> {
        let mut held = Vec::new();
        while let Some(batch) = self.held.pop_front() {
            held.push(batch);
        }
        if held.is_empty() {
            return Ok(MergeReport::default());
        }
        let merged_batches = held.len();
        let merged = TaskBatch::concat(held);
        let merged_bytes = merged.current_size();
        main.push_back(merged)?;
        debug!(merged_batches, merged_bytes, "merged held batches");
        Ok(MergeReport {
            merged_batches,
            merged_bytes,
        })
    }
}
