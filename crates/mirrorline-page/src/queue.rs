use std::collections::VecDeque;
use std::path::PathBuf;

use mirrorline_codec::error::CodecError;
use mirrorline_core::TaskBatch;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("batch file codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("batch has no queue entry id; cannot return it to the queue head")]
    MissingEntryId,
}

/// A batch the queue could not take, handed back so its bytes can be accounted.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct QueueRejected {
    pub batch: TaskBatch,
    #[source]
    pub error: QueueError,
}

impl QueueRejected {
    pub fn new(batch: TaskBatch, error: QueueError) -> Self {
        Self { batch, error }
    }
}

/// FIFO of task batches with a retry-at-head operation.
pub trait BatchQueue: Send + Sync {
    fn push_back(&self, batch: TaskBatch) -> Result<(), QueueRejected>;

    fn pop_front(&self) -> Option<TaskBatch>;

    /// Returns a partially sent batch to the head of the queue.
    fn push_front(&self, batch: TaskBatch) -> Result<(), QueueRejected>;

    /// Queued batch count; may be approximate under concurrent use.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards everything queued and returns the unsent bytes dropped.
    fn clear(&self) -> usize {
        let mut dropped = 0;
        while let Some(batch) = self.pop_front() {
            dropped += batch.current_size();
        }
        dropped + self.take_dropped_bytes()
    }

    /// Unsent bytes of entries lost by the backing store since the last call.
    fn take_dropped_bytes(&self) -> usize {
        0
    }

    /// Releases backing resources once the owning connection is closed.
    fn dispose(&self) {}
}

#[derive(Debug, Default)]
pub struct MemoryBatchQueue {
    batches: Mutex<VecDeque<TaskBatch>>,
}

impl MemoryBatchQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchQueue for MemoryBatchQueue {
    fn push_back(&self, batch: TaskBatch) -> Result<(), QueueRejected> {
        self.batches.lock().push_back(batch);
        Ok(())
    }

    fn pop_front(&self) -> Option<TaskBatch> {
        self.batches.lock().pop_front()
    }

    fn push_front(&self, batch: TaskBatch) -> Result<(), QueueRejected> {
        self.batches.lock().push_front(batch);
        Ok(())
    }

    fn len(&self) -> usize {
        self.batches.lock().len()
    }

    fn clear(&self) -> usize {
        self.batches
            .lock()
            .drain(..)
            .map(|batch| batch.current_size())
            .sum()
    }
}
