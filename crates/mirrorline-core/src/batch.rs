/// An atomically enqueued, atomically sent group of opaque task blobs.
///
/// Slots are nulled out as they are sent so a batch that is pushed back after
/// a partial send never resends the blobs that already went out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskBatch {
    tasks: Vec<Option<Vec<u8>>>,
    current_size: usize,
    queue_entry_id: Option<u64>,
}

impl TaskBatch {
    /// Creates a batch from task blobs in delivery order.
    pub fn new(tasks: Vec<Vec<u8>>) -> Self {
        let current_size = tasks.iter().map(Vec::len).sum();
        Self {
            tasks: tasks.into_iter().map(Some).collect(),
            current_size,
            queue_entry_id: None,
        }
    }

    /// Creates a batch that remembers the disk queue entry it was read from.
    pub fn with_entry_id(queue_entry_id: u64, tasks: Vec<Vec<u8>>) -> Self {
        Self {
            queue_entry_id: Some(queue_entry_id),
            ..Self::new(tasks)
        }
    }

    /// Concatenates batches into one, preserving task order across inputs.
    pub fn concat(batches: impl IntoIterator<Item = TaskBatch>) -> Self {
        let mut tasks = Vec::new();
        for batch in batches {
            tasks.extend(batch.into_remaining());
        }
        Self::new(tasks)
    }

    /// Disk queue entry id, if this batch was read from a disk queue.
    pub fn queue_entry_id(&self) -> Option<u64> {
        self.queue_entry_id
    }

    /// Sum of the lengths of the blobs not yet sent.
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Number of task slots, sent or not.
    pub fn slot_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of blobs not yet sent.
    pub fn remaining_count(&self) -> usize {
        self.tasks.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns true when every blob has been sent (or there were none).
    pub fn is_drained(&self) -> bool {
        self.tasks.iter().all(Option::is_none)
    }

    /// Mutable access to the unsent blob at `index`.
    pub fn task_mut(&mut self, index: usize) -> Option<&mut Vec<u8>> {
        self.tasks.get_mut(index).and_then(Option::as_mut)
    }

    /// Marks the blob at `index` as sent and returns its length.
    ///
    /// Returns 0 when the slot is already empty, so repeated calls are harmless.
    pub fn nullify(&mut self, index: usize) -> usize {
        let freed = self
            .tasks
            .get_mut(index)
            .and_then(Option::take)
            .map_or(0, |task| task.len());
        self.current_size -= freed;
        freed
    }

    /// Iterates over unsent blobs in order.
    pub fn remaining(&self) -> impl Iterator<Item = &[u8]> {
        self.tasks.iter().filter_map(|slot| slot.as_deref())
    }

    /// Consumes the batch, returning unsent blobs in order.
    pub fn into_remaining(self) -> Vec<Vec<u8>> {
        self.tasks.into_iter().flatten().collect()
    }
}
