use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use mirrorline_codec::batch_file::{decode_batch_file, encode_batch_file};
use mirrorline_core::TaskBatch;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::queue::{BatchQueue, QueueError, QueueRejected};

/// File extension of persisted batches.
pub const BATCH_FILE_EXTENSION: &str = "batch";

/// File-backed batch FIFO: one file per batch, named by its write id.
///
/// Write ids are allocated under a lock that also marks the id as in progress,
/// so a reader never opens a file whose write has not finished. A reader that
/// reaches an in-progress id reports the queue as empty for now.
///
/// Entries that cannot be read back are skipped. Their unsent size is kept in
/// memory so the owner can still release it through `take_dropped_bytes`.
#[derive(Debug)]
pub struct DiskBatchQueue {
    dir: PathBuf,
    read_id: AtomicU64,
    write_id: AtomicU64,
    in_progress: Mutex<HashSet<u64>>,
    /// Ids returned to the head by `push_front`, consulted before `read_id`.
    first_unread: Mutex<VecDeque<u64>>,
    /// Unsent bytes of every entry still on disk.
    sizes: Mutex<HashMap<u64, usize>>,
    dropped_bytes: AtomicUsize,
}

impl DiskBatchQueue {
    /// Creates `dir` as the queue directory.
    ///
    /// Leftover batch files from an earlier process are removed, not replayed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let dir = dir.into();
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(dir = %dir.display(), "removed stale queue directory"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(QueueError::Io { path: dir, source }),
        }
        fs::create_dir_all(&dir).map_err(|source| QueueError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            read_id: AtomicU64::new(0),
            write_id: AtomicU64::new(0),
            in_progress: Mutex::new(HashSet::new()),
            first_unread: Mutex::new(VecDeque::new()),
            sizes: Mutex::new(HashMap::new()),
            dropped_bytes: AtomicUsize::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.{BATCH_FILE_EXTENSION}"))
    }

    fn allocate_write_id(&self) -> u64 {
        let mut in_progress = self.in_progress.lock();
        let id = self.write_id.load(Ordering::Acquire) + 1;
        in_progress.insert(id);
        self.write_id.store(id, Ordering::Release);
        id
    }

    fn write_entry(&self, id: u64, batch: &TaskBatch) -> Result<(), QueueError> {
        let bytes = encode_batch_file(batch)?;
        let path = self.entry_path(id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|source| QueueError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| QueueError::Io { path, source })
    }

    fn read_entry(&self, id: u64) -> Result<TaskBatch, QueueError> {
        let path = self.entry_path(id);
        let bytes = fs::read(&path).map_err(|source| QueueError::Io {
            path: path.clone(),
            source,
        })?;
        let tasks = decode_batch_file(&bytes)?;
        fs::remove_file(&path).map_err(|source| QueueError::Io { path, source })?;
        Ok(TaskBatch::with_entry_id(id, tasks))
    }

    fn take_entry(&self, id: u64) -> Option<TaskBatch> {
        match self.read_entry(id) {
            Ok(batch) => {
                self.sizes.lock().remove(&id);
                Some(batch)
            }
            Err(err) => {
                let lost = self.discard_entry(id);
                error!(
                    dir = %self.dir.display(),
                    id,
                    lost_bytes = lost,
                    error = %err,
                    "dropping unreadable queue entry"
                );
                self.dropped_bytes.fetch_add(lost, Ordering::AcqRel);
                None
            }
        }
    }

    /// Removes an entry without reading it and returns its unsent size.
    fn discard_entry(&self, id: u64) -> usize {
        let size = self.sizes.lock().remove(&id).unwrap_or(0);
        let path = self.entry_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to remove queue entry")
            }
        }
        size
    }

    fn claim_next_id(&self) -> Option<u64> {
        loop {
            let read = self.read_id.load(Ordering::Acquire);
            if read >= self.write_id.load(Ordering::Acquire) {
                return None;
            }
            let next = read + 1;
            if self.in_progress.lock().contains(&next) {
                return None;
            }
            if self
                .read_id
                .compare_exchange(read, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(next);
            }
        }
    }
}

impl BatchQueue for DiskBatchQueue {
    fn push_back(&self, batch: TaskBatch) -> Result<(), QueueRejected> {
        let id = self.allocate_write_id();
        let written = self.write_entry(id, &batch);
        if written.is_ok() {
            self.sizes.lock().insert(id, batch.current_size());
        }
        self.in_progress.lock().remove(&id);
        match written {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(dir = %self.dir.display(), id, error = %err, "failed to persist batch");
                Err(QueueRejected::new(batch, err))
            }
        }
    }

    fn pop_front(&self) -> Option<TaskBatch> {
        loop {
            let returned = self.first_unread.lock().pop_front();
            let id = match returned {
                Some(id) => id,
                None => self.claim_next_id()?,
            };
            if let Some(batch) = self.take_entry(id) {
                return Some(batch);
            }
        }
    }

    fn push_front(&self, batch: TaskBatch) -> Result<(), QueueRejected> {
        let Some(id) = batch.queue_entry_id() else {
            return Err(QueueRejected::new(batch, QueueError::MissingEntryId));
        };
        if let Err(err) = self.write_entry(id, &batch) {
            error!(dir = %self.dir.display(), id, error = %err, "failed to return batch to queue head");
            return Err(QueueRejected::new(batch, err));
        }
        self.sizes.lock().insert(id, batch.current_size());
        self.first_unread.lock().push_front(id);
        Ok(())
    }

    fn len(&self) -> usize {
        let written = self.write_id.load(Ordering::Acquire);
        let read = self.read_id.load(Ordering::Acquire);
        let pending = usize::try_from(written.saturating_sub(read)).unwrap_or(usize::MAX);
        pending.saturating_add(self.first_unread.lock().len())
    }

    fn clear(&self) -> usize {
        let mut ids: Vec<u64> = self.first_unread.lock().drain(..).collect();
        while let Some(id) = self.claim_next_id() {
            ids.push(id);
        }
        let dropped: usize = ids.into_iter().map(|id| self.discard_entry(id)).sum();
        dropped + self.take_dropped_bytes()
    }

    fn take_dropped_bytes(&self) -> usize {
        self.dropped_bytes.swap(0, Ordering::AcqRel)
    }

    fn dispose(&self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "removed queue directory"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                error!(dir = %self.dir.display(), error = %err, "failed to remove queue directory")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use mirrorline_core::TaskBatch;

    use super::DiskBatchQueue;
    use crate::queue::{BatchQueue, QueueError};

    fn batch(parts: &[&[u8]]) -> TaskBatch {
        TaskBatch::new(parts.iter().map(|p| p.to_vec()).collect())
    }

    #[test]
    fn batches_round_trip_in_order_and_files_are_removed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = DiskBatchQueue::open(tmp.path().join("out")).expect("open queue");

        queue.push_back(batch(&[b"a", b"bc"])).expect("push 1");
        queue.push_back(batch(&[b"d"])).expect("push 2");
        assert_eq!(queue.len(), 2);
        assert!(queue.entry_path(1).exists());

        let first = queue.pop_front().expect("first");
        assert_eq!(first.queue_entry_id(), Some(1));
        assert_eq!(first.into_remaining(), vec![b"a".to_vec(), b"bc".to_vec()]);
        assert!(!queue.entry_path(1).exists());

        let second = queue.pop_front().expect("second");
        assert_eq!(second.into_remaining(), vec![b"d".to_vec()]);
        assert!(queue.pop_front().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn push_front_reuses_entry_id_and_reads_before_newer_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = DiskBatchQueue::open(tmp.path()).expect("open queue");
        queue.push_back(batch(&[b"x1", b"x2"])).expect("push x");
        queue.push_back(batch(&[b"y"])).expect("push y");

        let mut head = queue.pop_front().expect("head");
        let sent = head.nullify(0);
        assert_eq!(sent, 2);
        queue.push_front(head).expect("push front");
        assert!(queue.entry_path(1).exists());
        assert_eq!(queue.len(), 2);

        let retried = queue.pop_front().expect("retried");
        assert_eq!(retried.queue_entry_id(), Some(1));
        assert_eq!(retried.into_remaining(), vec![b"x2".to_vec()]);
        let next = queue.pop_front().expect("next");
        assert_eq!(next.into_remaining(), vec![b"y".to_vec()]);
    }

    #[test]
    fn push_front_without_entry_id_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = DiskBatchQueue::open(tmp.path()).expect("open queue");
        let rejected = queue
            .push_front(batch(&[b"orphan"]))
            .expect_err("batch without entry id");
        assert!(matches!(rejected.error, QueueError::MissingEntryId));
        assert_eq!(rejected.batch.current_size(), 6);
    }

    #[test]
    fn unreadable_entry_is_skipped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = DiskBatchQueue::open(tmp.path()).expect("open queue");
        queue.push_back(batch(&[b"lost"])).expect("push");
        queue.push_back(batch(&[b"kept"])).expect("push");
        std::fs::write(queue.entry_path(1), [0xFF, 0xFF]).expect("corrupt entry");

        let next = queue.pop_front().expect("second entry");
        assert_eq!(next.into_remaining(), vec![b"kept".to_vec()]);
        assert!(!queue.entry_path(1).exists());
        assert_eq!(queue.take_dropped_bytes(), 4);
        assert_eq!(queue.take_dropped_bytes(), 0);
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn clear_discards_past_unreadable_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = DiskBatchQueue::open(tmp.path()).expect("open queue");
        queue.push_back(batch(&[b"abc"])).expect("push");
        queue.push_back(batch(&[b"de"])).expect("push");
        queue.push_back(batch(&[b"f"])).expect("push");
        std::fs::write(queue.entry_path(1), [0xFF]).expect("corrupt entry");
        std::fs::remove_file(queue.entry_path(2)).expect("remove entry");

        assert_eq!(queue.clear(), 6);
        assert!(queue.is_empty());
        assert!(queue.pop_front().is_none());
        assert!(!queue.entry_path(1).exists());
        assert!(!queue.entry_path(3).exists());
    }

    #[test]
    fn returned_batch_is_cleared_at_its_unsent_size() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = DiskBatchQueue::open(tmp.path()).expect("open queue");
        queue.push_back(batch(&[b"ab", b"cde"])).expect("push");
        queue.push_back(batch(&[b"f"])).expect("push");

        let mut head = queue.pop_front().expect("head");
        head.nullify(0);
        queue.push_front(head).expect("push front");
        assert_eq!(queue.clear(), 4);
    }

    #[test]
    fn clear_and_dispose_remove_everything() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("conn-1").join("out");
        let queue = DiskBatchQueue::open(&dir).expect("open queue");
        queue.push_back(batch(&[b"abc"])).expect("push");
        queue.push_back(batch(&[b"de"])).expect("push");
        assert_eq!(queue.clear(), 5);
        queue.dispose();
        assert!(!dir.exists());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(DiskBatchQueue::open(tmp.path()).expect("open queue"));

        let producers: Vec<_> = (0..4u8)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..25u8 {
                        queue.push_back(batch(&[&[p, i]])).expect("push");
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("producer thread");
        }

        let mut seen = Vec::new();
        while let Some(batch) = queue.pop_front() {
            seen.extend(batch.into_remaining());
        }
        assert_eq!(seen.len(), 100);
        for p in 0..4u8 {
            let order: Vec<u8> = seen.iter().filter(|b| b[0] == p).map(|b| b[1]).collect();
            assert_eq!(order, (0..25u8).collect::<Vec<_>>());
        }
    }
}
