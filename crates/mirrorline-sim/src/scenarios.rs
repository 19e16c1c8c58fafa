use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mirrorline_codec::frame::{split_frame_id, FRAME_ID_LEN};
use mirrorline_core::{ConnectionId, InstanceId};
use mirrorline_page::{
    ConnectionConfig, ConnectionError, EnqueueOutcome, PageConnection, PushOutcome,
};
use mirrorline_transport::memory::RecordingSink;
use mirrorline_transport::{FrameSink, SinkError, SinkHealthSnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Concurrent producer load against one connection.
#[derive(Debug, Clone, Copy)]
pub struct LoadScenario {
    pub producers: usize,
    pub batches_per_producer: usize,
    pub tasks_per_batch: usize,
    pub task_len: usize,
}

pub const PRACTICAL_BASELINE: LoadScenario = LoadScenario {
    producers: 4,
    batches_per_producer: 50,
    tasks_per_batch: 3,
    task_len: 32,
};

pub fn practical_baseline() -> LoadScenario {
    PRACTICAL_BASELINE
}

impl LoadScenario {
    pub fn total_tasks(&self) -> usize {
        self.producers * self.batches_per_producer * self.tasks_per_batch
    }
}

const TAG_LEN: usize = 8;

/// Task blob tagged with its producer and per-producer sequence number.
pub fn tagged_task(producer: usize, seq: usize, len: usize) -> Vec<u8> {
    let mut task = Vec::with_capacity(len.max(TAG_LEN));
    task.extend_from_slice(&(producer as u32).to_be_bytes());
    task.extend_from_slice(&(seq as u32).to_be_bytes());
    task.resize(len.max(TAG_LEN), b'.');
    task
}

pub fn parse_tagged_task(task: &[u8]) -> Option<(usize, usize)> {
    let producer = u32::from_be_bytes(task.get(0..4)?.try_into().ok()?);
    let seq = u32::from_be_bytes(task.get(4..TAG_LEN)?.try_into().ok()?);
    Some((producer as usize, seq as usize))
}

/// Frame as a lossless page sends it: 4-byte big-endian id, then the payload.
pub fn client_frame(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_ID_LEN + payload.len());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Splits lossless frames into `(id, payload)`, skipping undersized ones.
pub fn split_lossless(frames: &[Vec<u8>]) -> Vec<(u32, Vec<u8>)> {
    frames
        .iter()
        .filter_map(|frame| split_frame_id(frame))
        .map(|(id, payload)| (id, payload.to_vec()))
        .collect()
}

/// Runs `scenario` with one thread per producer, each calling `enqueue_and_push`.
pub fn run_producers(
    connection: &Arc<PageConnection>,
    scenario: LoadScenario,
) -> Vec<EnqueueOutcome> {
    let handles: Vec<_> = (0..scenario.producers)
        .map(|producer| {
            let connection = Arc::clone(connection);
            thread::spawn(move || {
                (0..scenario.batches_per_producer)
                    .map(|batch| {
                        let tasks = (0..scenario.tasks_per_batch)
                            .map(|i| {
                                let seq = batch * scenario.tasks_per_batch + i;
                                tagged_task(producer, seq, scenario.task_len)
                            })
                            .collect();
                        connection.enqueue_and_push(tasks)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap_or_default())
        .collect()
}

/// Random token writes over `keys` keys: `(key, value, time, id)`.
///
/// Times and ids are drawn from small ranges so that ties are common. No write
/// clears a token, since a cleared token keeps no stamp to order later writes by.
pub fn random_token_writes(
    seed: u64,
    keys: usize,
    writes: usize,
) -> Vec<(String, String, i64, i32)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..writes)
        .map(|n| {
            let key = format!("k{}", rng.gen_range(0..keys.max(1)));
            let time = rng.gen_range(1..40_i64);
            (key, format!("v{n}"), time, rng.gen_range(0..6_i32))
        })
        .collect()
}

/// Sink that records frames and the peak number of concurrent `send` calls.
pub struct ConcurrencyTrackingSink {
    inner: RecordingSink,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    send_delay: Duration,
}

impl ConcurrencyTrackingSink {
    pub fn new(send_delay: Duration) -> Self {
        Self {
            inner: RecordingSink::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            send_delay,
        }
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner.frames()
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.inner.fail_next_sends(count);
    }
}

impl FrameSink for ConcurrencyTrackingSink {
    fn send(&self, frame: &[u8]) -> Result<(), SinkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.send_delay.is_zero() {
            thread::sleep(self.send_delay);
        }
        let result = self.inner.send(frame);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn health_snapshot(&self) -> SinkHealthSnapshot {
        self.inner.health_snapshot()
    }
}

/// One simulated page: a connection plus the recording sink standing in for its socket.
pub struct SimPage {
    pub connection: Arc<PageConnection>,
    pub sink: Arc<RecordingSink>,
}

impl SimPage {
    pub fn open(id: u64, config: ConnectionConfig) -> Result<Self, ConnectionError> {
        let connection = PageConnection::open(
            ConnectionId(id),
            InstanceId::from(format!("page-{id}").as_str()),
            config,
        )?;
        Ok(Self {
            connection: Arc::new(connection),
            sink: Arc::new(RecordingSink::new()),
        })
    }

    pub fn attach(&self) -> PushOutcome {
        self.connection.attach_sink(self.sink.clone())
    }

    /// Payloads received so far, with frame ids stripped on lossless connections.
    pub fn delivered(&self) -> Vec<Vec<u8>> {
        let frames = self.sink.frames();
        if self.connection.is_lossless() {
            split_lossless(&frames)
                .into_iter()
                .map(|(_, payload)| payload)
                .collect()
        } else {
            frames
        }
    }

    pub fn delivered_ids(&self) -> Vec<u32> {
        split_lossless(&self.sink.frames())
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }
}
