use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mirrorline_codec::frame::reserve_frame_id;
use mirrorline_core::{ConnectionId, InstanceId, TaskBatch};
use mirrorline_transport::FrameSink;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, QueueBackend};
use crate::disk_queue::DiskBatchQueue;
use crate::drain::{DrainGate, PushPriority};
use crate::gate::{Acquire, BackpressureGate, GateStats};
use crate::hold::{HoldBuffer, MergeReport, Placement};
use crate::inbound::{ChunkAssembler, FrameDispatcher};
use crate::loss::{InboundVerdict, LossCause, PayloadLossGuard};
use crate::pusher::{DrainContext, PushOutcome, Pusher};
use crate::queue::{BatchQueue, MemoryBatchQueue, QueueError, QueueRejected};

/// Subdirectory names of a disk-backed connection.
pub const OUTBOUND_QUEUE_DIR: &str = "out";
pub const HELD_QUEUE_DIR: &str = "held";
pub const INBOUND_QUEUE_DIR: &str = "in";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to open connection queue: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Held,
    /// No tasks were given.
    Empty,
    /// The connection is in the loss state; the tasks were discarded.
    DroppedAfterLoss,
    /// The backing queue refused the batch; its bytes were released.
    QueueFailed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Queued for in-order processing.
    Accepted,
    /// Still collecting parts of a chunked frame.
    Partial,
    /// Refused because the connection is in the loss state or out of buffer space.
    Rejected,
    Closed,
}

/// Server end of one page instance's duplex connection.
///
/// Outbound tasks are enqueued as batches and drained to the attached sink by
/// a single-flight pusher. Inbound frames are checked against the lossless
/// sequence (when enabled) and handed to the dispatcher in receipt order.
pub struct PageConnection {
    id: ConnectionId,
    instance_id: InstanceId,
    config: ConnectionConfig,
    queue: Box<dyn BatchQueue>,
    hold: HoldBuffer,
    inbound: Box<dyn BatchQueue>,
    output_gate: BackpressureGate,
    input_gate: BackpressureGate,
    loss_guard: PayloadLossGuard,
    pusher: Pusher,
    inbound_drain: DrainGate,
    assembler: ChunkAssembler,
    sink: RwLock<Option<Arc<dyn FrameSink>>>,
    dispatcher: RwLock<Option<Arc<dyn FrameDispatcher>>>,
    valid: AtomicBool,
    last_activity: Mutex<Instant>,
    disk_dir: Option<PathBuf>,
}

impl PageConnection {
    pub fn open(
        id: ConnectionId,
        instance_id: InstanceId,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        let queues = open_queues(&id, &config.queue_backend)?;

        info!(
            connection = %id,
            instance = %instance_id,
            lossless = config.lossless(),
            output_gate = ?config.output_gate_mode(),
            input_gate = ?config.input_gate_mode(),
            "opened page connection"
        );
        Ok(Self {
            output_gate: BackpressureGate::new(config.output_gate_mode()),
            input_gate: BackpressureGate::new(config.input_gate_mode()),
            loss_guard: PayloadLossGuard::new(config.lossless()),
            id,
            instance_id,
            config,
            queue: queues.outbound,
            hold: HoldBuffer::new(queues.held),
            inbound: queues.inbound,
            pusher: Pusher::new(),
            inbound_drain: DrainGate::new(),
            assembler: ChunkAssembler::new(),
            sink: RwLock::new(None),
            dispatcher: RwLock::new(None),
            valid: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
            disk_dir: queues.disk_dir,
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn is_lossless(&self) -> bool {
        self.loss_guard.enabled()
    }

    /// True once payload loss was detected. Only a new connection recovers.
    pub fn is_loss_failed(&self) -> bool {
        self.loss_guard.is_failed()
    }

    /// Appends `tasks` as one batch, in order, waiting for outbound buffer space.
    ///
    /// While the connection is held the batch goes to the hold buffer instead.
    pub fn enqueue(&self, tasks: Vec<Vec<u8>>) -> EnqueueOutcome {
        if !self.is_valid() {
            return EnqueueOutcome::Closed;
        }
        if self.loss_guard.is_failed() {
            debug!(connection = %self.id, "dropping tasks after payload loss");
            return EnqueueOutcome::DroppedAfterLoss;
        }
        if tasks.is_empty() {
            return EnqueueOutcome::Empty;
        }

        let tasks = if self.loss_guard.enabled() {
            tasks.iter().map(|task| reserve_frame_id(task)).collect()
        } else {
            tasks
        };
        let batch = TaskBatch::new(tasks);
        let size = batch.current_size();

        match self.output_gate.acquire(size) {
            Acquire::Granted => {}
            Acquire::Bypassed => {
                debug!(connection = %self.id, size, "output buffer full; admitting batch anyway")
            }
            Acquire::TimedOut => {
                self.trigger_loss(LossCause::OutputBackpressure { requested: size });
                return EnqueueOutcome::DroppedAfterLoss;
            }
        }

        let placement =
            self.hold
                .offer_if(batch, self.queue.as_ref(), || !self.loss_guard.is_failed());
        match placement {
            Ok(Placement::Queued) => EnqueueOutcome::Queued,
            Ok(Placement::Held) => EnqueueOutcome::Held,
            Ok(Placement::Refused(batch)) => {
                self.output_gate.release(batch.current_size());
                EnqueueOutcome::DroppedAfterLoss
            }
            Err(rejected) => {
                self.release_rejected(rejected, "enqueue");
                EnqueueOutcome::QueueFailed
            }
        }
    }

    /// Drains queued batches to the attached sink.
    pub fn push(&self, priority: PushPriority) -> PushOutcome {
        if !self.is_valid() {
            return PushOutcome::Closed;
        }
        let sink = self.sink.read().clone();
        let Some(sink) = sink.filter(|sink| sink.is_open()) else {
            self.report_missing_sink();
            return PushOutcome::NoSink;
        };
        let ctx = DrainContext {
            connection: &self.id,
            queue: self.queue.as_ref(),
            sink: sink.as_ref(),
            output_gate: &self.output_gate,
            loss_guard: &self.loss_guard,
        };
        self.pusher.push(&ctx, priority)
    }

    /// `enqueue` followed by a normal-priority `push` when the batch was queued.
    pub fn enqueue_and_push(&self, tasks: Vec<Vec<u8>>) -> EnqueueOutcome {
        let outcome = self.enqueue(tasks);
        if outcome == EnqueueOutcome::Queued {
            self.push(PushPriority::Normal);
        }
        outcome
    }

    /// Diverts subsequent batches into the hold buffer. Holds nest.
    pub fn hold(&self) -> usize {
        let holds = self.hold.hold();
        debug!(connection = %self.id, holds, "hold");
        holds
    }

    /// Releases one hold; at zero the held batches are merged and pushed.
    pub fn unhold(&self) -> MergeReport {
        let merged = self.hold.unhold(self.queue.as_ref());
        let report = self.settle_merge(merged);
        if !self.hold.is_held() {
            self.push(PushPriority::Normal);
        }
        report
    }

    /// Merges and pushes held batches without changing the hold count.
    pub fn flush_held(&self) -> MergeReport {
        let merged = self.hold.flush(self.queue.as_ref());
        let report = self.settle_merge(merged);
        self.push(PushPriority::Normal);
        report
    }

    pub fn is_held(&self) -> bool {
        self.hold.is_held()
    }

    /// Queued batch count (approximate for disk queues).
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn held_depth(&self) -> usize {
        self.hold.depth()
    }

    pub fn output_stats(&self) -> GateStats {
        self.output_gate.stats()
    }

    pub fn input_stats(&self) -> GateStats {
        self.input_gate.stats()
    }

    /// Attaches (or replaces) the outbound transport and pushes what accumulated.
    pub fn attach_sink(&self, sink: Arc<dyn FrameSink>) -> PushOutcome {
        *self.sink.write() = Some(sink);
        self.touch();
        debug!(connection = %self.id, "sink attached");
        self.push(PushPriority::Normal)
    }

    pub fn detach_sink(&self) -> Option<Arc<dyn FrameSink>> {
        self.sink.write().take()
    }

    /// Detaches `sink` only if it is still the attached one.
    pub fn detach_sink_if(&self, sink: &Arc<dyn FrameSink>) -> bool {
        let mut current = self.sink.write();
        if current.as_ref().is_some_and(|attached| Arc::ptr_eq(attached, sink)) {
            *current = None;
            return true;
        }
        false
    }

    pub fn has_sink(&self) -> bool {
        self.sink.read().is_some()
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn FrameDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    /// Time since the last client activity (inbound frame or sink attach).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Accepts one complete inbound frame and processes pending frames in order.
    pub fn on_frame_received(&self, frame: Vec<u8>) -> InboundOutcome {
        if !self.is_valid() {
            return InboundOutcome::Closed;
        }
        if self.loss_guard.is_failed() {
            return InboundOutcome::Rejected;
        }
        self.touch();

        let size = frame.len();
        match self.input_gate.acquire(size) {
            Acquire::Granted => {}
            Acquire::Bypassed => {
                debug!(connection = %self.id, size, "input buffer full; admitting frame anyway")
            }
            Acquire::TimedOut => {
                self.trigger_loss(LossCause::InputBackpressure { requested: size });
                return InboundOutcome::Rejected;
            }
        }
        if let Err(rejected) = self.inbound.push_back(TaskBatch::new(vec![frame])) {
            error!(connection = %self.id, error = %rejected.error, "failed to queue inbound frame");
            self.input_gate.release(rejected.batch.current_size());
            return InboundOutcome::Rejected;
        }
        self.process_inbound();
        InboundOutcome::Accepted
    }

    /// Accepts one transport part of a possibly chunked inbound frame.
    pub fn on_frame_part(&self, part: Vec<u8>, last: bool) -> InboundOutcome {
        match self.assembler.on_part(part, last) {
            Some(frame) => self.on_frame_received(frame),
            None => InboundOutcome::Partial,
        }
    }

    /// Marks the connection invalid, drops queued content and removes disk state.
    pub fn close(&self) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        self.sink.write().take();
        self.dispatcher.write().take();
        let dropped = self.hold.discard_all(self.queue.as_ref());
        self.output_gate.release(dropped);
        self.input_gate.release(self.inbound.clear());
        self.queue.dispose();
        self.hold.dispose();
        self.inbound.dispose();
        if let Some(dir) = &self.disk_dir {
            if let Err(err) = fs::remove_dir(dir) {
                debug!(dir = %dir.display(), error = %err, "connection directory not removed");
            }
        }
        info!(connection = %self.id, dropped_bytes = dropped, "closed page connection");
    }

    fn process_inbound(&self) {
        let Some(_guard) = self.inbound_drain.enter(PushPriority::Normal) else {
            return;
        };
        let dispatcher = self.dispatcher.read().clone();
        while let Some(batch) = self.inbound.pop_front() {
            for frame in batch.into_remaining() {
                self.handle_inbound(&frame, dispatcher.as_deref());
                self.input_gate.release(frame.len());
            }
        }
        let lost = self.inbound.take_dropped_bytes();
        if lost > 0 {
            self.input_gate.release(lost);
        }
    }

    fn handle_inbound(&self, frame: &[u8], dispatcher: Option<&dyn FrameDispatcher>) {
        match self.loss_guard.check_inbound(frame) {
            InboundVerdict::Accept(payload) => match dispatcher {
                Some(dispatcher) => dispatcher.dispatch(payload),
                None => debug!(connection = %self.id, "no dispatcher; dropping inbound payload"),
            },
            InboundVerdict::Drop => {
                debug!(connection = %self.id, len = frame.len(), "ignoring undersized frame")
            }
            InboundVerdict::Gap { expected, received } => {
                self.trigger_loss(LossCause::SequenceGap { expected, received });
            }
            InboundVerdict::Rejected => {
                debug!(connection = %self.id, "rejecting frame after payload loss")
            }
        }
    }

    /// Enters the loss state once and runs the configured loss action.
    fn trigger_loss(&self, cause: LossCause) {
        if !self.loss_guard.mark_failed() {
            return;
        }
        warn!(connection = %self.id, ?cause, "payload loss detected");
        let Some(action) = self.config.loss_action.as_ref() else {
            return;
        };

        let dropped = self.hold.discard_all(self.queue.as_ref());
        self.output_gate.release(dropped);
        let recovery_queued = match &action.recovery_task {
            Some(task) => self.queue_recovery(task),
            None => false,
        };
        if let Some(on_loss) = &action.on_loss {
            on_loss(cause);
        }
        if recovery_queued {
            self.push(PushPriority::Urgent);
        }
    }

    fn queue_recovery(&self, task: &[u8]) -> bool {
        let batch = TaskBatch::new(vec![reserve_frame_id(task)]);
        self.output_gate.force_acquire(batch.current_size());
        match self.queue.push_back(batch) {
            Ok(()) => true,
            Err(rejected) => {
                self.release_rejected(rejected, "recovery");
                false
            }
        }
    }

    fn settle_merge(&self, merged: Result<MergeReport, QueueRejected>) -> MergeReport {
        let lost = self.hold.take_dropped_bytes();
        if lost > 0 {
            self.output_gate.release(lost);
        }
        match merged {
            Ok(report) => report,
            Err(rejected) => {
                self.release_rejected(rejected, "merge");
                MergeReport::default()
            }
        }
    }

    fn release_rejected(&self, rejected: QueueRejected, stage: &'static str) {
        error!(
            connection = %self.id,
            stage,
            error = %rejected.error,
            dropped_bytes = rejected.batch.current_size(),
            "queue refused batch"
        );
        self.output_gate.release(rejected.batch.current_size());
    }

    fn report_missing_sink(&self) {
        let idle = self.idle_for();
        if idle >= self.config.missing_sink_warn_after {
            warn!(connection = %self.id, idle_secs = idle.as_secs(), "push without an attached sink");
        } else {
            debug!(connection = %self.id, "push without an attached sink");
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

struct ConnectionQueues {
    outbound: Box<dyn BatchQueue>,
    held: Box<dyn BatchQueue>,
    inbound: Box<dyn BatchQueue>,
    disk_dir: Option<PathBuf>,
}

fn open_queues(id: &ConnectionId, backend: &QueueBackend) -> Result<ConnectionQueues, QueueError> {
    match backend {
        QueueBackend::Memory => Ok(ConnectionQueues {
            outbound: Box::new(MemoryBatchQueue::new()),
            held: Box::new(MemoryBatchQueue::new()),
            inbound: Box::new(MemoryBatchQueue::new()),
            disk_dir: None,
        }),
        QueueBackend::Disk { base_dir } => {
            let dir = base_dir.join(id.to_string());
            Ok(ConnectionQueues {
                outbound: Box::new(DiskBatchQueue::open(dir.join(OUTBOUND_QUEUE_DIR))?),
                held: Box::new(DiskBatchQueue::open(dir.join(HELD_QUEUE_DIR))?),
                inbound: Box::new(DiskBatchQueue::open(dir.join(INBOUND_QUEUE_DIR))?),
                disk_dir: Some(dir),
            })
        }
    }
}

impl Drop for PageConnection {
    fn drop(&mut self) {
        self.close();
    }
}
