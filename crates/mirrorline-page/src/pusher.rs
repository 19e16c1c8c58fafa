use mirrorline_codec::frame::stamp_frame_id;
use mirrorline_core::{ConnectionId, TaskBatch};
use mirrorline_transport::{FrameSink, SinkError};
use tracing::{debug, error, warn};

use crate::drain::{DrainGate, PushPriority};
use crate::gate::BackpressureGate;
use crate::loss::PayloadLossGuard;
use crate::queue::BatchQueue;

/// Counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: usize,
    pub frames: usize,
    pub bytes: usize,
    /// Tasks the transport can never accept, dropped instead of retried.
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The queue was emptied.
    Drained(DrainReport),
    /// Stopped early to let a waiting caller of equal or higher priority drain.
    Yielded(DrainReport),
    /// A send failed; the unsent remainder is back at the queue head.
    SendFailed {
        report: DrainReport,
        error: SinkError,
    },
    /// Another caller is already queued to drain and will pick up this work.
    Deferred,
    /// No transport is attached or it is not open.
    NoSink,
    Closed,
}

impl PushOutcome {
    pub fn report(&self) -> DrainReport {
        match self {
            PushOutcome::Drained(report) | PushOutcome::Yielded(report) => *report,
            PushOutcome::SendFailed { report, .. } => *report,
            _ => DrainReport::default(),
        }
    }
}

/// Borrowed connection state a drain pass works on.
pub struct DrainContext<'a> {
    pub connection: &'a ConnectionId,
    pub queue: &'a dyn BatchQueue,
    pub sink: &'a dyn FrameSink,
    pub output_gate: &'a BackpressureGate,
    pub loss_guard: &'a PayloadLossGuard,
}

/// Single-flight drainer moving queued batches to the sink in FIFO order.
#[derive(Debug, Default)]
pub struct Pusher {
    gate: DrainGate,
}

impl Pusher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_draining(&self) -> bool {
        self.gate.is_active()
    }

    /// Drains the queue until it is empty, a send fails, or a waiter should go first.
    pub fn push(&self, ctx: &DrainContext<'_>, priority: PushPriority) -> PushOutcome {
        let Some(guard) = self.gate.enter(priority) else {
            return PushOutcome::Deferred;
        };

        let mut report = DrainReport::default();
        loop {
            if report.batches > 0 && guard.should_yield() {
                debug!(connection = %ctx.connection, ?priority, "yielding drain to waiting push");
                return PushOutcome::Yielded(report);
            }
            let popped = ctx.queue.pop_front();
            release_lost_entries(ctx);
            let Some(mut batch) = popped else {
                return PushOutcome::Drained(report);
            };
            if let Err(error) = send_batch(ctx, &mut batch, &mut report) {
                warn!(
                    connection = %ctx.connection,
                    error = %error,
                    remaining = batch.remaining_count(),
                    "send failed; returning batch to queue head"
                );
                if let Err(rejected) = ctx.queue.push_front(batch) {
                    error!(
                        connection = %ctx.connection,
                        error = %rejected.error,
                        "could not return batch to queue; dropping it"
                    );
                    ctx.output_gate.release(rejected.batch.current_size());
                }
                return PushOutcome::SendFailed { report, error };
            }
            report.batches += 1;
        }
    }
}

/// Releases the gate bytes of queue entries the backing store could not read.
fn release_lost_entries(ctx: &DrainContext<'_>) {
    let lost = ctx.queue.take_dropped_bytes();
    if lost > 0 {
        ctx.output_gate.release(lost);
    }
}

fn send_batch(
    ctx: &DrainContext<'_>,
    batch: &mut TaskBatch,
    report: &mut DrainReport,
) -> Result<(), SinkError> {
    let lossless = ctx.loss_guard.enabled();
    for index in 0..batch.slot_count() {
        let Some(task) = batch.task_mut(index) else {
            continue;
        };
        if lossless {
            let id = ctx.loss_guard.next_server_id();
            if let Err(err) = stamp_frame_id(task, id) {
                ctx.loss_guard.rollback_server_id();
                error!(connection = %ctx.connection, error = %err, "dropping unstampable task");
                ctx.output_gate.release(batch.nullify(index));
                continue;
            }
        }
        match ctx.sink.send(task) {
            Ok(()) => {}
            Err(SinkError::PayloadTooLarge { hint }) => {
                if lossless {
                    ctx.loss_guard.rollback_server_id();
                }
                error!(
                    connection = %ctx.connection,
                    len = task.len(),
                    hint,
                    "dropping task larger than the transport accepts"
                );
                ctx.output_gate.release(batch.nullify(index));
                report.dropped += 1;
                continue;
            }
            Err(err) => {
                if lossless {
                    ctx.loss_guard.rollback_server_id();
                }
                return Err(err);
            }
        }
        let sent = batch.nullify(index);
        ctx.output_gate.release(sent);
        report.frames += 1;
        report.bytes += sent;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use mirrorline_codec::frame::{reserve_frame_id, split_frame_id};
    use mirrorline_core::{ConnectionId, TaskBatch};
    use mirrorline_transport::memory::RecordingSink;
    use mirrorline_transport::SinkError;

    use super::{DrainContext, PushOutcome, Pusher};
    use crate::config::GateMode;
    use crate::drain::PushPriority;
    use crate::gate::BackpressureGate;
    use crate::loss::PayloadLossGuard;
    use crate::queue::{BatchQueue, MemoryBatchQueue};

    struct Fixture {
        id: ConnectionId,
        queue: MemoryBatchQueue,
        sink: RecordingSink,
        gate: BackpressureGate,
        guard: PayloadLossGuard,
    }

    impl Fixture {
        fn new(lossless: bool) -> Self {
            Self {
                id: ConnectionId(1),
                queue: MemoryBatchQueue::new(),
                sink: RecordingSink::new(),
                gate: BackpressureGate::new(GateMode::Unbounded),
                guard: PayloadLossGuard::new(lossless),
            }
        }

        fn enqueue(&self, tasks: Vec<Vec<u8>>) {
            let batch = TaskBatch::new(tasks);
            self.gate.force_acquire(batch.current_size());
            self.queue.push_back(batch).expect("push");
        }

        fn ctx(&self) -> DrainContext<'_> {
            DrainContext {
                connection: &self.id,
                queue: &self.queue,
                sink: &self.sink,
                output_gate: &self.gate,
                loss_guard: &self.guard,
            }
        }
    }

    #[test]
    fn drains_all_batches_in_order() {
        let fx = Fixture::new(false);
        fx.enqueue(vec![b"a".to_vec(), b"b".to_vec()]);
        fx.enqueue(vec![b"c".to_vec()]);

        let outcome = Pusher::new().push(&fx.ctx(), PushPriority::Normal);
        let report = outcome.report();
        assert!(matches!(outcome, PushOutcome::Drained(_)));
        assert_eq!((report.batches, report.frames, report.bytes), (2, 3, 3));
        assert_eq!(
            fx.sink.frames(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(fx.gate.stats().outstanding_bytes(), 0);
    }

    #[test]
    fn failed_send_keeps_unsent_remainder_at_head() {
        let fx = Fixture::new(false);
        fx.enqueue(vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        fx.enqueue(vec![b"4".to_vec()]);

        fx.sink.fail_next_sends(1);
        let pusher = Pusher::new();
        let outcome = pusher.push(&fx.ctx(), PushPriority::Normal);
        assert!(matches!(
            outcome,
            PushOutcome::SendFailed {
                error: SinkError::Rejected(_),
                ..
            }
        ));
        assert_eq!(fx.queue.len(), 2);
        assert_eq!(fx.gate.stats().outstanding_bytes(), 4);

        assert!(matches!(
            pusher.push(&fx.ctx(), PushPriority::Normal),
            PushOutcome::Drained(_)
        ));
        assert_eq!(
            fx.sink.frames(),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]
        );
        assert_eq!(fx.gate.stats().outstanding_bytes(), 0);
    }

    #[test]
    fn oversized_task_is_dropped_and_the_rest_delivered() {
        let mut fx = Fixture::new(false);
        fx.sink = RecordingSink::with_max_send_bytes(2);
        fx.enqueue(vec![b"ok".to_vec(), b"too long".to_vec()]);
        fx.enqueue(vec![b"c".to_vec()]);

        let outcome = Pusher::new().push(&fx.ctx(), PushPriority::Normal);
        assert!(matches!(outcome, PushOutcome::Drained(_)));
        assert_eq!(outcome.report().dropped, 1);
        assert_eq!(fx.sink.frames(), vec![b"ok".to_vec(), b"c".to_vec()]);
        assert!(fx.queue.is_empty());
        assert_eq!(fx.gate.stats().outstanding_bytes(), 0);
    }

    #[test]
    fn oversized_lossless_task_does_not_consume_an_id() {
        let mut fx = Fixture::new(true);
        fx.sink = RecordingSink::with_max_send_bytes(6);
        fx.enqueue(vec![reserve_frame_id(b"a"), reserve_frame_id(b"far too long")]);
        fx.enqueue(vec![reserve_frame_id(b"b")]);

        let _ = Pusher::new().push(&fx.ctx(), PushPriority::Normal);
        let ids: Vec<u32> = fx
            .sink
            .frames()
            .iter()
            .map(|frame| split_frame_id(frame).expect("id frame").0)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(fx.gate.stats().outstanding_bytes(), 0);
    }

    #[test]
    fn lossless_ids_are_contiguous_across_failures() {
        let fx = Fixture::new(true);
        fx.enqueue(vec![reserve_frame_id(b"x"), reserve_frame_id(b"y")]);
        fx.enqueue(vec![reserve_frame_id(b"z")]);

        let pusher = Pusher::new();
        fx.sink.fail_next_sends(1);
        let _ = pusher.push(&fx.ctx(), PushPriority::Normal);
        let _ = pusher.push(&fx.ctx(), PushPriority::Normal);

        let ids: Vec<u32> = fx
            .sink
            .frames()
            .iter()
            .map(|frame| split_frame_id(frame).expect("id frame").0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(fx.guard.last_server_id(), 3);
    }
}
