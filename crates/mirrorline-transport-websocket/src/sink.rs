use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mirrorline_transport::{FrameSink, SinkError, SinkHealthSnapshot};
use tokio::sync::mpsc as tokio_mpsc;

use crate::MetricsInner;

/// `FrameSink` feeding one WebSocket client's writer task.
///
/// `send` never blocks: a full client queue reports `QueueFull` and marks the
/// sink stalled, so the writer task can ask for another push once it drains.
#[derive(Debug)]
pub struct WebSocketFrameSink {
    tx: tokio_mpsc::Sender<Vec<u8>>,
    open: AtomicBool,
    stalled: AtomicBool,
    max_payload_hint: Option<usize>,
    metrics: Arc<MetricsInner>,
}

impl WebSocketFrameSink {
    pub(crate) fn new(
        tx: tokio_mpsc::Sender<Vec<u8>>,
        max_payload_hint: Option<usize>,
        metrics: Arc<MetricsInner>,
    ) -> Self {
        Self {
            tx,
            open: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            max_payload_hint,
            metrics,
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Clears and returns the stalled flag.
    pub(crate) fn take_stalled(&self) -> bool {
        self.stalled.swap(false, Ordering::AcqRel)
    }
}

impl FrameSink for WebSocketFrameSink {
    fn send(&self, frame: &[u8]) -> Result<(), SinkError> {
        if !self.is_open() {
            return Err(SinkError::Closed);
        }
        if let Some(hint) = self.max_payload_hint {
            if frame.len() > hint {
                return Err(SinkError::PayloadTooLarge { hint });
            }
        }
        match self.tx.try_send(frame.to_vec()) {
            Ok(()) => {
                self.metrics.outbound_queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(tokio_mpsc::error::TrySendError::Full(_)) => {
                self.stalled.store(true, Ordering::Release);
                self.metrics.outbound_send_err.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::QueueFull)
            }
            Err(tokio_mpsc::error::TrySendError::Closed(_)) => {
                self.mark_closed();
                Err(SinkError::Closed)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn max_payload_hint(&self) -> Option<usize> {
        self.max_payload_hint
    }

    fn health_snapshot(&self) -> SinkHealthSnapshot {
        let m = self.metrics.snapshot();
        SinkHealthSnapshot {
            outbound_queued: m.outbound_queued,
            outbound_send_ok: m.outbound_send_ok,
            outbound_send_err: m.outbound_send_err,
            last_error: None,
        }
    }
}
