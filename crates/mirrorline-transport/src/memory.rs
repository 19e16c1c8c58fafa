use parking_lot::Mutex;

use crate::sink::{FrameSink, SinkError, SinkHealthSnapshot};

#[derive(Debug)]
struct RecordingState {
    frames: Vec<Vec<u8>>,
    open: bool,
    fail_next: usize,
    max_send_bytes: usize,
    send_ok: u64,
    send_err: u64,
    last_error: Option<String>,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            open: true,
            fail_next: 0,
            max_send_bytes: usize::MAX,
            send_ok: 0,
            send_err: 0,
            last_error: None,
        }
    }
}

/// In-memory sink for tests and simulations.
///
/// Captures every accepted frame and can be told to fail upcoming sends.
#[derive(Debug, Default)]
pub struct RecordingSink {
    state: Mutex<RecordingState>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that rejects frames larger than `max_send_bytes`.
    pub fn with_max_send_bytes(max_send_bytes: usize) -> Self {
        let sink = Self::default();
        sink.state.lock().max_send_bytes = max_send_bytes;
        sink
    }

    /// Makes the next `count` sends fail with `SinkError::Rejected`.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Opens or closes the sink. A closed sink fails every send.
    pub fn set_open(&self, open: bool) {
        self.state.lock().open = open;
    }

    /// Returns a copy of all frames accepted so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().frames.clone()
    }

    /// Drains and returns all frames accepted so far.
    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().frames)
    }

    /// Number of frames accepted so far.
    pub fn sent_count(&self) -> usize {
        self.state.lock().frames.len()
    }
}

impl FrameSink for RecordingSink {
    fn send(&self, frame: &[u8]) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let result = if !state.open {
            Err(SinkError::Closed)
        } else if state.fail_next > 0 {
            state.fail_next -= 1;
            Err(SinkError::Rejected("scripted failure".to_string()))
        } else if frame.len() > state.max_send_bytes {
            Err(SinkError::PayloadTooLarge {
                hint: state.max_send_bytes,
            })
        } else {
            state.frames.push(frame.to_vec());
            Ok(())
        };

        match &result {
            Ok(()) => state.send_ok += 1,
            Err(err) => {
                state.send_err += 1;
                state.last_error = Some(err.to_string());
            }
        }
        result
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn max_payload_hint(&self) -> Option<usize> {
        let max = self.state.lock().max_send_bytes;
        (max != usize::MAX).then_some(max)
    }

    fn health_snapshot(&self) -> SinkHealthSnapshot {
        let state = self.state.lock();
        SinkHealthSnapshot {
            outbound_queued: state.send_ok + state.send_err,
            outbound_send_ok: state.send_ok,
            outbound_send_err: state.send_err,
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RecordingSink;
    use crate::sink::{FrameSink, SinkError};

    #[test]
    fn records_frames_in_order() {
        let sink = RecordingSink::new();
        sink.send(b"one").expect("send should succeed");
        sink.send(b"two").expect("send should succeed");
        assert_eq!(sink.frames(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(sink.take_frames().len(), 2);
        assert_eq!(sink.sent_count(), 0);
    }

    #[test]
    fn scripted_failures_are_consumed() {
        let sink = RecordingSink::new();
        sink.fail_next_sends(2);
        assert!(sink.send(b"a").is_err());
        assert!(sink.send(b"b").is_err());
        sink.send(b"c").expect("third send should succeed");

        let health = sink.health_snapshot();
        assert_eq!(health.outbound_send_ok, 1);
        assert_eq!(health.outbound_send_err, 2);
        assert_eq!(health.last_error.as_deref(), Some("send rejected: scripted failure"));
    }

    #[test]
    fn closed_and_oversized_sends_fail() {
        let sink = RecordingSink::with_max_send_bytes(2);
        assert_eq!(sink.max_payload_hint(), Some(2));
        assert_eq!(
            sink.send(b"abc"),
            Err(SinkError::PayloadTooLarge { hint: 2 })
        );
        sink.set_open(false);
        assert!(!sink.is_open());
        assert_eq!(sink.send(b"a"), Err(SinkError::Closed));
    }
}
