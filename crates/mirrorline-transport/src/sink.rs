use thiserror::Error;

/// Coarse per-sink transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkHealthSnapshot {
    pub outbound_queued: u64,
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub last_error: Option<String>,
}

/// Why a frame could not be handed to the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("payload exceeds max payload hint ({hint} bytes)")]
    PayloadTooLarge { hint: usize },
    #[error("send rejected: {0}")]
    Rejected(String),
}

/// Outbound side of one page connection's transport.
///
/// `send` is called by at most one drainer at a time per connection, but the
/// sink itself is shared, so implementations take `&self`.
pub trait FrameSink: Send + Sync {
    /// Hands one complete frame to the transport.
    fn send(&self, frame: &[u8]) -> Result<(), SinkError>;

    /// Whether outbound send is currently available.
    fn is_open(&self) -> bool {
        true
    }

    /// Optional maximum payload hint.
    fn max_payload_hint(&self) -> Option<usize> {
        None
    }

    /// Best-effort transport health counters.
    fn health_snapshot(&self) -> SinkHealthSnapshot {
        SinkHealthSnapshot::default()
    }
}
