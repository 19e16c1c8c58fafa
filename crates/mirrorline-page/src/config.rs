use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::loss::LossCause;

/// Callback invoked once when a connection enters the loss state.
pub type LossCallback = Arc<dyn Fn(LossCause) + Send + Sync>;

/// What to do when payload loss is detected.
///
/// Configuring a loss action is what turns on lossless mode: every outbound
/// and inbound frame then carries a 4-byte sequence id.
#[derive(Clone, Default)]
pub struct LossAction {
    /// Opaque, already-encoded task that replaces the queued content after loss.
    pub recovery_task: Option<Vec<u8>>,
    /// Application hook run after the recovery task was queued.
    pub on_loss: Option<LossCallback>,
}

impl LossAction {
    pub fn with_recovery_task(task: impl Into<Vec<u8>>) -> Self {
        Self {
            recovery_task: Some(task.into()),
            on_loss: None,
        }
    }

    pub fn on_loss(mut self, callback: impl Fn(LossCause) + Send + Sync + 'static) -> Self {
        self.on_loss = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for LossAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LossAction")
            .field(
                "recovery_task_len",
                &self.recovery_task.as_ref().map(Vec::len),
            )
            .field("on_loss", &self.on_loss.is_some())
            .finish()
    }
}

/// Storage backing a connection's batch queues.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueBackend {
    #[default]
    Memory,
    /// One directory per connection under `base_dir`, one subdirectory per queue.
    Disk { base_dir: PathBuf },
}

/// Resolved behavior of a backpressure gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// No limit; only byte counters are kept.
    Unbounded,
    /// Limit applies, but a timed-out acquire admits the bytes anyway.
    Advisory { limit: usize, timeout: Duration },
    /// Limit applies and a timed-out acquire is reported as payload loss.
    Enforced { limit: usize, timeout: Duration },
}

impl GateMode {
    /// Resolves a configured limit. A zero limit disables the gate.
    pub fn resolve(limit: usize, timeout: Duration, lossless: bool) -> Self {
        match (limit, lossless) {
            (0, _) => GateMode::Unbounded,
            (limit, true) => GateMode::Enforced { limit, timeout },
            (limit, false) => GateMode::Advisory { limit, timeout },
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            GateMode::Unbounded => None,
            GateMode::Advisory { limit, .. } | GateMode::Enforced { limit, .. } => Some(*limit),
        }
    }
}

/// Per-connection delivery settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Max unsent outbound bytes; 0 disables outbound backpressure.
    pub output_buffer_limit: usize,
    /// How long `enqueue` waits for outbound buffer space.
    pub output_buffer_timeout: Duration,
    /// Max unprocessed inbound bytes; 0 disables inbound backpressure.
    pub input_buffer_limit: usize,
    /// How long an inbound frame waits for buffer space.
    pub input_buffer_timeout: Duration,
    pub queue_backend: QueueBackend,
    /// Enables lossless mode when set.
    pub loss_action: Option<LossAction>,
    /// A push without a sink warns only once the connection has been idle this long.
    pub missing_sink_warn_after: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            output_buffer_limit: 0,
            output_buffer_timeout: Duration::from_secs(2),
            input_buffer_limit: 0,
            input_buffer_timeout: Duration::from_secs(2),
            queue_backend: QueueBackend::Memory,
            loss_action: None,
            missing_sink_warn_after: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Lossless mode: sequence ids on every frame, terminal loss detection.
    pub fn lossless(&self) -> bool {
        self.loss_action.is_some()
    }

    pub fn output_gate_mode(&self) -> GateMode {
        GateMode::resolve(
            self.output_buffer_limit,
            self.output_buffer_timeout,
            self.lossless(),
        )
    }

    pub fn input_gate_mode(&self) -> GateMode {
        GateMode::resolve(
            self.input_buffer_limit,
            self.input_buffer_timeout,
            self.lossless(),
        )
    }
}
