//! mirrorline page-connection engine.
//!
//! Ordered, backpressured, optionally lossless delivery of opaque task blobs
//! from the server to one page instance, in-order processing of the page's
//! inbound frames, and the session storage shared across page instances.

pub mod config;
pub mod connection;
pub mod disk_queue;
pub mod drain;
pub mod gate;
pub mod heartbeat;
pub mod hold;
pub mod inbound;
pub mod loss;
pub mod pusher;
pub mod queue;
pub mod session;
pub mod storage;

pub use config::{ConnectionConfig, GateMode, LossAction, QueueBackend};
pub use connection::{ConnectionError, EnqueueOutcome, InboundOutcome, PageConnection};
pub use drain::PushPriority;
pub use heartbeat::HeartbeatManager;
pub use inbound::FrameDispatcher;
pub use loss::LossCause;
pub use pusher::{DrainReport, PushOutcome};
pub use session::{PageInstance, Session, SessionDispatcher};
