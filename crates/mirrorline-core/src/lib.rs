//! Core mirrorline primitives shared across crates.
//!
//! Includes the task batch unit, sequence counters and the shared ids.

pub mod batch;
pub mod sequence;
pub mod types;

pub use batch::TaskBatch;
pub use sequence::SequenceCounter;
pub use types::{ConnectionId, InstanceId, SessionId, NO_SEQUENCE_ID};
