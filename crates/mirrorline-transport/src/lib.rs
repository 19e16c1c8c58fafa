//! Transport abstractions for mirrorline.
//!
//! The delivery engine only depends on the byte-oriented `FrameSink` seam
//! defined in this crate.

pub mod memory;
pub mod sink;

pub use sink::{FrameSink, SinkError, SinkHealthSnapshot};
