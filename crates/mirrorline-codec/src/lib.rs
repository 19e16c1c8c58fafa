//! mirrorline wire codec primitives.
//!
//! Defines the on-disk batch file layout, the lossless frame id prefix, and
//! the CBOR storage messages exchanged with page instances.

pub mod batch_file;
pub mod error;
pub mod frame;
pub mod message;
