use std::sync::atomic::{AtomicBool, Ordering};

use mirrorline_codec::frame::split_frame_id;
use mirrorline_core::SequenceCounter;

/// Why a connection entered the loss state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    /// An outbound batch could not get buffer space in time.
    OutputBackpressure { requested: usize },
    /// An inbound frame could not get buffer space in time.
    InputBackpressure { requested: usize },
    /// An inbound frame carried an unexpected sequence id.
    SequenceGap { expected: u32, received: u32 },
}

/// Decision for one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundVerdict<'a> {
    /// Hand this payload (id prefix stripped in lossless mode) to the dispatcher.
    Accept(&'a [u8]),
    /// Too short to carry anything; ignored without side effects.
    Drop,
    /// Sequence mismatch; the caller must start loss recovery.
    Gap { expected: u32, received: u32 },
    /// The connection already failed; every frame is rejected.
    Rejected,
}

/// Sequence id bookkeeping and the one-way loss flag of a lossless connection.
#[derive(Debug)]
pub struct PayloadLossGuard {
    enabled: bool,
    server_ids: SequenceCounter,
    client_ids: SequenceCounter,
    failed: AtomicBool,
}

impl PayloadLossGuard {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            server_ids: SequenceCounter::new(),
            client_ids: SequenceCounter::new(),
            failed: AtomicBool::new(false),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Flips the loss flag. Returns true only for the caller that flipped it.
    pub fn mark_failed(&self) -> bool {
        self.enabled && !self.failed.swap(true, Ordering::AcqRel)
    }

    /// Id for the next outbound frame.
    pub fn next_server_id(&self) -> u32 {
        self.server_ids.next()
    }

    /// Undoes the last `next_server_id` after a failed send.
    pub fn rollback_server_id(&self) {
        self.server_ids.rollback();
    }

    pub fn last_server_id(&self) -> u32 {
        self.server_ids.last()
    }

    pub fn expected_client_id(&self) -> u32 {
        self.client_ids.peek_next()
    }

    /// Checks an inbound frame. Callers must serialize calls per connection.
    pub fn check_inbound<'a>(&self, frame: &'a [u8]) -> InboundVerdict<'a> {
        if !self.enabled {
            return if frame.is_empty() {
                InboundVerdict::Drop
            } else {
                InboundVerdict::Accept(frame)
            };
        }
        if self.is_failed() {
            return InboundVerdict::Rejected;
        }
        let Some((received, payload)) = split_frame_id(frame) else {
            return InboundVerdict::Drop;
        };
        let expected = self.client_ids.peek_next();
        if received != expected {
            return InboundVerdict::Gap { expected, received };
        }
        self.client_ids.next();
        InboundVerdict::Accept(payload)
    }
}
