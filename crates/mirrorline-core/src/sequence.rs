use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::NO_SEQUENCE_ID;

/// Monotonic 32-bit frame sequence counter that never yields 0.
///
/// 0 is reserved for "no id". `next` wraps from `u32::MAX` to 1, and
/// `rollback` undoes exactly one `next`.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: AtomicU32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the counter so the next issued id follows `last`.
    pub fn starting_after(last: u32) -> Self {
        Self {
            last: AtomicU32::new(last),
        }
    }

    /// Advances and returns the new id.
    pub fn next(&self) -> u32 {
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let next = successor(current);
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the id `next` would issue, without advancing.
    pub fn peek_next(&self) -> u32 {
        successor(self.last.load(Ordering::Acquire))
    }

    /// Returns the last issued id, or 0 if none was issued yet.
    pub fn last(&self) -> u32 {
        self.last.load(Ordering::Acquire)
    }

    /// Steps back by one so the previously issued id is issued again.
    ///
    /// A no-op before the first `next`.
    pub fn rollback(&self) {
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let prev = predecessor(current);
            match self
                .last
                .compare_exchange_weak(current, prev, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

fn successor(id: u32) -> u32 {
    match id.wrapping_add(1) {
        NO_SEQUENCE_ID => 1,
        next => next,
    }
}

fn predecessor(id: u32) -> u32 {
    match id {
        // Both 0 and u32::MAX have successor 1.
        1 => u32::MAX,
        NO_SEQUENCE_ID => NO_SEQUENCE_ID,
        prev => prev - 1,
    }
}
