use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::GateMode;

/// Result of a gate acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Capacity was available within the timeout.
    Granted,
    /// The wait timed out but the gate is advisory, so the bytes were admitted.
    Bypassed,
    /// The wait timed out on an enforced gate; nothing was acquired.
    TimedOut,
}

impl Acquire {
    /// True when the caller now owes a matching `release`.
    pub fn admitted(self) -> bool {
        !matches!(self, Acquire::TimedOut)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Total bytes admitted, including bypassed and forced acquisitions.
    pub acquired_bytes: u64,
    pub released_bytes: u64,
    pub timeouts: u64,
    pub bypasses: u64,
}

impl GateStats {
    /// Bytes admitted but not yet released.
    pub fn outstanding_bytes(&self) -> u64 {
        self.acquired_bytes.saturating_sub(self.released_bytes)
    }
}

/// Byte-counting admission gate bounding unsent (or unprocessed) data.
///
/// A request larger than the whole limit waits until nothing else is
/// outstanding instead of waiting for capacity that can never exist.
#[derive(Debug)]
pub struct BackpressureGate {
    mode: GateMode,
    available: Mutex<i64>,
    freed: Condvar,
    acquired_bytes: AtomicU64,
    released_bytes: AtomicU64,
    timeouts: AtomicU64,
    bypasses: AtomicU64,
}

impl BackpressureGate {
    pub fn new(mode: GateMode) -> Self {
        let available = mode.limit().map_or(i64::MAX, to_i64);
        Self {
            mode,
            available: Mutex::new(available),
            freed: Condvar::new(),
            acquired_bytes: AtomicU64::new(0),
            released_bytes: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Waits up to the configured timeout for `size` bytes of capacity.
    pub fn acquire(&self, size: usize) -> Acquire {
        let (limit, timeout) = match self.mode {
            GateMode::Unbounded => {
                self.record_acquired(size);
                return Acquire::Granted;
            }
            GateMode::Advisory { limit, timeout } | GateMode::Enforced { limit, timeout } => {
                (limit, timeout)
            }
        };
        let needed = to_i64(size.min(limit));
        let requested = to_i64(size);

        let mut available = self.available.lock();
        if self.wait_for_capacity(&mut available, needed, timeout) {
            *available -= requested;
            drop(available);
            self.record_acquired(size);
            return Acquire::Granted;
        }

        self.timeouts.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            GateMode::Enforced { .. } => Acquire::TimedOut,
            _ => {
                *available -= requested;
                drop(available);
                self.bypasses.fetch_add(1, Ordering::Relaxed);
                self.record_acquired(size);
                Acquire::Bypassed
            }
        }
    }

    /// Takes `size` bytes without waiting, driving availability negative if needed.
    pub fn force_acquire(&self, size: usize) {
        if self.mode != GateMode::Unbounded {
            *self.available.lock() -= to_i64(size);
        }
        self.record_acquired(size);
    }

    /// Returns `size` bytes of capacity and wakes blocked producers.
    pub fn release(&self, size: usize) {
        if size == 0 {
            return;
        }
        if self.mode != GateMode::Unbounded {
            *self.available.lock() += to_i64(size);
            self.freed.notify_all();
        }
        self.released_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            acquired_bytes: self.acquired_bytes.load(Ordering::Relaxed),
            released_bytes: self.released_bytes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
        }
    }

    fn wait_for_capacity(
        &self,
        available: &mut parking_lot::MutexGuard<'_, i64>,
        needed: i64,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while **available < needed {
            if self.freed.wait_until(available, deadline).timed_out() {
                return **available >= needed;
            }
        }
        true
    }

    fn record_acquired(&self, size: usize) {
        self.acquired_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
