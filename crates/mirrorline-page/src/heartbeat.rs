use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::drain::{DrainGate, PushPriority};

/// Runs a periodic task at most once per `min_interval`, single-flight.
///
/// Callers that arrive while the task runs, or before the interval elapsed,
/// return without running it.
pub struct HeartbeatManager {
    min_interval: Duration,
    task: Box<dyn Fn() + Send + Sync>,
    gate: DrainGate,
    last_run: Mutex<Option<Instant>>,
    last_accessed: Mutex<Instant>,
}

impl HeartbeatManager {
    pub fn new(min_interval: Duration, task: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            min_interval,
            task: Box::new(task),
            gate: DrainGate::new(),
            last_run: Mutex::new(None),
            last_accessed: Mutex::new(Instant::now()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Records access and runs the task if it is due. Returns true if it ran.
    pub fn run(&self) -> bool {
        let now = Instant::now();
        *self.last_accessed.lock() = now;
        if !self.is_due(now) {
            return false;
        }
        let Some(_guard) = self.gate.try_enter(PushPriority::Background) else {
            return false;
        };
        {
            let mut last_run = self.last_run.lock();
            if last_run.is_some_and(|at| now.duration_since(at) < self.min_interval) {
                return false;
            }
            *last_run = Some(now);
        }
        trace!("running heartbeat task");
        (self.task)();
        true
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    pub fn last_run(&self) -> Option<Instant> {
        *self.last_run.lock()
    }

    fn is_due(&self, now: Instant) -> bool {
        self.last_run
            .lock()
            .map_or(true, |at| now.duration_since(at) >= self.min_interval)
    }
}
