use parking_lot::{Condvar, Mutex};

/// Urgency of a push request.
///
/// A running drain yields to a waiting caller of equal or higher priority
/// once it finishes its current batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PushPriority {
    Background,
    #[default]
    Normal,
    Urgent,
}

#[derive(Debug, Default)]
struct DrainState {
    active: bool,
    waiter: Option<PushPriority>,
}

/// Single-flight lock with at most one queued waiter.
///
/// The first caller drains. A second caller waits to take over. Any further
/// caller returns immediately: the waiter will pick up its work.
#[derive(Debug, Default)]
pub struct DrainGate {
    state: Mutex<DrainState>,
    handoff: Condvar,
}

impl DrainGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the gate, blocking only if this caller becomes the single waiter.
    ///
    /// Returns `None` when someone else is already waiting to drain.
    pub fn enter(&self, priority: PushPriority) -> Option<DrainGuard<'_>> {
        let mut state = self.state.lock();
        if let Some(waiting) = state.waiter {
            state.waiter = Some(waiting.max(priority));
            return None;
        }
        if state.active {
            state.waiter = Some(priority);
            while state.active {
                self.handoff.wait(&mut state);
            }
            state.waiter = None;
        }
        state.active = true;
        Some(DrainGuard {
            gate: self,
            priority,
        })
    }

    /// Enters only if nobody is draining or waiting.
    pub fn try_enter(&self, priority: PushPriority) -> Option<DrainGuard<'_>> {
        let mut state = self.state.lock();
        if state.active || state.waiter.is_some() {
            return None;
        }
        state.active = true;
        Some(DrainGuard {
            gate: self,
            priority,
        })
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        state.active = false;
        if state.waiter.is_some() {
            self.handoff.notify_one();
        }
    }
}

/// Exclusive drain permit; released on drop.
#[derive(Debug)]
pub struct DrainGuard<'a> {
    gate: &'a DrainGate,
    priority: PushPriority,
}

impl DrainGuard<'_> {
    pub fn priority(&self) -> PushPriority {
        self.priority
    }

    /// True when a waiting caller has equal or higher priority than this drain.
    pub fn should_yield(&self) -> bool {
        self.gate
            .state
            .lock()
            .waiter
            .is_some_and(|waiting| waiting >= self.priority)
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
