use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

/// Current value of a token and the `(time, id)` of the write that set it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValue {
    pub value: String,
    pub updated_at_millis: i64,
    pub updated_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenWriteOutcome {
    Applied,
    /// The winning write cleared the token and its entry left the store.
    Removed,
    /// An equal-or-newer write was already applied.
    Stale,
}

#[derive(Debug, Default)]
struct TokenState {
    value: Option<String>,
    updated_at_millis: i64,
    updated_id: i32,
    removed: bool,
}

/// One session-scoped token guarded by its own lock.
#[derive(Debug, Default)]
pub struct TokenEntry {
    state: RwLock<TokenState>,
}

impl TokenEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-writer-wins update ordered by `(time, id)`.
    ///
    /// Returns true when this write replaced the current value.
    pub fn set_token_and_write_time(&self, value: Option<String>, time: i64, id: i32) -> bool {
        let mut state = self.state.write();
        Self::apply(&mut state, value, time, id)
    }

    pub fn snapshot(&self) -> Option<TokenValue> {
        let state = self.state.read();
        state.value.as_ref().map(|value| TokenValue {
            value: value.clone(),
            updated_at_millis: state.updated_at_millis,
            updated_id: state.updated_id,
        })
    }

    /// `(time, id)` of the last applied write.
    pub fn write_stamp(&self) -> (i64, i32) {
        let state = self.state.read();
        (state.updated_at_millis, state.updated_id)
    }

    fn apply(state: &mut TokenState, value: Option<String>, time: i64, id: i32) -> bool {
        let newer = time > state.updated_at_millis
            || (time == state.updated_at_millis && id > state.updated_id);
        if newer {
            state.value = value;
            state.updated_at_millis = time;
            state.updated_id = id;
        }
        newer
    }
}

/// Session token map with per-key locking.
///
/// Entries are created on first write and leave the map when a winning write
/// clears them. Lock order is entry, then map shard.
#[derive(Debug, Default)]
pub struct TokenStore {
    entries: DashMap<String, Arc<TokenEntry>>,
    write_ids: AtomicI32,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a write ordered by `(time, id)`; `None` clears the token.
    pub fn write(&self, key: &str, value: Option<String>, time: i64, id: i32) -> TokenWriteOutcome {
        loop {
            let entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokenEntry::new()))
                .value()
                .clone();

            let mut state = entry.state.write();
            if state.removed {
                // Detached by a concurrent removal; retry against the map.
                drop(state);
                continue;
            }
            let clears = value.is_none();
            if !TokenEntry::apply(&mut state, value, time, id) {
                return TokenWriteOutcome::Stale;
            }
            if !clears {
                return TokenWriteOutcome::Applied;
            }
            state.removed = true;
            self.entries
                .remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
            return TokenWriteOutcome::Removed;
        }
    }

    pub fn get(&self, key: &str) -> Option<TokenValue> {
        let entry = self.entries.get(key).map(|entry| entry.value().clone())?;
        entry.snapshot()
    }

    /// Id for the next server-originated write.
    pub fn next_write_id(&self) -> i32 {
        self.write_ids.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::{TokenEntry, TokenStore, TokenWriteOutcome};

    #[test]
    fn newer_time_wins_and_ties_break_on_id() {
        let entry = TokenEntry::new();
        assert!(entry.set_token_and_write_time(Some("a".into()), 100, 1));
        assert!(!entry.set_token_and_write_time(Some("old".into()), 99, 9));
        assert!(!entry.set_token_and_write_time(Some("same".into()), 100, 1));
        assert!(entry.set_token_and_write_time(Some("b".into()), 100, 2));

        let snapshot = entry.snapshot().expect("value");
        assert_eq!(snapshot.value, "b");
        assert_eq!(entry.write_stamp(), (100, 2));
    }

    #[test]
    fn winning_clear_removes_entry_and_stale_clear_does_not() {
        let store = TokenStore::new();
        assert_eq!(store.write("csrf", Some("v1".into()), 10, 1), TokenWriteOutcome::Applied);
        assert_eq!(store.write("csrf", None, 5, 1), TokenWriteOutcome::Stale);
        assert_eq!(store.get("csrf").expect("still set").value, "v1");

        assert_eq!(store.write("csrf", None, 11, 1), TokenWriteOutcome::Removed);
        assert!(store.get("csrf").is_none());
        assert!(store.is_empty());

        assert_eq!(store.write("csrf", Some("v2".into()), 3, 1), TokenWriteOutcome::Applied);
        assert_eq!(store.get("csrf").expect("recreated").value, "v2");
    }

    #[test]
    fn concurrent_writers_converge_on_greatest_stamp() {
        let store = Arc::new(TokenStore::new());
        let writers: Vec<_> = (0..8i32)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for step in 0..200i64 {
                        let time = (step * 7 + i64::from(w) * 13) % 500;
                        store.write("k", Some(format!("{time}-{w}")), time, w);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let mut best = (i64::MIN, i32::MIN);
        for w in 0..8i32 {
            for step in 0..200i64 {
                best = best.max(((step * 7 + i64::from(w) * 13) % 500, w));
            }
        }
        let value = store.get("k").expect("token set");
        assert_eq!((value.updated_at_millis, value.updated_id), best);
        assert_eq!(value.value, format!("{}-{}", best.0, best.1));
    }

    #[test]
    fn server_write_ids_increase() {
        let store = TokenStore::new();
        assert_eq!(store.next_write_id(), 1);
        assert_eq!(store.next_write_id(), 2);
    }
}
