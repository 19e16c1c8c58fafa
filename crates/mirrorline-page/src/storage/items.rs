use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use mirrorline_codec::message::{ItemAck, ItemOpKind, StorageOp};
use tracing::debug;

/// A stored item as reported back to a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: String,
    pub updated_time_millis: i64,
}

/// What a storage callback receives once a page acknowledged the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: Option<String>,
    pub operation_time_millis: i64,
    pub item: Option<Item>,
}

pub type StorageCallback = Box<dyn FnOnce(StorageEvent) + Send + Sync>;

struct PendingCallback {
    callback: StorageCallback,
    event: StorageEvent,
}

#[derive(Default)]
struct CallbackTable {
    ids: AtomicU32,
    pending: DashMap<u32, PendingCallback>,
}

impl CallbackTable {
    fn register(&self, callback: StorageCallback, event: StorageEvent) -> u32 {
        let id = self.ids.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.pending.insert(id, PendingCallback { callback, event });
        id
    }

    fn take(&self, id: u32) -> Option<PendingCallback> {
        self.pending.remove(&id).map(|(_, pending)| pending)
    }
}

/// Per-session callback registry for broadcast item operations.
///
/// Each operation kind has its own id sequence and table. Every page that
/// applies the operation may acknowledge it; only the first ack runs the
/// callback.
#[derive(Default)]
pub struct ItemStore {
    set: CallbackTable,
    get: CallbackTable,
    remove: CallbackTable,
    clear: CallbackTable,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_item(
        &self,
        key: &str,
        value: &str,
        now_millis: i64,
        callback: Option<StorageCallback>,
    ) -> StorageOp {
        let request_id = callback.map(|callback| {
            let event = StorageEvent {
                key: Some(key.to_string()),
                operation_time_millis: now_millis,
                item: Some(Item {
                    value: value.to_string(),
                    updated_time_millis: now_millis,
                }),
            };
            self.set.register(callback, event)
        });
        StorageOp::SetItem {
            request_id,
            key: key.to_string(),
            value: value.to_string(),
            time: now_millis,
        }
    }

    pub fn get_item(&self, key: &str, now_millis: i64, callback: StorageCallback) -> StorageOp {
        let request_id = self.get.register(callback, key_event(key, now_millis));
        StorageOp::GetItem {
            request_id,
            key: key.to_string(),
        }
    }

    pub fn remove_item(
        &self,
        key: &str,
        now_millis: i64,
        callback: Option<StorageCallback>,
    ) -> StorageOp {
        let request_id =
            callback.map(|callback| self.remove.register(callback, key_event(key, now_millis)));
        StorageOp::RemoveItem {
            request_id,
            key: key.to_string(),
            time: now_millis,
        }
    }

    /// Removes the item and reports its previous value through `callback`.
    pub fn remove_and_get_item(
        &self,
        key: &str,
        now_millis: i64,
        callback: StorageCallback,
    ) -> StorageOp {
        let request_id = self.remove.register(callback, key_event(key, now_millis));
        StorageOp::RemoveAndGetItem {
            request_id,
            key: key.to_string(),
            time: now_millis,
        }
    }

    pub fn clear(&self, now_millis: i64, callback: Option<StorageCallback>) -> StorageOp {
        let request_id = callback.map(|callback| {
            let event = StorageEvent {
                key: None,
                operation_time_millis: now_millis,
                item: None,
            };
            self.clear.register(callback, event)
        });
        StorageOp::ClearItems {
            request_id,
            time: now_millis,
        }
    }

    /// Runs the callback registered for `ack`. Duplicate or unknown acks are ignored.
    pub fn complete(&self, ack: ItemAck) -> bool {
        let table = match ack.kind {
            ItemOpKind::Set => &self.set,
            ItemOpKind::Get => &self.get,
            ItemOpKind::Remove => &self.remove,
            ItemOpKind::Clear => &self.clear,
        };
        let Some(PendingCallback {
            callback,
            mut event,
        }) = table.take(ack.request_id)
        else {
            debug!(kind = ?ack.kind, request_id = ack.request_id, "ignoring unmatched item ack");
            return false;
        };

        if matches!(ack.kind, ItemOpKind::Get | ItemOpKind::Remove) {
            event.item = ack.value.map(|value| Item {
                value,
                updated_time_millis: ack.updated_time.unwrap_or(event.operation_time_millis),
            });
        }
        callback(event);
        true
    }

    /// Callbacks still waiting for their first ack.
    pub fn pending_count(&self) -> usize {
        self.set.pending.len()
            + self.get.pending.len()
            + self.remove.pending.len()
            + self.clear.pending.len()
    }
}

fn key_event(key: &str, now_millis: i64) -> StorageEvent {
    StorageEvent {
        key: Some(key.to_string()),
        operation_time_millis: now_millis,
        item: None,
    }
}
