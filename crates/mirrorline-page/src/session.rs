use std::collections::HashMap;
use std::sync::Arc;

use mirrorline_codec::message::{decode_client_message, encode_storage_op, ClientMessage, StorageOp};
use mirrorline_core::{InstanceId, SessionId};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::connection::{EnqueueOutcome, PageConnection};
use crate::inbound::FrameDispatcher;
use crate::storage::{
    now_millis, ItemStore, StorageCallback, TokenStore, TokenValue, TokenWriteOutcome,
};

/// A page instance that can receive session broadcasts.
pub trait PageInstance: Send + Sync {
    fn instance_id(&self) -> &InstanceId;

    /// Queues one encoded task for the page and pushes it.
    fn deliver(&self, task: Vec<u8>) -> EnqueueOutcome;
}

impl PageInstance for PageConnection {
    fn instance_id(&self) -> &InstanceId {
        PageConnection::instance_id(self)
    }

    fn deliver(&self, task: Vec<u8>) -> EnqueueOutcome {
        self.enqueue_and_push(vec![task])
    }
}

/// Logical session: the page instances of one user plus their shared storage.
pub struct Session {
    id: SessionId,
    pages: RwLock<HashMap<InstanceId, Arc<dyn PageInstance>>>,
    items: ItemStore,
    tokens: TokenStore,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            pages: RwLock::new(HashMap::new()),
            items: ItemStore::new(),
            tokens: TokenStore::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Registers a page, returning the page it replaced under the same instance id.
    pub fn add_page(&self, page: Arc<dyn PageInstance>) -> Option<Arc<dyn PageInstance>> {
        let instance_id = page.instance_id().clone();
        debug!(session = %self.id, instance = %instance_id, "page added");
        self.pages.write().insert(instance_id, page)
    }

    pub fn remove_page(&self, instance_id: &InstanceId) -> Option<Arc<dyn PageInstance>> {
        self.pages.write().remove(instance_id)
    }

    pub fn page(&self, instance_id: &InstanceId) -> Option<Arc<dyn PageInstance>> {
        self.pages.read().get(instance_id).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    pub fn items(&self) -> &ItemStore {
        &self.items
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Sets an item on every page. `None` removes it instead.
    pub fn set_item(&self, key: &str, value: Option<&str>, callback: Option<StorageCallback>) {
        let op = match (value, callback) {
            (Some(value), callback) => self.items.set_item(key, value, now_millis(), callback),
            (None, Some(callback)) => self.items.remove_and_get_item(key, now_millis(), callback),
            (None, None) => self.items.remove_item(key, now_millis(), None),
        };
        self.broadcast(&op, None);
    }

    pub fn get_item(&self, key: &str, callback: StorageCallback) {
        let op = self.items.get_item(key, now_millis(), callback);
        self.broadcast(&op, None);
    }

    pub fn remove_item(&self, key: &str, callback: Option<StorageCallback>) {
        let op = self.items.remove_item(key, now_millis(), callback);
        self.broadcast(&op, None);
    }

    pub fn remove_and_get_item(&self, key: &str, callback: StorageCallback) {
        let op = self.items.remove_and_get_item(key, now_millis(), callback);
        self.broadcast(&op, None);
    }

    pub fn clear_items(&self, callback: Option<StorageCallback>) {
        let op = self.items.clear(now_millis(), callback);
        self.broadcast(&op, None);
    }

    /// Server-side token write, broadcast to every page when it wins.
    pub fn set_token(&self, key: &str, value: Option<&str>) -> TokenWriteOutcome {
        let time = now_millis();
        let id = self.tokens.next_write_id();
        self.write_token(key, value.map(str::to_string), time, id, None)
    }

    pub fn remove_token(&self, key: &str) -> TokenWriteOutcome {
        self.set_token(key, None)
    }

    pub fn get_token(&self, key: &str) -> Option<TokenValue> {
        self.tokens.get(key)
    }

    /// Applies a decoded page message sent by `origin`.
    pub fn apply_client_message(&self, origin: &InstanceId, message: ClientMessage) {
        match message {
            ClientMessage::ItemAck(ack) => {
                self.items.complete(ack);
            }
            ClientMessage::TokenWrite(write) => {
                let outcome =
                    self.write_token(&write.key, write.value, write.time, write.id, Some(origin));
                debug!(session = %self.id, instance = %origin, key = %write.key, ?outcome, "page token write");
            }
        }
    }

    fn write_token(
        &self,
        key: &str,
        value: Option<String>,
        time: i64,
        id: i32,
        origin: Option<&InstanceId>,
    ) -> TokenWriteOutcome {
        let outcome = self.tokens.write(key, value.clone(), time, id);
        if outcome != TokenWriteOutcome::Stale {
            let op = StorageOp::SetToken {
                key: key.to_string(),
                value,
                time,
                id,
            };
            self.broadcast(&op, origin);
        }
        outcome
    }

    /// Encodes `op` once and delivers it to every page except `except`.
    fn broadcast(&self, op: &StorageOp, except: Option<&InstanceId>) -> usize {
        let task = match encode_storage_op(op) {
            Ok(task) => task,
            Err(err) => {
                error!(session = %self.id, error = %err, "failed to encode storage op");
                return 0;
            }
        };
        let pages: Vec<Arc<dyn PageInstance>> = self
            .pages
            .read()
            .iter()
            .filter(|(instance_id, _)| Some(*instance_id) != except)
            .map(|(_, page)| Arc::clone(page))
            .collect();

        let mut delivered = 0;
        for page in pages {
            match page.deliver(task.clone()) {
                EnqueueOutcome::Queued | EnqueueOutcome::Held => delivered += 1,
                outcome => {
                    debug!(session = %self.id, instance = %page.instance_id(), ?outcome, "storage op not delivered")
                }
            }
        }
        delivered
    }
}

/// Routes one page's inbound payloads into its session.
pub struct SessionDispatcher {
    session: Arc<Session>,
    origin: InstanceId,
}

impl SessionDispatcher {
    pub fn new(session: Arc<Session>, origin: InstanceId) -> Self {
        Self { session, origin }
    }
}

impl FrameDispatcher for SessionDispatcher {
    fn dispatch(&self, payload: &[u8]) {
        match decode_client_message(payload) {
            Ok(message) => self.session.apply_client_message(&self.origin, message),
            Err(err) => warn!(
                session = %self.session.id(),
                instance = %self.origin,
                error = %err,
                "ignoring undecodable page message"
            ),
        }
    }
}
