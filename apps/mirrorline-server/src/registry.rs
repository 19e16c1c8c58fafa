use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mirrorline_core::{ConnectionId, InstanceId, SessionId};
use mirrorline_page::{
    ConnectionConfig, EnqueueOutcome, InboundOutcome, PageConnection, PushPriority, Session,
    SessionDispatcher,
};
use mirrorline_transport::FrameSink;
use mirrorline_transport_websocket::{ConnectRequest, ConnectionHandler, WebSocketFrameSink};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Query parameters naming the page of a new socket.
pub const SESSION_PARAM: &str = "session";
pub const INSTANCE_PARAM: &str = "instance";

type PageKey = (SessionId, InstanceId);

/// One open page socket.
pub struct PageClient {
    session: Arc<Session>,
    connection: Arc<PageConnection>,
    sink: Arc<dyn FrameSink>,
}

impl PageClient {
    pub fn connection(&self) -> &Arc<PageConnection> {
        &self.connection
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub pages: usize,
    pub queued_batches: usize,
    pub loss_failed_pages: usize,
}

/// Sessions and their open page connections.
///
/// A session lives while at least one of its pages is connected. A socket that
/// reconnects under an existing `(session, instance)` replaces the old connection.
pub struct SessionRegistry {
    config: ConnectionConfig,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    pages: Mutex<HashMap<PageKey, Arc<PageConnection>>>,
    next_connection_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.lock().len();
        let pages = self.pages.lock();
        RegistryStats {
            sessions,
            pages: pages.len(),
            queued_batches: pages.values().map(|page| page.queue_depth()).sum(),
            loss_failed_pages: pages.values().filter(|page| page.is_loss_failed()).count(),
        }
    }

    /// Sends one task to every open page. Returns how many accepted it.
    pub fn broadcast(&self, task: &[u8]) -> usize {
        let pages: Vec<Arc<PageConnection>> = self.pages.lock().values().cloned().collect();
        pages
            .iter()
            .filter(|page| {
                matches!(
                    page.enqueue_and_push(vec![task.to_vec()]),
                    EnqueueOutcome::Queued | EnqueueOutcome::Held
                )
            })
            .count()
    }

    /// Registers a page connection fed by `sink`.
    pub fn open_page(
        &self,
        session_id: SessionId,
        instance_id: InstanceId,
        sink: Arc<dyn FrameSink>,
    ) -> Option<PageClient> {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1);
        let connection = match PageConnection::open(id, instance_id.clone(), self.config.clone()) {
            Ok(connection) => Arc::new(connection),
            Err(err) => {
                warn!(connection = %id, error = %err, "failed to open page connection");
                return None;
            }
        };

        let session = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Session::new(session_id.clone())))
                .clone();
            let replaced = self
                .pages
                .lock()
                .insert((session_id.clone(), instance_id.clone()), connection.clone());
            session.add_page(connection.clone());
            if let Some(replaced) = replaced {
                debug!(connection = %replaced.id(), "closing replaced page connection");
                replaced.close();
            }
            session
        };

        connection.set_dispatcher(Arc::new(SessionDispatcher::new(
            Arc::clone(&session),
            instance_id.clone(),
        )));
        connection.attach_sink(Arc::clone(&sink));
        info!(
            connection = %id,
            session = %session_id,
            instance = %instance_id,
            "page connected"
        );
        Some(PageClient {
            session,
            connection,
            sink,
        })
    }

    /// Unregisters and closes a page, dropping its session when it was the last page.
    pub fn close_page(&self, client: PageClient) {
        client.connection.detach_sink_if(&client.sink);
        let session_id = client.session.id().clone();
        let instance_id = client.connection.instance_id().clone();
        {
            let mut sessions = self.sessions.lock();
            let mut pages = self.pages.lock();
            let key = (session_id.clone(), instance_id.clone());
            let current = pages
                .get(&key)
                .is_some_and(|page| Arc::ptr_eq(page, &client.connection));
            if current {
                pages.remove(&key);
                client.session.remove_page(&instance_id);
            }
            if client.session.page_count() == 0 {
                sessions.remove(&session_id);
            }
        }
        client.connection.close();
        info!(
            connection = %client.connection.id(),
            session = %session_id,
            instance = %instance_id,
            "page disconnected"
        );
    }
}

fn non_empty_param<'a>(request: &'a ConnectRequest, name: &str) -> Option<&'a str> {
    request.query_param(name).filter(|value| !value.is_empty())
}

impl ConnectionHandler for SessionRegistry {
    type Client = PageClient;

    fn on_open(
        &self,
        request: &ConnectRequest,
        sink: Arc<WebSocketFrameSink>,
    ) -> Option<PageClient> {
        let (Some(session), Some(instance)) = (
            non_empty_param(request, SESSION_PARAM),
            non_empty_param(request, INSTANCE_PARAM),
        ) else {
            warn!(peer = %request.peer_addr, path = %request.path, "socket without session or instance");
            return None;
        };
        self.open_page(SessionId::from(session), InstanceId::from(instance), sink)
    }

    fn on_frame(&self, client: &PageClient, frame: Vec<u8>) {
        match client.connection.on_frame_received(frame) {
            InboundOutcome::Accepted | InboundOutcome::Partial => {}
            outcome => debug!(connection = %client.connection.id(), ?outcome, "inbound frame not accepted"),
        }
    }

    fn on_writable(&self, client: &PageClient) {
        client.connection.push(PushPriority::Normal);
    }

    fn on_close(&self, client: PageClient) {
        self.close_page(client);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mirrorline_codec::message::{decode_storage_op, StorageOp};
    use mirrorline_core::{InstanceId, SessionId};
    use mirrorline_page::ConnectionConfig;
    use mirrorline_transport::memory::RecordingSink;

    use super::SessionRegistry;

    #[test]
    fn pages_of_one_session_share_storage() {
        let registry = SessionRegistry::new(ConnectionConfig::default());
        let sink_a = Arc::new(RecordingSink::new());
        let sink_b = Arc::new(RecordingSink::new());
        let a = registry
            .open_page(SessionId::from("s"), InstanceId::from("a"), sink_a.clone())
            .expect("page a");
        let _b = registry
            .open_page(SessionId::from("s"), InstanceId::from("b"), sink_b.clone())
            .expect("page b");

        let session = registry.session(&SessionId::from("s")).expect("session");
        assert_eq!(session.page_count(), 2);
        session.set_item("theme", Some("dark"), None);

        for sink in [&sink_a, &sink_b] {
            let frames = sink.frames();
            assert_eq!(frames.len(), 1);
            assert!(matches!(
                decode_storage_op(&frames[0]).expect("storage op"),
                StorageOp::SetItem { .. }
            ));
        }

        registry.close_page(a);
        assert_eq!(session.page_count(), 1);
        assert_eq!(registry.stats().pages, 1);
    }

    #[test]
    fn reconnect_replaces_the_old_connection() {
        let registry = SessionRegistry::new(ConnectionConfig::default());
        let old = registry
            .open_page(SessionId::from("s"), InstanceId::from("a"), Arc::new(RecordingSink::new()))
            .expect("old page");
        let new = registry
            .open_page(SessionId::from("s"), InstanceId::from("a"), Arc::new(RecordingSink::new()))
            .expect("new page");
        assert!(!old.connection().is_valid());

        registry.close_page(old);
        assert!(new.connection().is_valid());
        assert_eq!(registry.stats().pages, 1);

        registry.close_page(new);
        assert_eq!(registry.stats().sessions, 0);
        assert!(registry.session(&SessionId::from("s")).is_none());
    }

    #[test]
    fn broadcast_reaches_every_open_page() {
        let registry = SessionRegistry::new(ConnectionConfig::default());
        let sinks: Vec<_> = (0..3).map(|_| Arc::new(RecordingSink::new())).collect();
        let _clients: Vec<_> = sinks
            .iter()
            .enumerate()
            .map(|(n, sink)| {
                registry
                    .open_page(
                        SessionId::from(format!("s{n}").as_str()),
                        InstanceId::from("tab"),
                        sink.clone(),
                    )
                    .expect("page")
            })
            .collect();

        assert_eq!(registry.broadcast(b"tick"), 3);
        assert!(sinks.iter().all(|sink| sink.frames() == vec![b"tick".to_vec()]));
        assert_eq!(registry.stats().sessions, 3);
    }
}
