//! WebSocket transport for mirrorline page connections.
//!
//! Runs a WebSocket listener on its own tokio runtime thread. Each accepted
//! client gets a [`WebSocketFrameSink`] for outbound frames, and its inbound
//! binary messages are handed to a [`ConnectionHandler`] in arrival order.

mod sink;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc as tokio_mpsc, oneshot, watch};
use tokio::task::block_in_place;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub use sink::WebSocketFrameSink;

#[derive(Debug, Clone)]
pub struct WebSocketServerConfig {
    pub bind_addr: String,
    /// Frames buffered per client before `send` reports `QueueFull`.
    pub client_queue_capacity: usize,
    pub max_payload_hint: Option<usize>,
    pub worker_threads: usize,
}

impl WebSocketServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            client_queue_capacity: 1024,
            max_payload_hint: None,
            worker_threads: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebSocketAdapterError {
    #[error("adapter is closed")]
    Closed,
    #[error("server bind failed: {0}")]
    BindFailed(String),
    #[error("failed to start runtime: {0}")]
    Runtime(String),
}

/// Handshake details of an accepted client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub peer_addr: SocketAddr,
    pub path: String,
    pub query: HashMap<String, String>,
}

impl ConnectRequest {
    fn from_uri(peer_addr: SocketAddr, uri: Option<&Uri>) -> Self {
        let path = uri.map_or_else(|| "/".to_string(), |uri| uri.path().to_string());
        let query = uri
            .and_then(Uri::query)
            .map(parse_query)
            .unwrap_or_default();
        Self {
            peer_addr,
            path,
            query,
        }
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Application callbacks for WebSocket clients.
///
/// Callbacks run on the transport runtime inside `block_in_place`, so they may
/// block briefly (for example on a backpressure gate).
pub trait ConnectionHandler: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    /// Called after the handshake. Returning `None` closes the socket.
    fn on_open(&self, request: &ConnectRequest, sink: Arc<WebSocketFrameSink>)
        -> Option<Self::Client>;

    /// Called for each inbound binary message, in arrival order.
    fn on_frame(&self, client: &Self::Client, frame: Vec<u8>);

    /// Called when a previously full client queue has room again.
    fn on_writable(&self, _client: &Self::Client) {}

    fn on_close(&self, client: Self::Client);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebSocketServerMetrics {
    pub connections_accepted: u64,
    pub handshakes_failed: u64,
    pub connections_rejected: u64,
    pub outbound_queued: u64,
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub inbound_received: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsInner {
    connections_accepted: AtomicU64,
    handshakes_failed: AtomicU64,
    connections_rejected: AtomicU64,
    pub(crate) outbound_queued: AtomicU64,
    outbound_send_ok: AtomicU64,
    pub(crate) outbound_send_err: AtomicU64,
    inbound_received: AtomicU64,
}

impl MetricsInner {
    pub(crate) fn snapshot(&self) -> WebSocketServerMetrics {
        WebSocketServerMetrics {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            outbound_queued: self.outbound_queued.load(Ordering::Relaxed),
            outbound_send_ok: self.outbound_send_ok.load(Ordering::Relaxed),
            outbound_send_err: self.outbound_send_err.load(Ordering::Relaxed),
            inbound_received: self.inbound_received.load(Ordering::Relaxed),
        }
    }
}

pub struct WebSocketServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    metrics: Arc<MetricsInner>,
}

impl WebSocketServer {
    pub fn listen<H: ConnectionHandler>(
        config: WebSocketServerConfig,
        handler: Arc<H>,
    ) -> Result<Self, WebSocketAdapterError> {
        let (startup_tx, startup_rx) = mpsc::sync_channel::<Result<SocketAddr, String>>(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let running = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(MetricsInner::default());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("mirrorline-ws")
            .enable_all()
            .build()
            .map_err(|err| WebSocketAdapterError::Runtime(err.to_string()))?;

        let worker_running = Arc::clone(&running);
        let worker_metrics = Arc::clone(&metrics);
        let worker = thread::spawn(move || {
            runtime.block_on(run_server_worker(
                config,
                handler,
                worker_running,
                worker_metrics,
                shutdown_rx,
                startup_tx,
            ));
        });

        let local_addr = match startup_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(addr)) => addr,
            Ok(Err(err)) => return Err(WebSocketAdapterError::BindFailed(err)),
            Err(_) => return Err(WebSocketAdapterError::Closed),
        };

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
            running,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn metrics_snapshot(&self) -> WebSocketServerMetrics {
        self.metrics.snapshot()
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

async fn run_server_worker<H: ConnectionHandler>(
    config: WebSocketServerConfig,
    handler: Arc<H>,
    running: Arc<AtomicBool>,
    metrics: Arc<MetricsInner>,
    mut shutdown_rx: oneshot::Receiver<()>,
    startup_tx: mpsc::SyncSender<Result<SocketAddr, String>>,
) {
    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_addr = %config.bind_addr, error = %err, "websocket server bind failed");
            let _ = startup_tx.send(Err(err.to_string()));
            running.store(false, Ordering::Relaxed);
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            let _ = startup_tx.send(Err(err.to_string()));
            running.store(false, Ordering::Relaxed);
            return;
        }
    };
    info!(%local_addr, "websocket server listening");
    let _ = startup_tx.send(Ok(local_addr));

    let (stop_tx, stop_rx) = watch::channel(false);
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        metrics.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(serve_client(
                            stream,
                            addr,
                            config.clone(),
                            Arc::clone(&handler),
                            Arc::clone(&metrics),
                            stop_rx.clone(),
                        ));
                    }
                    Err(err) => warn!(error = %err, "websocket accept failed"),
                }
            }
        }
    }

    let _ = stop_tx.send(true);
    running.store(false, Ordering::Relaxed);
    info!(%local_addr, "websocket server stopped");
}

async fn serve_client<H: ConnectionHandler>(
    stream: TcpStream,
    addr: SocketAddr,
    config: WebSocketServerConfig,
    handler: Arc<H>,
    metrics: Arc<MetricsInner>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut uri = None;
    let capture_uri = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        uri = Some(request.uri().clone());
        Ok(response)
    };
    let mut ws_stream = match tokio_tungstenite::accept_hdr_async(stream, capture_uri).await {
        Ok(ws_stream) => ws_stream,
        Err(err) => {
            metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            warn!(%addr, error = %err, "websocket handshake failed");
            return;
        }
    };
    let request = ConnectRequest::from_uri(addr, uri.as_ref());

    let (client_tx, mut client_rx) = tokio_mpsc::channel::<Vec<u8>>(config.client_queue_capacity.max(1));
    let sink = Arc::new(WebSocketFrameSink::new(
        client_tx,
        config.max_payload_hint,
        Arc::clone(&metrics),
    ));
    let Some(client) = block_in_place(|| handler.on_open(&request, Arc::clone(&sink))) else {
        metrics.connections_rejected.fetch_add(1, Ordering::Relaxed);
        debug!(%addr, path = %request.path, "websocket client rejected");
        let _ = ws_stream.close(None).await;
        return;
    };
    debug!(%addr, path = %request.path, "websocket client opened");

    let (mut write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        metrics.inbound_received.fetch_add(1, Ordering::Relaxed);
                        block_in_place(|| handler.on_frame(&client, bytes));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%addr, error = %err, "websocket read error");
                        break;
                    }
                }
            }
            outgoing = client_rx.recv() => {
                let Some(bytes) = outgoing else { break };
                if let Err(err) = write.send(Message::Binary(bytes)).await {
                    metrics.outbound_send_err.fetch_add(1, Ordering::Relaxed);
                    debug!(%addr, error = %err, "websocket write error");
                    break;
                }
                metrics.outbound_send_ok.fetch_add(1, Ordering::Relaxed);
                if sink.take_stalled() {
                    block_in_place(|| handler.on_writable(&client));
                }
            }
        }
    }

    sink.mark_closed();
    block_in_place(|| handler.on_close(client));
    debug!(%addr, "websocket client closed");
}
