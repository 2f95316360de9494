//! WebSocket frame server.
//!
//! Accepts inbound TCP connections, upgrades them to WebSocket and hands
//! every complete message to a [`ServerDelegate`] tagged with the
//! connection's id. Outgoing writes for one connection go through a single
//! queue drained by one writer task, so concurrent senders never interleave.
//!
//! Listener states: `Setup → Waiting → Ready → Failed | Cancelled`.
//! Connection states: `Setup → Waiting → Preparing → Ready → Failed | Cancelled`.
//! A listener failure closes every connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use examiner_core::{ExaminerError, ExaminerResult, MessageSink};

/// Opaque, process-unique connection identifier.
pub type ConnectionId = u64;

/// Maximum accepted message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Setup,
    /// Binding the listening socket.
    Waiting,
    /// Accepting connections.
    Ready,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP accepted, registered under its id.
    Setup,
    /// Waiting for the peer's upgrade request.
    Waiting,
    /// WebSocket handshake in progress.
    Preparing,
    Ready,
    Failed(String),
    Cancelled,
}

/// Receives connection lifecycle and message callbacks.
///
/// Callbacks run on the connection's task; they should not block.
pub trait ServerDelegate: Send + Sync {
    fn server_ready(&self, _addr: SocketAddr) {}

    fn connection_opened(&self, _id: ConnectionId) {}

    fn connection_closed(&self, _id: ConnectionId) {}

    fn connection_error(&self, _id: ConnectionId, _error: &ExaminerError) {}

    /// One complete message. `reply` writes back on the same connection.
    fn message_received(&self, id: ConnectionId, data: &[u8], reply: Arc<dyn MessageSink>);
}

/// Write handle for one connection.
struct ConnectionSink {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSink for ConnectionSink {
    fn send(&self, data: Vec<u8>) -> ExaminerResult<()> {
        let frame = match String::from_utf8(data) {
            Ok(text) => Message::text(text),
            Err(e) => Message::binary(e.into_bytes()),
        };
        self.tx.send(frame).map_err(|_| {
            debug!(conn_id = self.id, "write to closed connection");
            ExaminerError::ChannelClosed
        })
    }
}

struct ConnectionEntry {
    remote_addr: SocketAddr,
    sink: Arc<ConnectionSink>,
    state: watch::Receiver<ConnectionState>,
    cancel: Option<oneshot::Sender<()>>,
}

struct Shared {
    delegate: Arc<dyn ServerDelegate>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    next_conn_id: AtomicU64,
    listener_state: watch::Sender<ListenerState>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Listens for inbound WebSocket connections. Cheap to clone.
#[derive(Clone)]
pub struct FrameServer {
    shared: Arc<Shared>,
}

impl FrameServer {
    pub fn new(delegate: Arc<dyn ServerDelegate>) -> Self {
        let (listener_state, _) = watch::channel(ListenerState::Setup);
        Self {
            shared: Arc::new(Shared {
                delegate,
                connections: RwLock::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                listener_state,
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// Bind `bind_addr` and start accepting. Returns the bound address.
    pub async fn start(&self, bind_addr: SocketAddr) -> ExaminerResult<SocketAddr> {
        {
            let state = self.shared.listener_state.borrow();
            if matches!(*state, ListenerState::Waiting | ListenerState::Ready) {
                return Err(ExaminerError::Other("frame server already started".into()));
            }
        }
        self.set_listener_state(ListenerState::Waiting);

        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let reason = format!("WS bind failed: {e}");
                error!(addr = %bind_addr, "{reason}");
                self.set_listener_state(ListenerState::Failed(reason.clone()));
                return Err(ExaminerError::Transport(reason));
            }
        };
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self
            .shared
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);

        self.set_listener_state(ListenerState::Ready);
        info!(addr = %local_addr, "WebSocket listener started");
        self.shared.delegate.server_ready(local_addr);

        tokio::spawn(self.clone().accept_loop(listener, shutdown_rx));
        Ok(local_addr)
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        let shutdown = self
            .shared
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        if !matches!(*self.shared.listener_state.borrow(), ListenerState::Failed(_)) {
            self.set_listener_state(ListenerState::Cancelled);
        }
        self.close_all();
    }

    /// Queue `data` for connection `id`.
    pub fn send_to(&self, id: ConnectionId, data: Vec<u8>) -> ExaminerResult<()> {
        let sink = {
            let connections = self
                .shared
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            connections.get(&id).map(|entry| entry.sink.clone())
        };
        match sink {
            Some(sink) => sink.send(data),
            None => Err(ExaminerError::Transport(format!("unknown connection {id}"))),
        }
    }

    /// Cancel connection `id`. Returns `false` if it was not registered.
    pub fn close(&self, id: ConnectionId) -> bool {
        let entry = self
            .shared
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match entry {
            Some(mut entry) => {
                debug!(conn_id = id, remote = %entry.remote_addr, "closing connection");
                if let Some(cancel) = entry.cancel.take() {
                    let _ = cancel.send(());
                }
                true
            }
            None => false,
        }
    }

    pub fn listener_state(&self) -> ListenerState {
        self.shared.listener_state.borrow().clone()
    }

    pub fn subscribe_listener(&self) -> watch::Receiver<ListenerState> {
        self.shared.listener_state.subscribe()
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        let connections = self
            .shared
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.get(&id).map(|entry| entry.state.borrow().clone())
    }

    /// Watch the lifecycle of connection `id`.
    ///
    /// The receiver outlives the registration, so it still observes the
    /// terminal `Failed` / `Cancelled` state after the connection is removed.
    pub fn subscribe_connection(
        &self,
        id: ConnectionId,
    ) -> Option<watch::Receiver<ConnectionState>> {
        let connections = self
            .shared
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.get(&id).map(|entry| entry.state.clone())
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let connections = self
            .shared
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn set_listener_state(&self, state: ListenerState) {
        debug!(?state, "listener state");
        self.shared.listener_state.send_replace(state);
    }

    fn close_all(&self) {
        let entries: Vec<_> = self
            .shared
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, mut entry) in entries {
            debug!(conn_id = id, "closing connection");
            if let Some(cancel) = entry.cancel.take() {
                let _ = cancel.send(());
            }
        }
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("WebSocket listener cancelled");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.register(stream, addr),
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                        let reason = format!("accept failed: {e}");
                        self.set_listener_state(ListenerState::Failed(reason));
                        self.shutdown();
                        break;
                    }
                },
            }
        }
    }

    fn register(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Setup);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let sink = Arc::new(ConnectionSink { id, tx });

        self.shared
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ConnectionEntry {
                    remote_addr,
                    sink: sink.clone(),
                    state: state_rx,
                    cancel: Some(cancel_tx),
                },
            );
        debug!(conn_id = id, remote = %remote_addr, "connection accepted");

        let server = self.clone();
        tokio::spawn(async move {
            let outcome = server
                .run_connection(id, stream, sink, rx, cancel_rx, &state_tx)
                .await;
            server.finish(id, outcome, &state_tx);
        });
    }

    async fn run_connection(
        &self,
        id: ConnectionId,
        stream: TcpStream,
        sink: Arc<ConnectionSink>,
        mut queue_rx: mpsc::UnboundedReceiver<Message>,
        mut cancel_rx: oneshot::Receiver<()>,
        state: &watch::Sender<ConnectionState>,
    ) -> Outcome {
        let upgrade = async {
            state.send_replace(ConnectionState::Waiting);
            stream.readable().await?;

            state.send_replace(ConnectionState::Preparing);
            let mut config = WebSocketConfig::default();
            config.max_message_size = Some(MAX_MESSAGE_SIZE);
            config.max_frame_size = Some(MAX_MESSAGE_SIZE);
            tokio_tungstenite::accept_async_with_config(stream, Some(config))
                .await
                .map_err(|e| ExaminerError::Transport(format!("WebSocket handshake failed: {e}")))
        };
        let ws = tokio::select! {
            _ = &mut cancel_rx => return Outcome::Cancelled,
            upgraded = upgrade => match upgraded {
                Ok(ws) => ws,
                Err(e) => return Outcome::Failed(e),
            },
        };

        state.send_replace(ConnectionState::Ready);
        info!(conn_id = id, "connection ready");
        self.shared.delegate.connection_opened(id);

        let (mut ws_sink, mut ws_read) = ws.split();
        let reply: Arc<dyn MessageSink> = sink.clone();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    let close = ws_sink.send(Message::Close(None));
                    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
                        debug!(conn_id = id, "close frame not flushed");
                    }
                    return Outcome::Cancelled;
                }
                outgoing = queue_rx.recv() => match outgoing {
                    Some(frame) => {
                        if let Err(e) = ws_sink.send(frame).await {
                            let reason = format!("WS send failed: {e}");
                            return Outcome::Failed(ExaminerError::Transport(reason));
                        }
                    }
                    None => return Outcome::Cancelled,
                },
                incoming = ws_read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.shared.delegate.message_received(id, text.as_bytes(), reply.clone());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.shared.delegate.message_received(id, &data, reply.clone());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.tx.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) | None => return Outcome::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let reason = format!("WS recv failed: {e}");
                        return Outcome::Failed(ExaminerError::Transport(reason));
                    }
                },
            }
        }
    }

    fn finish(&self, id: ConnectionId, outcome: Outcome, state: &watch::Sender<ConnectionState>) {
        // Terminal state is published while the entry is still registered.
        let failure = match outcome {
            Outcome::Failed(e) => {
                warn!(conn_id = id, error = %e, "connection failed");
                state.send_replace(ConnectionState::Failed(e.to_string()));
                Some(e)
            }
            Outcome::Closed => {
                info!(conn_id = id, "connection closed by peer");
                state.send_replace(ConnectionState::Cancelled);
                None
            }
            Outcome::Cancelled => {
                info!(conn_id = id, "connection cancelled");
                state.send_replace(ConnectionState::Cancelled);
                None
            }
        };

        self.shared
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        if let Some(e) = failure {
            self.shared.delegate.connection_error(id, &e);
        }
        self.shared.delegate.connection_closed(id);
    }
}

enum Outcome {
    Closed,
    Cancelled,
    Failed(ExaminerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[derive(Debug, PartialEq)]
    enum Event {
        Ready,
        Opened(ConnectionId),
        Closed(ConnectionId),
        Error(ConnectionId),
        Message(ConnectionId, Vec<u8>),
    }

    /// Records callbacks and echoes every message back.
    struct EchoDelegate {
        events: mpsc::UnboundedSender<Event>,
    }

    impl ServerDelegate for EchoDelegate {
        fn server_ready(&self, _addr: SocketAddr) {
            let _ = self.events.send(Event::Ready);
        }

        fn connection_opened(&self, id: ConnectionId) {
            let _ = self.events.send(Event::Opened(id));
        }

        fn connection_closed(&self, id: ConnectionId) {
            let _ = self.events.send(Event::Closed(id));
        }

        fn connection_error(&self, id: ConnectionId, _error: &ExaminerError) {
            let _ = self.events.send(Event::Error(id));
        }

        fn message_received(&self, id: ConnectionId, data: &[u8], reply: Arc<dyn MessageSink>) {
            let _ = self.events.send(Event::Message(id, data.to_vec()));
            reply.send(data.to_vec()).unwrap();
        }
    }

    async fn start_server() -> (FrameServer, SocketAddr, mpsc::UnboundedReceiver<Event>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = FrameServer::new(Arc::new(EchoDelegate { events: tx }));
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::Ready));
        (server, addr, rx)
    }

    async fn connect(
        addr: SocketAddr,
    ) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>> {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws
    }

    async fn opened(rx: &mut mpsc::UnboundedReceiver<Event>) -> ConnectionId {
        match rx.recv().await {
            Some(Event::Opened(id)) => id,
            other => panic!("expected Opened, got {other:?}"),
        }
    }

    async fn next_text(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> String {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return text.to_string(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn echoes_messages_on_the_same_connection() {
        let (server, addr, mut rx) = start_server().await;
        let mut ws = connect(addr).await;
        let id = opened(&mut rx).await;
        assert_eq!(server.connection_state(id), Some(ConnectionState::Ready));

        ws.send(WsMessage::text(r#"{"method":"getPlugins","id":1}"#))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(Event::Message(id, br#"{"method":"getPlugins","id":1}"#.to_vec()))
        );
        assert_eq!(next_text(&mut ws).await, r#"{"method":"getPlugins","id":1}"#);
    }

    #[tokio::test]
    async fn connection_ids_are_unique_and_increasing() {
        let (server, addr, mut rx) = start_server().await;
        let _a = connect(addr).await;
        let first = opened(&mut rx).await;
        let _b = connect(addr).await;
        let second = opened(&mut rx).await;

        assert!(second > first);
        assert_eq!(server.connection_ids(), vec![first, second]);
    }

    #[tokio::test]
    async fn send_to_routes_by_id_and_keeps_order() {
        let (server, addr, mut rx) = start_server().await;
        let mut ws = connect(addr).await;
        let id = opened(&mut rx).await;

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let server = server.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        server
                            .send_to(id, format!("{{\"w\":{w},\"i\":{i}}}").into_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = [-1i64; 4];
        for _ in 0..200 {
            let text = next_text(&mut ws).await;
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            let w = value["w"].as_u64().unwrap() as usize;
            let i = value["i"].as_i64().unwrap();
            assert_eq!(i, last[w] + 1, "writer {w} out of order");
            last[w] = i;
        }
    }

    #[tokio::test]
    async fn send_to_unknown_connection_fails() {
        let (server, _addr, _rx) = start_server().await;
        assert!(matches!(
            server.send_to(999, b"{}".to_vec()),
            Err(ExaminerError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn close_sends_close_frame_and_notifies() {
        let (server, addr, mut rx) = start_server().await;
        let mut ws = connect(addr).await;
        let id = opened(&mut rx).await;

        assert!(server.close(id));
        assert!(!server.close(id));
        assert_eq!(rx.recv().await, Some(Event::Closed(id)));
        assert!(matches!(ws.next().await, Some(Ok(WsMessage::Close(_))) | None));
        assert!(server.connection_ids().is_empty());
        assert!(server.send_to(id, b"{}".to_vec()).is_err());
    }

    #[tokio::test]
    async fn peer_close_removes_connection() {
        let (server, addr, mut rx) = start_server().await;
        let mut ws = connect(addr).await;
        let id = opened(&mut rx).await;

        ws.close(None).await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::Closed(id)));
        assert_eq!(server.connection_state(id), None);
    }

    #[tokio::test]
    async fn subscribers_observe_terminal_state() {
        let (server, addr, mut rx) = start_server().await;
        let mut ws = connect(addr).await;
        let id = opened(&mut rx).await;
        let mut state = server.subscribe_connection(id).unwrap();

        let big = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let _ = ws.send(WsMessage::text(big)).await;
        let terminal = state
            .wait_for(|s| matches!(s, ConnectionState::Failed(_)))
            .await
            .unwrap()
            .clone();
        assert!(matches!(terminal, ConnectionState::Failed(_)));
        assert_eq!(rx.recv().await, Some(Event::Error(id)));
        assert_eq!(rx.recv().await, Some(Event::Closed(id)));

        let _b = connect(addr).await;
        let second = opened(&mut rx).await;
        let mut state = server.subscribe_connection(second).unwrap();
        assert!(server.close(second));
        state
            .wait_for(|s| *s == ConnectionState::Cancelled)
            .await
            .unwrap();
        assert!(server.subscribe_connection(second).is_none());
    }

    #[tokio::test]
    async fn oversized_message_fails_the_connection() {
        let (server, addr, mut rx) = start_server().await;
        let mut ws = connect(addr).await;
        let id = opened(&mut rx).await;

        let big = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let _ = ws.send(WsMessage::text(big)).await;
        assert_eq!(rx.recv().await, Some(Event::Error(id)));
        assert_eq!(rx.recv().await, Some(Event::Closed(id)));
        assert!(server.connection_ids().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_listener_and_connections() {
        let (server, addr, mut rx) = start_server().await;
        let _a = connect(addr).await;
        let first = opened(&mut rx).await;
        let _b = connect(addr).await;
        let second = opened(&mut rx).await;

        server.shutdown();
        assert_eq!(server.listener_state(), ListenerState::Cancelled);

        let mut closed = vec![];
        for _ in 0..2 {
            match rx.recv().await {
                Some(Event::Closed(id)) => closed.push(id),
                other => panic!("expected Closed, got {other:?}"),
            }
        }
        closed.sort_unstable();
        assert_eq!(closed, vec![first, second]);
    }

    #[tokio::test]
    async fn bind_failure_marks_listener_failed() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let server = FrameServer::new(Arc::new(EchoDelegate { events: tx }));
        assert!(server.start(addr).await.is_err());
        assert!(matches!(server.listener_state(), ListenerState::Failed(_)));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (server, _addr, _rx) = start_server().await;
        assert!(server.start("127.0.0.1:0".parse().unwrap()).await.is_err());
    }
}
