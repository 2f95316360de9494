//! Outbound WebSocket channel.
//!
//! One channel is one WebSocket connection to the desktop. Connecting,
//! reading and writing all happen on background tasks; the owner only sees
//! [`ChannelEvent`](examiner_core::ChannelEvent)s and a non-blocking
//! [`MessageSink`].
//!
//! Outgoing payloads go through an unbounded queue drained by a single writer
//! task, so frames leave in the order they were queued. Valid UTF-8 payloads
//! are sent as text frames; anything else as binary.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use examiner_core::{ChannelEvents, ChannelTag, ExaminerError, ExaminerResult, MessageSink};

use super::Transport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on waiting for the close frame to flush during `stop`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

enum Outgoing {
    Frame(Message),
    Close,
}

/// Queue-backed sink handed to plugins and the dispatcher.
struct QueueSink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl MessageSink for QueueSink {
    fn send(&self, data: Vec<u8>) -> ExaminerResult<()> {
        let frame = match String::from_utf8(data) {
            Ok(text) => Message::text(text),
            Err(e) => Message::binary(e.into_bytes()),
        };
        self.tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| ExaminerError::ChannelClosed)
    }
}

/// A single outbound WebSocket connection.
pub struct WebSocketChannel {
    tag: ChannelTag,
    sink: Arc<QueueSink>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl WebSocketChannel {
    /// Start connecting to `url`. Progress is reported through `events`.
    ///
    /// `connector` carries the TLS client config for `wss://` URLs; `None`
    /// dials plain TCP.
    pub fn open(url: Url, connector: Option<Connector>, events: ChannelEvents) -> Self {
        let tag = events.tag();
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(run_channel(url, connector, events, tx.clone(), rx, stop_rx));
        Self {
            tag,
            sink: Arc::new(QueueSink { tx }),
            stop_tx: Some(stop_tx),
        }
    }

    pub fn tag(&self) -> ChannelTag {
        self.tag
    }
}

impl Transport for WebSocketChannel {
    fn sink(&self) -> Arc<dyn MessageSink> {
        self.sink.clone()
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            tracing::debug!(
                channel = %self.tag.role,
                attempt = self.tag.attempt,
                "stopping channel"
            );
            let _ = stop_tx.send(());
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        // The task winds down on its own once it sees the stop signal.
        self.stop();
    }
}

async fn run_channel(
    url: Url,
    connector: Option<Connector>,
    events: ChannelEvents,
    queue_tx: mpsc::UnboundedSender<Outgoing>,
    queue_rx: mpsc::UnboundedReceiver<Outgoing>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let connect = connect_async_tls_with_config(url.as_str(), None, false, connector);
    let ws = tokio::select! {
        _ = &mut stop_rx => return,
        result = connect => match result {
            Ok((ws, _response)) => ws,
            Err(e) => {
                tracing::warn!(channel = %events.tag().role, %url, "WebSocket connect error: {e}");
                events.failed(format!("connect error: {e}"));
                return;
            }
        },
    };

    tracing::info!(
        channel = %events.tag().role,
        host = url.host_str().unwrap_or_default(),
        "WebSocket connected"
    );
    events.opened();

    let (ws_sink, ws_read) = ws.split();
    let mut writer = tokio::spawn(write_loop(ws_sink, queue_rx));
    let mut reader = tokio::spawn(read_loop(ws_read, queue_tx.clone(), events.clone()));

    tokio::select! {
        _ = &mut stop_rx => {
            // No events after stop: the receiver side already moved on.
            reader.abort();
            let _ = queue_tx.send(Outgoing::Close);
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        reason = &mut reader => {
            writer.abort();
            let reason = reason.unwrap_or_else(|e| format!("reader task failed: {e}"));
            tracing::info!(channel = %events.tag().role, "WebSocket channel lost: {reason}");
            events.failed(reason);
        }
        result = &mut writer => {
            reader.abort();
            let reason = match result {
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(())) => "writer finished".to_string(),
                Err(e) => format!("writer task failed: {e}"),
            };
            tracing::info!(channel = %events.tag().role, "WebSocket channel lost: {reason}");
            events.failed(reason);
        }
    }
}

/// Drain the outgoing queue into the socket until a close is requested.
async fn write_loop(
    mut ws_sink: SplitSink<WsStream, Message>,
    mut queue_rx: mpsc::UnboundedReceiver<Outgoing>,
) -> ExaminerResult<()> {
    while let Some(outgoing) = queue_rx.recv().await {
        match outgoing {
            Outgoing::Frame(frame) => {
                ws_sink
                    .send(frame)
                    .await
                    .map_err(|e| ExaminerError::Transport(format!("WS write error: {e}")))?;
            }
            Outgoing::Close => {
                let _ = ws_sink.send(Message::Close(None)).await;
                let _ = ws_sink.close().await;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Read frames until the connection ends; returns the reason it ended.
async fn read_loop(
    mut ws_read: SplitStream<WsStream>,
    queue_tx: mpsc::UnboundedSender<Outgoing>,
    events: ChannelEvents,
) -> String {
    while let Some(msg) = ws_read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                events.message(text.as_bytes().to_vec());
            }
            Ok(Message::Binary(data)) => {
                events.message(data.to_vec());
            }
            Ok(Message::Ping(payload)) => {
                let _ = queue_tx.send(Outgoing::Frame(Message::Pong(payload)));
            }
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "WebSocket close frame received");
                return "closed by peer".to_string();
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket read error: {e}");
                return format!("read error: {e}");
            }
        }
    }
    "connection closed".to_string()
}
