//! Transport channels to the desktop inspector.
//!
//! The connection manager never touches sockets directly. It asks a
//! [`TransportFactory`] for a channel and learns about it only through the
//! tagged events it was given. Production uses WebSocket channels:
//! - insecure: `ws://<host>:<insecure_port>` with no client certificate
//! - secure: `wss://<host>:<secure_port>` presenting the device identity

pub mod websocket;

pub use websocket::WebSocketChannel;

use std::sync::Arc;

use examiner_core::{
    ChannelEvents, ConnectionParameters, ExaminerConfig, ExaminerResult, MessageSink,
};
use tokio_tungstenite::Connector;

use crate::certificate::DeviceIdentity;
use crate::tls;

/// An open (or opening) channel owned by the connection manager.
pub trait Transport: Send {
    /// Non-blocking handle for queueing outgoing payloads.
    fn sink(&self) -> Arc<dyn MessageSink>;

    /// Tear the channel down. No events are emitted afterwards.
    fn stop(&mut self);
}

/// Opens channels for the connection manager.
pub trait TransportFactory: Send + Sync {
    fn open_insecure(
        &self,
        params: &ConnectionParameters,
        events: ChannelEvents,
    ) -> ExaminerResult<Box<dyn Transport>>;

    fn open_secure(
        &self,
        params: &ConnectionParameters,
        identity: &DeviceIdentity,
        events: ChannelEvents,
    ) -> ExaminerResult<Box<dyn Transport>>;
}

/// Opens WebSocket channels on the configured ports.
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    insecure_port: u16,
    secure_port: u16,
}

impl WebSocketTransportFactory {
    pub fn new(config: &ExaminerConfig) -> Self {
        Self {
            insecure_port: config.insecure_port,
            secure_port: config.secure_port,
        }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn open_insecure(
        &self,
        params: &ConnectionParameters,
        events: ChannelEvents,
    ) -> ExaminerResult<Box<dyn Transport>> {
        let url = params.url("ws", self.insecure_port)?;
        tracing::debug!(%url, "opening insecure channel");
        Ok(Box::new(WebSocketChannel::open(url, None, events)))
    }

    fn open_secure(
        &self,
        params: &ConnectionParameters,
        identity: &DeviceIdentity,
        events: ChannelEvents,
    ) -> ExaminerResult<Box<dyn Transport>> {
        let url = params.url("wss", self.secure_port)?;
        let connector = Connector::Rustls(Arc::new(tls::client_config(identity)?));
        tracing::debug!(%url, "opening secure channel");
        Ok(Box::new(WebSocketChannel::open(url, Some(connector), events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use examiner_core::{ChannelEvent, ChannelRole, ChannelTag};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn test_config(port: u16) -> ExaminerConfig {
        let mut config = ExaminerConfig::from_toml_str("").unwrap();
        config.insecure_port = port;
        config
    }

    #[tokio::test]
    async fn insecure_channel_opens_and_delivers_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            use futures_util::{SinkExt, StreamExt};
            use tokio_tungstenite::tungstenite::Message;

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            ws.send(Message::text(r#"{"deviceId":"abc"}"#)).await.unwrap();
            first.into_text().unwrap().to_string()
        });

        let config = test_config(port);
        let factory = WebSocketTransportFactory::new(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = ChannelTag {
            role: ChannelRole::Insecure,
            attempt: 1,
        };
        let params = ConnectionParameters::for_device(&config, "");
        let mut channel = factory
            .open_insecure(&params, ChannelEvents::new(tag, tx))
            .unwrap();

        let opened = rx.recv().await.unwrap();
        assert_eq!(opened.tag, tag);
        assert_eq!(opened.event, ChannelEvent::Opened);

        channel.sink().send(b"{\"method\":\"signCertificate\"}".to_vec()).unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(
            reply.event,
            ChannelEvent::Message(br#"{"deviceId":"abc"}"#.to_vec())
        );
        assert_eq!(server.await.unwrap(), "{\"method\":\"signCertificate\"}");

        channel.stop();
    }

    #[tokio::test]
    async fn refused_connection_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = test_config(port);
        let factory = WebSocketTransportFactory::new(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = ChannelTag {
            role: ChannelRole::Insecure,
            attempt: 1,
        };
        let params = ConnectionParameters::for_device(&config, "");
        let _channel = factory
            .open_insecure(&params, ChannelEvents::new(tag, tx))
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.event, ChannelEvent::Failed(_)));
    }
}
