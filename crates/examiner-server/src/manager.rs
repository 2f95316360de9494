//! Bridges the frame server into the plugin dispatcher.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use examiner_core::{
    Dispatcher, ExaminerConfig, ExaminerError, ExaminerResult, MessageHandler, MessageSink, Plugin,
};
use tracing::{debug, info, warn};

use crate::server::{ConnectionId, FrameServer, ServerDelegate};

/// Server-role engine: a [`FrameServer`] whose messages feed a [`Dispatcher`].
pub struct ServerConnectionManager {
    dispatcher: Arc<Dispatcher>,
    server: FrameServer,
}

impl Default for ServerConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConnectionManager {
    pub fn new() -> Self {
        Self::with_dispatcher(Arc::new(Dispatcher::new()))
    }

    /// Serve an existing dispatcher, e.g. one shared with the outbound role.
    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        let delegate = Arc::new(DispatchDelegate {
            dispatcher: dispatcher.clone(),
        });
        Self {
            dispatcher,
            server: FrameServer::new(delegate),
        }
    }

    /// All interfaces on the configured server port.
    pub fn bind_addr(config: &ExaminerConfig) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server_port))
    }

    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.dispatcher.add_plugin(plugin);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn server(&self) -> &FrameServer {
        &self.server
    }

    /// Start listening. Returns the bound address.
    pub async fn start(&self, bind_addr: SocketAddr) -> ExaminerResult<SocketAddr> {
        self.server.start(bind_addr).await
    }

    pub fn stop(&self) {
        info!("stopping server connection manager");
        self.server.shutdown();
    }
}

struct DispatchDelegate {
    dispatcher: Arc<Dispatcher>,
}

impl ServerDelegate for DispatchDelegate {
    fn server_ready(&self, addr: SocketAddr) {
        info!(addr = %addr, "server ready");
    }

    fn connection_opened(&self, id: ConnectionId) {
        info!(conn_id = id, "desktop connected");
    }

    fn connection_closed(&self, id: ConnectionId) {
        info!(conn_id = id, "desktop disconnected");
    }

    fn connection_error(&self, id: ConnectionId, error: &ExaminerError) {
        warn!(conn_id = id, error = %error, "connection error");
    }

    fn message_received(&self, id: ConnectionId, data: &[u8], reply: Arc<dyn MessageSink>) {
        debug!(conn_id = id, len = data.len(), "message received");
        self.dispatcher.handle_message(data, reply);
    }
}
