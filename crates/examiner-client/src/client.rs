//! Engine facade for the outbound role.

use std::sync::Arc;

use examiner_core::{Dispatcher, ExaminerConfig, ExaminerResult, Plugin};
use tokio::sync::watch;

use crate::certificate::{CertificateAuthority, FileCertificateAuthority};
use crate::manager::{ConnectionManager, ConnectionState, StopReason};
use crate::transport::{TransportFactory, WebSocketTransportFactory};

/// Plugin registry plus connection manager, wired together.
///
/// Plugins may be added before or after `start`; they become visible to the
/// desktop on its next `getPlugins` request.
pub struct ExaminerClient {
    dispatcher: Arc<Dispatcher>,
    manager: ConnectionManager,
}

impl ExaminerClient {
    /// Client dialing the configured host over WebSocket, keeping certificate
    /// material in `config.cert_dir`.
    pub fn new(config: ExaminerConfig) -> Self {
        let factory = Arc::new(WebSocketTransportFactory::new(&config));
        let authority = Arc::new(FileCertificateAuthority::new(config.cert_dir.clone()));
        Self::with_parts(config, factory, authority)
    }

    pub fn with_parts(
        config: ExaminerConfig,
        factory: Arc<dyn TransportFactory>,
        authority: Arc<dyn CertificateAuthority>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new()),
            manager: ConnectionManager::new(config, factory, authority),
        }
    }

    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.dispatcher.add_plugin(plugin);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Start the trust bootstrap. Requires a tokio runtime.
    pub fn start(&self) -> ExaminerResult<()> {
        tracing::info!(
            plugins = self.dispatcher.plugin_identifiers().len(),
            "starting examiner client"
        );
        self.manager.start(self.dispatcher.clone())
    }

    pub async fn stop(&self) {
        self.manager.stop().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe()
    }

    pub async fn wait_stopped(&self) -> StopReason {
        self.manager.wait_stopped().await
    }
}
