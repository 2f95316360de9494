//! Message dispatcher: decodes inbound envelopes and routes them to the
//! plugin registry and per-plugin connections.
//!
//! The registry and the identifier → connection map sit behind one mutex.
//! Host threads call [`Dispatcher::add_plugin`] while I/O tasks deliver
//! `init` / `deinit` / `execute`; plugin callbacks always run after the lock
//! is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::decode_envelope;
use crate::connection::PluginConnection;
use crate::error::{ExaminerError, ExaminerResult};
use crate::messages::{
    ErrorBody, ErrorResponse, Inbound, MethodSupport, PluginList, SuccessResponse,
};
use crate::plugin::Plugin;
use crate::registry::PluginRegistry;
use crate::transport::{send_json, MessageHandler, MessageSink};

#[derive(Default)]
struct DispatchState {
    registry: PluginRegistry,
    connections: HashMap<String, Arc<PluginConnection>>,
}

/// Routes protocol envelopes to registered plugins.
#[derive(Default)]
pub struct Dispatcher {
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a plugin. Safe to call while messages are being handled.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        info!(
            plugin = %plugin.identifier(),
            background = plugin.runs_in_background(),
            "plugin added"
        );
        self.state().registry.add(plugin);
    }

    /// Registered identifiers in registration order.
    pub fn plugin_identifiers(&self) -> Vec<String> {
        self.state().registry.identifiers()
    }

    /// The live connection for `identifier`, if the plugin is initialized.
    pub fn connection(&self, identifier: &str) -> Option<Arc<PluginConnection>> {
        self.state().connections.get(identifier).cloned()
    }

    /// Identifiers of currently initialized plugins, sorted.
    pub fn connected_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Route one decoded envelope. Responses go out through `channel`.
    pub fn dispatch(&self, envelope: Inbound, channel: Arc<dyn MessageSink>) -> ExaminerResult<()> {
        debug!(method = envelope.method_name(), id = ?envelope.id(), "dispatching");

        match envelope {
            Inbound::GetPlugins { id } => {
                let plugins = self.state().registry.identifiers();
                respond_success(channel.as_ref(), id, &PluginList { plugins })
            }
            Inbound::GetBackgroundPlugins { id } => {
                let plugins = self.state().registry.background_identifiers();
                respond_success(channel.as_ref(), id, &PluginList { plugins })
            }
            Inbound::Init { params } => {
                self.init_plugin(&params.plugin, channel);
                Ok(())
            }
            Inbound::Deinit { params } => {
                self.deinit_plugin(&params.plugin);
                Ok(())
            }
            Inbound::Execute { id, params } => {
                let api = params.api.clone();
                let method = params.method.clone();
                if let Err(e) = self.execute(&api, &method, id, params.params, channel.clone()) {
                    warn!(
                        api = %api,
                        method = %method,
                        id,
                        error = %e,
                        "execute failed"
                    );
                    respond_error(channel.as_ref(), id, &e)?;
                }
                Ok(())
            }
            Inbound::IsMethodSupported { id, params } => {
                let is_supported = self
                    .connection(&params.api)
                    .is_some_and(|c| c.is_method_supported(&params.method));
                respond_success(channel.as_ref(), id, &MethodSupport { is_supported })
            }
        }
    }

    /// Create a connection for every plugin registered as `identifier`.
    /// The last one created stays routable.
    fn init_plugin(&self, identifier: &str, channel: Arc<dyn MessageSink>) {
        let mut connected = Vec::new();
        {
            let mut state = self.state();
            for plugin in state.registry.matching(identifier) {
                let connection = Arc::new(PluginConnection::new(identifier, channel.clone()));
                state
                    .connections
                    .insert(identifier.to_string(), connection.clone());
                connected.push((plugin, connection));
            }
        }

        if connected.is_empty() {
            warn!(plugin = %identifier, "init for unregistered plugin");
            return;
        }

        for (plugin, connection) in connected {
            info!(plugin = %identifier, "plugin connected");
            plugin.on_connect(connection);
        }
    }

    /// Drop the connection for `identifier`, if any, and notify every
    /// matching plugin whether or not it was initialized.
    fn deinit_plugin(&self, identifier: &str) {
        let plugins = {
            let mut state = self.state();
            if state.connections.remove(identifier).is_none() {
                debug!(plugin = %identifier, "deinit for plugin that is not initialized");
            }
            state.registry.matching(identifier)
        };

        if plugins.is_empty() {
            warn!(plugin = %identifier, "deinit for unregistered plugin");
        }
        for plugin in plugins {
            info!(plugin = %identifier, "plugin disconnected");
            plugin.on_disconnect();
        }
    }

    fn execute(
        &self,
        api: &str,
        method: &str,
        id: i64,
        params: Value,
        channel: Arc<dyn MessageSink>,
    ) -> ExaminerResult<()> {
        let connection = self
            .connection(api)
            .ok_or_else(|| ExaminerError::PluginNotFound(api.to_string()))?;
        connection.call_with_channel(method, id, params, channel)
    }
}

impl MessageHandler for Dispatcher {
    fn handle_message(&self, data: &[u8], channel: Arc<dyn MessageSink>) {
        let envelope = match decode_envelope(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = data.len(), "dropping undecodable message");
                return;
            }
        };

        if let Err(e) = self.dispatch(envelope, channel) {
            warn!(error = %e, "failed to handle message");
        }
    }
}

fn respond_success<T: serde::Serialize>(
    channel: &dyn MessageSink,
    id: i64,
    payload: &T,
) -> ExaminerResult<()> {
    send_json(channel, &SuccessResponse { success: payload, id })
}

fn respond_error(channel: &dyn MessageSink, id: i64, error: &ExaminerError) -> ExaminerResult<()> {
    send_json(
        channel,
        &ErrorResponse {
            error: ErrorBody::from(error),
            id,
        },
    )
}
