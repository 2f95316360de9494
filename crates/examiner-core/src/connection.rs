//! Per-plugin half of the protocol: receivers, outbound notifications and
//! responders.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::decode_params;
use crate::error::{ExaminerError, ExaminerResult};
use crate::messages::{ErrorResponse, ExecuteNotification, SuccessResponse};
use crate::transport::{send_json, MessageSink};

type Invoke = dyn Fn(Value, Responder) -> ExaminerResult<()> + Send + Sync;

/// A registered method handler. `invoke` decodes the raw params into the
/// type declared at registration before calling the plugin callback.
#[derive(Clone)]
struct Receiver {
    params_type: &'static str,
    invoke: Arc<Invoke>,
}

/// Live binding between an initialized plugin and the channel that
/// initialized it.
pub struct PluginConnection {
    plugin_id: String,
    channel: Arc<dyn MessageSink>,
    receivers: RwLock<HashMap<String, Receiver>>,
}

impl fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginConnection")
            .field("plugin_id", &self.plugin_id)
            .field("methods", &self.methods())
            .finish()
    }
}

impl PluginConnection {
    pub fn new(plugin_id: impl Into<String>, channel: Arc<dyn MessageSink>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            channel,
            receivers: RwLock::new(HashMap::new()),
        }
    }

    /// Identifier of the plugin this connection belongs to.
    pub fn identifier(&self) -> &str {
        &self.plugin_id
    }

    /// Register `callback` for `method`, replacing any earlier registration.
    ///
    /// Inbound params are decoded as `T` when the call arrives; a payload
    /// that does not fit `T` is answered with an error and never reaches
    /// the callback.
    pub fn receive<T, F>(&self, method: impl Into<String>, callback: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, Responder) + Send + Sync + 'static,
    {
        let method = method.into();
        let method_name = method.clone();
        let invoke = move |params: Value, responder: Responder| -> ExaminerResult<()> {
            let decoded: T = decode_params(&method_name, params)?;
            callback(decoded, responder);
            Ok(())
        };

        let receiver = Receiver {
            params_type: std::any::type_name::<T>(),
            invoke: Arc::new(invoke),
        };

        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        if receivers.insert(method.clone(), receiver).is_some() {
            debug!(plugin = %self.plugin_id, method = %method, "receiver replaced");
        }
    }

    /// Push an app-initiated `execute` notification. No response is awaited.
    pub fn send<T: Serialize>(&self, method: &str, params: &T) -> ExaminerResult<()> {
        let notification = ExecuteNotification::new(self.plugin_id.as_str(), method, params);
        send_json(self.channel.as_ref(), &notification)
    }

    pub fn is_method_supported(&self, method: &str) -> bool {
        self.receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }

    /// Deliver an inbound `execute` call to the receiver for `method`,
    /// answering through the channel this connection is bound to.
    pub fn call(&self, method: &str, id: i64, params: Value) -> ExaminerResult<()> {
        self.call_with_channel(method, id, params, self.channel.clone())
    }

    /// Like [`call`](Self::call), but the responder writes to `reply`.
    ///
    /// The receiver runs outside the map lock, so callbacks may register
    /// receivers themselves.
    pub fn call_with_channel(
        &self,
        method: &str,
        id: i64,
        params: Value,
        reply: Arc<dyn MessageSink>,
    ) -> ExaminerResult<()> {
        let receiver = self
            .receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
            .ok_or_else(|| ExaminerError::MethodNotFound {
                api: self.plugin_id.clone(),
                method: method.to_string(),
            })?;

        debug!(
            plugin = %self.plugin_id,
            method = %method,
            params_type = receiver.params_type,
            id,
            "invoking receiver"
        );
        (receiver.invoke)(params, Responder::new(id, reply)).map_err(|e| {
            warn!(plugin = %self.plugin_id, method = %method, error = %e, "call rejected");
            e
        })
    }
}

/// Answers exactly one inbound call. Consumed by `success` or `error`.
pub struct Responder {
    id: i64,
    channel: Arc<dyn MessageSink>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish()
    }
}

impl Responder {
    pub fn new(id: i64, channel: Arc<dyn MessageSink>) -> Self {
        Self { id, channel }
    }

    /// The request id this responder answers.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Write `{"success": payload, "id": id}`.
    pub fn success<T: Serialize + ?Sized>(self, payload: &T) -> ExaminerResult<()> {
        send_json(
            self.channel.as_ref(),
            &SuccessResponse {
                success: payload,
                id: self.id,
            },
        )
    }

    /// Write `{"error": payload, "id": id}`.
    pub fn error<T: Serialize + ?Sized>(self, payload: &T) -> ExaminerResult<()> {
        send_json(
            self.channel.as_ref(),
            &ErrorResponse {
                error: payload,
                id: self.id,
            },
        )
    }
}
