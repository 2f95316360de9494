//! JSON wire envelopes exchanged with the desktop inspector.
//!
//! Inbound envelopes are discriminated by their `method` field. Outbound
//! traffic is either a response correlated by `id` (`success` / `error`), an
//! app-initiated `execute` notification without `id`, or the bootstrap-only
//! `signCertificate` request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExaminerError;

/// Protocol/SDK version announced at dial time.
pub const SDK_VERSION: &str = "4";

/// Fixed "medium" tag announced at dial time and in signing requests.
pub const MEDIUM: i64 = 1;

/// Method name of app-initiated plugin notifications.
pub const EXECUTE_METHOD: &str = "execute";

/// Method name of the bootstrap certificate signing request.
pub const SIGN_CERTIFICATE_METHOD: &str = "signCertificate";

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Inbound {
    GetPlugins {
        id: i64,
    },
    GetBackgroundPlugins {
        id: i64,
    },
    /// Notification: no response is sent.
    Init {
        params: PluginTarget,
    },
    /// Notification: no response is sent.
    Deinit {
        params: PluginTarget,
    },
    Execute {
        id: i64,
        params: ExecuteParams,
    },
    IsMethodSupported {
        id: i64,
        params: MethodTarget,
    },
}

impl Inbound {
    /// Wire name of this envelope's method.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::GetPlugins { .. } => "getPlugins",
            Self::GetBackgroundPlugins { .. } => "getBackgroundPlugins",
            Self::Init { .. } => "init",
            Self::Deinit { .. } => "deinit",
            Self::Execute { .. } => "execute",
            Self::IsMethodSupported { .. } => "isMethodSupported",
        }
    }

    /// Request id, absent for notifications.
    pub fn id(&self) -> Option<i64> {
        match self {
            Self::GetPlugins { id }
            | Self::GetBackgroundPlugins { id }
            | Self::Execute { id, .. }
            | Self::IsMethodSupported { id, .. } => Some(*id),
            Self::Init { .. } | Self::Deinit { .. } => None,
        }
    }
}

/// `params` of `init` / `deinit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginTarget {
    pub plugin: String,
}

/// `params` of `execute`. The nested `params` stay undecoded until the
/// receiver for `api.method` is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteParams {
    pub api: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// `params` of `isMethodSupported`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodTarget {
    pub api: String,
    pub method: String,
}

/// `{"success": <payload>, "id": <id>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse<T> {
    pub success: T,
    pub id: i64,
}

/// `{"error": <payload>, "id": <id>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse<T> {
    pub error: T,
    pub id: i64,
}

/// App-initiated notification:
/// `{"method": "execute", "params": {"api", "method", "params"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteNotification<T> {
    pub method: String,
    pub params: ExecuteCall<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteCall<T> {
    pub api: String,
    pub method: String,
    pub params: T,
}

impl<T> ExecuteNotification<T> {
    pub fn new(api: impl Into<String>, method: impl Into<String>, params: T) -> Self {
        Self {
            method: EXECUTE_METHOD.to_string(),
            params: ExecuteCall {
                api: api.into(),
                method: method.into(),
                params,
            },
        }
    }
}

/// Payload of `getPlugins` / `getBackgroundPlugins` responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginList {
    pub plugins: Vec<String>,
}

/// Payload of `isMethodSupported` responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSupport {
    #[serde(rename = "isSupported")]
    pub is_supported: bool,
}

/// Error body the dispatcher reports for failed `execute` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub name: String,
}

impl From<&ExaminerError> for ErrorBody {
    fn from(e: &ExaminerError) -> Self {
        Self {
            message: e.to_string(),
            name: e.kind().to_string(),
        }
    }
}

/// Bootstrap request sent over the insecure channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignCertificateRequest {
    pub method: String,
    pub csr: String,
    pub destination: String,
    pub medium: i64,
}

impl SignCertificateRequest {
    pub fn new(csr: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            method: SIGN_CERTIFICATE_METHOD.to_string(),
            csr: csr.into(),
            destination: destination.into(),
            medium: MEDIUM,
        }
    }
}

/// Desktop answer to [`SignCertificateRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignCertificateResponse {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}
