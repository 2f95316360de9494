//! Connection parameters announced to the desktop at dial time.

use url::Url;

use crate::config::ExaminerConfig;
use crate::error::{ExaminerError, ExaminerResult};
use crate::messages::{MEDIUM, SDK_VERSION};

/// Identity metadata sent as query parameters on every dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub host: String,
    pub os: String,
    pub device: String,
    /// Empty until the desktop assigns one during certificate signing.
    pub device_id: String,
    pub app: String,
    pub sdk_version: String,
    pub medium: String,
}

impl ConnectionParameters {
    pub fn for_device(config: &ExaminerConfig, device_id: impl Into<String>) -> Self {
        Self {
            host: config.host.clone(),
            os: config.os_name.clone(),
            device: config.device_name.clone(),
            device_id: device_id.into(),
            app: config.app_name.clone(),
            sdk_version: SDK_VERSION.to_string(),
            medium: MEDIUM.to_string(),
        }
    }

    /// Build `scheme://host:port/?os=..&device=..&device_id=..&app=..&sdk_version=..&medium=..`.
    pub fn url(&self, scheme: &str, port: u16) -> ExaminerResult<Url> {
        let mut url = Url::parse(&format!("{scheme}://{}:{port}/", self.host))
            .map_err(|e| ExaminerError::Config(format!("invalid host {:?}: {e}", self.host)))?;
        url.query_pairs_mut()
            .append_pair("os", &self.os)
            .append_pair("device", &self.device)
            .append_pair("device_id", &self.device_id)
            .append_pair("app", &self.app)
            .append_pair("sdk_version", &self.sdk_version)
            .append_pair("medium", &self.medium);
        Ok(url)
    }
}
