use thiserror::Error;

/// Errors produced by the examiner protocol layer.
#[derive(Debug, Error)]
pub enum ExaminerError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("method not found: {api}.{method}")]
    MethodNotFound { api: String, method: String },

    #[error("params for {method} do not match the declared type: {reason}")]
    ParamsMismatch { method: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ExaminerError {
    /// Short machine-readable name, used as `name` in wire error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Codec(_) => "CodecError",
            Self::InvalidMessage(_) => "InvalidMessage",
            Self::PluginNotFound(_) => "PluginNotFound",
            Self::MethodNotFound { .. } => "MethodNotFound",
            Self::ParamsMismatch { .. } => "ParamsMismatch",
            Self::Transport(_) => "TransportError",
            Self::Certificate(_) => "CertificateError",
            Self::Config(_) => "ConfigError",
            Self::ChannelClosed => "ChannelClosed",
            Self::Io(_) => "IoError",
            Self::Other(_) => "Error",
        }
    }
}

impl From<serde_json::Error> for ExaminerError {
    fn from(e: serde_json::Error) -> Self {
        ExaminerError::Codec(e.to_string())
    }
}

pub type ExaminerResult<T> = Result<T, ExaminerError>;
