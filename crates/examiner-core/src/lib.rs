//! examiner-core: protocol and dispatch core of the examiner inspector engine.
//!
//! Provides the JSON wire envelopes and codec, the transport abstractions
//! shared by the outbound and server roles, configuration, and the plugin
//! side of the protocol: registry, per-plugin connections and the message
//! dispatcher.

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod messages;
pub mod params;
pub mod plugin;
pub mod registry;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode_envelope, decode_json, encode_json};
pub use config::ExaminerConfig;
pub use connection::{PluginConnection, Responder};
pub use dispatcher::Dispatcher;
pub use error::{ExaminerError, ExaminerResult};
pub use messages::{Inbound, MEDIUM, SDK_VERSION};
pub use params::ConnectionParameters;
pub use plugin::Plugin;
pub use registry::PluginRegistry;
pub use transport::{
    ChannelEvent, ChannelEvents, ChannelRole, ChannelTag, MessageHandler, MessageSink,
    TaggedEvent,
};
