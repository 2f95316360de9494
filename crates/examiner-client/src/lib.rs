//! examiner-client: outbound role of the examiner inspector engine.
//!
//! Dials the desktop inspector, bootstraps trust over an unauthenticated
//! channel (certificate signing), then keeps one mutually authenticated
//! WebSocket channel alive and feeds its messages to the plugin dispatcher.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use examiner_client::ExaminerClient;
//! use examiner_core::ExaminerConfig;
//!
//! # async fn example(plugin: Arc<dyn examiner_core::Plugin>) -> examiner_core::ExaminerResult<()> {
//! let client = ExaminerClient::new(ExaminerConfig::load(None)?);
//! client.add_plugin(plugin);
//! client.start()?;
//!
//! let reason = client.wait_stopped().await;
//! println!("engine stopped: {reason:?}");
//! # Ok(())
//! # }
//! ```

pub mod certificate;
pub mod client;
pub mod manager;
pub mod tls;
pub mod transport;

// Re-export primary public types.
pub use certificate::{CertificateAuthority, DeviceIdentity, FileCertificateAuthority};
pub use client::ExaminerClient;
pub use manager::{ConnectionManager, ConnectionPhase, ConnectionState, StopReason};
pub use transport::{Transport, TransportFactory, WebSocketChannel, WebSocketTransportFactory};

// Re-export examiner-core error types for convenience.
pub use examiner_core::{ExaminerError, ExaminerResult};
