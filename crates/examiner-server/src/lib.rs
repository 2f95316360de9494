//! examiner-server: server role of the examiner inspector engine.
//!
//! The desktop dials in over plain WebSocket; every accepted connection
//! speaks the same JSON protocol as the outbound role and is served by the
//! plugin dispatcher. There is no certificate bootstrap on this side.

pub mod manager;
pub mod server;

pub use manager::ServerConnectionManager;
pub use server::{
    ConnectionId, ConnectionState, FrameServer, ListenerState, ServerDelegate, MAX_MESSAGE_SIZE,
};

// Re-export examiner-core error types for convenience.
pub use examiner_core::{ExaminerError, ExaminerResult};
