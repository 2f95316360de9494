//! Transport abstractions shared by the outbound and server roles.
//!
//! A transport channel is a message-framed duplex. It reports `Opened`,
//! `Message` and `Failed` events to exactly one listener, tagged with the
//! role and attempt of the channel instance that produced them, and accepts
//! outbound messages through a non-blocking [`MessageSink`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::codec::encode_json;
use crate::error::ExaminerResult;

/// Which leg of the trust bootstrap a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Unauthenticated channel used only for certificate signing.
    Insecure,
    /// Mutually authenticated channel carrying plugin traffic.
    Secure,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insecure => f.write_str("insecure"),
            Self::Secure => f.write_str("secure"),
        }
    }
}

/// Identity of one channel instance: its role plus a per-manager attempt
/// counter. Events from a replaced channel carry a stale tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelTag {
    pub role: ChannelRole,
    pub attempt: u32,
}

/// Event reported by a transport channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Message(Vec<u8>),
    Failed(String),
}

/// A channel event together with the tag of the channel that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub tag: ChannelTag,
    pub event: ChannelEvent,
}

/// Tagged event sender handed to a channel when it is opened.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tag: ChannelTag,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl ChannelEvents {
    pub fn new(tag: ChannelTag, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { tag, tx }
    }

    pub fn tag(&self) -> ChannelTag {
        self.tag
    }

    /// Deliver an event. Returns `false` once the listener is gone.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                tag: self.tag,
                event,
            })
            .is_ok()
    }

    pub fn opened(&self) -> bool {
        self.emit(ChannelEvent::Opened)
    }

    pub fn message(&self, data: Vec<u8>) -> bool {
        self.emit(ChannelEvent::Message(data))
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.emit(ChannelEvent::Failed(reason.into()))
    }
}

/// Write half of a transport channel.
///
/// `send` only enqueues; delivery errors surface later as a `Failed` event
/// or a closed connection, never by blocking the caller.
pub trait MessageSink: Send + Sync {
    fn send(&self, data: Vec<u8>) -> ExaminerResult<()>;
}

/// Serialize `value` as one JSON document and enqueue it on `sink`.
pub fn send_json<T: Serialize + ?Sized>(sink: &dyn MessageSink, value: &T) -> ExaminerResult<()> {
    let data = encode_json(value)?;
    sink.send(data)
}

/// Consumer of inbound protocol messages.
///
/// `channel` is the sink of the channel the message arrived on; everything
/// written in response goes back through it.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, data: &[u8], channel: Arc<dyn MessageSink>);
}
