//! Event channel: push subscription plus connection lifecycle signals.

mod adapter;
mod transport;

pub use adapter::{ChannelAdapter, ConnectionHandle};
pub use transport::{
    decode_event, EventStream, EventTransport, NatsTransport, TestSession, TestTransport,
    TransportError, DEFAULT_SUBJECT_PREFIX,
};

/// Connection lifecycle as reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Connected,
    Dropped { reason: String },
    Reconnecting { attempt: u32 },
    /// A fresh subscription replaced a dropped one. Events may have been missed.
    Reconnected,
    /// Reconnect attempts exhausted.
    Disconnected,
    /// The initial subscription could not be established.
    Unavailable { reason: String },
}

impl ChannelSignal {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelSignal::Connected => "connected",
            ChannelSignal::Dropped { .. } => "dropped",
            ChannelSignal::Reconnecting { .. } => "reconnecting",
            ChannelSignal::Reconnected => "reconnected",
            ChannelSignal::Disconnected => "disconnected",
            ChannelSignal::Unavailable { .. } => "unavailable",
        }
    }
}
