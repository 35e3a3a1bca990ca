use std::sync::Arc;

use async_trait::async_trait;
use signal_core::Descriptor;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Open,
    Frame(String),
    Closed,
}

/// Outgoing half of an open link. Shared with whoever sends app messages
/// while the transport itself keeps delivering events.
pub trait FrameSink: Send + Sync {
    /// `false` when the link is not open; the frame is dropped.
    fn send_frame(&self, frame: String) -> bool;

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// One side of a direct peer link: produces and applies connection
/// descriptors, then carries text frames.
#[async_trait]
pub trait PeerTransport: Send {
    async fn create_offer(&mut self) -> Result<Descriptor, TransportError>;

    async fn accept_offer(&mut self, offer: &Descriptor) -> Result<Descriptor, TransportError>;

    async fn accept_answer(&mut self, answer: &Descriptor) -> Result<(), TransportError>;

    /// Next link event, `None` once the transport is gone. Must be
    /// cancel-safe: callers race it against timers.
    async fn next_event(&mut self) -> Option<LinkEvent>;

    fn sink(&self) -> Arc<dyn FrameSink>;

    fn close(&mut self);
}
