//! Capabilities the transport consumes from the negotiated connection.
//!
//! The WebRTC stack is reached only through these traits. Every callback a
//! connection registers is tagged with the [`Generation`] it was created
//! for and reported as an [`RtcEvent`] on the peer's event queue; the
//! negotiator drops events whose generation is no longer current.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use zajel_common::IceCandidate;

use crate::error::Result;

/// Token minted each time negotiation (re)starts for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Which side sends the SDP offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Ordered, reliable, message-oriented channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, data: Bytes) -> Result<()>;

    /// Bytes queued locally and not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Resolves once `buffered_amount` is below `threshold`.
    async fn wait_buffered_below(&self, threshold: usize);

    async fn close(&self);
}

pub type ChannelHandle = Arc<dyn DataChannel>;

/// One connection attempt with one peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create and apply the local offer; returns its SDP.
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer, then create and apply the answer; returns its SDP.
    async fn accept_offer(&self, sdp: String) -> Result<String>;

    async fn set_remote_answer(&self, sdp: String) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection whose callbacks all report to `events` tagged
    /// with `generation`. An initiator creates the data channels itself;
    /// a responder announces them when the remote side opens them.
    async fn create(
        &self,
        generation: Generation,
        role: Role,
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

#[derive(Debug)]
pub struct RtcEvent {
    pub generation: Generation,
    pub kind: RtcEventKind,
}

pub enum RtcEventKind {
    LocalCandidate(IceCandidate),
    ChannelOpen(ChannelHandle),
    Frame { label: String, data: Bytes },
    ConnectionFailed(String),
    Disconnected,
}

impl fmt::Debug for RtcEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(&c.candidate).finish(),
            Self::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            Self::Frame { label, data } => f
                .debug_struct("Frame")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
            Self::ConnectionFailed(reason) => f.debug_tuple("ConnectionFailed").field(reason).finish(),
            Self::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Report an event; a closed queue means the peer is gone, which is fine.
pub(crate) fn emit(events: &mpsc::UnboundedSender<RtcEvent>, generation: Generation, kind: RtcEventKind) {
    let _ = events.send(RtcEvent { generation, kind });
}
