//! Secure peer-to-peer transport for Zajel.
//!
//! This crate provides:
//! - Relay signaling over WebSocket with reconnect and heartbeat
//! - Generation-tagged WebRTC negotiation of the `messages` and `files`
//!   data channels
//! - A key-confirming handshake followed by encrypted text messages
//! - Reliable chunked file transfer with acks, retries and backpressure
//!
//! # Design
//!
//! Each peer is owned by a single task; commands, connection callbacks,
//! relay messages and timers are all serialized through it. The
//! [`Transport`] facade only routes to those tasks.

#![forbid(unsafe_code)]

pub mod channel;
pub mod error;
pub mod event;
pub mod manager;
pub mod memory;
pub mod negotiator;
mod peer;
pub mod rtc;
pub mod signaling;
pub mod transfer;

pub use channel::{ChannelHandle, DataChannel, Generation, PeerConnection, PeerConnectionFactory, Role};
pub use error::{Result, TransportError};
pub use event::TransportEvent;
pub use manager::Transport;
pub use memory::MemoryNetwork;
pub use negotiator::{ConnectionNegotiator, ConnectionState};
pub use peer::PeerStats;
pub use rtc::WebRtcFactory;
pub use signaling::{validate_signaling_url, Registration, RelayClient, SignalRouter, Subscription};
pub use transfer::{ReliableTransferEngine, TransferDirection, TransferEvent, TransferLink, TransferState};
