use std::path::PathBuf;

use zajel_common::CancelReason;

use crate::channel::Generation;
use crate::error::TransportError;
use crate::transfer::TransferDirection;

/// Everything the transport reports to the application.
#[derive(Debug)]
pub enum TransportEvent {
    Registered {
        pairing_code: Option<String>,
    },
    PairIncoming {
        from_code: String,
        from_public_key: String,
        proposed_name: Option<String>,
    },
    PairMatched {
        peer_code: String,
        is_initiator: bool,
    },
    PairRejected {
        peer_code: String,
    },
    PairTimeout {
        peer_code: String,
    },
    PairError {
        error: String,
    },
    RelayError {
        message: String,
    },
    /// Connection state of a peer changed.
    StateChanged {
        peer: String,
        state: &'static str,
        generation: Option<Generation>,
    },
    /// The data-channel handshake matched the relay key; the session is
    /// ready for messages and files.
    Verified {
        peer: String,
        fingerprint: String,
    },
    /// The session was refused for a security reason and torn down.
    SecurityAlert {
        peer: String,
        error: TransportError,
    },
    Message {
        peer: String,
        text: String,
    },
    TransferOffered {
        peer: String,
        file_id: String,
        file_name: String,
        total_size: u64,
    },
    TransferProgress {
        peer: String,
        file_id: String,
        direction: TransferDirection,
        transferred: u64,
        total: u64,
    },
    TransferComplete {
        peer: String,
        file_id: String,
        direction: TransferDirection,
        file_name: String,
        path: Option<PathBuf>,
    },
    TransferFailed {
        peer: String,
        file_id: String,
        direction: TransferDirection,
        error: TransportError,
    },
    TransferCancelled {
        peer: String,
        file_id: String,
        direction: TransferDirection,
        reason: CancelReason,
    },
    SessionClosed {
        peer: String,
    },
}

impl TransportEvent {
    /// Peer the event concerns, if any.
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::StateChanged { peer, .. }
            | Self::Verified { peer, .. }
            | Self::SecurityAlert { peer, .. }
            | Self::Message { peer, .. }
            | Self::TransferOffered { peer, .. }
            | Self::TransferProgress { peer, .. }
            | Self::TransferComplete { peer, .. }
            | Self::TransferFailed { peer, .. }
            | Self::TransferCancelled { peer, .. }
            | Self::SessionClosed { peer } => Some(peer),
            Self::PairMatched { peer_code, .. }
            | Self::PairRejected { peer_code }
            | Self::PairTimeout { peer_code } => Some(peer_code),
            Self::PairIncoming { from_code, .. } => Some(from_code),
            Self::Registered { .. } | Self::PairError { .. } | Self::RelayError { .. } => None,
        }
    }
}
