use thiserror::Error;
use zajel_crypto::CryptoError;

/// Errors surfaced by the P2P transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The key announced on the data channel differs from the relay key.
    /// Fatal to the session.
    #[error("handshake key mismatch for peer {peer}: possible man-in-the-middle")]
    HandshakeKeyMismatch { peer: String },

    /// The relay matched a pair with a different key than it announced in
    /// the pair request. The pairing is refused.
    #[error("relay changed the key of {peer} between pair request and match")]
    PairKeyMismatch { peer: String },

    /// Receiver reported a corrupted chunk. Retried until the budget runs out.
    #[error("chunk {chunk_index} of {file_id} failed hash verification")]
    ChunkHashMismatch { file_id: String, chunk_index: u32 },

    /// Send buffer did not drain in time. Fails the transfer, not the session.
    #[error("send buffer did not drain within {timeout_ms} ms")]
    BufferStall { timeout_ms: u64 },

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("data channel closed")]
    ChannelClosed,

    #[error("session closed")]
    SessionClosed,

    /// The session exists but the handshake has not been verified yet.
    #[error("session with {0} is not ready")]
    NotReady(String),

    #[error("transfer {file_id} rejected: {reason}")]
    TransferRejected { file_id: String, reason: String },

    #[error("too many concurrent transfers (limit {limit})")]
    TooManyTransfers { limit: usize },

    #[error("chunk retries exhausted for {file_id}")]
    RetriesExhausted { file_id: String },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
}

impl TransportError {
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::NegotiationFailed(msg.to_string())
    }

    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }
}

impl From<zajel_common::Error> for TransportError {
    fn from(err: zajel_common::Error) -> Self {
        match err {
            zajel_common::Error::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
