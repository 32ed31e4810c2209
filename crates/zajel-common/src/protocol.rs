//! Wire protocol for the relay (signaling) and the peer data channels.
//!
//! Both protocols are JSON objects discriminated by a `type` field, with
//! camelCase field names. Unknown `type` values fail to decode; callers
//! log and drop them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Single size limit applied to relay frames, data-channel frames and
/// decoded payloads.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Label of the data channel carrying the handshake and text messages.
pub const MESSAGE_CHANNEL_LABEL: &str = "messages";
/// Label of the data channel carrying file-transfer traffic.
pub const FILE_CHANNEL_LABEL: &str = "files";

pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

/// ICE candidate as exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Messages exchanged with the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Announce our pairing code and public key to the relay.
    Register {
        pairing_code: String,
        public_key: String,
    },
    Registered {
        #[serde(default)]
        pairing_code: Option<String>,
    },
    PairRequest {
        target_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proposed_name: Option<String>,
    },
    PairIncoming {
        from_code: String,
        from_public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proposed_name: Option<String>,
    },
    PairResponse {
        target_code: String,
        accept: bool,
    },
    /// Both sides accepted. Carries the key later checked against the
    /// data-channel handshake.
    PairMatched {
        peer_code: String,
        peer_public_key: String,
        #[serde(default)]
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
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: String,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: String,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default)]
        sdp_m_line_index: Option<u16>,
    },
    Ping,
    Pong,
    Error {
        message: String,
    },
}

impl SignalMessage {
    pub fn offer(target: &str, sdp: String) -> Self {
        Self::Offer {
            target: Some(target.to_string()),
            from: None,
            sdp,
        }
    }

    pub fn answer(target: &str, sdp: String) -> Self {
        Self::Answer {
            target: Some(target.to_string()),
            from: None,
            sdp,
        }
    }

    pub fn ice_candidate(target: &str, candidate: IceCandidate) -> Self {
        Self::IceCandidate {
            target: Some(target.to_string()),
            from: None,
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_m_line_index: candidate.sdp_m_line_index,
        }
    }

    /// Peer code a relay-forwarded negotiation message came from.
    pub fn source_peer(&self) -> Option<&str> {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::IceCandidate { from, .. } => {
                from.as_deref()
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::PairRequest { .. } => "pair_request",
            Self::PairIncoming { .. } => "pair_incoming",
            Self::PairResponse { .. } => "pair_response",
            Self::PairMatched { .. } => "pair_matched",
            Self::PairRejected { .. } => "pair_rejected",
            Self::PairTimeout { .. } => "pair_timeout",
            Self::PairError { .. } => "pair_error",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<String> {
        encode_limited(self)
    }

    pub fn decode(text: &str) -> Result<Self> {
        decode_limited(text)
    }
}

/// Per-chunk acknowledgment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Received,
    /// Hash or length check failed; the sender should retry.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Timeout,
    Cancelled,
    Stall,
    RetriesExhausted,
    SessionClosed,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Stall => "stall",
            Self::RetriesExhausted => "retries_exhausted",
            Self::SessionClosed => "session_closed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Messages carried over the peer data channels.
///
/// `handshake` and `message` travel as cleartext JSON on the `messages`
/// channel (`message` wraps its own ciphertext). Every other variant is
/// serialized, encrypted as a whole, and sent as a base64 frame on the
/// `files` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChannelMessage {
    /// Identity key plus this connection's random session nonce.
    Handshake {
        public_key: String,
        session_nonce: String,
    },
    Message {
        ciphertext: String,
    },
    FileStart {
        file_id: String,
        file_name: String,
        total_size: u64,
        total_chunks: u32,
        #[serde(default = "default_chunk_size")]
        chunk_size: u32,
        /// Positional SHA-256 hex digests, one per chunk.
        chunk_hashes: Vec<String>,
    },
    FileChunk {
        file_id: String,
        chunk_index: u32,
        /// Base64 of the plaintext chunk.
        data: String,
    },
    FileComplete {
        file_id: String,
        file_hash: String,
    },
    FileStartAck {
        file_id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ChunkAck {
        file_id: String,
        chunk_index: u32,
        status: ChunkStatus,
    },
    ChunkRetry {
        file_id: String,
        chunk_indices: Vec<u32>,
    },
    FileCompleteAck {
        file_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missing_chunks: Option<Vec<u32>>,
    },
    TransferCancel {
        file_id: String,
        reason: CancelReason,
    },
}

impl ChannelMessage {
    /// True for the variants sent unencrypted on the `messages` channel.
    pub fn is_cleartext(&self) -> bool {
        matches!(self, Self::Handshake { .. } | Self::Message { .. })
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            Self::Handshake { .. } | Self::Message { .. } => None,
            Self::FileStart { file_id, .. }
            | Self::FileChunk { file_id, .. }
            | Self::FileComplete { file_id, .. }
            | Self::FileStartAck { file_id, .. }
            | Self::ChunkAck { file_id, .. }
            | Self::ChunkRetry { file_id, .. }
            | Self::FileCompleteAck { file_id, .. }
            | Self::TransferCancel { file_id, .. } => Some(file_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Message { .. } => "message",
            Self::FileStart { .. } => "file_start",
            Self::FileChunk { .. } => "file_chunk",
            Self::FileComplete { .. } => "file_complete",
            Self::FileStartAck { .. } => "file_start_ack",
            Self::ChunkAck { .. } => "chunk_ack",
            Self::ChunkRetry { .. } => "chunk_retry",
            Self::FileCompleteAck { .. } => "file_complete_ack",
            Self::TransferCancel { .. } => "transfer_cancel",
        }
    }

    pub fn encode(&self) -> Result<String> {
        encode_limited(self)
    }

    pub fn decode(text: &str) -> Result<Self> {
        decode_limited(text)
    }
}

fn encode_limited<T: Serialize>(value: &T) -> Result<String> {
    let text = serde_json::to_string(value)?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(Error::protocol(format!(
            "encoded message of {} bytes exceeds limit of {} bytes",
            text.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(text)
}

fn decode_limited<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(Error::protocol(format!(
            "message of {} bytes exceeds limit of {} bytes",
            text.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signal_register_uses_camel_case() {
        let msg = SignalMessage::Register {
            pairing_code: "ABC234".into(),
            public_key: "cHVi".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "register", "pairingCode": "ABC234", "publicKey": "cHVi"})
        );
    }

    #[test]
    fn signal_ice_candidate_field_names() {
        let msg = SignalMessage::ice_candidate(
            "PEER22",
            IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        );
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "ice_candidate");
        assert_eq!(value["target"], "PEER22");
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("from").is_none());
    }

    #[test]
    fn signal_inbound_offer_exposes_source() {
        let raw = r#"{"type":"offer","from":"XYZ789","sdp":"v=0"}"#;
        let msg = SignalMessage::decode(raw).unwrap();
        assert_eq!(msg.source_peer(), Some("XYZ789"));
        assert_eq!(msg.kind(), "offer");
    }

    #[test]
    fn signal_ping_is_bare_type() {
        assert_eq!(SignalMessage::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(SignalMessage::decode(r#"{"type":"pong"}"#).unwrap(), SignalMessage::Pong);
    }

    #[test]
    fn signal_unknown_type_is_rejected() {
        assert!(SignalMessage::decode(r#"{"type":"call_offer","sdp":"x"}"#).is_err());
    }

    #[test]
    fn pair_matched_defaults_initiator_flag() {
        let raw = r#"{"type":"pair_matched","peerCode":"ABCDEF","peerPublicKey":"a2V5"}"#;
        match SignalMessage::decode(raw).unwrap() {
            SignalMessage::PairMatched { is_initiator, .. } => assert!(!is_initiator),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn file_start_defaults_chunk_size() {
        let raw = r#"{"type":"file_start","fileId":"f1","fileName":"a.txt","totalSize":5,"totalChunks":1,"chunkHashes":["00"]}"#;
        match ChannelMessage::decode(raw).unwrap() {
            ChannelMessage::FileStart { chunk_size, .. } => assert_eq!(chunk_size, DEFAULT_CHUNK_SIZE),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn handshake_wire_names() {
        let msg = ChannelMessage::Handshake {
            public_key: "cHVi".into(),
            session_nonce: "bm9uY2U=".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "handshake", "publicKey": "cHVi", "sessionNonce": "bm9uY2U="})
        );
    }

    #[test]
    fn complete_ack_omits_missing_when_none() {
        let msg = ChannelMessage::FileCompleteAck {
            file_id: "f1".into(),
            success: true,
            missing_chunks: None,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "file_complete_ack", "fileId": "f1", "success": true}));

        let raw = r#"{"type":"file_complete_ack","fileId":"f1","success":false,"missingChunks":[2,5]}"#;
        match ChannelMessage::decode(raw).unwrap() {
            ChannelMessage::FileCompleteAck { missing_chunks, .. } => {
                assert_eq!(missing_chunks, Some(vec![2, 5]))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cancel_reason_tolerates_unknown_values() {
        let raw = r#"{"type":"transfer_cancel","fileId":"f1","reason":"disk_full"}"#;
        match ChannelMessage::decode(raw).unwrap() {
            ChannelMessage::TransferCancel { reason, .. } => assert_eq!(reason, CancelReason::Unknown),
            other => panic!("unexpected {other:?}"),
        }
        let raw = r#"{"type":"transfer_cancel","fileId":"f1","reason":"timeout"}"#;
        assert!(matches!(
            ChannelMessage::decode(raw).unwrap(),
            ChannelMessage::TransferCancel { reason: CancelReason::Timeout, .. }
        ));
    }

    #[test]
    fn cleartext_classification() {
        assert!(ChannelMessage::Handshake {
            public_key: "k".into(),
            session_nonce: "n".into(),
        }
        .is_cleartext());
        assert!(ChannelMessage::Message { ciphertext: "c".into() }.is_cleartext());
        let ack = ChannelMessage::ChunkAck {
            file_id: "f".into(),
            chunk_index: 0,
            status: ChunkStatus::Received,
        };
        assert!(!ack.is_cleartext());
        assert_eq!(ack.file_id(), Some("f"));
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let msg = ChannelMessage::Message {
            ciphertext: "A".repeat(MAX_MESSAGE_SIZE),
        };
        assert!(msg.encode().is_err());
        let raw = format!(r#"{{"type":"message","ciphertext":"{}"}}"#, "A".repeat(MAX_MESSAGE_SIZE));
        assert!(ChannelMessage::decode(&raw).is_err());
    }

    #[test]
    fn max_file_start_fits_message_limit() {
        let hashes = vec!["a".repeat(64); 10_000];
        let msg = ChannelMessage::FileStart {
            file_id: "0f8fad5b-d9cb-469f-a165-70867728950e".into(),
            file_name: "archive.tar".into(),
            total_size: 100 * 1024 * 1024,
            total_chunks: 10_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_hashes: hashes,
        };
        assert!(msg.encode().is_ok());
    }
}
