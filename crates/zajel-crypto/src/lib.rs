//! Cryptographic primitives for Zajel.
//!
//! This crate provides:
//! - X25519 identity keys, fingerprints, peer ids and safety numbers
//! - Per-peer ChaCha20-Poly1305 sessions keyed by X25519 + HKDF-SHA256
//! - A fixed-size sliding replay window
//!
//! # Design
//!
//! Nonces are random and carried in each frame, so frames decrypt in any
//! order. Ordering and replay are handled by the 4-byte sequence number
//! inside the authenticated payload, checked against a [`ReplayWindow`].

#![forbid(unsafe_code)]

pub mod identity;
pub mod replay_window;
pub mod session;

pub use identity::{fingerprint, peer_id, safety_number, KeyPair, PeerPublicKey};
pub use replay_window::{ReplayWindow, WINDOW_SIZE};
pub use session::{ChannelKind, CryptoError, CryptoSession, SessionStats, SESSION_NONCE_LEN};
