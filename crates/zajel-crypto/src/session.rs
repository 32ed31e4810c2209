//! Per-peer encrypted session.
//!
//! Built from an X25519 exchange between the local keypair and the key the
//! peer announced through the relay. Each connection contributes fresh
//! randomness: both sides announce a 32-byte session nonce in their
//! handshake, and the traffic key is HKDF-SHA256 over the shared secret
//! with the two nonces (sorted, concatenated) as salt and info
//! `zajel_session`. A session is unusable until the peer's nonce is bound,
//! and [`CryptoSession::renew`] discards the traffic key together with the
//! counters, so a sequence number is never used twice under one key.
//!
//! # Wire Format
//!
//! ```text
//! [12 bytes: random nonce] [AEAD( 4 bytes seq (BE) || plaintext )] [16 bytes: tag]
//! ```
//!
//! Sequence numbers start at 1 and are tracked per channel: text messages
//! and file traffic each have their own send counter and receive window, so
//! gaps on one channel never disturb the other.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};
use zajel_common::helpers::constant_time_eq;
use zeroize::Zeroizing;

use crate::identity::{KeyPair, PeerPublicKey};
use crate::replay_window::ReplayWindow;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SEQ_LEN: usize = 4;
pub const HKDF_INFO: &[u8] = b"zajel_session";
pub const SESSION_NONCE_LEN: usize = 32;

/// Session encryption errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// AEAD tag mismatch. Fatal to the message, not the session.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Fatal to the message, not the session.
    #[error("replay detected on {channel} channel: sequence {seq}")]
    ReplayDetected { channel: ChannelKind, seq: u32 },

    #[error("send counter exhausted on {0} channel; session must be re-established")]
    CounterExhausted(ChannelKind),

    #[error("ciphertext truncated: {0} bytes")]
    Truncated(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("invalid ciphertext encoding: {0}")]
    Encoding(String),

    #[error("invalid session nonce: {0}")]
    InvalidNonce(String),

    /// The peer's session nonce has not been bound yet.
    #[error("session not keyed: handshake incomplete")]
    NotKeyed,

    /// A traffic key is already bound for this connection.
    #[error("session already keyed for this connection")]
    AlreadyKeyed,
}

/// Which logical channel a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Text,
    Binary,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Text => f.write_str("text"),
            ChannelKind::Binary => f.write_str("binary"),
        }
    }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_out: u64,
    pub messages_in: u64,
    pub replays_rejected: u64,
    pub auth_failures: u64,
}

#[derive(Debug, Default)]
struct ChannelState {
    /// Last sequence number used; the next send uses `sent + 1`.
    sent: u32,
    window: ReplayWindow,
}

/// Encrypted session with one peer.
///
/// Secrets are zeroized when the session is dropped.
pub struct CryptoSession {
    peer_id: String,
    peer_public_key: PeerPublicKey,
    shared: Zeroizing<[u8; 32]>,
    local_nonce: [u8; SESSION_NONCE_LEN],
    /// `None` until [`CryptoSession::bind_peer_nonce`].
    key: Option<Zeroizing<[u8; 32]>>,
    text: ChannelState,
    binary: ChannelState,
    stats: SessionStats,
}

impl CryptoSession {
    /// Derive a session with `peer_id` from its base64 X25519 public key.
    ///
    /// The session holds the ECDH secret and a fresh local nonce; traffic
    /// keys exist only after [`CryptoSession::bind_peer_nonce`].
    ///
    /// # Errors
    /// `InvalidKey` if the key is not 32 bytes of valid base64, or if the
    /// exchange is non-contributory (low-order point).
    pub fn establish(
        local: &KeyPair,
        peer_id: impl Into<String>,
        peer_public_key_b64: &str,
    ) -> Result<Self, CryptoError> {
        let peer_id = peer_id.into();
        let peer_public_key = PeerPublicKey::from_base64(peer_public_key_b64)?;

        let shared = local.diffie_hellman(&peer_public_key);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "key exchange produced a non-contributory secret".into(),
            ));
        }

        info!(
            peer = %peer_id,
            peer_key = %peer_public_key.peer_id(),
            "crypto session established"
        );

        Ok(Self {
            peer_id,
            peer_public_key,
            shared: Zeroizing::new(*shared.as_bytes()),
            local_nonce: fresh_nonce(),
            key: None,
            text: ChannelState::default(),
            binary: ChannelState::default(),
            stats: SessionStats::default(),
        })
    }

    /// This side's session nonce, as sent in the handshake.
    pub fn local_nonce_base64(&self) -> String {
        STANDARD.encode(self.local_nonce)
    }

    /// True once a traffic key is bound.
    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    /// Derive the traffic key from both session nonces.
    ///
    /// # Errors
    /// `InvalidNonce` if the nonce is not 32 bytes of base64 or equals our
    /// own; `AlreadyKeyed` if a key is already bound, since binding again
    /// would restart the counters under the same key.
    pub fn bind_peer_nonce(&mut self, peer_nonce_b64: &str) -> Result<(), CryptoError> {
        if self.key.is_some() {
            return Err(CryptoError::AlreadyKeyed);
        }
        let decoded = STANDARD
            .decode(peer_nonce_b64.trim())
            .map_err(|e| CryptoError::InvalidNonce(e.to_string()))?;
        let peer_nonce: [u8; SESSION_NONCE_LEN] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| CryptoError::InvalidNonce(format!("expected 32 bytes, got {}", v.len())))?;
        if peer_nonce == self.local_nonce {
            return Err(CryptoError::InvalidNonce("peer reflected our nonce".into()));
        }

        let (low, high) = if self.local_nonce < peer_nonce {
            (&self.local_nonce, &peer_nonce)
        } else {
            (&peer_nonce, &self.local_nonce)
        };
        let mut salt = [0u8; 2 * SESSION_NONCE_LEN];
        salt[..SESSION_NONCE_LEN].copy_from_slice(low);
        salt[SESSION_NONCE_LEN..].copy_from_slice(high);

        let hk = Hkdf::<Sha256>::new(Some(&salt[..]), &self.shared[..]);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(HKDF_INFO, key.as_mut())
            .map_err(|e| CryptoError::InvalidKey(format!("hkdf expand failed: {e}")))?;

        self.key = Some(key);
        self.text = ChannelState::default();
        self.binary = ChannelState::default();
        debug!(peer = %self.peer_id, "traffic key bound");
        Ok(())
    }

    /// Drop the traffic key, counters and windows and pick a new local
    /// nonce, ready for the next connection. Stats are kept.
    pub fn renew(&mut self) {
        self.key = None;
        self.local_nonce = fresh_nonce();
        self.text = ChannelState::default();
        self.binary = ChannelState::default();
        debug!(peer = %self.peer_id, "crypto session renewed");
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The key received out of band via the relay.
    pub fn peer_public_key(&self) -> &PeerPublicKey {
        &self.peer_public_key
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Encrypt `plaintext` on `channel`.
    ///
    /// Returns `nonce || ciphertext || tag`.
    ///
    /// # Errors
    /// `CounterExhausted` once the channel has used sequence `u32::MAX`;
    /// the counter never wraps.
    pub fn encrypt(&mut self, channel: ChannelKind, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher()?;
        let state = self.channel_mut(channel);
        if state.sent == u32::MAX {
            return Err(CryptoError::CounterExhausted(channel));
        }
        state.sent += 1;
        let seq = state.sent;

        let mut body = Vec::with_capacity(SEQ_LEN + plaintext.len());
        body.extend_from_slice(&seq.to_be_bytes());
        body.extend_from_slice(plaintext);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, body.as_slice())
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        self.stats.messages_out += 1;
        Ok(out)
    }

    /// Decrypt a frame produced by [`CryptoSession::encrypt`] on `channel`.
    ///
    /// The replay window is only updated after the tag verifies, so forged
    /// frames cannot advance it.
    pub fn decrypt(&mut self, channel: ChannelKind, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher()?;
        if frame.len() < NONCE_LEN + TAG_LEN + SEQ_LEN {
            self.stats.auth_failures += 1;
            return Err(CryptoError::Truncated(frame.len()));
        }
        let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let body = match cipher.decrypt(nonce, ciphertext) {
            Ok(body) => Zeroizing::new(body),
            Err(_) => {
                self.stats.auth_failures += 1;
                warn!(peer = %self.peer_id, %channel, security = true, "AEAD authentication failed");
                return Err(CryptoError::AuthenticationFailed);
            }
        };

        let mut seq_bytes = [0u8; SEQ_LEN];
        seq_bytes.copy_from_slice(&body[..SEQ_LEN]);
        let seq = u32::from_be_bytes(seq_bytes);

        if !self.channel_mut(channel).window.accept(seq) {
            self.stats.replays_rejected += 1;
            warn!(peer = %self.peer_id, %channel, seq, security = true, "replayed message rejected");
            return Err(CryptoError::ReplayDetected { channel, seq });
        }

        self.stats.messages_in += 1;
        debug!(peer = %self.peer_id, %channel, seq, "decrypted");
        Ok(body[SEQ_LEN..].to_vec())
    }

    /// Encrypt a text message to base64 (text channel).
    pub fn encrypt_text(&mut self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(STANDARD.encode(self.encrypt(ChannelKind::Text, plaintext.as_bytes())?))
    }

    pub fn decrypt_text(&mut self, ciphertext_b64: &str) -> Result<String, CryptoError> {
        let frame = STANDARD
            .decode(ciphertext_b64.trim())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let plaintext = self.decrypt(ChannelKind::Text, &frame)?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Constant-time comparison of the key announced on the data channel
    /// with the key received through the relay.
    ///
    /// Any decoding failure counts as a mismatch.
    pub fn verify_handshake_key(&self, received_key_b64: &str) -> bool {
        match STANDARD.decode(received_key_b64.trim()) {
            Ok(received) => constant_time_eq(self.peer_public_key.as_bytes(), &received),
            Err(_) => false,
        }
    }

    /// Fingerprint of the peer's key for out-of-band verification.
    pub fn peer_fingerprint(&self) -> String {
        self.peer_public_key.fingerprint()
    }

    /// True once either channel can no longer send.
    pub fn needs_rekey(&self) -> bool {
        self.text.sent == u32::MAX || self.binary.sent == u32::MAX
    }

    /// Sequence number the next send on `channel` will use, if any.
    pub fn next_send_seq(&self, channel: ChannelKind) -> Option<u32> {
        self.channel(channel).sent.checked_add(1)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, CryptoError> {
        let key = self.key.as_ref().ok_or(CryptoError::NotKeyed)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
    }

    fn channel(&self, channel: ChannelKind) -> &ChannelState {
        match channel {
            ChannelKind::Text => &self.text,
            ChannelKind::Binary => &self.binary,
        }
    }

    fn channel_mut(&mut self, channel: ChannelKind) -> &mut ChannelState {
        match channel {
            ChannelKind::Text => &mut self.text,
            ChannelKind::Binary => &mut self.binary,
        }
    }

    /// Move the send counter forward to `sent`; never backwards.
    #[doc(hidden)]
    pub fn fast_forward_send_counter(&mut self, channel: ChannelKind, sent: u32) {
        let state = self.channel_mut(channel);
        state.sent = state.sent.max(sent);
    }
}

fn fresh_nonce() -> [u8; SESSION_NONCE_LEN] {
    let mut nonce = [0u8; SESSION_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("peer_id", &self.peer_id)
            .field("peer_public_key", &self.peer_public_key)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(a: &mut CryptoSession, b: &mut CryptoSession) {
        let (na, nb) = (a.local_nonce_base64(), b.local_nonce_base64());
        a.bind_peer_nonce(&nb).unwrap();
        b.bind_peer_nonce(&na).unwrap();
    }

    fn create_session_pair() -> (CryptoSession, CryptoSession) {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut a = CryptoSession::establish(&alice, "bob", &bob.public_key_base64()).unwrap();
        let mut b = CryptoSession::establish(&bob, "alice", &alice.public_key_base64()).unwrap();
        bind(&mut a, &mut b);
        (a, b)
    }

    fn seq_of(session: &CryptoSession, frame: &[u8]) -> u32 {
        let body = session
            .cipher()
            .unwrap()
            .decrypt(Nonce::from_slice(&frame[..NONCE_LEN]), &frame[NONCE_LEN..])
            .unwrap();
        u32::from_be_bytes(body[..4].try_into().unwrap())
    }

    #[test]
    fn test_encrypted_session() {
        let (mut alice, mut bob) = create_session_pair();

        let ct = alice.encrypt(ChannelKind::Text, b"hello from alice").unwrap();
        assert_eq!(bob.decrypt(ChannelKind::Text, &ct).unwrap(), b"hello from alice");

        let ct = bob.encrypt(ChannelKind::Binary, b"hello from bob").unwrap();
        assert_eq!(alice.decrypt(ChannelKind::Binary, &ct).unwrap(), b"hello from bob");
    }

    #[test]
    fn test_frame_layout() {
        let (mut alice, _bob) = create_session_pair();
        let ct = alice.encrypt(ChannelKind::Text, b"abc").unwrap();
        assert_eq!(ct.len(), NONCE_LEN + SEQ_LEN + 3 + TAG_LEN);
        let ct2 = alice.encrypt(ChannelKind::Text, b"abc").unwrap();
        // fresh random nonce each time
        assert_ne!(ct[..NONCE_LEN], ct2[..NONCE_LEN]);
    }

    #[test]
    fn test_sequence_numbers_start_at_one_and_increase() {
        let (mut alice, _bob) = create_session_pair();
        let seqs: Vec<u32> = (0..5)
            .map(|_| {
                let ct = alice.encrypt(ChannelKind::Text, b"m").unwrap();
                seq_of(&alice, &ct)
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_replay_protection() {
        let (mut alice, mut bob) = create_session_pair();

        let ct = alice.encrypt(ChannelKind::Text, b"important message").unwrap();
        bob.decrypt(ChannelKind::Text, &ct).unwrap();

        let result = bob.decrypt(ChannelKind::Text, &ct);
        assert!(matches!(
            result,
            Err(CryptoError::ReplayDetected { channel: ChannelKind::Text, seq: 1 })
        ));
        assert_eq!(bob.stats().replays_rejected, 1);

        // session keeps working
        let ct = alice.encrypt(ChannelKind::Text, b"next").unwrap();
        assert_eq!(bob.decrypt(ChannelKind::Text, &ct).unwrap(), b"next");
    }

    #[test]
    fn test_channels_have_independent_windows() {
        let (mut alice, mut bob) = create_session_pair();

        // 100 binary frames, then one text frame: both seq streams start at 1
        for _ in 0..100 {
            let ct = alice.encrypt(ChannelKind::Binary, b"chunk").unwrap();
            bob.decrypt(ChannelKind::Binary, &ct).unwrap();
        }
        let text = alice.encrypt(ChannelKind::Text, b"hi").unwrap();
        assert_eq!(seq_of(&bob, &text), 1);
        assert_eq!(bob.decrypt(ChannelKind::Text, &text).unwrap(), b"hi");
    }

    #[test]
    fn test_tampered_frame_fails_authentication() {
        let (mut alice, mut bob) = create_session_pair();
        let mut ct = alice.encrypt(ChannelKind::Text, b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(
            bob.decrypt(ChannelKind::Text, &ct),
            Err(CryptoError::AuthenticationFailed)
        ));
        assert_eq!(bob.stats().auth_failures, 1);

        // window untouched by the forgery: the genuine seq 2 still accepted
        let ct = alice.encrypt(ChannelKind::Text, b"payload").unwrap();
        assert!(bob.decrypt(ChannelKind::Text, &ct).is_ok());
    }

    #[test]
    fn test_wrong_channel_is_independent_window() {
        let (mut alice, mut bob) = create_session_pair();
        let ct = alice.encrypt(ChannelKind::Text, b"x").unwrap();
        bob.decrypt(ChannelKind::Text, &ct).unwrap();
        // same frame, other window: not a replay there
        assert!(bob.decrypt(ChannelKind::Binary, &ct).is_ok());
    }

    #[test]
    fn test_truncated_frame() {
        let (_alice, mut bob) = create_session_pair();
        assert!(matches!(
            bob.decrypt(ChannelKind::Text, &[0u8; 20]),
            Err(CryptoError::Truncated(20))
        ));
    }

    #[test]
    fn test_counter_exhaustion_forces_rekey() {
        let (mut alice, mut bob) = create_session_pair();
        alice.fast_forward_send_counter(ChannelKind::Text, u32::MAX - 1);

        let ct = alice.encrypt(ChannelKind::Text, b"last").unwrap();
        assert_eq!(seq_of(&bob, &ct), u32::MAX);
        assert_eq!(bob.decrypt(ChannelKind::Text, &ct).unwrap(), b"last");

        assert!(alice.needs_rekey());
        assert_eq!(alice.next_send_seq(ChannelKind::Text), None);
        assert!(matches!(
            alice.encrypt(ChannelKind::Text, b"wrap?"),
            Err(CryptoError::CounterExhausted(ChannelKind::Text))
        ));
        // binary channel unaffected
        assert!(alice.encrypt(ChannelKind::Binary, b"ok").is_ok());
    }

    #[test]
    fn test_text_helpers() {
        let (mut alice, mut bob) = create_session_pair();
        let ct = alice.encrypt_text("مرحبا").unwrap();
        assert_eq!(bob.decrypt_text(&ct).unwrap(), "مرحبا");
        assert!(matches!(bob.decrypt_text("%%%"), Err(CryptoError::Encoding(_))));
    }

    #[test]
    fn test_verify_handshake_key() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mallory = KeyPair::generate();
        let session = CryptoSession::establish(&alice, "bob", &bob.public_key_base64()).unwrap();

        assert!(session.verify_handshake_key(&bob.public_key_base64()));
        assert!(!session.verify_handshake_key(&mallory.public_key_base64()));
        assert!(!session.verify_handshake_key("garbage"));
        assert!(!session.verify_handshake_key(""));
    }

    #[test]
    fn test_rejects_low_order_key() {
        let alice = KeyPair::generate();
        let zero = STANDARD.encode([0u8; 32]);
        assert!(matches!(
            CryptoSession::establish(&alice, "evil", &zero),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_unkeyed_session_refuses_traffic() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut session = CryptoSession::establish(&alice, "bob", &bob.public_key_base64()).unwrap();
        assert!(!session.is_keyed());
        assert!(matches!(session.encrypt(ChannelKind::Text, b"x"), Err(CryptoError::NotKeyed)));
        assert!(matches!(session.decrypt(ChannelKind::Text, &[0u8; 64]), Err(CryptoError::NotKeyed)));
    }

    #[test]
    fn test_bind_rejects_bad_and_repeated_nonces() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut session = CryptoSession::establish(&alice, "bob", &bob.public_key_base64()).unwrap();

        assert!(matches!(session.bind_peer_nonce("%%%"), Err(CryptoError::InvalidNonce(_))));
        let short = STANDARD.encode([7u8; 16]);
        assert!(matches!(session.bind_peer_nonce(&short), Err(CryptoError::InvalidNonce(_))));
        let own = session.local_nonce_base64();
        assert!(matches!(session.bind_peer_nonce(&own), Err(CryptoError::InvalidNonce(_))));

        let peer = STANDARD.encode([9u8; 32]);
        session.bind_peer_nonce(&peer).unwrap();
        assert!(matches!(session.bind_peer_nonce(&peer), Err(CryptoError::AlreadyKeyed)));
    }

    #[test]
    fn test_renew_discards_key_and_counters() {
        let (mut alice, mut bob) = create_session_pair();
        let old = alice.encrypt(ChannelKind::Text, b"old").unwrap();
        bob.decrypt(ChannelKind::Text, &old).unwrap();
        let old_nonce = alice.local_nonce_base64();

        alice.renew();
        bob.renew();
        assert!(!alice.is_keyed());
        assert_ne!(alice.local_nonce_base64(), old_nonce);
        bind(&mut alice, &mut bob);

        let ct = alice.encrypt(ChannelKind::Text, b"new").unwrap();
        assert_eq!(seq_of(&alice, &ct), 1);
        assert_eq!(bob.decrypt(ChannelKind::Text, &ct).unwrap(), b"new");
        assert!(matches!(
            bob.decrypt(ChannelKind::Text, &old),
            Err(CryptoError::AuthenticationFailed)
        ));
        assert_eq!(bob.stats().messages_in, 2);
    }

    #[test]
    fn test_fast_forward_never_moves_back() {
        let (mut alice, _bob) = create_session_pair();
        alice.fast_forward_send_counter(ChannelKind::Binary, 10);
        alice.fast_forward_send_counter(ChannelKind::Binary, 3);
        assert_eq!(alice.next_send_seq(ChannelKind::Binary), Some(11));
    }

    #[test]
    fn test_different_pairs_do_not_interoperate() {
        let (mut alice, _bob) = create_session_pair();
        let (_carol, mut dave) = create_session_pair();
        let ct = alice.encrypt(ChannelKind::Text, b"secret").unwrap();
        assert!(matches!(
            dave.decrypt(ChannelKind::Text, &ct),
            Err(CryptoError::AuthenticationFailed)
        ));
    }
}
