//! X25519 identity keys and the identifiers derived from them.
//!
//! A peer's public key travels as standard base64 (32 bytes → 44
//! characters) through the relay and in the data-channel handshake.
//! Everything a user compares out of band is derived from it:
//!
//! - **fingerprint**: SHA-256 of the raw key, uppercase hex in groups of 4
//! - **peer id**: first 16 uppercase hex characters of the same digest
//! - **safety number**: 60 digits shared by both peers of a pair
//!
//! # Example
//!
//! ```
//! use zajel_crypto::identity::{safety_number, KeyPair};
//!
//! let alice = KeyPair::generate();
//! let bob = KeyPair::generate();
//!
//! let a = safety_number(&alice.public_key_bytes(), &bob.public_key_bytes());
//! let b = safety_number(&bob.public_key_bytes(), &alice.public_key_bytes());
//! assert_eq!(a, b);
//! assert_eq!(a.len(), 60);
//! ```

use std::fmt;
use std::fs;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use crate::session::CryptoError;

pub const PUBLIC_KEY_LEN: usize = 32;

/// A peer's X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerPublicKey([u8; PUBLIC_KEY_LEN]);

impl PeerPublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a base64 key, rejecting anything that is not exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))?;
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            CryptoError::InvalidKey(format!(
                "expected {PUBLIC_KEY_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }

    pub fn peer_id(&self) -> String {
        peer_id(&self.0)
    }
}

impl fmt::Display for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerPublicKey({})", self.peer_id())
    }
}

/// Local X25519 keypair. The secret is zeroized on drop.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey(self.public.to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    /// Stable id of this device (see [`peer_id`]).
    pub fn stable_id(&self) -> String {
        peer_id(self.public.as_bytes())
    }

    pub(crate) fn diffie_hellman(&self, peer: &PeerPublicKey) -> SharedSecret {
        self.secret.diffie_hellman(&PublicKey::from(peer.0))
    }

    /// Save the keypair: raw secret (0600 on Unix) and base64 public key.
    pub fn save(&self, private_path: &str, public_path: &str) -> Result<()> {
        let mut private_bytes = self.secret.to_bytes();
        let written = fs::write(private_path, private_bytes);
        private_bytes.zeroize();
        written.with_context(|| format!("failed to write {private_path}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(private_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(private_path, perms)?;
        }

        fs::write(public_path, format!("{}\n", self.public_key_base64()))
            .with_context(|| format!("failed to write {public_path}"))?;
        Ok(())
    }

    /// Load a keypair from a raw 32-byte secret key file.
    pub fn load(private_path: &str) -> Result<Self> {
        let mut bytes = fs::read(private_path).context("failed to read private key")?;

        if bytes.len() != 32 {
            bytes.zeroize();
            anyhow::bail!("invalid private key length: expected 32 bytes");
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);
        bytes.zeroize();

        let keypair = Self::from_secret_bytes(key_bytes);
        key_bytes.zeroize();
        Ok(keypair)
    }

    /// Load a base64 public key file written by [`KeyPair::save`].
    pub fn load_public(public_path: &str) -> Result<PeerPublicKey> {
        let text = fs::read_to_string(public_path).context("failed to read public key")?;
        Ok(PeerPublicKey::from_base64(&text)?)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// SHA-256 of a raw public key as uppercase hex, grouped by 4 characters.
///
/// Pure function for out-of-band comparison; stores nothing.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = hex::encode_upper(Sha256::digest(public_key));
    digest
        .as_bytes()
        .chunks(4)
        .map(|group| std::str::from_utf8(group).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}

/// First 16 uppercase hex characters of SHA-256(public key).
pub fn peer_id(public_key: &[u8]) -> String {
    let mut digest = hex::encode_upper(Sha256::digest(public_key));
    digest.truncate(16);
    digest
}

/// 60-digit number both peers derive from their two public keys.
///
/// Keys are sorted so argument order does not matter. The first 24 bytes
/// of SHA-256(low || high) form 12 big-endian u16 values, each reduced
/// mod 100000 and zero-padded to 5 digits.
pub fn safety_number(key_a: &[u8], key_b: &[u8]) -> String {
    let (low, high) = if key_a <= key_b {
        (key_a, key_b)
    } else {
        (key_b, key_a)
    };
    let mut hasher = Sha256::new();
    hasher.update(low);
    hasher.update(high);
    let digest = hasher.finalize();

    digest[..24]
        .chunks_exact(2)
        .map(|pair| {
            let value = ((u32::from(pair[0]) << 8) | u32::from(pair[1])) % 100_000;
            format!("{value:05}")
        })
        .collect()
}

/// Display form of a safety number: 12 groups of 5 digits.
pub fn format_safety_number(number: &str) -> String {
    number
        .as_bytes()
        .chunks(5)
        .map(|group| std::str::from_utf8(group).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key32(hex_str: &str) -> [u8; 32] {
        hex::decode(hex_str).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_rfc7748_diffie_hellman() {
        // RFC 7748 §6.1
        let alice =
            KeyPair::from_secret_bytes(key32("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a"));
        let bob =
            KeyPair::from_secret_bytes(key32("5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb"));
        assert_eq!(
            alice.public_key_bytes(),
            key32("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
        );
        assert_eq!(
            bob.public_key_bytes(),
            key32("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f")
        );

        let shared = alice.diffie_hellman(&bob.public_key());
        assert_eq!(
            shared.as_bytes(),
            &key32("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742")
        );
        assert_eq!(
            bob.diffie_hellman(&alice.public_key()).as_bytes(),
            shared.as_bytes()
        );
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let keypair = KeyPair::generate();
        let encoded = keypair.public_key_base64();
        assert_eq!(encoded.len(), 44);
        let parsed = PeerPublicKey::from_base64(&encoded).unwrap();
        assert_eq!(parsed, keypair.public_key());
    }

    #[test]
    fn test_public_key_rejects_wrong_length() {
        let short = STANDARD.encode([1u8; 31]);
        assert!(matches!(
            PeerPublicKey::from_base64(&short),
            Err(CryptoError::InvalidKey(_))
        ));
        let long = STANDARD.encode([1u8; 33]);
        assert!(PeerPublicKey::from_base64(&long).is_err());
        assert!(PeerPublicKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_peer_id_and_fingerprint_share_digest() {
        let keypair = KeyPair::generate();
        let id = keypair.stable_id();
        let fp = keypair.public_key().fingerprint();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        // 64 hex chars in 16 groups
        assert_eq!(fp.split(' ').count(), 16);
        assert_eq!(fp.replace(' ', "")[..16], id);
    }

    #[test]
    fn test_fingerprint_known_value() {
        // SHA-256 of 32 zero bytes
        let fp = fingerprint(&[0u8; 32]);
        assert!(fp.starts_with("66687AAD F862BD77"));
    }

    #[test]
    fn test_safety_number_symmetric_and_numeric() {
        let a = KeyPair::generate().public_key_bytes();
        let b = KeyPair::generate().public_key_bytes();
        let n1 = safety_number(&a, &b);
        let n2 = safety_number(&b, &a);
        assert_eq!(n1, n2);
        assert_eq!(n1.len(), 60);
        assert!(n1.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(format_safety_number(&n1).split(' ').count(), 12);
        assert_ne!(n1, safety_number(&a, &a));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("zajel-keys-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let private = dir.join("id.key");
        let public = dir.join("id.pub");

        let keypair = KeyPair::generate();
        keypair
            .save(private.to_str().unwrap(), public.to_str().unwrap())
            .unwrap();

        let loaded = KeyPair::load(private.to_str().unwrap()).unwrap();
        assert_eq!(loaded.public_key(), keypair.public_key());
        let public_only = KeyPair::load_public(public.to_str().unwrap()).unwrap();
        assert_eq!(public_only, keypair.public_key());
    }
}
