//! Common helper functions for Zajel.

use rand::Rng;

/// Character set for relay pairing codes (no 0/O, 1/I).
pub const PAIRING_CODE_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const PAIRING_CODE_LENGTH: usize = 6;

/// Performs a constant-time comparison of two byte slices.
///
/// Every byte pair is visited and the differences are OR-accumulated, so
/// the running time depends only on the length. Differing lengths return
/// false immediately; lengths are public (a key is always 32 bytes).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Read a non-empty, trimmed environment variable.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read an unsigned integer environment variable.
///
/// Returns `Err` with the raw value when it is set but does not parse.
pub fn env_u64(name: &str) -> Result<Option<u64>, String> {
    match env_string(name) {
        Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| raw),
        None => Ok(None),
    }
}

/// Generate a random 6-character pairing code.
pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LENGTH)
        .map(|_| PAIRING_CODE_CHARS[rng.gen_range(0..PAIRING_CODE_CHARS.len())] as char)
        .collect()
}

pub fn is_valid_pairing_code(code: &str) -> bool {
    code.len() == PAIRING_CODE_LENGTH && code.bytes().all(|b| PAIRING_CODE_CHARS.contains(&b))
}
