use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const MAX_FILENAME_BYTES: usize = 255;

/// Reduce an untrusted file name to a safe basename.
///
/// Directory components are stripped, anything outside `[A-Za-z0-9._- ]`
/// becomes `_`, and names that end up empty, `.` or `..` are rejected.
pub fn sanitize_filename(input: &str) -> Option<String> {
    let trimmed = input.trim().replace('\0', "").replace('\\', "/");
    if trimmed.is_empty() {
        return None;
    }

    let base = Path::new(&trimmed).file_name()?.to_string_lossy().into_owned();
    let mut clean = String::with_capacity(base.len().min(MAX_FILENAME_BYTES));
    for ch in base.chars() {
        let safe = ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ' ');
        clean.push(if safe { ch } else { '_' });
        if clean.len() >= MAX_FILENAME_BYTES {
            break;
        }
    }
    let clean = clean.trim().trim_matches('.').to_string();
    if clean.is_empty() {
        return None;
    }
    Some(clean)
}

pub fn sha256_bytes_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn chunk_count(file_size: u64, chunk_size: u32) -> Result<u32> {
    if chunk_size == 0 {
        return Err(Error::protocol("chunk_size must be non-zero"));
    }
    let count = file_size.div_ceil(chunk_size as u64);
    if count == 0 {
        return Err(Error::protocol("file_size must be non-zero"));
    }
    u32::try_from(count).map_err(|_| Error::protocol("chunk count exceeds protocol limits"))
}

/// Byte length of chunk `chunk_index` in a file of `file_size` bytes.
pub fn expected_chunk_len(file_size: u64, chunk_size: u32, chunk_index: u32) -> Result<usize> {
    let offset = (chunk_index as u64)
        .checked_mul(chunk_size as u64)
        .ok_or_else(|| Error::protocol("chunk offset overflow"))?;
    if offset >= file_size {
        return Err(Error::protocol(format!(
            "chunk index {chunk_index} out of bounds"
        )));
    }
    let remaining = file_size - offset;
    Ok(remaining.min(chunk_size as u64) as usize)
}

/// `path`, or `stem (n).ext` for the first `n` that does not exist.
pub fn unique_destination_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    for n in 1..=9_999u32 {
        let candidate = if ext.is_empty() {
            path.with_file_name(format!("{stem} ({n})"))
        } else {
            path.with_file_name(format!("{stem} ({n}).{ext}"))
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("zajel-{name}-{unique}"));
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn sanitize_filename_rejects_path_traversal() {
        assert_eq!(
            sanitize_filename("../../../../etc/passwd"),
            Some("passwd".to_string())
        );
        assert_eq!(
            sanitize_filename("..\\..\\windows\\system.ini"),
            Some("system.ini".to_string())
        );
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("..."), None);
    }

    #[test]
    fn sanitize_filename_replaces_unsafe_chars() {
        assert_eq!(
            sanitize_filename("rep<o>rt:2024?.pdf"),
            Some("rep_o_rt_2024_.pdf".to_string())
        );
        assert_eq!(sanitize_filename("nul\0l.txt"), Some("null.txt".to_string()));
        let long = "a".repeat(1000);
        assert_eq!(sanitize_filename(&long).unwrap().len(), MAX_FILENAME_BYTES);
    }

    #[test]
    fn chunk_arithmetic() {
        assert_eq!(chunk_count(1, 16384).unwrap(), 1);
        assert_eq!(chunk_count(16384, 16384).unwrap(), 1);
        assert_eq!(chunk_count(16385, 16384).unwrap(), 2);
        assert!(chunk_count(0, 16384).is_err());
        assert!(chunk_count(10, 0).is_err());

        assert_eq!(expected_chunk_len(16385, 16384, 0).unwrap(), 16384);
        assert_eq!(expected_chunk_len(16385, 16384, 1).unwrap(), 1);
        assert!(expected_chunk_len(16385, 16384, 2).is_err());
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = temp_dir("hash");
        let path = dir.join("payload.bin");
        let payload = (0..40_000u32).map(|v| (v % 251) as u8).collect::<Vec<_>>();
        fs::write(&path, &payload).unwrap();
        assert_eq!(sha256_file_hex(&path).unwrap(), sha256_bytes_hex(&payload));
        assert!(is_sha256_hex(&sha256_bytes_hex(b"")));
        assert!(!is_sha256_hex("xyz"));
    }

    #[test]
    fn unique_destination_does_not_clobber() {
        let dir = temp_dir("unique");
        let path = dir.join("photo.jpg");
        assert_eq!(unique_destination_path(&path), path);
        fs::write(&path, b"1").unwrap();
        assert_eq!(unique_destination_path(&path), dir.join("photo (1).jpg"));
        fs::write(dir.join("photo (1).jpg"), b"2").unwrap();
        assert_eq!(unique_destination_path(&path), dir.join("photo (2).jpg"));
    }
}
