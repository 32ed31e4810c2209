use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::time::Instant;
use tracing::warn;

use zajel_common::config::TransferConfig;
use zajel_common::file_transfer::{
    chunk_count, expected_chunk_len, is_sha256_hex, sanitize_filename, sha256_bytes_hex, sha256_file_hex,
    unique_destination_path,
};

use crate::error::{Result, TransportError};

/// Why an incoming `file_start` was refused. Sent as the ack `reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooLarge,
    TooManyChunks,
    InvalidOffer,
    Busy,
    Duplicate,
    Storage,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooLarge => "too_large",
            Self::TooManyChunks => "too_many_chunks",
            Self::InvalidOffer => "invalid_offer",
            Self::Busy => "busy",
            Self::Duplicate => "duplicate",
            Self::Storage => "storage_error",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared shape of an incoming file, as read from `file_start`.
#[derive(Debug, Clone)]
pub(crate) struct IncomingOffer {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub chunk_hashes: Vec<String>,
}

impl IncomingOffer {
    pub fn validate(&self, config: &TransferConfig) -> std::result::Result<String, RejectReason> {
        if self.total_size > config.max_file_size {
            return Err(RejectReason::TooLarge);
        }
        if self.total_chunks > config.max_chunks {
            return Err(RejectReason::TooManyChunks);
        }
        if self.file_id.is_empty() || self.total_size == 0 || self.chunk_size == 0 {
            return Err(RejectReason::InvalidOffer);
        }
        // Chunks above the local chunk size could not fit one frame.
        if self.chunk_size > config.chunk_size.max(zajel_common::DEFAULT_CHUNK_SIZE) {
            return Err(RejectReason::InvalidOffer);
        }
        match chunk_count(self.total_size, self.chunk_size) {
            Ok(expected) if expected == self.total_chunks => {}
            _ => return Err(RejectReason::InvalidOffer),
        }
        if self.chunk_hashes.len() != self.total_chunks as usize
            || !self.chunk_hashes.iter().all(|h| is_sha256_hex(h))
        {
            return Err(RejectReason::InvalidOffer);
        }
        sanitize_filename(&self.file_name).ok_or(RejectReason::InvalidOffer)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkWrite {
    Stored,
    Duplicate,
}

/// Receiver-side staging of one file in a `.part` file next to its final
/// destination.
pub(crate) struct IncomingTransfer {
    pub offer: IncomingOffer,
    part_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    received: Vec<bool>,
    received_count: u32,
    received_bytes: u64,
    pub last_activity: Instant,
}

impl IncomingTransfer {
    pub fn create(
        output_dir: &Path,
        offer: IncomingOffer,
        sanitized: String,
        now: Instant,
    ) -> Result<Self> {
        fs::create_dir_all(output_dir)?;
        let final_path = output_dir.join(&sanitized);
        let part_path = output_dir.join(format!(".{sanitized}.{}.part", short_id(&offer.file_id)));

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&part_path)?;
        file.set_len(offer.total_size)?;

        let received = vec![false; offer.total_chunks as usize];
        Ok(Self {
            offer,
            part_path,
            final_path,
            file: Some(file),
            received,
            received_count: 0,
            received_bytes: 0,
            last_activity: now,
        })
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(idx, _)| idx as u32)
            .collect()
    }

    /// Verify and store one chunk. A hash or length mismatch is reported
    /// as `ChunkHashMismatch` and nothing is written.
    pub fn write_chunk(&mut self, chunk_index: u32, payload: &[u8], now: Instant) -> Result<ChunkWrite> {
        self.last_activity = now;
        if chunk_index >= self.offer.total_chunks {
            return Err(TransportError::protocol(format!(
                "chunk index {} out of range for {} chunks",
                chunk_index, self.offer.total_chunks
            )));
        }

        let idx = chunk_index as usize;
        if self.received[idx] {
            return Ok(ChunkWrite::Duplicate);
        }

        let expected_len = expected_chunk_len(self.offer.total_size, self.offer.chunk_size, chunk_index)?;
        if payload.len() != expected_len
            || !sha256_bytes_hex(payload).eq_ignore_ascii_case(&self.offer.chunk_hashes[idx])
        {
            return Err(TransportError::ChunkHashMismatch {
                file_id: self.offer.file_id.clone(),
                chunk_index,
            });
        }

        let offset = (chunk_index as u64) * (self.offer.chunk_size as u64);
        let file = self.file.as_mut().ok_or(TransportError::SessionClosed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(payload)?;

        self.received[idx] = true;
        self.received_count += 1;
        self.received_bytes += payload.len() as u64;
        Ok(ChunkWrite::Stored)
    }

    /// Check the whole-file hash and move the file into place. The `.part`
    /// file is removed on failure.
    pub fn finalize(mut self, expected_hash: &str) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }

        let checksum = sha256_file_hex(&self.part_path)?;
        if !checksum.eq_ignore_ascii_case(expected_hash) {
            self.remove_part();
            return Err(TransportError::protocol(format!(
                "checksum mismatch for {}: expected {}, got {}",
                self.offer.file_name, expected_hash, checksum
            )));
        }

        let destination = unique_destination_path(&self.final_path);
        if let Err(e) = fs::rename(&self.part_path, &destination) {
            self.remove_part();
            return Err(e.into());
        }
        Ok(destination)
    }

    pub fn abort(mut self) {
        self.file.take();
        self.remove_part();
    }

    fn remove_part(&self) {
        if self.part_path.exists() {
            if let Err(e) = fs::remove_file(&self.part_path) {
                warn!("failed to remove {}: {}", self.part_path.display(), e);
            }
        }
    }
}

fn short_id(file_id: &str) -> String {
    file_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("zajel-incoming-{name}-{unique}"));
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn offer_for(data: &[u8], chunk_size: u32) -> IncomingOffer {
        IncomingOffer {
            file_id: "0f9e8d7c-0000-4000-8000-000000000001".into(),
            file_name: "report.pdf".into(),
            total_size: data.len() as u64,
            total_chunks: chunk_count(data.len() as u64, chunk_size).unwrap(),
            chunk_size,
            chunk_hashes: data.chunks(chunk_size as usize).map(sha256_bytes_hex).collect(),
        }
    }

    #[test]
    fn offer_validation_reasons() {
        let config = TransferConfig::default();
        let data = vec![7u8; 40_000];
        let good = offer_for(&data, 16_384);
        assert_eq!(good.validate(&config).unwrap(), "report.pdf");

        let mut big = good.clone();
        big.total_size = config.max_file_size + 1;
        assert_eq!(big.validate(&config), Err(RejectReason::TooLarge));

        let mut many = good.clone();
        many.total_chunks = config.max_chunks + 1;
        assert_eq!(many.validate(&config), Err(RejectReason::TooManyChunks));

        let mut wrong_count = good.clone();
        wrong_count.total_chunks = 2;
        assert_eq!(wrong_count.validate(&config), Err(RejectReason::InvalidOffer));

        let mut short_hashes = good.clone();
        short_hashes.chunk_hashes.pop();
        assert_eq!(short_hashes.validate(&config), Err(RejectReason::InvalidOffer));

        let mut dotdot = good.clone();
        dotdot.file_name = "..".into();
        assert_eq!(dotdot.validate(&config), Err(RejectReason::InvalidOffer));
    }

    #[test]
    fn stores_chunks_and_finalizes() {
        let dir = temp_dir("finalize");
        let data = (0..40_000u32).map(|v| (v % 251) as u8).collect::<Vec<_>>();
        let offer = offer_for(&data, 16_384);
        let mut incoming = IncomingTransfer::create(&dir, offer, "report.pdf".into(), Instant::now()).unwrap();

        for (i, chunk) in data.chunks(16_384).enumerate().rev() {
            assert_eq!(
                incoming.write_chunk(i as u32, chunk, Instant::now()).unwrap(),
                ChunkWrite::Stored
            );
        }
        assert_eq!(
            incoming.write_chunk(0, &data[..16_384], Instant::now()).unwrap(),
            ChunkWrite::Duplicate
        );
        assert!(incoming.missing_chunks().is_empty());

        let part = incoming.part_path().to_path_buf();
        let path = incoming.finalize(&sha256_bytes_hex(&data)).unwrap();
        assert_eq!(path, dir.join("report.pdf"));
        assert_eq!(fs::read(&path).unwrap(), data);
        assert!(!part.exists());
    }

    #[test]
    fn corrupted_chunk_is_not_stored() {
        let dir = temp_dir("corrupt");
        let data = vec![1u8; 20_000];
        let offer = offer_for(&data, 16_384);
        let mut incoming = IncomingTransfer::create(&dir, offer, "report.pdf".into(), Instant::now()).unwrap();

        let mut bad = data[..16_384].to_vec();
        bad[5] ^= 0xFF;
        assert!(matches!(
            incoming.write_chunk(0, &bad, Instant::now()),
            Err(TransportError::ChunkHashMismatch { chunk_index: 0, .. })
        ));
        assert!(matches!(
            incoming.write_chunk(1, &data[..10], Instant::now()),
            Err(TransportError::ChunkHashMismatch { chunk_index: 1, .. })
        ));
        assert_eq!(incoming.missing_chunks(), vec![0, 1]);
    }

    #[test]
    fn wrong_file_hash_removes_part() {
        let dir = temp_dir("badhash");
        let data = vec![9u8; 100];
        let offer = offer_for(&data, 16_384);
        let mut incoming = IncomingTransfer::create(&dir, offer, "report.pdf".into(), Instant::now()).unwrap();
        incoming.write_chunk(0, &data, Instant::now()).unwrap();
        let part = incoming.part_path().to_path_buf();
        assert!(incoming.finalize(&sha256_bytes_hex(b"other")).is_err());
        assert!(!part.exists());
        assert!(!dir.join("report.pdf").exists());
    }
}
