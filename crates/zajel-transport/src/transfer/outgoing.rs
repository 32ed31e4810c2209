use std::collections::{HashMap, VecDeque};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::time::Instant;

use zajel_common::file_transfer::{chunk_count, sha256_bytes_hex};
use zajel_common::ChannelMessage;

use super::TransferState;
use crate::error::{Result, TransportError};

#[derive(Debug)]
pub(crate) struct ChunkRecord {
    pub hash: String,
    pub retries: u32,
    pub acked: bool,
}

/// Sender-side state of one file. Holds the file bytes until the receiver
/// confirms the whole file.
#[derive(Debug)]
pub(crate) struct OutgoingTransfer {
    pub file_id: String,
    pub file_name: String,
    data: Vec<u8>,
    chunk_size: u32,
    file_hash: String,
    chunks: Vec<ChunkRecord>,
    pub state: TransferState,
    next_unsent: u32,
    retransmit: VecDeque<u32>,
    /// Unacknowledged chunks on the wire and their ack deadlines.
    pub in_flight: HashMap<u32, Instant>,
    acked: u32,
    acked_bytes: u64,
    /// Deadline for `file_start_ack` or `file_complete_ack`.
    pub control_deadline: Option<Instant>,
    pub control_retries: u32,
    pub last_activity: Instant,
}

pub(crate) enum AckOutcome {
    Progress,
    AllAcked,
    Retry,
    Exhausted,
    Ignored,
}

impl OutgoingTransfer {
    pub fn new(file_id: String, file_name: String, data: Vec<u8>, chunk_size: u32, now: Instant) -> Result<Self> {
        let total = chunk_count(data.len() as u64, chunk_size)?;
        let chunks = data
            .chunks(chunk_size as usize)
            .map(|chunk| ChunkRecord {
                hash: sha256_bytes_hex(chunk),
                retries: 0,
                acked: false,
            })
            .collect::<Vec<_>>();
        debug_assert_eq!(chunks.len(), total as usize);
        let file_hash = sha256_bytes_hex(&data);

        Ok(Self {
            file_id,
            file_name,
            data,
            chunk_size,
            file_hash,
            chunks,
            state: TransferState::Pending,
            next_unsent: 0,
            retransmit: VecDeque::new(),
            in_flight: HashMap::new(),
            acked: 0,
            acked_bytes: 0,
            control_deadline: None,
            control_retries: 0,
            last_activity: now,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn acked_bytes(&self) -> u64 {
        self.acked_bytes
    }

    pub fn retries(&self, index: u32) -> u32 {
        self.chunks.get(index as usize).map(|c| c.retries).unwrap_or(0)
    }

    fn chunk_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size as u64;
        (self.data.len() as u64).saturating_sub(start).min(self.chunk_size as u64)
    }

    fn chunk_bytes(&self, index: u32) -> &[u8] {
        let start = index as usize * self.chunk_size as usize;
        let end = (start + self.chunk_size as usize).min(self.data.len());
        &self.data[start..end]
    }

    pub fn start_message(&self) -> ChannelMessage {
        ChannelMessage::FileStart {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            total_size: self.total_size(),
            total_chunks: self.total_chunks(),
            chunk_size: self.chunk_size,
            chunk_hashes: self.chunks.iter().map(|c| c.hash.clone()).collect(),
        }
    }

    pub fn chunk_message(&self, index: u32) -> ChannelMessage {
        ChannelMessage::FileChunk {
            file_id: self.file_id.clone(),
            chunk_index: index,
            data: STANDARD.encode(self.chunk_bytes(index)),
        }
    }

    pub fn complete_message(&self) -> ChannelMessage {
        ChannelMessage::FileComplete {
            file_id: self.file_id.clone(),
            file_hash: self.file_hash.clone(),
        }
    }

    /// Next chunk the window allows, retransmissions first. Does not
    /// consume it; call [`OutgoingTransfer::mark_sent`] once it is sent.
    pub fn next_chunk(&mut self, max_in_flight: usize) -> Option<u32> {
        if self.state != TransferState::Transferring || self.in_flight.len() >= max_in_flight {
            return None;
        }
        while let Some(&index) = self.retransmit.front() {
            if self.chunks[index as usize].acked || self.in_flight.contains_key(&index) {
                self.retransmit.pop_front();
                continue;
            }
            return Some(index);
        }
        while self.next_unsent < self.total_chunks() {
            let index = self.next_unsent;
            if self.chunks[index as usize].acked {
                self.next_unsent += 1;
                continue;
            }
            return Some(index);
        }
        None
    }

    pub fn mark_sent(&mut self, index: u32, deadline: Instant) {
        if self.retransmit.front() == Some(&index) {
            self.retransmit.pop_front();
        } else if self.next_unsent == index {
            self.next_unsent += 1;
        }
        self.in_flight.insert(index, deadline);
    }

    pub fn on_chunk_received(&mut self, index: u32, now: Instant) -> AckOutcome {
        let len = self.chunk_len(index);
        let Some(chunk) = self.chunks.get_mut(index as usize) else {
            return AckOutcome::Ignored;
        };
        self.in_flight.remove(&index);
        self.last_activity = now;
        if chunk.acked {
            return AckOutcome::Ignored;
        }
        chunk.acked = true;
        self.acked += 1;
        self.acked_bytes += len;
        if self.acked == self.total_chunks() {
            AckOutcome::AllAcked
        } else {
            AckOutcome::Progress
        }
    }

    /// Queue `index` for retransmission, spending one retry.
    pub fn requeue(&mut self, index: u32, max_retries: u32) -> AckOutcome {
        let len = self.chunk_len(index);
        let Some(chunk) = self.chunks.get_mut(index as usize) else {
            return AckOutcome::Ignored;
        };
        self.in_flight.remove(&index);
        if chunk.acked {
            chunk.acked = false;
            self.acked -= 1;
            self.acked_bytes -= len;
        }
        chunk.retries += 1;
        if chunk.retries > max_retries {
            return AckOutcome::Exhausted;
        }
        if !self.retransmit.contains(&index) {
            self.retransmit.push_back(index);
        }
        AckOutcome::Retry
    }

    /// Chunks whose ack deadline passed.
    pub fn expired(&self, now: Instant) -> Vec<u32> {
        let mut expired: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(index, _)| *index)
            .collect();
        expired.sort_unstable();
        expired
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.in_flight.values().min().copied()
    }

    pub fn validate_index(&self, index: u32) -> Result<()> {
        if index >= self.total_chunks() {
            return Err(TransportError::protocol(format!(
                "chunk index {index} out of range for {}",
                self.file_id
            )));
        }
        Ok(())
    }
}
