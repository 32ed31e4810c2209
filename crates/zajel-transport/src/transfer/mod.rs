//! Reliable chunked file transfer over an encrypted message link.
//!
//! The engine is a plain state machine owned by the peer actor. It never
//! sleeps or spawns: the actor feeds it inbound messages, calls
//! [`ReliableTransferEngine::pump`] to push chunks while the link accepts
//! them, waits for [`ReliableTransferEngine::next_deadline`] and calls
//! [`ReliableTransferEngine::on_timer`] when it passes.

mod incoming;
mod outgoing;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use zajel_common::config::TransferConfig;
use zajel_common::file_transfer::{chunk_count, sanitize_filename};
use zajel_common::{CancelReason, ChannelMessage, ChunkStatus};

use crate::error::{Result, TransportError};
use incoming::{ChunkWrite, IncomingOffer, IncomingTransfer};
use outgoing::{AckOutcome, OutgoingTransfer};

pub use incoming::RejectReason;

/// Completed incoming ids remembered so a retransmitted `file_complete`
/// is answered again instead of ignored.
const RECENT_COMPLETED: usize = 64;

/// Encrypted, size-limited path to the remote engine.
#[async_trait]
pub trait TransferLink: Send {
    async fn send(&mut self, message: &ChannelMessage) -> Result<()>;

    /// Bytes queued on the underlying channel and not yet sent.
    async fn buffered_amount(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("receive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    AwaitingStartAck,
    Transferring,
    AwaitingCompleteAck,
    Complete,
    Failed(String),
    Cancelled(CancelReason),
}

#[derive(Debug)]
pub enum TransferEvent {
    /// A remote `file_start` was accepted.
    Offered {
        file_id: String,
        file_name: String,
        total_size: u64,
    },
    Progress {
        file_id: String,
        direction: TransferDirection,
        transferred: u64,
        total: u64,
    },
    Completed {
        file_id: String,
        direction: TransferDirection,
        file_name: String,
        /// Final location of a received file.
        path: Option<PathBuf>,
    },
    Failed {
        file_id: String,
        direction: TransferDirection,
        error: TransportError,
    },
    Cancelled {
        file_id: String,
        direction: TransferDirection,
        reason: CancelReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpResult {
    /// Nothing left that the windows allow.
    Idle,
    /// The link buffer is above its mark; wait for it to drain.
    Blocked,
}

/// Ack deadline for a chunk on its `retries`-th retransmission:
/// exponential backoff from the base timeout with up to 10% jitter, capped.
pub fn chunk_timeout(config: &TransferConfig, retries: u32) -> Duration {
    let backoff = config.chunk_timeout().saturating_mul(1u32 << retries.min(16));
    let jitter_cap = (backoff.as_millis() / 10).min(u64::MAX as u128) as u64;
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
    (backoff + jitter).min(config.max_chunk_timeout())
}

pub struct ReliableTransferEngine {
    config: TransferConfig,
    outgoing: HashMap<String, OutgoingTransfer>,
    /// Round-robin order of outgoing transfers for chunk dispatch.
    send_order: VecDeque<String>,
    incoming: HashMap<String, IncomingTransfer>,
    recently_completed: VecDeque<String>,
    stalled_since: Option<Instant>,
    events: Vec<TransferEvent>,
}

impl ReliableTransferEngine {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            outgoing: HashMap::new(),
            send_order: VecDeque::new(),
            incoming: HashMap::new(),
            recently_completed: VecDeque::new(),
            stalled_since: None,
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    pub fn has_active(&self) -> bool {
        !self.outgoing.is_empty() || !self.incoming.is_empty()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    pub fn state(&self, file_id: &str) -> Option<TransferState> {
        if let Some(t) = self.outgoing.get(file_id) {
            return Some(t.state.clone());
        }
        self.incoming.get(file_id).map(|_| TransferState::Transferring)
    }

    pub fn drain_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }

    /// Read `path` and offer it to the peer. Returns the new file id.
    pub async fn send_file(&mut self, link: &mut dyn TransferLink, path: &Path) -> Result<String> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() > self.config.max_file_size {
            return Err(TransportError::protocol(format!(
                "{} is {} bytes, limit is {}",
                path.display(),
                metadata.len(),
                self.config.max_file_size
            )));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransportError::protocol(format!("{} has no file name", path.display())))?
            .to_string();
        let data = tokio::fs::read(path).await?;
        self.send_bytes(link, &name, data).await
    }

    /// Offer an in-memory file to the peer. Returns the new file id.
    pub async fn send_bytes(&mut self, link: &mut dyn TransferLink, file_name: &str, data: Vec<u8>) -> Result<String> {
        if data.is_empty() {
            return Err(TransportError::protocol("cannot send an empty file"));
        }
        if data.len() as u64 > self.config.max_file_size {
            return Err(TransportError::protocol(format!(
                "file of {} bytes exceeds limit of {}",
                data.len(),
                self.config.max_file_size
            )));
        }
        let chunks = chunk_count(data.len() as u64, self.config.chunk_size)?;
        if chunks > self.config.max_chunks {
            return Err(TransportError::protocol(format!(
                "file needs {chunks} chunks, limit is {}",
                self.config.max_chunks
            )));
        }
        if self.outgoing.len() >= self.config.max_concurrent_transfers {
            return Err(TransportError::TooManyTransfers {
                limit: self.config.max_concurrent_transfers,
            });
        }
        let file_name = sanitize_filename(file_name)
            .ok_or_else(|| TransportError::protocol(format!("invalid file name: {file_name}")))?;

        let now = Instant::now();
        let file_id = uuid::Uuid::new_v4().to_string();
        let mut transfer = OutgoingTransfer::new(file_id.clone(), file_name, data, self.config.chunk_size, now)?;

        link.send(&transfer.start_message()).await?;
        transfer.state = TransferState::AwaitingStartAck;
        transfer.control_deadline = Some(now + chunk_timeout(&self.config, 0));

        info!(
            file_id = %file_id,
            file = %transfer.file_name,
            size = transfer.total_size(),
            chunks = transfer.total_chunks(),
            "offered file"
        );
        self.outgoing.insert(file_id.clone(), transfer);
        self.send_order.push_back(file_id.clone());
        Ok(file_id)
    }

    /// Send chunks until every window is full or the link is backed up.
    ///
    /// Sending stops once the link holds more than the high-water mark and
    /// resumes only after it falls below the low-water mark.
    pub async fn pump(&mut self, link: &mut dyn TransferLink) -> Result<PumpResult> {
        loop {
            let Some((file_id, index)) = self.next_sendable() else {
                return Ok(PumpResult::Idle);
            };

            let buffered = link.buffered_amount().await;
            let blocked = match self.stalled_since {
                Some(_) => buffered >= self.config.buffer_low_water,
                None => buffered > self.config.buffer_high_water,
            };
            let now = Instant::now();
            if blocked {
                if self.stalled_since.is_none() {
                    debug!(buffered, "send buffer above high water, pausing chunks");
                    self.stalled_since = Some(now);
                }
                return Ok(PumpResult::Blocked);
            }
            if self.stalled_since.take().is_some() {
                self.rearm_in_flight(now);
            }

            let Some(transfer) = self.outgoing.get_mut(&file_id) else {
                continue;
            };
            let message = transfer.chunk_message(index);
            let deadline = now + chunk_timeout(&self.config, transfer.retries(index));
            transfer.mark_sent(index, deadline);

            if let Err(e) = link.send(&message).await {
                warn!(file_id = %file_id, chunk = index, "chunk send failed: {}", e);
                self.fail_outgoing(&file_id, e);
            }
        }
    }

    /// The link drained below the low-water mark.
    pub fn on_drained(&mut self) {
        if self.stalled_since.take().is_some() {
            debug!("send buffer drained, resuming chunks");
            self.rearm_in_flight(Instant::now());
        }
    }

    /// Earliest instant at which [`ReliableTransferEngine::on_timer`] has
    /// work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut consider = |at: Instant| {
            earliest = Some(earliest.map_or(at, |e| e.min(at)));
        };

        match self.stalled_since {
            Some(since) => consider(since + self.config.buffer_stall_timeout()),
            None => self
                .outgoing
                .values()
                .filter_map(OutgoingTransfer::earliest_deadline)
                .for_each(&mut consider),
        }

        let idle = self.config.idle_timeout();
        for transfer in self.outgoing.values() {
            if let Some(at) = transfer.control_deadline {
                consider(at);
            }
            consider(transfer.last_activity + idle);
        }
        for transfer in self.incoming.values() {
            consider(transfer.last_activity + idle);
        }
        earliest
    }

    /// Handle every timeout due at `now`: buffer stall, chunk ack
    /// deadlines, control message deadlines and idle transfers.
    pub async fn on_timer(&mut self, link: &mut dyn TransferLink, now: Instant) {
        let max_retries = self.config.max_retries_per_chunk;
        let mut cancels: Vec<(String, CancelReason)> = Vec::new();

        if let Some(since) = self.stalled_since {
            if now >= since + self.config.buffer_stall_timeout() {
                warn!(
                    timeout_ms = self.config.buffer_stall_timeout_ms,
                    "send buffer stalled, failing active transfers"
                );
                self.stalled_since = None;
                let stalled: Vec<String> = self
                    .outgoing
                    .iter()
                    .filter(|(_, t)| t.state == TransferState::Transferring)
                    .map(|(id, _)| id.clone())
                    .collect();
                for file_id in stalled {
                    self.fail_outgoing(
                        &file_id,
                        TransportError::BufferStall {
                            timeout_ms: self.config.buffer_stall_timeout_ms,
                        },
                    );
                    cancels.push((file_id, CancelReason::Stall));
                }
            }
        } else {
            let expired: Vec<(String, Vec<u32>)> = self
                .outgoing
                .iter()
                .map(|(id, t)| (id.clone(), t.expired(now)))
                .filter(|(_, chunks)| !chunks.is_empty())
                .collect();
            for (file_id, chunks) in expired {
                if self.requeue_chunks(&file_id, &chunks, "ack timeout") {
                    self.fail_outgoing(&file_id, TransportError::RetriesExhausted { file_id: file_id.clone() });
                    cancels.push((file_id, CancelReason::RetriesExhausted));
                }
            }
        }

        let due: Vec<String> = self
            .outgoing
            .iter()
            .filter(|(_, t)| t.control_deadline.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for file_id in due {
            let Some(transfer) = self.outgoing.get_mut(&file_id) else {
                continue;
            };
            transfer.control_retries += 1;
            if transfer.control_retries > max_retries {
                self.fail_outgoing(&file_id, TransportError::RetriesExhausted { file_id: file_id.clone() });
                cancels.push((file_id, CancelReason::RetriesExhausted));
                continue;
            }
            let message = match transfer.state {
                TransferState::AwaitingStartAck => transfer.start_message(),
                TransferState::AwaitingCompleteAck => transfer.complete_message(),
                _ => {
                    transfer.control_deadline = None;
                    continue;
                }
            };
            transfer.control_deadline = Some(now + chunk_timeout(&self.config, transfer.control_retries));
            debug!(
                file_id = %file_id,
                attempt = transfer.control_retries,
                "resending {}",
                message.kind()
            );
            if let Err(e) = link.send(&message).await {
                warn!(file_id = %file_id, "control resend failed: {}", e);
            }
        }

        let idle = self.config.idle_timeout();
        let idle_out: Vec<String> = self
            .outgoing
            .iter()
            .filter(|(_, t)| t.last_activity + idle <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for file_id in idle_out {
            warn!(file_id = %file_id, "outgoing transfer idle, cancelling");
            self.remove_outgoing(&file_id);
            self.cancelled(file_id.clone(), TransferDirection::Send, CancelReason::Timeout);
            cancels.push((file_id, CancelReason::Timeout));
        }
        let idle_in: Vec<String> = self
            .incoming
            .iter()
            .filter(|(_, t)| t.last_activity + idle <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for file_id in idle_in {
            warn!(file_id = %file_id, "incoming transfer idle, cancelling");
            if let Some(transfer) = self.incoming.remove(&file_id) {
                transfer.abort();
            }
            self.cancelled(file_id.clone(), TransferDirection::Receive, CancelReason::Timeout);
            cancels.push((file_id, CancelReason::Timeout));
        }

        for (file_id, reason) in cancels {
            send_cancel(link, file_id, reason).await;
        }
    }

    /// Cancel a transfer in either direction and tell the peer.
    pub async fn cancel(&mut self, link: &mut dyn TransferLink, file_id: &str, reason: CancelReason) -> Result<()> {
        let direction = if self.remove_outgoing(file_id).is_some() {
            TransferDirection::Send
        } else if let Some(transfer) = self.incoming.remove(file_id) {
            transfer.abort();
            TransferDirection::Receive
        } else {
            return Err(TransportError::UnknownTransfer(file_id.to_string()));
        };
        info!(file_id = %file_id, %direction, %reason, "transfer cancelled");
        self.cancelled(file_id.to_string(), direction, reason);
        link.send(&ChannelMessage::TransferCancel {
            file_id: file_id.to_string(),
            reason,
        })
        .await
    }

    /// Drop every transfer without contacting the peer. Used on session
    /// teardown; partially received files are removed.
    pub fn shutdown(&mut self) {
        let outgoing: Vec<String> = self.outgoing.keys().cloned().collect();
        for file_id in outgoing {
            self.remove_outgoing(&file_id);
            self.cancelled(file_id, TransferDirection::Send, CancelReason::SessionClosed);
        }
        let incoming: Vec<(String, IncomingTransfer)> = self.incoming.drain().collect();
        for (file_id, transfer) in incoming {
            transfer.abort();
            self.cancelled(file_id, TransferDirection::Receive, CancelReason::SessionClosed);
        }
        self.stalled_since = None;
    }

    /// Apply one decrypted transfer message from the peer. Replies go out
    /// through `link`; only link failures are returned.
    pub async fn handle_message(&mut self, link: &mut dyn TransferLink, message: ChannelMessage) -> Result<()> {
        match message {
            ChannelMessage::FileStart {
                file_id,
                file_name,
                total_size,
                total_chunks,
                chunk_size,
                chunk_hashes,
            } => {
                let offer = IncomingOffer {
                    file_id,
                    file_name,
                    total_size,
                    total_chunks,
                    chunk_size,
                    chunk_hashes,
                };
                self.on_file_start(link, offer).await
            }
            ChannelMessage::FileChunk {
                file_id,
                chunk_index,
                data,
            } => self.on_file_chunk(link, file_id, chunk_index, &data).await,
            ChannelMessage::FileComplete { file_id, file_hash } => {
                self.on_file_complete(link, file_id, &file_hash).await
            }
            ChannelMessage::FileStartAck {
                file_id,
                accepted,
                reason,
            } => {
                self.on_start_ack(&file_id, accepted, reason);
                Ok(())
            }
            ChannelMessage::ChunkAck {
                file_id,
                chunk_index,
                status,
            } => self.on_chunk_ack(link, &file_id, chunk_index, status).await,
            ChannelMessage::ChunkRetry { file_id, chunk_indices } => {
                if self.outgoing.contains_key(&file_id) {
                    self.touch_outgoing(&file_id);
                    self.retransmit(link, &file_id, &chunk_indices, "retry requested").await;
                }
                Ok(())
            }
            ChannelMessage::FileCompleteAck {
                file_id,
                success,
                missing_chunks,
            } => {
                self.on_complete_ack(link, &file_id, success, missing_chunks).await;
                Ok(())
            }
            ChannelMessage::TransferCancel { file_id, reason } => {
                self.on_remote_cancel(&file_id, reason);
                Ok(())
            }
            other => {
                debug!("ignoring {} on transfer link", other.kind());
                Ok(())
            }
        }
    }

    async fn on_file_start(&mut self, link: &mut dyn TransferLink, offer: IncomingOffer) -> Result<()> {
        let file_id = offer.file_id.clone();
        let decision = if self.incoming.contains_key(&file_id) {
            // Our ack was lost and the sender retried.
            Ok(None)
        } else if self.recently_completed.contains(&file_id) {
            Err(RejectReason::Duplicate)
        } else if self.incoming.len() >= self.config.max_concurrent_transfers {
            Err(RejectReason::Busy)
        } else {
            offer.validate(&self.config).map(Some)
        };

        let reason = match decision {
            Ok(None) => None,
            Ok(Some(sanitized)) => {
                match IncomingTransfer::create(&self.config.receive_dir, offer.clone(), sanitized, Instant::now()) {
                    Ok(transfer) => {
                        info!(
                            file_id = %file_id,
                            file = %offer.file_name,
                            size = offer.total_size,
                            chunks = offer.total_chunks,
                            "accepted incoming file"
                        );
                        self.events.push(TransferEvent::Offered {
                            file_id: file_id.clone(),
                            file_name: offer.file_name.clone(),
                            total_size: offer.total_size,
                        });
                        self.incoming.insert(file_id.clone(), transfer);
                        None
                    }
                    Err(e) => {
                        warn!(file_id = %file_id, "cannot stage incoming file: {}", e);
                        Some(RejectReason::Storage)
                    }
                }
            }
            Err(reason) => {
                warn!(file_id = %file_id, file = %offer.file_name, %reason, "rejected incoming file");
                Some(reason)
            }
        };

        link.send(&ChannelMessage::FileStartAck {
            file_id,
            accepted: reason.is_none(),
            reason: reason.map(|r| r.as_str().to_string()),
        })
        .await
    }

    async fn on_file_chunk(
        &mut self,
        link: &mut dyn TransferLink,
        file_id: String,
        chunk_index: u32,
        data: &str,
    ) -> Result<()> {
        let Some(transfer) = self.incoming.get_mut(&file_id) else {
            debug!(file_id = %file_id, chunk = chunk_index, "chunk for unknown transfer");
            return Ok(());
        };

        let status = match STANDARD.decode(data) {
            Err(e) => {
                warn!(file_id = %file_id, chunk = chunk_index, "undecodable chunk: {}", e);
                transfer.last_activity = Instant::now();
                ChunkStatus::Failed
            }
            Ok(payload) => match transfer.write_chunk(chunk_index, &payload, Instant::now()) {
                Ok(ChunkWrite::Stored) => {
                    self.events.push(TransferEvent::Progress {
                        file_id: file_id.clone(),
                        direction: TransferDirection::Receive,
                        transferred: transfer.received_bytes(),
                        total: transfer.offer.total_size,
                    });
                    ChunkStatus::Received
                }
                Ok(ChunkWrite::Duplicate) => ChunkStatus::Received,
                Err(TransportError::ChunkHashMismatch { .. }) => {
                    warn!(file_id = %file_id, chunk = chunk_index, "chunk failed hash check");
                    ChunkStatus::Failed
                }
                Err(TransportError::Protocol(msg)) => {
                    warn!(file_id = %file_id, "dropping chunk: {}", msg);
                    return Ok(());
                }
                Err(e) => {
                    warn!(file_id = %file_id, "failed to store chunk: {}", e);
                    if let Some(transfer) = self.incoming.remove(&file_id) {
                        transfer.abort();
                    }
                    self.events.push(TransferEvent::Failed {
                        file_id: file_id.clone(),
                        direction: TransferDirection::Receive,
                        error: e,
                    });
                    return link
                        .send(&ChannelMessage::TransferCancel {
                            file_id,
                            reason: CancelReason::Cancelled,
                        })
                        .await;
                }
            },
        };

        link.send(&ChannelMessage::ChunkAck {
            file_id,
            chunk_index,
            status,
        })
        .await
    }

    async fn on_file_complete(&mut self, link: &mut dyn TransferLink, file_id: String, file_hash: &str) -> Result<()> {
        let Some(transfer) = self.incoming.get_mut(&file_id) else {
            if self.recently_completed.contains(&file_id) {
                return link
                    .send(&ChannelMessage::FileCompleteAck {
                        file_id,
                        success: true,
                        missing_chunks: None,
                    })
                    .await;
            }
            debug!(file_id = %file_id, "file_complete for unknown transfer");
            return Ok(());
        };

        transfer.last_activity = Instant::now();
        let missing = transfer.missing_chunks();
        if !missing.is_empty() {
            debug!(file_id = %file_id, missing = missing.len(), "file_complete with missing chunks");
            return link
                .send(&ChannelMessage::FileCompleteAck {
                    file_id,
                    success: false,
                    missing_chunks: Some(missing),
                })
                .await;
        }

        let Some(transfer) = self.incoming.remove(&file_id) else {
            return Ok(());
        };
        let file_name = transfer.offer.file_name.clone();
        let success = match transfer.finalize(file_hash) {
            Ok(path) => {
                info!(file_id = %file_id, path = %path.display(), "file received");
                self.remember_completed(file_id.clone());
                self.events.push(TransferEvent::Completed {
                    file_id: file_id.clone(),
                    direction: TransferDirection::Receive,
                    file_name,
                    path: Some(path),
                });
                true
            }
            Err(e) => {
                warn!(file_id = %file_id, "file verification failed: {}", e);
                self.events.push(TransferEvent::Failed {
                    file_id: file_id.clone(),
                    direction: TransferDirection::Receive,
                    error: e,
                });
                false
            }
        };

        link.send(&ChannelMessage::FileCompleteAck {
            file_id,
            success,
            missing_chunks: None,
        })
        .await
    }

    fn on_start_ack(&mut self, file_id: &str, accepted: bool, reason: Option<String>) {
        let Some(transfer) = self.outgoing.get_mut(file_id) else {
            return;
        };
        if transfer.state != TransferState::AwaitingStartAck {
            return;
        }
        transfer.last_activity = Instant::now();
        if accepted {
            debug!(file_id = %file_id, "file_start accepted");
            transfer.state = TransferState::Transferring;
            transfer.control_deadline = None;
            transfer.control_retries = 0;
        } else {
            let reason = reason.unwrap_or_else(|| "rejected".to_string());
            warn!(file_id = %file_id, %reason, "peer rejected file");
            self.fail_outgoing(
                file_id,
                TransportError::TransferRejected {
                    file_id: file_id.to_string(),
                    reason,
                },
            );
        }
    }

    async fn on_chunk_ack(
        &mut self,
        link: &mut dyn TransferLink,
        file_id: &str,
        chunk_index: u32,
        status: ChunkStatus,
    ) -> Result<()> {
        let Some(transfer) = self.outgoing.get_mut(file_id) else {
            return Ok(());
        };
        if let Err(e) = transfer.validate_index(chunk_index) {
            warn!(file_id = %file_id, "bad chunk_ack: {}", e);
            return Ok(());
        }

        let now = Instant::now();
        match status {
            ChunkStatus::Received => match transfer.on_chunk_received(chunk_index, now) {
                AckOutcome::Progress => {
                    self.events.push(TransferEvent::Progress {
                        file_id: file_id.to_string(),
                        direction: TransferDirection::Send,
                        transferred: transfer.acked_bytes(),
                        total: transfer.total_size(),
                    });
                }
                AckOutcome::AllAcked => {
                    self.events.push(TransferEvent::Progress {
                        file_id: file_id.to_string(),
                        direction: TransferDirection::Send,
                        transferred: transfer.total_size(),
                        total: transfer.total_size(),
                    });
                    transfer.state = TransferState::AwaitingCompleteAck;
                    transfer.control_retries = 0;
                    transfer.control_deadline = Some(now + chunk_timeout(&self.config, 0));
                    debug!(file_id = %file_id, "all chunks acknowledged");
                    let message = transfer.complete_message();
                    link.send(&message).await?;
                }
                _ => {}
            },
            ChunkStatus::Failed => {
                transfer.last_activity = now;
                if self.requeue_chunks(file_id, &[chunk_index], "receiver hash mismatch") {
                    self.fail_outgoing(
                        file_id,
                        TransportError::ChunkHashMismatch {
                            file_id: file_id.to_string(),
                            chunk_index,
                        },
                    );
                    send_cancel(link, file_id.to_string(), CancelReason::RetriesExhausted).await;
                }
            }
        }
        Ok(())
    }

    async fn on_complete_ack(
        &mut self,
        link: &mut dyn TransferLink,
        file_id: &str,
        success: bool,
        missing: Option<Vec<u32>>,
    ) {
        let Some(transfer) = self.outgoing.get(file_id) else {
            return;
        };
        if transfer.state != TransferState::AwaitingCompleteAck {
            return;
        }

        if success {
            let file_name = transfer.file_name.clone();
            info!(file_id = %file_id, "file delivered");
            self.remove_outgoing(file_id);
            self.events.push(TransferEvent::Completed {
                file_id: file_id.to_string(),
                direction: TransferDirection::Send,
                file_name,
                path: None,
            });
            return;
        }

        match missing {
            Some(chunks) if !chunks.is_empty() => {
                self.touch_outgoing(file_id);
                self.retransmit(link, file_id, &chunks, "reported missing").await;
            }
            _ => {
                self.fail_outgoing(file_id, TransportError::protocol("peer failed to verify the file hash"));
            }
        }
    }

    fn on_remote_cancel(&mut self, file_id: &str, reason: CancelReason) {
        let direction = if self.remove_outgoing(file_id).is_some() {
            TransferDirection::Send
        } else if let Some(transfer) = self.incoming.remove(file_id) {
            transfer.abort();
            TransferDirection::Receive
        } else {
            return;
        };
        info!(file_id = %file_id, %direction, %reason, "peer cancelled transfer");
        self.cancelled(file_id.to_string(), direction, reason);
    }

    /// Queue `chunks` for resending and return to `Transferring`. Fails the
    /// transfer once any chunk runs out of retries.
    async fn retransmit(&mut self, link: &mut dyn TransferLink, file_id: &str, chunks: &[u32], why: &str) {
        if let Some(transfer) = self.outgoing.get_mut(file_id) {
            if !matches!(
                transfer.state,
                TransferState::Transferring | TransferState::AwaitingCompleteAck
            ) {
                return;
            }
            transfer.state = TransferState::Transferring;
            transfer.control_deadline = None;
        }
        if self.requeue_chunks(file_id, chunks, why) {
            self.fail_outgoing(file_id, TransportError::RetriesExhausted { file_id: file_id.to_string() });
            send_cancel(link, file_id.to_string(), CancelReason::RetriesExhausted).await;
        }
    }

    /// Returns true when a chunk exhausted its retries.
    fn requeue_chunks(&mut self, file_id: &str, chunks: &[u32], why: &str) -> bool {
        let max_retries = self.config.max_retries_per_chunk;
        let Some(transfer) = self.outgoing.get_mut(file_id) else {
            return false;
        };
        for &index in chunks {
            if transfer.validate_index(index).is_err() {
                continue;
            }
            match transfer.requeue(index, max_retries) {
                AckOutcome::Exhausted => {
                    warn!(file_id = %file_id, chunk = index, "chunk retries exhausted ({})", why);
                    return true;
                }
                AckOutcome::Retry => {
                    debug!(file_id = %file_id, chunk = index, retry = transfer.retries(index), "requeued chunk ({})", why);
                }
                _ => {}
            }
        }
        false
    }

    fn next_sendable(&mut self) -> Option<(String, u32)> {
        let max_in_flight = self.config.max_chunks_in_flight;
        for _ in 0..self.send_order.len() {
            let file_id = self.send_order.front()?.clone();
            self.send_order.rotate_left(1);
            if let Some(index) = self.outgoing.get_mut(&file_id).and_then(|t| t.next_chunk(max_in_flight)) {
                return Some((file_id, index));
            }
        }
        None
    }

    fn rearm_in_flight(&mut self, now: Instant) {
        for transfer in self.outgoing.values_mut() {
            let indices: Vec<u32> = transfer.in_flight.keys().copied().collect();
            for index in indices {
                let deadline = now + chunk_timeout(&self.config, transfer.retries(index));
                transfer.in_flight.insert(index, deadline);
            }
        }
    }

    fn touch_outgoing(&mut self, file_id: &str) {
        if let Some(transfer) = self.outgoing.get_mut(file_id) {
            transfer.last_activity = Instant::now();
        }
    }

    fn remove_outgoing(&mut self, file_id: &str) -> Option<OutgoingTransfer> {
        self.send_order.retain(|id| id != file_id);
        self.outgoing.remove(file_id)
    }

    fn fail_outgoing(&mut self, file_id: &str, error: TransportError) {
        if let Some(mut transfer) = self.remove_outgoing(file_id) {
            transfer.state = TransferState::Failed(error.to_string());
            warn!(file_id = %file_id, "outgoing transfer failed: {}", error);
            self.events.push(TransferEvent::Failed {
                file_id: file_id.to_string(),
                direction: TransferDirection::Send,
                error,
            });
        }
    }

    fn cancelled(&mut self, file_id: String, direction: TransferDirection, reason: CancelReason) {
        self.events.push(TransferEvent::Cancelled {
            file_id,
            direction,
            reason,
        });
    }

    fn remember_completed(&mut self, file_id: String) {
        if self.recently_completed.len() == RECENT_COMPLETED {
            self.recently_completed.pop_front();
        }
        self.recently_completed.push_back(file_id);
    }
}

async fn send_cancel(link: &mut dyn TransferLink, file_id: String, reason: CancelReason) {
    let message = ChannelMessage::TransferCancel { file_id, reason };
    if let Err(e) = link.send(&message).await {
        debug!("failed to send transfer_cancel: {}", e);
    }
}
