//! One task per remote peer.
//!
//! The task owns the peer's negotiator, crypto session and transfer engine;
//! nothing else touches them. Commands from the [`crate::Transport`] handle,
//! routed relay messages, connection events, transfer timers and buffer
//! drains are all multiplexed in a single `select!` loop.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use zajel_common::config::TransportConfig;
use zajel_common::{CancelReason, ChannelMessage, SignalMessage, FILE_CHANNEL_LABEL, MESSAGE_CHANNEL_LABEL};
use zajel_crypto::{ChannelKind, CryptoError, CryptoSession, KeyPair, SessionStats};

use crate::channel::{ChannelHandle, Generation, PeerConnectionFactory, Role, RtcEvent};
use crate::error::{Result, TransportError};
use crate::event::TransportEvent;
use crate::negotiator::{ChannelSet, ConnectionNegotiator, NegotiatorEvent};
use crate::signaling::Subscription;
use crate::transfer::{PumpResult, ReliableTransferEngine, TransferEvent, TransferLink};

const COMMAND_QUEUE: usize = 32;

/// Diagnostics for one peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub state: &'static str,
    pub generation: Option<Generation>,
    pub verified: bool,
    /// Crypto counters, kept across session renewals.
    pub crypto: SessionStats,
    /// Inbound frames dropped for failing decryption, replay or decoding.
    pub frames_dropped: u64,
    pub active_transfers: usize,
}

pub(crate) enum PeerCommand {
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SendFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<String>>,
    },
    SendBytes {
        file_name: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<String>>,
    },
    CancelTransfer {
        file_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<Generation>>,
    },
    Stats {
        reply: oneshot::Sender<PeerStats>,
    },
    FastForwardCounter {
        channel: ChannelKind,
        sent: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Encrypts transfer messages for the `files` channel.
///
/// Frame: base64 of `CryptoSession::encrypt(Binary, json)`.
pub(crate) struct SecureLink<'a> {
    session: &'a mut CryptoSession,
    channel: &'a ChannelHandle,
    max_message_size: usize,
}

impl<'a> SecureLink<'a> {
    pub(crate) fn new(session: &'a mut CryptoSession, channel: &'a ChannelHandle, max_message_size: usize) -> Self {
        Self {
            session,
            channel,
            max_message_size,
        }
    }
}

#[async_trait]
impl<'a> TransferLink for SecureLink<'a> {
    async fn send(&mut self, message: &ChannelMessage) -> Result<()> {
        let json = message.encode()?;
        let frame = STANDARD.encode(self.session.encrypt(ChannelKind::Binary, json.as_bytes())?);
        if frame.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                limit: self.max_message_size,
            });
        }
        self.channel.send(Bytes::from(frame)).await
    }

    async fn buffered_amount(&self) -> usize {
        self.channel.buffered_amount().await
    }
}

/// Cheap handle kept by the transport for each live peer task.
pub(crate) struct PeerHandle {
    pub commands: mpsc::Sender<PeerCommand>,
    pub task: tokio::task::JoinHandle<()>,
    pub peer_public_key: zajel_crypto::PeerPublicKey,
}

pub(crate) struct PeerParams {
    pub peer_code: String,
    pub role: Role,
    pub keys: Arc<KeyPair>,
    pub session: CryptoSession,
    pub config: TransportConfig,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub signals: mpsc::Sender<SignalMessage>,
    pub subscription: Subscription,
    pub events: mpsc::Sender<TransportEvent>,
}

pub(crate) fn spawn_peer(params: PeerParams) -> PeerHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (rtc_tx, rtc_rx) = mpsc::unbounded_channel();
    let peer_public_key = params.session.peer_public_key().clone();

    let negotiator = ConnectionNegotiator::new(
        params.peer_code.clone(),
        params.factory,
        rtc_tx,
        params.signals,
        params.config.negotiation.max_pending_candidates,
    );
    let actor = PeerActor {
        peer_code: params.peer_code,
        role: params.role,
        keys: params.keys,
        engine: ReliableTransferEngine::new(params.config.transfer.clone()),
        max_message_size: params.config.max_message_size,
        negotiator,
        rtc_events: rtc_rx,
        subscription: params.subscription,
        commands: command_rx,
        events: params.events,
        session: Some(params.session),
        session_generation: None,
        verified: false,
        blocked: false,
        frames_dropped: 0,
    };

    PeerHandle {
        commands: command_tx,
        task: tokio::spawn(actor.run()),
        peer_public_key,
    }
}

enum Flow {
    Continue,
    Stop,
}

struct PeerActor {
    peer_code: String,
    role: Role,
    keys: Arc<KeyPair>,
    engine: ReliableTransferEngine,
    max_message_size: usize,
    negotiator: ConnectionNegotiator,
    rtc_events: mpsc::UnboundedReceiver<RtcEvent>,
    subscription: Subscription,
    commands: mpsc::Receiver<PeerCommand>,
    events: mpsc::Sender<TransportEvent>,
    /// `None` only after teardown.
    session: Option<CryptoSession>,
    /// Connection the session's nonce and traffic key belong to.
    session_generation: Option<Generation>,
    verified: bool,
    /// The last pump stopped on a full send buffer.
    blocked: bool,
    frames_dropped: u64,
}

impl PeerActor {
    async fn run(mut self) {
        let started = match self.role {
            Role::Initiator => self.negotiator.start_as_initiator().await.map(Some),
            Role::Responder => Ok(Some(self.negotiator.prepare_responder().await)),
        };
        match started {
            Ok(generation) => self.state_changed(generation).await,
            Err(e) => {
                warn!(peer = %self.peer_code, "initial negotiation failed: {}", e);
                self.state_changed(None).await;
            }
        }

        loop {
            let deadline = self.engine.next_deadline();
            let drain = if self.blocked {
                self.negotiator.channels().map(|c| c.files.clone())
            } else {
                None
            };
            let low_water = self.engine.config().buffer_low_water;

            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PeerCommand::Close) | None => Flow::Stop,
                    Some(command) => {
                        self.handle_command(command).await;
                        Flow::Continue
                    }
                },
                Some(event) = self.rtc_events.recv() => self.handle_rtc(event).await,
                signal = self.subscription.recv() => match signal {
                    Some(signal) => {
                        self.handle_signal(signal).await;
                        Flow::Continue
                    }
                    None => {
                        debug!(peer = %self.peer_code, "signal subscription ended");
                        Flow::Stop
                    }
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.on_timer().await;
                    Flow::Continue
                }
                _ = async {
                    match &drain {
                        Some(channel) => channel.wait_buffered_below(low_water).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.engine.on_drained();
                    self.pump().await;
                    Flow::Continue
                }
            };

            if matches!(flow, Flow::Stop) {
                break;
            }
            if self.session.as_ref().is_some_and(CryptoSession::needs_rekey) {
                self.rekey().await;
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::SendMessage { text, reply } => {
                let result = self.send_text(&text).await;
                let _ = reply.send(result);
            }
            PeerCommand::SendFile { path, reply } => {
                let result = match ready_parts(self.verified, &self.peer_code, &mut self.session, &self.negotiator) {
                    Ok((session, channels)) => {
                        let files = channels.files;
                        let mut link = SecureLink::new(session, &files, self.max_message_size);
                        self.engine.send_file(&mut link, &path).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
                self.pump().await;
            }
            PeerCommand::SendBytes { file_name, data, reply } => {
                let result = match ready_parts(self.verified, &self.peer_code, &mut self.session, &self.negotiator) {
                    Ok((session, channels)) => {
                        let files = channels.files;
                        let mut link = SecureLink::new(session, &files, self.max_message_size);
                        self.engine.send_bytes(&mut link, &file_name, data).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
                self.pump().await;
            }
            PeerCommand::CancelTransfer { file_id, reply } => {
                let result = match ready_parts(self.verified, &self.peer_code, &mut self.session, &self.negotiator) {
                    Ok((session, channels)) => {
                        let files = channels.files;
                        let mut link = SecureLink::new(session, &files, self.max_message_size);
                        self.engine.cancel(&mut link, &file_id, CancelReason::Cancelled).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
                self.forward_transfer_events().await;
            }
            PeerCommand::Reconnect { reply } => {
                let result = self.restart("reconnect requested").await;
                let _ = reply.send(result);
            }
            PeerCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PeerCommand::FastForwardCounter { channel, sent, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => {
                        session.fast_forward_send_counter(channel, sent);
                        Ok(())
                    }
                    None => Err(TransportError::SessionClosed),
                };
                let _ = reply.send(result);
            }
            PeerCommand::Close => {}
        }
    }

    async fn handle_rtc(&mut self, event: RtcEvent) -> Flow {
        let Some(event) = self.negotiator.handle_event(event).await else {
            return Flow::Continue;
        };
        match event {
            NegotiatorEvent::Connected(channels) => {
                self.state_changed(self.negotiator.generation()).await;
                self.sync_session();
                self.send_handshake(&channels).await;
                Flow::Continue
            }
            NegotiatorEvent::Frame { label, data } => self.handle_frame(&label, data).await,
            NegotiatorEvent::Failed(reason) => {
                warn!(peer = %self.peer_code, %reason, "connection attempt failed");
                self.lose_channels().await;
                self.state_changed(None).await;
                Flow::Continue
            }
            NegotiatorEvent::Disconnected => {
                self.lose_channels().await;
                self.state_changed(None).await;
                Flow::Continue
            }
        }
    }

    async fn handle_signal(&mut self, signal: SignalMessage) {
        match signal {
            SignalMessage::Offer { sdp, .. } => {
                if self.negotiator.is_connected() || self.verified {
                    // The peer restarted; the new connection gets a new key.
                    self.lose_channels().await;
                }
                match self.negotiator.handle_remote_offer(sdp).await {
                    Ok(()) => self.state_changed(self.negotiator.generation()).await,
                    Err(e) => {
                        warn!(peer = %self.peer_code, "failed to answer offer: {}", e);
                        self.state_changed(None).await;
                    }
                }
            }
            SignalMessage::Answer { sdp, .. } => {
                if let Err(e) = self.negotiator.handle_remote_answer(sdp).await {
                    warn!(peer = %self.peer_code, "failed to apply answer: {}", e);
                    self.state_changed(None).await;
                }
            }
            SignalMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
                ..
            } => {
                self.negotiator
                    .handle_remote_candidate(zajel_common::IceCandidate {
                        candidate,
                        sdp_mid,
                        sdp_m_line_index,
                    })
                    .await;
            }
            other => debug!(peer = %self.peer_code, "unexpected routed {}", other.kind()),
        }
    }

    async fn handle_frame(&mut self, label: &str, data: Bytes) -> Flow {
        if data.len() > self.max_message_size {
            warn!(peer = %self.peer_code, %label, size = data.len(), "oversized frame dropped");
            self.frames_dropped += 1;
            return Flow::Continue;
        }
        let Ok(text) = std::str::from_utf8(&data) else {
            warn!(peer = %self.peer_code, %label, "non-UTF-8 frame dropped");
            self.frames_dropped += 1;
            return Flow::Continue;
        };

        match label {
            MESSAGE_CHANNEL_LABEL => self.handle_message_frame(text).await,
            FILE_CHANNEL_LABEL => {
                self.handle_file_frame(text).await;
                Flow::Continue
            }
            other => {
                debug!(peer = %self.peer_code, label = other, "frame on unknown channel dropped");
                Flow::Continue
            }
        }
    }

    async fn handle_message_frame(&mut self, text: &str) -> Flow {
        let message = match ChannelMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.peer_code, "undecodable message frame: {}", e);
                self.frames_dropped += 1;
                return Flow::Continue;
            }
        };
        if self.session.is_none() {
            return Flow::Continue;
        }

        match message {
            ChannelMessage::Handshake {
                public_key,
                session_nonce,
            } => self.handle_handshake(&public_key, &session_nonce).await,
            ChannelMessage::Message { ciphertext } => {
                if !self.verified {
                    warn!(peer = %self.peer_code, security = true, "message before handshake dropped");
                    self.frames_dropped += 1;
                    return Flow::Continue;
                }
                let Some(session) = self.session.as_mut() else {
                    return Flow::Continue;
                };
                match session.decrypt_text(&ciphertext) {
                    Ok(text) => {
                        self.emit(TransportEvent::Message {
                            peer: self.peer_code.clone(),
                            text,
                        })
                        .await;
                    }
                    Err(e) => self.drop_frame(&e),
                }
                Flow::Continue
            }
            other => {
                warn!(peer = %self.peer_code, "{} is not allowed on the message channel", other.kind());
                self.frames_dropped += 1;
                Flow::Continue
            }
        }
    }

    /// Check the announced key, then derive this connection's traffic key.
    async fn handle_handshake(&mut self, public_key: &str, session_nonce: &str) -> Flow {
        let matches = self
            .session
            .as_ref()
            .is_some_and(|session| session.verify_handshake_key(public_key));
        if !matches {
            error!(
                peer = %self.peer_code,
                security = true,
                "handshake key does not match the key received from the relay"
            );
            self.emit(TransportEvent::SecurityAlert {
                peer: self.peer_code.clone(),
                error: TransportError::HandshakeKeyMismatch {
                    peer: self.peer_code.clone(),
                },
            })
            .await;
            return Flow::Stop;
        }
        if self.verified && self.session_generation == self.negotiator.generation() {
            debug!(peer = %self.peer_code, "repeated handshake ignored");
            return Flow::Continue;
        }

        self.sync_session();
        let Some(session) = self.session.as_mut() else {
            return Flow::Continue;
        };
        if let Err(e) = session.bind_peer_nonce(session_nonce) {
            warn!(peer = %self.peer_code, security = true, "handshake rejected: {}", e);
            self.frames_dropped += 1;
            return Flow::Continue;
        }
        self.verified = true;
        let fingerprint = session.peer_fingerprint();
        info!(peer = %self.peer_code, %fingerprint, "handshake verified");
        self.emit(TransportEvent::Verified {
            peer: self.peer_code.clone(),
            fingerprint,
        })
        .await;
        Flow::Continue
    }

    async fn handle_file_frame(&mut self, text: &str) {
        if !self.verified {
            warn!(peer = %self.peer_code, security = true, "file frame before handshake dropped");
            self.frames_dropped += 1;
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let frame = match STANDARD.decode(text.trim()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %self.peer_code, "undecodable file frame: {}", e);
                self.frames_dropped += 1;
                return;
            }
        };
        let plaintext = match session.decrypt(ChannelKind::Binary, &frame) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.drop_frame(&e);
                return;
            }
        };
        let message = match std::str::from_utf8(&plaintext)
            .map_err(|e| e.to_string())
            .and_then(|json| ChannelMessage::decode(json).map_err(|e| e.to_string()))
        {
            Ok(message) if !message.is_cleartext() => message,
            Ok(message) => {
                warn!(peer = %self.peer_code, "{} is not allowed on the file channel", message.kind());
                self.frames_dropped += 1;
                return;
            }
            Err(e) => {
                warn!(peer = %self.peer_code, "invalid transfer message: {}", e);
                self.frames_dropped += 1;
                return;
            }
        };

        let Some(channels) = self.negotiator.channels() else {
            return;
        };
        let files = channels.files.clone();
        let mut link = SecureLink::new(session, &files, self.max_message_size);
        if let Err(e) = self.engine.handle_message(&mut link, message).await {
            warn!(peer = %self.peer_code, "transfer reply failed: {}", e);
        }
        self.pump().await;
    }

    async fn on_timer(&mut self) {
        match (self.session.as_mut(), self.negotiator.channels()) {
            (Some(session), Some(channels)) => {
                let files = channels.files.clone();
                let mut link = SecureLink::new(session, &files, self.max_message_size);
                self.engine.on_timer(&mut link, Instant::now()).await;
            }
            _ => {
                // No channel to time out against; drop remaining transfers.
                self.engine.shutdown();
            }
        }
        self.pump().await;
    }

    /// Push chunks, then report whatever the engine produced.
    async fn pump(&mut self) {
        if let (Some(session), Some(channels)) = (self.session.as_mut(), self.negotiator.channels()) {
            if self.verified {
                let files = channels.files.clone();
                let mut link = SecureLink::new(session, &files, self.max_message_size);
                self.blocked = match self.engine.pump(&mut link).await {
                    Ok(PumpResult::Blocked) => true,
                    Ok(PumpResult::Idle) => false,
                    Err(e) => {
                        warn!(peer = %self.peer_code, "pump failed: {}", e);
                        false
                    }
                };
            }
        }
        self.forward_transfer_events().await;
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        let (session, channels) = ready_parts(self.verified, &self.peer_code, &mut self.session, &self.negotiator)?;
        let ciphertext = session.encrypt_text(text)?;
        let frame = ChannelMessage::Message { ciphertext }.encode()?;
        if frame.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                limit: self.max_message_size,
            });
        }
        channels.messages.send(Bytes::from(frame)).await
    }

    async fn send_handshake(&self, channels: &ChannelSet) {
        let Some(session) = &self.session else {
            return;
        };
        let handshake = ChannelMessage::Handshake {
            public_key: self.keys.public_key_base64(),
            session_nonce: session.local_nonce_base64(),
        };
        let result = match handshake.encode() {
            Ok(frame) => channels.messages.send(Bytes::from(frame)).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => debug!(peer = %self.peer_code, "handshake sent"),
            Err(e) => warn!(peer = %self.peer_code, "failed to send handshake: {}", e),
        }
    }

    fn drop_frame(&mut self, error: &CryptoError) {
        self.frames_dropped += 1;
        match error {
            CryptoError::ReplayDetected { .. } | CryptoError::AuthenticationFailed => {
                warn!(peer = %self.peer_code, security = true, "frame dropped: {}", error);
            }
            other => warn!(peer = %self.peer_code, "frame dropped: {}", other),
        }
    }

    /// Channels are gone: stop all transfers and require a new handshake.
    async fn lose_channels(&mut self) {
        self.verified = false;
        self.blocked = false;
        self.engine.shutdown();
        self.forward_transfer_events().await;
    }

    /// Tie the crypto session to the current connection. A new generation
    /// gets a new nonce and, once the peer's nonce arrives, a new key.
    fn sync_session(&mut self) {
        let generation = self.negotiator.generation();
        if generation == self.session_generation {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.renew();
        }
        self.verified = false;
        self.session_generation = generation;
        debug!(peer = %self.peer_code, ?generation, "crypto session bound to new connection");
    }

    /// Start over as the offering side with a fresh generation and session.
    async fn restart(&mut self, why: &str) -> Result<Generation> {
        info!(peer = %self.peer_code, reason = why, "restarting session");
        self.lose_channels().await;
        let Some(session) = self.session.as_mut() else {
            return Err(TransportError::SessionClosed);
        };
        // Exhausted counters must not survive until the next connection.
        session.renew();
        self.session_generation = None;
        let result = self.negotiator.start_as_initiator().await;
        self.state_changed(result.as_ref().ok().copied()).await;
        result
    }

    async fn rekey(&mut self) {
        warn!(peer = %self.peer_code, "send counter exhausted, re-establishing session");
        if let Err(e) = self.restart("send counter exhausted").await {
            warn!(peer = %self.peer_code, "re-establishment failed: {}", e);
        }
    }

    async fn teardown(&mut self) {
        self.negotiator.close().await;
        self.engine.shutdown();
        self.forward_transfer_events().await;
        self.session = None;
        self.verified = false;
        info!(peer = %self.peer_code, "session closed");
        self.emit(TransportEvent::SessionClosed {
            peer: self.peer_code.clone(),
        })
        .await;
    }

    fn stats(&self) -> PeerStats {
        let crypto = self.session.as_ref().map(CryptoSession::stats).unwrap_or_default();
        PeerStats {
            state: self.negotiator.state().name(),
            generation: self.negotiator.generation(),
            verified: self.verified,
            crypto,
            frames_dropped: self.frames_dropped,
            active_transfers: self.engine.outgoing_count() + self.engine.incoming_count(),
        }
    }

    async fn state_changed(&self, generation: Option<Generation>) {
        self.emit(TransportEvent::StateChanged {
            peer: self.peer_code.clone(),
            state: self.negotiator.state().name(),
            generation: generation.or(self.negotiator.generation()),
        })
        .await;
    }

    async fn forward_transfer_events(&mut self) {
        for event in self.engine.drain_events() {
            let peer = self.peer_code.clone();
            let event = match event {
                TransferEvent::Offered {
                    file_id,
                    file_name,
                    total_size,
                } => TransportEvent::TransferOffered {
                    peer,
                    file_id,
                    file_name,
                    total_size,
                },
                TransferEvent::Progress {
                    file_id,
                    direction,
                    transferred,
                    total,
                } => TransportEvent::TransferProgress {
                    peer,
                    file_id,
                    direction,
                    transferred,
                    total,
                },
                TransferEvent::Completed {
                    file_id,
                    direction,
                    file_name,
                    path,
                } => TransportEvent::TransferComplete {
                    peer,
                    file_id,
                    direction,
                    file_name,
                    path,
                },
                TransferEvent::Failed {
                    file_id,
                    direction,
                    error,
                } => TransportEvent::TransferFailed {
                    peer,
                    file_id,
                    direction,
                    error,
                },
                TransferEvent::Cancelled {
                    file_id,
                    direction,
                    reason,
                } => TransportEvent::TransferCancelled {
                    peer,
                    file_id,
                    direction,
                    reason,
                },
            };
            self.emit(event).await;
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!(peer = %self.peer_code, "event receiver dropped");
        }
    }
}

/// Session and channels of a verified, connected peer.
fn ready_parts<'a>(
    verified: bool,
    peer_code: &str,
    session: &'a mut Option<CryptoSession>,
    negotiator: &ConnectionNegotiator,
) -> Result<(&'a mut CryptoSession, ChannelSet)> {
    if !verified {
        return Err(TransportError::NotReady(peer_code.to_string()));
    }
    let channels = negotiator
        .channels()
        .cloned()
        .ok_or_else(|| TransportError::NotReady(peer_code.to_string()))?;
    let session = session.as_mut().ok_or(TransportError::SessionClosed)?;
    Ok((session, channels))
}
