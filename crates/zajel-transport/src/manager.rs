use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use zajel_common::config::TransportConfig;
use zajel_common::SignalMessage;
use zajel_crypto::{safety_number, ChannelKind, CryptoSession, KeyPair, PeerPublicKey};

use crate::channel::{Generation, PeerConnectionFactory, Role};
use crate::error::{Result, TransportError};
use crate::event::TransportEvent;
use crate::peer::{spawn_peer, PeerCommand, PeerHandle, PeerParams, PeerStats};
use crate::signaling::SignalRouter;

const EVENT_QUEUE: usize = 256;

/// Entry point for applications: owns one task per peer and dispatches
/// relay traffic to them. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    keys: Arc<KeyPair>,
    config: TransportConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    signals: mpsc::Sender<SignalMessage>,
    events: mpsc::Sender<TransportEvent>,
    router: SignalRouter,
    peers: Mutex<HashMap<String, PeerHandle>>,
    /// Keys announced by incoming pair requests, by requester code.
    pending_pairs: Mutex<HashMap<String, PeerPublicKey>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport {
    /// `signals` is the outbound relay queue, usually
    /// [`crate::RelayClient::sender`]. Returns the transport and its event
    /// stream.
    pub fn new(
        keys: KeyPair,
        config: TransportConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        signals: mpsc::Sender<SignalMessage>,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let transport = Self {
            inner: Arc::new(Inner {
                keys: Arc::new(keys),
                config,
                factory,
                signals,
                events: events_tx,
                router: SignalRouter::new(),
                peers: Mutex::new(HashMap::new()),
                pending_pairs: Mutex::new(HashMap::new()),
            }),
        };
        (transport, events_rx)
    }

    pub fn public_key_base64(&self) -> String {
        self.inner.keys.public_key_base64()
    }

    pub fn fingerprint(&self) -> String {
        self.inner.keys.public_key().fingerprint()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Peers with a live session task.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock(&self.inner.peers)
            .iter()
            .filter(|(_, handle)| !handle.task.is_finished())
            .map(|(code, _)| code.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Start a session with `peer_code` using the key the relay vouched
    /// for. Replaces any existing session with that peer.
    ///
    /// # Errors
    /// `Crypto(InvalidKey)` if the key is malformed.
    pub async fn establish_session(&self, peer_code: &str, peer_public_key_b64: &str, role: Role) -> Result<()> {
        let session = CryptoSession::establish(&self.inner.keys, peer_code, peer_public_key_b64)?;

        let previous = lock(&self.inner.peers).remove(peer_code);
        if let Some(previous) = previous {
            info!(peer = %peer_code, "replacing existing session");
            let _ = previous.commands.send(PeerCommand::Close).await;
        }

        // Cancels the previous subscription before the new one exists.
        let subscription = self.inner.router.subscribe(peer_code);
        let handle = spawn_peer(PeerParams {
            peer_code: peer_code.to_string(),
            role,
            keys: self.inner.keys.clone(),
            session,
            config: self.inner.config.clone(),
            factory: self.inner.factory.clone(),
            signals: self.inner.signals.clone(),
            subscription,
            events: self.inner.events.clone(),
        });
        lock(&self.inner.peers).insert(peer_code.to_string(), handle);
        info!(peer = %peer_code, ?role, "session started");
        Ok(())
    }

    /// Encrypt and send a text message. Fails with `NotReady` until the
    /// handshake has been verified.
    pub async fn send_message(&self, peer_code: &str, text: &str) -> Result<()> {
        self.request(peer_code, |reply| PeerCommand::SendMessage {
            text: text.to_string(),
            reply,
        })
        .await?
    }

    /// Offer the file at `path`; returns the transfer id.
    pub async fn send_file(&self, peer_code: &str, path: impl Into<PathBuf>) -> Result<String> {
        let path = path.into();
        self.request(peer_code, |reply| PeerCommand::SendFile { path, reply })
            .await?
    }

    /// Offer an in-memory file; returns the transfer id.
    pub async fn send_bytes(&self, peer_code: &str, file_name: &str, data: Vec<u8>) -> Result<String> {
        self.request(peer_code, |reply| PeerCommand::SendBytes {
            file_name: file_name.to_string(),
            data,
            reply,
        })
        .await?
    }

    pub async fn cancel_transfer(&self, peer_code: &str, file_id: &str) -> Result<()> {
        self.request(peer_code, |reply| PeerCommand::CancelTransfer {
            file_id: file_id.to_string(),
            reply,
        })
        .await?
    }

    /// Restart negotiation with a fresh generation and crypto session.
    pub async fn reconnect(&self, peer_code: &str) -> Result<Generation> {
        self.request(peer_code, |reply| PeerCommand::Reconnect { reply })
            .await?
    }

    pub async fn session_stats(&self, peer_code: &str) -> Result<PeerStats> {
        self.request(peer_code, |reply| PeerCommand::Stats { reply }).await
    }

    /// Move a send counter forward, e.g. to exercise counter exhaustion.
    #[doc(hidden)]
    pub async fn fast_forward_send_counter(&self, peer_code: &str, channel: ChannelKind, sent: u32) -> Result<()> {
        self.request(peer_code, |reply| PeerCommand::FastForwardCounter { channel, sent, reply })
            .await?
    }

    /// Fingerprint of the peer's key, for out-of-band comparison.
    pub fn verify_fingerprint(&self, peer_code: &str) -> Result<String> {
        Ok(self.peer_key(peer_code)?.fingerprint())
    }

    /// Safety number shared by both sides of the session.
    pub fn safety_number(&self, peer_code: &str) -> Result<String> {
        let peer_key = self.peer_key(peer_code)?;
        Ok(safety_number(&self.inner.keys.public_key_bytes(), peer_key.as_bytes()))
    }

    /// Tear the session down and wait for its task to finish.
    pub async fn close_session(&self, peer_code: &str) -> Result<()> {
        let handle = lock(&self.inner.peers)
            .remove(peer_code)
            .ok_or_else(|| TransportError::UnknownPeer(peer_code.to_string()))?;
        let _ = handle.commands.send(PeerCommand::Close).await;
        if let Err(e) = handle.task.await {
            warn!(peer = %peer_code, "session task ended abnormally: {}", e);
        }
        Ok(())
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, PeerHandle)> = lock(&self.inner.peers).drain().collect();
        for (peer, handle) in handles {
            let _ = handle.commands.send(PeerCommand::Close).await;
            if let Err(e) = handle.task.await {
                warn!(peer = %peer, "session task ended abnormally: {}", e);
            }
        }
    }

    pub async fn pair_request(&self, target_code: &str, proposed_name: Option<String>) -> Result<()> {
        info!(target = %target_code, "requesting pairing");
        self.signal(SignalMessage::PairRequest {
            target_code: target_code.to_string(),
            proposed_name,
        })
        .await
    }

    pub async fn respond_pair(&self, from_code: &str, accept: bool) -> Result<()> {
        {
            let mut pending = lock(&self.inner.pending_pairs);
            // an accepted request keeps its key until the match arrives
            let known = if accept {
                pending.contains_key(from_code)
            } else {
                pending.remove(from_code).is_some()
            };
            if !known {
                debug!(peer = %from_code, "responding to a pair request that was not seen");
            }
        }
        self.signal(SignalMessage::PairResponse {
            target_code: from_code.to_string(),
            accept,
        })
        .await
    }

    /// Apply one inbound relay message.
    pub async fn handle_signal(&self, message: SignalMessage) {
        match message {
            SignalMessage::Registered { pairing_code } => {
                info!(code = ?pairing_code, "registered with relay");
                self.emit(TransportEvent::Registered { pairing_code }).await;
            }
            SignalMessage::PairIncoming {
                from_code,
                from_public_key,
                proposed_name,
            } => {
                info!(peer = %from_code, "incoming pair request");
                match PeerPublicKey::from_base64(&from_public_key) {
                    Ok(key) => {
                        lock(&self.inner.pending_pairs).insert(from_code.clone(), key);
                    }
                    Err(e) => warn!(peer = %from_code, "pair request carries an invalid key: {}", e),
                }
                self.emit(TransportEvent::PairIncoming {
                    from_code,
                    from_public_key,
                    proposed_name,
                })
                .await;
            }
            SignalMessage::PairMatched {
                peer_code,
                peer_public_key,
                is_initiator,
            } => {
                let announced = lock(&self.inner.pending_pairs).remove(&peer_code);
                if let Some(announced) = announced {
                    if PeerPublicKey::from_base64(&peer_public_key).ok() != Some(announced) {
                        error!(peer = %peer_code, security = true, "pair matched with a key other than the one requested");
                        self.emit(TransportEvent::SecurityAlert {
                            peer: peer_code.clone(),
                            error: TransportError::PairKeyMismatch { peer: peer_code },
                        })
                        .await;
                        return;
                    }
                }
                let role = if is_initiator { Role::Initiator } else { Role::Responder };
                match self.establish_session(&peer_code, &peer_public_key, role).await {
                    Ok(()) => {
                        self.emit(TransportEvent::PairMatched {
                            peer_code,
                            is_initiator,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!(peer = %peer_code, "cannot start session: {}", e);
                        self.emit(TransportEvent::PairError { error: e.to_string() }).await;
                    }
                }
            }
            SignalMessage::PairRejected { peer_code } => {
                lock(&self.inner.pending_pairs).remove(&peer_code);
                self.emit(TransportEvent::PairRejected { peer_code }).await;
            }
            SignalMessage::PairTimeout { peer_code } => {
                lock(&self.inner.pending_pairs).remove(&peer_code);
                self.emit(TransportEvent::PairTimeout { peer_code }).await;
            }
            SignalMessage::PairError { error } => {
                warn!("pairing error: {}", error);
                self.emit(TransportEvent::PairError { error }).await;
            }
            SignalMessage::Error { message } => {
                warn!("relay error: {}", message);
                self.emit(TransportEvent::RelayError { message }).await;
            }
            message @ (SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. }) => {
                let Some(from) = message.source_peer().map(str::to_string) else {
                    warn!("{} without sender dropped", message.kind());
                    return;
                };
                if let Err(message) = self.inner.router.route(&from, message).await {
                    debug!(peer = %from, "no session for {}, dropped", message.kind());
                }
            }
            SignalMessage::Ping | SignalMessage::Pong => {}
            other => warn!("unexpected relay message: {}", other.kind()),
        }
    }

    /// Feed every message from `inbound` into [`Transport::handle_signal`].
    pub fn attach_relay(&self, mut inbound: mpsc::Receiver<SignalMessage>) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                transport.handle_signal(message).await;
            }
            debug!("relay inbound stream ended");
        })
    }

    fn peer_key(&self, peer_code: &str) -> Result<PeerPublicKey> {
        lock(&self.inner.peers)
            .get(peer_code)
            .map(|handle| handle.peer_public_key.clone())
            .ok_or_else(|| TransportError::UnknownPeer(peer_code.to_string()))
    }

    async fn request<T>(
        &self,
        peer_code: &str,
        command: impl FnOnce(oneshot::Sender<T>) -> PeerCommand,
    ) -> Result<T> {
        let commands = lock(&self.inner.peers)
            .get(peer_code)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| TransportError::UnknownPeer(peer_code.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(command(reply_tx))
            .await
            .map_err(|_| TransportError::SessionClosed)?;
        reply_rx.await.map_err(|_| TransportError::SessionClosed)
    }

    async fn signal(&self, message: SignalMessage) -> Result<()> {
        self.inner
            .signals
            .send(message)
            .await
            .map_err(|_| TransportError::signaling("relay connection closed"))
    }

    async fn emit(&self, event: TransportEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("transport event receiver dropped");
        }
    }
}
