//! In-process connections for tests and local demos.
//!
//! A [`MemoryNetwork`] plays the role of the ICE/DTLS stack: the SDP strings
//! it hands out are rendezvous tokens, and the data channels it opens
//! deliver frames straight into the remote peer's event queue. Buffered
//! amounts never change on their own; tests drive them with
//! [`MemoryChannel::set_buffered_amount`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use zajel_common::{IceCandidate, FILE_CHANNEL_LABEL, MESSAGE_CHANNEL_LABEL};

use crate::channel::{
    emit, ChannelHandle, DataChannel, Generation, PeerConnection, PeerConnectionFactory, Role,
    RtcEvent, RtcEventKind,
};
use crate::error::{Result, TransportError};

type EventSink = (Generation, mpsc::UnboundedSender<RtcEvent>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MemoryChannel {
    label: String,
    remote: EventSink,
    buffered: watch::Sender<usize>,
    closed: Arc<AtomicBool>,
    sent: Mutex<Vec<Bytes>>,
}

impl MemoryChannel {
    /// Simulate the local send queue filling up or draining.
    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.send_replace(amount);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frames accepted by [`DataChannel::send`] on this end, oldest first.
    pub fn sent_frames(&self) -> Vec<Bytes> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        lock(&self.sent).push(data.clone());
        let (generation, events) = &self.remote;
        events
            .send(RtcEvent {
                generation: *generation,
                kind: RtcEventKind::Frame {
                    label: self.label.clone(),
                    data,
                },
            })
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn buffered_amount(&self) -> usize {
        *self.buffered.borrow()
    }

    async fn wait_buffered_below(&self, threshold: usize) {
        let mut rx = self.buffered.subscribe();
        let _ = rx.wait_for(|amount| *amount < threshold).await;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Two connected channel ends sharing a label and a closed flag.
pub fn memory_channel_pair(
    label: &str,
    a: EventSink,
    b: EventSink,
) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let closed = Arc::new(AtomicBool::new(false));
    let end_a = Arc::new(MemoryChannel {
        label: label.to_string(),
        remote: b,
        buffered: watch::channel(0).0,
        closed: closed.clone(),
        sent: Mutex::new(Vec::new()),
    });
    let end_b = Arc::new(MemoryChannel {
        label: label.to_string(),
        remote: a,
        buffered: watch::channel(0).0,
        closed,
        sent: Mutex::new(Vec::new()),
    });
    (end_a, end_b)
}

struct PendingOffer {
    offerer: EventSink,
}

struct PendingAnswer {
    offerer_generation: Generation,
    channels: Vec<Arc<MemoryChannel>>,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    offers: HashMap<String, PendingOffer>,
    answers: HashMap<String, PendingAnswer>,
    peers: Vec<Arc<MemoryPeer>>,
}

/// Shared fake network; clone it into every transport under test.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection created so far, in creation order.
    pub fn peers(&self) -> Vec<Arc<MemoryPeer>> {
        lock(&self.state).peers.clone()
    }

    fn next_id(&self) -> u64 {
        let mut state = lock(&self.state);
        state.next_id += 1;
        state.next_id
    }
}

#[async_trait]
impl PeerConnectionFactory for MemoryNetwork {
    async fn create(
        &self,
        generation: Generation,
        role: Role,
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(MemoryPeer {
            id: self.next_id(),
            network: self.clone(),
            generation,
            role,
            events,
            inner: Mutex::new(PeerInner::default()),
        });
        lock(&self.state).peers.push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
struct PeerInner {
    remote_candidates: Vec<IceCandidate>,
    channels: Vec<Arc<MemoryChannel>>,
    closed: bool,
}

pub struct MemoryPeer {
    id: u64,
    network: MemoryNetwork,
    generation: Generation,
    role: Role,
    events: mpsc::UnboundedSender<RtcEvent>,
    inner: Mutex<PeerInner>,
}

impl MemoryPeer {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote candidates added, in the order they were applied.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).remote_candidates.clone()
    }

    pub fn channels(&self) -> Vec<Arc<MemoryChannel>> {
        lock(&self.inner).channels.clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MemoryChannel>> {
        self.channels().into_iter().find(|c| c.label == label)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Simulate ICE failure.
    pub fn fail(&self, reason: &str) {
        emit(&self.events, self.generation, RtcEventKind::ConnectionFailed(reason.to_string()));
    }

    /// Emit a local candidate as if gathered by ICE.
    pub fn gather_candidate(&self) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id,
                40_000 + self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        emit(&self.events, self.generation, RtcEventKind::LocalCandidate(candidate));
    }

    fn ensure_open(&self) -> Result<()> {
        if lock(&self.inner).closed {
            return Err(TransportError::negotiation("connection closed"));
        }
        Ok(())
    }

    fn open_channels(&self, channels: Vec<Arc<MemoryChannel>>) {
        for channel in &channels {
            emit(
                &self.events,
                self.generation,
                RtcEventKind::ChannelOpen(channel.clone() as ChannelHandle),
            );
        }
        lock(&self.inner).channels.extend(channels);
    }
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    async fn create_offer(&self) -> Result<String> {
        self.ensure_open()?;
        let token = format!("memory-offer-{}", self.network.next_id());
        lock(&self.network.state).offers.insert(
            token.clone(),
            PendingOffer {
                offerer: (self.generation, self.events.clone()),
            },
        );
        self.gather_candidate();
        Ok(token)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        self.ensure_open()?;
        let offer = lock(&self.network.state)
            .offers
            .remove(&sdp)
            .ok_or_else(|| TransportError::negotiation(format!("unknown offer {sdp}")))?;

        let local: EventSink = (self.generation, self.events.clone());
        let mut ours = Vec::new();
        let mut theirs = Vec::new();
        for label in [MESSAGE_CHANNEL_LABEL, FILE_CHANNEL_LABEL] {
            let (offerer_end, answerer_end) =
                memory_channel_pair(label, offer.offerer.clone(), local.clone());
            theirs.push(offerer_end);
            ours.push(answerer_end);
        }

        let token = format!("memory-answer-{}", self.network.next_id());
        lock(&self.network.state).answers.insert(
            token.clone(),
            PendingAnswer {
                offerer_generation: offer.offerer.0,
                channels: theirs,
            },
        );

        self.gather_candidate();
        self.open_channels(ours);
        Ok(token)
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        self.ensure_open()?;
        let answer = lock(&self.network.state)
            .answers
            .remove(&sdp)
            .ok_or_else(|| TransportError::negotiation(format!("unknown answer {sdp}")))?;
        if answer.offerer_generation != self.generation {
            return Err(TransportError::negotiation("answer does not match offer"));
        }
        self.open_channels(answer.channels);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if candidate.candidate.trim().is_empty() {
            return Err(TransportError::negotiation("empty candidate"));
        }
        lock(&self.inner).remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let channels = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            inner.channels.clone()
        };
        for channel in channels {
            channel.close().await;
        }
        debug!(generation = %self.generation, "memory connection closed");
    }
}
