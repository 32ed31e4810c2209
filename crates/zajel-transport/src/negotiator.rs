//! Per-peer ICE/SDP state machine.
//!
//! ```text
//! initiator: Disconnected -> Negotiating -> AwaitingRemoteDescription -(answer)-> Negotiating -> Connected
//! responder: Disconnected -> AwaitingRemoteDescription -(offer)-> Negotiating -> Connected
//! ```
//!
//! `AwaitingRemoteDescription` is the only state in which remote candidates
//! are queued. Every attempt mints a fresh [`Generation`]; events carrying
//! any other generation are dropped in [`ConnectionNegotiator::handle_event`].
//! The negotiator is owned by a single peer task, so its state cannot change
//! across an `.await` inside one of its methods.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use zajel_common::{IceCandidate, SignalMessage, FILE_CHANNEL_LABEL, MESSAGE_CHANNEL_LABEL};

use crate::channel::{
    ChannelHandle, Generation, PeerConnection, PeerConnectionFactory, Role, RtcEvent, RtcEventKind,
};
use crate::error::{Result, TransportError};

/// The two open data channels of a connected session.
#[derive(Clone)]
pub struct ChannelSet {
    pub messages: ChannelHandle,
    pub files: ChannelHandle,
}

impl std::fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSet")
            .field("messages", &self.messages.label())
            .field("files", &self.files.label())
            .finish()
    }
}

/// Remote candidates received before the remote description, oldest first.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
    dropped: usize,
}

impl PendingCandidates {
    fn push(&mut self, candidate: IceCandidate, limit: usize) {
        if limit == 0 {
            self.dropped += 1;
            return;
        }
        while self.queue.len() >= limit {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Candidates evicted because the queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[derive(Debug)]
pub enum ConnectionState {
    Disconnected,
    Negotiating {
        generation: Generation,
    },
    AwaitingRemoteDescription {
        generation: Generation,
        pending_candidates: PendingCandidates,
    },
    Connected {
        generation: Generation,
        channel: ChannelSet,
    },
    Failed {
        reason: String,
    },
}

impl ConnectionState {
    pub fn generation(&self) -> Option<Generation> {
        match self {
            Self::Negotiating { generation }
            | Self::AwaitingRemoteDescription { generation, .. }
            | Self::Connected { generation, .. } => Some(*generation),
            Self::Disconnected | Self::Failed { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Negotiating { .. } => "negotiating",
            Self::AwaitingRemoteDescription { .. } => "awaiting_remote_description",
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What a current-generation connection event means for the session.
#[derive(Debug)]
pub enum NegotiatorEvent {
    Connected(ChannelSet),
    Frame { label: String, data: Bytes },
    Failed(String),
    Disconnected,
}

#[derive(Default)]
struct OpeningChannels {
    messages: Option<ChannelHandle>,
    files: Option<ChannelHandle>,
}

pub struct ConnectionNegotiator {
    peer_code: String,
    factory: Arc<dyn PeerConnectionFactory>,
    events: mpsc::UnboundedSender<RtcEvent>,
    signals: mpsc::Sender<SignalMessage>,
    max_pending_candidates: usize,
    last_generation: u64,
    state: ConnectionState,
    connection: Option<Arc<dyn PeerConnection>>,
    opening: OpeningChannels,
}

impl ConnectionNegotiator {
    pub fn new(
        peer_code: impl Into<String>,
        factory: Arc<dyn PeerConnectionFactory>,
        events: mpsc::UnboundedSender<RtcEvent>,
        signals: mpsc::Sender<SignalMessage>,
        max_pending_candidates: usize,
    ) -> Self {
        Self {
            peer_code: peer_code.into(),
            factory,
            events,
            signals,
            max_pending_candidates,
            last_generation: 0,
            state: ConnectionState::Disconnected,
            connection: None,
            opening: OpeningChannels::default(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn generation(&self) -> Option<Generation> {
        self.state.generation()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn channels(&self) -> Option<&ChannelSet> {
        match &self.state {
            ConnectionState::Connected { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Start a new attempt as the offering side.
    pub async fn start_as_initiator(&mut self) -> Result<Generation> {
        self.teardown().await;
        let generation = self.mint();
        self.state = ConnectionState::Negotiating { generation };
        info!(peer = %self.peer_code, %generation, "starting negotiation as initiator");

        let result = self.offer(generation).await;
        self.fail_on_error(result).await?;
        Ok(generation)
    }

    async fn offer(&mut self, generation: Generation) -> Result<()> {
        let connection = self
            .factory
            .create(generation, Role::Initiator, self.events.clone())
            .await?;
        self.connection = Some(connection.clone());

        let sdp = connection.create_offer().await?;
        self.signal(SignalMessage::offer(&self.peer_code, sdp)).await?;
        self.state = ConnectionState::AwaitingRemoteDescription {
            generation,
            pending_candidates: PendingCandidates::default(),
        };
        Ok(())
    }

    /// Wait for the peer's offer. Candidates arriving from now on are queued.
    pub async fn prepare_responder(&mut self) -> Generation {
        self.discard_connection().await;
        let generation = self.mint();
        self.state = ConnectionState::AwaitingRemoteDescription {
            generation,
            pending_candidates: PendingCandidates::default(),
        };
        debug!(peer = %self.peer_code, %generation, "awaiting remote offer");
        generation
    }

    pub async fn handle_remote_offer(&mut self, sdp: String) -> Result<()> {
        let (generation, pending) = match std::mem::replace(&mut self.state, ConnectionState::Disconnected) {
            ConnectionState::AwaitingRemoteDescription {
                generation,
                pending_candidates,
            } if self.connection.is_none() => (generation, pending_candidates),
            previous => {
                // Renegotiation: the peer restarted, so does this side.
                info!(peer = %self.peer_code, state = previous.name(), "remote offer restarts negotiation");
                self.state = previous;
                self.teardown().await;
                (self.mint(), PendingCandidates::default())
            }
        };
        self.state = ConnectionState::Negotiating { generation };

        let result = self.answer(generation, sdp, pending).await;
        self.fail_on_error(result).await
    }

    async fn answer(&mut self, generation: Generation, sdp: String, pending: PendingCandidates) -> Result<()> {
        let connection = self
            .factory
            .create(generation, Role::Responder, self.events.clone())
            .await?;
        self.connection = Some(connection.clone());

        let answer = connection.accept_offer(sdp).await?;
        self.signal(SignalMessage::answer(&self.peer_code, answer)).await?;
        self.flush(connection.as_ref(), pending).await;
        Ok(())
    }

    pub async fn handle_remote_answer(&mut self, sdp: String) -> Result<()> {
        let connection = match (&self.state, &self.connection) {
            (ConnectionState::AwaitingRemoteDescription { .. }, Some(connection)) => connection.clone(),
            _ => {
                warn!(peer = %self.peer_code, state = self.state.name(), "unexpected answer ignored");
                return Ok(());
            }
        };
        let ConnectionState::AwaitingRemoteDescription {
            generation,
            pending_candidates,
        } = std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        else {
            return Ok(());
        };
        self.state = ConnectionState::Negotiating { generation };

        let result = connection.set_remote_answer(sdp).await;
        self.fail_on_error(result).await?;
        self.flush(connection.as_ref(), pending_candidates).await;
        Ok(())
    }

    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        let limit = self.max_pending_candidates;
        let state_name = self.state.name();
        match (&mut self.state, &self.connection) {
            (ConnectionState::AwaitingRemoteDescription { pending_candidates, .. }, _) => {
                pending_candidates.push(candidate, limit);
            }
            (ConnectionState::Negotiating { .. } | ConnectionState::Connected { .. }, Some(connection)) => {
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    debug!(peer = %self.peer_code, "remote candidate discarded: {}", e);
                }
            }
            _ => debug!(peer = %self.peer_code, state = state_name, "remote candidate dropped"),
        }
    }

    /// Apply queued candidates in arrival order; failures are discarded.
    async fn flush(&self, connection: &dyn PeerConnection, pending: PendingCandidates) {
        if pending.dropped > 0 {
            warn!(peer = %self.peer_code, dropped = pending.dropped, "pending candidate queue overflowed");
        }
        for candidate in pending.queue {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                debug!(peer = %self.peer_code, "queued candidate discarded: {}", e);
            }
        }
    }

    /// Filter a connection event by generation and fold it into the state.
    pub async fn handle_event(&mut self, event: RtcEvent) -> Option<NegotiatorEvent> {
        let current = self.generation();
        if current != Some(event.generation) {
            debug!(
                peer = %self.peer_code,
                event_generation = %event.generation,
                current = ?current,
                "stale connection event ignored"
            );
            return None;
        }
        let generation = event.generation;

        match event.kind {
            RtcEventKind::LocalCandidate(candidate) => {
                if let Err(e) = self.signal(SignalMessage::ice_candidate(&self.peer_code, candidate)).await {
                    warn!(peer = %self.peer_code, "failed to forward local candidate: {}", e);
                }
                None
            }
            RtcEventKind::ChannelOpen(channel) => {
                let label = channel.label().to_string();
                match label.as_str() {
                    MESSAGE_CHANNEL_LABEL => self.opening.messages = Some(channel),
                    FILE_CHANNEL_LABEL => self.opening.files = Some(channel),
                    other => {
                        warn!(peer = %self.peer_code, label = other, "closing unexpected data channel");
                        channel.close().await;
                        return None;
                    }
                }
                if self.is_connected() {
                    return None;
                }
                let (Some(messages), Some(files)) = (self.opening.messages.clone(), self.opening.files.clone())
                else {
                    return None;
                };
                let channel = ChannelSet { messages, files };
                self.state = ConnectionState::Connected {
                    generation,
                    channel: channel.clone(),
                };
                info!(peer = %self.peer_code, %generation, "data channels open");
                Some(NegotiatorEvent::Connected(channel))
            }
            RtcEventKind::Frame { label, data } => Some(NegotiatorEvent::Frame { label, data }),
            RtcEventKind::ConnectionFailed(reason) => {
                warn!(peer = %self.peer_code, %generation, %reason, "connection failed");
                self.discard_connection().await;
                self.state = ConnectionState::Failed { reason: reason.clone() };
                Some(NegotiatorEvent::Failed(reason))
            }
            RtcEventKind::Disconnected => {
                info!(peer = %self.peer_code, %generation, "connection lost");
                self.close().await;
                Some(NegotiatorEvent::Disconnected)
            }
        }
    }

    /// Invalidate the generation, drop queued candidates and release the
    /// connection.
    pub async fn close(&mut self) {
        self.teardown().await;
        self.state = ConnectionState::Disconnected;
    }

    fn mint(&mut self) -> Generation {
        self.last_generation += 1;
        Generation(self.last_generation)
    }

    async fn signal(&self, message: SignalMessage) -> Result<()> {
        self.signals
            .send(message)
            .await
            .map_err(|_| TransportError::signaling("relay connection closed"))
    }

    async fn fail_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(peer = %self.peer_code, "negotiation failed: {}", e);
            self.discard_connection().await;
            self.state = ConnectionState::Failed { reason: e.to_string() };
        }
        result.map_err(|e| match e {
            TransportError::NegotiationFailed(_) => e,
            other => TransportError::NegotiationFailed(other.to_string()),
        })
    }

    async fn teardown(&mut self) {
        self.discard_connection().await;
        self.state = ConnectionState::Disconnected;
    }

    async fn discard_connection(&mut self) {
        let opening = std::mem::take(&mut self.opening);
        for channel in [opening.messages, opening.files].into_iter().flatten() {
            channel.close().await;
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn negotiator(
        network: &MemoryNetwork,
        max_pending: usize,
    ) -> (
        ConnectionNegotiator,
        mpsc::UnboundedReceiver<RtcEvent>,
        mpsc::Receiver<SignalMessage>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::channel(64);
        let n = ConnectionNegotiator::new(
            "PEER42",
            Arc::new(network.clone()),
            events_tx,
            signals_tx,
            max_pending,
        );
        (n, events_rx, signals_rx)
    }

    #[test]
    fn pending_queue_drops_oldest() {
        let mut pending = PendingCandidates::default();
        for n in 0..5 {
            pending.push(candidate(n), 3);
        }
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.dropped(), 2);
        let kept: Vec<_> = pending.queue.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(kept, vec![candidate(2).candidate, candidate(3).candidate, candidate(4).candidate]);
    }

    #[tokio::test]
    async fn initiator_awaits_answer_after_offer() {
        let network = MemoryNetwork::new();
        let (mut n, _events, mut signals) = negotiator(&network, 8);

        let generation = n.start_as_initiator().await.unwrap();
        assert_eq!(generation, Generation(1));
        assert!(matches!(n.state(), ConnectionState::AwaitingRemoteDescription { .. }));
        let offer = signals.recv().await.unwrap();
        assert!(matches!(offer, SignalMessage::Offer { target: Some(ref t), .. } if t == "PEER42"));
    }

    #[tokio::test]
    async fn candidates_queue_until_remote_description() {
        let network = MemoryNetwork::new();
        let (mut n, _events, _signals) = negotiator(&network, 8);
        n.prepare_responder().await;

        n.handle_remote_candidate(candidate(1)).await;
        n.handle_remote_candidate(candidate(2)).await;
        n.handle_remote_candidate(candidate(3)).await;
        match n.state() {
            ConnectionState::AwaitingRemoteDescription { pending_candidates, .. } => {
                assert_eq!(pending_candidates.len(), 3)
            }
            other => panic!("unexpected state {other:?}"),
        }

        // A remote offer from an initiator on the same network
        let (mut offerer, _e, mut offerer_signals) = negotiator(&network, 8);
        offerer.start_as_initiator().await.unwrap();
        let SignalMessage::Offer { sdp, .. } = offerer_signals.recv().await.unwrap() else {
            panic!("expected offer");
        };

        n.handle_remote_offer(sdp).await.unwrap();
        assert!(matches!(n.state(), ConnectionState::Negotiating { .. }));

        let responder = network
            .peers()
            .into_iter()
            .find(|p| p.role() == Role::Responder)
            .unwrap();
        let applied: Vec<_> = responder.remote_candidates().into_iter().map(|c| c.candidate).collect();
        assert_eq!(
            applied,
            vec![candidate(1).candidate, candidate(2).candidate, candidate(3).candidate]
        );
    }

    #[tokio::test]
    async fn failed_queued_candidates_are_discarded() {
        let network = MemoryNetwork::new();
        let (mut n, _events, _signals) = negotiator(&network, 8);
        n.prepare_responder().await;
        n.handle_remote_candidate(candidate(1)).await;
        n.handle_remote_candidate(IceCandidate {
            candidate: String::new(),
            sdp_mid: None,
            sdp_m_line_index: None,
        })
        .await;
        n.handle_remote_candidate(candidate(3)).await;

        let (mut offerer, _e, mut offerer_signals) = negotiator(&network, 8);
        offerer.start_as_initiator().await.unwrap();
        let SignalMessage::Offer { sdp, .. } = offerer_signals.recv().await.unwrap() else {
            panic!("expected offer");
        };
        n.handle_remote_offer(sdp).await.unwrap();

        let responder = network.peers().into_iter().find(|p| p.role() == Role::Responder).unwrap();
        assert_eq!(responder.remote_candidates().len(), 2);
    }

    #[tokio::test]
    async fn candidate_outside_negotiation_is_dropped() {
        let network = MemoryNetwork::new();
        let (mut n, _events, _signals) = negotiator(&network, 8);
        n.handle_remote_candidate(candidate(1)).await;
        assert!(matches!(n.state(), ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn answer_in_wrong_state_is_ignored() {
        let network = MemoryNetwork::new();
        let (mut n, _events, _signals) = negotiator(&network, 8);
        n.handle_remote_answer("memory-answer-x".into()).await.unwrap();
        assert!(matches!(n.state(), ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn bad_answer_fails_attempt() {
        let network = MemoryNetwork::new();
        let (mut n, _events, _signals) = negotiator(&network, 8);
        n.start_as_initiator().await.unwrap();
        let err = n.handle_remote_answer("bogus".into()).await.unwrap_err();
        assert!(matches!(err, TransportError::NegotiationFailed(_)));
        assert!(matches!(n.state(), ConnectionState::Failed { .. }));
        assert_eq!(n.generation(), None);
    }

    #[tokio::test]
    async fn ice_failure_moves_to_failed() {
        let network = MemoryNetwork::new();
        let (mut n, mut events, _signals) = negotiator(&network, 8);
        n.start_as_initiator().await.unwrap();
        // drain the gathered candidate
        let first = events.recv().await.unwrap();
        assert!(n.handle_event(first).await.is_none());

        network.peers()[0].fail("ice failed");
        let event = events.recv().await.unwrap();
        assert!(matches!(n.handle_event(event).await, Some(NegotiatorEvent::Failed(ref r)) if r == "ice failed"));
        assert!(matches!(n.state(), ConnectionState::Failed { .. }));
        assert!(network.peers()[0].is_closed());
    }

    #[tokio::test]
    async fn generations_increase_across_restarts() {
        let network = MemoryNetwork::new();
        let (mut n, _events, _signals) = negotiator(&network, 8);
        let g1 = n.start_as_initiator().await.unwrap();
        n.close().await;
        assert_eq!(n.generation(), None);
        let g2 = n.start_as_initiator().await.unwrap();
        let g3 = n.prepare_responder().await;
        assert!(g1 < g2 && g2 < g3);
    }
}
