//! Relay (signaling server) client and per-peer message routing.
//!
//! One WebSocket per process. Outbound messages are queued on an mpsc
//! channel and survive reconnects; the connection task re-registers after
//! every reconnect. Inbound negotiation messages are dispatched to peer
//! tasks through a [`SignalRouter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::connect_async_with_config;
use tracing::{debug, error, info, warn};

use zajel_common::config::SignalingConfig;
use zajel_common::helpers::env_bool;
use zajel_common::{SignalMessage, MAX_MESSAGE_SIZE};

use crate::error::{Result, TransportError};

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;
const ROUTE_QUEUE: usize = 32;

fn is_insecure_signaling_url(url: &str) -> bool {
    url.trim().to_ascii_lowercase().starts_with("ws://")
}

/// Reject malformed relay URLs, and `ws://` in production unless
/// `ZAJEL_ALLOW_INSECURE_SIGNALING` is set.
pub fn validate_signaling_url(url: &str) -> Result<()> {
    let lower = url.trim().to_ascii_lowercase();
    if !lower.starts_with("ws://") && !lower.starts_with("wss://") {
        return Err(TransportError::signaling(format!(
            "relay URL must start with ws:// or wss://: {url}"
        )));
    }
    let production = env_bool("ZAJEL_ENVIRONMENT_PRODUCTION", false)
        || std::env::var("ZAJEL_ENVIRONMENT")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);
    let allow_insecure = env_bool("ZAJEL_ALLOW_INSECURE_SIGNALING", false);
    if is_insecure_signaling_url(url) && production && !allow_insecure {
        return Err(TransportError::signaling(
            "refusing insecure ws:// relay URL in production; use wss:// or set ZAJEL_ALLOW_INSECURE_SIGNALING=1",
        ));
    }
    Ok(())
}

/// Identity announced to the relay on every (re)connect.
#[derive(Debug, Clone)]
pub struct Registration {
    pub pairing_code: String,
    pub public_key: String,
}

/// Handle to the background relay connection.
pub struct RelayClient {
    outbound: mpsc::Sender<SignalMessage>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Spawn the connection task. Returns the client and the stream of
    /// inbound relay messages.
    pub fn spawn(
        url: String,
        registration: Registration,
        config: &SignalingConfig,
    ) -> Result<(Self, mpsc::Receiver<SignalMessage>)> {
        validate_signaling_url(&url)?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let settings = RelaySettings {
            url,
            registration,
            heartbeat: config.heartbeat_interval(),
            reconnect_initial: config.reconnect_initial(),
            reconnect_max: config.reconnect_max(),
        };
        let task = tokio::spawn(run_relay(settings, outbound_rx, inbound_tx));
        Ok((
            Self {
                outbound: outbound_tx,
                task,
            },
            inbound_rx,
        ))
    }

    pub fn sender(&self) -> mpsc::Sender<SignalMessage> {
        self.outbound.clone()
    }

    pub async fn send(&self, message: SignalMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::signaling("relay task stopped"))
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct RelaySettings {
    url: String,
    registration: Registration,
    heartbeat: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

enum SessionEnd {
    /// Socket dropped; reconnect.
    Lost,
    /// All handles dropped; stop.
    Shutdown,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.next = self.initial;
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    }
}

async fn run_relay(
    settings: RelaySettings,
    mut outbound: mpsc::Receiver<SignalMessage>,
    inbound: mpsc::Sender<SignalMessage>,
) {
    let mut backoff = Backoff::new(settings.reconnect_initial, settings.reconnect_max);

    loop {
        match connect_async_with_config(settings.url.as_str(), Some(ws_config()), false).await {
            Ok((ws_stream, _)) => {
                info!("Connected to relay: {}", settings.url);
                backoff.reset();
                match relay_session(ws_stream, &settings, &mut outbound, &inbound).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost => warn!("relay connection lost"),
                }
            }
            Err(e) => warn!("relay connect failed: {}", e),
        }

        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "reconnecting to relay");
        tokio::time::sleep(delay).await;
    }
}

async fn relay_session<S>(
    ws_stream: S,
    settings: &RelaySettings,
    outbound: &mut mpsc::Receiver<SignalMessage>,
    inbound: &mpsc::Sender<SignalMessage>,
) -> SessionEnd
where
    S: futures_util::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    let register = SignalMessage::Register {
        pairing_code: settings.registration.pairing_code.clone(),
        public_key: settings.registration.public_key.clone(),
    };
    if let Err(e) = send_signal(&mut write, &register).await {
        warn!("failed to register with relay: {}", e);
        return SessionEnd::Lost;
    }

    let mut heartbeat = tokio::time::interval(settings.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                };
                if let Err(e) = send_signal(&mut write, &message).await {
                    error!("Failed to send signaling message: {}", e);
                    return SessionEnd::Lost;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let signal = match SignalMessage::decode(&text) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("Failed to parse signaling message: {}", e);
                                continue;
                            }
                        };
                        match signal {
                            SignalMessage::Pong => debug!("relay pong"),
                            SignalMessage::Ping => {
                                if send_signal(&mut write, &SignalMessage::Pong).await.is_err() {
                                    return SessionEnd::Lost;
                                }
                            }
                            other => {
                                if inbound.send(other).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Signaling WebSocket error: {}", e);
                        return SessionEnd::Lost;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if send_signal(&mut write, &SignalMessage::Ping).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
        }
    }
}

async fn send_signal<W>(write: &mut W, message: &SignalMessage) -> Result<()>
where
    W: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = message.encode()?;
    write
        .send(WsMessage::Text(text))
        .await
        .map_err(TransportError::signaling)
}

struct Route {
    id: u64,
    tx: mpsc::Sender<SignalMessage>,
}

#[derive(Default)]
struct RouterInner {
    next_id: AtomicU64,
    routes: Mutex<HashMap<String, Route>>,
}

impl RouterInner {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Dispatches relay-forwarded negotiation messages to the single live
/// subscription for the sending peer.
#[derive(Clone, Default)]
pub struct SignalRouter {
    inner: Arc<RouterInner>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any existing subscription for `peer_code`. The old route is
    /// removed before the new one is installed, so two subscriptions are
    /// never live together.
    pub fn subscribe(&self, peer_code: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(ROUTE_QUEUE);
        let mut routes = self.inner.routes();
        if routes.remove(peer_code).is_some() {
            debug!(peer = %peer_code, "previous signal subscription cancelled");
        }
        routes.insert(peer_code.to_string(), Route { id, tx });
        Subscription {
            peer_code: peer_code.to_string(),
            id,
            router: self.inner.clone(),
            rx,
        }
    }

    /// Deliver `message` to the subscriber for `peer_code`, waiting for
    /// queue space. Returns the message back when nobody is subscribed or
    /// the subscription went away.
    pub async fn route(&self, peer_code: &str, message: SignalMessage) -> std::result::Result<(), SignalMessage> {
        let tx = match self.inner.routes().get(peer_code) {
            Some(route) => route.tx.clone(),
            None => return Err(message),
        };
        tx.send(message).await.map_err(|e| e.0)
    }

    pub fn is_subscribed(&self, peer_code: &str) -> bool {
        self.inner.routes().contains_key(peer_code)
    }
}

/// Receiving end of one peer's routed messages. Unsubscribes on drop if it
/// is still the current subscription.
pub struct Subscription {
    peer_code: String,
    id: u64,
    router: Arc<RouterInner>,
    rx: mpsc::Receiver<SignalMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }

    pub fn peer_code(&self) -> &str {
        &self.peer_code
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut routes = self.router.routes();
        if routes.get(&self.peer_code).map(|r| r.id) == Some(self.id) {
            routes.remove(&self.peer_code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(from: &str) -> SignalMessage {
        SignalMessage::Offer {
            target: None,
            from: Some(from.to_string()),
            sdp: "v=0".into(),
        }
    }

    #[tokio::test]
    async fn routes_to_current_subscription_only() {
        let router = SignalRouter::new();
        let mut first = router.subscribe("ABC234");
        let mut second = router.subscribe("ABC234");

        router.route("ABC234", offer("ABC234")).await.unwrap();
        assert!(second.recv().await.is_some());
        // first was cancelled: its sender is gone
        assert!(first.recv().await.is_none());
    }

    #[test]
    fn stale_subscription_drop_keeps_replacement() {
        let router = SignalRouter::new();
        let first = router.subscribe("ABC234");
        let _second = router.subscribe("ABC234");
        drop(first);
        assert!(router.is_subscribed("ABC234"));
    }

    #[tokio::test]
    async fn candidate_burst_does_not_drop_the_answer() {
        let router = SignalRouter::new();
        let mut sub = router.subscribe("ABC234");

        let sender = router.clone();
        let burst = tokio::spawn(async move {
            for i in 0..(ROUTE_QUEUE + 8) {
                let candidate = SignalMessage::IceCandidate {
                    target: None,
                    from: Some("ABC234".into()),
                    candidate: format!("candidate:{i}"),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                };
                sender.route("ABC234", candidate).await.unwrap();
            }
            sender
                .route(
                    "ABC234",
                    SignalMessage::Answer {
                        target: None,
                        from: Some("ABC234".into()),
                        sdp: "v=0".into(),
                    },
                )
                .await
                .unwrap();
        });

        let mut kinds = Vec::new();
        while kinds.len() < ROUTE_QUEUE + 9 {
            kinds.push(sub.recv().await.unwrap().kind());
        }
        burst.await.unwrap();
        assert_eq!(kinds.iter().filter(|k| **k == "ice_candidate").count(), ROUTE_QUEUE + 8);
        assert_eq!(kinds.last(), Some(&"answer"));
    }

    #[tokio::test]
    async fn unrouted_message_is_returned() {
        let router = SignalRouter::new();
        let back = router.route("NOPE22", offer("NOPE22")).await.unwrap_err();
        assert_eq!(back.kind(), "offer");

        let sub = router.subscribe("NOPE22");
        drop(sub);
        assert!(!router.is_subscribed("NOPE22"));
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn signaling_url_validation() {
        assert!(validate_signaling_url("wss://signal.example.org/ws").is_ok());
        assert!(validate_signaling_url("https://signal.example.org").is_err());
        assert!(validate_signaling_url("").is_err());
    }
}
