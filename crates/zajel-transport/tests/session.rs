use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use zajel_common::config::TransportConfig;
use zajel_common::{SignalMessage, MESSAGE_CHANNEL_LABEL};
use zajel_crypto::{ChannelKind, KeyPair};
use zajel_transport::{DataChannel, MemoryNetwork, Role, Transport, TransportError, TransportEvent};

const ALICE: &str = "ALICE2";
const BOB: &str = "BOB234";

struct Node {
    transport: Transport,
    events: mpsc::Receiver<TransportEvent>,
    signals: Option<mpsc::Receiver<SignalMessage>>,
    receive_dir: PathBuf,
}

fn node(network: &MemoryNetwork, keys: KeyPair) -> Node {
    let receive_dir = std::env::temp_dir().join(format!("zajel-session-{}", uuid::Uuid::new_v4()));
    let mut config = TransportConfig::default();
    config.transfer.receive_dir = receive_dir.clone();
    let (signals_tx, signals_rx) = mpsc::channel(256);
    let (transport, events) = Transport::new(keys, config, Arc::new(network.clone()), signals_tx);
    Node {
        transport,
        events,
        signals: Some(signals_rx),
        receive_dir,
    }
}

/// Forward `from`'s outbound negotiation messages to `to`, stamped with
/// the sender's code the way the relay does.
fn relay(from_code: &'static str, mut outbound: mpsc::Receiver<SignalMessage>, to: Transport) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let from = Some(from_code.to_string());
            let forwarded = match message {
                SignalMessage::Offer { sdp, .. } => SignalMessage::Offer { target: None, from, sdp },
                SignalMessage::Answer { sdp, .. } => SignalMessage::Answer { target: None, from, sdp },
                SignalMessage::IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_m_line_index,
                    ..
                } => SignalMessage::IceCandidate {
                    target: None,
                    from,
                    candidate,
                    sdp_mid,
                    sdp_m_line_index,
                },
                _ => continue,
            };
            to.handle_signal(forwarded).await;
        }
    })
}

async fn next_event(node: &mut Node, mut want: impl FnMut(&TransportEvent) -> bool) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = node.events.recv().await.expect("event stream ended");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_verified(node: &mut Node) -> String {
    match next_event(node, |e| matches!(e, TransportEvent::Verified { .. })).await {
        TransportEvent::Verified { fingerprint, .. } => fingerprint,
        _ => unreachable!(),
    }
}

async fn wait_message(node: &mut Node) -> String {
    match next_event(node, |e| matches!(e, TransportEvent::Message { .. })).await {
        TransportEvent::Message { text, .. } => text,
        _ => unreachable!(),
    }
}

async fn verified_pair(network: &MemoryNetwork) -> (Node, Node, (JoinHandle<()>, JoinHandle<()>)) {
    let mut alice = node(network, KeyPair::generate());
    let mut bob = node(network, KeyPair::generate());
    let bob_key = bob.transport.public_key_base64();
    let relays = pair(&mut alice, &mut bob, bob_key).await;
    wait_verified(&mut alice).await;
    wait_verified(&mut bob).await;
    (alice, bob, relays)
}

/// Pair two nodes the way the relay does after both accepted.
async fn pair(alice: &mut Node, bob: &mut Node, key_for_bob: String) -> (JoinHandle<()>, JoinHandle<()>) {
    let to_bob = relay(ALICE, alice.signals.take().unwrap(), bob.transport.clone());
    let to_alice = relay(BOB, bob.signals.take().unwrap(), alice.transport.clone());

    bob.transport
        .handle_signal(SignalMessage::PairMatched {
            peer_code: ALICE.to_string(),
            peer_public_key: alice.transport.public_key_base64(),
            is_initiator: false,
        })
        .await;
    alice
        .transport
        .handle_signal(SignalMessage::PairMatched {
            peer_code: BOB.to_string(),
            peer_public_key: key_for_bob,
            is_initiator: true,
        })
        .await;
    (to_bob, to_alice)
}

#[tokio::test]
async fn verified_session_carries_messages_and_files() {
    let network = MemoryNetwork::new();
    let mut alice = node(&network, KeyPair::generate());
    let mut bob = node(&network, KeyPair::generate());
    let bob_key = bob.transport.public_key_base64();
    let _relays = pair(&mut alice, &mut bob, bob_key).await;

    assert_eq!(wait_verified(&mut alice).await, bob.transport.fingerprint());
    assert_eq!(wait_verified(&mut bob).await, alice.transport.fingerprint());
    assert_eq!(
        alice.transport.safety_number(BOB).unwrap(),
        bob.transport.safety_number(ALICE).unwrap()
    );
    assert_eq!(alice.transport.verify_fingerprint(BOB).unwrap(), bob.transport.fingerprint());

    alice.transport.send_message(BOB, "hello bob").await.unwrap();
    let event = next_event(&mut bob, |e| matches!(e, TransportEvent::Message { .. })).await;
    assert!(matches!(event, TransportEvent::Message { peer, text } if peer == ALICE && text == "hello bob"));

    let data: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
    let file_id = alice
        .transport
        .send_bytes(BOB, "holiday.png", data.clone())
        .await
        .unwrap();

    let event = next_event(&mut bob, |e| matches!(e, TransportEvent::TransferComplete { .. })).await;
    let TransportEvent::TransferComplete { file_id: id, path, .. } = event else {
        unreachable!()
    };
    assert_eq!(id, file_id);
    assert_eq!(std::fs::read(path.unwrap()).unwrap(), data);
    next_event(&mut alice, |e| {
        matches!(e, TransportEvent::TransferComplete { file_id: id, .. } if *id == file_id)
    })
    .await;

    let stats = alice.transport.session_stats(BOB).await.unwrap();
    assert!(stats.verified);
    assert_eq!(stats.state, "connected");
    assert_eq!(stats.active_transfers, 0);
    assert!(stats.crypto.messages_out > 0);

    alice.transport.close_session(BOB).await.unwrap();
    next_event(&mut alice, |e| matches!(e, TransportEvent::SessionClosed { .. })).await;
    assert!(matches!(
        alice.transport.send_message(BOB, "gone").await,
        Err(TransportError::UnknownPeer(_))
    ));

    bob.transport.shutdown().await;
    let _ = std::fs::remove_dir_all(&bob.receive_dir);
}

#[tokio::test]
async fn reconnect_renegotiates_and_verifies_again() {
    let network = MemoryNetwork::new();
    let mut alice = node(&network, KeyPair::generate());
    let mut bob = node(&network, KeyPair::generate());
    let bob_key = bob.transport.public_key_base64();
    let _relays = pair(&mut alice, &mut bob, bob_key).await;
    wait_verified(&mut alice).await;
    wait_verified(&mut bob).await;

    let generation = alice.transport.reconnect(BOB).await.unwrap();
    assert!(generation.0 > 1);
    wait_verified(&mut alice).await;
    wait_verified(&mut bob).await;

    bob.transport.send_message(ALICE, "still here").await.unwrap();
    let event = next_event(&mut alice, |e| matches!(e, TransportEvent::Message { .. })).await;
    assert!(matches!(event, TransportEvent::Message { text, .. } if text == "still here"));

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn handshake_with_unexpected_key_is_refused() {
    let network = MemoryNetwork::new();
    let mut alice = node(&network, KeyPair::generate());
    let mut bob = node(&network, KeyPair::generate());
    // The relay vouched for a different key than the one bob holds.
    let impostor = KeyPair::generate().public_key_base64();
    let _relays = pair(&mut alice, &mut bob, impostor).await;

    let alert = next_event(&mut alice, |e| matches!(e, TransportEvent::SecurityAlert { .. })).await;
    assert!(matches!(
        alert,
        TransportEvent::SecurityAlert {
            error: TransportError::HandshakeKeyMismatch { ref peer },
            ..
        } if peer == BOB
    ));
    next_event(&mut alice, |e| matches!(e, TransportEvent::SessionClosed { peer } if peer == BOB)).await;
    assert!(matches!(
        alice.transport.send_message(BOB, "hi").await,
        Err(TransportError::SessionClosed)
    ));

    bob.transport.shutdown().await;
}

#[tokio::test]
async fn sending_requires_a_verified_session() {
    let network = MemoryNetwork::new();
    let alice = node(&network, KeyPair::generate());
    let bob_key = KeyPair::generate().public_key_base64();

    assert!(matches!(
        alice.transport.send_message(BOB, "hi").await,
        Err(TransportError::UnknownPeer(_))
    ));

    alice
        .transport
        .establish_session(BOB, &bob_key, Role::Initiator)
        .await
        .unwrap();
    assert!(matches!(
        alice.transport.send_message(BOB, "hi").await,
        Err(TransportError::NotReady(_))
    ));
    assert!(matches!(
        alice.transport.send_bytes(BOB, "a.txt", b"abc".to_vec()).await,
        Err(TransportError::NotReady(_))
    ));
    assert!(matches!(
        alice.transport.establish_session(BOB, "not base64!", Role::Initiator).await,
        Err(TransportError::Crypto(_))
    ));

    alice.transport.shutdown().await;
}

#[tokio::test]
async fn reconnect_after_failed_connection_delivers_messages() {
    let network = MemoryNetwork::new();
    let (mut alice, mut bob, _relays) = verified_pair(&network).await;

    for i in 0..100 {
        alice.transport.send_message(BOB, &format!("msg {i}")).await.unwrap();
    }
    for i in 0..100 {
        assert_eq!(wait_message(&mut bob).await, format!("msg {i}"));
    }

    let responder = network
        .peers()
        .into_iter()
        .find(|p| p.role() == Role::Responder)
        .unwrap();
    responder.fail("ice failed");
    next_event(&mut bob, |e| matches!(e, TransportEvent::StateChanged { state: "failed", .. })).await;

    alice.transport.reconnect(BOB).await.unwrap();
    wait_verified(&mut alice).await;
    wait_verified(&mut bob).await;

    alice.transport.send_message(BOB, "after reconnect").await.unwrap();
    assert_eq!(wait_message(&mut bob).await, "after reconnect");
    let stats = bob.transport.session_stats(ALICE).await.unwrap();
    assert_eq!(stats.crypto.replays_rejected, 0);

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn exhausted_send_counter_renegotiates() {
    let network = MemoryNetwork::new();
    let (mut alice, mut bob, _relays) = verified_pair(&network).await;
    let before = alice.transport.session_stats(BOB).await.unwrap().generation.unwrap();

    alice
        .transport
        .fast_forward_send_counter(BOB, ChannelKind::Text, u32::MAX)
        .await
        .unwrap();
    wait_verified(&mut alice).await;
    wait_verified(&mut bob).await;

    let after = alice.transport.session_stats(BOB).await.unwrap().generation.unwrap();
    assert!(after > before);
    alice.transport.send_message(BOB, "new key").await.unwrap();
    assert_eq!(wait_message(&mut bob).await, "new key");

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn frame_from_previous_connection_is_rejected() {
    let network = MemoryNetwork::new();
    let (mut alice, mut bob, _relays) = verified_pair(&network).await;

    alice.transport.send_message(BOB, "first connection").await.unwrap();
    assert_eq!(wait_message(&mut bob).await, "first connection");
    let first = network
        .peers()
        .into_iter()
        .find(|p| p.role() == Role::Initiator)
        .unwrap();
    let old_frame: Bytes = first
        .channel(MESSAGE_CHANNEL_LABEL)
        .unwrap()
        .sent_frames()
        .into_iter()
        .rev()
        .find(|f| f.windows(9).any(|w| w == b"\"message\""))
        .unwrap();

    alice.transport.reconnect(BOB).await.unwrap();
    wait_verified(&mut alice).await;
    wait_verified(&mut bob).await;
    let before = bob.transport.session_stats(ALICE).await.unwrap();

    let current = network
        .peers()
        .into_iter()
        .filter(|p| p.role() == Role::Initiator)
        .last()
        .unwrap();
    current
        .channel(MESSAGE_CHANNEL_LABEL)
        .unwrap()
        .send(old_frame)
        .await
        .unwrap();
    alice.transport.send_message(BOB, "fresh").await.unwrap();
    assert_eq!(wait_message(&mut bob).await, "fresh");

    let after = bob.transport.session_stats(ALICE).await.unwrap();
    assert_eq!(after.crypto.auth_failures, before.crypto.auth_failures + 1);
    assert_eq!(after.frames_dropped, before.frames_dropped + 1);

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn pair_match_with_changed_key_is_refused() {
    let network = MemoryNetwork::new();
    let mut alice = node(&network, KeyPair::generate());
    let announced = KeyPair::generate().public_key_base64();

    alice
        .transport
        .handle_signal(SignalMessage::PairIncoming {
            from_code: BOB.to_string(),
            from_public_key: announced,
            proposed_name: None,
        })
        .await;
    alice.transport.respond_pair(BOB, true).await.unwrap();
    alice
        .transport
        .handle_signal(SignalMessage::PairMatched {
            peer_code: BOB.to_string(),
            peer_public_key: KeyPair::generate().public_key_base64(),
            is_initiator: false,
        })
        .await;

    let alert = next_event(&mut alice, |e| matches!(e, TransportEvent::SecurityAlert { .. })).await;
    assert!(matches!(
        alert,
        TransportEvent::SecurityAlert {
            error: TransportError::PairKeyMismatch { ref peer },
            ..
        } if peer == BOB
    ));
    assert!(matches!(
        alice.transport.send_message(BOB, "hi").await,
        Err(TransportError::UnknownPeer(_))
    ));

    alice.transport.shutdown().await;
}
