//! webrtc-rs implementation of the connection capabilities.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use zajel_common::{IceCandidate, FILE_CHANNEL_LABEL, MESSAGE_CHANNEL_LABEL};

use crate::channel::{
    emit, ChannelHandle, DataChannel, Generation, PeerConnection, PeerConnectionFactory, Role,
    RtcEvent, RtcEventKind,
};
use crate::error::{Result, TransportError};

fn rtc_err(e: webrtc::Error) -> TransportError {
    TransportError::negotiation(e)
}

pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(rtc_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        generation: Generation,
        role: Role,
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(rtc_err)?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emit(
                        &tx,
                        generation,
                        RtcEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }),
                    ),
                    Err(e) => warn!(%generation, "failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(%generation, "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(%generation, "WebRTC connection failed");
                        emit(&tx, generation, RtcEventKind::ConnectionFailed("ICE connection failed".into()));
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(%generation, "WebRTC transient disconnect (ICE may recover)");
                    }
                    RTCPeerConnectionState::Closed => {
                        emit(&tx, generation, RtcEventKind::Disconnected);
                    }
                    _ => {}
                }
            })
        }));

        match role {
            Role::Initiator => {
                for label in [MESSAGE_CHANNEL_LABEL, FILE_CHANNEL_LABEL] {
                    let dc = pc
                        .create_data_channel(
                            label,
                            Some(RTCDataChannelInit {
                                ordered: Some(true),
                                ..Default::default()
                            }),
                        )
                        .await
                        .map_err(rtc_err)?;
                    attach_channel(dc, generation, events.clone()).await;
                }
            }
            Role::Responder => {
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let events = events.clone();
                    Box::pin(async move {
                        attach_channel(dc, generation, events).await;
                    })
                }));
            }
        }

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

/// Wire `dc` callbacks into the event queue. The open event may be reported
/// twice (callback and immediate check); the negotiator tolerates that.
async fn attach_channel(dc: Arc<RTCDataChannel>, generation: Generation, events: mpsc::UnboundedSender<RtcEvent>) {
    let channel = Arc::new(WebRtcChannel::new(dc.clone()).await);
    let label = dc.label().to_string();
    debug!(%generation, %label, "data channel attached");

    let tx = events.clone();
    let frame_label = label.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        let label = frame_label.clone();
        Box::pin(async move {
            emit(&tx, generation, RtcEventKind::Frame { label, data: msg.data });
        })
    }));

    let tx = events.clone();
    let opened = channel.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            emit(&tx, generation, RtcEventKind::ChannelOpen(opened as ChannelHandle));
        })
    }));

    if dc.ready_state() == RTCDataChannelState::Open {
        emit(&events, generation, RtcEventKind::ChannelOpen(channel as ChannelHandle));
    }
}

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    drained: Arc<Notify>,
}

impl WebRtcChannel {
    async fn new(dc: Arc<RTCDataChannel>) -> Self {
        let drained = Arc::new(Notify::new());
        let notify = drained.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify.notify_waiters();
            })
        }))
        .await;
        Self { dc, drained }
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::protocol(format!("data channel send failed: {e}")))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn wait_buffered_below(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
        loop {
            // Registered before the check so a drain in between is not missed.
            let notified = self.drained.notified();
            if self.dc.buffered_amount().await < threshold
                || self.dc.ready_state() != RTCDataChannelState::Open
            {
                return;
            }
            notified.await;
        }
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(label = %self.dc.label(), "data channel close: {}", e);
        }
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp).map_err(rtc_err)?;
        self.pc.set_remote_description(offer).await.map_err(rtc_err)?;
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(answer.sdp)
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp).map_err(rtc_err)?;
        self.pc.set_remote_description(answer).await.map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await
            .map_err(rtc_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("peer connection close: {}", e);
        }
    }
}
