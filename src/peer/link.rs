//! One bidirectional data channel to one peer.
//!
//! The *host* side (the peer that initiated the link) creates a reliable,
//! ordered channel before producing its SDP offer; the *guest* side answers
//! and waits for the channel announcement. Offers, answers, and ICE
//! candidates are relayed opaquely through the server signaling interface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::protocol::{decode_frame, encode_frame, Envelope};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::messages::{ServerConnection, ServerRequest, SignalingMessage};
use crate::now_millis;

/// Label of the single multiplexed data channel.
const CHANNEL_LABEL: &str = "sync";

/// Which side of the link we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// We initiated the link and send the offer.
    Host,
    /// The remote initiated; we answer.
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Init,
    Offering,
    Answering,
    Connected,
    Closed,
}

/// Raised by a link towards the mesh's routing task.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Connected {
        peer_id: String,
    },
    Disconnected {
        peer_id: String,
    },
    Frame {
        peer_id: String,
        envelope: Envelope,
        received_at: i64,
    },
}

pub struct PeerLink {
    peer_id: String,
    role: PeerRole,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    /// Candidates that arrived before the remote description; drained FIFO
    /// right after `set_remote_description`.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_described: AtomicBool,
    state: Arc<Mutex<LinkState>>,
    server: Arc<dyn ServerConnection>,
    events: mpsc::Sender<LinkEvent>,
}

impl PeerLink {
    /// Build the underlying peer connection and install its callbacks. The
    /// host side must call [`PeerLink::open`] afterwards to start the offer.
    pub async fn new(
        peer_id: &str,
        role: PeerRole,
        ice_servers: Vec<RTCIceServer>,
        server: Arc<dyn ServerConnection>,
        events: mpsc::Sender<LinkEvent>,
    ) -> CoordinatorResult<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let state = Arc::new(Mutex::new(LinkState::Init));

        let link = Arc::new(Self {
            peer_id: peer_id.to_string(),
            role,
            pc,
            channel: Arc::new(Mutex::new(None)),
            pending_candidates: Mutex::new(Vec::new()),
            remote_described: AtomicBool::new(false),
            state,
            server,
            events,
        });

        // Gathered candidates are relayed to the remote through the server.
        let relay_server = link.server.clone();
        let to = link.peer_id.clone();
        link.pc.on_ice_candidate(Box::new(move |candidate| {
            let server = relay_server.clone();
            let to = to.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("dropping unserializable ICE candidate: {}", e);
                        return;
                    }
                };
                let payload = SignalingMessage {
                    to,
                    ice_candidate: serde_json::to_value(&init).ok(),
                    ..Default::default()
                };
                if let Err(e) = server.send(ServerRequest::Webrtc(payload)).await {
                    warn!("failed to relay ICE candidate: {}", e);
                }
            })
        }));

        let state = link.state.clone();
        let events = link.events.clone();
        let peer = link.peer_id.clone();
        link.pc
            .on_peer_connection_state_change(Box::new(move |pc_state| {
                let state = state.clone();
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    debug!("peer {} connection state: {}", peer, pc_state);
                    if matches!(
                        pc_state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        Self::signal_closed(&state, &events, &peer).await;
                    }
                })
            }));

        // The guest learns about the channel from the host's offer.
        if role == PeerRole::Guest {
            let slot = link.channel.clone();
            let state = link.state.clone();
            let events = link.events.clone();
            let peer = link.peer_id.clone();
            link.pc.on_data_channel(Box::new(move |dc| {
                let slot = slot.clone();
                let state = state.clone();
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    if dc.label() == CHANNEL_LABEL {
                        Self::attach_channel(&slot, &state, &events, &peer, dc);
                    } else {
                        warn!(
                            "peer {} announced unexpected channel {:?}",
                            peer,
                            dc.label()
                        );
                    }
                })
            }));
        }

        Ok(link)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Host side only: create the channel, produce the offer, and relay it.
    pub async fn open(&self) -> CoordinatorResult<()> {
        let dc = self
            .pc
            .create_data_channel(
                CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Self::attach_channel(&self.channel, &self.state, &self.events, &self.peer_id, dc);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        *self.state.lock() = LinkState::Offering;

        self.relay(SignalingMessage {
            to: self.peer_id.clone(),
            offer: Some(serde_json::to_value(&offer)?),
            ..Default::default()
        })
        .await
    }

    /// Apply one relayed signaling artifact from the remote side.
    pub async fn on_signaling(&self, message: SignalingMessage) -> CoordinatorResult<()> {
        if let Some(offer) = message.offer {
            let desc: RTCSessionDescription = serde_json::from_value(offer)?;
            *self.state.lock() = LinkState::Answering;
            self.apply_remote_description(desc).await?;

            let answer = self.pc.create_answer(None).await?;
            self.pc.set_local_description(answer.clone()).await?;
            self.relay(SignalingMessage {
                to: self.peer_id.clone(),
                answer: Some(serde_json::to_value(&answer)?),
                ..Default::default()
            })
            .await?;
        } else if let Some(answer) = message.answer {
            let desc: RTCSessionDescription = serde_json::from_value(answer)?;
            self.apply_remote_description(desc).await?;
        } else if let Some(candidate) = message.ice_candidate {
            let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
            if self.remote_described.load(Ordering::Acquire) {
                self.pc.add_ice_candidate(init).await?;
            } else {
                self.pending_candidates.lock().push(init);
            }
        } else {
            debug!("empty signaling message from peer {}", self.peer_id);
        }
        Ok(())
    }

    /// Send one frame. Failures are reported to the caller; the mesh logs
    /// and drops.
    pub async fn send(&self, envelope: &Envelope) -> CoordinatorResult<()> {
        let dc = self.channel.lock().clone();
        let Some(dc) = dc else {
            return Err(CoordinatorError::PeerLink(format!(
                "no open channel to peer {}",
                self.peer_id
            )));
        };
        dc.send(&Bytes::from(encode_frame(envelope))).await?;
        Ok(())
    }

    pub async fn close(&self) {
        Self::signal_closed(&self.state, &self.events, &self.peer_id).await;
        if let Err(e) = self.pc.close().await {
            debug!("closing link to peer {}: {}", self.peer_id, e);
        }
    }

    async fn apply_remote_description(
        &self,
        desc: RTCSessionDescription,
    ) -> CoordinatorResult<()> {
        self.pc.set_remote_description(desc).await?;
        self.remote_described.store(true, Ordering::Release);

        let queued: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock());
        for init in queued {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(
                    "queued ICE candidate for peer {} rejected: {}",
                    self.peer_id, e
                );
            }
        }
        Ok(())
    }

    /// Store the channel and install its handlers. Shared by the host
    /// (which created the channel) and the guest (which was announced it).
    fn attach_channel(
        slot: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
        state: &Arc<Mutex<LinkState>>,
        events: &mpsc::Sender<LinkEvent>,
        peer_id: &str,
        dc: Arc<RTCDataChannel>,
    ) {
        *slot.lock() = Some(dc.clone());

        let open_state = state.clone();
        let open_events = events.clone();
        let peer = peer_id.to_string();
        dc.on_open(Box::new(move || {
            let state = open_state.clone();
            let events = open_events.clone();
            let peer = peer.clone();
            Box::pin(async move {
                *state.lock() = LinkState::Connected;
                let _ = events.send(LinkEvent::Connected { peer_id: peer }).await;
            })
        }));

        let close_state = state.clone();
        let close_events = events.clone();
        let peer = peer_id.to_string();
        dc.on_close(Box::new(move || {
            let state = close_state.clone();
            let events = close_events.clone();
            let peer = peer.clone();
            Box::pin(async move {
                Self::signal_closed(&state, &events, &peer).await;
            })
        }));

        let frame_events = events.clone();
        let peer = peer_id.to_string();
        dc.on_message(Box::new(move |msg| {
            let events = frame_events.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let received_at = now_millis();
                match decode_frame(&msg.data) {
                    Ok(envelope) => {
                        let _ = events
                            .send(LinkEvent::Frame {
                                peer_id: peer,
                                envelope,
                                received_at,
                            })
                            .await;
                    }
                    Err(e) => error!("bad frame from peer {}: {}", peer, e),
                }
            })
        }));
    }

    /// Transition to `Closed` once, emitting `Disconnected` on the first
    /// call only (the channel close and the connection state change can
    /// both land here).
    async fn signal_closed(
        state: &Arc<Mutex<LinkState>>,
        events: &mpsc::Sender<LinkEvent>,
        peer_id: &str,
    ) {
        let first = {
            let mut st = state.lock();
            let first = *st != LinkState::Closed;
            *st = LinkState::Closed;
            first
        };
        if first {
            let _ = events
                .send(LinkEvent::Disconnected {
                    peer_id: peer_id.to_string(),
                })
                .await;
        }
    }

    async fn relay(&self, payload: SignalingMessage) -> CoordinatorResult<()> {
        self.server.send(ServerRequest::Webrtc(payload)).await
    }
}
