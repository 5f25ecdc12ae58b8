//! Peer mesh.
//!
//! Creates and tears down [`PeerLink`]s in response to relayed signaling,
//! routes inbound frames, and multicasts outbound ones. The mesh also owns
//! the request half of the peer clock exchange: [`PeerMesh::ping_peer`]
//! sends a `ping-request` and resolves when the matching `ping-response`
//! frame arrives, which is what a peer [`Pinger`](crate::timesync::source::Pinger)
//! runs on.
//!
//! Everything the rest of the coordinator needs to know about peers comes
//! out of the [`MeshEvent`] stream: a peer channel opened, a peer went away,
//! a peer re-broadcast its server clock estimate.

pub mod link;
pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use uuid::Uuid;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::messages::{ServerConnection, ServerRequest, SignalingMessage};
use crate::now_millis;
use crate::settings::SettingsHandle;
use crate::timesync::source::PingSample;
use link::{LinkEvent, PeerLink, PeerRole};
use protocol::{Envelope, ExternalMessage, InternalMessage};

/// Send this as the peer id to reach every live link.
pub const BROADCAST: &str = "*";

/// How long a peer ping waits for its response frame.
const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// What the mesh reports upward to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerConnected(String),
    PeerDisconnected(String),
    PeerServerUpdate {
        peer_id: String,
        time_offset: f64,
        ping: f64,
    },
}

pub struct PeerMesh {
    /// Local session tag, for log correlation across clients.
    instance_id: String,
    server: Arc<dyn ServerConnection>,
    settings: SettingsHandle,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    pending_pings: Mutex<HashMap<String, oneshot::Sender<(InternalMessage, i64)>>>,
    link_events: mpsc::Sender<LinkEvent>,
    mesh_events: mpsc::Sender<MeshEvent>,
    enabled: AtomicBool,
}

impl PeerMesh {
    /// Build the mesh and its routing task. The returned receiver carries
    /// the [`MeshEvent`] stream; the session consumes it.
    pub fn new(
        server: Arc<dyn ServerConnection>,
        settings: SettingsHandle,
    ) -> (Arc<Self>, mpsc::Receiver<MeshEvent>) {
        let (link_tx, mut link_rx) = mpsc::channel(64);
        let (mesh_tx, mesh_rx) = mpsc::channel(64);

        let mesh = Arc::new(Self {
            instance_id: Uuid::new_v4().to_string(),
            server,
            settings,
            links: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            link_events: link_tx,
            mesh_events: mesh_tx,
            enabled: AtomicBool::new(false),
        });

        // Routing task: holds the mesh weakly so dropping the mesh (and
        // with it the link senders) stops the loop.
        let router = Arc::downgrade(&mesh);
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                let Some(mesh) = router.upgrade() else { break };
                mesh.route(event).await;
            }
            debug!("peer mesh router stopped");
        });

        (mesh, mesh_rx)
    }

    /// Announce a new session to the server and accept inbound signaling.
    pub async fn enable(&self) -> CoordinatorResult<()> {
        self.enabled.store(true, Ordering::Release);
        debug!("peer mesh {} enabled", self.instance_id);
        self.server
            .send(ServerRequest::Webrtc(SignalingMessage {
                new_session: Some(true),
                ..Default::default()
            }))
            .await
    }

    /// Close every link and optionally announce departure.
    pub async fn disable(&self, notify_server: bool) {
        self.enabled.store(false, Ordering::Release);
        let links: Vec<Arc<PeerLink>> = self.links.lock().drain().map(|(_, l)| l).collect();
        join_all(links.iter().map(|link| link.close())).await;
        self.pending_pings.lock().clear();
        if notify_server {
            let leaving = ServerRequest::Webrtc(SignalingMessage {
                session_leaving: Some(true),
                ..Default::default()
            });
            if let Err(e) = self.server.send(leaving).await {
                warn!("failed to announce session departure: {}", e);
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.links.lock().keys().cloned().collect()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    // ── Signaling dispatch ───────────────────────────────────────────────

    /// Handle one relayed signaling message from the server.
    pub async fn handle_signaling(&self, message: SignalingMessage) {
        if !self.is_enabled() {
            debug!("signaling while disabled, dropped");
            return;
        }
        let from = message.from.clone();
        if from.is_empty() {
            warn!("signaling message without sender, dropped");
            return;
        }

        if message.new_session == Some(true) {
            // A newcomer announced itself: we host a link towards it.
            match self.create_link(&from, PeerRole::Host).await {
                Ok(link) => {
                    if let Err(e) = link.open().await {
                        warn!("failed to open link to peer {}: {}", from, e);
                        self.remove_peer(&from).await;
                    }
                }
                Err(e) => warn!("failed to create link to peer {}: {}", from, e),
            }
        } else if message.session_leaving == Some(true) {
            self.remove_peer(&from).await;
        } else {
            // Offer, answer, or candidate. First contact from an unknown
            // peer means we are the guest side of its link.
            let link = self.links.lock().get(&from).cloned();
            let link = match link {
                Some(link) => link,
                None => match self.create_link(&from, PeerRole::Guest).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!("failed to create link for peer {}: {}", from, e);
                        return;
                    }
                },
            };
            if let Err(e) = link.on_signaling(message).await {
                warn!("signaling from peer {} rejected: {}", from, e);
            }
        }
    }

    /// Explicitly drop a peer: close the link, reject its pending ping,
    /// and report the disconnect upward. Also used for `SessionLeaving`,
    /// which removes the peer even if its channel has not closed yet.
    pub async fn remove_peer(&self, peer_id: &str) {
        let link = self.links.lock().remove(peer_id);
        self.pending_pings.lock().remove(peer_id);
        if let Some(link) = link {
            link.close().await;
            let _ = self
                .mesh_events
                .send(MeshEvent::PeerDisconnected(peer_id.to_string()))
                .await;
        }
    }

    // ── Outbound frames ──────────────────────────────────────────────────

    /// Forward a frame to one peer, or to every live link with
    /// [`BROADCAST`]. Missing peers and send failures are logged and
    /// dropped.
    pub async fn send(&self, to: &str, envelope: &Envelope) {
        if to == BROADCAST {
            let links: Vec<Arc<PeerLink>> = self.links.lock().values().cloned().collect();
            for link in links {
                if let Err(e) = link.send(envelope).await {
                    debug!("broadcast to peer {} failed: {}", link.peer_id(), e);
                }
            }
            return;
        }
        let link = self.links.lock().get(to).cloned();
        match link {
            Some(link) => {
                if let Err(e) = link.send(envelope).await {
                    warn!("send to peer {} failed: {}", to, e);
                }
            }
            None => warn!("send to unknown peer {}, dropped", to),
        }
    }

    /// Re-broadcast our server clock estimate to every peer.
    pub async fn broadcast_server_time(&self, time_offset: f64, ping: f64) {
        self.send(
            BROADCAST,
            &Envelope::External(ExternalMessage::TimeSyncServerUpdate { time_offset, ping }),
        )
        .await;
    }

    // ── Clock sampling ───────────────────────────────────────────────────

    /// One full ping exchange with a peer. Resolves with all four
    /// timestamps, or fails when the link is gone, the peer never answers,
    /// or the link closes mid-flight.
    pub async fn ping_peer(&self, peer_id: &str) -> CoordinatorResult<PingSample> {
        let has_link = self.links.lock().contains_key(peer_id);
        if !has_link {
            return Err(CoordinatorError::UnknownPeer(peer_id.to_string()));
        }

        let request_sent = now_millis();
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().insert(peer_id.to_string(), tx);

        self.send(
            peer_id,
            &Envelope::Internal(InternalMessage::PingRequest { request_sent }),
        )
        .await;

        match timeout(PING_TIMEOUT, rx).await {
            Ok(Ok((
                InternalMessage::PingResponse {
                    request_sent,
                    request_received,
                    response_sent,
                },
                received_at,
            ))) => Ok(PingSample {
                request_sent,
                request_received,
                response_sent,
                response_received: received_at,
            }),
            Ok(Ok(_)) => Err(CoordinatorError::MalformedFrame(
                "unexpected frame resolved a ping".to_string(),
            )),
            Ok(Err(_)) => Err(CoordinatorError::PeerDisconnected),
            Err(_) => {
                self.pending_pings.lock().remove(peer_id);
                Err(CoordinatorError::ClockSampleFailed {
                    source_id: peer_id.to_string(),
                    detail: "ping timed out".to_string(),
                })
            }
        }
    }

    // ── Routing ──────────────────────────────────────────────────────────

    async fn create_link(&self, peer_id: &str, role: PeerRole) -> CoordinatorResult<Arc<PeerLink>> {
        let link = PeerLink::new(
            peer_id,
            role,
            self.ice_servers(),
            self.server.clone(),
            self.link_events.clone(),
        )
        .await?;
        if let Some(old) = self
            .links
            .lock()
            .insert(peer_id.to_string(), link.clone())
        {
            debug!("replacing existing link to peer {}", peer_id);
            tokio::spawn(async move { old.close().await });
        }
        Ok(link)
    }

    async fn route(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer_id } => {
                let _ = self
                    .mesh_events
                    .send(MeshEvent::PeerConnected(peer_id))
                    .await;
            }
            LinkEvent::Disconnected { peer_id } => {
                // A link torn down through remove_peer already reported
                // itself; only a spontaneous close reaches the map here.
                let had_link = self.links.lock().remove(&peer_id).is_some();
                self.pending_pings.lock().remove(&peer_id);
                if had_link {
                    let _ = self
                        .mesh_events
                        .send(MeshEvent::PeerDisconnected(peer_id))
                        .await;
                }
            }
            LinkEvent::Frame {
                peer_id,
                envelope,
                received_at,
            } => match envelope {
                Envelope::Internal(InternalMessage::PingRequest { request_sent }) => {
                    let reply = Envelope::Internal(InternalMessage::PingResponse {
                        request_sent,
                        request_received: received_at,
                        response_sent: now_millis(),
                    });
                    self.send(&peer_id, &reply).await;
                }
                Envelope::Internal(response @ InternalMessage::PingResponse { .. }) => {
                    let waiter = self.pending_pings.lock().remove(&peer_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send((response, received_at));
                        }
                        // Late response to a cancelled ping.
                        None => debug!("unsolicited ping response from peer {}", peer_id),
                    }
                }
                Envelope::External(ExternalMessage::TimeSyncServerUpdate {
                    time_offset,
                    ping,
                }) => {
                    let _ = self
                        .mesh_events
                        .send(MeshEvent::PeerServerUpdate {
                            peer_id,
                            time_offset,
                            ping,
                        })
                        .await;
                }
            },
        }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut urls = vec!["stun:stun.l.google.com:19302".to_string()];
        let tracker = self.settings.read().p2p_tracker.clone();
        if !tracker.is_empty() {
            urls.push(tracker);
        }
        vec![RTCIceServer {
            urls,
            ..Default::default()
        }]
    }
}
