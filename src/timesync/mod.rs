//! Clock source registry.
//!
//! Owns the `server` time-sync source and one source per connected peer, and
//! decides which of them defines "server time" for the coordinator. A peer
//! source measures the local↔peer offset over the data channel; combined
//! with the peer's own reported peer↔server offset it yields a transitive
//! estimate of the server clock, which some networks measure more steadily
//! than the direct server path.

pub mod source;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::messages::ServerConnection;
use crate::now_millis;
use crate::peer::PeerMesh;
use crate::settings::SettingsHandle;
use source::{PingSample, Pinger, TimeSyncSource, TimeSyncUpdate};

/// Identifier of the direct server source and of the default selection.
pub const SERVER_DEVICE: &str = "server";

// ────────────────────────────────────────────────────────────────────────────
// Pingers
// ────────────────────────────────────────────────────────────────────────────

/// Samples the server clock through the `getServerTime` RPC.
pub struct ServerPinger {
    server: Arc<dyn ServerConnection>,
}

impl ServerPinger {
    pub fn new(server: Arc<dyn ServerConnection>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Pinger for ServerPinger {
    async fn ping(&self) -> CoordinatorResult<PingSample> {
        let request_sent = now_millis();
        let reply = self.server.server_time().await.map_err(|e| {
            CoordinatorError::ClockSampleFailed {
                source_id: SERVER_DEVICE.to_string(),
                detail: e.to_string(),
            }
        })?;
        Ok(PingSample {
            request_sent,
            request_received: reply.request_reception_time,
            response_sent: reply.response_transmission_time,
            response_received: now_millis(),
        })
    }
}

/// Samples a peer clock with a ping-request/ping-response exchange over the
/// peer's data channel.
pub struct PeerPinger {
    mesh: Arc<PeerMesh>,
    peer_id: String,
}

impl PeerPinger {
    pub fn new(mesh: Arc<PeerMesh>, peer_id: impl Into<String>) -> Self {
        Self {
            mesh,
            peer_id: peer_id.into(),
        }
    }
}

#[async_trait]
impl Pinger for PeerPinger {
    async fn ping(&self) -> CoordinatorResult<PingSample> {
        self.mesh.ping_peer(&self.peer_id).await.map_err(|e| {
            CoordinatorError::ClockSampleFailed {
                source_id: self.peer_id.clone(),
                detail: e.to_string(),
            }
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// One row of the "sync devices" display.
#[derive(Debug, Clone)]
pub struct SyncDevice {
    pub id: String,
    pub offset_ms: f64,
    pub ping_ms: f64,
    pub has_estimate: bool,
}

struct PeerEntry {
    source: TimeSyncSource,
    /// The peer's own server offset, as last broadcast by that peer.
    peer_server_offset_ms: Option<f64>,
    peer_server_ping_ms: Option<f64>,
}

pub struct TimeSyncRegistry {
    server: TimeSyncSource,
    peers: Mutex<HashMap<String, PeerEntry>>,
    /// Effective selection; reset to [`SERVER_DEVICE`] when the selected
    /// peer disappears.
    active: Mutex<String>,
    settings: SettingsHandle,
}

impl TimeSyncRegistry {
    pub fn new(server: Arc<dyn ServerConnection>, settings: SettingsHandle) -> Self {
        let active = settings.read().time_sync_device.clone();
        Self {
            server: TimeSyncSource::new(SERVER_DEVICE, Arc::new(ServerPinger::new(server))),
            peers: Mutex::new(HashMap::new()),
            active: Mutex::new(active),
            settings,
        }
    }

    /// Begin polling the server clock.
    pub fn start(&self) {
        self.server.start();
    }

    /// Stop everything and drop all peer sources.
    pub fn shutdown(&self) {
        self.server.stop();
        for (_, entry) in self.peers.lock().drain() {
            entry.source.stop();
        }
    }

    /// Updates from the direct server source. The session re-broadcasts
    /// these onto the peer mesh and uses the first one to flip `ready`.
    pub fn subscribe_server(&self) -> broadcast::Receiver<TimeSyncUpdate> {
        self.server.subscribe()
    }

    pub fn force_update(&self) {
        self.server.force_update();
        for entry in self.peers.lock().values() {
            entry.source.force_update();
        }
    }

    pub fn server_has_estimate(&self) -> bool {
        self.server.has_estimate()
    }

    pub fn server_offset_ms(&self) -> f64 {
        self.server.offset_ms()
    }

    pub fn server_ping_ms(&self) -> f64 {
        self.server.ping_ms()
    }

    // ── Peer lifecycle ───────────────────────────────────────────────────

    /// Create and start a source for a newly connected peer.
    pub fn add_peer(&self, peer_id: &str, pinger: Arc<dyn Pinger>) {
        let source = TimeSyncSource::new(peer_id, pinger);
        source.start();
        let mut peers = self.peers.lock();
        if let Some(old) = peers.insert(
            peer_id.to_string(),
            PeerEntry {
                source,
                peer_server_offset_ms: None,
                peer_server_ping_ms: None,
            },
        ) {
            debug!("replacing time sync source for peer {}", peer_id);
            old.source.stop();
        }
    }

    pub fn remove_peer(&self, peer_id: &str) {
        if let Some(entry) = self.peers.lock().remove(peer_id) {
            entry.source.stop();
        }
    }

    /// Record the peer's broadcast of its own server estimate.
    pub fn update_peer_server_offset(&self, peer_id: &str, offset_ms: f64, ping_ms: f64) {
        let mut peers = self.peers.lock();
        match peers.get_mut(peer_id) {
            Some(entry) => {
                entry.peer_server_offset_ms = Some(offset_ms);
                entry.peer_server_ping_ms = Some(ping_ms);
            }
            None => warn!("server-time update from unknown peer {}", peer_id),
        }
    }

    // ── Selection ────────────────────────────────────────────────────────

    pub fn active_device(&self) -> String {
        self.active.lock().clone()
    }

    pub fn set_active_device(&self, device: &str) {
        *self.active.lock() = device.to_string();
        self.settings.write().time_sync_device = device.to_string();
    }

    /// Effective offset (ms) from the local clock to server time, through
    /// the active source, plus the user's extra offset.
    ///
    /// A vanished active peer falls back to the server permanently; a peer
    /// that is connected but has not broadcast its server estimate yet is
    /// substituted by the server for this call only. At most one fallback
    /// per call.
    pub fn time_offset_ms(&self) -> f64 {
        let extra = self.settings.read().extra_time_offset;
        let active = self.active.lock().clone();

        let base = if active == SERVER_DEVICE {
            self.server.offset_ms()
        } else {
            let via_peer = {
                let peers = self.peers.lock();
                match peers.get(&active) {
                    Some(entry) => Some(
                        entry
                            .peer_server_offset_ms
                            .map(|pso| entry.source.offset_ms() + pso),
                    ),
                    None => None,
                }
            };
            match via_peer {
                Some(Some(offset)) => offset,
                Some(None) => self.server.offset_ms(),
                None => {
                    debug!(
                        "time sync device {} is gone, falling back to server",
                        active
                    );
                    *self.active.lock() = SERVER_DEVICE.to_string();
                    self.server.offset_ms()
                }
            }
        };
        base + extra
    }

    /// Ping of the active path to the server: the direct measurement, or
    /// the local↔peer leg plus the peer's own reported server ping.
    pub fn ping_ms(&self) -> f64 {
        let active = self.active.lock().clone();
        if active == SERVER_DEVICE {
            return self.server.ping_ms();
        }
        let peers = self.peers.lock();
        match peers.get(&active) {
            Some(entry) => {
                entry.source.ping_ms() + entry.peer_server_ping_ms.unwrap_or(0.0)
            }
            None => self.server.ping_ms(),
        }
    }

    pub fn local_to_remote(&self, local: i64) -> i64 {
        local + self.time_offset_ms().round() as i64
    }

    pub fn remote_to_local(&self, remote: i64) -> i64 {
        remote - self.time_offset_ms().round() as i64
    }

    /// Snapshot of every known source for UI display, server first.
    pub fn devices(&self) -> Vec<SyncDevice> {
        let mut devices = vec![SyncDevice {
            id: SERVER_DEVICE.to_string(),
            offset_ms: self.server.offset_ms(),
            ping_ms: self.server.ping_ms(),
            has_estimate: self.server.has_estimate(),
        }];
        let peers = self.peers.lock();
        let mut ids: Vec<_> = peers.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let entry = &peers[&id];
            devices.push(SyncDevice {
                id,
                offset_ms: entry.source.offset_ms(),
                ping_ms: entry.source.ping_ms(),
                has_estimate: entry.source.has_estimate(),
            });
        }
        devices
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}
