//! Session controller.
//!
//! The top-level state machine and the wiring hub. A [`Coordinator`] owns
//! every internal component, dispatches inbound server messages to the right
//! one, and tracks the enabled/ready lifecycle: joining a group enables the
//! subsystems, the first successful clock sync flips `ready` (exactly once
//! per enable) and releases the queued command, and leaving tears everything
//! back down.
//!
//! ```text
//!  Disabled ──GroupJoined──► Enabling ──► EnabledNotReady ──first sync──► EnabledReady
//!     ▲                                                                      │
//!     └───────────────────── NotInGroup | GroupLeft ◄───────────────────────┘
//! ```

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::drift::{CorrectionEvent, DriftCorrector};
use crate::messages::{
    Command, GroupInfo, GroupUpdate, PlaybackCommand, ServerConnection, ServerRequest,
};
use crate::now_millis;
use crate::peer::{MeshEvent, PeerMesh};
use crate::player::{PlayerAdapter, PlayerEvent};
use crate::queue::{ItemLookup, QueueBackend, QueueController};
use crate::scheduler::{CommandScheduler, SyncState};
use crate::settings::SettingsHandle;
use crate::timesync::{PeerPinger, SyncDevice, TimeSyncRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disabled,
    Enabling,
    EnabledNotReady,
    EnabledReady,
}

/// Server-side denials surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    GroupDoesNotExist,
    CreateGroupDenied,
    JoinGroupDenied,
    LibraryAccessDenied,
}

/// Everything the embedding UI may want to react to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    GroupJoined(GroupInfo),
    GroupLeft,
    GroupStateChanged(GroupInfo),
    UserJoined(String),
    UserLeft(String),
    PlaybackStateChanged { state: String, reason: String },
    AccessDenied(DenialReason),
    SyncReady,
    Correction(CorrectionEvent),
    SyncPlayDisabled,
}

/// Snapshot for the sync indicator and the settings screen.
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub phase: SessionPhase,
    pub active_device: String,
    pub time_offset_ms: f64,
    pub server_ping_ms: f64,
    pub last_delta_ms: f64,
    pub sync_attempts: u32,
}

struct GroupState {
    phase: SessionPhase,
    enabled_at_server: Option<i64>,
    ready: bool,
    queued_command: Option<Command>,
    last_command: Option<Command>,
    group: Option<GroupInfo>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Disabled,
            enabled_at_server: None,
            ready: false,
            queued_command: None,
            last_command: None,
            group: None,
        }
    }
}

pub struct Coordinator {
    server: Arc<dyn ServerConnection>,
    settings: SettingsHandle,
    player: Arc<PlayerAdapter>,
    timesync: Arc<TimeSyncRegistry>,
    mesh: Arc<PeerMesh>,
    queue: Arc<QueueController>,
    scheduler: CommandScheduler,
    drift: DriftCorrector,
    state: Arc<Mutex<GroupState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Coordinator {
    /// Wire up the whole coordinator against the application's seams.
    pub fn new(
        server: Arc<dyn ServerConnection>,
        queue_backend: Arc<dyn QueueBackend>,
        lookup: Arc<dyn ItemLookup>,
        settings: SettingsHandle,
    ) -> Arc<Self> {
        let player = Arc::new(PlayerAdapter::new());
        let timesync = Arc::new(TimeSyncRegistry::new(server.clone(), settings.clone()));
        let (mesh, mesh_events) = PeerMesh::new(server.clone(), settings.clone());
        let queue = QueueController::new(
            queue_backend,
            lookup,
            server.clone(),
            timesync.clone(),
            player.clone(),
        );

        let sync_state = SyncState::new();
        let scheduler = CommandScheduler::new(
            sync_state.clone(),
            player.clone(),
            timesync.clone(),
            server.clone(),
            queue.clone(),
            settings.clone(),
        );
        let drift = DriftCorrector::new(
            sync_state,
            player.clone(),
            timesync.clone(),
            settings.clone(),
        );
        drift.start();

        let (events, _) = broadcast::channel(64);
        let state = Arc::new(Mutex::new(GroupState::new()));

        let coordinator = Arc::new(Self {
            server,
            settings,
            player,
            timesync,
            mesh,
            queue,
            scheduler,
            drift,
            state,
            events,
        });
        coordinator.spawn_mesh_pump(mesh_events);
        coordinator.spawn_time_sync_pump();
        coordinator.spawn_player_pump();
        coordinator.spawn_correction_pump();
        coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn is_enabled(&self) -> bool {
        self.phase() != SessionPhase::Disabled
    }

    pub fn group_info(&self) -> Option<GroupInfo> {
        self.state.lock().group.clone()
    }

    pub fn last_playback_command(&self) -> Option<Command> {
        self.state.lock().last_command.clone()
    }

    pub fn player(&self) -> Arc<PlayerAdapter> {
        self.player.clone()
    }

    pub fn queue(&self) -> Arc<QueueController> {
        self.queue.clone()
    }

    pub fn devices(&self) -> Vec<SyncDevice> {
        self.timesync.devices()
    }

    pub fn set_time_sync_device(&self, device: &str) {
        self.timesync.set_active_device(device);
    }

    pub fn sync_stats(&self) -> SyncStats {
        let (last_delta_ms, sync_attempts) = {
            let st = self.scheduler.state();
            let st = st.lock();
            (st.last_delta_ms, st.sync_attempts)
        };
        SyncStats {
            phase: self.phase(),
            active_device: self.timesync.active_device(),
            time_offset_ms: self.timesync.time_offset_ms(),
            server_ping_ms: self.timesync.ping_ms(),
            last_delta_ms,
            sync_attempts,
        }
    }

    // ── User transport controls ──────────────────────────────────────────
    //
    // While grouped, pressing pause/play/seek must not take local effect;
    // the request goes to the server and the authoritative command comes
    // back for everyone at once.

    pub async fn pause(&self) {
        if self.is_enabled() {
            self.request(ServerRequest::Pause).await;
        } else {
            self.player.local_pause().await;
        }
    }

    pub async fn unpause(&self) {
        if self.is_enabled() {
            self.request(ServerRequest::Unpause).await;
        } else {
            self.player.local_unpause().await;
        }
    }

    pub async fn seek(&self, position_ticks: i64) {
        if self.is_enabled() {
            self.request(ServerRequest::Seek { position_ticks }).await;
        } else {
            self.player.local_seek(position_ticks).await;
        }
    }

    // ── Group management requests ────────────────────────────────────────

    pub async fn create_group(&self, group_name: &str) {
        self.request(ServerRequest::NewGroup {
            group_name: group_name.to_string(),
        })
        .await;
    }

    pub async fn join_group(&self, group_id: &str) {
        self.request(ServerRequest::JoinGroup {
            group_id: group_id.to_string(),
        })
        .await;
    }

    pub async fn leave_group(&self) {
        self.request(ServerRequest::LeaveGroup).await;
    }

    pub async fn request_group_list(&self) {
        self.request(ServerRequest::ListGroups).await;
    }

    pub async fn set_ignore_wait(&self, ignore_wait: bool) {
        self.request(ServerRequest::SetIgnoreWait { ignore_wait }).await;
    }

    async fn request(&self, request: ServerRequest) {
        if let Err(e) = self.server.send(request).await {
            warn!("server request failed: {}", e);
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────

    pub async fn handle_group_update(&self, update: GroupUpdate) {
        match update {
            GroupUpdate::GroupJoined(info) => self.enable(info).await,
            GroupUpdate::NotInGroup => self.disable(false).await,
            GroupUpdate::GroupLeft => self.disable(true).await,
            GroupUpdate::PlayQueue(queue_update) => {
                if !self.is_enabled() {
                    debug!("play queue update while disabled, dropped");
                    return;
                }
                if let Err(e) = self.queue.apply_update(queue_update).await {
                    warn!("{}", e);
                }
            }
            GroupUpdate::GroupUpdate(info) => {
                self.state.lock().group = Some(info.clone());
                let _ = self.events.send(SessionEvent::GroupStateChanged(info));
            }
            GroupUpdate::StateUpdate { state, reason } => {
                let _ = self
                    .events
                    .send(SessionEvent::PlaybackStateChanged { state, reason });
            }
            GroupUpdate::UserJoined(user) => {
                let _ = self.events.send(SessionEvent::UserJoined(user));
            }
            GroupUpdate::UserLeft(user) => {
                let _ = self.events.send(SessionEvent::UserLeft(user));
            }
            GroupUpdate::GroupDoesNotExist => self.denied(DenialReason::GroupDoesNotExist),
            GroupUpdate::CreateGroupDenied => self.denied(DenialReason::CreateGroupDenied),
            GroupUpdate::JoinGroupDenied => self.denied(DenialReason::JoinGroupDenied),
            GroupUpdate::LibraryAccessDenied => self.denied(DenialReason::LibraryAccessDenied),
            GroupUpdate::WebRTC(signaling) => {
                if self.is_enabled() && self.settings.read().enable_webrtc {
                    self.mesh.handle_signaling(signaling).await;
                } else {
                    debug!("signaling dropped: session disabled or WebRTC off");
                }
            }
            GroupUpdate::SyncPlayIsDisabled => {
                warn!("server reports sync playback is disabled");
                let _ = self.events.send(SessionEvent::SyncPlayDisabled);
            }
        }
    }

    /// Accept one playback command. Commands that predate the enable are
    /// stale and dropped; commands before the first clock sync are queued
    /// and flushed on `ready`.
    pub async fn handle_playback_command(&self, command: PlaybackCommand) {
        let command: Command = command.into();
        enum Verdict {
            Disabled,
            Stale(i64),
            Queued,
            Apply,
        }

        let verdict = {
            let mut st = self.state.lock();
            if st.phase == SessionPhase::Disabled {
                Verdict::Disabled
            } else {
                let enabled_at = st.enabled_at_server.unwrap_or(0);
                if command.emitted_at_server < enabled_at {
                    Verdict::Stale(enabled_at)
                } else {
                    st.last_command = Some(command.clone());
                    if st.ready {
                        Verdict::Apply
                    } else {
                        st.queued_command = Some(command.clone());
                        Verdict::Queued
                    }
                }
            }
        };

        match verdict {
            Verdict::Disabled => debug!("playback command while disabled, dropped"),
            Verdict::Stale(enabled_at) => debug!(
                "stale playback command dropped: emitted {} < enabled {}",
                command.emitted_at_server, enabled_at
            ),
            Verdict::Queued => debug!("command queued until the first clock sync"),
            Verdict::Apply => self.scheduler.apply(command).await,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    async fn enable(&self, info: GroupInfo) {
        if self.is_enabled() {
            // Re-joined (possibly another group): tear down quietly first.
            self.disable(false).await;
        }

        {
            let mut st = self.state.lock();
            st.phase = SessionPhase::Enabling;
            st.group = Some(info.clone());
            st.ready = false;
            st.queued_command = None;
            st.enabled_at_server = Some(self.timesync.local_to_remote(now_millis()));
        }

        self.queue.enable();
        self.timesync.start();
        if self.settings.read().enable_webrtc {
            if let Err(e) = self.mesh.enable().await {
                warn!("failed to enable peer mesh: {}", e);
            }
        }

        self.state.lock().phase = SessionPhase::EnabledNotReady;
        let _ = self.events.send(SessionEvent::GroupJoined(info));
    }

    async fn disable(&self, announce: bool) {
        {
            let mut st = self.state.lock();
            if st.phase == SessionPhase::Disabled {
                return;
            }
            *st = GroupState::new();
        }

        self.scheduler.clear();
        self.queue.disable();
        self.mesh.disable(announce).await;
        self.timesync.shutdown();
        let _ = self.events.send(SessionEvent::GroupLeft);
    }

    fn denied(&self, reason: DenialReason) {
        warn!("server denied the request: {:?}", reason);
        let _ = self.events.send(SessionEvent::AccessDenied(reason));
    }

    // ── Background pumps ─────────────────────────────────────────────────

    /// Peer lifecycle → time sync registry.
    fn spawn_mesh_pump(&self, mut rx: tokio::sync::mpsc::Receiver<MeshEvent>) {
        let timesync = self.timesync.clone();
        let mesh = Arc::downgrade(&self.mesh);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    MeshEvent::PeerConnected(peer_id) => {
                        let Some(mesh) = mesh.upgrade() else { break };
                        let pinger = Arc::new(PeerPinger::new(mesh, peer_id.as_str()));
                        timesync.add_peer(&peer_id, pinger);
                    }
                    MeshEvent::PeerDisconnected(peer_id) => timesync.remove_peer(&peer_id),
                    MeshEvent::PeerServerUpdate {
                        peer_id,
                        time_offset,
                        ping,
                    } => timesync.update_peer_server_offset(&peer_id, time_offset, ping),
                }
            }
        });
    }

    /// Server clock updates: flip `ready` once per enable, re-broadcast the
    /// estimate to peers, and report the measured ping.
    fn spawn_time_sync_pump(&self) {
        let mut rx = self.timesync.subscribe_server();
        let state = self.state.clone();
        let mesh = Arc::downgrade(&self.mesh);
        let server = self.server.clone();
        let scheduler = self.scheduler.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let update = match rx.recv().await {
                    Ok(update) => update,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let (Some(offset), Some(ping)) = (update.offset_ms, update.ping_ms) else {
                    continue;
                };

                if let Some(mesh) = mesh.upgrade() {
                    if mesh.is_enabled() {
                        mesh.broadcast_server_time(offset, ping).await;
                    }
                }

                let (became_ready, queued) = {
                    let mut st = state.lock();
                    if st.phase == SessionPhase::EnabledNotReady {
                        st.phase = SessionPhase::EnabledReady;
                        st.ready = true;
                        (true, st.queued_command.take())
                    } else {
                        (false, None)
                    }
                };
                if st_enabled(&state) {
                    if let Err(e) = server.send(ServerRequest::Ping { ping }).await {
                        debug!("ping report failed: {}", e);
                    }
                }
                if became_ready {
                    let _ = events.send(SessionEvent::SyncReady);
                    if let Some(command) = queued {
                        scheduler.apply(command).await;
                    }
                }
            }
        });
    }

    /// Playback stopping cancels whatever was scheduled against it.
    fn spawn_player_pump(&self) {
        let mut rx = self.player.subscribe();
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PlayerEvent::PlaybackStop) => scheduler.cancel_pending(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_correction_pump(&self) {
        let mut rx = self.drift.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(correction) => {
                        let _ = events.send(SessionEvent::Correction(correction));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

fn st_enabled(state: &Arc<Mutex<GroupState>>) -> bool {
    state.lock().phase != SessionPhase::Disabled
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.drift.stop();
        self.timesync.shutdown();
    }
}
