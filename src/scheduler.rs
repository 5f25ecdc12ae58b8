//! Command scheduling.
//!
//! Converts authoritative server commands into precisely timed local player
//! actions. A command names a server instant and a media position; the
//! scheduler converts the instant to the local clock, arms a single-shot
//! timer (or runs immediately when the instant has passed), and executes the
//! matching primitive. Re-asserted duplicates are reconciled against the
//! observed player state instead of being replayed blindly.
//!
//! At most one scheduled-command timer is armed at any instant: arming a new
//! one cancels the previous timer, any drift-correction rate nudge in
//! flight, and resets the playback rate.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::messages::{Command, CommandKind, ServerConnection, ServerRequest};
use crate::now_millis;
use crate::player::{wait_for, PlayerAdapter, PlayerEvent};
use crate::queue::QueueController;
use crate::settings::SettingsHandle;
use crate::timesync::TimeSyncRegistry;
use crate::TICKS_PER_MS;

/// Timeout for command-path player events (ready after a seek).
pub const COMMAND_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for plain state transitions (pause landed, unpause landed).
pub const STATE_EVENT_TIMEOUT: Duration = Duration::from_millis(500);

/// Forced re-seeks jitter their target by a uniform value in this range so
/// the player cannot short-circuit a seek to the position it believes it is
/// already at. The server tolerates a ±50 ms window on ready reports.
const FORCED_SEEK_JITTER_MS: i64 = 50;

/// State shared between the scheduler and the drift corrector.
pub struct SyncState {
    pub last_command: Option<Command>,
    /// Gate for the drift corrector. Flipped on by the sync-guard timer a
    /// moment after an unpause lands, off while a nudge is in flight.
    pub sync_enabled: bool,
    pub sync_attempts: u32,
    pub last_sync_time: i64,
    pub last_delta_ms: f64,
    pub(crate) timer: Option<CancellationToken>,
    pub(crate) sync_guard: Option<CancellationToken>,
    pub(crate) rate_restore: Option<CancellationToken>,
}

impl SyncState {
    pub fn new() -> SharedSyncState {
        Arc::new(Mutex::new(SyncState {
            last_command: None,
            sync_enabled: false,
            sync_attempts: 0,
            last_sync_time: 0,
            last_delta_ms: 0.0,
            timer: None,
            sync_guard: None,
            rate_restore: None,
        }))
    }

    fn cancel_timers(&mut self) {
        if let Some(t) = self.timer.take() {
            t.cancel();
        }
        if let Some(t) = self.sync_guard.take() {
            t.cancel();
        }
        if let Some(t) = self.rate_restore.take() {
            t.cancel();
        }
    }

    pub fn has_armed_timer(&self) -> bool {
        self.timer.is_some()
    }
}

pub type SharedSyncState = Arc<Mutex<SyncState>>;

#[derive(Clone)]
pub struct CommandScheduler {
    state: SharedSyncState,
    player: Arc<PlayerAdapter>,
    timesync: Arc<TimeSyncRegistry>,
    server: Arc<dyn ServerConnection>,
    queue: Arc<QueueController>,
    settings: SettingsHandle,
}

impl CommandScheduler {
    pub fn new(
        state: SharedSyncState,
        player: Arc<PlayerAdapter>,
        timesync: Arc<TimeSyncRegistry>,
        server: Arc<dyn ServerConnection>,
        queue: Arc<QueueController>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            state,
            player,
            timesync,
            server,
            queue,
            settings,
        }
    }

    pub fn state(&self) -> SharedSyncState {
        self.state.clone()
    }

    /// Accept one authoritative command. Precondition violations drop the
    /// command with a log; they never raise.
    pub async fn apply(&self, command: Command) {
        let current_item = self.queue.current_playlist_item_id();
        if current_item.as_deref() != Some(command.playlist_item_id.as_str()) {
            warn!(
                "command for playlist item {} dropped, current item is {:?}",
                command.playlist_item_id, current_item
            );
            return;
        }

        let duplicate = {
            let st = self.state.lock();
            st.last_command
                .as_ref()
                .is_some_and(|last| last.is_duplicate_of(&command))
        };
        if duplicate {
            self.reconcile_duplicate(command).await;
            return;
        }

        self.schedule(command).await;
    }

    /// The server re-asserted the command we already hold. If it is still
    /// scheduled there is nothing to do; if it was applied, compare the
    /// player to the expected post-state and only correct a divergence.
    async fn reconcile_duplicate(&self, command: Command) {
        let t_local = self.timesync.remote_to_local(command.when_server);
        if t_local > now_millis() {
            debug!("duplicate command is still scheduled, ignored");
            return;
        }

        let playing = self.player.is_playing();
        let position = self.current_ticks();
        let expected = command.position_ticks.unwrap_or(0);

        match command.kind {
            CommandKind::Unpause => {
                if !playing {
                    debug!("re-asserting unpause: player is paused");
                    self.schedule(command).await;
                }
            }
            CommandKind::Pause => {
                if playing || position != expected {
                    debug!("re-asserting pause: state diverged");
                    self.schedule(command).await;
                }
            }
            CommandKind::Stop => {
                if playing {
                    debug!("re-asserting stop: player is still playing");
                    self.schedule(command).await;
                }
            }
            CommandKind::Seek => {
                if playing || position != expected {
                    let jitter_ms = rand::thread_rng()
                        .gen_range(-FORCED_SEEK_JITTER_MS..=FORCED_SEEK_JITTER_MS);
                    let mut forced = command;
                    forced.position_ticks =
                        Some(expected + jitter_ms * TICKS_PER_MS);
                    debug!("re-asserting seek with {} ms jitter", jitter_ms);
                    self.schedule(forced).await;
                } else {
                    // Nothing to correct: the seek landed, tell the server
                    // we are ready.
                    self.report_buffering_done(&command.playlist_item_id).await;
                }
            }
        }
    }

    async fn schedule(&self, command: Command) {
        {
            let mut st = self.state.lock();
            st.cancel_timers();
            st.sync_enabled = false;
            st.last_command = Some(command.clone());
        }
        self.player.set_playback_rate(1.0);

        let delay_ms = self.timesync.remote_to_local(command.when_server) - now_millis();
        debug!(
            "scheduling {:?} for playlist item {} in {} ms",
            command.kind, command.playlist_item_id, delay_ms
        );

        match command.kind {
            CommandKind::Unpause => self.schedule_unpause(command, delay_ms).await,
            CommandKind::Pause => {
                let this = self.clone();
                self.arm(delay_ms, async move { this.run_pause(command).await });
            }
            CommandKind::Stop => {
                let this = self.clone();
                self.arm(delay_ms, async move { this.run_stop().await });
            }
            CommandKind::Seek => {
                let this = self.clone();
                self.arm(delay_ms, async move { this.run_seek(command).await });
            }
        }
    }

    async fn schedule_unpause(&self, command: Command, delay_ms: i64) {
        if delay_ms <= 0 {
            let this = self.clone();
            self.arm(0, async move { this.run_unpause_catch_up(command).await });
            return;
        }

        // Future unpause: when the player sits well ahead of the start
        // position, pre-seek now so the timer only has to unpause.
        let target = command.position_ticks.unwrap_or(0);
        let ahead_ms = (self.current_ticks() - target) / TICKS_PER_MS;
        if ahead_ms > self.settings.read().min_delay_skip_to_sync as i64 {
            debug!("pre-seeking {} ms back before scheduled unpause", ahead_ms);
            self.player.local_seek(target).await;
        }

        let this = self.clone();
        self.arm(delay_ms, async move {
            this.player.local_unpause().await;
            this.arm_sync_guard();
        });
    }

    /// The unpause instant has already passed: start immediately, then seek
    /// forward to where the group is by now.
    async fn run_unpause_catch_up(&self, command: Command) {
        let server_now = self.timesync.local_to_remote(now_millis());
        let server_ticks = command.position_ticks.unwrap_or(0)
            + (server_now - command.when_server).max(0) * TICKS_PER_MS;

        let mut rx = self.player.subscribe();
        self.player.local_unpause().await;
        match wait_for(
            &mut rx,
            |e| *e == PlayerEvent::Unpause,
            STATE_EVENT_TIMEOUT,
            "unpause",
        )
        .await
        {
            Ok(_) => self.player.local_seek(server_ticks).await,
            Err(e) => {
                debug!("{}; seeking anyway", e);
                self.player.local_seek(server_ticks).await;
            }
        }
        self.arm_sync_guard();
    }

    async fn run_pause(&self, command: Command) {
        let mut rx = self.player.subscribe();
        self.player.local_pause().await;

        // Land on the exact commanded position once the pause settles; on
        // timeout seek anyway.
        if let Err(e) = wait_for(
            &mut rx,
            |e| *e == PlayerEvent::Pause,
            STATE_EVENT_TIMEOUT,
            "pause",
        )
        .await
        {
            debug!("{}; seeking anyway", e);
        }
        if let Some(ticks) = command.position_ticks {
            self.player.local_seek(ticks).await;
        }
    }

    async fn run_stop(&self) {
        self.player.local_stop().await;
    }

    async fn run_seek(&self, command: Command) {
        let target = command.position_ticks.unwrap_or(0);
        let mut rx = self.player.subscribe();
        self.player.local_unpause().await;
        self.player.local_seek(target).await;

        match wait_for(
            &mut rx,
            |e| *e == PlayerEvent::Ready,
            COMMAND_EVENT_TIMEOUT,
            "ready after seek",
        )
        .await
        {
            Ok(_) => {
                self.player.local_pause().await;
                self.report_buffering_done(&command.playlist_item_id).await;
            }
            Err(e) => {
                debug!("{}; retrying seek", e);
                self.player.local_seek(target).await;
            }
        }
    }

    /// Arm the single command timer. `work` runs after `delay_ms` (or right
    /// away) unless a newer command or a teardown cancels it.
    fn arm(&self, delay_ms: i64, work: impl std::future::Future<Output = ()> + Send + 'static) {
        let token = CancellationToken::new();
        if let Some(old) = self.state.lock().timer.replace(token.clone()) {
            old.cancel();
        }
        tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(Duration::from_millis(delay_ms as u64)) => {}
                }
            }
            tokio::select! {
                _ = token.cancelled() => {}
                _ = work => {}
            }
        });
    }

    /// A moment after an unpause lands, let the drift corrector loose.
    fn arm_sync_guard(&self) {
        let guard_ms = self.settings.read().max_delay_speed_to_sync / 2;
        let token = CancellationToken::new();
        if let Some(old) = self.state.lock().sync_guard.replace(token.clone()) {
            old.cancel();
        }
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(Duration::from_millis(guard_ms)) => {
                    state.lock().sync_enabled = true;
                }
            }
        });
    }

    /// Cancel whatever is pending without forgetting the last command.
    /// Used when playback stops underneath a scheduled command.
    pub fn cancel_pending(&self) {
        let mut st = self.state.lock();
        st.cancel_timers();
        st.sync_enabled = false;
        self.player.set_playback_rate(1.0);
    }

    /// Full teardown on session disable.
    pub fn clear(&self) {
        let mut st = self.state.lock();
        st.cancel_timers();
        st.sync_enabled = false;
        st.sync_attempts = 0;
        st.last_command = None;
        st.last_delta_ms = 0.0;
        self.player.set_playback_rate(1.0);
    }

    async fn report_buffering_done(&self, playlist_item_id: &str) {
        let report = ServerRequest::Buffering {
            when: now_millis(),
            position_ticks: self.current_ticks(),
            is_playing: self.player.is_playing(),
            playlist_item_id: playlist_item_id.to_string(),
            buffering_done: true,
        };
        if let Err(e) = self.server.send(report).await {
            warn!("failed to report buffering done: {}", e);
        }
    }

    fn current_ticks(&self) -> i64 {
        (self.player.current_time_ms() * TICKS_PER_MS as f64).round() as i64
    }
}
