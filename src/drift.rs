//! Continuous drift correction.
//!
//! While the group is unpaused, every player time update is compared to
//! where the server says playback should be. Small drift is corrected by
//! nudging the playback rate for a bounded window; drift too large for that
//! is corrected with a seek. Both strategies disable themselves while the
//! correction runs, then re-arm through a timer, so corrections never
//! overlap.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::messages::CommandKind;
use crate::player::{PlayerAdapter, PlayerEvent};
use crate::scheduler::SharedSyncState;
use crate::settings::SettingsHandle;
use crate::timesync::TimeSyncRegistry;
use crate::TICKS_PER_MS;

/// A rate nudge never slows playback below this factor.
const MIN_SPEED: f64 = 0.2;

/// Published for the UI's sync indicator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionEvent {
    RateNudge {
        delta_ms: f64,
        speed: f64,
        duration_ms: u64,
    },
    SeekNudge {
        delta_ms: f64,
    },
    InSync,
}

#[derive(Clone)]
pub struct DriftCorrector {
    state: SharedSyncState,
    player: Arc<PlayerAdapter>,
    timesync: Arc<TimeSyncRegistry>,
    settings: SettingsHandle,
    events: broadcast::Sender<CorrectionEvent>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl DriftCorrector {
    pub fn new(
        state: SharedSyncState,
        player: Arc<PlayerAdapter>,
        timesync: Arc<TimeSyncRegistry>,
        settings: SettingsHandle,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state,
            player,
            timesync,
            settings,
            events,
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CorrectionEvent> {
        self.events.subscribe()
    }

    /// Follow the player's time-update stream until stopped.
    pub fn start(&self) {
        let token = CancellationToken::new();
        if let Some(old) = self.cancel.lock().replace(token.clone()) {
            old.cancel();
        }

        let this = self.clone();
        let mut rx = self.player.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    e = rx.recv() => e,
                };
                match event {
                    Ok(PlayerEvent::TimeUpdate {
                        now_local,
                        position_ms,
                    }) => this.on_time_update(now_local, position_ms).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    async fn on_time_update(&self, now_local: i64, position_ms: f64) {
        let settings = self.settings.read().clone();
        if !settings.enable_sync_correction {
            return;
        }
        if self.player.is_buffering() || !self.player.is_playback_active() {
            return;
        }

        // One correction at a time, and only in the unpaused steady state.
        let command = {
            let st = self.state.lock();
            if !st.sync_enabled {
                return;
            }
            match &st.last_command {
                Some(c) if c.kind == CommandKind::Unpause => c.clone(),
                _ => return,
            }
        };

        let server_now = self.timesync.local_to_remote(now_local);
        let expected_ticks = command.position_ticks.unwrap_or(0)
            + (server_now - command.when_server).max(0) * TICKS_PER_MS;
        let current_ticks = (position_ms * TICKS_PER_MS as f64) as i64;
        let delta_ms = (expected_ticks - current_ticks) as f64 / TICKS_PER_MS as f64;

        let threshold = settings.max_delay_speed_to_sync as f64;
        {
            let mut st = self.state.lock();
            st.last_delta_ms = delta_ms;
            if ((now_local - st.last_sync_time) as f64) < threshold / 2.0 {
                return;
            }
            st.last_sync_time = now_local;
        }

        let abs = delta_ms.abs();
        if self.player.has_playback_rate()
            && settings.use_speed_to_sync
            && abs >= settings.min_delay_speed_to_sync as f64
            && abs < threshold
        {
            self.rate_nudge(delta_ms, settings.speed_to_sync_duration as f64);
        } else if settings.use_skip_to_sync && abs >= settings.min_delay_skip_to_sync as f64 {
            self.seek_nudge(delta_ms, expected_ticks, threshold).await;
        } else {
            let was_nudging = {
                let mut st = self.state.lock();
                let was = st.sync_attempts > 0;
                st.sync_attempts = 0;
                was
            };
            if was_nudging {
                let _ = self.events.send(CorrectionEvent::InSync);
            }
        }
    }

    /// Catch up (or fall back) by running at `1 + delta/T` for `T` ms. A
    /// large negative delta stretches `T` so the speed never drops below
    /// [`MIN_SPEED`].
    fn rate_nudge(&self, delta_ms: f64, mut duration_ms: f64) {
        if delta_ms <= -(duration_ms * MIN_SPEED) {
            duration_ms = delta_ms.abs() / (1.0 - MIN_SPEED);
        }
        let speed = 1.0 + delta_ms / duration_ms;
        debug_assert!(speed > 0.0, "nudge speed must stay positive");

        debug!(
            "rate nudge: delta {:.1} ms, speed {:.3} for {:.0} ms",
            delta_ms, speed, duration_ms
        );
        self.player.set_playback_rate(speed);

        let token = CancellationToken::new();
        {
            let mut st = self.state.lock();
            st.sync_enabled = false;
            st.sync_attempts += 1;
            if let Some(old) = st.rate_restore.replace(token.clone()) {
                old.cancel();
            }
        }
        let _ = self.events.send(CorrectionEvent::RateNudge {
            delta_ms,
            speed,
            duration_ms: duration_ms as u64,
        });

        let state = self.state.clone();
        let player = self.player.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(Duration::from_millis(duration_ms as u64)) => {
                    player.set_playback_rate(1.0);
                    state.lock().sync_enabled = true;
                }
            }
        });
    }

    /// Jump straight to the expected position, then hold off further
    /// corrections for half the method threshold.
    async fn seek_nudge(&self, delta_ms: f64, expected_ticks: i64, threshold_ms: f64) {
        debug!("seek nudge: delta {:.1} ms", delta_ms);
        self.player.local_seek(expected_ticks).await;

        let token = CancellationToken::new();
        {
            let mut st = self.state.lock();
            st.sync_enabled = false;
            st.sync_attempts += 1;
            if let Some(old) = st.sync_guard.replace(token.clone()) {
                old.cancel();
            }
        }
        let _ = self.events.send(CorrectionEvent::SeekNudge { delta_ms });

        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(Duration::from_millis((threshold_ms / 2.0) as u64)) => {
                    state.lock().sync_enabled = true;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinatorResult;
    use crate::messages::{Command, ServerConnection, ServerRequest, ServerTimeSample};
    use crate::now_millis;
    use crate::player::{MediaPlayer, RawPlayerEvent};
    use crate::scheduler::SyncState;
    use crate::settings::SyncSettings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NullServer;

    #[async_trait]
    impl ServerConnection for NullServer {
        async fn send(&self, _request: ServerRequest) -> CoordinatorResult<()> {
            Ok(())
        }

        async fn server_time(&self) -> CoordinatorResult<ServerTimeSample> {
            let t = now_millis();
            Ok(ServerTimeSample {
                request_reception_time: t,
                response_transmission_time: t,
            })
        }
    }

    struct RatePlayer {
        rate: Mutex<f64>,
        seeks: Mutex<Vec<i64>>,
        playing: AtomicBool,
    }

    impl RatePlayer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rate: Mutex::new(1.0),
                seeks: Mutex::new(Vec::new()),
                playing: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl MediaPlayer for RatePlayer {
        async fn unpause(&self) {
            self.playing.store(true, Ordering::SeqCst);
        }
        async fn pause(&self) {
            self.playing.store(false, Ordering::SeqCst);
        }
        async fn seek(&self, position_ticks: i64) {
            self.seeks.lock().push(position_ticks);
        }
        async fn stop(&self) {}
        fn set_rate(&self, rate: f64) {
            *self.rate.lock() = rate;
        }
        fn rate(&self) -> f64 {
            *self.rate.lock()
        }
        fn supports_rate(&self) -> bool {
            true
        }
        fn current_time_ms(&self) -> f64 {
            0.0
        }
        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
    }

    struct Rig {
        player: Arc<RatePlayer>,
        adapter: Arc<PlayerAdapter>,
        state: SharedSyncState,
        corrector: DriftCorrector,
    }

    fn rig(settings: SyncSettings) -> Rig {
        let settings = settings.into_handle();
        let adapter = Arc::new(PlayerAdapter::new());
        let player = RatePlayer::new();
        adapter.bind_local(player.clone());

        let timesync = Arc::new(TimeSyncRegistry::new(Arc::new(NullServer), settings.clone()));
        let state = SyncState::new();
        let corrector = DriftCorrector::new(state.clone(), adapter.clone(), timesync, settings);
        corrector.start();
        Rig {
            player,
            adapter,
            state,
            corrector,
        }
    }

    fn unpaused_since(state: &SharedSyncState, when_server: i64) {
        let mut st = state.lock();
        st.last_command = Some(Command {
            kind: CommandKind::Unpause,
            when_server,
            emitted_at_server: when_server,
            position_ticks: Some(0),
            playlist_item_id: "A".to_string(),
        });
        st.sync_enabled = true;
    }

    #[tokio::test]
    async fn rate_nudges_when_slightly_behind() {
        let r = rig(SyncSettings::default());
        // Unpaused 1 s ago at tick 0; the player sits at 800 ms, so it is
        // ~200 ms behind.
        unpaused_since(&r.state, now_millis() - 1000);
        r.adapter.notify(RawPlayerEvent::TimeUpdate(800.0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let rate = r.player.rate();
        assert!(
            (rate - 1.2).abs() < 0.05,
            "expected ~1.2x catch-up rate, got {}",
            rate
        );
        assert!(!r.state.lock().sync_enabled);
        assert_eq!(r.state.lock().sync_attempts, 1);

        // After speed_to_sync_duration the rate is restored and correction
        // re-enabled.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(r.player.rate(), 1.0);
        assert!(r.state.lock().sync_enabled);
    }

    #[tokio::test]
    async fn large_negative_delta_clamps_to_min_speed() {
        let r = rig(SyncSettings::default());
        // Player is 900 ms ahead.
        unpaused_since(&r.state, now_millis() - 1000);
        r.adapter.notify(RawPlayerEvent::TimeUpdate(1900.0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let rate = r.player.rate();
        assert!(
            (rate - MIN_SPEED).abs() < 0.05,
            "expected clamp to {}, got {}",
            MIN_SPEED,
            rate
        );
    }

    #[tokio::test]
    async fn seeks_when_rate_control_is_off() {
        let mut settings = SyncSettings::default();
        settings.use_speed_to_sync = false;
        settings.max_delay_speed_to_sync = 200;
        let r = rig(settings);

        // ~1 s behind: beyond the skip threshold.
        unpaused_since(&r.state, now_millis() - 2000);
        r.adapter.notify(RawPlayerEvent::TimeUpdate(1000.0));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seeks = r.player.seeks.lock().clone();
        assert_eq!(seeks.len(), 1);
        assert!(
            (seeks[0] - 20_000_000).abs() < 500_000,
            "seeked to {}",
            seeks[0]
        );
        assert!(!r.state.lock().sync_enabled);

        // Re-enabled after threshold / 2.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(r.state.lock().sync_enabled);
        r.corrector.stop();
    }

    #[tokio::test]
    async fn disabled_gate_blocks_all_side_effects() {
        let r = rig(SyncSettings::default());
        unpaused_since(&r.state, now_millis() - 2000);
        r.state.lock().sync_enabled = false;

        r.adapter.notify(RawPlayerEvent::TimeUpdate(0.0));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(r.player.rate(), 1.0);
        assert!(r.player.seeks.lock().is_empty());
    }

    #[tokio::test]
    async fn corrections_are_rate_limited() {
        let r = rig(SyncSettings::default());
        unpaused_since(&r.state, now_millis());

        // First update is in sync and consumes the rate-limit slot.
        r.adapter.notify(RawPlayerEvent::TimeUpdate(10.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(r.player.rate(), 1.0);

        // A large drift right after is ignored: half the method threshold
        // has not elapsed yet.
        r.adapter.notify(RawPlayerEvent::TimeUpdate(800.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(r.player.rate(), 1.0);
        assert!(r.player.seeks.lock().is_empty());
    }

    #[tokio::test]
    async fn ignores_non_unpause_commands() {
        let r = rig(SyncSettings::default());
        {
            let mut st = r.state.lock();
            st.last_command = Some(Command {
                kind: CommandKind::Pause,
                when_server: now_millis(),
                emitted_at_server: now_millis(),
                position_ticks: Some(0),
                playlist_item_id: "A".to_string(),
            });
            st.sync_enabled = true;
        }
        r.adapter.notify(RawPlayerEvent::TimeUpdate(5000.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(r.player.rate(), 1.0);
        assert!(r.player.seeks.lock().is_empty());
    }
}
