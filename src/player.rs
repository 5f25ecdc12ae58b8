//! Player adapter.
//!
//! A uniform contract over three situations: no media loaded, a real local
//! player, and playback rendered on another device. Local primitives are
//! no-ops in the first and last case, so the scheduler and drift corrector
//! never need to know which one is active.
//!
//! The embedding application binds its player backend and feeds raw player
//! notifications into [`PlayerAdapter::notify`]; the adapter translates them
//! into the coordinator's event names and debounces `waiting` into
//! [`PlayerEvent::Buffering`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::now_millis;

/// `waiting` must persist this long before it counts as buffering.
const BUFFERING_DEBOUNCE: Duration = Duration::from_millis(3000);

/// The real player owned by the application.
#[async_trait]
pub trait MediaPlayer: Send + Sync {
    async fn unpause(&self);
    async fn pause(&self);
    async fn seek(&self, position_ticks: i64);
    async fn stop(&self);
    fn set_rate(&self, rate: f64);
    fn rate(&self) -> f64;
    fn supports_rate(&self) -> bool;
    fn current_time_ms(&self) -> f64;
    fn is_playing(&self) -> bool;
}

/// Raw notifications from the backend, before translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawPlayerEvent {
    Playing,
    Pause,
    TimeUpdate(f64),
    Waiting,
    Ready,
}

/// Translated events the coordinator consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerEvent {
    PlaybackStart,
    PlaybackStop,
    Unpause,
    Pause,
    TimeUpdate { now_local: i64, position_ms: f64 },
    Ready,
    Buffering,
}

enum Binding {
    /// No media loaded; every local primitive is a no-op.
    NoActive,
    /// A real local player.
    Local(Arc<dyn MediaPlayer>),
    /// Media renders on another device; state arrives via
    /// [`PlayerAdapter::update_remote_state`].
    Remote,
}

#[derive(Default, Clone, Copy)]
struct RemoteState {
    playing: bool,
    position_ms: f64,
}

pub struct PlayerAdapter {
    binding: RwLock<Binding>,
    remote: Mutex<RemoteState>,
    events: broadcast::Sender<PlayerEvent>,
    buffering: Arc<AtomicBool>,
    waiting_guard: Mutex<Option<CancellationToken>>,
}

impl Default for PlayerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerAdapter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            binding: RwLock::new(Binding::NoActive),
            remote: Mutex::new(RemoteState::default()),
            events,
            buffering: Arc::new(AtomicBool::new(false)),
            waiting_guard: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    // ── Binding lifecycle ────────────────────────────────────────────────

    /// Attach a real local player. Emits `PlaybackStart`.
    pub fn bind_local(&self, player: Arc<dyn MediaPlayer>) {
        *self.binding.write() = Binding::Local(player);
        self.buffering.store(false, Ordering::Release);
        let _ = self.events.send(PlayerEvent::PlaybackStart);
    }

    /// Playback happens on another device. Emits `PlaybackStart`.
    pub fn bind_remote(&self) {
        *self.binding.write() = Binding::Remote;
        self.buffering.store(false, Ordering::Release);
        let _ = self.events.send(PlayerEvent::PlaybackStart);
    }

    /// Media unloaded. Emits `PlaybackStop`.
    pub fn unbind(&self) {
        *self.binding.write() = Binding::NoActive;
        self.cancel_waiting_guard();
        self.buffering.store(false, Ordering::Release);
        let _ = self.events.send(PlayerEvent::PlaybackStop);
    }

    pub fn update_remote_state(&self, playing: bool, position_ms: f64) {
        *self.remote.lock() = RemoteState {
            playing,
            position_ms,
        };
    }

    // ── Primitives ───────────────────────────────────────────────────────

    pub async fn local_unpause(&self) {
        if let Some(player) = self.local() {
            player.unpause().await;
        }
    }

    pub async fn local_pause(&self) {
        if let Some(player) = self.local() {
            player.pause().await;
        }
    }

    pub async fn local_seek(&self, position_ticks: i64) {
        if let Some(player) = self.local() {
            player.seek(position_ticks).await;
        }
    }

    pub async fn local_stop(&self) {
        if let Some(player) = self.local() {
            player.stop().await;
        }
    }

    pub fn set_playback_rate(&self, rate: f64) {
        if let Some(player) = self.local() {
            player.set_rate(rate);
        }
    }

    pub fn get_playback_rate(&self) -> f64 {
        self.local().map(|p| p.rate()).unwrap_or(1.0)
    }

    pub fn has_playback_rate(&self) -> bool {
        self.local().map(|p| p.supports_rate()).unwrap_or(false)
    }

    // ── Observations ─────────────────────────────────────────────────────

    pub fn current_time_ms(&self) -> f64 {
        match &*self.binding.read() {
            Binding::Local(player) => player.current_time_ms(),
            Binding::Remote => self.remote.lock().position_ms,
            Binding::NoActive => 0.0,
        }
    }

    pub fn is_playing(&self) -> bool {
        match &*self.binding.read() {
            Binding::Local(player) => player.is_playing(),
            Binding::Remote => self.remote.lock().playing,
            Binding::NoActive => false,
        }
    }

    pub fn is_playback_active(&self) -> bool {
        !matches!(&*self.binding.read(), Binding::NoActive)
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Acquire)
    }

    // ── Raw event intake ─────────────────────────────────────────────────

    pub fn notify(&self, raw: RawPlayerEvent) {
        match raw {
            RawPlayerEvent::Playing => {
                self.cancel_waiting_guard();
                self.buffering.store(false, Ordering::Release);
                let _ = self.events.send(PlayerEvent::Unpause);
            }
            RawPlayerEvent::Pause => {
                let _ = self.events.send(PlayerEvent::Pause);
            }
            RawPlayerEvent::TimeUpdate(position_ms) => {
                let _ = self.events.send(PlayerEvent::TimeUpdate {
                    now_local: now_millis(),
                    position_ms,
                });
            }
            RawPlayerEvent::Waiting => self.arm_waiting_guard(),
            RawPlayerEvent::Ready => {
                self.cancel_waiting_guard();
                self.buffering.store(false, Ordering::Release);
                let _ = self.events.send(PlayerEvent::Ready);
            }
        }
    }

    /// Only a `waiting` that persists for the full debounce window becomes
    /// a `Buffering` event.
    fn arm_waiting_guard(&self) {
        let mut guard = self.waiting_guard.lock();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());

        let buffering = self.buffering.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(BUFFERING_DEBOUNCE) => {
                    buffering.store(true, Ordering::Release);
                    let _ = events.send(PlayerEvent::Buffering);
                }
            }
        });
    }

    fn cancel_waiting_guard(&self) {
        if let Some(token) = self.waiting_guard.lock().take() {
            token.cancel();
        }
    }

    fn local(&self) -> Option<Arc<dyn MediaPlayer>> {
        match &*self.binding.read() {
            Binding::Local(player) => Some(player.clone()),
            _ => {
                debug!("player primitive ignored: no local player bound");
                None
            }
        }
    }
}

/// Wait for the first event matching `pred`, up to `dur`. Lagged receivers
/// skip ahead rather than fail; a timeout is an error the caller is
/// expected to fall back from.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<PlayerEvent>,
    pred: impl Fn(&PlayerEvent) -> bool,
    dur: Duration,
    what: &'static str,
) -> CoordinatorResult<PlayerEvent> {
    let fut = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    match timeout(dur, fut).await {
        Ok(Some(event)) => Ok(event),
        _ => Err(CoordinatorError::PlayerTimeout(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockPlayer {
        unpauses: AtomicUsize,
        pauses: AtomicUsize,
        seeks: Mutex<Vec<i64>>,
        rate: Mutex<f64>,
        playing: AtomicBool,
        position_ms: Mutex<f64>,
    }

    #[async_trait]
    impl MediaPlayer for MockPlayer {
        async fn unpause(&self) {
            self.unpauses.fetch_add(1, Ordering::SeqCst);
            self.playing.store(true, Ordering::SeqCst);
        }

        async fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            self.playing.store(false, Ordering::SeqCst);
        }

        async fn seek(&self, position_ticks: i64) {
            self.seeks.lock().push(position_ticks);
        }

        async fn stop(&self) {
            self.playing.store(false, Ordering::SeqCst);
        }

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
            *self.position_ms.lock()
        }

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn primitives_are_noops_without_local_player() {
        let adapter = Arc::new(PlayerAdapter::new());
        adapter.local_unpause().await;
        adapter.local_seek(123).await;
        adapter.set_playback_rate(1.5);
        assert_eq!(adapter.get_playback_rate(), 1.0);
        assert!(!adapter.has_playback_rate());
        assert!(!adapter.is_playback_active());
    }

    #[tokio::test]
    async fn local_binding_forwards_primitives() {
        let adapter = Arc::new(PlayerAdapter::new());
        let player = Arc::new(MockPlayer::default());
        adapter.bind_local(player.clone());

        adapter.local_unpause().await;
        adapter.local_seek(42).await;
        adapter.local_pause().await;
        adapter.set_playback_rate(1.2);

        assert_eq!(player.unpauses.load(Ordering::SeqCst), 1);
        assert_eq!(player.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(*player.seeks.lock(), vec![42]);
        assert_eq!(adapter.get_playback_rate(), 1.2);
        assert!(adapter.is_playback_active());
    }

    #[tokio::test]
    async fn remote_binding_observes_pushed_state() {
        let adapter = Arc::new(PlayerAdapter::new());
        adapter.bind_remote();
        adapter.update_remote_state(true, 1234.0);

        assert!(adapter.is_playing());
        assert_eq!(adapter.current_time_ms(), 1234.0);

        // Primitives still do nothing.
        adapter.local_pause().await;
        assert!(adapter.is_playing());
    }

    #[tokio::test]
    async fn short_waiting_is_not_buffering() {
        let adapter = Arc::new(PlayerAdapter::new());
        let mut rx = adapter.subscribe();

        adapter.notify(RawPlayerEvent::Waiting);
        sleep(Duration::from_millis(100)).await;
        adapter.notify(RawPlayerEvent::Ready);

        assert_eq!(rx.recv().await.unwrap(), PlayerEvent::Ready);
        assert!(!adapter.is_buffering());
    }

    #[tokio::test]
    async fn persistent_waiting_becomes_buffering() {
        let adapter = Arc::new(PlayerAdapter::new());
        let mut rx = adapter.subscribe();

        adapter.notify(RawPlayerEvent::Waiting);
        let event = wait_for(
            &mut rx,
            |e| *e == PlayerEvent::Buffering,
            Duration::from_millis(3500),
            "buffering",
        )
        .await
        .unwrap();
        assert_eq!(event, PlayerEvent::Buffering);
        assert!(adapter.is_buffering());

        adapter.notify(RawPlayerEvent::Ready);
        assert!(!adapter.is_buffering());
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let adapter = Arc::new(PlayerAdapter::new());
        let mut rx = adapter.subscribe();
        let err = wait_for(
            &mut rx,
            |e| *e == PlayerEvent::Ready,
            Duration::from_millis(50),
            "ready",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::PlayerTimeout("ready")));
    }
}
