//! End-to-end coordinator scenarios against mock application seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, timeout, Duration};

use groupplay::error::CoordinatorResult;
use groupplay::messages::{
    CommandKind, GroupInfo, GroupUpdate, PlaybackCommand, QueueChangeReason, QueueRequestMode,
    QueueUpdate, QueueUpdateItem, RepeatMode, ServerConnection, ServerRequest, ServerTimeSample,
    ShuffleMode,
};
use groupplay::player::{MediaPlayer, RawPlayerEvent};
use groupplay::queue::{ItemLookup, MediaItem, QueueBackend, QueueItem};
use groupplay::{now_millis, Coordinator, SessionEvent, SessionPhase, SyncSettings, TICKS_PER_MS};

// ────────────────────────────────────────────────────────────────────────────
// Mock seams
// ────────────────────────────────────────────────────────────────────────────

struct MockServer {
    requests: Mutex<Vec<ServerRequest>>,
    clock_offset_ms: i64,
}

impl MockServer {
    fn new(clock_offset_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            clock_offset_ms,
        })
    }

    fn count(&self, pred: impl Fn(&ServerRequest) -> bool) -> usize {
        self.requests.lock().iter().filter(|r| pred(r)).count()
    }
}

#[async_trait]
impl ServerConnection for MockServer {
    async fn send(&self, request: ServerRequest) -> CoordinatorResult<()> {
        self.requests.lock().push(request);
        Ok(())
    }

    async fn server_time(&self) -> CoordinatorResult<ServerTimeSample> {
        let t = now_millis() + self.clock_offset_ms;
        Ok(ServerTimeSample {
            request_reception_time: t,
            response_transmission_time: t,
        })
    }
}

struct Library;

#[async_trait]
impl ItemLookup for Library {
    async fn items_by_ids(&self, ids: &[String]) -> CoordinatorResult<Vec<MediaItem>> {
        Ok(ids
            .iter()
            .map(|id| MediaItem {
                id: id.clone(),
                name: format!("Movie {}", id),
            })
            .collect())
    }
}

#[derive(Default)]
struct RecordingBackend {
    loads: Mutex<Vec<(usize, usize, i64)>>,
    current: Mutex<Option<String>>,
}

#[async_trait]
impl QueueBackend for RecordingBackend {
    async fn play(&self, _: &[String], _: usize, _: i64) {}

    async fn load_group_queue(&self, items: Vec<QueueItem>, start_index: usize, ticks: i64) {
        self.loads.lock().push((items.len(), start_index, ticks));
    }

    async fn set_current(&self, playlist_item_id: &str) {
        *self.current.lock() = Some(playlist_item_id.to_string());
    }

    async fn remove(&self, _: &[String]) {}
    async fn move_item(&self, _: &str, _: usize) {}
    async fn enqueue(&self, _: &[String], _: QueueRequestMode) {}
    async fn next(&self) {}
    async fn previous(&self) {}
    async fn set_repeat_mode(&self, _: RepeatMode) {}
    async fn set_shuffle_mode(&self, _: ShuffleMode) {}
    async fn refresh_view(&self) {}

    fn current_playlist_item_id(&self) -> Option<String> {
        self.current.lock().clone()
    }

    fn shuffle_mode(&self) -> ShuffleMode {
        ShuffleMode::Sorted
    }
}

/// A player that raises the matching raw events on every transition, the
/// way real backend glue does.
struct FakePlayer {
    adapter: Mutex<Option<Arc<groupplay::player::PlayerAdapter>>>,
    playing: AtomicBool,
    position_ms: Mutex<f64>,
    unpauses: AtomicUsize,
    seeks: Mutex<Vec<i64>>,
    rate: Mutex<f64>,
}

impl FakePlayer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            adapter: Mutex::new(None),
            playing: AtomicBool::new(false),
            position_ms: Mutex::new(0.0),
            unpauses: AtomicUsize::new(0),
            seeks: Mutex::new(Vec::new()),
            rate: Mutex::new(1.0),
        })
    }

    fn notify(&self, raw: RawPlayerEvent) {
        if let Some(adapter) = self.adapter.lock().clone() {
            adapter.notify(raw);
        }
    }
}

#[async_trait]
impl MediaPlayer for FakePlayer {
    async fn unpause(&self) {
        self.unpauses.fetch_add(1, Ordering::SeqCst);
        self.playing.store(true, Ordering::SeqCst);
        self.notify(RawPlayerEvent::Playing);
    }

    async fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.notify(RawPlayerEvent::Pause);
    }

    async fn seek(&self, position_ticks: i64) {
        self.seeks.lock().push(position_ticks);
        *self.position_ms.lock() = position_ticks as f64 / TICKS_PER_MS as f64;
        self.notify(RawPlayerEvent::Ready);
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

// ────────────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────────────

struct Session {
    server: Arc<MockServer>,
    backend: Arc<RecordingBackend>,
    player: Arc<FakePlayer>,
    coordinator: Arc<Coordinator>,
}

fn session_with(clock_offset_ms: i64, settings: SyncSettings) -> Session {
    let _ = simplelog::TermLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    let server = MockServer::new(clock_offset_ms);
    let backend = Arc::new(RecordingBackend::default());
    let coordinator = Coordinator::new(
        server.clone(),
        backend.clone(),
        Arc::new(Library),
        settings.into_handle(),
    );

    let player = FakePlayer::new();
    *player.adapter.lock() = Some(coordinator.player());
    coordinator.player().bind_local(player.clone());

    Session {
        server,
        backend,
        player,
        coordinator,
    }
}

fn session() -> Session {
    session_with(0, SyncSettings::default())
}

fn group() -> GroupInfo {
    GroupInfo {
        group_id: "g1".to_string(),
        group_name: "movie night".to_string(),
        ..Default::default()
    }
}

fn queue_update(reason: QueueChangeReason, last_update: i64, is_playing: bool) -> QueueUpdate {
    QueueUpdate {
        reason,
        last_update,
        playlist: vec![
            QueueUpdateItem {
                item_id: "i1".to_string(),
                playlist_item_id: "A".to_string(),
            },
            QueueUpdateItem {
                item_id: "i2".to_string(),
                playlist_item_id: "B".to_string(),
            },
        ],
        playing_item_index: 0,
        start_position_ticks: 10_000_000,
        is_playing,
        shuffle_mode: ShuffleMode::Sorted,
        repeat_mode: RepeatMode::None,
    }
}

async fn join_and_sync(s: &Session) {
    let mut rx = s.coordinator.subscribe();
    s.coordinator
        .handle_group_update(GroupUpdate::GroupJoined(group()))
        .await;
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::SyncReady) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    })
    .await
    .expect("first clock sync never arrived");
}

// ────────────────────────────────────────────────────────────────────────────
// Scenarios
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn joining_a_group_follows_and_mirrors_the_queue() {
    let s = session();
    join_and_sync(&s).await;
    assert_eq!(s.coordinator.phase(), SessionPhase::EnabledReady);

    s.coordinator
        .handle_group_update(GroupUpdate::PlayQueue(queue_update(
            QueueChangeReason::NewPlaylist,
            100,
            false,
        )))
        .await;

    // The client followed the group barrier and loaded the queue at the
    // reported start position (the group is paused, so no extrapolation).
    assert_eq!(
        s.server.count(|r| matches!(
            r,
            ServerRequest::SetIgnoreWait { ignore_wait: false }
        )),
        1
    );
    assert_eq!(*s.backend.loads.lock(), vec![(2, 0, 10_000_000)]);
    assert_eq!(
        s.coordinator.queue().current_playlist_item_id(),
        Some("A".to_string())
    );
}

#[tokio::test]
async fn scheduled_unpause_fires_and_duplicate_is_free() {
    let s = session();
    join_and_sync(&s).await;
    s.coordinator
        .handle_group_update(GroupUpdate::PlayQueue(queue_update(
            QueueChangeReason::SetCurrentItem,
            100,
            false,
        )))
        .await;

    *s.player.position_ms.lock() = 990.0;
    let when = now_millis() + 200;
    let command = PlaybackCommand {
        command: CommandKind::Unpause,
        when,
        emitted_at: when - 50,
        position_ticks: Some(10_000_000),
        playlist_item_id: "A".to_string(),
    };
    s.coordinator.handle_playback_command(command.clone()).await;
    s.coordinator.handle_playback_command(command).await;

    assert!(!s.player.is_playing());
    sleep(Duration::from_millis(500)).await;

    // One unpause despite the duplicate, and no corrective seek: the
    // player was only 10 ms behind the start position.
    assert!(s.player.is_playing());
    assert_eq!(s.player.unpauses.load(Ordering::SeqCst), 1);
    assert!(s.player.seeks.lock().is_empty());
}

#[tokio::test]
async fn late_unpause_catches_up_to_the_group() {
    let s = session();
    join_and_sync(&s).await;
    s.coordinator
        .handle_group_update(GroupUpdate::PlayQueue(queue_update(
            QueueChangeReason::SetCurrentItem,
            100,
            false,
        )))
        .await;

    let when = now_millis() - 500;
    s.coordinator
        .handle_playback_command(PlaybackCommand {
            command: CommandKind::Unpause,
            when,
            emitted_at: when - 10,
            position_ticks: Some(10_000_000),
            playlist_item_id: "A".to_string(),
        })
        .await;

    sleep(Duration::from_millis(300)).await;
    assert!(s.player.is_playing());
    let seeks = s.player.seeks.lock().clone();
    assert_eq!(seeks.len(), 1);
    assert!(
        (seeks[0] - 15_000_000).abs() < 1_000_000,
        "expected ~500 ms of catch-up, seeked to {}",
        seeks[0]
    );
}

#[tokio::test]
async fn drift_is_corrected_with_a_rate_nudge() {
    let s = session();
    join_and_sync(&s).await;
    s.coordinator
        .handle_group_update(GroupUpdate::PlayQueue(queue_update(
            QueueChangeReason::SetCurrentItem,
            100,
            false,
        )))
        .await;

    let when = now_millis();
    s.coordinator
        .handle_playback_command(PlaybackCommand {
            command: CommandKind::Unpause,
            when,
            emitted_at: when - 10,
            position_ticks: Some(0),
            playlist_item_id: "A".to_string(),
        })
        .await;

    // Wait out the sync guard (max_delay_speed_to_sync / 2 = 1.5 s).
    sleep(Duration::from_millis(1700)).await;

    // Report a position ~200 ms behind where the group is by now.
    let behind_ms = (now_millis() - when - 200) as f64;
    s.player.notify(RawPlayerEvent::TimeUpdate(behind_ms));
    sleep(Duration::from_millis(100)).await;

    let rate = s.player.rate();
    assert!(
        (rate - 1.2).abs() < 0.05,
        "expected ~1.2x catch-up rate, got {}",
        rate
    );

    // The nudge window passes and the rate is restored.
    sleep(Duration::from_millis(1200)).await;
    assert_eq!(s.player.rate(), 1.0);
}

#[tokio::test]
async fn stale_queue_updates_do_not_regress_the_view() {
    let s = session();
    join_and_sync(&s).await;

    s.coordinator
        .handle_group_update(GroupUpdate::PlayQueue(queue_update(
            QueueChangeReason::SetCurrentItem,
            1_500,
            false,
        )))
        .await;
    let before = s.coordinator.queue().view();

    let mut stale = queue_update(QueueChangeReason::SetCurrentItem, 1_200, false);
    stale.playing_item_index = 1;
    s.coordinator
        .handle_group_update(GroupUpdate::PlayQueue(stale))
        .await;

    let after = s.coordinator.queue().view();
    assert_eq!(after.last_update, before.last_update);
    assert_eq!(after.current_index, before.current_index);
}

#[tokio::test]
async fn clock_offset_shifts_the_local_fire_time() {
    // The server clock runs 300 ms ahead of ours.
    let s = session_with(300, SyncSettings::default());
    join_and_sync(&s).await;
    s.coordinator
        .handle_group_update(GroupUpdate::PlayQueue(queue_update(
            QueueChangeReason::SetCurrentItem,
            100,
            false,
        )))
        .await;

    // A command for "server now + 500" is locally ~200 ms away.
    let when = now_millis() + 300 + 500;
    s.coordinator
        .handle_playback_command(PlaybackCommand {
            command: CommandKind::Unpause,
            when,
            emitted_at: when - 50,
            position_ticks: Some(0),
            playlist_item_id: "A".to_string(),
        })
        .await;

    sleep(Duration::from_millis(80)).await;
    assert!(!s.player.is_playing(), "fired too early");
    sleep(Duration::from_millis(600)).await;
    assert!(s.player.is_playing());
}

#[tokio::test]
async fn leaving_the_group_restores_local_control() {
    let s = session();
    join_and_sync(&s).await;
    s.coordinator
        .handle_group_update(GroupUpdate::PlayQueue(queue_update(
            QueueChangeReason::SetCurrentItem,
            100,
            false,
        )))
        .await;

    // Grouped: a user action turns into a server request.
    s.coordinator.queue().next_track().await.unwrap();
    assert_eq!(
        s.server
            .count(|r| matches!(r, ServerRequest::NextTrack { .. })),
        1
    );

    s.coordinator
        .handle_group_update(GroupUpdate::GroupLeft)
        .await;
    assert_eq!(s.coordinator.phase(), SessionPhase::Disabled);

    // Ungrouped: the same action stays local.
    s.coordinator.queue().next_track().await.unwrap();
    assert_eq!(
        s.server
            .count(|r| matches!(r, ServerRequest::NextTrack { .. })),
        1
    );
}
