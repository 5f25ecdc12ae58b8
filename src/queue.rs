//! Queue mirroring.
//!
//! While a group is joined, the server owns playlist order, current item,
//! shuffle and repeat. The application routes every user queue action
//! through [`QueueController`]; ungrouped it delegates straight to the
//! local [`QueueBackend`], grouped it converts the action into a typed
//! server request and waits for the authoritative `PlayQueue` broadcast to
//! come back and be applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::time::Duration;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::messages::{
    QueueChangeReason, QueueRequestMode, QueueUpdate, RepeatMode, ServerConnection, ServerRequest,
    ShuffleMode,
};
use crate::now_millis;
use crate::player::{wait_for, PlayerAdapter, PlayerEvent};
use crate::timesync::TimeSyncRegistry;
use crate::TICKS_PER_MS;

/// How long the start-playback report waits for the media to come up.
const MEDIA_START_TIMEOUT: Duration = Duration::from_secs(30);

/// A resolved library item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub id: String,
    pub name: String,
}

/// One slot of the mirrored queue: a resolved item plus the server's
/// playlist identity for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub item: MediaItem,
    pub playlist_item_id: String,
}

/// The locally mirrored server queue.
#[derive(Debug, Clone, Default)]
pub struct QueueView {
    pub items: Vec<QueueItem>,
    pub current_index: i64,
    pub start_position_ticks: i64,
    pub shuffle_mode: Option<ShuffleMode>,
    pub repeat_mode: Option<RepeatMode>,
    pub last_update: i64,
    pub reason: Option<QueueChangeReason>,
}

impl QueueView {
    pub fn current_playlist_item_id(&self) -> Option<String> {
        if self.current_index < 0 {
            return None;
        }
        self.items
            .get(self.current_index as usize)
            .map(|i| i.playlist_item_id.clone())
    }
}

/// Resolves item ids against the library.
#[async_trait]
pub trait ItemLookup: Send + Sync {
    async fn items_by_ids(&self, ids: &[String]) -> CoordinatorResult<Vec<MediaItem>>;
}

/// The application's own playlist surface. Grouped updates and ungrouped
/// passthrough both land here; the controller decides which path runs.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Ungrouped user play.
    async fn play(&self, item_ids: &[String], start_index: usize, start_position_ticks: i64);
    /// Replace the local playlist with the group queue and start the media.
    async fn load_group_queue(
        &self,
        items: Vec<QueueItem>,
        start_index: usize,
        start_position_ticks: i64,
    );
    async fn set_current(&self, playlist_item_id: &str);
    async fn remove(&self, playlist_item_ids: &[String]);
    async fn move_item(&self, playlist_item_id: &str, new_index: usize);
    async fn enqueue(&self, item_ids: &[String], mode: QueueRequestMode);
    async fn next(&self);
    async fn previous(&self);
    async fn set_repeat_mode(&self, mode: RepeatMode);
    async fn set_shuffle_mode(&self, mode: ShuffleMode);
    /// Re-render the playlist view after order changed under it.
    async fn refresh_view(&self);
    fn current_playlist_item_id(&self) -> Option<String>;
    fn shuffle_mode(&self) -> ShuffleMode;
}

pub struct QueueController {
    grouped: AtomicBool,
    /// Whether we joined the group's wait-for-ready barrier.
    following: AtomicBool,
    backend: Arc<dyn QueueBackend>,
    lookup: Arc<dyn ItemLookup>,
    server: Arc<dyn ServerConnection>,
    timesync: Arc<TimeSyncRegistry>,
    player: Arc<PlayerAdapter>,
    view: Mutex<QueueView>,
}

impl QueueController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        lookup: Arc<dyn ItemLookup>,
        server: Arc<dyn ServerConnection>,
        timesync: Arc<TimeSyncRegistry>,
        player: Arc<PlayerAdapter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            grouped: AtomicBool::new(false),
            following: AtomicBool::new(false),
            backend,
            lookup,
            server,
            timesync,
            player,
            view: Mutex::new(QueueView::default()),
        })
    }

    /// Route user actions to the server from now on.
    pub fn enable(&self) {
        self.grouped.store(true, Ordering::Release);
        self.following.store(false, Ordering::Release);
    }

    /// Back to plain local behaviour; the mirrored view is dropped.
    pub fn disable(&self) {
        self.grouped.store(false, Ordering::Release);
        self.following.store(false, Ordering::Release);
        *self.view.lock() = QueueView::default();
    }

    pub fn is_grouped(&self) -> bool {
        self.grouped.load(Ordering::Acquire)
    }

    pub fn view(&self) -> QueueView {
        self.view.lock().clone()
    }

    pub fn current_playlist_item_id(&self) -> Option<String> {
        self.view.lock().current_playlist_item_id()
    }

    // ── Intercepted user actions ─────────────────────────────────────────

    pub async fn play(
        &self,
        item_ids: Vec<String>,
        start_index: usize,
        start_position_ticks: i64,
    ) -> CoordinatorResult<()> {
        if self.is_grouped() {
            self.server
                .send(ServerRequest::Play {
                    playing_queue: item_ids,
                    playing_item_position: start_index as i64,
                    start_position_ticks,
                })
                .await
        } else {
            self.backend
                .play(&item_ids, start_index, start_position_ticks)
                .await;
            Ok(())
        }
    }

    pub async fn set_current_playlist_item(&self, playlist_item_id: &str) -> CoordinatorResult<()> {
        if self.is_grouped() {
            self.server
                .send(ServerRequest::SetPlaylistItem {
                    playlist_item_id: playlist_item_id.to_string(),
                })
                .await
        } else {
            self.backend.set_current(playlist_item_id).await;
            Ok(())
        }
    }

    pub async fn remove_from_playlist(
        &self,
        playlist_item_ids: Vec<String>,
    ) -> CoordinatorResult<()> {
        if self.is_grouped() {
            self.server
                .send(ServerRequest::RemoveFromPlaylist { playlist_item_ids })
                .await
        } else {
            self.backend.remove(&playlist_item_ids).await;
            Ok(())
        }
    }

    pub async fn move_playlist_item(
        &self,
        playlist_item_id: &str,
        new_index: usize,
    ) -> CoordinatorResult<()> {
        if self.is_grouped() {
            self.server
                .send(ServerRequest::MovePlaylistItem {
                    playlist_item_id: playlist_item_id.to_string(),
                    new_index: new_index as i64,
                })
                .await
        } else {
            self.backend.move_item(playlist_item_id, new_index).await;
            Ok(())
        }
    }

    pub async fn queue(&self, item_ids: Vec<String>) -> CoordinatorResult<()> {
        self.enqueue(item_ids, QueueRequestMode::Default).await
    }

    pub async fn queue_next(&self, item_ids: Vec<String>) -> CoordinatorResult<()> {
        self.enqueue(item_ids, QueueRequestMode::Next).await
    }

    async fn enqueue(&self, item_ids: Vec<String>, mode: QueueRequestMode) -> CoordinatorResult<()> {
        if self.is_grouped() {
            self.server
                .send(ServerRequest::Queue { item_ids, mode })
                .await
        } else {
            self.backend.enqueue(&item_ids, mode).await;
            Ok(())
        }
    }

    pub async fn next_track(&self) -> CoordinatorResult<()> {
        if self.is_grouped() {
            let playlist_item_id = self.current_playlist_item_id().unwrap_or_default();
            self.server
                .send(ServerRequest::NextTrack { playlist_item_id })
                .await
        } else {
            self.backend.next().await;
            Ok(())
        }
    }

    pub async fn previous_track(&self) -> CoordinatorResult<()> {
        if self.is_grouped() {
            let playlist_item_id = self.current_playlist_item_id().unwrap_or_default();
            self.server
                .send(ServerRequest::PreviousTrack { playlist_item_id })
                .await
        } else {
            self.backend.previous().await;
            Ok(())
        }
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) -> CoordinatorResult<()> {
        if self.is_grouped() {
            self.server.send(ServerRequest::SetRepeatMode { mode }).await
        } else {
            self.backend.set_repeat_mode(mode).await;
            Ok(())
        }
    }

    pub async fn set_shuffle_mode(&self, mode: ShuffleMode) -> CoordinatorResult<()> {
        if self.is_grouped() {
            self.server
                .send(ServerRequest::SetShuffleMode { mode })
                .await
        } else {
            self.backend.set_shuffle_mode(mode).await;
            Ok(())
        }
    }

    pub async fn toggle_shuffle_mode(&self) -> CoordinatorResult<()> {
        let current = if self.is_grouped() {
            self.view.lock().shuffle_mode.unwrap_or(ShuffleMode::Sorted)
        } else {
            self.backend.shuffle_mode()
        };
        let next = match current {
            ShuffleMode::Sorted => ShuffleMode::Shuffle,
            ShuffleMode::Shuffle => ShuffleMode::Sorted,
        };
        self.set_shuffle_mode(next).await
    }

    // ── Server-driven updates ────────────────────────────────────────────

    /// Apply one authoritative queue broadcast.
    pub async fn apply_update(&self, update: QueueUpdate) -> CoordinatorResult<()> {
        {
            let view = self.view.lock();
            if update.last_update <= view.last_update {
                return Err(CoordinatorError::StaleQueueUpdate {
                    incoming: update.last_update,
                    stored: view.last_update,
                });
            }
        }

        let ids: Vec<String> = update.playlist.iter().map(|i| i.item_id.clone()).collect();
        let resolved = self.lookup.items_by_ids(&ids).await?;

        let mut items = Vec::with_capacity(update.playlist.len());
        for entry in &update.playlist {
            match resolved.iter().find(|m| m.id == entry.item_id) {
                Some(item) => items.push(QueueItem {
                    item: item.clone(),
                    playlist_item_id: entry.playlist_item_id.clone(),
                }),
                None => warn!("queue item {} not found in library, skipped", entry.item_id),
            }
        }

        let snapshot = {
            let mut view = self.view.lock();
            *view = QueueView {
                items,
                current_index: update.playing_item_index,
                start_position_ticks: update.start_position_ticks,
                shuffle_mode: Some(update.shuffle_mode),
                repeat_mode: Some(update.repeat_mode),
                last_update: update.last_update,
                reason: Some(update.reason),
            };
            view.clone()
        };

        match update.reason {
            QueueChangeReason::NewPlaylist => {
                if !self.following.swap(true, Ordering::AcqRel) {
                    self.server
                        .send(ServerRequest::SetIgnoreWait { ignore_wait: false })
                        .await?;
                }
                self.start_playback(&snapshot, update.is_playing).await;
            }
            QueueChangeReason::SetCurrentItem
            | QueueChangeReason::NextTrack
            | QueueChangeReason::PreviousTrack => {
                if let Some(id) = snapshot.current_playlist_item_id() {
                    self.backend.set_current(&id).await;
                }
            }
            QueueChangeReason::RemoveItems => {
                self.backend.refresh_view().await;
                let expected = snapshot.current_playlist_item_id();
                if self.backend.current_playlist_item_id() != expected {
                    if let Some(id) = expected {
                        self.backend.set_current(&id).await;
                    }
                }
            }
            QueueChangeReason::MoveItem
            | QueueChangeReason::Queue
            | QueueChangeReason::QueueNext => {
                self.backend.refresh_view().await;
            }
            QueueChangeReason::RepeatMode => {
                self.backend.set_repeat_mode(update.repeat_mode).await;
            }
            QueueChangeReason::ShuffleMode => {
                self.backend.set_shuffle_mode(update.shuffle_mode).await;
            }
        }
        Ok(())
    }

    /// Where the group is *now*, given the position it reported at
    /// `last_update`.
    pub fn estimate_current_ticks(&self, start_position_ticks: i64, last_update: i64) -> i64 {
        let server_now = self.timesync.local_to_remote(now_millis());
        start_position_ticks + (server_now - last_update).max(0) * TICKS_PER_MS
    }

    async fn start_playback(&self, snapshot: &QueueView, group_is_playing: bool) {
        let start_ticks = if group_is_playing {
            self.estimate_current_ticks(snapshot.start_position_ticks, snapshot.last_update)
        } else {
            snapshot.start_position_ticks
        };
        let index = snapshot.current_index.max(0) as usize;
        self.backend
            .load_group_queue(snapshot.items.clone(), index, start_ticks)
            .await;

        // Once the media is up, report ready-and-paused so the group's
        // barrier can release everyone together.
        let player = self.player.clone();
        let server = self.server.clone();
        let playlist_item_id = snapshot.current_playlist_item_id().unwrap_or_default();
        tokio::spawn(async move {
            let mut rx = player.subscribe();
            match wait_for(
                &mut rx,
                |e| matches!(*e, PlayerEvent::Ready | PlayerEvent::Unpause),
                MEDIA_START_TIMEOUT,
                "media start",
            )
            .await
            {
                Ok(_) => player.local_pause().await,
                Err(e) => debug!("reporting buffering done without media start: {}", e),
            }
            let position_ticks = (player.current_time_ms() * TICKS_PER_MS as f64) as i64;
            let report = ServerRequest::Buffering {
                when: now_millis(),
                position_ticks,
                is_playing: false,
                playlist_item_id,
                buffering_done: true,
            };
            if let Err(e) = server.send(report).await {
                warn!("failed to report buffering done: {}", e);
            }
        });
    }
}
