//! Server wire types.
//!
//! Everything exchanged with the coordination server is defined here so that
//! every module speaks the same language: inbound group updates and playback
//! commands, outbound typed requests, and the [`ServerConnection`] seam the
//! embedding application implements on top of its own transport.
//!
//! Inbound messages use the server's `{"Type": ..., "Data": ...}` envelope;
//! outbound requests use `{"type": ..., "data": ...}`. Unknown variants fail
//! to parse and are logged and dropped by the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoordinatorResult;

// ────────────────────────────────────────────────────────────────────────────
// Playback commands
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Unpause,
    Pause,
    Seek,
    Stop,
}

/// A server-authored directive, as received on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlaybackCommand {
    pub command: CommandKind,
    /// Server instant at which the command takes effect (unix ms).
    pub when: i64,
    /// Server instant at which the command was emitted (unix ms).
    pub emitted_at: i64,
    #[serde(default)]
    pub position_ticks: Option<i64>,
    pub playlist_item_id: String,
}

/// The scheduler's view of a command. [`Command::is_duplicate_of`] against
/// the previously applied command is what classifies a duplicate
/// reassertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub when_server: i64,
    pub emitted_at_server: i64,
    pub position_ticks: Option<i64>,
    pub playlist_item_id: String,
}

impl Command {
    /// A re-asserted command carries a fresh emission instant; identity is
    /// the action itself: what, when, where, and for which item.
    pub fn is_duplicate_of(&self, other: &Command) -> bool {
        self.kind == other.kind
            && self.when_server == other.when_server
            && self.position_ticks == other.position_ticks
            && self.playlist_item_id == other.playlist_item_id
    }
}

impl From<PlaybackCommand> for Command {
    fn from(c: PlaybackCommand) -> Self {
        Command {
            kind: c.command,
            when_server: c.when,
            emitted_at_server: c.emitted_at,
            position_ticks: c.position_ticks,
            playlist_item_id: c.playlist_item_id,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Group state
// ────────────────────────────────────────────────────────────────────────────

/// Group metadata. The coordinator reads only the identity fields; anything
/// else the server sends is kept opaque in `extra` and echoed to the UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupInfo {
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatMode {
    #[serde(rename = "RepeatNone")]
    None,
    #[serde(rename = "RepeatOne")]
    One,
    #[serde(rename = "RepeatAll")]
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuffleMode {
    Sorted,
    Shuffle,
}

/// Why the server re-broadcast the play queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueChangeReason {
    NewPlaylist,
    SetCurrentItem,
    NextTrack,
    PreviousTrack,
    RemoveItems,
    MoveItem,
    Queue,
    QueueNext,
    RepeatMode,
    ShuffleMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueUpdateItem {
    pub item_id: String,
    pub playlist_item_id: String,
}

/// Server-broadcast queue state (`PlayQueue` payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueUpdate {
    pub reason: QueueChangeReason,
    /// Server instant of this snapshot; older snapshots are rejected.
    pub last_update: i64,
    pub playlist: Vec<QueueUpdateItem>,
    pub playing_item_index: i64,
    pub start_position_ticks: i64,
    pub is_playing: bool,
    pub shuffle_mode: ShuffleMode,
    pub repeat_mode: RepeatMode,
}

// ────────────────────────────────────────────────────────────────────────────
// WebRTC signaling relay
// ────────────────────────────────────────────────────────────────────────────

/// Control artifacts relayed opaquely through the server. `from` is filled on
/// inbound messages, `to` on outbound ones. SDP and candidate payloads stay
/// as raw JSON; only the WebRTC layer interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_leaving: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<serde_json::Value>,
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound: server → client
// ────────────────────────────────────────────────────────────────────────────

/// Everything the server pushes at the coordinator besides playback commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Data")]
pub enum GroupUpdate {
    PlayQueue(QueueUpdate),
    UserJoined(String),
    UserLeft(String),
    GroupJoined(GroupInfo),
    NotInGroup,
    GroupLeft,
    GroupUpdate(GroupInfo),
    #[serde(rename_all = "PascalCase")]
    StateUpdate { state: String, reason: String },
    GroupDoesNotExist,
    CreateGroupDenied,
    JoinGroupDenied,
    LibraryAccessDenied,
    WebRTC(SignalingMessage),
    SyncPlayIsDisabled,
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound: client → server
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueRequestMode {
    Default,
    Next,
}

/// Typed requests the coordinator issues. User playback and queue actions
/// are reflected to the server through these rather than applied locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerRequest {
    Ping {
        ping: f64,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        playing_queue: Vec<String>,
        playing_item_position: i64,
        start_position_ticks: i64,
    },
    Pause,
    Unpause,
    #[serde(rename_all = "camelCase")]
    Seek {
        position_ticks: i64,
    },
    #[serde(rename_all = "camelCase")]
    Buffering {
        when: i64,
        position_ticks: i64,
        is_playing: bool,
        playlist_item_id: String,
        buffering_done: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetPlaylistItem {
        playlist_item_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RemoveFromPlaylist {
        playlist_item_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    MovePlaylistItem {
        playlist_item_id: String,
        new_index: i64,
    },
    #[serde(rename_all = "camelCase")]
    Queue {
        item_ids: Vec<String>,
        mode: QueueRequestMode,
    },
    #[serde(rename_all = "camelCase")]
    NextTrack {
        playlist_item_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PreviousTrack {
        playlist_item_id: String,
    },
    SetRepeatMode {
        mode: RepeatMode,
    },
    SetShuffleMode {
        mode: ShuffleMode,
    },
    #[serde(rename_all = "camelCase")]
    SetIgnoreWait {
        ignore_wait: bool,
    },
    Webrtc(SignalingMessage),
    #[serde(rename_all = "camelCase")]
    NewGroup {
        group_name: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinGroup {
        group_id: String,
    },
    LeaveGroup,
    ListGroups,
}

/// Reply to the `getServerTime` RPC. The sampler stamps `requestSent` and
/// `responseReceived` locally around the call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerTimeSample {
    pub request_reception_time: i64,
    pub response_transmission_time: i64,
}

/// Transport seam to the coordination server. The implementation is expected
/// to serialize its own requests; the coordinator never assumes more than
/// that a call either completes or fails.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    async fn send(&self, request: ServerRequest) -> CoordinatorResult<()>;
    async fn server_time(&self) -> CoordinatorResult<ServerTimeSample>;
}
