//! Synchronized group-playback coordinator.
//!
//! A set of media clients, each playing the same stream, cooperate through a
//! central server (and optionally direct peer data channels) so that every
//! client renders the same media position at the same wall-clock instant.
//! This crate is the client-side coordinator: it estimates server time,
//! turns time-stamped server commands into precisely timed local player
//! actions, corrects playback drift, and mirrors the server-owned play queue.
//!
//! ## Architecture
//!
//! ```text
//!  server messages ──► SessionController ──► CommandScheduler ──► PlayerAdapter
//!                            │                                        ▲
//!                            ├──► QueueController                     │
//!                            │                                  DriftCorrector
//!                            └──► PeerMesh ◄──► PeerLink (WebRTC data channel)
//!                                   │
//!                            TimeSyncRegistry ◄── TimeSyncSource (server / peer)
//! ```
//!
//! The embedding application supplies the outward seams: a
//! [`ServerConnection`](messages::ServerConnection) for typed requests, a
//! [`MediaPlayer`](player::MediaPlayer) backend, a
//! [`QueueBackend`](queue::QueueBackend) for the local playlist, and an
//! [`ItemLookup`](queue::ItemLookup) to resolve item ids. Everything else is
//! owned here and wired together by [`Coordinator::new`].

pub mod drift;
pub mod error;
pub mod messages;
pub mod peer;
pub mod player;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod timesync;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::CoordinatorError;
pub use session::{Coordinator, SessionEvent, SessionPhase};
pub use settings::{SettingsHandle, SyncSettings};

/// Media positions are measured in ticks of 100 µs.
pub const TICKS_PER_MS: i64 = 10_000;

/// Current local wall-clock time in unix-epoch milliseconds.
///
/// All instants exchanged with the server or with peers are unix-epoch
/// milliseconds; offsets translate between the local and the remote clock.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
