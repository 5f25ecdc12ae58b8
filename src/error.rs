use thiserror::Error;

/// Error kinds produced inside the coordinator.
///
/// None of these abort the session. Every transient failure is logged at a
/// level proportional to its expected frequency and the affected operation
/// falls back (keep the previous clock offset, seek anyway, drop the frame).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// RPC or data-channel failure while sampling a clock endpoint.
    #[error("clock sample failed for {source_id}: {detail}")]
    ClockSampleFailed { source_id: String, detail: String },

    /// Command emitted before the session was enabled.
    #[error("command emitted at {emitted_at} predates session enable at {enabled_at}")]
    StaleCommand { emitted_at: i64, enabled_at: i64 },

    /// Command addressed to a playlist item that is not the current one.
    #[error("command for playlist item {got}, but current item is {current:?}")]
    WrongPlaylistItem { got: String, current: Option<String> },

    /// Queue update whose timestamp is not newer than the stored one.
    #[error("trying to apply old update: {incoming} <= {stored}")]
    StaleQueueUpdate { incoming: i64, stored: i64 },

    /// Message or signaling for a peer with no live link.
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// Peer link closed while an exchange was pending.
    #[error("peer-disconnected")]
    PeerDisconnected,

    /// Unrecognized variant on the data channel or the server event stream.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// An awaited player event did not arrive in time.
    #[error("timed out waiting for player event {0}")]
    PlayerTimeout(&'static str),

    /// JSON parse failure or missing required fields on a wire frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Failure reported by the server transport.
    #[error("server request failed: {0}")]
    ServerRequest(String),

    /// Failure in the WebRTC stack while opening or driving a peer link.
    #[error("peer link failure: {0}")]
    PeerLink(String),
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(e: serde_json::Error) -> Self {
        CoordinatorError::MalformedFrame(e.to_string())
    }
}

impl From<webrtc::Error> for CoordinatorError {
    fn from(e: webrtc::Error) -> Self {
        CoordinatorError::PeerLink(e.to_string())
    }
}

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;
