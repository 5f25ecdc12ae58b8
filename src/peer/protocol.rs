//! Peer data-channel wire format.
//!
//! Every frame is a JSON object `{"type": "internal"|"external", "data":
//! {"type": ..., "data": ...}}`. The outer tag multiplexes two logical
//! channels over the one data channel: `internal` carries the coordinator's
//! own plumbing (clock pings), `external` carries application-level
//! broadcasts. Unknown inner types are rejected at parse time.

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};

/// Coordinator plumbing frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum InternalMessage {
    /// First half of a clock sample; `request_sent` is echoed back so the
    /// requester can match the response to its own send instant.
    #[serde(rename_all = "camelCase")]
    PingRequest { request_sent: i64 },
    /// Second half; the responder stamps reception and transmission on its
    /// own clock.
    #[serde(rename_all = "camelCase")]
    PingResponse {
        request_sent: i64,
        request_received: i64,
        response_sent: i64,
    },
}

/// Application-level frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ExternalMessage {
    /// This peer's current estimate of the server clock, re-broadcast so
    /// other peers can derive a transitive server offset through it.
    #[serde(rename_all = "camelCase")]
    TimeSyncServerUpdate { time_offset: f64, ping: f64 },
}

/// Top-level envelope for every frame on a peer data channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Envelope {
    Internal(InternalMessage),
    External(ExternalMessage),
}

/// Serialize a frame for the data channel.
pub fn encode_frame(envelope: &Envelope) -> Vec<u8> {
    serde_json::to_vec(envelope).expect("frame serialisation is infallible")
}

/// Parse an inbound frame. Distinguishes a frame that is not valid JSON
/// from one that is JSON with an unrecognized type tag, since the two are
/// reported differently.
pub fn decode_frame(data: &[u8]) -> CoordinatorResult<Envelope> {
    match serde_json::from_slice(data) {
        Ok(envelope) => Ok(envelope),
        Err(e) if e.to_string().contains("unknown variant") => {
            Err(CoordinatorError::UnknownMessageType(e.to_string()))
        }
        Err(e) => Err(CoordinatorError::MalformedFrame(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_request_wire_shape() {
        let frame = Envelope::Internal(InternalMessage::PingRequest { request_sent: 123 });
        let v: serde_json::Value = serde_json::from_slice(&encode_frame(&frame)).unwrap();
        assert_eq!(v["type"], "internal");
        assert_eq!(v["data"]["type"], "ping-request");
        assert_eq!(v["data"]["data"]["requestSent"], 123);
    }

    #[test]
    fn time_sync_update_wire_shape() {
        let frame = Envelope::External(ExternalMessage::TimeSyncServerUpdate {
            time_offset: -5.5,
            ping: 100.0,
        });
        let v: serde_json::Value = serde_json::from_slice(&encode_frame(&frame)).unwrap();
        assert_eq!(v["type"], "external");
        assert_eq!(v["data"]["type"], "time-sync-server-update");
        assert_eq!(v["data"]["data"]["timeOffset"], -5.5);
    }

    #[test]
    fn roundtrips_ping_response() {
        let frame = Envelope::Internal(InternalMessage::PingResponse {
            request_sent: 1,
            request_received: 2,
            response_sent: 3,
        });
        let back = decode_frame(&encode_frame(&frame)).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn rejects_garbage_and_unknown_types() {
        assert!(matches!(
            decode_frame(b"not json"),
            Err(CoordinatorError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_frame(br#"{"type": "internal", "data": {"type": "hole-punch", "data": {}}}"#),
            Err(CoordinatorError::UnknownMessageType(_))
        ));
    }
}
