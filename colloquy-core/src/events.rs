//! Event types consumed by a UI layer.
//!
//! The UI collaborator sees exactly `{ phase, loudness, error message }` and
//! maps a single toggle action onto connect/disconnect. All types derive
//! `serde` with camelCase renames so they can cross an IPC or WebSocket
//! boundary unchanged.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a voice session.
///
/// `Closed` and `Errored` are terminal: a finished controller is never
/// resurrected, a new session needs a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Controller created; `connect()` not yet called.
    Idle,
    /// Device acquisition and remote handshake in progress.
    Connecting,
    /// Full-duplex audio flowing.
    Live,
    /// Session ended (local disconnect or orderly remote close).
    Closed,
    /// Session ended by a failure; see the event detail for the message.
    Errored,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Closed | SessionPhase::Errored)
    }
}

/// Emitted on every phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub phase: SessionPhase,
    /// Optional human-readable detail (e.g. a user-facing error message).
    pub detail: Option<String>,
}

/// Emitted at the visual refresh cadence while the session is live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Output loudness normalized to [0.0, 1.0].
    pub level: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_phase() {
        let event = SessionStatusEvent {
            phase: SessionPhase::Connecting,
            detail: Some("opening microphone".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["phase"], "connecting");
        assert_eq!(json["detail"], "opening microphone");

        let round_trip: SessionStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.phase, SessionPhase::Connecting);
    }

    #[test]
    fn loudness_event_uses_camel_case_fields() {
        let event = LoudnessEvent { seq: 41, level: 0.62 };
        let json = serde_json::to_value(event).expect("serialize loudness event");
        assert_eq!(json["seq"], 41);
        let level = json["level"].as_f64().expect("level should be a number");
        assert!((level - 0.62).abs() < 1e-5);
    }

    #[test]
    fn only_closed_and_errored_are_terminal() {
        assert!(SessionPhase::Closed.is_terminal());
        assert!(SessionPhase::Errored.is_terminal());
        assert!(!SessionPhase::Idle.is_terminal());
        assert!(!SessionPhase::Connecting.is_terminal());
        assert!(!SessionPhase::Live.is_terminal());
    }
}
