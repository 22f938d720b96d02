//! Call types and data structures

use crate::identity::{PeerProfile, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one call session
///
/// A fresh id is minted for every call attempt. Async continuations compare
/// the id they started with against the current session to detect that the
/// session they belong to has already ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Microphone only
    Audio,
    /// Microphone and camera
    Video,
}

impl CallKind {
    /// Check if video is captured for this kind
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Media types captured for this kind, audio first
    pub fn media_types(self) -> Vec<MediaType> {
        match self {
            Self::Audio => vec![MediaType::Audio],
            Self::Video => vec![MediaType::Audio, MediaType::Video],
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Types of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Externally visible call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// No call
    Idle,
    /// Outgoing call waiting for the callee
    Ringing,
    /// Incoming call waiting for a local decision
    Incoming,
    /// Accepted, signaling and ICE in progress
    Connecting,
    /// Media flowing
    Connected,
}

impl CallStatus {
    /// Check if a call of any kind is in progress
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description as exchanged over signaling
///
/// Serializes like a browser `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an SDP offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an SDP answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged over signaling
///
/// Serializes like a browser `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with no media association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Buffered invitation, retained only while the session is `Incoming`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIncoming {
    /// Who is calling
    pub caller_id: UserId,
    /// Caller display name
    pub caller_name: String,
    /// Caller avatar reference
    pub caller_avatar: Option<String>,
    /// Announced call kind
    pub call_kind: CallKind,
}

impl PendingIncoming {
    /// Caller as a peer profile
    pub fn caller_profile(&self) -> PeerProfile {
        PeerProfile {
            id: self.caller_id.clone(),
            display_name: self.caller_name.clone(),
            avatar: self.caller_avatar.clone(),
        }
    }
}

/// Why the underlying connection stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalState {
    /// Connectivity lost
    Disconnected,
    /// ICE or DTLS failed
    Failed,
}

/// Why a session returned to idle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Local user declined the incoming call
    Declined,
    /// Remote user hung up
    RemoteHangup,
    /// Remote user declined (or was busy)
    RemoteRejected,
    /// Connection reached a terminal state
    ConnectionLost(TerminalState),
    /// Setup aborted by a local failure
    Failed,
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// Session status changed
    StatusChanged {
        /// Session the change belongs to (`None` when returning to idle)
        call_id: Option<CallId>,
        /// New status
        status: CallStatus,
    },
    /// Incoming call received
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// The invitation
        invitation: PendingIncoming,
    },
    /// An invitation arrived while busy and was rejected automatically
    BusyRejected {
        /// Caller that was turned away
        caller_id: UserId,
    },
    /// The far side's media track arrived
    RemoteMediaArrived {
        /// Call identifier
        call_id: CallId,
        /// Track kind
        media_type: MediaType,
    },
    /// Connected duration advanced
    DurationChanged {
        /// Call identifier
        call_id: CallId,
        /// Seconds since the call connected
        seconds: u64,
    },
    /// Call setup failed; the session is already back to idle
    CallFailed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        error: String,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
}

/// Read-only view of the current session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSnapshot {
    /// Current status
    pub status: CallStatus,
    /// Current session id
    pub call_id: Option<CallId>,
    /// Call kind
    pub call_kind: Option<CallKind>,
    /// Remote party
    pub peer: Option<PeerProfile>,
    /// Invitation awaiting a decision
    pub pending_incoming: Option<PendingIncoming>,
    /// Microphone muted
    pub muted: bool,
    /// Camera disabled
    pub camera_off: bool,
    /// Seconds since connected
    pub duration_seconds: u64,
    /// When the call connected
    pub connected_at: Option<DateTime<Utc>>,
    /// Local capture is held
    pub has_local_media: bool,
    /// Remote media has arrived
    pub has_remote_media: bool,
    /// A peer connection exists
    pub has_connection: bool,
    /// Duration timer is running
    pub timer_running: bool,
}

impl CallSnapshot {
    /// Snapshot of an idle controller
    pub fn idle() -> Self {
        Self {
            status: CallStatus::Idle,
            call_id: None,
            call_kind: None,
            peer: None,
            pending_incoming: None,
            muted: false,
            camera_off: false,
            duration_seconds: 0,
            connected_at: None,
            has_local_media: false,
            has_remote_media: false,
            has_connection: false,
            timer_running: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_call_kind_media_types() {
        assert_eq!(CallKind::Audio.media_types(), vec![MediaType::Audio]);
        assert_eq!(
            CallKind::Video.media_types(),
            vec![MediaType::Audio, MediaType::Video]
        );
        assert!(!CallKind::Audio.has_video());
        assert!(CallKind::Video.has_video());
    }

    #[test]
    fn test_session_description_wire_format() {
        let offer = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_ice_candidate_wire_format() {
        let json = r#"{"candidate":"candidate:1 1 UDP 2122260223 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_idle_snapshot_holds_nothing() {
        let snapshot = CallSnapshot::idle();
        assert_eq!(snapshot.status, CallStatus::Idle);
        assert!(!snapshot.status.is_active());
        assert!(!snapshot.has_local_media);
        assert!(!snapshot.has_connection);
        assert!(snapshot.pending_incoming.is_none());
    }
}
