//! User identity for call participants
//!
//! Calls are addressed by the platform's user identifier. The display name and
//! avatar reference travel with the invitation so the callee can render the
//! caller before any media flows.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Platform user identifier
///
/// Opaque to this crate; it is only compared for equality and used to address
/// signaling messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Who is on the other end of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    /// User identifier
    pub id: UserId,
    /// Human readable name shown in call UI
    pub display_name: String,
    /// Avatar image reference (URL or storage key)
    pub avatar: Option<String>,
}

impl PeerProfile {
    /// Create a profile with no avatar
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar: None,
        }
    }

    /// Attach an avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

impl Display for PeerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display() {
        let id = UserId::new("realtor-42");
        assert_eq!(id.to_string(), "realtor-42");
        assert_eq!(id.as_str(), "realtor-42");
    }

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let id = UserId::from("client-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"client-7\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_peer_profile_builder() {
        let profile = PeerProfile::new("u1", "Dana Broker").with_avatar("avatars/u1.png");
        assert_eq!(profile.id, UserId::new("u1"));
        assert_eq!(profile.avatar.as_deref(), Some("avatars/u1.png"));
        assert_eq!(profile.to_string(), "Dana Broker (u1)");
    }
}
