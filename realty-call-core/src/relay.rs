//! In-process signaling relay
//!
//! [`MemoryRelay`] behaves like the backend the clients talk to: each user has
//! a private topic channel, and a published signal is re-emitted as the
//! matching `call:*` event on the recipient's channel with the sender filled
//! in from the publishing endpoint. Used by the integration tests and by the
//! CLI demo.
//!
//! Tests can inject send failures per [`SignalKind`] and hold signals of a kind
//! back to simulate reordering between offer/answer and candidate delivery.

use crate::identity::UserId;
use crate::signaling::{InboundSignal, OutboundSignal, SignalKind, SignalingTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Failure injected for this signal kind
    #[error("Injected failure for {0} signal")]
    Injected(SignalKind),

    /// The endpoint was replaced by a newer registration
    #[error("Endpoint for {0} is no longer registered")]
    Detached(UserId),
}

#[derive(Default)]
struct RelayState {
    topics: HashMap<UserId, mpsc::UnboundedSender<InboundSignal>>,
    failing: HashSet<SignalKind>,
    holding: HashSet<SignalKind>,
    held: Vec<(UserId, InboundSignal)>,
    published: Vec<(UserId, OutboundSignal)>,
}

/// In-memory backend relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` and return their endpoint
    ///
    /// Registering the same user again replaces the previous topic channel.
    #[must_use]
    pub fn endpoint(&self, user: impl Into<UserId>) -> RelayEndpoint {
        let user = user.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().topics.insert(user.clone(), tx);
        tracing::debug!(user = %user, "Relay endpoint registered");
        RelayEndpoint {
            user,
            state: self.state.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Make every send of `kind` fail until cleared
    pub fn fail(&self, kind: SignalKind) {
        self.state.lock().failing.insert(kind);
    }

    /// Stop failing sends of `kind`
    pub fn clear_failure(&self, kind: SignalKind) {
        self.state.lock().failing.remove(&kind);
    }

    /// Accept but withhold deliveries of `kind` until [`Self::release_held`]
    pub fn hold(&self, kind: SignalKind) {
        self.state.lock().holding.insert(kind);
    }

    /// Deliver every withheld event in publish order and stop holding
    pub fn release_held(&self) {
        let mut state = self.state.lock();
        state.holding.clear();
        let held = std::mem::take(&mut state.held);
        for (to, event) in held {
            deliver(&state.topics, &to, event);
        }
    }

    /// Push an event straight onto a user's channel
    pub fn inject(&self, to: &UserId, event: InboundSignal) {
        deliver(&self.state.lock().topics, to, event);
    }

    /// Every signal published so far, with its publisher
    #[must_use]
    pub fn published(&self) -> Vec<(UserId, OutboundSignal)> {
        self.state.lock().published.clone()
    }

    /// Signals published by one user
    #[must_use]
    pub fn published_by(&self, user: &UserId) -> Vec<OutboundSignal> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, signal)| signal.clone())
            .collect()
    }

    /// Unregister a user; their endpoint then reports the channel closed
    pub fn disconnect(&self, user: &UserId) {
        self.state.lock().topics.remove(user);
    }
}

fn deliver(
    topics: &HashMap<UserId, mpsc::UnboundedSender<InboundSignal>>,
    to: &UserId,
    event: InboundSignal,
) {
    match topics.get(to) {
        Some(topic) => {
            if topic.send(event).is_err() {
                tracing::debug!(user = %to, "Topic receiver gone, event dropped");
            }
        }
        // Publishing to a channel nobody listens on is not an error for the backend
        None => tracing::debug!(user = %to, "No subscriber, event dropped"),
    }
}

/// Rewrite a published signal into the event its recipient sees
fn translate(from: &UserId, signal: OutboundSignal) -> (UserId, InboundSignal) {
    match signal {
        OutboundSignal::Initiate {
            target_user_id,
            call_kind,
            caller_name,
            caller_avatar,
        } => (
            target_user_id,
            InboundSignal::Incoming {
                caller_id: from.clone(),
                caller_name,
                caller_avatar,
                call_kind,
            },
        ),
        OutboundSignal::Offer {
            target_user_id,
            offer,
        } => (
            target_user_id,
            InboundSignal::Offer {
                caller_id: from.clone(),
                offer,
            },
        ),
        OutboundSignal::Answer {
            target_user_id,
            answer,
        } => (
            target_user_id,
            InboundSignal::Answer {
                answerer_id: from.clone(),
                answer,
            },
        ),
        OutboundSignal::IceCandidate {
            target_user_id,
            candidate,
        } => (
            target_user_id,
            InboundSignal::IceCandidate {
                sender_id: from.clone(),
                candidate,
            },
        ),
        OutboundSignal::Accept { caller_id, .. } => (caller_id, InboundSignal::Accepted {}),
        OutboundSignal::Reject { caller_id } => (caller_id, InboundSignal::Rejected {}),
        OutboundSignal::End { peer_id } => (peer_id, InboundSignal::Ended {}),
    }
}

/// One user's connection to a [`MemoryRelay`]
pub struct RelayEndpoint {
    user: UserId,
    state: Arc<Mutex<RelayState>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundSignal>>,
}

impl RelayEndpoint {
    /// User this endpoint publishes as
    pub fn user(&self) -> &UserId {
        &self.user
    }
}

#[async_trait]
impl SignalingTransport for RelayEndpoint {
    type Error = RelayError;

    async fn send(&self, signal: OutboundSignal) -> Result<(), RelayError> {
        let kind = signal.kind();
        let mut state = self.state.lock();
        if state.failing.contains(&kind) {
            return Err(RelayError::Injected(kind));
        }
        if !state.topics.contains_key(&self.user) {
            return Err(RelayError::Detached(self.user.clone()));
        }

        state.published.push((self.user.clone(), signal.clone()));
        let (to, event) = translate(&self.user, signal);
        if state.holding.contains(&kind) {
            tracing::trace!(%kind, to = %to, "Holding event");
            state.held.push((to, event));
        } else {
            deliver(&state.topics, &to, event);
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<InboundSignal>, RelayError> {
        Ok(self.inbox.lock().await.recv().await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CallKind, IceCandidate, SessionDescription};

    #[tokio::test]
    async fn test_initiate_becomes_incoming_with_sender() {
        let relay = MemoryRelay::new();
        let ana = relay.endpoint("ana");
        let bob = relay.endpoint("bob");

        ana.send(OutboundSignal::Initiate {
            target_user_id: UserId::new("bob"),
            call_kind: CallKind::Video,
            caller_name: "Ana".to_string(),
            caller_avatar: None,
        })
        .await
        .unwrap();

        assert_eq!(
            bob.receive().await.unwrap(),
            Some(InboundSignal::Incoming {
                caller_id: UserId::new("ana"),
                caller_name: "Ana".to_string(),
                caller_avatar: None,
                call_kind: CallKind::Video,
            })
        );
    }

    #[tokio::test]
    async fn test_end_and_reject_carry_no_payload() {
        let relay = MemoryRelay::new();
        let ana = relay.endpoint("ana");
        let bob = relay.endpoint("bob");

        bob.send(OutboundSignal::Reject {
            caller_id: UserId::new("ana"),
        })
        .await
        .unwrap();
        bob.send(OutboundSignal::End {
            peer_id: UserId::new("ana"),
        })
        .await
        .unwrap();

        assert_eq!(ana.receive().await.unwrap(), Some(InboundSignal::Rejected {}));
        assert_eq!(ana.receive().await.unwrap(), Some(InboundSignal::Ended {}));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let relay = MemoryRelay::new();
        let ana = relay.endpoint("ana");
        let _bob = relay.endpoint("bob");
        relay.fail(SignalKind::Offer);

        let offer = OutboundSignal::Offer {
            target_user_id: UserId::new("bob"),
            offer: SessionDescription::offer("v=0"),
        };
        assert_eq!(
            ana.send(offer.clone()).await,
            Err(RelayError::Injected(SignalKind::Offer))
        );
        assert!(relay.published().is_empty());

        relay.clear_failure(SignalKind::Offer);
        assert!(ana.send(offer).await.is_ok());
    }

    #[tokio::test]
    async fn test_hold_reorders_delivery() {
        let relay = MemoryRelay::new();
        let ana = relay.endpoint("ana");
        let bob = relay.endpoint("bob");
        relay.hold(SignalKind::Offer);

        ana.send(OutboundSignal::Offer {
            target_user_id: UserId::new("bob"),
            offer: SessionDescription::offer("v=0"),
        })
        .await
        .unwrap();
        ana.send(OutboundSignal::IceCandidate {
            target_user_id: UserId::new("bob"),
            candidate: IceCandidate::new("candidate:1"),
        })
        .await
        .unwrap();
        relay.release_held();

        let first = bob.receive().await.unwrap().unwrap();
        let second = bob.receive().await.unwrap().unwrap();
        assert_eq!(first.event_name(), "call:ice-candidate");
        assert_eq!(second.event_name(), "call:offer");
    }

    #[tokio::test]
    async fn test_disconnect_closes_channel() {
        let relay = MemoryRelay::new();
        let ana = relay.endpoint("ana");
        relay.disconnect(&UserId::new("ana"));
        assert_eq!(ana.receive().await.unwrap(), None);
    }
}
