//! Call signaling protocol
//!
//! Outbound signals are published through the backend relay, which re-emits
//! them as events on the recipient's private topic channel. The relay is
//! at-least-once and gives no ordering guarantee between offer/answer and
//! candidate events.
//!
//! Every [`OutboundSignal`] declares a [`DeliveryPolicy`]. Candidate delivery
//! is best-effort (a lost candidate removes one network path, the call may
//! still connect through another); every other signal is required and a send
//! failure aborts the attempt.

use crate::identity::UserId;
use crate::types::{CallKind, IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// A required signal could not be delivered
    #[error("Failed to send {kind} signal: {reason}")]
    SendFailed {
        /// Signal that failed
        kind: SignalKind,
        /// Transport error text
        reason: String,
    },

    /// Receiving from the transport failed
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// How a send failure is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Failure aborts the call attempt
    Required,
    /// Failure is logged and swallowed
    BestEffort,
}

/// Outbound signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Start ringing the callee
    Initiate,
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// One network candidate
    IceCandidate,
    /// Callee accepted
    Accept,
    /// Callee declined (or was busy)
    Reject,
    /// Either side hung up
    End,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiate => "initiate",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::End => "end",
        };
        f.write_str(name)
    }
}

/// Signal published to the backend relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum OutboundSignal {
    /// Ask the callee to ring
    #[serde(rename_all = "camelCase")]
    Initiate {
        /// Callee
        target_user_id: UserId,
        /// Announced call kind
        call_kind: CallKind,
        /// Caller display name
        caller_name: String,
        /// Caller avatar reference
        caller_avatar: Option<String>,
    },

    /// SDP offer for the callee
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Callee
        target_user_id: UserId,
        /// Offer
        offer: SessionDescription,
    },

    /// SDP answer for the caller
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Caller
        target_user_id: UserId,
        /// Answer
        answer: SessionDescription,
    },

    /// Local candidate for the peer
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Peer
        target_user_id: UserId,
        /// Candidate
        candidate: IceCandidate,
    },

    /// Callee accepted the invitation
    #[serde(rename_all = "camelCase")]
    Accept {
        /// Caller being answered
        caller_id: UserId,
        /// Callee display name
        accepter_name: String,
    },

    /// Callee declined the invitation
    #[serde(rename_all = "camelCase")]
    Reject {
        /// Caller being turned away
        caller_id: UserId,
    },

    /// Hang up
    #[serde(rename_all = "camelCase")]
    End {
        /// Peer being notified
        peer_id: UserId,
    },
}

impl OutboundSignal {
    /// Signal kind
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Initiate { .. } => SignalKind::Initiate,
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::IceCandidate { .. } => SignalKind::IceCandidate,
            Self::Accept { .. } => SignalKind::Accept,
            Self::Reject { .. } => SignalKind::Reject,
            Self::End { .. } => SignalKind::End,
        }
    }

    /// Delivery policy declared for this signal
    #[must_use]
    pub fn policy(&self) -> DeliveryPolicy {
        match self {
            Self::IceCandidate { .. } => DeliveryPolicy::BestEffort,
            _ => DeliveryPolicy::Required,
        }
    }

    /// User the signal is addressed to
    #[must_use]
    pub fn recipient(&self) -> &UserId {
        match self {
            Self::Initiate { target_user_id, .. }
            | Self::Offer { target_user_id, .. }
            | Self::Answer { target_user_id, .. }
            | Self::IceCandidate { target_user_id, .. } => target_user_id,
            Self::Accept { caller_id, .. } | Self::Reject { caller_id } => caller_id,
            Self::End { peer_id } => peer_id,
        }
    }
}

/// Event delivered on the local user's topic channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum InboundSignal {
    /// Someone is calling
    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    Incoming {
        /// Caller
        caller_id: UserId,
        /// Caller display name
        caller_name: String,
        /// Caller avatar reference
        #[serde(default)]
        caller_avatar: Option<String>,
        /// Announced call kind
        call_kind: CallKind,
    },

    /// Callee accepted our invitation
    #[serde(rename = "call:accepted")]
    Accepted {},

    /// Callee declined our invitation
    #[serde(rename = "call:rejected")]
    Rejected {},

    /// Peer hung up
    #[serde(rename = "call:ended")]
    Ended {},

    /// Caller's offer
    #[serde(rename = "call:offer", rename_all = "camelCase")]
    Offer {
        /// Caller
        caller_id: UserId,
        /// Offer
        offer: SessionDescription,
    },

    /// Callee's answer
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    Answer {
        /// Callee
        answerer_id: UserId,
        /// Answer
        answer: SessionDescription,
    },

    /// Peer's candidate
    #[serde(rename = "call:ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        /// Peer
        sender_id: UserId,
        /// Candidate
        candidate: IceCandidate,
    },
}

impl InboundSignal {
    /// Event name on the wire
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Incoming { .. } => "call:incoming",
            Self::Accepted {} => "call:accepted",
            Self::Rejected {} => "call:rejected",
            Self::Ended {} => "call:ended",
            Self::Offer { .. } => "call:offer",
            Self::Answer { .. } => "call:answer",
            Self::IceCandidate { .. } => "call:ice-candidate",
        }
    }

    /// Sender named in the payload, when the event carries one
    #[must_use]
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            Self::Incoming { caller_id, .. } | Self::Offer { caller_id, .. } => Some(caller_id),
            Self::Answer { answerer_id, .. } => Some(answerer_id),
            Self::IceCandidate { sender_id, .. } => Some(sender_id),
            Self::Accepted {} | Self::Rejected {} | Self::Ended {} => None,
        }
    }
}

/// Signaling transport trait
///
/// Implement this for the backend relay in use (HTTP + pub/sub, websocket,
/// or [`crate::relay::MemoryRelay`] in tests).
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a signal to its recipient
    async fn send(&self, signal: OutboundSignal) -> Result<(), Self::Error>;

    /// Receive the next event for the local user
    ///
    /// Returns `Ok(None)` once the channel is closed for good.
    async fn receive(&self) -> Result<Option<InboundSignal>, Self::Error>;
}

/// Upper bound on the receive error backoff multiplier
const MAX_BACKOFF_STEPS: u32 = 10;

/// Signaling handler applying delivery policy and receive backoff
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    error_count: AtomicU32,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            error_count: AtomicU32::new(0),
        }
    }

    /// Send a signal, applying its delivery policy
    ///
    /// # Errors
    ///
    /// Returns `SendFailed` if a required signal could not be delivered.
    /// Best-effort failures are logged and reported as success.
    #[tracing::instrument(skip(self, signal), fields(kind = %signal.kind(), to = %signal.recipient()))]
    pub async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        let kind = signal.kind();
        let policy = signal.policy();
        tracing::debug!("Sending signal");

        match self.transport.send(signal).await {
            Ok(()) => Ok(()),
            Err(e) => match policy {
                DeliveryPolicy::Required => {
                    tracing::warn!(error = %e, "Required signal failed");
                    Err(SignalingError::SendFailed {
                        kind,
                        reason: e.to_string(),
                    })
                }
                DeliveryPolicy::BestEffort => {
                    tracing::warn!(error = %e, "Best-effort signal dropped");
                    Ok(())
                }
            },
        }
    }

    /// Receive the next inbound event with error backoff
    ///
    /// # Errors
    ///
    /// Returns `TransportError` after backing off when the transport fails
    #[tracing::instrument(skip(self))]
    pub async fn receive(&self) -> Result<Option<InboundSignal>, SignalingError> {
        match self.transport.receive().await {
            Ok(signal) => {
                self.error_count.store(0, Ordering::SeqCst);
                if let Some(signal) = &signal {
                    tracing::debug!(event = signal.event_name(), "Received signal");
                }
                Ok(signal)
            }
            Err(e) => {
                let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                let backoff_duration =
                    Duration::from_millis(100 * u64::from(count.min(MAX_BACKOFF_STEPS)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    "Error receiving signal, backing off"
                );
                sleep(backoff_duration).await;
                Err(SignalingError::TransportError(e.to_string()))
            }
        }
    }

    /// Consecutive receive errors so far
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockError;

    impl fmt::Display for MockError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Mock error")
        }
    }

    impl std::error::Error for MockError {}

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<OutboundSignal>>,
        inbox: Mutex<VecDeque<InboundSignal>>,
        fail_sends: bool,
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        type Error = MockError;

        async fn send(&self, signal: OutboundSignal) -> Result<(), MockError> {
            if self.fail_sends {
                return Err(MockError);
            }
            self.sent.lock().unwrap().push(signal);
            Ok(())
        }

        async fn receive(&self) -> Result<Option<InboundSignal>, MockError> {
            self.inbox.lock().unwrap().pop_front().map(Some).ok_or(MockError)
        }
    }

    fn candidate_signal() -> OutboundSignal {
        OutboundSignal::IceCandidate {
            target_user_id: UserId::new("bob"),
            candidate: IceCandidate::new("candidate:1"),
        }
    }

    #[test]
    fn test_delivery_policies() {
        assert_eq!(candidate_signal().policy(), DeliveryPolicy::BestEffort);
        let end = OutboundSignal::End {
            peer_id: UserId::new("bob"),
        };
        assert_eq!(end.policy(), DeliveryPolicy::Required);
        assert_eq!(end.recipient(), &UserId::new("bob"));
        let reject = OutboundSignal::Reject {
            caller_id: UserId::new("eve"),
        };
        assert_eq!(reject.policy(), DeliveryPolicy::Required);
        assert_eq!(reject.kind().to_string(), "reject");
    }

    #[test]
    fn test_inbound_wire_format() {
        let json = r#"{"event":"call:incoming","callerId":"agent-1","callerName":"Ana","callerAvatar":null,"callKind":"video"}"#;
        let signal: InboundSignal = serde_json::from_str(json).unwrap();
        assert_eq!(
            signal,
            InboundSignal::Incoming {
                caller_id: UserId::new("agent-1"),
                caller_name: "Ana".to_string(),
                caller_avatar: None,
                call_kind: CallKind::Video,
            }
        );

        let ended: InboundSignal = serde_json::from_str(r#"{"event":"call:ended"}"#).unwrap();
        assert_eq!(ended, InboundSignal::Ended {});
        assert_eq!(ended.sender(), None);

        let ice = r#"{"event":"call:ice-candidate","senderId":"bob","candidate":{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}}"#;
        let signal: InboundSignal = serde_json::from_str(ice).unwrap();
        assert_eq!(signal.sender(), Some(&UserId::new("bob")));
        assert_eq!(signal.event_name(), "call:ice-candidate");
    }

    #[test]
    fn test_outbound_wire_format() {
        let signal = OutboundSignal::Initiate {
            target_user_id: UserId::new("client-9"),
            call_kind: CallKind::Audio,
            caller_name: "Ana".to_string(),
            caller_avatar: Some("a.png".to_string()),
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["signal"], "initiate");
        assert_eq!(json["targetUserId"], "client-9");
        assert_eq!(json["callKind"], "audio");
        assert_eq!(json["callerAvatar"], "a.png");

        let json = serde_json::to_value(candidate_signal()).unwrap();
        assert_eq!(json["signal"], "ice-candidate");
    }

    #[tokio::test]
    async fn test_required_send_failure_is_reported() {
        let transport = Arc::new(MockTransport {
            fail_sends: true,
            ..Default::default()
        });
        let handler = SignalingHandler::new(transport);

        let result = handler
            .send(OutboundSignal::Accept {
                caller_id: UserId::new("ana"),
                accepter_name: "Bob".to_string(),
            })
            .await;
        assert!(matches!(
            result,
            Err(SignalingError::SendFailed {
                kind: SignalKind::Accept,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_best_effort_send_failure_is_swallowed() {
        let transport = Arc::new(MockTransport {
            fail_sends: true,
            ..Default::default()
        });
        let handler = SignalingHandler::new(transport);
        assert!(handler.send(candidate_signal()).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_reaches_transport() {
        let transport = Arc::new(MockTransport::default());
        let handler = SignalingHandler::new(transport.clone());
        handler.send(candidate_signal()).await.unwrap();
        assert_eq!(*transport.sent.lock().unwrap(), vec![candidate_signal()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_errors_back_off_and_reset() {
        let transport = Arc::new(MockTransport::default());
        let handler = SignalingHandler::new(transport.clone());

        assert!(handler.receive().await.is_err());
        assert!(handler.receive().await.is_err());
        assert_eq!(handler.consecutive_errors(), 2);

        transport
            .inbox
            .lock()
            .unwrap()
            .push_back(InboundSignal::Accepted {});
        assert_eq!(
            handler.receive().await.unwrap(),
            Some(InboundSignal::Accepted {})
        );
        assert_eq!(handler.consecutive_errors(), 0);
    }
}
