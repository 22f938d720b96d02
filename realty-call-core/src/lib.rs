//! Realty Call - peer-to-peer call session coordination
//!
//! Establishes a direct audio/video connection between two platform users
//! through a signaling exchange relayed by the backend. The exchange is
//! asymmetric and only partially ordered: candidates may overtake the offer,
//! either side may hang up at any moment, and a second caller may ring a user
//! who is already on a call. This crate keeps exactly one call session per
//! client consistent through all of that:
//!
//! - **Single session state machine**: `Idle`, `Ringing`, `Incoming`,
//!   `Connecting`, `Connected`, each carrying only the resources valid for it
//! - **Stale-result discard**: work that completes after its session ended is
//!   released, never wired in
//! - **Candidate buffering**: remote candidates wait for the remote description
//! - **Busy rejection**: invitations during a call are rejected automatically
//!
//! # Examples
//!
//! ```rust,no_run
//! use realty_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//! let service = CallService::builder(Arc::new(relay.endpoint("agent-17")))
//!     .build()?;
//! service.start()?;
//!
//! let call_id = service
//!     .initiate_call(PeerProfile::new("client-42", "Jordan"), CallKind::Video)
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Call types and data structures
pub mod types;

/// User identity
pub mod identity;

/// Local media capture
pub mod media;

/// Remote candidate buffering
pub mod candidates;

/// Peer connection management
pub mod peer;

/// `webrtc` connection backend
#[cfg(feature = "rtc")]
pub mod rtc;

/// Signaling protocol and handlers
pub mod signaling;

/// In-process signaling relay
pub mod relay;

/// Connected-call duration timer
pub mod timer;

/// Call session controller
pub mod call;

/// Service orchestration
pub mod service;

// Re-export main types at crate root
pub use call::{CallController, CallControllerConfig, CallError};
pub use candidates::{Admission, CandidateBuffer};
pub use identity::{PeerProfile, UserId};
pub use media::{CaptureDevice, LocalMedia, LocalTrack, MediaCaptureGate, MediaError, MediaEvent};
pub use peer::{
    ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionId, MediaConnection,
    PeerConnectionManager, PeerConnector,
};
pub use relay::{MemoryRelay, RelayEndpoint};
#[cfg(feature = "rtc")]
pub use rtc::{RtcConfig, RtcPeerConnector};
pub use service::{CallService, CallServiceBuilder, ServiceConfig, ServiceError, ServiceEvent};
pub use signaling::{
    DeliveryPolicy, InboundSignal, OutboundSignal, SignalKind, SignalingHandler,
    SignalingTransport,
};
pub use timer::CallTimer;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallController, CallControllerConfig, CallError};
    pub use crate::identity::{PeerProfile, UserId};
    pub use crate::media::{CaptureDevice, MediaCaptureGate};
    pub use crate::relay::MemoryRelay;
    #[cfg(feature = "rtc")]
    pub use crate::rtc::RtcConfig;
    pub use crate::service::{CallService, ServiceConfig, ServiceEvent};
    pub use crate::signaling::{InboundSignal, OutboundSignal, SignalingTransport};
    pub use crate::types::{CallEvent, CallId, CallKind, CallSnapshot, CallStatus, EndReason};
}
