//! Call session controller
//!
//! [`CallController`] owns the single call session of a client and drives it
//! through the signaling exchange:
//!
//! ```text
//!            initiate_call                 call:accepted
//!   Idle ─────────────────► Ringing ─────────────────────► Connecting
//!    │                         │                               │
//!    │ call:incoming           │ connection connected          │ connection connected
//!    ▼                         ▼                               ▼
//!  Incoming ──accept_call──► Connecting ────────────────────► Connected
//!
//!   any non-Idle ── end_call / reject_call / call:ended / call:rejected
//!                   / connection terminal / setup failure ──► Idle
//! ```
//!
//! Session state lives behind a synchronous mutex that is never held across an
//! `.await`. Every continuation that resumes after a suspension (device
//! acquisition, signaling send, connection construction, SDP work) first checks
//! that the session it started for is still the current one, identified by its
//! [`CallId`]. A result that arrives for a superseded session is discarded: a
//! freshly acquired capture is released and a freshly built connection closed.

use crate::candidates::{Admission, CandidateBuffer};
use crate::identity::{PeerProfile, UserId};
use crate::media::{LocalMedia, MediaCaptureGate, MediaError};
use crate::peer::{
    ConnectionError, ConnectionEvent, ConnectionEventReceiver, ConnectionHandle, ConnectionId,
    PeerConnectionManager, PeerConnector,
};
use crate::signaling::{
    InboundSignal, OutboundSignal, SignalingError, SignalingHandler, SignalingTransport,
};
use crate::timer::CallTimer;
use crate::types::{
    CallEvent, CallId, CallKind, CallSnapshot, CallStatus, EndReason, IceCandidate, MediaType,
    PendingIncoming, SdpType, SessionDescription,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Call management errors
///
/// Whenever an operation returns an error other than `InvalidState`, the
/// session has already been returned to `Idle` and its resources released.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Operation not valid in the current status
    #[error("Invalid call state: {status:?}")]
    InvalidState {
        /// Status at the time of the call
        status: CallStatus,
    },

    /// Local capture failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// A required signal could not be delivered
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Connection setup or negotiation failed
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The session ended while this operation was in flight
    #[error("Call ended before the operation completed")]
    Cancelled,
}

/// Call controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallControllerConfig {
    /// The local user, announced to callees
    pub local: PeerProfile,
    /// Capacity of the call event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for CallControllerConfig {
    fn default() -> Self {
        Self {
            local: PeerProfile::new("anonymous", "Anonymous"),
            event_channel_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

/// Progress of the remote description on the current connection
#[derive(Debug)]
enum Negotiation {
    /// Nothing received yet
    Pending,
    /// Offer received before the local connection existed
    Held(SessionDescription),
    /// `set_remote_description` in flight
    Applying,
    /// Remote description applied and candidate buffer drained
    Applied,
}

struct IncomingCall {
    call_id: CallId,
    invitation: PendingIncoming,
    candidates: CandidateBuffer,
    held_offer: Option<SessionDescription>,
}

/// Ringing, connecting or connected session
struct LiveCall {
    call_id: CallId,
    role: Role,
    kind: CallKind,
    peer: PeerProfile,
    media: Option<LocalMedia>,
    connection: Option<ConnectionHandle>,
    candidates: CandidateBuffer,
    negotiation: Negotiation,
    remote_media: Vec<MediaType>,
    muted: bool,
    camera_off: bool,
}

impl LiveCall {
    fn outgoing(call_id: CallId, kind: CallKind, peer: PeerProfile) -> Self {
        Self {
            call_id,
            role: Role::Caller,
            kind,
            peer,
            media: None,
            connection: None,
            candidates: CandidateBuffer::new(),
            negotiation: Negotiation::Pending,
            remote_media: Vec::new(),
            muted: false,
            camera_off: false,
        }
    }

    fn accepted(incoming: IncomingCall) -> Self {
        let negotiation = match incoming.held_offer {
            Some(offer) => Negotiation::Held(offer),
            None => Negotiation::Pending,
        };
        Self {
            call_id: incoming.call_id,
            role: Role::Callee,
            kind: incoming.invitation.call_kind,
            peer: incoming.invitation.caller_profile(),
            media: None,
            connection: None,
            candidates: incoming.candidates,
            negotiation,
            remote_media: Vec::new(),
            muted: false,
            camera_off: false,
        }
    }

    fn owns_connection(&self, id: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id() == id)
    }

    fn take_held_offer(&mut self) -> Option<SessionDescription> {
        match std::mem::replace(&mut self.negotiation, Negotiation::Applying) {
            Negotiation::Held(offer) => Some(offer),
            other => {
                self.negotiation = other;
                None
            }
        }
    }

    fn fill(&self, snapshot: &mut CallSnapshot) {
        snapshot.call_id = Some(self.call_id);
        snapshot.call_kind = Some(self.kind);
        snapshot.peer = Some(self.peer.clone());
        snapshot.muted = self.muted;
        snapshot.camera_off = self.camera_off;
        snapshot.has_local_media = self.media.is_some();
        snapshot.has_remote_media = !self.remote_media.is_empty();
        snapshot.has_connection = self.connection.is_some();
    }
}

struct ConnectedCall {
    live: LiveCall,
    timer: CallTimer,
    connected_at: DateTime<Utc>,
}

enum Session {
    Idle,
    Ringing(LiveCall),
    Incoming(IncomingCall),
    Connecting(LiveCall),
    Connected(ConnectedCall),
}

impl Session {
    fn status(&self) -> CallStatus {
        match self {
            Self::Idle => CallStatus::Idle,
            Self::Ringing(_) => CallStatus::Ringing,
            Self::Incoming(_) => CallStatus::Incoming,
            Self::Connecting(_) => CallStatus::Connecting,
            Self::Connected(_) => CallStatus::Connected,
        }
    }

    fn call_id(&self) -> Option<CallId> {
        match self {
            Self::Idle => None,
            Self::Incoming(incoming) => Some(incoming.call_id),
            Self::Ringing(live) | Self::Connecting(live) => Some(live.call_id),
            Self::Connected(connected) => Some(connected.live.call_id),
        }
    }

    fn live_any_mut(&mut self) -> Option<&mut LiveCall> {
        match self {
            Self::Ringing(live) | Self::Connecting(live) => Some(live),
            Self::Connected(connected) => Some(&mut connected.live),
            Self::Idle | Self::Incoming(_) => None,
        }
    }

    /// Live call with this id, if it is still the current session
    fn live_mut(&mut self, call_id: CallId) -> Option<&mut LiveCall> {
        self.live_any_mut().filter(|live| live.call_id == call_id)
    }

    /// Live call owning this connection
    fn live_for_connection(&mut self, id: ConnectionId) -> Option<&mut LiveCall> {
        self.live_any_mut().filter(|live| live.owns_connection(id))
    }

    /// Candidate buffer (and connection, once built) for a candidate from `from`
    fn candidate_target(
        &mut self,
        from: &UserId,
    ) -> Option<(&mut CandidateBuffer, Option<ConnectionHandle>)> {
        match self {
            Self::Incoming(incoming) if incoming.invitation.caller_id == *from => {
                Some((&mut incoming.candidates, None))
            }
            Self::Idle | Self::Incoming(_) => None,
            Self::Ringing(live)
            | Self::Connecting(live)
            | Self::Connected(ConnectedCall { live, .. }) => {
                if live.peer.id == *from {
                    let connection = live.connection.clone();
                    Some((&mut live.candidates, connection))
                } else {
                    None
                }
            }
        }
    }

    /// The remote user of the current session
    fn peer_id(&self) -> Option<&UserId> {
        match self {
            Self::Idle => None,
            Self::Incoming(incoming) => Some(&incoming.invitation.caller_id),
            Self::Ringing(live) | Self::Connecting(live) => Some(&live.peer.id),
            Self::Connected(connected) => Some(&connected.live.peer.id),
        }
    }

    fn into_teardown(self) -> Option<Teardown> {
        let (live, timer) = match self {
            Self::Idle => return None,
            Self::Incoming(incoming) => {
                return Some(Teardown {
                    call_id: incoming.call_id,
                    peer: incoming.invitation.caller_id,
                    media: None,
                    connection: None,
                    timer: None,
                })
            }
            Self::Ringing(live) | Self::Connecting(live) => (live, None),
            Self::Connected(connected) => (connected.live, Some(connected.timer)),
        };
        Some(Teardown {
            call_id: live.call_id,
            peer: live.peer.id,
            media: live.media,
            connection: live.connection,
            timer,
        })
    }
}

/// Resources taken out of a session on its way to idle
struct Teardown {
    call_id: CallId,
    peer: UserId,
    media: Option<LocalMedia>,
    connection: Option<ConnectionHandle>,
    timer: Option<CallTimer>,
}

/// How an inbound invitation relates to the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invitation {
    Admitted,
    Redelivered,
    Busy,
}

/// What to do with an inbound offer or answer
enum RemoteDescriptionStep {
    Ignore(&'static str),
    Hold,
    Apply(CallId, ConnectionHandle),
}

/// Call session controller
///
/// One per signed-in client. The generic parameter `T` is the signaling
/// transport carrying `call:*` events to and from the backend relay.
pub struct CallController<T: SignalingTransport> {
    config: CallControllerConfig,
    signaling: SignalingHandler<T>,
    media: Arc<MediaCaptureGate>,
    connections: PeerConnectionManager,
    session: Mutex<Session>,
    event_sender: broadcast::Sender<CallEvent>,
    connection_events: Mutex<Option<ConnectionEventReceiver>>,
}

impl<T: SignalingTransport> CallController<T> {
    /// Create a controller
    #[must_use]
    pub fn new(
        config: CallControllerConfig,
        transport: Arc<T>,
        media: Arc<MediaCaptureGate>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        Self {
            config,
            signaling: SignalingHandler::new(transport),
            media,
            connections: PeerConnectionManager::new(connector, connection_tx),
            session: Mutex::new(Session::Idle),
            event_sender,
            connection_events: Mutex::new(Some(connection_rx)),
        }
    }

    /// The local user
    pub fn local_profile(&self) -> &PeerProfile {
        &self.config.local
    }

    /// The capture gate used for every session
    pub fn media(&self) -> &Arc<MediaCaptureGate> {
        &self.media
    }

    /// The signaling transport
    pub fn transport(&self) -> &Arc<T> {
        self.signaling.transport()
    }

    /// Current status
    pub fn status(&self) -> CallStatus {
        self.session.lock().status()
    }

    /// Read-only view of the current session
    pub fn snapshot(&self) -> CallSnapshot {
        let session = self.session.lock();
        let mut snapshot = CallSnapshot::idle();
        snapshot.status = session.status();
        match &*session {
            Session::Idle => {}
            Session::Incoming(incoming) => {
                snapshot.call_id = Some(incoming.call_id);
                snapshot.call_kind = Some(incoming.invitation.call_kind);
                snapshot.peer = Some(incoming.invitation.caller_profile());
                snapshot.pending_incoming = Some(incoming.invitation.clone());
            }
            Session::Ringing(live) | Session::Connecting(live) => live.fill(&mut snapshot),
            Session::Connected(connected) => {
                connected.live.fill(&mut snapshot);
                snapshot.duration_seconds = connected.timer.elapsed();
                snapshot.connected_at = Some(connected.connected_at);
                snapshot.timer_running = connected.timer.is_running();
            }
        }
        snapshot
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.event_sender.send(event);
    }

    fn publish_status(&self, call_id: Option<CallId>, status: CallStatus) {
        tracing::debug!(call_id = ?call_id, ?status, "Call state transition");
        self.publish(CallEvent::StatusChanged { call_id, status });
    }

    /// Start an outgoing call
    ///
    /// Acquires local media, rings the callee, builds the connection and sends
    /// the offer. Returns once the offer is sent; the call stays `Ringing` until
    /// the callee accepts or the connection comes up.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a call is already in progress, `Cancelled` if
    /// the session ended while setting up, or the failure that aborted setup.
    #[tracing::instrument(skip(self, peer, kind), fields(peer = %peer.id, kind = %kind))]
    pub async fn initiate_call(&self, peer: PeerProfile, kind: CallKind) -> Result<CallId, CallError> {
        let call_id = CallId::new();
        {
            let mut session = self.session.lock();
            if !matches!(*session, Session::Idle) {
                let status = session.status();
                tracing::warn!(?status, "Cannot start a call while another is in progress");
                return Err(CallError::InvalidState { status });
            }
            *session = Session::Ringing(LiveCall::outgoing(call_id, kind, peer.clone()));
        }
        tracing::info!(call_id = %call_id, "Initiating call");
        self.publish_status(Some(call_id), CallStatus::Ringing);

        self.acquire_media(call_id, kind).await?;
        self.send_required(
            call_id,
            OutboundSignal::Initiate {
                target_user_id: peer.id.clone(),
                call_kind: kind,
                caller_name: self.config.local.display_name.clone(),
                caller_avatar: self.config.local.avatar.clone(),
            },
        )
        .await?;

        let connection = self.open_connection(call_id, &peer.id).await?;
        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(call_id, e.into()).await),
        };
        self.ensure_current(call_id)?;
        self.send_required(
            call_id,
            OutboundSignal::Offer {
                target_user_id: peer.id,
                offer,
            },
        )
        .await?;

        tracing::debug!(call_id = %call_id, "Offer sent");
        Ok(call_id)
    }

    /// Accept the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the status is `Incoming`, `Cancelled` if
    /// the caller hung up meanwhile, or the failure that aborted setup.
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<CallId, CallError> {
        let (call_id, kind, caller) = {
            let mut session = self.session.lock();
            let incoming = match std::mem::replace(&mut *session, Session::Idle) {
                Session::Incoming(incoming) => incoming,
                other => {
                    let status = other.status();
                    *session = other;
                    return Err(CallError::InvalidState { status });
                }
            };
            let live = LiveCall::accepted(incoming);
            let accepted = (live.call_id, live.kind, live.peer.id.clone());
            *session = Session::Connecting(live);
            accepted
        };
        tracing::info!(call_id = %call_id, caller = %caller, "Accepting call");
        self.publish_status(Some(call_id), CallStatus::Connecting);

        self.acquire_media(call_id, kind).await?;
        self.send_required(
            call_id,
            OutboundSignal::Accept {
                caller_id: caller.clone(),
                accepter_name: self.config.local.display_name.clone(),
            },
        )
        .await?;

        let connection = self.open_connection(call_id, &caller).await?;
        let held_offer = {
            let mut session = self.session.lock();
            session
                .live_mut(call_id)
                .and_then(LiveCall::take_held_offer)
        };
        if let Some(offer) = held_offer {
            self.apply_remote(call_id, connection, offer, &caller).await?;
        }
        Ok(call_id)
    }

    /// Decline the pending incoming call
    ///
    /// The session is cleaned up even if the rejection cannot be delivered.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the status is `Incoming`, or the signaling
    /// error if the caller could not be notified.
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let (call_id, caller_id) = {
            let session = self.session.lock();
            match &*session {
                Session::Incoming(incoming) => {
                    (incoming.call_id, incoming.invitation.caller_id.clone())
                }
                other => {
                    return Err(CallError::InvalidState {
                        status: other.status(),
                    })
                }
            }
        };
        let Some(teardown) = self.detach(Some(call_id)) else {
            return Err(CallError::Cancelled);
        };

        let sent = self
            .signaling
            .send(OutboundSignal::Reject { caller_id })
            .await;
        self.finish(teardown, EndReason::Declined).await;
        sent.map_err(CallError::from)
    }

    /// Hang up whatever call is in progress; a no-op when idle
    ///
    /// # Errors
    ///
    /// Returns the signaling error if the peer could not be notified. The
    /// session is idle either way.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let Some(teardown) = self.detach(None) else {
            tracing::debug!("No call to end");
            return Ok(());
        };

        let sent = self
            .signaling
            .send(OutboundSignal::End {
                peer_id: teardown.peer.clone(),
            })
            .await;
        if let Err(e) = &sent {
            tracing::warn!(call_id = %teardown.call_id, error = %e, "Peer not notified of hangup");
        }
        self.finish(teardown, EndReason::LocalHangup).await;
        sent.map_err(CallError::from)
    }

    /// Flip microphone mute; returns the new muted state
    ///
    /// Returns `false` without effect while no local media is held.
    pub fn toggle_mute(&self) -> bool {
        let mut session = self.session.lock();
        let Some(live) = session.live_any_mut() else {
            return false;
        };
        let Some(media) = live.media.as_ref() else {
            return false;
        };
        let muted = !live.muted;
        self.media.set_muted(media, muted);
        live.muted = muted;
        tracing::debug!(call_id = %live.call_id, muted, "Microphone toggled");
        muted
    }

    /// Flip the camera; returns whether the camera is now off
    ///
    /// Returns `false` without effect while no local media is held or for an
    /// audio call.
    pub fn toggle_camera(&self) -> bool {
        let mut session = self.session.lock();
        let Some(live) = session.live_any_mut() else {
            return false;
        };
        let Some(media) = live.media.as_ref() else {
            return false;
        };
        if !live.kind.has_video() {
            return false;
        }
        let camera_off = !live.camera_off;
        self.media.set_camera_enabled(media, !camera_off);
        live.camera_off = camera_off;
        tracing::debug!(call_id = %live.call_id, camera_off, "Camera toggled");
        camera_off
    }

    /// Apply one inbound signaling event
    ///
    /// # Errors
    ///
    /// Returns the failure that aborted the session while processing the event
    /// (the session is idle by then), or `Cancelled` if it ended meanwhile.
    #[tracing::instrument(skip(self, signal), fields(event = signal.event_name()))]
    pub async fn handle_signal(&self, signal: InboundSignal) -> Result<(), CallError> {
        match signal {
            InboundSignal::Incoming {
                caller_id,
                caller_name,
                caller_avatar,
                call_kind,
            } => {
                self.on_invitation(PendingIncoming {
                    caller_id,
                    caller_name,
                    caller_avatar,
                    call_kind,
                })
                .await;
                Ok(())
            }
            InboundSignal::Accepted {} => {
                self.on_accepted();
                Ok(())
            }
            InboundSignal::Rejected {} => {
                self.on_remote_termination(EndReason::RemoteRejected).await;
                Ok(())
            }
            InboundSignal::Ended {} => {
                self.on_remote_termination(EndReason::RemoteHangup).await;
                Ok(())
            }
            InboundSignal::Offer { caller_id, offer } => {
                self.on_remote_description(caller_id, offer, Role::Callee)
                    .await
            }
            InboundSignal::Answer {
                answerer_id,
                answer,
            } => {
                self.on_remote_description(answerer_id, answer, Role::Caller)
                    .await
            }
            InboundSignal::IceCandidate {
                sender_id,
                candidate,
            } => {
                self.on_remote_candidate(sender_id, candidate).await;
                Ok(())
            }
        }
    }

    /// Apply one event reported by a connection
    ///
    /// Events from a connection the current session does not own are stale
    /// and ignored.
    #[tracing::instrument(skip(self, id, event), fields(connection = %id))]
    pub async fn handle_connection_event(&self, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                let peer = {
                    let mut session = self.session.lock();
                    session.live_for_connection(id).map(|live| live.peer.id.clone())
                };
                let Some(peer) = peer else {
                    tracing::trace!("Stale local candidate dropped");
                    return;
                };
                // Best-effort: the handler logs and swallows delivery failures
                let _ = self
                    .signaling
                    .send(OutboundSignal::IceCandidate {
                        target_user_id: peer,
                        candidate,
                    })
                    .await;
            }
            ConnectionEvent::RemoteTrack(track) => {
                let call_id = {
                    let mut session = self.session.lock();
                    session.live_for_connection(id).map(|live| {
                        if !live.remote_media.contains(&track.media_type) {
                            live.remote_media.push(track.media_type);
                        }
                        live.call_id
                    })
                };
                if let Some(call_id) = call_id {
                    tracing::info!(call_id = %call_id, track = %track.id, media_type = ?track.media_type, "Remote media arrived");
                    self.publish(CallEvent::RemoteMediaArrived {
                        call_id,
                        media_type: track.media_type,
                    });
                }
            }
            ConnectionEvent::Connected => self.on_connected(id),
            ConnectionEvent::Terminal(state) => {
                let call_id = {
                    let mut session = self.session.lock();
                    session.live_for_connection(id).map(|live| live.call_id)
                };
                let Some(teardown) = call_id.and_then(|call_id| self.detach(Some(call_id))) else {
                    tracing::trace!(?state, "Stale connection state ignored");
                    return;
                };
                tracing::warn!(call_id = %teardown.call_id, ?state, "Connection lost");
                self.finish(teardown, EndReason::ConnectionLost(state)).await;
            }
        }
    }

    /// Dispatch inbound signals and connection events until the signaling
    /// channel closes
    ///
    /// Events are processed one at a time. Any call still in progress when the
    /// channel closes is torn down.
    pub async fn run(self: Arc<Self>) {
        let Some(mut connection_events) = self.connection_events.lock().take() else {
            tracing::warn!("Call dispatch loop is already running");
            return;
        };
        tracing::info!(user = %self.config.local.id, "Call dispatch loop started");

        loop {
            tokio::select! {
                received = self.signaling.receive() => match received {
                    Ok(Some(signal)) => {
                        if let Err(e) = self.handle_signal(signal).await {
                            tracing::debug!(error = %e, "Signal ended the call attempt");
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Signaling channel closed");
                        break;
                    }
                    Err(e) => tracing::debug!(error = %e, "Signal receive failed"),
                },
                Some((id, event)) = connection_events.recv() => {
                    self.handle_connection_event(id, event).await;
                }
            }
        }

        if let Some(teardown) = self.detach(None) {
            self.finish(teardown, EndReason::Failed).await;
        }
        tracing::info!("Call dispatch loop stopped");
    }

    async fn on_invitation(&self, invitation: PendingIncoming) {
        let call_id = CallId::new();
        let admission = {
            let mut session = self.session.lock();
            if matches!(*session, Session::Idle) {
                *session = Session::Incoming(IncomingCall {
                    call_id,
                    invitation: invitation.clone(),
                    candidates: CandidateBuffer::new(),
                    held_offer: None,
                });
                Invitation::Admitted
            } else if session.peer_id() == Some(&invitation.caller_id) {
                Invitation::Redelivered
            } else {
                Invitation::Busy
            }
        };

        match admission {
            Invitation::Admitted => {}
            Invitation::Redelivered => {
                tracing::debug!(caller = %invitation.caller_id, "Ignoring repeated invitation from current peer");
                return;
            }
            Invitation::Busy => {
                tracing::info!(caller = %invitation.caller_id, "Busy, rejecting invitation");
                let caller_id = invitation.caller_id;
                if let Err(e) = self
                    .signaling
                    .send(OutboundSignal::Reject {
                        caller_id: caller_id.clone(),
                    })
                    .await
                {
                    tracing::warn!(caller = %caller_id, error = %e, "Busy rejection not delivered");
                }
                self.publish(CallEvent::BusyRejected { caller_id });
                return;
            }
        }

        tracing::info!(call_id = %call_id, caller = %invitation.caller_id, kind = %invitation.call_kind, "Incoming call");
        self.publish_status(Some(call_id), CallStatus::Incoming);
        self.publish(CallEvent::IncomingCall {
            call_id,
            invitation,
        });
    }

    fn on_accepted(&self) {
        let call_id = {
            let mut session = self.session.lock();
            match std::mem::replace(&mut *session, Session::Idle) {
                Session::Ringing(live) => {
                    let call_id = live.call_id;
                    *session = Session::Connecting(live);
                    Some(call_id)
                }
                other => {
                    *session = other;
                    None
                }
            }
        };
        match call_id {
            Some(call_id) => {
                tracing::info!(call_id = %call_id, "Callee accepted");
                self.publish_status(Some(call_id), CallStatus::Connecting);
            }
            None => tracing::debug!("Acceptance ignored outside Ringing"),
        }
    }

    async fn on_remote_termination(&self, reason: EndReason) {
        match self.detach(None) {
            Some(teardown) => {
                tracing::info!(call_id = %teardown.call_id, ?reason, "Peer terminated the call");
                self.finish(teardown, reason).await;
            }
            None => tracing::debug!(?reason, "Termination ignored while idle"),
        }
    }

    async fn on_remote_description(
        &self,
        from: UserId,
        description: SessionDescription,
        expected_role: Role,
    ) -> Result<(), CallError> {
        let step = {
            let mut session = self.session.lock();
            match &mut *session {
                Session::Incoming(incoming) => {
                    if incoming.invitation.caller_id == from && expected_role == Role::Callee {
                        incoming.held_offer = Some(description.clone());
                        RemoteDescriptionStep::Hold
                    } else {
                        RemoteDescriptionStep::Ignore("unexpected sender")
                    }
                }
                other => match other.live_any_mut() {
                    None => RemoteDescriptionStep::Ignore("no call in progress"),
                    Some(live) if live.peer.id != from => {
                        RemoteDescriptionStep::Ignore("unexpected sender")
                    }
                    Some(live) if live.role != expected_role => {
                        RemoteDescriptionStep::Ignore("wrong direction")
                    }
                    Some(live) => {
                        let open =
                            matches!(live.negotiation, Negotiation::Pending | Negotiation::Held(_));
                        match (open, live.connection.clone()) {
                            (true, None) => {
                                live.negotiation = Negotiation::Held(description.clone());
                                RemoteDescriptionStep::Hold
                            }
                            (true, Some(connection))
                                if matches!(live.negotiation, Negotiation::Pending) =>
                            {
                                live.negotiation = Negotiation::Applying;
                                RemoteDescriptionStep::Apply(live.call_id, connection)
                            }
                            _ => RemoteDescriptionStep::Ignore("duplicate"),
                        }
                    }
                },
            }
        };

        match step {
            RemoteDescriptionStep::Ignore(why) => {
                tracing::debug!(from = %from, why, "Remote description ignored");
                Ok(())
            }
            RemoteDescriptionStep::Hold => {
                tracing::debug!(from = %from, "Offer held until the connection exists");
                Ok(())
            }
            RemoteDescriptionStep::Apply(call_id, connection) => {
                self.apply_remote(call_id, connection, description, &from)
                    .await
            }
        }
    }

    async fn on_remote_candidate(&self, from: UserId, candidate: IceCandidate) {
        let apply_now = {
            let mut session = self.session.lock();
            match session.candidate_target(&from) {
                Some((buffer, connection)) => match buffer.push(candidate) {
                    Admission::Buffered => {
                        tracing::trace!(from = %from, pending = buffer.len(), "Candidate buffered");
                        None
                    }
                    Admission::ApplyNow(candidate) => connection.map(|c| (c, candidate)),
                },
                None => {
                    tracing::debug!(from = %from, "Candidate ignored");
                    None
                }
            }
        };

        if let Some((connection, candidate)) = apply_now {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::warn!(connection = %connection.id(), error = %e, "Remote candidate rejected");
            }
        }
    }

    fn on_connected(&self, id: ConnectionId) {
        let call_id = {
            let mut session = self.session.lock();
            let owned = session.live_for_connection(id).is_some();
            match std::mem::replace(&mut *session, Session::Idle) {
                Session::Ringing(live) | Session::Connecting(live) if owned => {
                    let call_id = live.call_id;
                    *session = Session::Connected(ConnectedCall {
                        timer: CallTimer::start(call_id, self.event_sender.clone()),
                        live,
                        connected_at: Utc::now(),
                    });
                    Some(call_id)
                }
                other => {
                    *session = other;
                    None
                }
            }
        };
        match call_id {
            Some(call_id) => {
                tracing::info!(call_id = %call_id, "Call connected");
                self.publish_status(Some(call_id), CallStatus::Connected);
            }
            None => tracing::trace!("Connected event ignored"),
        }
    }

    fn ensure_current(&self, call_id: CallId) -> Result<(), CallError> {
        if self.session.lock().call_id() == Some(call_id) {
            Ok(())
        } else {
            tracing::debug!(call_id = %call_id, "Session superseded");
            Err(CallError::Cancelled)
        }
    }

    async fn acquire_media(&self, call_id: CallId, kind: CallKind) -> Result<(), CallError> {
        let media = match self.media.acquire(kind).await {
            Ok(media) => media,
            Err(e) => return Err(self.fail(call_id, e.into()).await),
        };

        let stale = {
            let mut session = self.session.lock();
            match session.live_mut(call_id) {
                Some(live) => {
                    live.media = Some(media);
                    None
                }
                None => Some(media),
            }
        };
        if let Some(media) = stale {
            tracing::info!(call_id = %call_id, "Session ended during capture, releasing device");
            self.media.release(media);
            return Err(CallError::Cancelled);
        }
        Ok(())
    }

    async fn send_required(&self, call_id: CallId, signal: OutboundSignal) -> Result<(), CallError> {
        if let Err(e) = self.signaling.send(signal).await {
            return Err(self.fail(call_id, e.into()).await);
        }
        self.ensure_current(call_id)
    }

    /// Build the connection, wire local tracks, then install it in the session
    async fn open_connection(
        &self,
        call_id: CallId,
        peer: &UserId,
    ) -> Result<ConnectionHandle, CallError> {
        let connection = match self.connections.create(peer).await {
            Ok(connection) => connection,
            Err(e) => return Err(self.fail(call_id, e.into()).await),
        };

        let tracks = {
            let mut session = self.session.lock();
            session.live_mut(call_id).map(|live| {
                live.media
                    .as_ref()
                    .map(|media| media.tracks().to_vec())
                    .unwrap_or_default()
            })
        };
        let Some(tracks) = tracks else {
            connection.close().await;
            return Err(CallError::Cancelled);
        };
        if let Err(e) = connection.add_local_tracks(&tracks).await {
            connection.close().await;
            return Err(self.fail(call_id, e.into()).await);
        }

        let installed = {
            let mut session = self.session.lock();
            match session.live_mut(call_id) {
                Some(live) => {
                    live.connection = Some(connection.clone());
                    true
                }
                None => false,
            }
        };
        if !installed {
            tracing::info!(call_id = %call_id, "Session ended during connection setup, closing");
            connection.close().await;
            return Err(CallError::Cancelled);
        }
        Ok(connection)
    }

    /// Set the remote description, drain buffered candidates and, for an
    /// offer, answer it
    async fn apply_remote(
        &self,
        call_id: CallId,
        connection: ConnectionHandle,
        description: SessionDescription,
        peer: &UserId,
    ) -> Result<(), CallError> {
        let sdp_type = description.sdp_type;
        if let Err(e) = connection.set_remote_description(description).await {
            return Err(self.fail(call_id, e.into()).await);
        }

        let drained = {
            let mut session = self.session.lock();
            session.live_mut(call_id).map(|live| {
                live.negotiation = Negotiation::Applied;
                live.candidates.drain()
            })
        };
        let Some(drained) = drained else {
            return Err(CallError::Cancelled);
        };
        let applied = drained.apply_to(&connection).await;
        tracing::debug!(call_id = %call_id, ?sdp_type, applied, "Remote description applied");

        if sdp_type == SdpType::Offer {
            let answer = match connection.create_answer().await {
                Ok(answer) => answer,
                Err(e) => return Err(self.fail(call_id, e.into()).await),
            };
            self.ensure_current(call_id)?;
            self.send_required(
                call_id,
                OutboundSignal::Answer {
                    target_user_id: peer.clone(),
                    answer,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Abort the attempt `call_id` because of `error`
    ///
    /// Returns the error to hand to the caller: the original error if this
    /// call still owned the session, `Cancelled` if it was already superseded.
    async fn fail(&self, call_id: CallId, error: CallError) -> CallError {
        let Some(teardown) = self.detach(Some(call_id)) else {
            tracing::debug!(call_id = %call_id, error = %error, "Superseded attempt failed");
            return CallError::Cancelled;
        };
        tracing::warn!(call_id = %call_id, error = %error, "Call attempt failed");
        self.publish(CallEvent::CallFailed {
            call_id,
            error: error.to_string(),
        });
        self.finish(teardown, EndReason::Failed).await;
        error
    }

    /// Synchronous half of cleanup
    ///
    /// Takes the session out (only if it is still `expected`, when given),
    /// stops the timer and releases local media. Returns `None` when there was
    /// nothing to clean up, which makes every cleanup path idempotent.
    fn detach(&self, expected: Option<CallId>) -> Option<Teardown> {
        let taken = {
            let mut session = self.session.lock();
            if expected.is_some() && session.call_id() != expected {
                return None;
            }
            std::mem::replace(&mut *session, Session::Idle)
        };
        let mut teardown = taken.into_teardown()?;
        if let Some(timer) = teardown.timer.as_mut() {
            let seconds = timer.stop();
            tracing::debug!(call_id = %teardown.call_id, seconds, "Call timer stopped");
        }
        if let Some(media) = teardown.media.take() {
            self.media.release(media);
        }
        Some(teardown)
    }

    /// Asynchronous half of cleanup: close the connection and announce the end
    async fn finish(&self, teardown: Teardown, reason: EndReason) {
        let call_id = teardown.call_id;
        self.publish_status(None, CallStatus::Idle);
        if let Some(connection) = teardown.connection {
            connection.close().await;
        }
        tracing::info!(call_id = %call_id, ?reason, "Call ended");
        self.publish(CallEvent::CallEnded { call_id, reason });
    }
}
