//! Point-to-point media connection management
//!
//! [`PeerConnectionManager`] creates the single [`ConnectionHandle`] a call
//! session owns. The concrete connection lives behind the [`PeerConnector`] /
//! [`MediaConnection`] traits; the `webrtc` implementation is in
//! [`crate::rtc`].
//!
//! Backends report what happens on the wire as [`ConnectionEvent`]s tagged with
//! the [`ConnectionId`] of the connection that produced them. The manager does
//! not interpret them: the call controller decides what a connected or failed
//! connection means for the session, and discards events from connections it
//! no longer owns.

use crate::identity::UserId;
use crate::media::LocalTrack;
use crate::types::{IceCandidate, MediaType, SessionDescription, TerminalState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Backend could not build a connection
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// Offer/answer creation or application failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Remote SDP could not be parsed
    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    /// Remote candidate rejected
    #[error("Failed to add ICE candidate: {0}")]
    Candidate(String),

    /// Operation on a closed connection
    #[error("Connection closed")]
    Closed,
}

/// Identifies one connection instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Remote track announced by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub media_type: MediaType,
}

/// What a connection reports upward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A local network candidate was discovered and must be sent to the peer
    LocalCandidate(IceCandidate),
    /// The far side's media track arrived
    RemoteTrack(RemoteTrack),
    /// The connection reached connected
    Connected,
    /// The connection reached disconnected or failed
    Terminal(TerminalState),
}

/// Receiving half of the connection event channel
pub type ConnectionEventReceiver = mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>;

/// Sending half of the connection event channel
pub type ConnectionEventSender = mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>;

/// Event emitter handed to a backend for one connection
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    id: ConnectionId,
    sender: ConnectionEventSender,
}

impl ConnectionEvents {
    /// Create an emitter for a connection
    pub fn new(id: ConnectionId, sender: ConnectionEventSender) -> Self {
        Self { id, sender }
    }

    /// Connection this emitter belongs to
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Emit an event; returns false once the controller is gone
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.sender.send((self.id, event)).is_ok()
    }
}

/// Builds connections to a peer
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a new connection towards `peer`
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot build the connection
    async fn connect(
        &self,
        peer: &UserId,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError>;
}

/// One point-to-point media connection
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Wire local capture tracks into the connection
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), ConnectionError>;

    /// Create an offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Create an answer and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Apply the remote offer or answer
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    /// Close the connection
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// The connection owned by a call session
///
/// Cheap to clone; all clones share the closed flag, so `close` is idempotent
/// no matter which clone (or which cleanup path) calls it.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: UserId,
    inner: Arc<dyn MediaConnection>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote user
    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Wire local capture tracks
    ///
    /// Tracks are clones of the session's [`crate::media::LocalMedia`] tracks
    /// and share their enabled/live flags.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or the backend refuses a track
    pub async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.inner.add_local_tracks(tracks).await
    }

    /// Create and apply a local offer
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or negotiation fails
    pub async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        self.ensure_open()?;
        self.inner.create_offer().await
    }

    /// Create and apply a local answer
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or negotiation fails
    pub async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        self.ensure_open()?;
        self.inner.create_answer().await
    }

    /// Apply the remote description
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or the SDP is rejected
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.inner.set_remote_description(description).await
    }

    /// Apply one remote candidate
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or the candidate is rejected
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.inner.add_ice_candidate(candidate).await
    }

    /// Close the connection; later calls are no-ops
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::trace!(connection = %self.id, "Connection already closed");
            return;
        }
        if let Err(e) = self.inner.close().await {
            tracing::warn!(connection = %self.id, error = %e, "Error while closing connection");
        } else {
            tracing::debug!(connection = %self.id, "Connection closed");
        }
    }
}

/// Creates the connection a call session owns
pub struct PeerConnectionManager {
    connector: Arc<dyn PeerConnector>,
    events: ConnectionEventSender,
    next_id: AtomicU64,
}

impl PeerConnectionManager {
    /// Create a manager; events of every connection go to `events`
    #[must_use]
    pub fn new(connector: Arc<dyn PeerConnector>, events: ConnectionEventSender) -> Self {
        Self {
            connector,
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a new connection towards `peer`
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot build the connection
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn create(&self, peer: &UserId) -> Result<ConnectionHandle, ConnectionError> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let events = ConnectionEvents::new(id, self.events.clone());
        let inner = self.connector.connect(peer, events).await?;
        tracing::debug!(connection = %id, "Peer connection created");
        Ok(ConnectionHandle {
            id,
            peer: peer.clone(),
            inner,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}
