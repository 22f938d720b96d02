//! Shared test doubles for controller integration tests

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use realty_call_core::{
    peer::ConnectionEvents,
    relay::{MemoryRelay, RelayEndpoint},
    types::{IceCandidate, SessionDescription},
    CallController, CallControllerConfig, CaptureDevice, ConnectionError, ConnectionEvent,
    LocalTrack, MediaCaptureGate, MediaConnection, MediaError, PeerConnector, PeerProfile,
    UserId,
};
use realty_call_core::types::{CallEvent, CallStatus, MediaType};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

/// Operation observed by a [`ScriptedConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    LocalTracks(usize),
    CreateOffer,
    CreateAnswer,
    RemoteDescription(SessionDescription),
    Candidate(String),
    Close,
}

/// Connection double that records every call it receives
#[derive(Default)]
pub struct ScriptedConnection {
    ops: Mutex<Vec<Op>>,
    closes: AtomicUsize,
}

impl ScriptedConnection {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Candidate strings in the order they were applied
    pub fn candidates(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                Op::Candidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Index of the first remote description, if any
    pub fn remote_description_at(&self) -> Option<usize> {
        self.ops
            .lock()
            .iter()
            .position(|op| matches!(op, Op::RemoteDescription(_)))
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl MediaConnection for ScriptedConnection {
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), ConnectionError> {
        self.record(Op::LocalTracks(tracks.len()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        self.record(Op::CreateOffer);
        Ok(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        self.record(Op::CreateAnswer);
        Ok(SessionDescription::answer("v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.record(Op::RemoteDescription(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.record(Op::Candidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.record(Op::Close);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out [`ScriptedConnection`]s
///
/// An optional gate holds `connect` until [`Self::open_gate`] is called.
#[derive(Default)]
pub struct ScriptedConnector {
    built: Mutex<Vec<(ConnectionEvents, Arc<ScriptedConnection>)>>,
    gate: Option<Semaphore>,
    refuse: AtomicBool,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.built.lock().len()
    }

    /// Most recently built connection with its event emitter
    pub fn last(&self) -> (ConnectionEvents, Arc<ScriptedConnection>) {
        self.built.lock().last().cloned().unwrap()
    }

    /// Emit an event as the most recent connection
    pub fn emit(&self, event: ConnectionEvent) {
        let (events, _) = self.last();
        assert!(events.emit(event));
    }
}

#[async_trait]
impl PeerConnector for ScriptedConnector {
    async fn connect(
        &self,
        _peer: &UserId,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Create("refused by test".to_string()));
        }
        let connection = Arc::new(ScriptedConnection::default());
        self.built.lock().push((events, connection.clone()));
        Ok(connection)
    }
}

/// Capture device that blocks every `open` until released
pub struct GatedCaptureDevice {
    gate: Semaphore,
    opened: Mutex<Vec<LocalTrack>>,
}

impl GatedCaptureDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            opened: Mutex::new(Vec::new()),
        })
    }

    /// Let one pending `open` complete
    pub fn release_one(&self) {
        self.gate.add_permits(1);
    }

    pub fn opened(&self) -> Vec<LocalTrack> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl CaptureDevice for GatedCaptureDevice {
    async fn open(&self, media_type: MediaType) -> Result<LocalTrack, MediaError> {
        self.gate.acquire().await.unwrap().forget();
        let n = self.opened.lock().len();
        let track = LocalTrack::new(format!("gated-{n}"), media_type);
        self.opened.lock().push(track.clone());
        Ok(track)
    }
}

/// Capture device whose permission prompt is always declined
pub struct DenyingCaptureDevice;

#[async_trait]
impl CaptureDevice for DenyingCaptureDevice {
    async fn open(&self, _media_type: MediaType) -> Result<LocalTrack, MediaError> {
        Err(MediaError::DeviceDenied("permission prompt declined".to_string()))
    }
}

/// Controller for `user` over `relay`
pub fn controller_with(
    relay: &MemoryRelay,
    user: &str,
    media: MediaCaptureGate,
    connector: Arc<dyn PeerConnector>,
) -> Arc<CallController<RelayEndpoint>> {
    let config = CallControllerConfig {
        local: PeerProfile::new(user, display_name(user)),
        ..Default::default()
    };
    Arc::new(CallController::new(
        config,
        Arc::new(relay.endpoint(user)),
        Arc::new(media),
        connector,
    ))
}

/// Controller with synthetic capture and a scripted connector
pub fn controller(
    relay: &MemoryRelay,
    user: &str,
) -> (Arc<CallController<RelayEndpoint>>, Arc<ScriptedConnector>) {
    let connector = ScriptedConnector::new();
    let controller = controller_with(relay, user, MediaCaptureGate::synthetic(), connector.clone());
    (controller, connector)
}

pub fn display_name(user: &str) -> String {
    let mut chars = user.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn profile(user: &str) -> PeerProfile {
    PeerProfile::new(user, display_name(user))
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 UDP 2122260223 10.0.0.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

/// Next event matching `pred`, skipping the rest
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    unreachable!("event channel closed while waiting")
                }
            }
        }
    })
    .await
    .unwrap()
}

/// Wait until the status reported by `events` is `status`
pub async fn wait_for_status(events: &mut broadcast::Receiver<CallEvent>, status: CallStatus) {
    wait_for_event(
        events,
        |event| matches!(event, CallEvent::StatusChanged { status: s, .. } if *s == status),
    )
    .await;
}

/// Poll `cond` until it holds
pub async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Every event currently queued
pub fn drain_events(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
