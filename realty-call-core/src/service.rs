//! Call service orchestration
//!
//! [`CallService`] wires a capture gate, a connection backend and a signaling
//! transport into a [`CallController`] and runs its dispatch loop.

use crate::call::{CallController, CallControllerConfig, CallError};
use crate::identity::PeerProfile;
use crate::media::{CaptureDevice, MediaCaptureGate, MediaEvent};
use crate::peer::PeerConnector;
use crate::signaling::SignalingTransport;
use crate::types::{CallEvent, CallId, CallKind, CallSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[cfg(feature = "rtc")]
use crate::rtc::{RtcConfig, RtcPeerConnector};

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// `start` was called twice
    #[error("Service already started")]
    AlreadyStarted,

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Top-level service events
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Capture event
    Media(MediaEvent),
    /// Call event
    Call(CallEvent),
}

/// Service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Controller configuration
    pub call: CallControllerConfig,
    /// Connection backend configuration
    #[cfg(feature = "rtc")]
    pub rtc: RtcConfig,
}

/// Main call service
pub struct CallService<T: SignalingTransport + 'static> {
    controller: Arc<CallController<T>>,
    event_sender: broadcast::Sender<ServiceEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: SignalingTransport + 'static> CallService<T> {
    /// Create a builder
    #[must_use]
    pub fn builder(transport: Arc<T>) -> CallServiceBuilder<T> {
        CallServiceBuilder::new(transport)
    }

    /// The underlying controller
    pub fn controller(&self) -> &Arc<CallController<T>> {
        &self.controller
    }

    /// Start the dispatch loop and event forwarding
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` if the service is running
    #[tracing::instrument(skip(self), fields(user = %self.controller.local_profile().id))]
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(ServiceError::AlreadyStarted);
        }
        tracing::info!("Starting call service");

        let mut call_events = self.controller.subscribe_events();
        let sender = self.event_sender.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match call_events.recv().await {
                    Ok(event) => {
                        let _ = sender.send(ServiceEvent::Call(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Call event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let mut media_events = self.controller.media().subscribe_events();
        let sender = self.event_sender.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match media_events.recv().await {
                    Ok(event) => {
                        let _ = sender.send(ServiceEvent::Media(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Media event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        tasks.push(tokio::spawn(self.controller.clone().run()));
        tracing::info!("Call service started");
        Ok(())
    }

    /// Whether `start` has been called
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Initiate a call
    ///
    /// # Errors
    ///
    /// Returns error if call cannot be initiated
    pub async fn initiate_call(
        &self,
        peer: PeerProfile,
        kind: CallKind,
    ) -> Result<CallId, ServiceError> {
        Ok(self.controller.initiate_call(peer, kind).await?)
    }

    /// Accept the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns error if call cannot be accepted
    pub async fn accept_call(&self) -> Result<CallId, ServiceError> {
        Ok(self.controller.accept_call().await?)
    }

    /// Decline the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns error if call cannot be rejected
    pub async fn reject_call(&self) -> Result<(), ServiceError> {
        Ok(self.controller.reject_call().await?)
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns error if the peer could not be notified
    pub async fn end_call(&self) -> Result<(), ServiceError> {
        Ok(self.controller.end_call().await?)
    }

    /// Flip microphone mute
    pub fn toggle_mute(&self) -> bool {
        self.controller.toggle_mute()
    }

    /// Flip the camera
    pub fn toggle_camera(&self) -> bool {
        self.controller.toggle_camera()
    }

    /// Current session
    pub fn snapshot(&self) -> CallSnapshot {
        self.controller.snapshot()
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.event_sender.subscribe()
    }

    /// Hang up any call and stop background tasks
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if let Err(e) = self.controller.end_call().await {
            tracing::debug!(error = %e, "Hangup during shutdown was not delivered");
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!("Call service stopped");
    }
}

/// Call service builder
pub struct CallServiceBuilder<T: SignalingTransport + 'static> {
    transport: Arc<T>,
    config: ServiceConfig,
    capture_device: Option<Arc<dyn CaptureDevice>>,
    connector: Option<Arc<dyn PeerConnector>>,
}

impl<T: SignalingTransport + 'static> CallServiceBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            config: ServiceConfig::default(),
            capture_device: None,
            connector: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific capture backend instead of synthetic tracks
    #[must_use]
    pub fn with_capture_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.capture_device = Some(device);
        self
    }

    /// Use a specific connection backend instead of the `webrtc` one
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if the connection backend cannot be created
    pub fn build(self) -> Result<CallService<T>, ServiceError> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(&self.config)?,
        };
        let media = Arc::new(match self.capture_device {
            Some(device) => MediaCaptureGate::new(device),
            None => MediaCaptureGate::synthetic(),
        });

        let capacity = self.config.call.event_channel_capacity.max(1);
        let (event_sender, _) = broadcast::channel(capacity);
        let controller = Arc::new(CallController::new(
            self.config.call,
            self.transport,
            media,
            connector,
        ));

        Ok(CallService {
            controller,
            event_sender,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(feature = "rtc")]
fn default_connector(config: &ServiceConfig) -> Result<Arc<dyn PeerConnector>, ServiceError> {
    let connector = RtcPeerConnector::new(config.rtc.clone())
        .map_err(|e| ServiceError::InitError(e.to_string()))?;
    Ok(Arc::new(connector))
}

#[cfg(not(feature = "rtc"))]
fn default_connector(_config: &ServiceConfig) -> Result<Arc<dyn PeerConnector>, ServiceError> {
    Err(ServiceError::InitError(
        "no connection backend configured".to_string(),
    ))
}
