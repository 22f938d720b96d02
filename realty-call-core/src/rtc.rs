//! `webrtc` connection backend
//!
//! Implements [`PeerConnector`] / [`MediaConnection`] on top of the `webrtc`
//! crate. ICE uses the configured public STUN servers only; there is no TURN
//! relay.

use crate::identity::UserId;
use crate::media::LocalTrack;
use crate::peer::{
    ConnectionError, ConnectionEvent, ConnectionEvents, MediaConnection, PeerConnector,
    RemoteTrack,
};
use crate::types::{IceCandidate, MediaType, SdpType, SessionDescription, TerminalState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Connection backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// STUN server URLs
    pub ice_servers: Vec<String>,
    /// Gather loopback host candidates (needed when both peers share a host)
    pub include_loopback_candidates: bool,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            include_loopback_candidates: false,
        }
    }
}

impl RtcConfig {
    /// Configuration for two peers in the same process, with no STUN lookups
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback_candidates: true,
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

fn create_error(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Create(e.to_string())
}

fn negotiation_error(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Negotiation(e.to_string())
}

/// [`PeerConnector`] backed by the `webrtc` crate
pub struct RtcPeerConnector {
    api: API,
    config: RtcConfig,
}

impl RtcPeerConnector {
    /// Build the media engine, interceptors and setting engine once
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new(config: RtcConfig) -> Result<Self, ConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(create_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(create_error)?;

        let mut setting_engine = SettingEngine::default();
        if config.include_loopback_candidates {
            setting_engine.set_include_loopback_candidate(true);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        tracing::debug!(ice_servers = ?config.ice_servers, "WebRTC API built");
        Ok(Self { api, config })
    }

    /// Active configuration
    pub fn config(&self) -> &RtcConfig {
        &self.config
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    #[tracing::instrument(skip(self, events), fields(peer = %peer, connection = %events.id()))]
    async fn connect(
        &self,
        peer: &UserId,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError> {
        let pc = self
            .api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create peer connection");
                create_error(e)
            })?;

        observe(&pc, events);
        Ok(Arc::new(RtcConnection { pc }))
    }
}

/// Map peer connection callbacks to [`ConnectionEvent`]s
fn observe(pc: &RTCPeerConnection, events: ConnectionEvents) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    events.emit(ConnectionEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Could not serialize local candidate"),
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!(connection = %state_events.id(), ?state, "Peer connection state");
        let event = match state {
            RTCPeerConnectionState::Connected => Some(ConnectionEvent::Connected),
            RTCPeerConnectionState::Disconnected => {
                Some(ConnectionEvent::Terminal(TerminalState::Disconnected))
            }
            RTCPeerConnectionState::Failed => {
                Some(ConnectionEvent::Terminal(TerminalState::Failed))
            }
            _ => None,
        };
        if let Some(event) = event {
            state_events.emit(event);
        }
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let media_type = match track.kind() {
            RTPCodecType::Video => MediaType::Video,
            _ => MediaType::Audio,
        };
        events.emit(ConnectionEvent::RemoteTrack(RemoteTrack {
            id: track.id().to_string(),
            media_type,
        }));
        Box::pin(async {})
    }));
}

/// Sample track matching a captured track
fn sample_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    let codec = match track.media_type() {
        MediaType::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        MediaType::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    };
    Arc::new(TrackLocalStaticSample::new(
        codec,
        track.id().to_string(),
        "realty-call".to_string(),
    ))
}

struct RtcConnection {
    pc: RTCPeerConnection,
}

impl RtcConnection {
    async fn set_local(
        &self,
        description: RTCSessionDescription,
        sdp_type: SdpType,
    ) -> Result<SessionDescription, ConnectionError> {
        let sdp = description.sdp.clone();
        self.pc
            .set_local_description(description)
            .await
            .map_err(negotiation_error)?;
        Ok(SessionDescription { sdp_type, sdp })
    }
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), ConnectionError> {
        for track in tracks {
            let rtc_track: Arc<dyn TrackLocal + Send + Sync> = sample_track(track);
            self.pc.add_track(rtc_track).await.map_err(|e| {
                ConnectionError::Negotiation(format!("Failed to add {} track: {e}", track.id()))
            })?;
            tracing::debug!(track_id = %track.id(), media_type = ?track.media_type(), "Local track added");
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        self.set_local(offer, SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation_error)?;
        self.set_local(answer, SdpType::Answer).await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        if description.sdp.trim().is_empty() {
            return Err(ConnectionError::InvalidSdp(
                "SDP cannot be empty".to_string(),
            ));
        }
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| ConnectionError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ConnectionError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pc
            .close()
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::peer::PeerConnectionManager;
    use tokio::sync::mpsc;

    #[test]
    fn test_default_config_uses_public_stun() {
        let config = RtcConfig::default();
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(!config.include_loopback_candidates);
        assert_eq!(config.rtc_configuration().ice_servers.len(), 1);
        assert!(RtcConfig::loopback().rtc_configuration().ice_servers.is_empty());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: RtcConfig = serde_json::from_str(r#"{"include_loopback_candidates":true}"#).unwrap();
        assert!(config.include_loopback_candidates);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[tokio::test]
    async fn test_offer_carries_local_tracks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = Arc::new(RtcPeerConnector::new(RtcConfig::loopback()).unwrap());
        let manager = PeerConnectionManager::new(connector, tx);

        let handle = manager.create(&UserId::new("bob")).await.unwrap();
        handle
            .add_local_tracks(&[
                LocalTrack::new("audio-0", MediaType::Audio),
                LocalTrack::new("video-0", MediaType::Video),
            ])
            .await
            .unwrap();

        let offer = handle.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        handle.close().await;
    }

    #[tokio::test]
    async fn test_empty_remote_sdp_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = Arc::new(RtcPeerConnector::new(RtcConfig::loopback()).unwrap());
        let manager = PeerConnectionManager::new(connector, tx);
        let handle = manager.create(&UserId::new("bob")).await.unwrap();

        let result = handle
            .set_remote_description(SessionDescription::answer(""))
            .await;
        assert!(matches!(result, Err(ConnectionError::InvalidSdp(_))));
        handle.close().await;
    }
}
