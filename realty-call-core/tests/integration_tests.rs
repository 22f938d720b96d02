//! End-to-end tests: two or three clients over the in-memory relay with their
//! dispatch loops running

mod common;

use common::*;
use pretty_assertions::assert_eq;
use realty_call_core::{
    relay::MemoryRelay,
    service::{CallService, ServiceConfig, ServiceEvent},
    signaling::{InboundSignal, SignalKind},
    types::{CallEvent, CallKind, CallSnapshot, CallStatus, EndReason},
    CallControllerConfig, ConnectionEvent, MediaEvent, UserId,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn full_call_between_two_clients() {
    let relay = MemoryRelay::new();
    let (ana, ana_connector) = controller(&relay, "ana");
    let (bob, bob_connector) = controller(&relay, "bob");
    let mut ana_events = ana.subscribe_events();
    let mut bob_events = bob.subscribe_events();
    let ana_loop = tokio::spawn(ana.clone().run());
    let bob_loop = tokio::spawn(bob.clone().run());

    // Candidates race ahead of the offer
    relay.hold(SignalKind::Offer);
    ana.initiate_call(profile("bob"), CallKind::Video)
        .await
        .unwrap();
    ana_connector.emit(ConnectionEvent::LocalCandidate(candidate(1)));
    ana_connector.emit(ConnectionEvent::LocalCandidate(candidate(2)));
    wait_for_status(&mut bob_events, CallStatus::Incoming).await;
    wait_until(|| {
        relay
            .published_by(&UserId::new("ana"))
            .iter()
            .filter(|s| s.kind() == SignalKind::IceCandidate)
            .count()
            == 2
    })
    .await;
    relay.release_held();

    bob.accept_call().await.unwrap();
    wait_for_status(&mut ana_events, CallStatus::Connecting).await;

    let (_, bob_connection) = bob_connector.last();
    wait_until(|| bob_connection.candidates().len() == 2).await;
    assert!(bob_connection.remote_description_at().is_some());
    let (_, ana_connection) = ana_connector.last();
    wait_until(|| ana_connection.remote_description_at().is_some()).await;

    ana_connector.emit(ConnectionEvent::Connected);
    bob_connector.emit(ConnectionEvent::Connected);
    wait_for_status(&mut ana_events, CallStatus::Connected).await;
    wait_for_status(&mut bob_events, CallStatus::Connected).await;

    ana.end_call().await.unwrap();
    let ended = wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));

    assert_eq!(ana.snapshot(), CallSnapshot::idle());
    assert_eq!(bob.snapshot(), CallSnapshot::idle());
    assert_eq!(ana_connection.closes(), 1);
    assert_eq!(bob_connection.closes(), 1);
    assert_eq!(ana.media().active_captures(), 0);
    assert_eq!(bob.media().active_captures(), 0);

    ana_loop.abort();
    bob_loop.abort();
}

#[tokio::test]
async fn third_caller_gets_busy_rejection() {
    let relay = MemoryRelay::new();
    let (ana, ana_connector) = controller(&relay, "ana");
    let (bob, _) = controller(&relay, "bob");
    let (cy, _) = controller(&relay, "cy");
    let mut bob_events = bob.subscribe_events();
    let mut cy_events = cy.subscribe_events();
    let loops = [
        tokio::spawn(ana.clone().run()),
        tokio::spawn(bob.clone().run()),
        tokio::spawn(cy.clone().run()),
    ];

    ana.initiate_call(profile("bob"), CallKind::Audio)
        .await
        .unwrap();
    wait_for_status(&mut bob_events, CallStatus::Incoming).await;
    bob.accept_call().await.unwrap();
    ana_connector.emit(ConnectionEvent::Connected);
    wait_until(|| ana.status() == CallStatus::Connected).await;

    cy.initiate_call(profile("bob"), CallKind::Video)
        .await
        .unwrap();
    let ended = wait_for_event(&mut cy_events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded {
            reason: EndReason::RemoteRejected,
            ..
        }
    ));

    assert_eq!(cy.snapshot(), CallSnapshot::idle());
    assert_eq!(cy.media().active_captures(), 0);
    assert_eq!(bob.status(), CallStatus::Connecting);
    assert_eq!(bob.snapshot().peer.map(|p| p.id), Some(UserId::new("ana")));
    assert_eq!(ana.status(), CallStatus::Connected);

    for handle in loops {
        handle.abort();
    }
}

#[tokio::test]
async fn redelivered_invitation_keeps_both_sides_in_the_call() {
    let relay = MemoryRelay::new();
    let (ana, _) = controller(&relay, "ana");
    let (bob, _) = controller(&relay, "bob");
    let mut ana_events = ana.subscribe_events();
    let mut bob_events = bob.subscribe_events();
    let loops = [
        tokio::spawn(ana.clone().run()),
        tokio::spawn(bob.clone().run()),
    ];

    ana.initiate_call(profile("bob"), CallKind::Audio)
        .await
        .unwrap();
    wait_for_status(&mut bob_events, CallStatus::Incoming).await;

    relay.inject(
        &UserId::new("bob"),
        InboundSignal::Incoming {
            caller_id: UserId::new("ana"),
            caller_name: "Ana".to_string(),
            caller_avatar: None,
            call_kind: CallKind::Audio,
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ana.status(), CallStatus::Ringing);
    assert_eq!(bob.status(), CallStatus::Incoming);

    bob.accept_call().await.unwrap();
    wait_for_status(&mut ana_events, CallStatus::Connecting).await;
    assert_eq!(bob.status(), CallStatus::Connecting);
    assert!(!relay
        .published_by(&UserId::new("bob"))
        .iter()
        .any(|s| s.kind() == SignalKind::Reject));

    for handle in loops {
        handle.abort();
    }
}

#[tokio::test]
async fn closed_signaling_channel_tears_down_the_call() {
    let relay = MemoryRelay::new();
    let (ana, connector) = controller(&relay, "ana");
    let mut events = ana.subscribe_events();
    ana.initiate_call(profile("bob"), CallKind::Audio)
        .await
        .unwrap();
    let dispatch = tokio::spawn(ana.clone().run());

    relay.disconnect(&UserId::new("ana"));
    tokio::time::timeout(Duration::from_secs(5), dispatch)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(ana.snapshot(), CallSnapshot::idle());
    assert_eq!(connector.last().1.closes(), 1);
    assert!(matches!(
        wait_for_event(&mut events, |e| matches!(e, CallEvent::CallEnded { .. })).await,
        CallEvent::CallEnded {
            reason: EndReason::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn second_dispatch_loop_returns_immediately() {
    let relay = MemoryRelay::new();
    let (ana, _) = controller(&relay, "ana");
    let first = tokio::spawn(ana.clone().run());
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(5), ana.clone().run())
        .await
        .unwrap();
    assert!(!first.is_finished());
    first.abort();
}

#[tokio::test]
async fn service_forwards_call_and_media_events() {
    let relay = MemoryRelay::new();
    let connector = ScriptedConnector::new();
    let config = ServiceConfig {
        call: CallControllerConfig {
            local: profile("agent-17"),
            ..Default::default()
        },
        ..Default::default()
    };
    let service = CallService::builder(Arc::new(relay.endpoint("agent-17")))
        .with_config(config)
        .with_connector(connector.clone())
        .build()
        .unwrap();
    let mut events = service.subscribe_events();
    service.start().unwrap();

    service
        .initiate_call(profile("client-42"), CallKind::Video)
        .await
        .unwrap();
    assert_eq!(service.snapshot().status, CallStatus::Ringing);
    assert!(service.toggle_camera());
    assert!(service.snapshot().camera_off);

    let mut saw_ringing = false;
    let mut saw_capture = false;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(saw_ringing && saw_capture) {
            match events.recv().await.unwrap() {
                ServiceEvent::Call(CallEvent::StatusChanged {
                    status: CallStatus::Ringing,
                    ..
                }) => saw_ringing = true,
                ServiceEvent::Media(MediaEvent::StreamStarted {
                    kind: CallKind::Video,
                    ..
                }) => saw_capture = true,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    service.shutdown().await;
    assert_eq!(service.snapshot(), CallSnapshot::idle());
    assert_eq!(connector.last().1.closes(), 1);
    assert_eq!(
        relay
            .published_by(&UserId::new("agent-17"))
            .last()
            .map(|s| s.kind()),
        Some(SignalKind::End)
    );
}
