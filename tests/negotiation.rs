mod common;

use common::{connected_pair, link, Peer};
use peerlink::{
    ConnectionState, EventKind, SdpType, SessionConfig, SessionEvent, SignalingState,
    StartOptions,
};
use std::time::Duration;

#[tokio::test]
async fn offer_answer_round_trip_leaves_both_stable() {
    let (a, b) = connected_pair(SessionConfig::default(), SessionConfig::default()).await;

    assert_eq!(a.session.signaling_state(), SignalingState::Stable);
    assert_eq!(b.session.signaling_state(), SignalingState::Stable);
    assert_eq!(a.session.status(), ConnectionState::Connected);
    assert!(b.session.is_active());
    assert_eq!(a.signals(SdpType::Offer), 1);
    assert_eq!(b.signals(SdpType::Answer), 1);
    assert!(a.count(EventKind::Connecting) >= 1);
}

#[tokio::test]
async fn glare_resolves_with_one_polite_side() {
    let mut a = Peer::new(SessionConfig::default().with_polite(false)).await;
    let mut b = Peer::new(SessionConfig::default()).await;

    a.session.start(StartOptions::default()).await.unwrap();
    b.session.start(StartOptions::default()).await.unwrap();
    let a_offer = a.next_signal().await;
    let b_offer = b.next_signal().await;
    assert!(a_offer.is_offer() && b_offer.is_offer());
    assert_eq!(a.session.signaling_state(), SignalingState::HaveLocalOffer);
    assert_eq!(b.session.signaling_state(), SignalingState::HaveLocalOffer);

    // Оба offer пересекаются
    let (at_b, at_a) = tokio::join!(b.session.signal(a_offer), a.session.signal(b_offer));
    at_b.unwrap();
    at_a.unwrap();
    assert_eq!(a.session.signaling_state(), SignalingState::HaveLocalOffer);

    link(&mut a, &mut b);
    a.wait_connected().await;
    b.wait_connected().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(a.count(EventKind::Connected), 1);
    assert_eq!(b.count(EventKind::Connected), 1);
    assert_eq!(a.signals(SdpType::Answer), 0);
    assert_eq!(b.signals(SdpType::Answer), 1);
    assert_eq!(a.session.signaling_state(), SignalingState::Stable);
    assert_eq!(b.session.signaling_state(), SignalingState::Stable);
    assert!(a.errors().is_empty(), "{:?}", a.errors());
    assert!(b.errors().is_empty(), "{:?}", b.errors());
}

#[tokio::test]
async fn start_with_outstanding_offer_resets_transport() {
    let mut a = Peer::new(SessionConfig::default()).await;

    a.session.start(StartOptions::default()).await.unwrap();
    a.next_signal().await;
    assert_eq!(a.session.signaling_state(), SignalingState::HaveLocalOffer);

    a.session.start(StartOptions::default()).await.unwrap();
    assert_eq!(a.factory.created(), 2);
    assert!(a.factory.transports()[0].is_closed());
    assert_eq!(a.count(EventKind::Disconnected), 1);

    let offer = a.next_signal().await;
    assert!(offer.is_offer());
    assert_eq!(a.session.signaling_state(), SignalingState::HaveLocalOffer);
}

#[tokio::test]
async fn candidates_arrive_as_one_batch() {
    let (a, b) = connected_pair(SessionConfig::default(), SessionConfig::default()).await;
    a.wait_for("candidate batch", |p| p.count(EventKind::IceCandidates) > 0)
        .await;
    b.wait_for("remote candidates", |p| p.transport().remote_candidates().len() == 2)
        .await;

    assert_eq!(a.count(EventKind::IceCandidates), 1);
    assert!(a.saw(|e| matches!(e, SessionEvent::IceCandidates(c) if c.len() == 2)));
}

#[tokio::test]
async fn unbatched_candidates_go_one_by_one() {
    let config = SessionConfig::default().with_batching(false, Duration::from_millis(200));
    let (a, _b) = connected_pair(config, SessionConfig::default()).await;
    a.wait_for("two candidate events", |p| p.count(EventKind::IceCandidates) == 2)
        .await;
    assert!(!a.saw(|e| matches!(e, SessionEvent::IceCandidates(c) if c.len() != 1)));
}

#[tokio::test]
async fn ignored_offer_candidates_are_not_errors() {
    let mut a = Peer::new(SessionConfig::default().with_polite(false)).await;
    let mut b = Peer::new(SessionConfig::default()).await;
    a.session.start(StartOptions::default()).await.unwrap();
    b.session.start(StartOptions::default()).await.unwrap();
    a.next_signal().await;
    let b_offer = b.next_signal().await;

    a.session.signal(b_offer).await.unwrap();
    let trailing = peerlink::IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host");
    a.session.add_ice_candidate(trailing).await.unwrap();
    assert!(a.errors().is_empty());
}

#[tokio::test]
async fn sdp_transform_rewrites_local_descriptions() {
    let config = SessionConfig::default().with_sdp_transform(|sdp| format!("{sdp}a=x-mark\r\n"));
    let mut a = Peer::new(config).await;
    a.session.start(StartOptions::default()).await.unwrap();
    let offer = a.next_signal().await;
    assert!(offer.sdp.ends_with("a=x-mark\r\n"));
}

#[tokio::test]
async fn remote_failure_surfaces_as_error_event() {
    let mut a = Peer::new(SessionConfig::default()).await;
    let b = Peer::new(SessionConfig::default()).await;
    b.transport().fail_on("set_remote_description");

    a.session.start(StartOptions::default()).await.unwrap();
    let offer = a.next_signal().await;
    assert!(b.session.signal(offer).await.is_err());
    assert_eq!(b.errors().len(), 1);
    assert!(b.errors()[0].starts_with("set_remote_description"));
}

#[tokio::test]
async fn glare_resolves_while_descriptions_are_slow() {
    let mut a = Peer::new(SessionConfig::default().with_polite(false)).await;
    let mut b = Peer::new(SessionConfig::default()).await;
    b.transport()
        .delay_descriptions(Duration::from_millis(20), Duration::from_millis(30));

    a.session.start(StartOptions::default()).await.unwrap();
    let a_offer = a.next_signal().await;

    // offer B ещё применяется, когда приходит offer A
    b.session.start(StartOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    b.session.signal(a_offer).await.unwrap();

    link(&mut a, &mut b);
    a.wait_connected().await;
    b.wait_connected().await;
    a.wait_for("A stable", |p| {
        p.session.signaling_state() == SignalingState::Stable
    })
    .await;
    b.wait_for("B stable", |p| {
        p.session.signaling_state() == SignalingState::Stable
    })
    .await;

    assert!(b.signals(SdpType::Answer) >= 1);
    assert!(a.errors().is_empty(), "{:?}", a.errors());
    assert!(b.errors().is_empty(), "{:?}", b.errors());
}

#[tokio::test]
async fn failed_offer_does_not_block_the_next_round() {
    let mut a = Peer::new(SessionConfig::default()).await;
    a.transport().fail_on("create_offer");

    a.session.start(StartOptions::default()).await.unwrap();
    a.wait_for("offer failure", |p| !p.errors().is_empty()).await;
    assert!(a.errors()[0].starts_with("create_offer"));
    assert_eq!(a.signals(SdpType::Offer), 0);
    assert_eq!(a.session.signaling_state(), SignalingState::Stable);

    a.transport().recover("create_offer");
    a.session.start(StartOptions::default()).await.unwrap();
    let offer = a.next_signal().await;
    assert!(offer.is_offer());
    assert_eq!(a.session.signaling_state(), SignalingState::HaveLocalOffer);
}
