mod common;

use common::{connected_pair, link, Peer};
use peerlink::config::DEFAULT_CHANNEL_LABEL;
use peerlink::{
    ChannelData, ChannelOptions, ChannelState, DataChannel, DataSource, EventKind,
    SessionConfig, SessionEvent, StartOptions,
};

fn opened(label: &'static str) -> impl Fn(&Peer) -> bool {
    move |p| p.saw(|e| matches!(e, SessionEvent::ChannelOpen { label: l } if l == label))
}

#[tokio::test]
async fn channel_requested_before_start_opens_after_negotiation() {
    let mut a = Peer::new(SessionConfig::default()).await;
    let mut b = Peer::new(SessionConfig::default()).await;

    assert!(a.session.add_channel("chat", ChannelOptions::default()).await);
    assert!(a.session.get_channel("chat").is_none());

    link(&mut a, &mut b);
    a.session.start(StartOptions::default()).await.unwrap();

    a.wait_for("chat open on A", opened("chat")).await;
    b.wait_for("chat open on B", opened("chat")).await;

    let chat = a.session.get_channel("chat").unwrap();
    assert_eq!(chat.ready_state(), ChannelState::Open);
    assert_eq!(
        a.session.channel_labels(),
        vec!["chat".to_string(), DEFAULT_CHANNEL_LABEL.to_string()]
    );
}

#[tokio::test]
async fn duplicate_requests_create_one_channel() {
    let mut a = Peer::new(SessionConfig::default()).await;
    let mut b = Peer::new(SessionConfig::default()).await;

    assert!(a.session.add_channel("chat", ChannelOptions::default()).await);
    assert!(a.session.add_channel("chat", ChannelOptions::default()).await);

    link(&mut a, &mut b);
    a.session.start(StartOptions::default()).await.unwrap();
    a.wait_for("both channels open", |p| p.count(EventKind::ChannelOpen) == 2)
        .await;
    assert!(opened("chat")(&a));

    assert!(!a.session.add_channel("chat", ChannelOptions::default()).await);
    let created = a.transport().created_channels();
    assert_eq!(created.iter().filter(|l| *l == "chat").count(), 1);
}

#[tokio::test]
async fn send_requires_an_open_channel() {
    let a = Peer::new(SessionConfig::default()).await;
    a.session.start(StartOptions::default()).await.unwrap();

    let channel = a.session.get_channel(DEFAULT_CHANNEL_LABEL).unwrap();
    assert_eq!(channel.ready_state(), ChannelState::Connecting);
    assert!(!a.session.send("too early").await);
    assert_eq!(a.count(EventKind::ChannelData), 0);
}

#[tokio::test]
async fn data_flows_both_ways_on_the_default_channel() {
    let (a, b) = connected_pair(SessionConfig::default(), SessionConfig::default()).await;
    b.wait_for("default channel on B", opened(DEFAULT_CHANNEL_LABEL))
        .await;

    assert!(a.session.send("hello").await);
    assert!(a.saw(|e| matches!(
        e,
        SessionEvent::ChannelData { data: ChannelData::Text(t), source: DataSource::Outgoing, .. }
            if t == "hello"
    )));
    let sent = a.transport().channel(DEFAULT_CHANNEL_LABEL).unwrap().sent();
    assert_eq!(sent, vec![ChannelData::from("hello")]);

    assert!(b.session.send(vec![1u8, 2, 3]).await);

    b.transport()
        .deliver_message(DEFAULT_CHANNEL_LABEL, ChannelData::from("from a"));
    b.wait_for("incoming data", |p| {
        p.saw(|e| {
            matches!(
                e,
                SessionEvent::ChannelData { source: DataSource::Incoming, .. }
            )
        })
    })
    .await;
}

#[tokio::test]
async fn remote_close_removes_channel() {
    let (a, _b) = connected_pair(SessionConfig::default(), SessionConfig::default()).await;
    a.wait_for("default channel open", opened(DEFAULT_CHANNEL_LABEL))
        .await;

    a.transport().close_channel(DEFAULT_CHANNEL_LABEL);
    a.wait_for("channel closed", |p| p.count(EventKind::ChannelClosed) == 1)
        .await;

    assert!(a.session.get_channel(DEFAULT_CHANNEL_LABEL).is_none());
    assert!(!a.session.send("gone").await);
}

#[tokio::test]
async fn channel_added_after_connect_opens_immediately() {
    let (a, _b) = connected_pair(SessionConfig::default(), SessionConfig::default()).await;
    a.wait_for("default channel open", opened(DEFAULT_CHANNEL_LABEL))
        .await;

    assert!(a.session.add_channel("late", ChannelOptions::unreliable()).await);
    a.wait_for("late open", opened("late")).await;
    assert!(a.session.send_to("late", "hi").await);
}

#[tokio::test]
async fn disabled_data_channels_ignore_remote_channels() {
    let (_a, b) = connected_pair(
        SessionConfig::default(),
        SessionConfig::default().with_data_channels(false),
    )
    .await;
    assert!(b.session.channel_labels().is_empty());
    assert_eq!(b.count(EventKind::ChannelOpen), 0);
}

#[tokio::test]
async fn channel_errors_are_reported_without_closing() {
    let (a, _b) = connected_pair(SessionConfig::default(), SessionConfig::default()).await;
    a.wait_for("default channel open", opened(DEFAULT_CHANNEL_LABEL))
        .await;

    a.transport().channel_error(DEFAULT_CHANNEL_LABEL, "sctp abort");
    a.wait_for("channel error", |p| p.count(EventKind::ChannelError) == 1)
        .await;

    assert!(a.saw(|e| matches!(
        e,
        SessionEvent::ChannelError { label, message }
            if label == DEFAULT_CHANNEL_LABEL && message == "sctp abort"
    )));
    assert!(a.session.get_channel(DEFAULT_CHANNEL_LABEL).is_some());
    assert!(a.session.send("still here").await);
}

#[tokio::test]
async fn remote_channel_with_a_taken_label_cannot_close_the_local_one() {
    let (a, _b) = connected_pair(SessionConfig::default(), SessionConfig::default()).await;
    a.wait_for("default channel open", opened(DEFAULT_CHANNEL_LABEL))
        .await;
    let local = a.session.get_channel(DEFAULT_CHANNEL_LABEL).unwrap();

    let shadow = a.transport().open_remote_channel(DEFAULT_CHANNEL_LABEL);
    shadow.close().await.unwrap();
    a.transport()
        .deliver_message(DEFAULT_CHANNEL_LABEL, ChannelData::from("after"));
    a.wait_for("message on the local channel", |p| {
        p.count(EventKind::ChannelData) > 0
    })
    .await;

    assert_eq!(a.count(EventKind::ChannelClosed), 0);
    assert_eq!(a.count(EventKind::ChannelOpen), 1);
    let current = a.session.get_channel(DEFAULT_CHANNEL_LABEL).unwrap();
    assert_eq!(current.id(), local.id());
    assert!(a.session.send("still mine").await);
}
