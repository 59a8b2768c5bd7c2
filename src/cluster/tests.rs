use super::*;
use crate::test_utils::CapturedLogs;
use crate::transport::{ChannelHub, ConnectionState};
use tokio_test::{assert_pending, task};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Listener forwarding every delivery to a channel.
struct Recorder {
    deliveries: UnboundedSender<(Message, String)>,
}

impl Recorder {
    fn new() -> (Arc<Self>, UnboundedReceiver<(Message, String)>) {
        let (deliveries, received) = unbounded_channel();
        (Arc::new(Self { deliveries }), received)
    }
}

impl Listener for Recorder {
    fn on_message(&self, message: &Message, origin: &str) -> Result<(), ListenerError> {
        let _ = self
            .deliveries
            .send((message.clone(), origin.to_string()));
        Ok(())
    }
}

fn options() -> ConnectionOptions {
    ConnectionOptions::from_url("redis://hub:6379")
}

async fn router(hub: &ChannelHub, name: &str) -> ClusterRouter {
    let router = ClusterRouter::new(hub, &options(), name).unwrap();
    router.when_ready().await.unwrap();
    router
}

async fn next(received: &mut UnboundedReceiver<(Message, String)>) -> Option<(Message, String)> {
    tokio::time::timeout(Duration::from_millis(100), received.recv())
        .await
        .ok()
        .flatten()
}

fn greeting(payload: &str) -> Message {
    Message::new(Topic::Event).with("payload", payload)
}

#[tokio::test]
async fn test_invalid_options_fail_construction() {
    let hub = ChannelHub::new();
    let result = ClusterRouter::new(&hub, &ConnectionOptions::default(), "s1");
    assert!(matches!(result, Err(transport::TransportError::Config(_))));
}

#[tokio::test]
async fn test_broadcast_reaches_peer_but_not_sender() {
    let hub = ChannelHub::new();
    let s1 = router(&hub, "s1").await;
    let s2 = router(&hub, "s2").await;

    let (own, mut own_rx) = Recorder::new();
    let (peer, mut peer_rx) = Recorder::new();
    s1.subscribe(Topic::Event, own);
    s2.subscribe(Topic::Event, peer);

    s1.send(&greeting("hi"));

    let (message, origin) = next(&mut peer_rx).await.expect("s2 receives");
    assert_eq!(message.get("payload"), Some(&serde_json::json!("hi")));
    assert_eq!(origin, "s1");
    assert!(next(&mut own_rx).await.is_none());
}

#[tokio::test]
async fn test_direct_message_reaches_only_target() {
    let hub = ChannelHub::new();
    let s1 = router(&hub, "s1").await;
    let s2 = router(&hub, "s2").await;
    let s3 = router(&hub, "s3").await;

    let (bystander, mut s2_rx) = Recorder::new();
    let (target, mut s3_rx) = Recorder::new();
    s2.subscribe(Topic::Event, bystander);
    s3.subscribe(Topic::Event, target);

    s1.send_direct("s3", &greeting("x"));

    let (message, origin) = next(&mut s3_rx).await.expect("s3 receives");
    assert_eq!(message, greeting("x"));
    assert_eq!(origin, "s1");
    assert!(next(&mut s2_rx).await.is_none());
}

#[tokio::test]
async fn test_one_transport_subscribe_per_topic() {
    let hub = ChannelHub::new();
    let s1 = router(&hub, "s1").await;
    let s2 = router(&hub, "s2").await;

    let (first, mut first_rx) = Recorder::new();
    let (second, mut second_rx) = Recorder::new();
    s2.subscribe(Topic::Record, first);
    s2.subscribe(Topic::Record, second);

    assert_eq!(hub.subscribe_commands(), vec![Topic::Record.channel()]);
    assert_eq!(s2.dispatch_table().listener_count(Topic::Record), 2);

    s1.send(&Message::new(Topic::Record).with("name", "users/1"));
    s1.send(&Message::new(Topic::Record).with("name", "users/2"));

    for received in [&mut first_rx, &mut second_rx] {
        let (a, _) = next(received).await.unwrap();
        let (b, _) = next(received).await.unwrap();
        assert_eq!(a.get("name"), Some(&serde_json::json!("users/1")));
        assert_eq!(b.get("name"), Some(&serde_json::json!("users/2")));
    }
}

#[tokio::test]
async fn test_same_listener_twice_delivers_once() {
    let hub = ChannelHub::new();
    let s1 = router(&hub, "s1").await;
    let s2 = router(&hub, "s2").await;

    let (recorder, mut received) = Recorder::new();
    s2.subscribe(Topic::Event, recorder.clone());
    s2.subscribe(Topic::Event, recorder);

    s1.send(&greeting("once"));

    assert!(next(&mut received).await.is_some());
    assert!(next(&mut received).await.is_none());
}

#[tokio::test]
async fn test_malformed_payload_is_dropped_and_dispatch_continues() {
    let hub = ChannelHub::new();
    let s2 = router(&hub, "s2").await;
    let (recorder, mut received) = Recorder::new();
    s2.subscribe(Topic::Event, recorder);

    let raw = Connection::open(&hub, &options(), "publish").unwrap();
    raw.when_ready().await.unwrap();
    raw.client().publish(&Topic::Event.channel(), "{not json".to_string());
    assert!(next(&mut received).await.is_none());

    let s1 = router(&hub, "s1").await;
    s1.send(&greeting("after"));
    let (message, _) = next(&mut received).await.expect("dispatch survived");
    assert_eq!(message, greeting("after"));
}

#[tokio::test]
async fn test_inner_topic_selects_listeners() {
    let hub = ChannelHub::new();
    let s2 = router(&hub, "s2").await;
    let (events, mut events_rx) = Recorder::new();
    let (records, mut records_rx) = Recorder::new();
    s2.subscribe(Topic::Event, events);
    s2.subscribe(Topic::Record, records);

    // A record message carried on the event channel.
    let raw = Connection::open(&hub, &options(), "publish").unwrap();
    let envelope = Envelope::broadcast("s1", Message::new(Topic::Record));
    raw.client()
        .publish(&Topic::Event.channel(), envelope.encode().unwrap());

    assert!(next(&mut records_rx).await.is_some());
    assert!(next(&mut events_rx).await.is_none());
}

#[tokio::test]
async fn test_failing_listener_does_not_block_siblings() {
    let hub = ChannelHub::new();
    let s1 = router(&hub, "s1").await;
    let s2 = router(&hub, "s2").await;

    let panicking = |_: &Message, _: &str| -> Result<(), ListenerError> { panic!("boom") };
    let failing = |_: &Message, _: &str| -> Result<(), ListenerError> { Err("nope".into()) };
    let (recorder, mut received) = Recorder::new();
    s2.subscribe(Topic::Event, Arc::new(panicking));
    s2.subscribe(Topic::Event, Arc::new(failing));
    s2.subscribe(Topic::Event, recorder);

    s1.send(&greeting("first"));
    s1.send(&greeting("second"));

    assert_eq!(next(&mut received).await.unwrap().0, greeting("first"));
    assert_eq!(next(&mut received).await.unwrap().0, greeting("second"));
}

#[tokio::test]
async fn test_ready_within_timeout() {
    let hub = ChannelHub::new();
    let s1 = ClusterRouter::new(&hub, &options(), "s1").unwrap();

    s1.when_ready_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(s1.server_name(), "s1");
}

#[tokio::test]
async fn test_close_disconnects_both_connections() {
    let hub = ChannelHub::new();
    let s1 = router(&hub, "s1").await;

    s1.close().await.unwrap();

    assert_eq!(s1.publisher.state(), ConnectionState::Disconnected);
    assert_eq!(s1.subscriber.state(), ConnectionState::Disconnected);
    assert!(s1.dispatcher.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_topic_field_reaches_listener() {
    let hub = ChannelHub::new();
    let s1 = router(&hub, "s1").await;
    let s2 = router(&hub, "s2").await;
    let (recorder, mut received) = Recorder::new();
    s2.subscribe(Topic::Event, recorder);

    s1.send(&Message::new(Topic::Event).with("topic", "chat").with("payload", "hi"));

    let (message, _) = next(&mut received).await.expect("delivered");
    assert_eq!(message.topic, Topic::Event);
    assert_eq!(message.get("payload"), Some(&serde_json::json!("hi")));
}

#[tokio::test]
async fn test_terminated_when_transport_goes_away() {
    let hub = ChannelHub::new();
    let s1 = router(&hub, "s1").await;

    let mut terminated = task::spawn(s1.terminated());
    assert_pending!(terminated.poll());

    hub.sever("server went away");
    tokio::time::timeout(Duration::from_secs(1), s1.terminated())
        .await
        .expect("termination observed");
    assert!(terminated.poll().is_ready());
}

#[test]
fn test_unknown_topic_code_is_logged_as_unknown_topic() {
    let logs = CapturedLogs::default();
    let _guard = logs.install();
    let table = DispatchTable::new();
    let payload = r#"{"fromServer":"s1","message":{"topic":999}}"#;

    assert_eq!(
        handle_inbound("s2", &table, "2", payload),
        InboundOutcome::UnknownTopic
    );
    assert!(logs.contains("Received message for unknown topic"));
    assert!(!logs.contains("Error parsing message"));
}

#[test]
fn test_handle_inbound_outcomes() {
    let table = DispatchTable::new();
    let channel = Topic::Event.channel();
    let ok = |_: &Message, _: &str| -> Result<(), ListenerError> { Ok(()) };
    table.register(Topic::Event, Arc::new(ok));

    let broadcast = |from: &str, topic| Envelope::broadcast(from, Message::new(topic)).encode().unwrap();
    let direct = |to: &str| {
        Envelope::direct("s1", to, Message::new(Topic::Event))
            .encode()
            .unwrap()
    };

    assert_eq!(
        handle_inbound("s2", &table, &channel, "garbage"),
        InboundOutcome::Malformed
    );
    assert_eq!(
        handle_inbound("s1", &table, &channel, &broadcast("s1", Topic::Event)),
        InboundOutcome::SelfEcho
    );
    assert_eq!(
        handle_inbound("s2", &table, &channel, &direct("s3")),
        InboundOutcome::OtherServer
    );
    assert_eq!(
        handle_inbound("s2", &table, &channel, &broadcast("s1", Topic::Rpc)),
        InboundOutcome::UnknownTopic
    );
    assert_eq!(
        handle_inbound("s3", &table, &channel, &direct("s3")),
        InboundOutcome::Delivered {
            succeeded: 1,
            failed: 0
        }
    );
}
