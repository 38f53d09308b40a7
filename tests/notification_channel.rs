mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{wait_until, within, HangupBroker, TestBroker};
use lasercraft::mqtt::{
    ConnectionState, Message, MessageHandler, MqttError, MqttOptions, NotificationChannel, QoS,
    ReconnectPolicy, ReconnectSupervisor,
};

const TOPIC: &str = "laser_engraver_img";

fn channel_for(broker: &TestBroker, client_id: &str) -> NotificationChannel {
    let mut options = MqttOptions::new(broker.address(), client_id);
    options.ack_timeout = Duration::from_secs(2);
    NotificationChannel::new(options)
}

fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<Message>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler: MessageHandler = Arc::new(move |message: &Message| {
        sink.lock().unwrap().push(message.clone());
    });
    (handler, received)
}

#[tokio::test]
async fn test_publish_reaches_handler_exactly_once() {
    let broker = TestBroker::start().await;
    let subscriber = channel_for(&broker, "subscriber");
    let publisher = channel_for(&broker, "publisher");
    subscriber.connect().await.unwrap();
    publisher.connect().await.unwrap();

    let (handler, received) = recording_handler();
    subscriber
        .subscribe(TOPIC, QoS::AtLeastOnce, handler)
        .await
        .unwrap();
    assert_eq!(subscriber.current_state(), ConnectionState::Subscribed);

    let payload = vec![0x89, b'P', b'N', b'G', 1, 2, 3];
    publisher
        .publish(TOPIC, payload.clone(), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || !received.lock().unwrap().is_empty()).await);
    // Give a duplicate delivery the chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, TOPIC);
    assert_eq!(received[0].payload, payload);
}

#[tokio::test]
async fn test_handlers_on_different_topics_stay_separate() {
    let broker = TestBroker::start().await;
    let channel = channel_for(&broker, "shared");
    channel.connect().await.unwrap();

    let (images, image_messages) = recording_handler();
    let (status, status_messages) = recording_handler();
    channel.subscribe(TOPIC, QoS::AtLeastOnce, images).await.unwrap();
    channel
        .subscribe("engraver/+/status", QoS::AtMostOnce, status)
        .await
        .unwrap();
    assert_eq!(channel.subscription_count(), 2);

    channel
        .publish(TOPIC, b"image".to_vec(), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    channel
        .publish("engraver/1/status", b"busy".to_vec(), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            image_messages.lock().unwrap().len() == 1 && status_messages.lock().unwrap().len() == 1
        })
        .await
    );
    assert_eq!(image_messages.lock().unwrap()[0].payload, b"image");
    assert_eq!(status_messages.lock().unwrap()[0].payload, b"busy");
}

#[tokio::test]
async fn test_rejected_subscription_is_reported() {
    let broker = TestBroker::start().await;
    broker.reject("forbidden");
    let channel = channel_for(&broker, "rejected");
    channel.connect().await.unwrap();

    let (handler, _) = recording_handler();
    let result = channel.subscribe("forbidden", QoS::AtLeastOnce, handler).await;

    assert!(matches!(result, Err(MqttError::SubscribeRejected(topic)) if topic == "forbidden"));
    assert_eq!(channel.subscription_count(), 0);
    assert_eq!(channel.current_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_second_connect_is_a_no_op() {
    let broker = TestBroker::start().await;
    let channel = channel_for(&broker, "twice");

    channel.connect().await.unwrap();
    channel.connect().await.unwrap();

    assert_eq!(broker.connect_count(), 1);
    assert!(channel.is_connected());
}

#[tokio::test]
async fn test_unsubscribe_only_after_last_handler() {
    let broker = TestBroker::start().await;
    let channel = channel_for(&broker, "handlers");
    channel.connect().await.unwrap();

    let (first, _) = recording_handler();
    let (second, _) = recording_handler();
    let first = channel.subscribe(TOPIC, QoS::AtLeastOnce, first).await.unwrap();
    let second = channel.subscribe(TOPIC, QoS::AtLeastOnce, second).await.unwrap();
    assert_eq!(broker.subscriber_count(TOPIC), 1);

    channel.remove_subscription(first).await.unwrap();
    assert_eq!(broker.subscriber_count(TOPIC), 1);
    assert_eq!(channel.current_state(), ConnectionState::Subscribed);

    channel.remove_subscription(second).await.unwrap();
    assert_eq!(broker.subscriber_count(TOPIC), 0);
    assert_eq!(channel.current_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_supervisor_restores_subscriptions_after_drop() {
    let broker = TestBroker::start().await;
    let channel = channel_for(&broker, "resilient");
    let shutdown = CancellationToken::new();
    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: 20,
    };
    let _supervisor = ReconnectSupervisor::spawn(channel.clone(), policy, &shutdown);

    channel.connect().await.unwrap();
    let (handler, received) = recording_handler();
    channel.subscribe(TOPIC, QoS::AtLeastOnce, handler).await.unwrap();

    broker.drop_connections();

    assert!(wait_until(Duration::from_secs(5), || broker.connect_count() >= 2).await);
    let mut state = channel.state();
    within(state.wait_for(|s| *s == ConnectionState::Subscribed))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || broker.subscriber_count(TOPIC) == 1).await);
    assert_eq!(channel.subscription_count(), 1);

    let publisher = channel_for(&broker, "publisher");
    publisher.connect().await.unwrap();
    publisher
        .publish(TOPIC, b"after reconnect".to_vec(), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || received.lock().unwrap().len() == 1).await);
    shutdown.cancel();
}

#[tokio::test]
async fn test_disconnect_does_not_reconnect() {
    let broker = TestBroker::start().await;
    let channel = channel_for(&broker, "leaving");
    let shutdown = CancellationToken::new();
    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        max_attempts: 5,
    };
    let _supervisor = ReconnectSupervisor::spawn(channel.clone(), policy, &shutdown);

    channel.connect().await.unwrap();
    channel.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(broker.connect_count(), 1);
    assert_eq!(channel.current_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_exactly_once_subscription_is_requested_as_at_least_once() {
    let broker = TestBroker::start().await;
    let channel = channel_for(&broker, "qos2");
    channel.connect().await.unwrap();

    let (handler, received) = recording_handler();
    channel.subscribe(TOPIC, QoS::ExactlyOnce, handler).await.unwrap();
    assert_eq!(broker.requested_qos(TOPIC), Some(QoS::AtLeastOnce));

    channel
        .publish(TOPIC, b"png".to_vec(), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || received.lock().unwrap().len() == 1).await);
    assert!(channel.is_connected());
}

#[tokio::test]
async fn test_concurrent_connect_is_refused() {
    let broker = HangupBroker::start(Duration::from_millis(300)).await;
    let mut options = MqttOptions::new(broker.address(), "impatient");
    options.ack_timeout = Duration::from_secs(2);
    let channel = NotificationChannel::new(options);

    let first = tokio::spawn({
        let channel = channel.clone();
        async move { channel.connect().await }
    });
    assert!(wait_until(Duration::from_secs(2), || broker.connect_count() == 1).await);

    let second = channel.connect().await;
    assert!(matches!(second, Err(MqttError::ConnectInProgress)));

    within(first).await.unwrap().unwrap();
    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broker_hangup_after_connack_ends_disconnected() {
    let broker = HangupBroker::start(Duration::ZERO).await;

    for attempt in 0..50 {
        let channel = NotificationChannel::new(MqttOptions::new(
            broker.address(),
            format!("hangup-{}", attempt),
        ));
        let mut events = channel.events();

        // The broker may hang up before or after connect() returns
        let _ = channel.connect().await;
        within(events.recv()).await.unwrap();

        assert_eq!(channel.current_state(), ConnectionState::Disconnected);
        let result = channel.publish(TOPIC, vec![1], QoS::AtMostOnce, false).await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }
}
