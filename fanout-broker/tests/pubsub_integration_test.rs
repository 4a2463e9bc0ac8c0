//! End-to-end pub/sub integration tests: a real broker accepting real
//! `fanout_client` connections over TCP.

use fanout_broker::Broker;
use fanout_client::{Client, SubscribeMode, SubscriptionPreferences};
use fanout_core::DeliveredMessage;
use std::time::Duration;
use tokio::sync::mpsc;

async fn spawn_broker() -> (std::net::SocketAddr, tempfile::TempDir, tempfile::TempDir) {
    let meta_dir = tempfile::tempdir().unwrap();
    let log_dir = tempfile::tempdir().unwrap();

    let broker = Broker::builder()
        .bind_plaintext("127.0.0.1:0")
        .metadata_store(meta_dir.path())
        .message_log(log_dir.path())
        .build()
        .await
        .unwrap();

    let addr = broker.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = broker.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, meta_dir, log_dir)
}

#[tokio::test]
async fn publish_then_subscribe_delivers_the_message() {
    let (addr, _meta, _log) = spawn_broker().await;
    let client = Client::builder(addr.to_string()).build().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<DeliveredMessage>();
    let _session = client
        .subscribe(
            "orders",
            "alice",
            SubscribeMode::Create,
            false,
            SubscriptionPreferences::default(),
            move |msg| {
                let _ = tx.send(msg);
            },
        )
        .await
        .unwrap();

    client.publish("orders", b"order-1".to_vec()).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.topic, "orders");
    assert_eq!(delivered.message.payload, b"order-1");
}

#[tokio::test]
async fn multiple_subscribers_each_receive_every_message() {
    let (addr, _meta, _log) = spawn_broker().await;
    let client = Client::builder(addr.to_string()).build().unwrap();

    let (tx1, mut rx1) = mpsc::unbounded_channel::<DeliveredMessage>();
    let (tx2, mut rx2) = mpsc::unbounded_channel::<DeliveredMessage>();

    let _s1 = client
        .subscribe(
            "fanout-topic",
            "alice",
            SubscribeMode::Create,
            false,
            SubscriptionPreferences::default(),
            move |msg| {
                let _ = tx1.send(msg);
            },
        )
        .await
        .unwrap();
    let _s2 = client
        .subscribe(
            "fanout-topic",
            "bob",
            SubscribeMode::Create,
            false,
            SubscriptionPreferences::default(),
            move |msg| {
                let _ = tx2.send(msg);
            },
        )
        .await
        .unwrap();

    client.publish("fanout-topic", b"broadcast".to_vec()).await.unwrap();

    let m1 = tokio::time::timeout(Duration::from_secs(2), rx1.recv()).await.unwrap().unwrap();
    let m2 = tokio::time::timeout(Duration::from_secs(2), rx2.recv()).await.unwrap().unwrap();
    assert_eq!(m1.message.payload, b"broadcast");
    assert_eq!(m2.message.payload, b"broadcast");
}

#[tokio::test]
async fn unsubscribe_stops_further_delivery() {
    let (addr, _meta, _log) = spawn_broker().await;
    let client = Client::builder(addr.to_string()).build().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<DeliveredMessage>();
    let session = client
        .subscribe(
            "alerts",
            "alice",
            SubscribeMode::Create,
            false,
            SubscriptionPreferences::default(),
            move |msg| {
                let _ = tx.send(msg);
            },
        )
        .await
        .unwrap();

    client.publish("alerts", b"first".to_vec()).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.message.payload, b"first");

    session.unsubscribe(Duration::from_secs(2)).await.unwrap();
    client.publish("alerts", b"second".to_vec()).await.unwrap();

    let second = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(second.is_err(), "no message should arrive after unsubscribe");
}
