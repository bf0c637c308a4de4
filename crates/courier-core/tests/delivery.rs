//! Delivery across nodes sharing one broker.

use courier_core::hub::HubEvent;
use courier_core::{
    AllowAll, BrokerClients, DeliveryMode, LocalHub, LoginRequest, MemoryBroker, Node, NodeConfig,
    Route, StaticCredentials,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn start(broker: &MemoryBroker, mode: DeliveryMode) -> Node {
    Node::start(
        NodeConfig::with_mode(mode),
        BrokerClients::single(Arc::new(broker.client())),
        Arc::new(LocalHub::new()),
        Arc::new(AllowAll),
    )
    .await
    .unwrap()
}

async fn login(node: &Node, conn_id: &str, identity: &str) -> mpsc::UnboundedReceiver<HubEvent> {
    let outbox = node.connect(conn_id);
    let response = node.login(conn_id, LoginRequest::new(identity, "")).await;
    assert!(response.is_ok(), "login failed: {:?}", response.error);
    outbox
}

async fn recv(outbox: &mut mpsc::UnboundedReceiver<HubEvent>) -> HubEvent {
    tokio::time::timeout(Duration::from_secs(1), outbox.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("outbox closed")
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_cross_node_queued_delivery() {
    let broker = MemoryBroker::new();
    let a = start(&broker, DeliveryMode::Queued).await;
    let b = start(&broker, DeliveryMode::Queued).await;
    let mut outbox = login(&b, "conn-1", "t100n").await;

    assert_eq!(a.send("t100n", "message", json!("hi")).await, Route::Queued);

    let event = recv(&mut outbox).await;
    assert_eq!(event, HubEvent::new("message", json!("hi")));
    eventually(|| broker.list_len("t100n") == 0).await;
}

#[tokio::test]
async fn test_cross_node_direct_delivery() {
    let broker = MemoryBroker::new();
    let a = start(&broker, DeliveryMode::FireAndForget).await;
    let b = start(&broker, DeliveryMode::FireAndForget).await;
    let mut outbox = login(&b, "conn-1", "t100n").await;

    assert_eq!(a.send("t100n", "message", json!({ "n": 1 })).await, Route::Published(1));
    assert_eq!(recv(&mut outbox).await.payload, json!({ "n": 1 }));
    assert_eq!(broker.list_len("t100n"), 0);
}

#[tokio::test]
async fn test_offline_then_online() {
    let broker = MemoryBroker::new();
    let a = start(&broker, DeliveryMode::Queued).await;
    let b = start(&broker, DeliveryMode::Queued).await;

    for n in 0..3 {
        assert_eq!(a.send("ojogador", "message", json!(n)).await, Route::Queued);
    }
    assert_eq!(broker.list_len("ojogador"), 3);

    let mut outbox = login(&b, "conn-1", "ojogador").await;
    for n in 0..3 {
        assert_eq!(recv(&mut outbox).await.payload, json!(n));
    }
    assert_eq!(broker.list_len("ojogador"), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(outbox.try_recv().is_err());
}

#[tokio::test]
async fn test_fire_and_forget_loses_offline_messages() {
    let broker = MemoryBroker::new();
    let a = start(&broker, DeliveryMode::FireAndForget).await;
    let b = start(&broker, DeliveryMode::FireAndForget).await;

    assert_eq!(a.send("ojogador", "message", json!(1)).await, Route::Published(0));

    let mut outbox = login(&b, "conn-1", "ojogador").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(outbox.try_recv().is_err());
    assert_eq!(broker.list_len("ojogador"), 0);
}

#[tokio::test]
async fn test_disconnect_falls_back_to_broker() {
    let broker = MemoryBroker::new();
    let node = start(&broker, DeliveryMode::Queued).await;
    let mut outbox = login(&node, "conn-1", "t100n").await;

    assert_eq!(node.send("t100n", "message", json!(1)).await, Route::Local(1));
    assert_eq!(recv(&mut outbox).await.payload, json!(1));

    node.disconnect("conn-1").await;
    assert!(!node.registry().is_local("t100n"));
    assert_eq!(broker.subscriber_count("t100n"), 0);

    assert_eq!(node.send("t100n", "message", json!(2)).await, Route::Queued);
    assert_eq!(broker.list_len("t100n"), 1);
}

#[tokio::test]
async fn test_failed_login_receives_nothing() {
    let broker = MemoryBroker::new();
    let a = start(&broker, DeliveryMode::Queued).await;
    let b = Node::start(
        NodeConfig::default(),
        BrokerClients::single(Arc::new(broker.client())),
        Arc::new(LocalHub::new()),
        Arc::new(StaticCredentials::default().with_user("t100n", "secret")),
    )
    .await
    .unwrap();

    let mut outbox = b.connect("conn-1");
    let response = b.login("conn-1", LoginRequest::new("t100n", "guess")).await;
    assert_eq!(response.error.as_deref(), Some("Invalid account"));
    assert_eq!(broker.subscriber_count("t100n"), 0);

    assert_eq!(a.send("t100n", "message", json!(1)).await, Route::Queued);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(outbox.try_recv().is_err());
    assert_eq!(broker.list_len("t100n"), 1);
}

#[tokio::test]
async fn test_concurrent_drains_never_duplicate() {
    let broker = MemoryBroker::new();
    let sender = start(&broker, DeliveryMode::Queued).await;
    let a = start(&broker, DeliveryMode::Queued).await;
    let b = start(&broker, DeliveryMode::Queued).await;

    // Both nodes own a connection for the identity, so every wake reaches two
    // drains racing on the same list.
    let mut on_a = login(&a, "conn-a", "t100n").await;
    let mut on_b = login(&b, "conn-b", "t100n").await;

    const COUNT: usize = 50;
    for n in 0..COUNT {
        assert_eq!(sender.send("t100n", "message", json!(n)).await, Route::Queued);
    }
    eventually(|| broker.list_len("t100n") == 0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut delivered = 0;
    while on_a.try_recv().is_ok() {
        delivered += 1;
    }
    while on_b.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, COUNT);
}

#[tokio::test]
async fn test_malformed_entries_do_not_stop_delivery() {
    let broker = MemoryBroker::new();
    let a = start(&broker, DeliveryMode::Queued).await;
    let b = start(&broker, DeliveryMode::Queued).await;

    broker.inject("t100n", "{not an envelope");
    assert_eq!(a.send("t100n", "message", json!("after")).await, Route::Queued);

    let mut outbox = login(&b, "conn-1", "t100n").await;
    assert_eq!(recv(&mut outbox).await.payload, json!("after"));

    let letters = b.dead_letters().drain_all();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].identity, "t100n");
    assert_eq!(letters[0].payload, "{not an envelope");
}

#[tokio::test]
async fn test_broadcast_stays_on_the_local_node() {
    let broker = MemoryBroker::new();
    let a = start(&broker, DeliveryMode::Queued).await;
    let b = start(&broker, DeliveryMode::Queued).await;
    let mut on_a = login(&a, "conn-a", "t100n").await;
    let mut on_b = login(&b, "conn-b", "ojogador").await;

    assert_eq!(a.send("", "notice", json!(null)).await, Route::Broadcast(1));
    assert_eq!(recv(&mut on_a).await.event, "notice");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(on_b.try_recv().is_err());
}

#[tokio::test]
async fn test_split_broker_clients() {
    let broker = MemoryBroker::new();
    let a = start(&broker, DeliveryMode::Queued).await;
    let b = Node::start(
        NodeConfig::default(),
        BrokerClients::split(
            Arc::new(broker.client()),
            Arc::new(broker.client()),
            Arc::new(broker.client()),
        ),
        Arc::new(LocalHub::new()),
        Arc::new(AllowAll),
    )
    .await
    .unwrap();
    let mut outbox = login(&b, "conn-1", "t100n").await;

    assert_eq!(a.send("t100n", "message", json!(1)).await, Route::Queued);
    assert_eq!(recv(&mut outbox).await.payload, json!(1));

    b.shutdown().await;
    assert_eq!(broker.subscriber_count("t100n"), 0);
}
