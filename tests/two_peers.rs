use lanchat::{
    config::NodeConfig,
    discovery,
    messaging::{self, MessagingService},
    models::{ChatMessage, DiscoveryRecord, MessageStatus, PeerRecord},
    ChatError, ChatEvent, ChatNode, EventBus, MemoryStore, NodeUpdate,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};

const BASE_HOST: &str = "127.0.0.1";

const WAIT_FOR_UPDATE: Duration = Duration::from_secs(3);

const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// A node on loopback, alone on its own discovery port.
fn node(name: &str, discovery_port: u16) -> ChatNode {
    let mut config = NodeConfig::new();
    config.discovery.port = discovery_port;
    config.discovery.broadcast_host = std::net::Ipv4Addr::LOCALHOST;
    config.discovery.interval = Duration::from_millis(200);
    config.discovery.poll_interval = Duration::from_millis(100);
    config.messaging.port = 0;
    config.messaging.send_timeout = SEND_TIMEOUT;
    config.messaging.poll_interval = Duration::from_millis(100);

    ChatNode::new(config, name, "localhost", BASE_HOST, Arc::new(MemoryStore::new()))
        .expect("Failed to create node.")
}

async fn next_direct_message(node: &ChatNode) -> ChatMessage {
    tokio::time::timeout(WAIT_FOR_UPDATE, async {
        loop {
            if let NodeUpdate::DirectMessage(message) = node.next_update().await {
                return message;
            }
        }
    })
    .await
    .expect("No message received.")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn message_is_delivered_once() {
    let bus_a = Arc::new(EventBus::new(16));
    let bus_b = Arc::new(EventBus::new(16));

    let mut settings = NodeConfig::new().messaging;
    settings.port = 0;
    settings.poll_interval = Duration::from_millis(100);

    let service_a = MessagingService::new(settings.clone(), Arc::clone(&bus_a));
    let service_b = MessagingService::new(settings, Arc::clone(&bus_b));
    service_a.start().await.expect("Failed to start A.");
    let addr_b = service_b.start().await.expect("Failed to start B.");

    let alice = PeerRecord::new("alice", "Alice", "alice-pc", BASE_HOST, 0);
    let message = ChatMessage::direct(&alice, "bob", "Bob", "hello, bob");

    service_a
        .send_message(BASE_HOST, addr_b.port(), &message)
        .await
        .expect("Failed to send.");

    match tokio::time::timeout(WAIT_FOR_UPDATE, bus_b.next()).await {
        Ok(ChatEvent::MessageReceived { message: received, .. }) => assert_eq!(received, message),
        other => panic!("Unexpected event {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(bus_b.is_empty(), "Message should be delivered exactly once.");
    assert!(bus_a.is_empty());

    assert!(service_a.stop().await);
    assert!(service_b.stop().await);
}

#[tokio::test]
async fn unreachable_peer_fails_within_timeout() {
    let listener = tokio::net::TcpListener::bind((BASE_HOST, 0))
        .await
        .expect("Failed to bind.");
    let port = listener.local_addr().expect("No local address.").port();
    drop(listener);

    let alice = PeerRecord::new("alice", "Alice", "alice-pc", BASE_HOST, 0);
    let message = ChatMessage::direct(&alice, "bob", "Bob", "anyone?");

    let started = std::time::Instant::now();
    let result = messaging::send_message(BASE_HOST, port, &message, SEND_TIMEOUT).await;

    assert!(matches!(
        result,
        Err(ChatError::PeerUnreachable(..) | ChatError::Timeout(..))
    ));
    assert!(started.elapsed() < SEND_TIMEOUT + Duration::from_millis(500));
}

#[test]
fn bye_is_distinguishable_from_heartbeat() {
    let sender: SocketAddr = "192.168.1.20:9999".parse().expect("Bad address.");
    let alice = PeerRecord::new("alice", "Alice", "alice-pc", "192.168.1.20", 10000);

    let heartbeat = serde_json::to_vec(&DiscoveryRecord::Heartbeat(alice.heartbeat()))
        .expect("Failed to encode.");
    let bye = serde_json::to_vec(&DiscoveryRecord::Bye(alice.bye())).expect("Failed to encode.");

    match discovery::classify(&heartbeat, sender).expect("Failed to classify.") {
        ChatEvent::PeerDiscovered { peer, .. } => {
            assert_eq!(peer.peer_id, "alice");
            assert_eq!(peer.tcp_port, 10000);
        }
        other => panic!("Unexpected event {other:?}"),
    }
    assert_eq!(
        discovery::classify(&bye, sender).expect("Failed to classify."),
        ChatEvent::PeerDeparted {
            peer_id: "alice".to_owned(),
            sender,
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_chat_both_ways() {
    let alice = node("alice", 39970);
    let bob = node("bob", 39971);
    alice.start().await.expect("Failed to start alice.");
    bob.start().await.expect("Failed to start bob.");

    // Each node is alone on its discovery port; introduce them directly.
    alice.registry().observe(bob.local().await).await;
    bob.registry().observe(alice.local().await).await;

    let sent = alice
        .send_text("bob", "hi bob")
        .await
        .expect("Failed to send to bob.");
    assert_eq!(sent.status, MessageStatus::Sent);

    let received = next_direct_message(&bob).await;
    assert_eq!(received.msg_id, sent.msg_id);
    assert_eq!(received.body, "hi bob");
    assert_eq!(received.status, MessageStatus::Received);

    let bob_id = bob.local().await.peer_id;
    let alice_id = alice.local().await.peer_id;

    bob.send_text(&alice_id, "hi alice")
        .await
        .expect("Failed to send to alice.");
    assert_eq!(next_direct_message(&alice).await.body, "hi alice");

    let history = alice.history(&bob_id, 10).await.expect("Failed to query.");
    assert_eq!(
        history.iter().map(|message| message.body.as_str()).collect::<Vec<_>>(),
        vec!["hi bob", "hi alice"]
    );
    assert_eq!(bob.unread_count(&alice_id).await.expect("Failed to count."), 1);

    alice.shutdown().await;
    bob.shutdown().await;
}
