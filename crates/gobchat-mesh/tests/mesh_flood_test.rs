// Multi-node flooding scenarios over the in-memory link

mod common;

use common::{link_nodes, manual_config, settle, spawn_node, Inbox};
use gobchat_mesh::{Delivery, EventKind, MemoryMedium, MeshEvent, Message, PayloadType};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_full_mesh_delivers_each_message_once() {
    let medium = MemoryMedium::new();
    let mut nodes = Vec::new();
    for name in ["alice", "bob", "carol", "dave"] {
        nodes.push(spawn_node(&medium, name, manual_config()).await);
    }
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            link_nodes(&medium, &nodes[i], &nodes[j]).await;
        }
    }
    let inboxes: Vec<Inbox> = nodes.iter().map(|n| Inbox::attach(n)).collect();

    let id = nodes[0].send_text("hello everyone").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(inboxes[0].len(), 0);
    for inbox in &inboxes[1..] {
        let messages = inbox.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0.id, id);
        assert_eq!(messages[0].0.as_text(), Some("hello everyone"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_ttl_bounds_propagation() {
    let medium = MemoryMedium::new();
    let mut short_ttl = manual_config();
    short_ttl.delivery.default_ttl = 1;
    let a = spawn_node(&medium, "alice", short_ttl).await;
    let b = spawn_node(&medium, "bob", manual_config()).await;
    let c = spawn_node(&medium, "carol", manual_config()).await;
    let d = spawn_node(&medium, "dave", manual_config()).await;
    link_nodes(&medium, &a, &b).await;
    link_nodes(&medium, &b, &c).await;
    link_nodes(&medium, &c, &d).await;
    let (inbox_b, inbox_c, inbox_d) = (Inbox::attach(&b), Inbox::attach(&c), Inbox::attach(&d));

    a.send_text("one hop left").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(inbox_b.messages()[0].0.ttl, 1);
    assert_eq!(inbox_c.messages()[0].0.ttl, 0);
    assert_eq!(inbox_d.len(), 0);
    assert!(medium
        .sent_frames(&c.id())
        .iter()
        .all(|frame| frame.to != d.id()));
}

#[tokio::test(start_paused = true)]
async fn test_relays_never_echo_to_sender() {
    let medium = MemoryMedium::new();
    let a = spawn_node(&medium, "alice", manual_config()).await;
    let b = spawn_node(&medium, "bob", manual_config()).await;
    let c = spawn_node(&medium, "carol", manual_config()).await;
    link_nodes(&medium, &a, &b).await;
    link_nodes(&medium, &b, &c).await;
    let inbox_c = Inbox::attach(&c);

    a.send_text("down the line").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    let received = inbox_c.messages();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1, b.id());
    assert!(medium.sent_frames(&b.id()).iter().all(|f| f.to == c.id()));
    assert!(medium.sent_frames(&c.id()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_diamond_delivers_once_everywhere() {
    let medium = MemoryMedium::new();
    let mut origin = manual_config();
    origin.delivery.default_ttl = 2;
    let a = spawn_node(&medium, "alice", origin).await;
    let b = spawn_node(&medium, "bob", manual_config()).await;
    let c = spawn_node(&medium, "carol", manual_config()).await;
    let d = spawn_node(&medium, "dave", manual_config()).await;
    link_nodes(&medium, &a, &b).await;
    link_nodes(&medium, &a, &c).await;
    link_nodes(&medium, &b, &d).await;
    link_nodes(&medium, &c, &d).await;
    let inboxes = [Inbox::attach(&a), Inbox::attach(&b), Inbox::attach(&c), Inbox::attach(&d)];

    let id = a.send_text("m1").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(inboxes[0].len(), 0);
    for inbox in &inboxes[1..] {
        assert_eq!(inbox.len(), 1);
    }
    let (message, from_peer) = &inboxes[3].messages()[0];
    assert_eq!(message.id, id);
    assert_eq!(message.ttl, 1);
    assert!(*from_peer == b.id() || *from_peer == c.id());
    for relay in [&b, &c, &d] {
        assert!(medium
            .sent_frames(&relay.id())
            .iter()
            .all(|frame| frame.to != a.id()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_diamond_late_copy_is_not_relayed() {
    let medium = MemoryMedium::new();
    let a = spawn_node(&medium, "alice", manual_config()).await;
    let b = spawn_node(&medium, "bob", manual_config()).await;
    let c = spawn_node(&medium, "carol", manual_config()).await;
    let d = spawn_node(&medium, "dave", manual_config()).await;
    link_nodes(&medium, &b, &d).await;
    link_nodes(&medium, &c, &d).await;
    let inbox_d = Inbox::attach(&d);

    // m1 left A with ttl 2 and reaches D through C first, then through B
    let m1 = Message::text(a.id(), 1, "m1");
    let via_c = d.delivery().on_message_received(m1.clone(), &c.id());
    let via_b = d.delivery().on_message_received(m1.clone(), &b.id());
    assert!(matches!(via_c, Delivery::Delivered { .. }));
    assert_eq!(via_b, Delivery::Duplicate);

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(inbox_d.len(), 1);
    assert!(medium.sent_frames(&d.id()).is_empty());
    assert_eq!(d.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fragmented_message_survives_relay() {
    let medium = MemoryMedium::with_max_payload(96);
    let a = spawn_node(&medium, "alice", manual_config()).await;
    let b = spawn_node(&medium, "bob", manual_config()).await;
    let c = spawn_node(&medium, "carol", manual_config()).await;
    link_nodes(&medium, &a, &b).await;
    link_nodes(&medium, &b, &c).await;
    let inbox_c = Inbox::attach(&c);

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let id = a
        .send_broadcast(PayloadType::VoiceRef, payload.clone())
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    let received = inbox_c.messages();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0.id, id);
    assert_eq!(received[0].0.payload_type, PayloadType::VoiceRef);
    assert_eq!(received[0].0.payload, payload);
    assert!(medium.sent_frames(&a.id()).len() > 1);
}

#[tokio::test(start_paused = true)]
async fn test_direct_send_reports_failure_after_retries() {
    let medium = MemoryMedium::new();
    let a = spawn_node(&medium, "alice", manual_config()).await;
    let b = spawn_node(&medium, "bob", manual_config()).await;
    link_nodes(&medium, &a, &b).await;
    let (_, mut events) = a.subscribe_channel(EventKind::Message);

    medium.fail_next_sends(&a.id(), 10);
    let id = a
        .send_to(&b.id(), PayloadType::FileChunk, vec![7; 64])
        .unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    match events.try_recv() {
        Ok(MeshEvent::SendFailed {
            message_id,
            peer_id,
            attempts,
        }) => {
            assert_eq!(message_id, id);
            assert_eq!(peer_id, b.id());
            assert_eq!(attempts, 4);
        }
        other => panic!("expected SendFailed, got {:?}", other),
    }
    assert_eq!(a.queue_len(), 0);
}
