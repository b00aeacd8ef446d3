#![allow(dead_code)]

use gobchat_mesh::{
    ConnectionState, EventKind, IdentityStore, MemoryMedium, MemoryStore, MeshConfig, MeshEvent,
    MeshNode, Message, PeerId,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Node config for deterministic topologies: links are only opened explicitly
pub fn manual_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.scan.auto_connect = false;
    config
}

pub async fn spawn_node(medium: &Arc<MemoryMedium>, name: &str, config: MeshConfig) -> Arc<MeshNode> {
    let store = Arc::new(MemoryStore::new());
    let identity = IdentityStore::load_or_create(store, Some(name.to_string()))
        .await
        .unwrap();
    let link = medium.join(&identity.id(), name);
    let node = MeshNode::new(Arc::new(identity), link, config);
    assert!(node.initialize().await);
    node
}

pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Put two nodes in range and open a link from `a` to `b`
pub async fn link_nodes(medium: &Arc<MemoryMedium>, a: &Arc<MeshNode>, b: &Arc<MeshNode>) {
    medium.place_in_range(&a.id(), &b.id());
    a.start_scan().await.unwrap();
    settle().await;
    a.connect(&b.id()).await.unwrap();
    a.stop_scan();
    settle().await;
    assert_eq!(
        b.peer(&a.id()).map(|p| p.connection_state),
        Some(ConnectionState::Connected)
    );
}

/// Every message a node published to its subscribers
#[derive(Clone, Default)]
pub struct Inbox {
    received: Arc<Mutex<Vec<(Message, PeerId)>>>,
}

impl Inbox {
    pub fn attach(node: &MeshNode) -> Self {
        let inbox = Inbox::default();
        let received = inbox.received.clone();
        node.subscribe(EventKind::Message, move |event| {
            if let MeshEvent::MessageReceived { message, from_peer } = event {
                received
                    .lock()
                    .unwrap()
                    .push((message.clone(), from_peer.clone()));
            }
            Ok(())
        });
        inbox
    }

    pub fn messages(&self) -> Vec<(Message, PeerId)> {
        self.received.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

/// Connection state changes of one node, stamped with the (paused) clock
#[derive(Clone, Default)]
pub struct StateLog {
    changes: Arc<Mutex<Vec<(Instant, PeerId, ConnectionState, ConnectionState)>>>,
}

impl StateLog {
    pub fn attach(node: &MeshNode) -> Self {
        let log = StateLog::default();
        let changes = log.changes.clone();
        node.subscribe(EventKind::Connection, move |event| {
            if let MeshEvent::ConnectionChanged { peer, previous, new } = event {
                changes
                    .lock()
                    .unwrap()
                    .push((Instant::now(), peer.id.clone(), *previous, *new));
            }
            Ok(())
        });
        log
    }

    pub fn changes(&self) -> Vec<(Instant, PeerId, ConnectionState, ConnectionState)> {
        self.changes.lock().unwrap().clone()
    }

    /// When `peer` entered `state`, relative to `since`
    pub fn entered_after(&self, peer: &PeerId, state: ConnectionState, since: Instant) -> Vec<Duration> {
        self.changes()
            .into_iter()
            .filter(|(at, id, _, new)| id == peer && *new == state && *at >= since)
            .map(|(at, ..)| at - since)
            .collect()
    }
}
