//! One mesh participant: identity, link, registry, connections and delivery
//! wired together behind the surface the UI layer talks to.

use chrono::{DateTime, Utc};
use crate::config::MeshConfig;
use crate::connection::{ConnectionManager, InboundMessage};
use crate::delivery::DeliveryEngine;
use crate::error::{MeshError, MeshResult};
use crate::event_bus::{EventBus, EventKind, MeshEvent, SubscriptionHandle};
use crate::identity::{DeviceIdentity, IdentityStore};
use crate::link::{LinkAdapter, ScanHandle};
use crate::registry::{PeerRegistry, StaleSweep};
use crate::types::{
    ConnectionState, DiscoveryEvent, Message, MessageId, PayloadType, PeerDevice, PeerId, Target,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one maintenance pass cleaned up
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub seen_purged: usize,
    pub reassemblies_purged: usize,
    pub stale: StaleSweep,
}

/// A mesh engine instance bound to one link
pub struct MeshNode {
    identity: Arc<IdentityStore>,
    config: MeshConfig,
    link: Arc<dyn LinkAdapter>,
    bus: Arc<EventBus>,
    registry: Arc<PeerRegistry>,
    connections: Arc<ConnectionManager>,
    delivery: Arc<DeliveryEngine>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    scan: Mutex<Option<ScanHandle>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl MeshNode {
    pub fn new(identity: Arc<IdentityStore>, link: Arc<dyn LinkAdapter>, config: MeshConfig) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(PeerRegistry::new(bus.clone()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(ConnectionManager::new(
            link.clone(),
            registry.clone(),
            &config,
            inbound_tx,
        ));
        let delivery = Arc::new(DeliveryEngine::new(
            identity.id(),
            config.delivery.clone(),
            connections.clone(),
            bus.clone(),
        ));

        Arc::new(Self {
            identity,
            config,
            link,
            bus,
            registry,
            connections,
            delivery,
            inbound: Mutex::new(Some(inbound_rx)),
            scan: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start background work and check the link. Returns whether the node is ready.
    pub async fn initialize(self: &Arc<Self>) -> bool {
        if !self.started.swap(true, Ordering::SeqCst) {
            let inbound = self
                .inbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(inbound) = inbound {
                self.spawn_inbound_pump(inbound);
            }
            self.connections.start().await;
            self.spawn_maintenance();
        }

        let ready = self.link.is_available().await;
        if ready {
            info!(device_id = %self.identity.id(), "Mesh node ready");
        } else {
            warn!(device_id = %self.identity.id(), "Link unavailable, mesh node not ready");
        }
        ready
    }

    pub async fn is_ready(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.link.is_available().await
    }

    fn spawn_inbound_pump(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        let delivery = self.delivery.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = inbound.recv() => match next {
                        Some(InboundMessage { message, from_peer }) => {
                            delivery.on_message_received(message, &from_peer);
                        }
                        None => break,
                    },
                }
            }
            debug!("Inbound pump stopped");
        });
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let node = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.config.registry.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(node) = node.upgrade() else { break };
                        node.run_maintenance().await;
                    }
                }
            }
            debug!("Maintenance task terminated");
        });
    }

    /// Purge expired dedup entries and partial messages, then sweep silent peers
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_at(Utc::now()).await
    }

    /// Maintenance pass judging peer silence against `now`
    pub async fn run_maintenance_at(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let seen_purged = self.delivery.purge_seen();
        let reassemblies_purged = self.connections.purge_reassemblies();
        let stale = self
            .connections
            .mark_stale_at(now, self.config.registry.silence_timeout)
            .await;
        for peer_id in stale
            .live
            .iter()
            .chain(stale.disconnected.iter())
            .chain(stale.removed.iter())
        {
            self.delivery.cancel_peer(peer_id);
        }

        let report = MaintenanceReport {
            seen_purged,
            reassemblies_purged,
            stale,
        };
        if report != MaintenanceReport::default() {
            debug!(?report, "Maintenance pass");
        }
        report
    }

    /// Start discovering peers. A scan already running is left alone.
    pub async fn start_scan(self: &Arc<Self>) -> MeshResult<()> {
        if !self.link.is_available().await {
            return Err(MeshError::LinkUnavailable);
        }
        if self.is_scanning() {
            debug!("Scan already in progress");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.link.scan(tx).await?;
        {
            let mut scan = self.scan.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = scan.replace(handle.clone()) {
                previous.cancel();
            }
        }
        info!(duration_secs = self.config.scan.duration.as_secs(), "Started scanning");

        let node = self.clone();
        let deadline = tokio::time::sleep(self.config.scan.duration);
        tokio::spawn(async move {
            tokio::pin!(deadline);
            let stop = handle.token().clone();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = node.shutdown.cancelled() => break,
                    _ = &mut deadline => {
                        info!("Scan duration elapsed");
                        break;
                    }
                    next = rx.recv() => match next {
                        Some(event) => node.handle_discovery(event).await,
                        None => break,
                    },
                }
            }
            handle.cancel();
            debug!("Scan task terminated");
        });
        Ok(())
    }

    async fn handle_discovery(self: &Arc<Self>, event: DiscoveryEvent) {
        if event.peer_id == self.identity.id() {
            return;
        }

        self.registry.upsert(&event);
        let state = self.connections.note_discovery(&event.peer_id).await;
        if !self.config.scan.auto_connect || state != Some(ConnectionState::Discovered) {
            return;
        }

        let connections = self.connections.clone();
        let peer_id = event.peer_id;
        tokio::spawn(async move {
            if let Err(e) = connections.connect_discovered(&peer_id).await {
                debug!(peer_id = %peer_id, error = %e, "Auto-connect failed");
            }
        });
    }

    /// Stop discovering. Existing connections are untouched.
    pub fn stop_scan(&self) {
        let handle = self.scan.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if !handle.is_cancelled() {
                handle.cancel();
                info!("Stopped scanning");
            }
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |handle| !handle.is_cancelled())
    }

    pub async fn connect(self: &Arc<Self>, peer_id: &PeerId) -> MeshResult<()> {
        self.connections.connect(peer_id).await
    }

    /// Disconnect a peer, dropping its queued messages and pending reconnects
    pub async fn disconnect(&self, peer_id: &PeerId) -> MeshResult<()> {
        self.delivery.cancel_peer(peer_id);
        self.connections.disconnect(peer_id).await
    }

    /// Stop scanning and disconnect every peer. Returns how many were closed.
    pub async fn disconnect_all(&self) -> usize {
        self.stop_scan();
        for peer in self.registry.list(None) {
            self.delivery.cancel_peer(&peer.id);
        }
        self.connections.disconnect_all().await
    }

    /// Broadcast a text message to every connected peer
    pub fn send_text(self: &Arc<Self>, text: &str) -> MeshResult<MessageId> {
        self.send_broadcast(PayloadType::Text, text.as_bytes().to_vec())
    }

    pub fn send_broadcast(
        self: &Arc<Self>,
        payload_type: PayloadType,
        payload: Vec<u8>,
    ) -> MeshResult<MessageId> {
        if self.connections.connection_count() == 0 {
            return Err(MeshError::NoConnectedPeers);
        }
        let message = self.new_message(payload_type, payload);
        let id = message.id;
        self.delivery.send(message, Target::Broadcast)?;
        Ok(id)
    }

    /// Send to one connected neighbour; it relays onwards like any flooded message
    pub fn send_to(
        self: &Arc<Self>,
        peer_id: &PeerId,
        payload_type: PayloadType,
        payload: Vec<u8>,
    ) -> MeshResult<MessageId> {
        let message = self.new_message(payload_type, payload);
        let id = message.id;
        self.delivery.send(message, Target::Peer(peer_id.clone()))?;
        Ok(id)
    }

    fn new_message(&self, payload_type: PayloadType, payload: Vec<u8>) -> Message {
        Message::new(
            self.identity.id(),
            self.config.delivery.default_ttl,
            payload_type,
            payload,
        )
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&MeshEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    pub fn subscribe_channel(
        &self,
        kind: EventKind,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<MeshEvent>) {
        self.bus.subscribe_channel(kind)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    pub fn peers(&self) -> Vec<PeerDevice> {
        self.registry.list(None)
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerDevice> {
        self.registry.get(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<PeerDevice> {
        self.registry.list(Some(ConnectionState::Connected))
    }

    pub fn discovered_peers(&self) -> Vec<PeerDevice> {
        self.registry.list(Some(ConnectionState::Discovered))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    pub fn device_info(&self) -> DeviceIdentity {
        self.identity.identity()
    }

    pub fn id(&self) -> PeerId {
        self.identity.id()
    }

    pub async fn set_display_name(&self, name: &str) -> MeshResult<()> {
        self.identity.set_display_name(name).await
    }

    /// Entries waiting in the outbound queue
    pub fn queue_len(&self) -> usize {
        self.delivery.queue_len()
    }

    pub fn delivery(&self) -> &Arc<DeliveryEngine> {
        &self.delivery
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Stop every background task and close all connections
    pub async fn shutdown(&self) {
        self.stop_scan();
        self.delivery.shutdown();
        self.connections.shutdown().await;
        self.shutdown.cancel();
        if self.bus.subscriber_count() > 0 {
            debug!("{} subscribers still attached at shutdown", self.bus.subscriber_count());
        }
        info!(device_id = %self.identity.id(), "Mesh node stopped");
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
