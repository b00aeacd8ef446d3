// Connection Manager - owns the per-peer connection state machine

use crate::codec::{MessageCodec, ReassemblyBuffer};
use crate::config::{CodecConfig, ConnectionConfig, MeshConfig};
use crate::error::{LinkError, MeshError, MeshResult};
use crate::link::{ConnectionHandle, LinkAdapter, LinkConnection, LinkEvent};
use crate::registry::{PeerRegistry, StaleSweep};
use crate::types::{ConnectionState, DiscoveryEvent, Message, PeerId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A reassembled message together with the neighbour that handed it over
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: Message,
    pub from_peer: PeerId,
}

struct OutboundBatch {
    frames: Vec<Vec<u8>>,
    ack: oneshot::Sender<Result<(), LinkError>>,
}

/// A live link to one peer.
///
/// Owns the reader and writer tasks plus the reassembly buffer. Dropping it
/// stops both tasks and discards any partially received messages.
pub struct Connection {
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedSender<OutboundBatch>,
    reassembly: Arc<std::sync::Mutex<ReassemblyBuffer>>,
    token: CancellationToken,
    established_at: DateTime<Utc>,
}

impl Connection {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    User,
    Discovery,
    Reconnect,
}

#[derive(Default)]
struct ReconnectState {
    failures: u32,
    timer: Option<CancellationToken>,
}

/// Drives every peer through the connection state machine.
///
/// All operations on one peer are serialized by a per-peer lock; the lock is
/// released while the link is connecting so a disconnect can abandon the attempt.
pub struct ConnectionManager {
    config: ConnectionConfig,
    codec_config: CodecConfig,
    codec: MessageCodec,
    link: Arc<dyn LinkAdapter>,
    registry: Arc<PeerRegistry>,
    connections: DashMap<PeerId, Connection>,
    locks: DashMap<PeerId, Arc<tokio::sync::Mutex<()>>>,
    attempts: DashMap<PeerId, u64>,
    next_attempt: AtomicU64,
    reconnects: DashMap<PeerId, ReconnectState>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        link: Arc<dyn LinkAdapter>,
        registry: Arc<PeerRegistry>,
        config: &MeshConfig,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        let codec = MessageCodec::new(link.max_payload_size());
        Self {
            config: config.connection.clone(),
            codec_config: config.codec.clone(),
            codec,
            link,
            registry,
            connections: DashMap::new(),
            locks: DashMap::new(),
            attempts: DashMap::new(),
            next_attempt: AtomicU64::new(1),
            reconnects: DashMap::new(),
            inbound,
            shutdown: CancellationToken::new(),
        }
    }

    /// Begin accepting connections opened by remote devices
    pub async fn start(self: &Arc<Self>) {
        let mut incoming = match self.link.take_incoming().await {
            Some(incoming) => incoming,
            None => {
                debug!("Link does not accept incoming connections");
                return;
            }
        };

        let manager = self.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = incoming.recv() => match next {
                        Some(connection) => manager.accept_incoming(connection).await,
                        None => break,
                    },
                }
            }
            debug!("Stopped accepting incoming connections");
        });
    }

    pub fn codec(&self) -> MessageCodec {
        self.codec
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    fn peer_lock(&self, peer_id: &PeerId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(peer_id.clone()).or_default().clone()
    }

    /// Connect to a known peer.
    ///
    /// Returns `Ok` immediately if the peer is already connected and
    /// `AlreadyConnecting` while another attempt is in flight.
    pub async fn connect(self: &Arc<Self>, peer_id: &PeerId) -> MeshResult<()> {
        self.connect_with(peer_id, ConnectOrigin::User).await
    }

    /// Connect to a freshly discovered peer, coalescing with in-flight attempts
    pub async fn connect_discovered(self: &Arc<Self>, peer_id: &PeerId) -> MeshResult<()> {
        match self.connect_with(peer_id, ConnectOrigin::Discovery).await {
            Err(MeshError::AlreadyConnecting(_)) => Ok(()),
            other => other,
        }
    }

    async fn connect_with(self: &Arc<Self>, peer_id: &PeerId, origin: ConnectOrigin) -> MeshResult<()> {
        if !self.link.is_available().await {
            return Err(MeshError::LinkUnavailable);
        }

        let lock = self.peer_lock(peer_id);
        let attempt = {
            let _guard = lock.lock().await;
            match self.registry.state(peer_id) {
                None => return Err(MeshError::PeerNotFound(peer_id.clone())),
                Some(ConnectionState::Connected) => {
                    debug!("Connection to peer {} already exists", peer_id);
                    return Ok(());
                }
                Some(ConnectionState::Connecting) => {
                    return Err(MeshError::AlreadyConnecting(peer_id.clone()))
                }
                Some(ConnectionState::Disconnecting) => {
                    return Err(MeshError::InvalidTransition {
                        peer: peer_id.clone(),
                        from: ConnectionState::Disconnecting,
                        to: ConnectionState::Connecting,
                    })
                }
                Some(_) => {}
            }

            self.registry.transition(peer_id, ConnectionState::Connecting)?;
            let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
            self.attempts.insert(peer_id.clone(), attempt);
            attempt
        };
        info!(peer_id = %peer_id, origin = ?origin, "Establishing connection to peer");

        let result = tokio::time::timeout(self.config.connect_timeout, self.link.connect(peer_id)).await;

        let _guard = lock.lock().await;
        let current = self.attempts.get(peer_id).map(|a| *a) == Some(attempt);
        if !current || self.registry.state(peer_id) != Some(ConnectionState::Connecting) {
            // Superseded by an accepted incoming link or abandoned by a disconnect
            if let Ok(Ok(connection)) = result {
                if let Err(e) = self.link.disconnect(&connection.handle).await {
                    debug!("Failed to close abandoned link to {}: {}", peer_id, e);
                }
            }
            return match self.registry.state(peer_id) {
                Some(ConnectionState::Connected) => Ok(()),
                _ => Err(MeshError::PeerNotConnected(peer_id.clone())),
            };
        }
        self.attempts.remove(peer_id);

        let error = match result {
            Ok(Ok(connection)) => {
                self.install(connection)?;
                return Ok(());
            }
            Ok(Err(e)) => MeshError::Link(e),
            Err(_) => MeshError::ConnectTimeout(peer_id.clone()),
        };

        warn!(peer_id = %peer_id, error = %error, "Connection attempt failed");
        self.registry.transition(peer_id, ConnectionState::Failed)?;
        if origin == ConnectOrigin::Reconnect {
            self.schedule_reconnect(peer_id);
        }
        Err(error)
    }

    /// Must be called with the peer lock held and the peer in `Connecting`
    fn install(self: &Arc<Self>, connection: LinkConnection) -> MeshResult<()> {
        let LinkConnection { handle, events, .. } = connection;
        let peer_id = handle.peer_id.clone();

        let token = self.shutdown.child_token();
        let reassembly = Arc::new(std::sync::Mutex::new(ReassemblyBuffer::new(
            self.codec_config.max_pending_reassemblies,
            self.codec_config.reassembly_timeout,
        )));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(
            self.link.clone(),
            handle.clone(),
            outbound_rx,
            token.clone(),
        ));
        tokio::spawn(run_reader(
            self.clone(),
            handle.clone(),
            events,
            reassembly.clone(),
            token.clone(),
        ));

        self.connections.insert(
            peer_id.clone(),
            Connection {
                handle,
                outbound: outbound_tx,
                reassembly,
                token,
                established_at: Utc::now(),
            },
        );

        if let Err(e) = self.registry.transition(&peer_id, ConnectionState::Connected) {
            self.connections.remove(&peer_id);
            return Err(e);
        }
        self.registry.touch(&peer_id);
        if let Some(mut reconnect) = self.reconnects.get_mut(&peer_id) {
            reconnect.failures = 0;
        }

        info!(peer_id = %peer_id, "Successfully established connection to peer");
        Ok(())
    }

    async fn accept_incoming(self: &Arc<Self>, connection: LinkConnection) {
        let peer_id = connection.handle.peer_id.clone();
        let lock = self.peer_lock(&peer_id);
        let _guard = lock.lock().await;

        if !self.registry.contains(&peer_id) {
            self.registry.upsert(&DiscoveryEvent {
                peer_id: peer_id.clone(),
                display_name: connection.peer_name.clone(),
                signal_strength: i16::MIN,
            });
        }

        match self.registry.state(&peer_id) {
            Some(ConnectionState::Connecting) => {
                debug!("Incoming link from {} supersedes our own attempt", peer_id);
                self.attempts.remove(&peer_id);
            }
            Some(ConnectionState::Connected) | Some(ConnectionState::Disconnecting) | None => {
                debug!("Rejecting duplicate incoming link from {}", peer_id);
                if let Err(e) = self.link.disconnect(&connection.handle).await {
                    debug!("Failed to close rejected link: {}", e);
                }
                return;
            }
            Some(_) => {
                if let Err(e) = self.registry.transition(&peer_id, ConnectionState::Connecting) {
                    warn!("Cannot accept link from {}: {}", peer_id, e);
                    return;
                }
            }
        }

        if let Err(e) = self.install(connection) {
            warn!("Failed to install incoming link from {}: {}", peer_id, e);
        }
    }

    /// Close the connection to a peer and stop reconnecting to it
    pub async fn disconnect(&self, peer_id: &PeerId) -> MeshResult<()> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;
        self.cancel_reconnect(peer_id);

        match self.registry.state(peer_id) {
            None => Err(MeshError::PeerNotFound(peer_id.clone())),
            Some(ConnectionState::Connected) | Some(ConnectionState::Connecting) => {
                self.registry.transition(peer_id, ConnectionState::Disconnecting)?;
                self.attempts.remove(peer_id);
                self.teardown(peer_id).await;
                self.registry.transition(peer_id, ConnectionState::Disconnected)?;
                info!("Disconnected from peer: {}", peer_id);
                Ok(())
            }
            Some(ConnectionState::Failed) => {
                self.registry.transition(peer_id, ConnectionState::Disconnected)?;
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Disconnect every peer with a live connection. Returns how many were closed.
    pub async fn disconnect_all(&self) -> usize {
        let live: Vec<PeerId> = self
            .registry
            .list(None)
            .into_iter()
            .filter(|p| p.connection_state.has_live_connection())
            .map(|p| p.id)
            .collect();

        let mut closed = 0;
        for peer_id in live {
            match self.disconnect(&peer_id).await {
                Ok(()) => closed += 1,
                Err(e) => warn!("Failed to disconnect {}: {}", peer_id, e),
            }
        }
        closed
    }

    async fn teardown(&self, peer_id: &PeerId) {
        if let Some((_, connection)) = self.connections.remove(peer_id) {
            let handle = connection.handle.clone();
            drop(connection);
            if let Err(e) = self.link.disconnect(&handle).await {
                debug!("Link disconnect for {} reported: {}", peer_id, e);
            }
        }
    }

    /// React to the transport ending `session`. A deliberate close by the remote
    /// end is an orderly disconnect; a lost link fails the peer and reconnects.
    async fn handle_link_drop(self: &Arc<Self>, peer_id: &PeerId, session: u64, lost: Option<&str>) {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;

        let current = self.connections.get(peer_id).map(|c| c.handle.session);
        if current != Some(session) {
            return;
        }
        self.connections.remove(peer_id);
        if self.registry.state(peer_id) != Some(ConnectionState::Connected) {
            return;
        }

        match lost {
            None => {
                info!("Peer {} closed the connection", peer_id);
                let closed = self
                    .registry
                    .transition(peer_id, ConnectionState::Disconnecting)
                    .and_then(|_| self.registry.transition(peer_id, ConnectionState::Disconnected));
                if let Err(e) = closed {
                    warn!("Failed to record remote close of {}: {}", peer_id, e);
                }
            }
            Some(reason) => {
                warn!(peer_id = %peer_id, reason = %reason, "Connection lost");
                if self
                    .registry
                    .transition(peer_id, ConnectionState::Failed)
                    .is_ok()
                    && self.config.auto_reconnect
                {
                    self.schedule_reconnect(peer_id);
                }
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, peer_id: &PeerId) {
        let (delay, token, failures) = {
            let mut entry = self.reconnects.entry(peer_id.clone()).or_default();
            entry.failures = entry.failures.saturating_add(1);
            if let Some(previous) = entry.timer.take() {
                previous.cancel();
            }
            let token = self.shutdown.child_token();
            entry.timer = Some(token.clone());
            (self.config.reconnect_delay(entry.failures), token, entry.failures)
        };
        info!(
            peer_id = %peer_id,
            failures,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let manager = self.clone();
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            manager.reconnect(&peer_id).await;
        });
    }

    async fn reconnect(self: &Arc<Self>, peer_id: &PeerId) {
        match self.registry.state(peer_id) {
            Some(ConnectionState::Failed) | Some(ConnectionState::Discovered) => {}
            _ => {
                debug!("Reconnect to {} no longer needed", peer_id);
                return;
            }
        }
        if !self.link.is_available().await {
            info!("Link unavailable, giving up reconnecting to {}", peer_id);
            return;
        }

        match self.connect_with(peer_id, ConnectOrigin::Reconnect).await {
            Ok(()) => info!("Reconnected to peer: {}", peer_id),
            Err(MeshError::AlreadyConnecting(_)) => {}
            Err(e) => debug!("Reconnect to {} failed: {}", peer_id, e),
        }
    }

    fn cancel_reconnect(&self, peer_id: &PeerId) {
        if let Some((_, state)) = self.reconnects.remove(peer_id) {
            if let Some(timer) = state.timer {
                timer.cancel();
            }
        }
    }

    /// Re-enter `Discovered` for a peer that was seen again after failing or disconnecting
    pub async fn note_discovery(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;
        match self.registry.state(peer_id)? {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.registry
                    .transition(peer_id, ConnectionState::Discovered)
                    .ok()?;
                Some(ConnectionState::Discovered)
            }
            state => Some(state),
        }
    }

    /// Encode `message` and write every frame to the peer in order
    pub async fn send_message(&self, peer_id: &PeerId, message: &Message) -> MeshResult<()> {
        let frames = self.codec.encode_bytes(message)?;
        let outbound = self
            .connections
            .get(peer_id)
            .map(|c| c.outbound.clone())
            .ok_or_else(|| MeshError::PeerNotConnected(peer_id.clone()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        outbound
            .send(OutboundBatch {
                frames,
                ack: ack_tx,
            })
            .map_err(|_| MeshError::PeerNotConnected(peer_id.clone()))?;

        match ack_rx.await {
            Ok(Ok(())) => {
                self.registry.touch(peer_id);
                Ok(())
            }
            Ok(Err(e)) => Err(MeshError::Link(e)),
            Err(_) => Err(MeshError::PeerNotConnected(peer_id.clone())),
        }
    }

    fn on_frame(
        &self,
        peer_id: &PeerId,
        bytes: &[u8],
        reassembly: &std::sync::Mutex<ReassemblyBuffer>,
    ) {
        self.registry.touch(peer_id);
        let decoded = {
            let mut buffer = reassembly.lock().unwrap_or_else(|e| e.into_inner());
            self.codec.decode(bytes, &mut buffer, Instant::now())
        };

        match decoded {
            Ok(Some(message)) => {
                let inbound = InboundMessage {
                    message,
                    from_peer: peer_id.clone(),
                };
                if self.inbound.send(inbound).is_err() {
                    debug!("Inbound pump closed, dropping message from {}", peer_id);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(peer_id = %peer_id, category = %e.category(), error = %e, "Discarding frame");
            }
        }
    }

    /// Tear down connections to peers silent for longer than `older_than`
    pub async fn mark_stale(&self, older_than: Duration) -> StaleSweep {
        self.mark_stale_at(Utc::now(), older_than).await
    }

    pub async fn mark_stale_at(&self, now: DateTime<Utc>, older_than: Duration) -> StaleSweep {
        let sweep = self.registry.mark_stale_at(now, older_than);

        for peer_id in sweep.disconnected.iter().chain(sweep.removed.iter()) {
            self.cancel_reconnect(peer_id);
        }
        for peer_id in &sweep.removed {
            self.locks.remove(peer_id);
        }

        for peer_id in &sweep.live {
            let lock = self.peer_lock(peer_id);
            let _guard = lock.lock().await;
            self.cancel_reconnect(peer_id);
            if !matches!(
                self.registry.state(peer_id),
                Some(ConnectionState::Connected) | Some(ConnectionState::Connecting)
            ) {
                continue;
            }
            if self
                .registry
                .transition(peer_id, ConnectionState::Disconnecting)
                .is_err()
            {
                continue;
            }
            self.attempts.remove(peer_id);
            self.teardown(peer_id).await;
            if let Err(e) = self.registry.transition(peer_id, ConnectionState::Disconnected) {
                warn!("Failed to finish stale teardown of {}: {}", peer_id, e);
            }
            info!("Evicted stale connection to {}", peer_id);
        }
        sweep
    }

    /// Drop partial messages that have waited too long on any connection
    pub fn purge_reassemblies(&self) -> usize {
        let now = Instant::now();
        self.connections
            .iter()
            .map(|c| {
                c.reassembly
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .purge_expired(now)
            })
            .sum()
    }

    pub fn has_connection(&self, peer_id: &PeerId) -> bool {
        self.connections.contains_key(peer_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop background work and close every connection
    pub async fn shutdown(&self) {
        for entry in self.reconnects.iter() {
            if let Some(timer) = &entry.timer {
                timer.cancel();
            }
        }
        self.reconnects.clear();
        let closed = self.disconnect_all().await;
        self.shutdown.cancel();
        info!("Connection manager stopped ({} connections closed)", closed);
    }
}

async fn run_writer(
    link: Arc<dyn LinkAdapter>,
    handle: ConnectionHandle,
    mut outbound: mpsc::UnboundedReceiver<OutboundBatch>,
    token: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = token.cancelled() => return,
            batch = outbound.recv() => match batch {
                Some(batch) => batch,
                None => return,
            },
        };

        let mut result = Ok(());
        for frame in &batch.frames {
            if let Err(e) = link.send(&handle, frame).await {
                result = Err(e);
                break;
            }
        }
        let _ = batch.ack.send(result);
    }
}

async fn run_reader(
    manager: Arc<ConnectionManager>,
    handle: ConnectionHandle,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    reassembly: Arc<std::sync::Mutex<ReassemblyBuffer>>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Some(LinkEvent::Frame(bytes)) => manager.on_frame(&handle.peer_id, &bytes, &reassembly),
            Some(LinkEvent::Closed) => {
                manager
                    .handle_link_drop(&handle.peer_id, handle.session, None)
                    .await;
                return;
            }
            Some(LinkEvent::Lost { reason }) => {
                manager
                    .handle_link_drop(&handle.peer_id, handle.session, Some(&reason))
                    .await;
                return;
            }
            None => {
                manager
                    .handle_link_drop(&handle.peer_id, handle.session, Some("event stream closed"))
                    .await;
                return;
            }
        }
    }
}
