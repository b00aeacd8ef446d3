//! Flood relay with deduplication and a retrying outbound queue

use crate::config::DeliveryConfig;
use crate::connection::ConnectionManager;
use crate::error::{MeshError, MeshResult};
use crate::event_bus::{EventBus, MeshEvent};
use crate::registry::PeerRegistry;
use crate::types::{ConnectionState, Message, MessageId, PeerId, Target};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct SeenEntry {
    /// Peers known to already hold the message
    holders: HashSet<PeerId>,
}

/// Message ids accepted recently, bounded by age and count
pub struct SeenSet {
    entries: HashMap<MessageId, SeenEntry>,
    order: VecDeque<(MessageId, Instant)>,
    retention: Duration,
    capacity: usize,
}

impl SeenSet {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            retention,
            capacity: capacity.max(1),
        }
    }

    /// Record `id` as received from `holder`. Returns true the first time `id` is seen.
    pub fn check_and_insert(&mut self, id: MessageId, holder: &PeerId, now: Instant) -> bool {
        self.purge_expired(now);

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.holders.insert(holder.clone());
            return false;
        }

        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some((oldest, _)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        let mut holders = HashSet::new();
        holders.insert(holder.clone());
        self.entries.insert(id, SeenEntry { holders });
        self.order.push_back((id, now));
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn add_holder(&mut self, id: &MessageId, holder: &PeerId) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.holders.insert(holder.clone());
        }
    }

    pub fn is_held_by(&self, id: &MessageId, peer: &PeerId) -> bool {
        self.entries
            .get(id)
            .map_or(false, |entry| entry.holders.contains(peer))
    }

    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while let Some((id, seen_at)) = self.order.front().copied() {
            if now.saturating_duration_since(seen_at) < self.retention {
                break;
            }
            self.order.pop_front();
            self.entries.remove(&id);
            purged += 1;
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A message waiting to reach one neighbour
#[derive(Debug, Clone)]
pub struct OutboundQueueEntry {
    pub entry_id: u64,
    pub message: Message,
    pub target: PeerId,
    /// Failed transmissions so far
    pub attempts: u32,
    pub next_retry_at: Option<Instant>,
}

/// Result of handing an inbound message to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// First sighting: published to subscribers and relayed to `relayed_to`
    Delivered { relayed_to: Vec<PeerId> },
    /// Already seen; dropped silently
    Duplicate,
}

/// Decides what happens to every message entering or leaving this device
pub struct DeliveryEngine {
    local_id: PeerId,
    config: DeliveryConfig,
    connections: Arc<ConnectionManager>,
    registry: Arc<PeerRegistry>,
    bus: Arc<EventBus>,
    seen: Mutex<SeenSet>,
    queue: Mutex<HashMap<u64, OutboundQueueEntry>>,
    next_entry: AtomicU64,
    peer_tokens: DashMap<PeerId, CancellationToken>,
    shutdown: CancellationToken,
}

impl DeliveryEngine {
    pub fn new(
        local_id: PeerId,
        config: DeliveryConfig,
        connections: Arc<ConnectionManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        let registry = connections.registry().clone();
        let seen = SeenSet::new(config.seen_retention, config.seen_capacity);
        Self {
            local_id,
            config,
            connections,
            registry,
            bus,
            seen: Mutex::new(seen),
            queue: Mutex::new(HashMap::new()),
            next_entry: AtomicU64::new(1),
            peer_tokens: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn seen(&self) -> MutexGuard<'_, SeenSet> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, HashMap<u64, OutboundQueueEntry>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle a message reassembled from `from_peer`.
    ///
    /// A message id is published at most once; relays go to every connected
    /// neighbour not already known to hold the message.
    pub fn on_message_received(self: &Arc<Self>, message: Message, from_peer: &PeerId) -> Delivery {
        let is_new = {
            let mut seen = self.seen();
            let is_new = seen.check_and_insert(message.id, from_peer, Instant::now());
            seen.add_holder(&message.id, &message.origin_id);
            is_new
        };

        if !is_new || message.origin_id == self.local_id {
            debug!(
                message_id = %message.id,
                from_peer = %from_peer,
                "Discarding duplicate message"
            );
            return Delivery::Duplicate;
        }

        info!(
            message_id = %message.id,
            origin = %message.origin_id,
            from_peer = %from_peer,
            ttl = message.ttl,
            "Processing message"
        );
        self.bus.publish(MeshEvent::MessageReceived {
            message: message.clone(),
            from_peer: from_peer.clone(),
        });

        let relayed_to = match message.relay_copy() {
            Some(copy) => {
                let targets = self.relay_targets(&copy.id);
                for peer_id in &targets {
                    self.enqueue(copy.clone(), peer_id.clone());
                }
                if !targets.is_empty() {
                    debug!(
                        message_id = %copy.id,
                        ttl = copy.ttl,
                        peers = targets.len(),
                        "Relaying message"
                    );
                }
                targets
            }
            None => {
                debug!(message_id = %message.id, "TTL exhausted, not relaying");
                Vec::new()
            }
        };

        Delivery::Delivered { relayed_to }
    }

    /// Queue a locally created message. Returns the neighbours it was queued for.
    pub fn send(self: &Arc<Self>, message: Message, target: Target) -> MeshResult<Vec<PeerId>> {
        self.connections.codec().fragment_count(&message)?;

        let targets = match target {
            Target::Broadcast => {
                self.seen()
                    .check_and_insert(message.id, &self.local_id, Instant::now());
                self.relay_targets(&message.id)
            }
            Target::Peer(peer_id) => {
                if self.registry.state(&peer_id) != Some(ConnectionState::Connected) {
                    return Err(MeshError::PeerNotConnected(peer_id));
                }
                self.seen()
                    .check_and_insert(message.id, &self.local_id, Instant::now());
                vec![peer_id]
            }
        };

        for peer_id in &targets {
            self.enqueue(message.clone(), peer_id.clone());
        }
        info!(
            message_id = %message.id,
            peers = targets.len(),
            ttl = message.ttl,
            "Queued outbound message"
        );
        Ok(targets)
    }

    fn relay_targets(&self, id: &MessageId) -> Vec<PeerId> {
        let seen = self.seen();
        self.registry
            .list(Some(ConnectionState::Connected))
            .into_iter()
            .map(|peer| peer.id)
            .filter(|peer_id| !seen.is_held_by(id, peer_id))
            .collect()
    }

    fn enqueue(self: &Arc<Self>, message: Message, peer_id: PeerId) {
        let entry_id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        let token = self
            .peer_tokens
            .entry(peer_id.clone())
            .or_insert_with(|| self.shutdown.child_token())
            .child_token();

        self.queue().insert(
            entry_id,
            OutboundQueueEntry {
                entry_id,
                message: message.clone(),
                target: peer_id.clone(),
                attempts: 0,
                next_retry_at: None,
            },
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_entry(entry_id, message, peer_id, token).await;
        });
    }

    async fn run_entry(
        &self,
        entry_id: u64,
        message: Message,
        peer_id: PeerId,
        token: CancellationToken,
    ) {
        let mut failures = 0u32;
        loop {
            if token.is_cancelled() {
                self.finish(entry_id);
                return;
            }
            if self.seen().is_held_by(&message.id, &peer_id) {
                debug!(message_id = %message.id, peer_id = %peer_id, "Peer already has message");
                self.finish(entry_id);
                return;
            }

            let result = tokio::select! {
                _ = token.cancelled() => {
                    self.finish(entry_id);
                    return;
                }
                result = self.connections.send_message(&peer_id, &message) => result,
            };

            let error = match result {
                Ok(()) => {
                    debug!(message_id = %message.id, peer_id = %peer_id, "Sent message");
                    self.seen().add_holder(&message.id, &peer_id);
                    self.finish(entry_id);
                    return;
                }
                Err(e) => e,
            };

            failures += 1;
            if failures > self.config.max_attempts {
                warn!(
                    message_id = %message.id,
                    peer_id = %peer_id,
                    attempts = failures,
                    error = %error,
                    "Giving up on message"
                );
                self.finish(entry_id);
                self.bus.publish(MeshEvent::SendFailed {
                    message_id: message.id,
                    peer_id,
                    attempts: failures,
                });
                return;
            }

            let delay = self.config.retry_delay(failures);
            if let Some(entry) = self.queue().get_mut(&entry_id) {
                entry.attempts = failures;
                entry.next_retry_at = Some(Instant::now() + delay);
            }
            debug!(
                message_id = %message.id,
                peer_id = %peer_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Send failed, retrying"
            );

            tokio::select! {
                _ = token.cancelled() => {
                    self.finish(entry_id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(&self, entry_id: u64) {
        self.queue().remove(&entry_id);
    }

    /// Drop every queued entry for `peer_id` without raising `SendFailed`
    pub fn cancel_peer(&self, peer_id: &PeerId) -> usize {
        if let Some((_, token)) = self.peer_tokens.remove(peer_id) {
            token.cancel();
        }
        let mut queue = self.queue();
        let before = queue.len();
        queue.retain(|_, entry| &entry.target != peer_id);
        let cancelled = before - queue.len();
        if cancelled > 0 {
            info!("Cancelled {} queued messages for {}", cancelled, peer_id);
        }
        cancelled
    }

    /// Peers with delivery state still held
    pub fn tracked_peer_count(&self) -> usize {
        self.peer_tokens.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue().len()
    }

    /// Snapshot of the outbound queue, oldest entry first
    pub fn queued_entries(&self) -> Vec<OutboundQueueEntry> {
        let mut entries: Vec<OutboundQueueEntry> = self.queue().values().cloned().collect();
        entries.sort_by_key(|e| e.entry_id);
        entries
    }

    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen().contains(id)
    }

    pub fn seen_len(&self) -> usize {
        self.seen().len()
    }

    pub fn purge_seen(&self) -> usize {
        let purged = self.seen().purge_expired(Instant::now());
        if purged > 0 {
            debug!("Purged {} expired message ids", purged);
        }
        purged
    }

    /// Cancel every queued entry
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.peer_tokens.clear();
        self.queue().clear();
    }
}
