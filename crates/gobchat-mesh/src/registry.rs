//! Registry of every peer this device has heard of

use crate::error::{MeshError, MeshResult};
use crate::event_bus::{EventBus, MeshEvent};
use crate::types::{ConnectionState, DiscoveryEvent, PeerDevice, PeerId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a stale sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StaleSweep {
    /// Stale peers that still hold a live connection; the caller must tear them down
    pub live: Vec<PeerId>,
    /// Stale peers moved to `Disconnected`
    pub disconnected: Vec<PeerId>,
    /// Peers that were already disconnected and have been evicted
    pub removed: Vec<PeerId>,
}

/// Tracks identity, signal strength and connection state per peer.
///
/// State changes go through [`PeerRegistry::transition`], which enforces the
/// connection state machine and publishes a `ConnectionChanged` event.
pub struct PeerRegistry {
    peers: DashMap<PeerId, PeerDevice>,
    bus: Arc<EventBus>,
}

impl PeerRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            peers: DashMap::new(),
            bus,
        }
    }

    /// Insert a newly discovered peer or refresh a known one.
    ///
    /// Re-discovery only refreshes `signal_strength`, `display_name` and
    /// `last_seen`; the connection state is left untouched.
    pub fn upsert(&self, event: &DiscoveryEvent) -> PeerDevice {
        let now = Utc::now();
        let mut entry = self
            .peers
            .entry(event.peer_id.clone())
            .or_insert_with(|| {
                info!("Discovered new peer: {} ({})", event.display_name, event.peer_id);
                PeerDevice {
                    id: event.peer_id.clone(),
                    display_name: event.display_name.clone(),
                    signal_strength: event.signal_strength,
                    connection_state: ConnectionState::Discovered,
                    last_seen: now,
                }
            });

        entry.signal_strength = event.signal_strength;
        if !event.display_name.is_empty() {
            entry.display_name = event.display_name.clone();
        }
        entry.last_seen = now;
        debug!("Updated peer: {} (RSSI: {})", event.peer_id, event.signal_strength);
        entry.clone()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerDevice> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    pub fn state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.peers.get(peer_id).map(|p| p.connection_state)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Peers in `filter` state (all peers for `None`), strongest signal first
    pub fn list(&self, filter: Option<ConnectionState>) -> Vec<PeerDevice> {
        let mut peers: Vec<PeerDevice> = self
            .peers
            .iter()
            .filter(|p| filter.map_or(true, |state| p.connection_state == state))
            .map(|p| p.clone())
            .collect();
        peers.sort_by(|a, b| {
            b.signal_strength
                .cmp(&a.signal_strength)
                .then_with(|| a.id.cmp(&b.id))
        });
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Record activity from a peer
    pub fn touch(&self, peer_id: &PeerId) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = Utc::now();
        }
    }

    /// Move `peer_id` to `next`, returning the previous state.
    ///
    /// Transitions to the current state are a no-op and publish nothing.
    pub fn transition(&self, peer_id: &PeerId, next: ConnectionState) -> MeshResult<ConnectionState> {
        let (snapshot, previous) = {
            let mut peer = self
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| MeshError::PeerNotFound(peer_id.clone()))?;
            let previous = peer.connection_state;
            if previous == next {
                return Ok(previous);
            }
            if !previous.can_transition_to(next) {
                return Err(MeshError::InvalidTransition {
                    peer: peer_id.clone(),
                    from: previous,
                    to: next,
                });
            }
            peer.connection_state = next;
            (peer.clone(), previous)
        };

        debug!(peer_id = %peer_id, from = %previous, to = %next, "Connection state changed");
        self.bus.publish(MeshEvent::ConnectionChanged {
            peer: snapshot,
            previous,
            new: next,
        });
        Ok(previous)
    }

    /// Forget a peer entirely
    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerDevice> {
        let removed = self.peers.remove(peer_id).map(|(_, peer)| peer);
        if removed.is_some() {
            info!("Removed peer: {}", peer_id);
        }
        removed
    }

    /// Sweep peers silent for longer than `older_than`
    pub fn mark_stale(&self, older_than: Duration) -> StaleSweep {
        self.mark_stale_at(Utc::now(), older_than)
    }

    pub fn mark_stale_at(&self, now: DateTime<Utc>, older_than: Duration) -> StaleSweep {
        let timeout = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let mut sweep = StaleSweep::default();

        let stale: Vec<(PeerId, ConnectionState)> = self
            .peers
            .iter()
            .filter(|p| now.signed_duration_since(p.last_seen) > timeout)
            .map(|p| (p.id.clone(), p.connection_state))
            .collect();

        for (peer_id, state) in stale {
            if state.has_live_connection() {
                sweep.live.push(peer_id);
            } else if state == ConnectionState::Disconnected {
                self.remove(&peer_id);
                sweep.removed.push(peer_id);
            } else if self.transition(&peer_id, ConnectionState::Disconnected).is_ok() {
                sweep.disconnected.push(peer_id);
            }
        }

        if !sweep.live.is_empty() || !sweep.disconnected.is_empty() || !sweep.removed.is_empty() {
            info!(
                "Stale sweep: {} live, {} disconnected, {} removed",
                sweep.live.len(),
                sweep.disconnected.len(),
                sweep.removed.len()
            );
        }
        sweep
    }
}
