//! Deterministic in-process radio medium for tests and simulation
//!
//! Devices join a shared [`MemoryMedium`]. Two devices can see each other only
//! once they have been placed in range, and at most one link exists per pair.

use super::{ConnectionHandle, LinkAdapter, LinkConnection, LinkEvent, ScanHandle};
use crate::error::LinkError;
use crate::types::{DiscoveryEvent, PeerId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default link payload, matching a typical negotiated BLE ATT MTU
pub const DEFAULT_MAX_PAYLOAD: usize = 185;

/// A frame written by a device, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub to: PeerId,
    pub bytes: Vec<u8>,
}

struct Scanner {
    token: CancellationToken,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

struct Device {
    display_name: String,
    signal_strength: i16,
    powered: bool,
    scanners: Vec<Scanner>,
    incoming: mpsc::UnboundedSender<LinkConnection>,
    failing_connects: u32,
    failing_sends: u32,
    sent: Vec<SentFrame>,
}

struct Link {
    ends: [(PeerId, mpsc::UnboundedSender<LinkEvent>); 2],
}

impl Link {
    fn remote_of(&self, local: &str) -> Option<&(PeerId, mpsc::UnboundedSender<LinkEvent>)> {
        if self.ends[0].0 == local {
            Some(&self.ends[1])
        } else if self.ends[1].0 == local {
            Some(&self.ends[0])
        } else {
            None
        }
    }

    fn joins(&self, a: &str, b: &str) -> bool {
        (self.ends[0].0 == a && self.ends[1].0 == b) || (self.ends[0].0 == b && self.ends[1].0 == a)
    }

    fn touches(&self, peer: &str) -> bool {
        self.ends[0].0 == peer || self.ends[1].0 == peer
    }
}

#[derive(Default)]
struct MediumState {
    devices: HashMap<PeerId, Device>,
    ranges: HashSet<(PeerId, PeerId)>,
    links: HashMap<u64, Link>,
    next_session: u64,
}

impl MediumState {
    fn in_range(&self, a: &str, b: &str) -> bool {
        self.ranges.contains(&range_key(a, b))
    }

    fn link_between(&self, a: &str, b: &str) -> Option<u64> {
        self.links
            .iter()
            .find(|(_, link)| link.joins(a, b))
            .map(|(session, _)| *session)
    }

    fn discovery_of(&self, peer: &str) -> Option<DiscoveryEvent> {
        self.devices.get(peer).map(|device| DiscoveryEvent {
            peer_id: peer.to_string(),
            display_name: device.display_name.clone(),
            signal_strength: device.signal_strength,
        })
    }

    /// Report `seen` to every active scanner on `observer`
    fn announce(&mut self, observer: &str, seen: &str) {
        let event = match self.discovery_of(seen) {
            Some(event) => event,
            None => return,
        };
        if let Some(device) = self.devices.get_mut(observer) {
            device
                .scanners
                .retain(|s| !s.token.is_cancelled() && s.tx.send(event.clone()).is_ok());
        }
    }

    /// Drop every link matching `predicate`, telling both ends
    fn sever_where(&mut self, predicate: impl Fn(&Link) -> bool, reason: &str) -> usize {
        let sessions: Vec<u64> = self
            .links
            .iter()
            .filter(|(_, link)| predicate(link))
            .map(|(session, _)| *session)
            .collect();
        for session in &sessions {
            if let Some(link) = self.links.remove(session) {
                for (_, tx) in link.ends.iter() {
                    let _ = tx.send(LinkEvent::Lost {
                        reason: reason.to_string(),
                    });
                }
            }
        }
        sessions.len()
    }
}

fn range_key(a: &str, b: &str) -> (PeerId, PeerId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Shared medium all in-memory links attach to
pub struct MemoryMedium {
    state: Mutex<MediumState>,
    max_payload: usize,
}

impl MemoryMedium {
    pub fn new() -> Arc<Self> {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MediumState::default()),
            max_payload,
        })
    }

    fn state(&self) -> MutexGuard<'_, MediumState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a device and return its link adapter
    pub fn join(self: &Arc<Self>, peer_id: &str, display_name: &str) -> Arc<MemoryLink> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        self.state().devices.insert(
            peer_id.to_string(),
            Device {
                display_name: display_name.to_string(),
                signal_strength: -50,
                powered: true,
                scanners: Vec::new(),
                incoming: incoming_tx,
                failing_connects: 0,
                failing_sends: 0,
                sent: Vec::new(),
            },
        );
        debug!("Device {} joined the medium", peer_id);

        Arc::new(MemoryLink {
            medium: self.clone(),
            local: peer_id.to_string(),
            incoming: Mutex::new(Some(incoming_rx)),
        })
    }

    /// Make `a` and `b` visible to each other; active scanners on both sides are notified
    pub fn place_in_range(&self, a: &str, b: &str) {
        let mut state = self.state();
        state.ranges.insert(range_key(a, b));
        let a_powered = state.devices.get(a).map_or(false, |d| d.powered);
        let b_powered = state.devices.get(b).map_or(false, |d| d.powered);
        if a_powered && b_powered {
            state.announce(a, b);
            state.announce(b, a);
        }
    }

    /// Move `a` and `b` apart, dropping any link between them
    pub fn move_out_of_range(&self, a: &str, b: &str) {
        let mut state = self.state();
        state.ranges.remove(&range_key(a, b));
        state.sever_where(|link| link.joins(a, b), "out of range");
    }

    /// Abruptly drop the link between `a` and `b`. Returns false when none existed.
    pub fn sever(&self, a: &str, b: &str) -> bool {
        let dropped = self
            .state()
            .sever_where(|link| link.joins(a, b), "link lost");
        dropped > 0
    }

    /// Toggle a device's radio; powering off drops all of its links
    pub fn set_powered(&self, peer_id: &str, powered: bool) {
        let mut state = self.state();
        if let Some(device) = state.devices.get_mut(peer_id) {
            device.powered = powered;
            if !powered {
                device.scanners.clear();
            }
        }
        if !powered {
            state.sever_where(|link| link.touches(peer_id), "radio powered off");
        }
        info!("Device {} radio {}", peer_id, if powered { "on" } else { "off" });
    }

    pub fn set_signal_strength(&self, peer_id: &str, rssi: i16) {
        if let Some(device) = self.state().devices.get_mut(peer_id) {
            device.signal_strength = rssi;
        }
    }

    /// The next `count` connects targeting `peer_id` fail
    pub fn fail_next_connects(&self, peer_id: &str, count: u32) {
        if let Some(device) = self.state().devices.get_mut(peer_id) {
            device.failing_connects = count;
        }
    }

    /// The next `count` frames written by `peer_id` fail
    pub fn fail_next_sends(&self, peer_id: &str, count: u32) {
        if let Some(device) = self.state().devices.get_mut(peer_id) {
            device.failing_sends = count;
        }
    }

    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        self.state().link_between(a, b).is_some()
    }

    /// Every frame `peer_id` has successfully written, oldest first
    pub fn sent_frames(&self, peer_id: &str) -> Vec<SentFrame> {
        self.state()
            .devices
            .get(peer_id)
            .map(|d| d.sent.clone())
            .unwrap_or_default()
    }
}

/// One device's view of a [`MemoryMedium`]
pub struct MemoryLink {
    medium: Arc<MemoryMedium>,
    local: PeerId,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<LinkConnection>>>,
}

impl MemoryLink {
    pub fn local_id(&self) -> &str {
        &self.local
    }

    pub fn medium(&self) -> &Arc<MemoryMedium> {
        &self.medium
    }
}

#[async_trait]
impl LinkAdapter for MemoryLink {
    async fn is_available(&self) -> bool {
        self.medium
            .state()
            .devices
            .get(&self.local)
            .map_or(false, |d| d.powered)
    }

    async fn scan(
        &self,
        discovered: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<ScanHandle, LinkError> {
        let mut state = self.medium.state();
        if !state.devices.get(&self.local).map_or(false, |d| d.powered) {
            return Err(LinkError::PoweredOff);
        }

        let visible: Vec<DiscoveryEvent> = state
            .devices
            .iter()
            .filter(|(id, device)| {
                **id != self.local && device.powered && state.in_range(&self.local, id)
            })
            .filter_map(|(id, _)| state.discovery_of(id))
            .collect();
        for event in visible {
            let _ = discovered.send(event);
        }

        let token = CancellationToken::new();
        if let Some(device) = state.devices.get_mut(&self.local) {
            device.scanners.push(Scanner {
                token: token.clone(),
                tx: discovered,
            });
        }
        debug!("Device {} started scanning", self.local);
        Ok(ScanHandle::new(token))
    }

    async fn connect(&self, peer_id: &PeerId) -> Result<LinkConnection, LinkError> {
        let mut state = self.medium.state();

        let local_name = match state.devices.get(&self.local) {
            Some(device) if device.powered => device.display_name.clone(),
            _ => return Err(LinkError::PoweredOff),
        };
        if !state.in_range(&self.local, peer_id) {
            return Err(LinkError::ConnectFailed(format!("{} is out of range", peer_id)));
        }
        if state.link_between(&self.local, peer_id).is_some() {
            return Err(LinkError::ConnectFailed(format!("already linked to {}", peer_id)));
        }

        let target = state
            .devices
            .get_mut(peer_id)
            .filter(|d| d.powered)
            .ok_or_else(|| LinkError::ConnectFailed(format!("{} is not reachable", peer_id)))?;
        if target.failing_connects > 0 {
            target.failing_connects -= 1;
            return Err(LinkError::ConnectFailed(format!("{} refused the connection", peer_id)));
        }
        let peer_name = target.display_name.clone();

        let session = state.next_session;
        state.next_session += 1;
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();

        let accepted = LinkConnection {
            handle: ConnectionHandle {
                peer_id: self.local.clone(),
                session,
            },
            peer_name: local_name,
            events: remote_rx,
        };
        let delivered = state
            .devices
            .get(peer_id)
            .is_some_and(|target| target.incoming.send(accepted).is_ok());
        if !delivered {
            return Err(LinkError::ConnectFailed(format!(
                "{} is not accepting connections",
                peer_id
            )));
        }

        state.links.insert(
            session,
            Link {
                ends: [(self.local.clone(), local_tx), (peer_id.clone(), remote_tx)],
            },
        );
        debug!("Linked {} -> {} (session {})", self.local, peer_id, session);

        Ok(LinkConnection {
            handle: ConnectionHandle {
                peer_id: peer_id.clone(),
                session,
            },
            peer_name,
            events: local_rx,
        })
    }

    async fn send(&self, handle: &ConnectionHandle, bytes: &[u8]) -> Result<(), LinkError> {
        let mut state = self.medium.state();
        if bytes.len() > self.medium.max_payload {
            return Err(LinkError::SendFailed(format!(
                "frame of {} bytes exceeds the {} byte payload",
                bytes.len(),
                self.medium.max_payload
            )));
        }

        let device = state
            .devices
            .get_mut(&self.local)
            .filter(|d| d.powered)
            .ok_or(LinkError::PoweredOff)?;
        if device.failing_sends > 0 {
            device.failing_sends -= 1;
            return Err(LinkError::SendFailed("injected failure".to_string()));
        }

        let remote_tx = state
            .links
            .get(&handle.session)
            .and_then(|link| link.remote_of(&self.local))
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| LinkError::NotConnected(handle.peer_id.clone()))?;
        remote_tx
            .send(LinkEvent::Frame(bytes.to_vec()))
            .map_err(|_| LinkError::NotConnected(handle.peer_id.clone()))?;

        if let Some(device) = state.devices.get_mut(&self.local) {
            device.sent.push(SentFrame {
                to: handle.peer_id.clone(),
                bytes: bytes.to_vec(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), LinkError> {
        let mut state = self.medium.state();
        let link = state
            .links
            .remove(&handle.session)
            .ok_or_else(|| LinkError::NotConnected(handle.peer_id.clone()))?;
        if let Some((_, tx)) = link.remote_of(&self.local) {
            let _ = tx.send(LinkEvent::Closed);
        }
        debug!("Closed session {} to {}", handle.session, handle.peer_id);
        Ok(())
    }

    fn max_payload_size(&self) -> usize {
        self.medium.max_payload
    }

    async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<LinkConnection>> {
        self.incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_sees_only_devices_in_range() {
        let medium = MemoryMedium::new();
        let a = medium.join("a", "Alice");
        medium.join("b", "Bob");
        medium.join("c", "Carol");
        medium.place_in_range("a", "b");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _scan = a.scan(tx).await.unwrap();
        let seen = rx.try_recv().unwrap();
        assert_eq!(seen.peer_id, "b");
        assert_eq!(seen.display_name, "Bob");
        assert!(rx.try_recv().is_err());

        medium.place_in_range("a", "c");
        assert_eq!(rx.try_recv().unwrap().peer_id, "c");
    }

    #[tokio::test]
    async fn test_connect_delivers_frames_both_ways() {
        let medium = MemoryMedium::new();
        let a = medium.join("a", "Alice");
        let b = medium.join("b", "Bob");
        medium.place_in_range("a", "b");
        let mut incoming = b.take_incoming().await.unwrap();
        assert!(b.take_incoming().await.is_none());

        let mut a_side = a.connect(&"b".to_string()).await.unwrap();
        let mut b_side = incoming.try_recv().unwrap();
        assert_eq!(a_side.peer_name, "Bob");
        assert_eq!(b_side.handle.peer_id, "a");

        a.send(&a_side.handle, b"ping").await.unwrap();
        b.send(&b_side.handle, b"pong").await.unwrap();
        assert_eq!(b_side.events.try_recv().unwrap(), LinkEvent::Frame(b"ping".to_vec()));
        assert_eq!(a_side.events.try_recv().unwrap(), LinkEvent::Frame(b"pong".to_vec()));
        assert_eq!(medium.sent_frames("a").len(), 1);
    }

    #[tokio::test]
    async fn test_one_link_per_pair() {
        let medium = MemoryMedium::new();
        let a = medium.join("a", "Alice");
        let b = medium.join("b", "Bob");
        medium.place_in_range("a", "b");

        let _link = a.connect(&"b".to_string()).await.unwrap();
        assert!(matches!(
            b.connect(&"a".to_string()).await,
            Err(LinkError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_sever_notifies_both_ends() {
        let medium = MemoryMedium::new();
        let a = medium.join("a", "Alice");
        let b = medium.join("b", "Bob");
        medium.place_in_range("a", "b");
        let mut incoming = b.take_incoming().await.unwrap();

        let mut a_side = a.connect(&"b".to_string()).await.unwrap();
        let mut b_side = incoming.try_recv().unwrap();
        assert!(medium.sever("a", "b"));

        assert!(matches!(a_side.events.try_recv(), Ok(LinkEvent::Lost { .. })));
        assert!(matches!(b_side.events.try_recv(), Ok(LinkEvent::Lost { .. })));
        assert!(a.send(&a_side.handle, b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_closes_remote_end() {
        let medium = MemoryMedium::new();
        let a = medium.join("a", "Alice");
        let b = medium.join("b", "Bob");
        medium.place_in_range("a", "b");
        let mut incoming = b.take_incoming().await.unwrap();

        let a_side = a.connect(&"b".to_string()).await.unwrap();
        let mut b_side = incoming.try_recv().unwrap();
        a.disconnect(&a_side.handle).await.unwrap();

        assert_eq!(b_side.events.try_recv().unwrap(), LinkEvent::Closed);
        assert!(!medium.is_linked("a", "b"));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let medium = MemoryMedium::new();
        let a = medium.join("a", "Alice");
        let b = medium.join("b", "Bob");
        medium.place_in_range("a", "b");
        let _incoming = b.take_incoming().await.unwrap();

        medium.fail_next_connects("b", 1);
        assert!(a.connect(&"b".to_string()).await.is_err());
        let link = a.connect(&"b".to_string()).await.unwrap();

        medium.fail_next_sends("a", 1);
        assert!(a.send(&link.handle, b"x").await.is_err());
        assert!(a.send(&link.handle, b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_fails_when_remote_stopped_accepting() {
        let medium = MemoryMedium::new();
        let a = medium.join("a", "Alice");
        let b = medium.join("b", "Bob");
        medium.place_in_range("a", "b");
        drop(b.take_incoming().await);

        assert!(matches!(
            a.connect(&"b".to_string()).await,
            Err(LinkError::ConnectFailed(_))
        ));
        assert!(!medium.is_linked("a", "b"));

        // Once the remote device goes away entirely the result is the same
        drop(b);
        assert!(a.connect(&"b".to_string()).await.is_err());
        assert!(!medium.is_linked("a", "b"));
    }

    #[tokio::test]
    async fn test_power_off() {
        let medium = MemoryMedium::new();
        let a = medium.join("a", "Alice");
        medium.join("b", "Bob");
        medium.place_in_range("a", "b");

        medium.set_powered("a", false);
        assert!(!a.is_available().await);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(a.scan(tx).await.unwrap_err(), LinkError::PoweredOff);
        assert_eq!(
            a.connect(&"b".to_string()).await.unwrap_err(),
            LinkError::PoweredOff
        );
    }
}
