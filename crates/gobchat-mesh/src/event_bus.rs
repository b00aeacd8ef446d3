//! Typed publish/subscribe fan-out of mesh events to the UI layer

use crate::types::{ConnectionState, Message, MessageId, PeerDevice, PeerId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Which stream of events a subscriber is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Connection,
}

/// Events published by the engine
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A message accepted for the first time (never fired twice for one id)
    MessageReceived { message: Message, from_peer: PeerId },

    /// An outbound queue entry was dropped after exhausting its retries
    SendFailed {
        message_id: MessageId,
        peer_id: PeerId,
        attempts: u32,
    },

    /// A peer moved between connection states
    ConnectionChanged {
        peer: PeerDevice,
        previous: ConnectionState,
        new: ConnectionState,
    },
}

impl MeshEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MeshEvent::MessageReceived { .. } | MeshEvent::SendFailed { .. } => EventKind::Message,
            MeshEvent::ConnectionChanged { .. } => EventKind::Connection,
        }
    }
}

/// Subscriber callback. Returning an error (or panicking) only affects this subscriber.
pub type EventHandler = Arc<dyn Fn(&MeshEvent) -> anyhow::Result<()> + Send + Sync>;

/// Returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscriber {
    handle: SubscriptionHandle,
    kind: EventKind,
    handler: EventHandler,
}

/// Synchronous fan-out in subscription order
pub struct EventBus {
    next_handle: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&MeshEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.push(Subscriber {
            handle,
            kind,
            handler: Arc::new(handler),
        });
        debug!("Added {:?} subscriber {:?}", kind, handle);
        handle
    }

    /// Subscribe with an unbounded channel instead of a callback
    pub fn subscribe_channel(
        &self,
        kind: EventKind,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(kind, move |event| {
            tx.send(event.clone())
                .map_err(|_| anyhow::anyhow!("event receiver dropped"))
        });
        (handle, rx)
    }

    /// Returns false if the handle was unknown
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.handle != handle);
        before != subscribers.len()
    }

    /// Deliver `event` to every matching subscriber. Returns how many handled it cleanly.
    pub fn publish(&self, event: MeshEvent) -> usize {
        let kind = event.kind();

        // Snapshot so handlers may (un)subscribe without deadlocking
        let targets: Vec<(SubscriptionHandle, EventHandler)> = {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subscribers
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| (s.handle, s.handler.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (handle, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(subscriber = ?handle, error = %e, "Event subscriber failed");
                }
                Err(_) => {
                    error!(subscriber = ?handle, "Event subscriber panicked");
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
