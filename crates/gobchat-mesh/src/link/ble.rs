//! Bluetooth Low Energy link backed by btleplug (central role)

use super::{ConnectionHandle, LinkAdapter, LinkConnection, LinkEvent, ScanHandle};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::identity::DEFAULT_DISPLAY_NAME;
use crate::types::{DiscoveryEvent, PeerId};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Service advertised by Gobchat devices
pub const SERVICE_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x00, 0xFF, 0xE0, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
]);

/// Characteristic frames are written to and notified on
pub const MESSAGE_CHARACTERISTIC_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x00, 0xFF, 0xE1, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
]);

/// ATT MTU assumed for every connection. btleplug does not report the
/// negotiated value, and 185 is what current phones settle on.
pub const ASSUMED_ATT_MTU: usize = 185;

/// ATT write header
const ATT_HEADER_LEN: usize = 3;

/// Longest attribute value a write may carry
const MAX_ATTRIBUTE_LEN: usize = 512;

/// Frame size used unless configured otherwise
pub const DEFAULT_MAX_PAYLOAD: usize = ASSUMED_ATT_MTU - ATT_HEADER_LEN;

const SCAN_POLL_INTERVAL: Duration = Duration::from_secs(2);

struct Session {
    peripheral: Peripheral,
    characteristic: Characteristic,
    token: CancellationToken,
}

/// Link implementation using the platform's BLE central stack
pub struct BleLink {
    adapter: Arc<RwLock<Option<Adapter>>>,
    /// Peripherals seen while scanning, by address
    peripherals: Arc<DashMap<PeerId, Peripheral>>,
    sessions: Arc<DashMap<u64, Session>>,
    next_session: AtomicU64,
    max_payload: usize,
}

impl BleLink {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Link writing frames of at most `max_payload` bytes, bounded by the
    /// largest attribute value
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            adapter: Arc::new(RwLock::new(None)),
            peripherals: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            next_session: AtomicU64::new(1),
            max_payload: max_payload.clamp(1, MAX_ATTRIBUTE_LEN),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::with_max_payload(config.ble_max_payload)
    }

    async fn ensure_adapter(&self) -> Result<Adapter, LinkError> {
        let mut adapter_lock = self.adapter.write().await;
        if let Some(adapter) = adapter_lock.as_ref() {
            return Ok(adapter.clone());
        }

        debug!("Creating BLE manager and adapter");
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::Adapter(format!("Failed to create BLE manager: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| LinkError::Adapter(format!("Failed to get adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or(LinkError::PoweredOff)?;

        info!("BLE adapter initialized: {:?}", adapter.adapter_info().await);
        *adapter_lock = Some(adapter.clone());
        Ok(adapter)
    }

    async fn poll_peripherals(
        adapter: &Adapter,
        known: &DashMap<PeerId, Peripheral>,
        discovered: &mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<(), LinkError> {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| LinkError::Adapter(format!("Failed to get peripherals: {}", e)))?;

        for peripheral in peripherals {
            let properties = match peripheral.properties().await {
                Ok(Some(properties)) => properties,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Error reading peripheral properties: {}", e);
                    continue;
                }
            };
            if !properties.services.contains(&SERVICE_UUID) {
                continue;
            }

            let peer_id = peripheral.address().to_string();
            let event = DiscoveryEvent {
                peer_id: peer_id.clone(),
                display_name: properties
                    .local_name
                    .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()),
                signal_strength: properties.rssi.unwrap_or(i16::MIN),
            };
            known.insert(peer_id, peripheral);
            if discovered.send(event).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn session(&self, handle: &ConnectionHandle) -> Result<(Peripheral, Characteristic), LinkError> {
        self.sessions
            .get(&handle.session)
            .map(|s| (s.peripheral.clone(), s.characteristic.clone()))
            .ok_or_else(|| LinkError::NotConnected(handle.peer_id.clone()))
    }
}

impl Default for BleLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkAdapter for BleLink {
    async fn is_available(&self) -> bool {
        self.ensure_adapter().await.is_ok()
    }

    async fn scan(
        &self,
        discovered: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<ScanHandle, LinkError> {
        let adapter = self.ensure_adapter().await?;
        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(|e| LinkError::Adapter(format!("Failed to start scanning: {}", e)))?;
        info!("BLE scanning started");

        let token = CancellationToken::new();
        let scan_token = token.clone();
        let known = self.peripherals.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCAN_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = scan_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = BleLink::poll_peripherals(&adapter, &known, &discovered).await {
                            error!("Error processing BLE scan results: {}", e);
                        }
                        if discovered.is_closed() {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
            info!("BLE scanning stopped");
        });

        Ok(ScanHandle::new(token))
    }

    async fn connect(&self, peer_id: &PeerId) -> Result<LinkConnection, LinkError> {
        info!("Connecting to device: {}", peer_id);
        let peripheral = self
            .peripherals
            .get(peer_id)
            .map(|p| p.clone())
            .ok_or_else(|| LinkError::ConnectFailed(format!("{} has not been scanned", peer_id)))?;
        let mut central_events = self
            .ensure_adapter()
            .await?
            .events()
            .await
            .map_err(|e| LinkError::Adapter(format!("Adapter event stream failed: {}", e)))?;

        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::ConnectFailed(format!("Service discovery failed: {}", e)))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == MESSAGE_CHARACTERISTIC_UUID)
            .ok_or_else(|| {
                LinkError::ConnectFailed("Message characteristic not found".to_string())
            })?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| LinkError::ConnectFailed(format!("Subscribe failed: {}", e)))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| LinkError::ConnectFailed(format!("Notification stream failed: {}", e)))?;

        let peer_name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        }
        .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());

        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let reader_token = token.clone();
        let remote = peer_id.clone();
        let peripheral_id = peripheral.id();
        self.sessions.insert(
            session,
            Session {
                peripheral,
                characteristic,
                token,
            },
        );

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let lost = loop {
                tokio::select! {
                    _ = reader_token.cancelled() => break None,
                    next = notifications.next() => match next {
                        Some(notification) if notification.uuid == MESSAGE_CHARACTERISTIC_UUID => {
                            if tx.send(LinkEvent::Frame(notification.value)).is_err() {
                                break None;
                            }
                        }
                        Some(_) => {}
                        None => break Some("notification stream ended"),
                    },
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            break Some("device disconnected");
                        }
                        Some(_) => {}
                        None => break Some("adapter event stream ended"),
                    },
                }
            };

            if let Some(reason) = lost {
                warn!("Lost connection to {}: {}", remote, reason);
                sessions.remove(&session);
                let _ = tx.send(LinkEvent::Lost {
                    reason: reason.to_string(),
                });
            }
        });
        info!("Successfully connected to device: {}", peer_id);

        Ok(LinkConnection {
            handle: ConnectionHandle {
                peer_id: peer_id.clone(),
                session,
            },
            peer_name,
            events: rx,
        })
    }

    async fn send(&self, handle: &ConnectionHandle, bytes: &[u8]) -> Result<(), LinkError> {
        if bytes.len() > self.max_payload_size() {
            return Err(LinkError::SendFailed(format!(
                "frame of {} bytes exceeds the link payload",
                bytes.len()
            )));
        }

        let (peripheral, characteristic) = self.session(handle)?;
        peripheral
            .write(&characteristic, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| LinkError::SendFailed(e.to_string()))?;
        debug!("Sent {} bytes to device {}", bytes.len(), handle.peer_id);
        Ok(())
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), LinkError> {
        info!("Disconnecting from device: {}", handle.peer_id);
        let (_, session) = self
            .sessions
            .remove(&handle.session)
            .ok_or_else(|| LinkError::NotConnected(handle.peer_id.clone()))?;
        session.token.cancel();
        session
            .peripheral
            .disconnect()
            .await
            .map_err(|e| LinkError::Adapter(format!("Disconnect failed: {}", e)))
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<LinkConnection>> {
        // btleplug has no peripheral role, so remote devices cannot open connections to us
        None
    }
}
