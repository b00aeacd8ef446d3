//! Stable local device identity, persisted once through a key-value collaborator

use crate::error::{MeshError, MeshResult};
use crate::types::PeerId;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Key under which the identity record is stored
pub const IDENTITY_KEY: &str = "device_identity";

/// Display name used when the host does not provide one
pub const DEFAULT_DISPLAY_NAME: &str = "Gobchat_Device";

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// External key-value persistence boundary
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> MeshResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> MeshResult<()>;
}

/// Volatile store for tests and simulations
#[derive(Default)]
pub struct MemoryStore {
    entries: tokio::sync::RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> MeshResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> MeshResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store backed by a single JSON object on disk
pub struct FileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> MeshResult<HashMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> MeshResult<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> MeshResult<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value.to_string());
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&entries)?).await?;
        Ok(())
    }
}

/// The identity this device presents to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: PeerId,
    pub display_name: String,
}

/// Owns the device identity. The id never changes once created; the display name is editable.
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
    identity: RwLock<DeviceIdentity>,
}

impl IdentityStore {
    /// Load the persisted identity, creating and persisting one on first run
    pub async fn load_or_create(
        store: Arc<dyn KeyValueStore>,
        device_name: Option<String>,
    ) -> MeshResult<Self> {
        let identity = match store.get(IDENTITY_KEY).await? {
            Some(raw) => {
                let identity: DeviceIdentity = serde_json::from_str(&raw)?;
                debug!("Loaded device identity {}", identity.id);
                identity
            }
            None => {
                let identity = DeviceIdentity {
                    id: generate_device_id(),
                    display_name: device_name
                        .filter(|name| !name.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()),
                };
                store
                    .set(IDENTITY_KEY, &serde_json::to_string(&identity)?)
                    .await?;
                info!("Created device identity {} ({})", identity.id, identity.display_name);
                identity
            }
        };

        Ok(Self {
            store,
            identity: RwLock::new(identity),
        })
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn id(&self) -> PeerId {
        self.identity().id
    }

    pub fn display_name(&self) -> String {
        self.identity().display_name
    }

    /// Persist a new display name
    pub async fn set_display_name(&self, name: &str) -> MeshResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MeshError::Persistence(
                "display name must not be empty".to_string(),
            ));
        }

        let mut updated = self.identity();
        updated.display_name = name.to_string();
        self.store
            .set(IDENTITY_KEY, &serde_json::to_string(&updated)?)
            .await?;

        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = updated;
        info!("Display name changed to {}", name);
        Ok(())
    }
}

/// `gobchat_<unix-millis>_<9 base36 chars>`
fn generate_device_id() -> PeerId {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("gobchat_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}
