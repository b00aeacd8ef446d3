//! Floods a few messages through a simulated mesh of engine instances
//! sharing one in-memory radio medium.

mod logging;

use anyhow::{bail, Context, Result};
use gobchat_mesh::{
    EventKind, FileStore, IdentityStore, KeyValueStore, MemoryMedium, MemoryStore, MeshConfig,
    MeshEvent, MeshNode,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which devices can hear each other
#[derive(Debug, Clone, Copy)]
enum Topology {
    /// Each device only hears its two neighbours
    Line,
    /// One source, two relays, one sink
    Diamond,
}

impl Topology {
    fn from_env() -> Result<Self> {
        match std::env::var("SIM_TOPOLOGY")
            .unwrap_or_else(|_| "diamond".to_string())
            .as_str()
        {
            "line" => Ok(Topology::Line),
            "diamond" => Ok(Topology::Diamond),
            other => bail!("unknown SIM_TOPOLOGY {:?} (expected line or diamond)", other),
        }
    }

    fn edges(self, nodes: usize) -> Vec<(usize, usize)> {
        match self {
            Topology::Line => (1..nodes).map(|i| (i - 1, i)).collect(),
            Topology::Diamond => vec![(0, 1), (0, 2), (1, 3), (2, 3)],
        }
    }
}

async fn identity_store(name: &str) -> Result<Arc<IdentityStore>> {
    let store: Arc<dyn KeyValueStore> = match std::env::var("SIM_STATE_DIR") {
        Ok(dir) => {
            let dir = PathBuf::from(dir);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
            Arc::new(FileStore::new(dir.join(format!("{}.json", name))))
        }
        Err(_) => Arc::new(MemoryStore::new()),
    };
    let identity = IdentityStore::load_or_create(store, Some(name.to_string())).await?;
    Ok(Arc::new(identity))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init(logging::LogFormat::from_env()?);

    let config = MeshConfig::from_env()?;
    let topology = Topology::from_env()?;
    let node_count = match topology {
        Topology::Line => std::env::var("SIM_NODES")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<usize>()?
            .max(2),
        Topology::Diamond => 4,
    };
    let messages: usize = std::env::var("SIM_MESSAGES")
        .unwrap_or_else(|_| "3".to_string())
        .parse()?;
    tracing::info!(?topology, nodes = node_count, "Starting mesh simulation");

    let medium = MemoryMedium::new();
    let mut nodes = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let name = format!("device-{}", i);
        let identity = identity_store(&name).await?;
        let link = medium.join(&identity.id(), &name);
        let node = MeshNode::new(identity, link, config.clone());
        node.initialize().await;

        node.subscribe(EventKind::Message, {
            let name = name.clone();
            move |event| {
                match event {
                    MeshEvent::MessageReceived { message, from_peer } => tracing::info!(
                        device = %name,
                        message_id = %message.id,
                        from_peer = %from_peer,
                        ttl = message.ttl,
                        text = message.as_text().unwrap_or("<binary>"),
                        "Message received"
                    ),
                    MeshEvent::SendFailed {
                        message_id,
                        peer_id,
                        attempts,
                    } => tracing::warn!(
                        device = %name,
                        message_id = %message_id,
                        peer_id = %peer_id,
                        attempts,
                        "Send failed"
                    ),
                    MeshEvent::ConnectionChanged { .. } => {}
                }
                Ok(())
            }
        });
        nodes.push(node);
    }

    for (a, b) in topology.edges(node_count) {
        medium.place_in_range(&nodes[a].id(), &nodes[b].id());
    }
    for node in &nodes {
        node.start_scan().await?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in &nodes {
        tracing::info!(
            device = %node.device_info().display_name,
            connections = node.connection_count(),
            "Mesh formed"
        );
    }

    let source = &nodes[0];
    for i in 0..messages {
        match source.send_text(&format!("hello mesh #{}", i + 1)) {
            Ok(id) => tracing::info!(message_id = %id, "Broadcast sent"),
            Err(e) => tracing::error!(error = %e, "Broadcast failed"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    for node in &nodes {
        tracing::info!(
            device = %node.device_info().display_name,
            seen = node.delivery().seen_len(),
            queued = node.queue_len(),
            "Final state"
        );
        node.shutdown().await;
    }
    Ok(())
}
