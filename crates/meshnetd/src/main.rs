//! meshnetd: mesh overlay node daemon.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;

use meshnet::Node;
use meshnet_core::MeshConfig;

mod tcp;

use tcp::{TcpDialerBackend, TcpListenerBackend};

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = MeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshConfig::default()
    });

    let id = std::env::args()
        .nth(1)
        .or_else(|| Some(config.node.id.clone()).filter(|id| !id.is_empty()))
        .unwrap_or_else(default_node_id);
    tracing::info!(node = %id, "meshnetd starting");

    let node = Node::new(id, config.node.clone()).context("failed to create node")?;

    for listener in &config.tcp_listeners {
        let backend = TcpListenerBackend::bind(&listener.bind)
            .await
            .with_context(|| format!("failed to bind {}", listener.bind))?;
        let overrides = Some(listener.node_cost.clone()).filter(|c| !c.is_empty());
        node.add_backend(backend, listener.cost, overrides)?;
    }
    for peer in &config.tcp_peers {
        let backend = TcpDialerBackend::new(peer.address.clone(), peer.redial_interval());
        node.add_backend(backend, peer.cost, None)?;
    }
    if config.tcp_listeners.is_empty() && config.tcp_peers.is_empty() {
        tracing::warn!("no tcp listeners or peers configured, node is isolated");
    }

    let status_printer = {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            loop {
                interval.tick().await;
                match serde_json::to_string(&node.status()) {
                    Ok(json) => tracing::info!(status = %json, "node status"),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize status"),
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    status_printer.abort();
    node.shutdown();
    node.backend_wait().await;
    Ok(())
}

/// $HOSTNAME, or a random name when unset.
fn default_node_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            format!("node-{suffix}")
        })
}
