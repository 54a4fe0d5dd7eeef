//! meshnet integration test harness.
//!
//! Every test builds its own mesh of in-process nodes joined by in-memory
//! links (or loopback TCP), so tests run in parallel without shared state.
//!
//!   cargo test --test integration
//!
//! Each test is responsible for shutting down the nodes it creates.

use std::collections::BTreeMap;
use std::io;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::watch;

use meshnet::{Addr, ExternalBackend, FrameSink, FrameSource, MessageConn, Node, NodeSettings};

mod delivery;
mod lifecycle;
mod routing;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Settings for test nodes: echo service on, fast periodic refresh.
pub fn test_settings() -> NodeSettings {
    NodeSettings {
        route_update_interval_ms: 500,
        ..NodeSettings::default()
    }
}

/// A set of named nodes that can be linked pairwise.
#[derive(Default)]
pub struct Mesh {
    nodes: BTreeMap<String, Node>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mesh with one node per name.
    pub fn with_nodes(names: &[&str]) -> Result<Self> {
        let mut mesh = Self::new();
        for name in names {
            mesh.add_node(name)?;
        }
        Ok(mesh)
    }

    pub fn add_node(&mut self, name: &str) -> Result<Node> {
        let node = Node::new(name, test_settings())
            .with_context(|| format!("failed to create node {name}"))?;
        self.nodes.insert(name.to_string(), node.clone());
        Ok(node)
    }

    pub fn node(&self, name: &str) -> &Node {
        &self.nodes[name]
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Join two nodes with a unit-cost link.
    pub fn link(&self, a: &str, b: &str) -> Result<Link> {
        self.link_with_cost(a, b, 1.0)
    }

    /// Join two nodes with a link of the given cost on both sides.
    pub fn link_with_cost(&self, a: &str, b: &str, cost: f64) -> Result<Link> {
        let (end_a, end_b, link) = severable_pipe();
        attach(self.node(a), end_a, cost)?;
        attach(self.node(b), end_b, cost)?;
        Ok(link)
    }

    /// Wait until every node has a route to every other node.
    pub async fn wait_converged(&self, limit: Duration) -> Result<()> {
        let names = self.names();
        wait_until(limit, || {
            self.nodes.values().all(|node| {
                let table = node.routing_table();
                names.iter().all(|n| table.contains_key(n))
            })
        })
        .await
        .context("mesh did not converge")
    }

    /// Shut down every node and wait for all of their tasks.
    pub async fn shutdown(&self) -> Result<()> {
        for node in self.nodes.values() {
            node.shutdown();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            for node in self.nodes.values() {
                node.backend_wait().await;
            }
        })
        .await
        .context("nodes did not stop")
    }
}

/// Hand one end of a link to `node` through a fresh backend.
pub fn attach(node: &Node, conn: MessageConn, cost: f64) -> Result<()> {
    let backend = ExternalBackend::new();
    node.add_backend(backend.clone(), cost, None)?;
    backend.new_connection(conn)?;
    Ok(())
}

/// Poll `check` every 20 ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let started = Instant::now();
    while !check() {
        if started.elapsed() > limit {
            bail!("condition not met within {limit:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Send `payload` to the echo service on `target` until the reply arrives.
pub async fn ping(node: &Node, target: &str, payload: &[u8], limit: Duration) -> Result<Duration> {
    let conn = node.listen_packet("")?;
    let to = Addr::new(target, "ping");
    let mut buf = vec![0u8; payload.len() + 1];
    let started = Instant::now();

    while started.elapsed() < limit {
        let sent_at = Instant::now();
        conn.write_to(payload, &to)?;
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(500)));
        match conn.read_from(&mut buf).await {
            Ok((n, from)) if from == to && &buf[..n] == payload => return Ok(sent_at.elapsed()),
            Ok(_) => continue,
            Err(meshnet::PacketError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    bail!("no echo from {target} within {limit:?}")
}

// ── Severable links ───────────────────────────────────────────────────────────

/// Handle that breaks an in-memory link as if the transport failed.
pub struct Link {
    cut: watch::Sender<bool>,
}

impl Link {
    pub fn cut(&self) {
        self.cut.send_replace(true);
    }
}

pub fn severable_pipe() -> (MessageConn, MessageConn, Link) {
    let (cut, cut_rx) = watch::channel(false);
    let (a, b) = MessageConn::pipe();
    (
        severable(a, cut_rx.clone()),
        severable(b, cut_rx),
        Link { cut },
    )
}

fn severable(conn: MessageConn, cut: watch::Receiver<bool>) -> MessageConn {
    let (sink, source) = conn.into_parts();
    MessageConn::new(
        SeverableSink {
            inner: sink,
            cut: cut.clone(),
        },
        SeverableSource { inner: source, cut },
    )
}

fn severed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "link cut")
}

async fn severed(mut cut: watch::Receiver<bool>) {
    let _ = cut.wait_for(|c| *c).await;
}

struct SeverableSink {
    inner: Box<dyn FrameSink>,
    cut: watch::Receiver<bool>,
}

impl FrameSink for SeverableSink {
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let severed = *self.cut.borrow();
            if severed {
                return Err(severed_error());
            }
            self.inner.send(frame).await
        })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.inner.close()
    }
}

struct SeverableSource {
    inner: Box<dyn FrameSource>,
    cut: watch::Receiver<bool>,
}

impl FrameSource for SeverableSource {
    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        let cut = self.cut.clone();
        Box::pin(async move {
            tokio::select! {
                _ = severed(cut) => Err(severed_error()),
                r = self.inner.recv() => r,
            }
        })
    }
}
