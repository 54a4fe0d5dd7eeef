//! Routing: the link-state record store, shortest-path computation and the
//! feed that publishes each new table.
//!
//! Every node floods an adjacency record ("I reach these peers at these
//! costs"). Each node keeps the newest record per origin and runs Dijkstra
//! over the claimed edges, starting from its own live connections. The
//! result maps every reachable destination to the neighbor that begins the
//! cheapest path there.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use meshnet_core::wire::RoutingUpdate;

use crate::task::ShutdownSignal;

/// Immutable routing table: destination → next hop.
pub type RoutingSnapshot = Arc<BTreeMap<String, String>>;

pub(crate) struct KnownRecord {
    pub(crate) update: RoutingUpdate,
    received_at: Instant,
}

/// Outcome of offering a record to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accepted {
    /// Not newer than what we hold. Do not re-flood.
    Stale,
    /// Stored. `changed` is true when the claimed adjacency differs from the
    /// previous record of this origin.
    Newer { changed: bool },
}

/// Everything the node knows about the mesh topology.
pub(crate) struct RoutingState {
    /// Start time of this node, ms since the Unix epoch.
    pub(crate) epoch: u64,
    /// Sequence of our most recent own record.
    pub(crate) sequence: u64,
    records: HashMap<String, KnownRecord>,
    table: RoutingSnapshot,
}

impl RoutingState {
    pub(crate) fn new(local: &str, epoch: u64) -> Self {
        let mut table = BTreeMap::new();
        table.insert(local.to_string(), local.to_string());
        Self {
            epoch,
            sequence: 0,
            records: HashMap::new(),
            table: Arc::new(table),
        }
    }

    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub(crate) fn accept(&mut self, update: RoutingUpdate, now: Instant) -> Accepted {
        let changed = match self.records.get(&update.origin) {
            Some(known) if !update.supersedes(known.update.epoch, known.update.sequence) => {
                return Accepted::Stale;
            }
            Some(known) => known.update.connections != update.connections,
            None => true,
        };
        self.records.insert(
            update.origin.clone(),
            KnownRecord {
                update,
                received_at: now,
            },
        );
        Accepted::Newer { changed }
    }

    /// Drop records not refreshed within `max_age`. Returns true if any were
    /// removed.
    pub(crate) fn expire(&mut self, max_age: Duration, now: Instant) -> bool {
        let before = self.records.len();
        self.records.retain(|origin, known| {
            let fresh = now.saturating_duration_since(known.received_at) < max_age;
            if !fresh {
                tracing::debug!(origin = %origin, "adjacency record expired");
            }
            fresh
        });
        self.records.len() != before
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &RoutingUpdate> {
        self.records.values().map(|known| &known.update)
    }

    pub(crate) fn table(&self) -> RoutingSnapshot {
        self.table.clone()
    }

    /// Replace the table. Returns true if it differs from the previous one.
    pub(crate) fn set_table(&mut self, table: BTreeMap<String, String>) -> bool {
        if *self.table == table {
            return false;
        }
        self.table = Arc::new(table);
        true
    }

    /// Recompute from scratch with `neighbors` as the local edges.
    pub(crate) fn compute(
        &self,
        local: &str,
        neighbors: &BTreeMap<String, f64>,
    ) -> BTreeMap<String, String> {
        compute_routes(local, neighbors, &self.records)
    }
}

// ── Shortest paths ────────────────────────────────────────────────────────────

/// Heap entry. Ordered so the max-heap pops the cheapest path first, then
/// the smaller first hop, then the smaller destination.
struct Candidate {
    cost: f64,
    first_hop: String,
    node: String,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.first_hop.cmp(&self.first_hop))
            .then_with(|| other.node.cmp(&self.node))
    }
}

fn usable(cost: f64) -> bool {
    cost.is_finite() && cost >= 0.0
}

/// Dijkstra over directed claimed edges.
///
/// Local edges come only from `neighbors`; a record claiming to be ours is
/// ignored. Direct neighbors always route to themselves.
fn compute_routes(
    local: &str,
    neighbors: &BTreeMap<String, f64>,
    records: &HashMap<String, KnownRecord>,
) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    table.insert(local.to_string(), local.to_string());

    let mut settled: HashSet<String> = HashSet::new();
    settled.insert(local.to_string());

    let mut heap = BinaryHeap::new();
    for (peer, cost) in neighbors {
        if peer != local && usable(*cost) {
            heap.push(Candidate {
                cost: *cost,
                first_hop: peer.clone(),
                node: peer.clone(),
            });
        }
    }

    while let Some(Candidate {
        cost,
        first_hop,
        node,
    }) = heap.pop()
    {
        if !settled.insert(node.clone()) {
            continue;
        }
        // A node claimed by others but never heard from is still reachable.
        let claimed = records.get(&node).map(|known| &known.update.connections);
        table.insert(node, first_hop.clone());

        let Some(claimed) = claimed else { continue };
        for (next, edge) in claimed {
            if settled.contains(next) || !usable(*edge) {
                continue;
            }
            heap.push(Candidate {
                cost: cost + edge,
                first_hop: first_hop.clone(),
                node: next.clone(),
            });
        }
    }

    for peer in neighbors.keys() {
        if peer != local {
            table.insert(peer.clone(), peer.clone());
        }
    }
    table
}

// ── Feed ──────────────────────────────────────────────────────────────────────

/// Stream of routing tables.
///
/// The first `next()` yields the table current at subscription time; later
/// calls wait for the next change. Intermediate tables may be skipped, the
/// latest one is always delivered.
pub struct RoutingFeed {
    rx: watch::Receiver<RoutingSnapshot>,
    shutdown: ShutdownSignal,
    primed: bool,
}

impl RoutingFeed {
    pub(crate) fn new(rx: watch::Receiver<RoutingSnapshot>, shutdown: ShutdownSignal) -> Self {
        Self {
            rx,
            shutdown,
            primed: false,
        }
    }

    /// Next table, or `None` once the node has shut down.
    pub async fn next(&mut self) -> Option<RoutingSnapshot> {
        if self.shutdown.is_raised() {
            return None;
        }
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        tokio::select! {
            _ = self.shutdown.recv() => None,
            changed = self.rx.changed() => match changed {
                Ok(()) => Some(self.rx.borrow_and_update().clone()),
                Err(_) => None,
            },
        }
    }

    /// The latest table, without waiting.
    pub fn current(&self) -> RoutingSnapshot {
        self.rx.borrow().clone()
    }
}
