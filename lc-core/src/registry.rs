//! Connection registry
//!
//! Live connections by NodeId and by ConnectionId, plus routes to nodes
//! that are only reachable through a neighbour. Each NodeId is bound to at
//! most one connection; a newer connection for the same node evicts the
//! older one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::pending::{LossReason, PendingTable};
use crate::types::{ConnectionId, NetworkPath, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteKind {
    /// Taken from a network path seen on an overlay link
    Learned,
    /// Configured
    Static,
}

/// How to reach a node that is not a direct neighbour
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub via: NodeId,
    /// Hops between the node and `via`, as last observed
    pub hops: NetworkPath,
    pub kind: RouteKind,
    pub updated_at: DateTime<Utc>,
}

pub struct ConnectionRegistry {
    by_node: DashMap<NodeId, Arc<Connection>>,
    by_id: DashMap<ConnectionId, Arc<Connection>>,
    routes: DashMap<NodeId, RouteEntry>,
    pending: Arc<PendingTable>,
}

impl ConnectionRegistry {
    pub fn new(pending: Arc<PendingTable>) -> Self {
        Self {
            by_node: DashMap::new(),
            by_id: DashMap::new(),
            routes: DashMap::new(),
            pending,
        }
    }

    /// Bind a connection to its NodeId, evicting any previous binding.
    ///
    /// The evicted connection is closed and its pending requests resolve
    /// as ConnectionLost before this returns.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let node_id = connection.node_id().clone();
        self.by_id.insert(connection.id(), connection.clone());
        let previous = self.by_node.insert(node_id.clone(), connection.clone());

        info!(
            "Registered {} as {} ({:?}, {:?})",
            node_id,
            connection.id(),
            connection.role(),
            connection.mode()
        );

        match previous {
            Some(old) if old.id() != connection.id() => {
                warn!("{} reconnected, evicting {}", node_id, old.id());
                old.close();
                self.pending.cancel_all(old.id(), LossReason::Evicted);
                self.by_id.remove(&old.id());
                Some(old)
            }
            _ => None,
        }
    }

    /// Remove a connection. Returns the number of pending requests cancelled.
    ///
    /// Closing happens first so nothing new can be sent on it; every
    /// exchange sent on or originating from it is resolved before the
    /// binding disappears.
    pub fn unregister(&self, id: ConnectionId) -> usize {
        self.remove(id, LossReason::Disconnected)
    }

    fn remove(&self, id: ConnectionId, reason: LossReason) -> usize {
        let Some(connection) = self.by_id.get(&id).map(|c| c.value().clone()) else {
            debug!("Unregister of unknown {}", id);
            return 0;
        };

        connection.close();
        let cancelled = self.pending.cancel_all(id, reason);
        self.by_id.remove(&id);

        let node_id = connection.node_id();
        if self.by_node.remove_if(node_id, |_, bound| bound.id() == id).is_some() {
            self.routes.retain(|_, route| &route.via != node_id);
            info!("Unregistered {} ({}), {} pending cancelled", node_id, id, cancelled);
        } else {
            debug!("{} ({}) already replaced", node_id, id);
        }
        cancelled
    }

    /// Close and remove every connection
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.by_id.iter().map(|c| *c.key()).collect();
        ids.into_iter()
            .map(|id| self.remove(id, LossReason::Shutdown))
            .sum()
    }

    /// Open connection bound to a node
    pub fn lookup(&self, node_id: &NodeId) -> Option<Arc<Connection>> {
        self.by_node
            .get(node_id)
            .map(|c| c.value().clone())
            .filter(|c| c.is_open())
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.by_id.get(&id).map(|c| c.value().clone())
    }

    /// Connection that reaches a node: direct neighbour first, then a route
    pub fn next_hop(&self, destination: &NodeId) -> Option<Arc<Connection>> {
        if let Some(direct) = self.lookup(destination) {
            return Some(direct);
        }
        let via = self.routes.get(destination).map(|r| r.via.clone())?;
        self.lookup(&via)
    }

    /// Learn routes from a path that arrived from neighbour `via`.
    ///
    /// Static routes and direct neighbours are left alone.
    pub fn learn_path(&self, path: &NetworkPath, via: &NodeId) {
        let hops = path.hops();
        for (index, hop) in hops.iter().enumerate() {
            if hop == via || self.by_node.contains_key(hop) {
                continue;
            }

            let entry = RouteEntry {
                via: via.clone(),
                hops: NetworkPath::from_hops(hops[index + 1..].iter().cloned()).unwrap_or_default(),
                kind: RouteKind::Learned,
                updated_at: Utc::now(),
            };

            match self.routes.entry(hop.clone()) {
                Entry::Occupied(mut existing) => {
                    if existing.get().kind == RouteKind::Learned {
                        if existing.get().via != *via {
                            debug!("Route to {} now via {}", hop, via);
                        }
                        existing.insert(entry);
                    }
                }
                Entry::Vacant(vacant) => {
                    debug!("Learned route to {} via {}", hop, via);
                    vacant.insert(entry);
                }
            }
        }
    }

    pub fn add_static_route(&self, destination: NodeId, via: NodeId) {
        info!("Static route {} via {}", destination, via);
        self.routes.insert(
            destination,
            RouteEntry {
                via,
                hops: NetworkPath::new(),
                kind: RouteKind::Static,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn remove_route(&self, destination: &NodeId) -> Option<RouteEntry> {
        self.routes.remove(destination).map(|(_, route)| route)
    }

    pub fn route(&self, destination: &NodeId) -> Option<RouteEntry> {
        self.routes.get(destination).map(|r| r.value().clone())
    }

    pub fn routes(&self) -> Vec<(NodeId, RouteEntry)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.by_node.iter().map(|c| c.key().clone()).collect();
        nodes.sort();
        nodes
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}
