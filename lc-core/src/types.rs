//! Core identity and topology types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Unique identity of a charge point, networking node or CSMS
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Appending a hop that is already on the path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("node {0} already on network path")]
pub struct PathLoop(pub NodeId);

/// Hop chain a message has traversed, origin first.
///
/// A node never appears twice on a path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a path from hops, rejecting duplicates
    pub fn from_hops<I>(hops: I) -> Result<Self, PathLoop>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut path = Self::new();
        for hop in hops {
            path.push(hop)?;
        }
        Ok(path)
    }

    /// Append a hop. The path is left unchanged on a loop.
    pub fn push(&mut self, hop: NodeId) -> Result<(), PathLoop> {
        if self.contains(&hop) {
            return Err(PathLoop(hop));
        }
        self.0.push(hop);
        Ok(())
    }

    /// Copy of this path with one more hop
    pub fn with_hop(&self, hop: NodeId) -> Result<Self, PathLoop> {
        let mut path = self.clone();
        path.push(hop)?;
        Ok(path)
    }

    /// Copy of this path with the last hop removed (one hop back towards the origin)
    pub fn retreat(&self) -> Self {
        let mut hops = self.0.clone();
        hops.pop();
        Self(hops)
    }

    pub fn contains(&self, hop: &NodeId) -> bool {
        self.0.iter().any(|h| h == hop)
    }

    pub fn origin(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(NodeId::as_str).collect();
        write!(f, "[{}]", hops.join(" -> "))
    }
}

/// Process-unique identifier of one transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Which side of this node a connection faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionRole {
    /// Towards charge points (or downstream networking nodes)
    Downstream,
    /// Towards a CSMS (or an upstream networking node)
    Upstream,
}

/// Framing used on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkingMode {
    /// Plain OCPP-J frames, routing inferred from the connection
    #[default]
    Standard,
    /// Frames carry a trailing destination and network path
    OverlayNetwork,
}

/// OCPP security profile observed at handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityProfile {
    #[default]
    Unsecured,
    BasicAuth,
    TlsBasicAuth,
    TlsClientCertificate,
}

impl SecurityProfile {
    pub fn level(&self) -> u8 {
        match self {
            SecurityProfile::Unsecured => 0,
            SecurityProfile::BasicAuth => 1,
            SecurityProfile::TlsBasicAuth => 2,
            SecurityProfile::TlsClientCertificate => 3,
        }
    }
}

/// Direction a message travels through the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TravelDirection {
    /// From a charge point towards the CSMS
    ToCsms,
    /// From the CSMS towards a charge point
    ToChargingStation,
}

impl TravelDirection {
    /// Direction of a Call received on a connection with the given role
    pub fn inbound_on(role: ConnectionRole) -> Self {
        match role {
            ConnectionRole::Downstream => TravelDirection::ToCsms,
            ConnectionRole::Upstream => TravelDirection::ToChargingStation,
        }
    }

    /// Direction of a message sent out on a connection with the given role
    pub fn outbound_on(role: ConnectionRole) -> Self {
        match role {
            ConnectionRole::Downstream => TravelDirection::ToChargingStation,
            ConnectionRole::Upstream => TravelDirection::ToCsms,
        }
    }
}
