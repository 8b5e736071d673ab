//! Configuration for a networking node

use std::time::Duration;

use crate::types::NodeId;

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Node identity
    pub node_id: NodeId,

    /// CSMS that receives charge point traffic by default
    pub upstream: Option<NodeId>,

    /// How long a forwarded or local Call may wait for its response
    pub request_timeout: Duration,

    /// Interval of the overdue-request backstop sweep
    pub sweep_interval: Duration,

    /// Outbound frames queued per connection; a send to a full queue fails
    pub outbound_queue: usize,

    /// Lifecycle events buffered per subscriber
    pub event_buffer: usize,

    /// (destination, via) routes known up front
    pub static_routes: Vec<(NodeId, NodeId)>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("LC1"),
            upstream: None,
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            outbound_queue: 64,
            event_buffer: 1024,
            static_routes: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Create config for a node id
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the default CSMS
    pub fn with_upstream(mut self, upstream: impl Into<NodeId>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_outbound_queue(mut self, frames: usize) -> Self {
        self.outbound_queue = frames;
        self
    }

    pub fn with_event_buffer(mut self, events: usize) -> Self {
        self.event_buffer = events;
        self
    }

    /// Add a static route
    pub fn with_route(mut self, destination: impl Into<NodeId>, via: impl Into<NodeId>) -> Self {
        self.static_routes.push((destination.into(), via.into()));
        self
    }
}
