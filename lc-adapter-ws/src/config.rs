//! Configuration for the WebSocket transport

use std::net::SocketAddr;
use std::time::Duration;

use lc_core::{NetworkingMode, NodeId};

/// Subprotocols accepted from charge points, most preferred first
pub const SUPPORTED_SUBPROTOCOLS: &[&str] = &["ocpp2.1", "ocpp2.0.1", "ocpp1.6"];

/// Complete transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Address the downstream listener binds to
    pub listen_addr: SocketAddr,

    /// CSMS WebSocket URL (without the node id), None to run without uplink
    pub csms_url: Option<String>,

    /// NodeId the CSMS connection is registered under
    pub csms_id: NodeId,

    /// Framing on the CSMS link
    pub uplink_mode: NetworkingMode,

    /// Downstream peers that speak overlay framing
    pub overlay_peers: Vec<NodeId>,

    /// Downstream peers that send CBOR in binary frames
    pub cbor_peers: Vec<NodeId>,

    /// Subprotocols offered / accepted, most preferred first
    pub subprotocols: Vec<String>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    pub max_message_size: usize,
    pub max_frame_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            csms_url: None,
            csms_id: NodeId::from("CSMS"),
            uplink_mode: NetworkingMode::Standard,
            overlay_peers: Vec::new(),
            cbor_peers: Vec::new(),
            subprotocols: SUPPORTED_SUBPROTOCOLS.iter().map(|p| p.to_string()).collect(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl WsConfig {
    /// Create config with a listen address
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Connect upstream to a CSMS
    pub fn with_csms(mut self, url: impl Into<String>, csms_id: impl Into<NodeId>) -> Self {
        self.csms_url = Some(url.into());
        self.csms_id = csms_id.into();
        self
    }

    pub fn with_uplink_mode(mut self, mode: NetworkingMode) -> Self {
        self.uplink_mode = mode;
        self
    }

    /// Add a downstream overlay peer
    pub fn with_overlay_peer(mut self, node_id: impl Into<NodeId>) -> Self {
        self.overlay_peers.push(node_id.into());
        self
    }

    /// Add a downstream peer that uses CBOR
    pub fn with_cbor_peer(mut self, node_id: impl Into<NodeId>) -> Self {
        self.cbor_peers.push(node_id.into());
        self
    }

    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }
}
