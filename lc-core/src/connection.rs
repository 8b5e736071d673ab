//! Live transport sessions as the core sees them
//!
//! A transport owns the socket. The core only holds a [`Connection`]: the
//! remote NodeId, link settings, a bounded queue of encoded frames for the
//! transport to write, and a close signal the transport watches.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::TransmissionError;
use crate::events::ConnectionInfo;
use crate::ocpp::{encode, Envelope, WireFormat};
use crate::types::{ConnectionId, ConnectionRole, NetworkingMode, NodeId, SecurityProfile};

/// Link settings fixed at handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub role: ConnectionRole,
    pub mode: NetworkingMode,
    pub format: WireFormat,
    pub security_profile: SecurityProfile,
}

impl LinkSettings {
    pub fn downstream() -> Self {
        Self {
            role: ConnectionRole::Downstream,
            mode: NetworkingMode::Standard,
            format: WireFormat::Json,
            security_profile: SecurityProfile::Unsecured,
        }
    }

    pub fn upstream() -> Self {
        Self {
            role: ConnectionRole::Upstream,
            ..Self::downstream()
        }
    }

    pub fn with_mode(mut self, mode: NetworkingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_security_profile(mut self, profile: SecurityProfile) -> Self {
        self.security_profile = profile;
        self
    }
}

/// Encoded frame waiting for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub format: WireFormat,
    pub bytes: Vec<u8>,
}

impl OutboundFrame {
    /// Frame as text, for JSON links
    pub fn as_text(&self) -> Option<&str> {
        match self.format {
            WireFormat::Json => std::str::from_utf8(&self.bytes).ok(),
            WireFormat::Cbor => None,
        }
    }
}

/// One transport session bound to a remote node
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    node_id: NodeId,
    settings: LinkSettings,
    outbound: mpsc::Sender<OutboundFrame>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection and the receiving half of its outbound queue
    pub fn open(
        node_id: NodeId,
        settings: LinkSettings,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let (closed, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            node_id,
            settings,
            outbound,
            closed,
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn role(&self) -> ConnectionRole {
        self.settings.role
    }

    pub fn mode(&self) -> NetworkingMode {
        self.settings.mode
    }

    pub fn format(&self) -> WireFormat {
        self.settings.format
    }

    pub fn settings(&self) -> LinkSettings {
        self.settings
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote: self.node_id.clone(),
            role: self.settings.role,
            mode: self.settings.mode,
            format: self.settings.format,
            security_profile: self.settings.security_profile,
        }
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Mark closed. Queued frames are discarded by the transport.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Closing {} ({})", self.id, self.node_id);
        }
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Encode for this link and queue for the transport without waiting.
    ///
    /// A full queue is a transmission failure for this frame only.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TransmissionError> {
        if !self.is_open() {
            return Err(TransmissionError::Closed(self.id));
        }

        let bytes = encode(envelope, self.settings.format)?;
        let frame = OutboundFrame {
            format: self.settings.format,
            bytes,
        };
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransmissionError::QueueFull(self.id)),
            Err(TrySendError::Closed(_)) => Err(TransmissionError::Closed(self.id)),
        }
    }
}
