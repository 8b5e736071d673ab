//! Downstream listener
//!
//! Accepts charge points and downstream networking nodes at
//! `ws://host:port/<anything>/<NodeId>`.

use std::net::SocketAddr;
use std::sync::Arc;

use lc_core::ocpp::WireFormat;
use lc_core::{LinkSettings, NetworkingMode, NetworkingNode, NodeId, SecurityProfile};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::config::WsConfig;
use crate::error::TransportError;
use crate::session::run_session;

/// What the handshake told us about the peer
#[derive(Debug, Default)]
struct Handshake {
    node_id: Option<NodeId>,
    subprotocol: Option<String>,
    basic_auth: bool,
}

pub struct DownstreamListener {
    node: Arc<NetworkingNode>,
    config: Arc<WsConfig>,
    listener: TcpListener,
}

impl DownstreamListener {
    pub async fn bind(node: Arc<NetworkingNode>, config: WsConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        info!("Listening for charge points on {}", listener.local_addr()?);
        Ok(Self {
            node,
            config: Arc::new(config),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop, one task per connection
    pub async fn run(self) -> Result<(), TransportError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!("TCP connection from {}", peer);

            let node = self.node.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(node, config, stream, peer).await {
                    error!("Connection from {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    node: Arc<NetworkingNode>,
    config: Arc<WsConfig>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), TransportError> {
    let mut handshake = Handshake::default();
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_size))
        .max_frame_size(Some(config.max_frame_size));

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let Some(node_id) = node_id_from_path(request.uri().path()) else {
            return Err(reject(StatusCode::NOT_FOUND, "missing NodeId in path"));
        };

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if let Some(protocol) = select_subprotocol(offered, &config.subprotocols) {
            if let Ok(value) = HeaderValue::from_str(&protocol) {
                response.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
            handshake.subprotocol = Some(protocol);
        } else if !offered.is_empty() {
            return Err(reject(StatusCode::BAD_REQUEST, "no supported OCPP subprotocol"));
        }

        handshake.basic_auth = request.headers().contains_key(header::AUTHORIZATION);
        handshake.node_id = Some(node_id);
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return Err(TransportError::from(e));
        }
    };

    let node_id = handshake
        .node_id
        .ok_or_else(|| TransportError::Handshake(format!("no NodeId from {}", peer)))?;
    let settings = link_settings(&config, &node_id, handshake.basic_auth);

    info!(
        "{} connected from {} ({}, {:?}, profile {})",
        node_id,
        peer,
        handshake.subprotocol.as_deref().unwrap_or("no subprotocol"),
        settings.mode,
        settings.security_profile.level()
    );

    let (connection, outbound) = node.attach(node_id, settings);
    let end = run_session(node, connection, outbound, ws).await?;
    debug!("Session with {} ended: {:?}", peer, end);
    Ok(())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn link_settings(config: &WsConfig, node_id: &NodeId, basic_auth: bool) -> LinkSettings {
    let mode = if config.overlay_peers.contains(node_id) {
        NetworkingMode::OverlayNetwork
    } else {
        NetworkingMode::Standard
    };
    let format = if config.cbor_peers.contains(node_id) {
        WireFormat::Cbor
    } else {
        WireFormat::Json
    };

    LinkSettings::downstream()
        .with_mode(mode)
        .with_format(format)
        .with_security_profile(observed_profile(false, basic_auth))
}

/// Last non-empty path segment
pub fn node_id_from_path(path: &str) -> Option<NodeId> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(NodeId::from)
}

/// First supported protocol the client offered, in our preference order
pub fn select_subprotocol(offered: &str, supported: &[String]) -> Option<String> {
    let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
    supported
        .iter()
        .find(|protocol| offered.contains(&protocol.as_str()))
        .cloned()
}

/// Security profile as far as the transport can observe it
pub fn observed_profile(tls: bool, basic_auth: bool) -> SecurityProfile {
    match (tls, basic_auth) {
        (false, false) => SecurityProfile::Unsecured,
        (false, true) => SecurityProfile::BasicAuth,
        (true, true) => SecurityProfile::TlsBasicAuth,
        (true, false) => SecurityProfile::TlsClientCertificate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported() -> Vec<String> {
        WsConfig::default().subprotocols
    }

    #[test]
    fn test_node_id_from_path() {
        assert_eq!(node_id_from_path("/ocpp/CP001"), Some(NodeId::from("CP001")));
        assert_eq!(node_id_from_path("/a/b/c/LC2/"), Some(NodeId::from("LC2")));
        assert_eq!(node_id_from_path("/CP1"), Some(NodeId::from("CP1")));
        assert_eq!(node_id_from_path("/"), None);
        assert_eq!(node_id_from_path(""), None);
    }

    #[test]
    fn test_subprotocol_preference() {
        assert_eq!(
            select_subprotocol("ocpp1.6, ocpp2.0.1", &supported()).as_deref(),
            Some("ocpp2.0.1")
        );
        assert_eq!(
            select_subprotocol("ocpp2.0.1,ocpp2.1", &supported()).as_deref(),
            Some("ocpp2.1")
        );
        assert_eq!(select_subprotocol("ocpp1.6", &supported()).as_deref(), Some("ocpp1.6"));
        assert_eq!(select_subprotocol("ocpp1.5", &supported()), None);
        assert_eq!(select_subprotocol("", &supported()), None);
    }

    #[test]
    fn test_observed_profile() {
        assert_eq!(observed_profile(false, false), SecurityProfile::Unsecured);
        assert_eq!(observed_profile(false, true).level(), 1);
        assert_eq!(observed_profile(true, true).level(), 2);
        assert_eq!(observed_profile(true, false).level(), 3);
    }

    #[test]
    fn test_link_settings_per_peer() {
        let config = WsConfig::default()
            .with_overlay_peer("NN1")
            .with_cbor_peer("CP9");

        let overlay = link_settings(&config, &NodeId::from("NN1"), false);
        assert_eq!(overlay.mode, NetworkingMode::OverlayNetwork);
        assert_eq!(overlay.format, WireFormat::Json);

        let cbor = link_settings(&config, &NodeId::from("CP9"), true);
        assert_eq!(cbor.mode, NetworkingMode::Standard);
        assert_eq!(cbor.format, WireFormat::Cbor);
        assert_eq!(cbor.security_profile, SecurityProfile::BasicAuth);
    }
}
