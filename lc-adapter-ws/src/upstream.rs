//! CSMS uplink
//!
//! Connects to `<csms_url>/<local NodeId>`, registers the link as the
//! upstream connection and reconnects with exponential backoff plus jitter.

use std::sync::Arc;
use std::time::Duration;

use lc_core::{LinkSettings, NetworkingNode};
use rand::Rng;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::connect_async_with_config;
use tracing::{debug, error, info, warn};

use crate::config::WsConfig;
use crate::error::TransportError;
use crate::server::observed_profile;
use crate::session::{run_session, SessionEnd};

pub struct UpstreamClient {
    node: Arc<NetworkingNode>,
    config: WsConfig,
}

impl UpstreamClient {
    pub fn new(node: Arc<NetworkingNode>, config: WsConfig) -> Self {
        Self { node, config }
    }

    /// Run with automatic reconnection. Returns only when no CSMS URL is configured.
    pub async fn run(self) -> Result<(), TransportError> {
        let Some(base) = self.config.csms_url.clone() else {
            info!("No CSMS configured, uplink disabled");
            return Ok(());
        };
        let url = build_ocpp_url(&base, self.node.node_id().as_str());
        let mut delay = self.config.reconnect_delay;

        loop {
            info!("Connecting to CSMS at {}", url);

            match self.connect_and_run(&url).await {
                Ok(SessionEnd::LocalClosed) => {
                    info!("Uplink closed locally");
                    delay = self.config.reconnect_delay;
                }
                Ok(SessionEnd::RemoteClosed) => {
                    info!("CSMS closed the connection");
                    delay = self.config.reconnect_delay;
                }
                Err(e) => {
                    error!("CSMS connection error: {}", e);
                }
            }

            let wait = with_jitter(delay);
            warn!("Reconnecting in {:?}", wait);
            tokio::time::sleep(wait).await;
            delay = next_delay(delay, self.config.max_reconnect_delay);
        }
    }

    async fn connect_and_run(&self, url: &str) -> Result<SessionEnd, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))?;
        let offered = HeaderValue::from_str(&self.config.subprotocols.join(", "))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, offered);

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_message_size))
            .max_frame_size(Some(self.config.max_frame_size));

        let (ws, response) = connect_async_with_config(request, Some(ws_config), false).await?;

        match response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
        {
            Some(protocol) => info!("Connected to CSMS using {}", protocol),
            None => warn!("CSMS did not confirm a subprotocol"),
        }

        let settings = LinkSettings::upstream()
            .with_mode(self.config.uplink_mode)
            .with_security_profile(observed_profile(url.starts_with("wss://"), false));
        let (connection, outbound) = self.node.attach(self.config.csms_id.clone(), settings);
        debug!("Uplink registered as {} ({})", connection.node_id(), connection.id());

        run_session(self.node.clone(), connection, outbound, ws).await
    }
}

/// Build the OCPP WebSocket URL for this node
pub fn build_ocpp_url(base_url: &str, node_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

/// Double, capped
pub fn next_delay(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

/// Add up to 10% random jitter
pub fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
