//! WebSocket transport for the OCPP local controller
//!
//! Charge points and downstream nodes connect to the listener; the node
//! itself connects to one CSMS. Both sides feed the same [`NetworkingNode`].
//!
//! ```text
//! ┌──────────┐  ws://.../CP1   ┌────────────────────┐  ws://csms/ocpp/LC1  ┌──────┐
//! │   CP1    │────────────────►│ DownstreamListener │                      │      │
//! └──────────┘                 │        │           │                      │ CSMS │
//! ┌──────────┐                 │  NetworkingNode    │◄────────────────────►│      │
//! │   NN1    │────────────────►│        │           │    UpstreamClient    │      │
//! └──────────┘  overlay link   └────────────────────┘                      └──────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use lc_adapter_ws::{DownstreamListener, UpstreamClient, WsConfig};
//! use lc_core::{NetworkingNode, NodeConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Arc::new(NetworkingNode::new(NodeConfig::new("LC1").with_upstream("CSMS1")));
//! let config = WsConfig::new("0.0.0.0:9000".parse()?)
//!     .with_csms("ws://localhost:8180/ocpp", "CSMS1");
//!
//! let listener = DownstreamListener::bind(node.clone(), config.clone()).await?;
//! tokio::spawn(UpstreamClient::new(node, config).run());
//! listener.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod upstream;

pub use config::{WsConfig, SUPPORTED_SUBPROTOCOLS};
pub use error::TransportError;
pub use server::DownstreamListener;
pub use session::{run_session, SessionEnd};
pub use upstream::UpstreamClient;

pub use lc_core::NetworkingNode;
