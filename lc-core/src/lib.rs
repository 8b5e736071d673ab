//! Local Controller Core Library
//!
//! OCPP message exchange and routing for a networking node that sits
//! between charge points and one or more CSMS.
//!
//! ## Architecture
//!
//! ```text
//!            CSMS                         Neighbour node
//!              │ upstream                       │ overlay link
//!              ▼                                ▼
//! ┌───────────────────────────────────────────────────────┐
//! │  NetworkingNode                                       │
//! │  ┌────────┐   ┌────────┐   ┌──────────┐   ┌────────┐  │
//! │  │ Codec  │──►│ Router │◄─►│ Registry │   │ Events │  │
//! │  └────────┘   └───┬────┘   └──────────┘   └────────┘  │
//! │                   │  ┌─────────────────┐              │
//! │                   └─►│ Pending requests│              │
//! │                      └─────────────────┘              │
//! └───────────────────────────────────────────────────────┘
//!              ▲ downstream
//!              │
//!        Charge points
//! ```
//!
//! Transports hand received bytes to [`NetworkingNode::receive`] and write
//! whatever appears on the queue returned by [`NetworkingNode::attach`].

pub mod types;
pub mod ocpp;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod pending;
pub mod registry;
pub mod retry;
pub mod router;
pub mod node;

pub use types::*;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::NodeConfig;
pub use connection::{Connection, LinkSettings, OutboundFrame};
pub use error::{CallFailure, RoutingError, TransmissionError};
pub use events::{ConnectionInfo, EventBus, LifecycleEvent, Phase, TransmissionResult};
pub use node::{NetworkingNode, NodeBuilder, NodeStats};
pub use pending::{ExchangeState, LossReason, PendingError, PendingTable};
pub use registry::{ConnectionRegistry, RouteEntry, RouteKind};
pub use retry::{ExponentialBackoff, NoRetry, RetryPolicy};
pub use router::{Disposition, Router};
