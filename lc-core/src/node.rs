//! Networking node
//!
//! Owns the registry, pending table, router and event bus. Transports use
//! [`NetworkingNode::attach`], [`NetworkingNode::receive`] and
//! [`NetworkingNode::detach`]; code running inside the node uses
//! [`NetworkingNode::call`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::NodeConfig;
use crate::connection::{Connection, LinkSettings, OutboundFrame};
use crate::error::CallFailure;
use crate::events::{EventBus, LifecycleEvent};
use crate::ocpp::{ActionCatalog, Call, CallResult};
use crate::pending::PendingTable;
use crate::registry::ConnectionRegistry;
use crate::retry::{NoRetry, RetryPolicy};
use crate::router::{Disposition, Router};
use crate::types::NodeId;

/// Point-in-time counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub connections: usize,
    pub pending: usize,
    pub routes: usize,
    pub event_subscribers: usize,
}

pub struct NodeBuilder {
    config: NodeConfig,
    catalog: ActionCatalog,
    clock: SharedClock,
    retry: Arc<dyn RetryPolicy>,
}

impl NodeBuilder {
    /// Replace the default OCPP 2.0.1 catalog
    pub fn catalog(mut self, catalog: ActionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Retry policy for [`NetworkingNode::call`]
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    pub fn build(self) -> NetworkingNode {
        let events = EventBus::new(self.config.event_buffer);
        let pending = Arc::new(PendingTable::new(self.clock.clone()));
        let registry = Arc::new(ConnectionRegistry::new(pending.clone()));

        for (destination, via) in &self.config.static_routes {
            registry.add_static_route(destination.clone(), via.clone());
        }

        let router = Arc::new(Router::new(
            &self.config,
            Arc::new(self.catalog),
            registry.clone(),
            pending.clone(),
            events.clone(),
            self.clock.clone(),
        ));

        NetworkingNode {
            config: self.config,
            registry,
            pending,
            router,
            events,
            clock: self.clock,
            retry: self.retry,
        }
    }
}

pub struct NetworkingNode {
    config: NodeConfig,
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingTable>,
    router: Arc<Router>,
    events: EventBus,
    clock: SharedClock,
    retry: Arc<dyn RetryPolicy>,
}

impl NetworkingNode {
    pub fn new(config: NodeConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            catalog: ActionCatalog::ocpp201(),
            clock: Arc::new(SystemClock),
            retry: Arc::new(NoRetry),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Register a connection whose handshake completed.
    ///
    /// The transport writes everything arriving on the returned receiver and
    /// stops when the connection's close signal fires.
    pub fn attach(&self, node_id: NodeId, settings: LinkSettings) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (connection, outbound) = Connection::open(node_id, settings, self.config.outbound_queue);
        if let Some(evicted) = self.registry.register(connection.clone()) {
            debug!("{} replaced {}", connection.id(), evicted.id());
        }
        (connection, outbound)
    }

    /// Hand one received frame to the router
    pub fn receive(&self, connection: &Arc<Connection>, bytes: &[u8]) -> Disposition {
        self.router.handle_frame(connection, bytes)
    }

    /// Transport closed. Returns the number of exchanges cancelled.
    pub fn detach(&self, connection: &Connection) -> usize {
        self.registry.unregister(connection.id())
    }

    /// Send a Call from this node and wait for its CALLRESULT.
    ///
    /// Each attempt uses a fresh MessageId. The retry policy only sees
    /// timeouts and transmission failures as retryable.
    pub async fn call(&self, destination: &NodeId, action: &str, payload: Value) -> Result<CallResult, CallFailure> {
        let mut attempt = 1;
        loop {
            let call = Call::new(action, payload.clone());
            let failure = match self.router.originate(destination, call).await {
                Ok(result) => return Ok(result),
                Err(failure) => failure,
            };

            match self.retry.retry_after(attempt, &failure) {
                Some(delay) => {
                    warn!(
                        "{} to {} failed (attempt {}): {}, retrying in {:?}",
                        action, destination, attempt, failure, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(failure),
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn add_route(&self, destination: NodeId, via: NodeId) {
        self.registry.add_static_route(destination, via);
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Periodic sweep of requests past their deadline
    pub fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let pending = self.pending.clone();
        let clock = self.clock.clone();
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = pending.expire_overdue(clock.now());
                if expired > 0 {
                    debug!("Housekeeping expired {} request(s)", expired);
                }
            }
        })
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            connections: self.registry.len(),
            pending: self.pending.len(),
            routes: self.registry.routes().len(),
            event_subscribers: self.events.subscriber_count(),
        }
    }

    /// Close every connection, cancelling whatever is in flight
    pub fn shutdown(&self) -> usize {
        let cancelled = self.registry.close_all();
        info!("{} shut down, {} pending cancelled", self.config.node_id, cancelled);
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::retry::ExponentialBackoff;
    use serde_json::json;
    use std::time::Duration;

    fn reply_to_call(frame: &OutboundFrame, payload: Value) -> Vec<u8> {
        let call: Value = serde_json::from_slice(&frame.bytes).unwrap();
        serde_json::to_vec(&json!([3, call[1], payload])).unwrap()
    }

    #[tokio::test]
    async fn test_local_call_completes() {
        let node = Arc::new(NetworkingNode::new(NodeConfig::new("LC1")));
        let (csms, mut csms_rx) = node.attach(NodeId::from("CSMS1"), LinkSettings::upstream());

        let caller = {
            let node = node.clone();
            tokio::spawn(async move {
                node.call(&NodeId::from("CSMS1"), "Heartbeat", json!({})).await
            })
        };

        let frame = csms_rx.recv().await.unwrap();
        let request: Value = serde_json::from_slice(&frame.bytes).unwrap();
        assert_eq!(request[2], json!("Heartbeat"));

        let reply = reply_to_call(&frame, json!({"currentTime": "2026-01-01T00:00:00Z"}));
        assert_eq!(node.receive(&csms, &reply), Disposition::Completed);

        let result = caller.await.unwrap().unwrap();
        assert_eq!(result.payload["currentTime"], "2026-01-01T00:00:00Z");
        assert_eq!(node.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_local_call_remote_error() {
        let node = Arc::new(NetworkingNode::new(NodeConfig::new("LC1")));
        let (cp1, mut cp1_rx) = node.attach(NodeId::from("CP1"), LinkSettings::downstream());

        let caller = {
            let node = node.clone();
            tokio::spawn(async move { node.call(&NodeId::from("CP1"), "Reset", json!({"type": "Immediate"})).await })
        };

        let frame = cp1_rx.recv().await.unwrap();
        let call: Value = serde_json::from_slice(&frame.bytes).unwrap();
        let reply = serde_json::to_vec(&json!([4, call[1], "NotSupported", "busy", {}])).unwrap();
        node.receive(&cp1, &reply);

        match caller.await.unwrap() {
            Err(CallFailure::Rejected { code, description, .. }) => {
                assert_eq!(code, crate::ocpp::ErrorCode::NotSupported);
                assert_eq!(description, "busy");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_call_unknown_destination() {
        let node = NetworkingNode::new(NodeConfig::new("LC1"));
        let err = node.call(&NodeId::from("CP404"), "Reset", json!({})).await.unwrap_err();
        assert!(matches!(err, CallFailure::Routing(_)));
    }

    #[tokio::test]
    async fn test_local_call_direction_checked() {
        let node = NetworkingNode::new(NodeConfig::new("LC1"));
        let (_cp1, _rx) = node.attach(NodeId::from("CP1"), LinkSettings::downstream());

        // BootNotification never travels towards a charging station
        let err = node.call(&NodeId::from("CP1"), "BootNotification", json!({})).await.unwrap_err();
        assert!(matches!(err, CallFailure::Routing(_)));
        assert_eq!(node.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_call_retries_timeouts() {
        let config = NodeConfig::new("LC1").with_request_timeout(Duration::from_secs(5));
        let node = Arc::new(
            NetworkingNode::builder(config)
                .retry_policy(ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(1), 2))
                .build(),
        );
        let (csms, mut csms_rx) = node.attach(NodeId::from("CSMS1"), LinkSettings::upstream());

        let caller = {
            let node = node.clone();
            tokio::spawn(async move { node.call(&NodeId::from("CSMS1"), "Heartbeat", json!({})).await })
        };

        // First attempt is left unanswered
        let first = csms_rx.recv().await.unwrap();
        let second = csms_rx.recv().await.unwrap();
        let first_id: Value = serde_json::from_slice(&first.bytes).unwrap();
        let second_id: Value = serde_json::from_slice(&second.bytes).unwrap();
        assert_ne!(first_id[1], second_id[1]);

        node.receive(&csms, &reply_to_call(&second, json!({"currentTime": "x"})));
        assert!(caller.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_housekeeping_sweeps_with_manual_clock() {
        let clock = Arc::new(ManualClock::new());
        let config = NodeConfig::new("LC1")
            .with_request_timeout(Duration::from_secs(3600))
            .with_sweep_interval(Duration::from_millis(10));
        let node = Arc::new(NetworkingNode::builder(config).clock(clock.clone()).build());
        let (_csms, mut csms_rx) = node.attach(NodeId::from("CSMS1"), LinkSettings::upstream());

        let caller = {
            let node = node.clone();
            tokio::spawn(async move { node.call(&NodeId::from("CSMS1"), "Heartbeat", json!({})).await })
        };
        csms_rx.recv().await.unwrap();

        let sweeper = node.spawn_housekeeping();
        clock.advance(Duration::from_secs(3600));

        let result = tokio::time::timeout(Duration::from_secs(5), caller).await.unwrap().unwrap();
        assert!(matches!(result, Err(CallFailure::Timeout(_))));
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let node = Arc::new(NetworkingNode::new(NodeConfig::new("LC1")));
        let (_csms, mut csms_rx) = node.attach(NodeId::from("CSMS1"), LinkSettings::upstream());

        let caller = {
            let node = node.clone();
            tokio::spawn(async move { node.call(&NodeId::from("CSMS1"), "Heartbeat", json!({})).await })
        };
        csms_rx.recv().await.unwrap();

        assert_eq!(node.shutdown(), 1);
        assert!(matches!(caller.await.unwrap(), Err(CallFailure::ConnectionLost { .. })));
        assert_eq!(node.stats().connections, 0);
    }
}
