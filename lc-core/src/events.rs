//! Lifecycle events
//!
//! Every phase of an exchange produces one [`LifecycleEvent`] on a broadcast
//! bus. Subscribers get owned copies and have no handle back into the
//! router, registry or pending table.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::ocpp::{OcppMessage, WireFormat};
use crate::types::{
    ConnectionId, ConnectionRole, NetworkPath, NetworkingMode, NodeId, SecurityProfile,
    TravelDirection,
};

/// Exchange phase an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    RequestReceived,
    RequestForwarded,
    RequestDispatched,
    ResponseReceived,
    ResponseForwarded,
    ResponseSent,
    DecodeFailed,
    DuplicateRejected,
    DuplicateIgnored,
    Timeout,
    ConnectionLost,
    TransmissionFailed,
    UnknownDestination,
    MessageLoop,
    /// Action travelling against its declared direction
    DirectionViolation,
}

/// Snapshot of the connection an event happened on
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: NodeId,
    pub role: ConnectionRole,
    pub mode: NetworkingMode,
    pub format: WireFormat,
    pub security_profile: SecurityProfile,
}

/// Outcome of handing a frame to a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "result", content = "reason")]
pub enum TransmissionResult {
    Success,
    Failed(String),
}

/// One record per exchange phase
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub action: Option<String>,
    pub direction: Option<TravelDirection>,
    pub sender: Option<NodeId>,
    pub connection: Option<ConnectionInfo>,
    pub message: Option<OcppMessage>,
    pub network_path: NetworkPath,
    pub runtime: Option<Duration>,
    pub transmission: Option<TransmissionResult>,
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn new(phase: Phase, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            phase,
            action: None,
            direction: None,
            sender: None,
            connection: None,
            message: None,
            network_path: NetworkPath::new(),
            runtime: None,
            transmission: None,
            detail: None,
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn direction(mut self, direction: TravelDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn sender(mut self, sender: NodeId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn message(mut self, message: OcppMessage) -> Self {
        if self.action.is_none() {
            self.action = message.action().map(str::to_string);
        }
        self.message = Some(message);
        self
    }

    pub fn network_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn runtime(mut self, runtime: Duration) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn transmission(mut self, result: TransmissionResult) -> Self {
        self.transmission = Some(result);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Broadcast bus for lifecycle events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Nobody listening is not an error.
    pub fn emit(&self, event: LifecycleEvent) {
        trace!("event {:?} {:?}", event.phase, event.action);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::Call;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let call = Call::with_id("123", "BootNotification", json!({}));
        bus.emit(
            LifecycleEvent::new(Phase::RequestReceived, Utc::now())
                .sender(NodeId::from("CP1"))
                .message(call.into()),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.phase, Phase::RequestReceived);
        assert_eq!(event.action.as_deref(), Some("BootNotification"));
        assert_eq!(event.sender, Some(NodeId::from("CP1")));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(LifecycleEvent::new(Phase::Timeout, Utc::now()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_message_as_frame() {
        let event = LifecycleEvent::new(Phase::ResponseForwarded, Utc::now())
            .message(crate::ocpp::CallResult::new("123", json!({"status": "Accepted"})).into())
            .runtime(Duration::from_millis(12))
            .transmission(TransmissionResult::Success);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["phase"], "responseForwarded");
        assert_eq!(value["message"], json!([3, "123", {"status": "Accepted"}]));
        assert_eq!(value["transmission"]["result"], "success");
        assert!(value["action"].is_null());
    }
}
