//! Router / forwarder
//!
//! Decides for every inbound frame whether it is answered here, forwarded
//! to another connection, or relayed back to a requester.
//!
//! ## Exchange lifecycle
//!
//! ```text
//!   Call in ──► path + loop check ──► destination ──► direction check
//!                                          │
//!                     ┌────────────────────┴───────────────┐
//!                     ▼                                    ▼
//!              local handler                     pending.register
//!              CALLRESULT / CALLERROR            send on next hop
//!                                                spawn waiter
//!                                                    │
//!              response | deadline | send failure | connection loss
//!                                                    ▼
//!                                     relay to origin (id restored)
//! ```
//!
//! Frame handling never waits on a response. The waiter task owns the
//! deadline and delivers exactly one answer to the requester.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::error::{CallFailure, RoutingError};
use crate::events::{EventBus, LifecycleEvent, Phase, TransmissionResult};
use crate::ocpp::{
    decode, ActionCatalog, Call, CallContext, CallError, CallResult, DecodeError, Envelope, ErrorCode,
    OcppMessage, RoutingHeader,
};
use crate::pending::{
    LossReason, NewExchange, Origin, Outcome, PendingError, PendingKey, PendingRequest, PendingTable, Resolution,
    ResolutionReceiver,
};
use crate::registry::ConnectionRegistry;
use crate::types::{ConnectionRole, NetworkPath, NetworkingMode, NodeId, TravelDirection};

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Call sent on towards its destination
    Forwarded { next_hop: NodeId, message_id: String },
    /// Call answered by this node
    Dispatched,
    /// Response matched a pending request
    Completed,
    /// A CALLERROR with this code went back to the sender
    Rejected(ErrorCode),
    /// Call reused a MessageId still in flight; not answered
    DuplicateRejected,
    /// Response matched nothing; dropped
    Ignored,
    /// Undecodable with no way to answer
    Dropped,
}

pub struct Router {
    local: NodeId,
    upstream: Option<NodeId>,
    request_timeout: Duration,
    catalog: Arc<ActionCatalog>,
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingTable>,
    events: EventBus,
    clock: SharedClock,
}

impl Router {
    pub fn new(
        config: &NodeConfig,
        catalog: Arc<ActionCatalog>,
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingTable>,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            local: config.node_id.clone(),
            upstream: config.upstream.clone(),
            request_timeout: config.request_timeout,
            catalog,
            registry,
            pending,
            events,
            clock,
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Handle one frame received on `conn`, in arrival order
    pub fn handle_frame(self: &Arc<Self>, conn: &Arc<Connection>, bytes: &[u8]) -> Disposition {
        if !self.is_live(conn) {
            warn!(
                "Dropping {} byte frame from {} on closed {}",
                bytes.len(),
                conn.node_id(),
                conn.id()
            );
            self.events.emit(
                self.event(Phase::ConnectionLost)
                    .sender(conn.node_id().clone())
                    .connection(conn.info())
                    .detail("frame received on closed connection"),
            );
            return Disposition::Dropped;
        }

        match decode(bytes, conn.format(), conn.mode()) {
            Ok(envelope) => self.handle_envelope(conn, envelope),
            Err(err) => self.handle_decode_error(conn, err),
        }
    }

    /// Open and still the registered connection for its id
    fn is_live(&self, conn: &Connection) -> bool {
        conn.is_open() && self.registry.get(conn.id()).is_some()
    }

    pub fn handle_envelope(self: &Arc<Self>, conn: &Arc<Connection>, envelope: Envelope) -> Disposition {
        match envelope.message {
            OcppMessage::Call(call) => self.handle_call(conn, call, envelope.routing),
            response => self.handle_response(conn, response, envelope.routing),
        }
    }

    fn handle_decode_error(&self, conn: &Connection, err: DecodeError) -> Disposition {
        warn!(
            "Malformed frame from {} ({}), id {:?}: {}",
            conn.node_id(),
            conn.id(),
            err.message_id,
            err
        );

        let event = self
            .event(Phase::DecodeFailed)
            .sender(conn.node_id().clone())
            .connection(conn.info())
            .detail(err.to_string());

        let Some(reply) = err.reply() else {
            self.events.emit(event);
            return Disposition::Dropped;
        };

        let code = reply.error_code.clone();
        let envelope = Envelope::plain(reply);
        let transmission = self.transmit(conn, &envelope);
        self.events
            .emit(event.message(envelope.message).transmission(transmission));
        Disposition::Rejected(code)
    }

    fn handle_call(self: &Arc<Self>, conn: &Arc<Connection>, call: Call, routing: Option<RoutingHeader>) -> Disposition {
        let sender = conn.node_id().clone();
        let travel = TravelDirection::inbound_on(conn.role());
        let (addressed_to, mut path) = match routing {
            Some(header) => (Some(header.destination), header.network_path),
            None => (None, NetworkPath::new()),
        };

        debug!(
            "{} {} from {} ({}) path {}",
            call.action,
            call.message_id,
            sender,
            conn.id(),
            path
        );
        self.events.emit(
            self.event(Phase::RequestReceived)
                .direction(travel)
                .sender(sender.clone())
                .connection(conn.info())
                .message(call.clone().into())
                .network_path(path.clone()),
        );

        if let Err(looped) = path.push(sender.clone()) {
            return self.reject(conn, &call, travel, &path, RoutingError::MessageLoop(looped.0));
        }
        if path.contains(&self.local) {
            return self.reject(conn, &call, travel, &path, RoutingError::MessageLoop(self.local.clone()));
        }

        if conn.mode() == NetworkingMode::OverlayNetwork {
            self.registry.learn_path(&path, &sender);
        }

        let destination = match addressed_to {
            Some(destination) => destination,
            None => match self.default_destination(conn.role(), &call.action) {
                Ok(destination) => destination,
                Err(err) => return self.reject(conn, &call, travel, &path, err),
            },
        };

        if !self.catalog.permits(&call.action, travel) {
            let err = RoutingError::DirectionNotPermitted {
                action: call.action.clone(),
                travel,
            };
            return self.reject(conn, &call, travel, &path, err);
        }

        if destination == self.local {
            return self.dispatch_local(conn, call, path, travel);
        }

        match self.forward(conn, call.clone(), destination, path.clone(), travel) {
            Ok(disposition) => disposition,
            Err(RoutingError::Pending(err @ PendingError::DuplicateMessageId { .. })) => {
                // Answering would look like the reply to the first call
                warn!("Ignoring {} from {}: {}", call.action, sender, err);
                self.events.emit(
                    self.event(Phase::DuplicateRejected)
                        .direction(travel)
                        .sender(sender)
                        .connection(conn.info())
                        .message(call.into())
                        .network_path(path)
                        .detail(err.to_string()),
                );
                Disposition::DuplicateRejected
            }
            Err(err) => self.reject(conn, &call, travel, &path, err),
        }
    }

    /// Where a Call without a routing header is going
    fn default_destination(&self, role: ConnectionRole, action: &str) -> Result<NodeId, RoutingError> {
        match role {
            ConnectionRole::Upstream => Ok(self.local.clone()),
            ConnectionRole::Downstream if self.catalog.handles_locally(action) => Ok(self.local.clone()),
            ConnectionRole::Downstream => self.upstream.clone().ok_or(RoutingError::NoUpstream),
        }
    }

    /// Connection towards a destination, falling back to the CSMS for CSMS-bound traffic
    fn next_hop(&self, destination: &NodeId, travel: TravelDirection) -> Option<Arc<Connection>> {
        self.registry.next_hop(destination).or_else(|| match travel {
            TravelDirection::ToCsms => self
                .upstream
                .as_ref()
                .and_then(|upstream| self.registry.lookup(upstream)),
            TravelDirection::ToChargingStation => None,
        })
    }

    fn forward(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        call: Call,
        destination: NodeId,
        path: NetworkPath,
        travel: TravelDirection,
    ) -> Result<Disposition, RoutingError> {
        let next = self
            .next_hop(&destination, travel)
            .ok_or_else(|| RoutingError::UnknownDestination(destination.clone()))?;

        if next.id() == conn.id() || path.contains(next.node_id()) {
            return Err(RoutingError::MessageLoop(next.node_id().clone()));
        }

        let (request, resolution) = self.pending.register(NewExchange {
            connection: next.id(),
            next_hop: next.node_id().clone(),
            preferred_message_id: call.message_id.clone(),
            origin: Origin::Remote {
                connection: conn.id(),
                node_id: conn.node_id().clone(),
                message_id: call.message_id.clone(),
            },
            origin_path: path.clone(),
            action: call.action.clone(),
            destination: destination.clone(),
            timeout: self.request_timeout,
        })?;

        // The requester may have been unregistered since the frame was read.
        // Unregister closes before draining, so an entry registered before
        // this check is either seen here or drained there.
        if !conn.is_open() {
            self.pending.cancel_all(conn.id(), LossReason::Disconnected);
            warn!(
                "{} {} from {} dropped, requester closed",
                call.action, call.message_id, conn.node_id()
            );
            return Ok(Disposition::Dropped);
        }

        self.spawn_waiter(request.key.clone(), resolution);

        let outbound = Call {
            message_id: request.key.message_id.clone(),
            ..call
        };
        let envelope = Self::outbound_envelope(&next, outbound, &destination, path.clone());
        let transmission = self.transmit(&next, &envelope);

        match &transmission {
            TransmissionResult::Success => info!(
                "Forwarded {} {} from {} to {} via {}",
                request.action,
                request.key.message_id,
                conn.node_id(),
                destination,
                next.node_id()
            ),
            TransmissionResult::Failed(reason) => {
                self.pending.fail(&request.key, reason.clone());
            }
        }

        self.events.emit(
            self.event(Phase::RequestForwarded)
                .direction(travel)
                .sender(conn.node_id().clone())
                .connection(next.info())
                .message(envelope.message)
                .network_path(path)
                .transmission(transmission),
        );

        Ok(Disposition::Forwarded {
            next_hop: next.node_id().clone(),
            message_id: request.key.message_id,
        })
    }

    fn dispatch_local(&self, conn: &Connection, call: Call, path: NetworkPath, travel: TravelDirection) -> Disposition {
        let started = self.clock.now();
        self.events.emit(
            self.event(Phase::RequestDispatched)
                .direction(travel)
                .sender(conn.node_id().clone())
                .connection(conn.info())
                .message(call.clone().into())
                .network_path(path.clone()),
        );

        let context = CallContext {
            local: self.local.clone(),
            sender: conn.node_id().clone(),
            connection: conn.id(),
            message_id: call.message_id.clone(),
            action: call.action.clone(),
            network_path: path.clone(),
        };

        let reply: OcppMessage = match self.catalog.handler(&call.action) {
            Some(handler) => match handler(&context, &call.payload) {
                Ok(payload) => CallResult::new(call.message_id.clone(), payload).into(),
                Err(err) => {
                    debug!("{} {} handler failed: {}", call.action, call.message_id, err);
                    CallError::new(call.message_id.clone(), err.code, err.description)
                        .with_details(err.details)
                        .into()
                }
            },
            None => CallError::new(
                call.message_id.clone(),
                ErrorCode::NotImplemented,
                format!("{} is not handled by {}", call.action, self.local),
            )
            .into(),
        };

        let envelope = Self::reply_envelope(conn, reply, &path);
        let transmission = self.transmit(conn, &envelope);
        self.events.emit(
            self.event(Phase::ResponseSent)
                .action(call.action)
                .direction(TravelDirection::outbound_on(conn.role()))
                .sender(self.local.clone())
                .connection(conn.info())
                .message(envelope.message)
                .network_path(path)
                .runtime(self.clock.now().saturating_duration_since(started))
                .transmission(transmission),
        );
        Disposition::Dispatched
    }

    fn handle_response(&self, conn: &Connection, response: OcppMessage, routing: Option<RoutingHeader>) -> Disposition {
        let message_id = response.message_id().to_string();
        let path = routing
            .as_ref()
            .map(|header| header.network_path.clone())
            .unwrap_or_default();

        self.events.emit(
            self.event(Phase::ResponseReceived)
                .sender(conn.node_id().clone())
                .connection(conn.info())
                .message(response.clone())
                .network_path(path.clone()),
        );

        match self.pending.complete(conn.id(), &message_id, response.clone(), routing) {
            Ok(request) => {
                debug!(
                    "{} {} answered by {} ({})",
                    request.action,
                    message_id,
                    conn.node_id(),
                    conn.id()
                );
                Disposition::Completed
            }
            Err(err) => {
                debug!("Dropping response from {}: {}", conn.node_id(), err);
                self.events.emit(
                    self.event(Phase::DuplicateIgnored)
                        .sender(conn.node_id().clone())
                        .connection(conn.info())
                        .message(response)
                        .network_path(path)
                        .detail(err.to_string()),
                );
                Disposition::Ignored
            }
        }
    }

    /// Send a CALLERROR for a Call this node refuses to route
    fn reject(
        &self,
        conn: &Connection,
        call: &Call,
        travel: TravelDirection,
        path: &NetworkPath,
        err: RoutingError,
    ) -> Disposition {
        warn!(
            "Rejecting {} {} from {}: {}",
            call.action,
            call.message_id,
            conn.node_id(),
            err
        );

        let code = err.error_code();
        let reply = CallError::new(call.message_id.clone(), code.clone(), err.to_string());
        let envelope = Self::reply_envelope(conn, reply.into(), path);
        let transmission = self.transmit(conn, &envelope);

        let phase = match err {
            RoutingError::MessageLoop(_) => Phase::MessageLoop,
            RoutingError::DirectionNotPermitted { .. } => Phase::DirectionViolation,
            RoutingError::UnknownDestination(_) | RoutingError::NoUpstream | RoutingError::Pending(_) => {
                Phase::UnknownDestination
            }
        };
        self.events.emit(
            self.event(phase)
                .action(call.action.clone())
                .direction(travel)
                .sender(conn.node_id().clone())
                .connection(conn.info())
                .message(envelope.message)
                .network_path(path.clone())
                .transmission(transmission)
                .detail(err.to_string()),
        );
        Disposition::Rejected(code)
    }

    fn spawn_waiter(self: &Arc<Self>, key: PendingKey, resolution: ResolutionReceiver) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            match router.await_resolution(&key, resolution).await {
                Some(resolution) => router.relay(resolution),
                None => error!("Resolution of {} dropped", key),
            }
        });
    }

    /// Wait for a resolution, expiring the request at its deadline
    async fn await_resolution(&self, key: &PendingKey, mut resolution: ResolutionReceiver) -> Option<Resolution> {
        let deadline = tokio::time::sleep(self.request_timeout);
        tokio::pin!(deadline);

        tokio::select! {
            resolved = &mut resolution => resolved.ok(),
            _ = &mut deadline => {
                // Loses quietly if the request resolved in the meantime
                self.pending.expire(key);
                resolution.await.ok()
            }
        }
    }

    /// Deliver a resolution to the remote requester
    fn relay(&self, resolution: Resolution) {
        let Resolution {
            request,
            outcome,
            runtime,
        } = resolution;

        let Origin::Remote {
            connection,
            node_id,
            message_id,
        } = &request.origin
        else {
            return;
        };

        let (reply, phase): (OcppMessage, Phase) = match outcome {
            Outcome::Completed { response, .. } => (response.with_message_id(message_id.clone()), Phase::ResponseForwarded),
            Outcome::TimedOut => (
                CallError::new(
                    message_id.clone(),
                    ErrorCode::Timeout,
                    format!("No response from {} within {:?}", request.destination, self.request_timeout),
                )
                .into(),
                Phase::Timeout,
            ),
            Outcome::ConnectionLost { reason } => (
                CallError::new(
                    message_id.clone(),
                    ErrorCode::ConnectionLost,
                    format!("Connection to {} lost: {}", request.next_hop, reason),
                )
                .into(),
                Phase::ConnectionLost,
            ),
            Outcome::TransmissionFailed { reason } => (
                CallError::new(
                    message_id.clone(),
                    ErrorCode::TransmissionFailed,
                    format!("Could not send to {}: {}", request.next_hop, reason),
                )
                .into(),
                Phase::TransmissionFailed,
            ),
        };

        let event = self
            .event(phase)
            .action(request.action.clone())
            .sender(request.next_hop.clone())
            .network_path(request.origin_path.clone())
            .runtime(runtime);

        let Some(origin) = self.registry.get(*connection).filter(|c| c.is_open()) else {
            info!(
                "{} ({}) left before {} {} resolved as {:?}",
                node_id, connection, request.action, message_id, phase
            );
            self.events
                .emit(event.message(reply).detail("requester disconnected"));
            return;
        };

        let envelope = Self::reply_envelope(&origin, reply, &request.origin_path);
        let transmission = self.transmit(&origin, &envelope);
        debug!(
            "Relayed {:?} for {} {} to {} after {:?}",
            phase, request.action, message_id, node_id, runtime
        );
        self.events.emit(
            event
                .direction(TravelDirection::outbound_on(origin.role()))
                .connection(origin.info())
                .message(envelope.message)
                .transmission(transmission),
        );
    }

    /// Send a Call from this node and wait for the outcome
    pub async fn originate(&self, destination: &NodeId, call: Call) -> Result<CallResult, CallFailure> {
        let next = self
            .registry
            .next_hop(destination)
            .ok_or_else(|| RoutingError::UnknownDestination(destination.clone()))?;

        let travel = TravelDirection::outbound_on(next.role());
        if !self.catalog.permits(&call.action, travel) {
            return Err(RoutingError::DirectionNotPermitted {
                action: call.action,
                travel,
            }
            .into());
        }

        let (request, resolution) = self
            .pending
            .register(NewExchange {
                connection: next.id(),
                next_hop: next.node_id().clone(),
                preferred_message_id: call.message_id.clone(),
                origin: Origin::Local,
                origin_path: NetworkPath::new(),
                action: call.action.clone(),
                destination: destination.clone(),
                timeout: self.request_timeout,
            })
            .map_err(RoutingError::from)?;

        let outbound = Call {
            message_id: request.key.message_id.clone(),
            ..call
        };
        let envelope = Self::outbound_envelope(&next, outbound, destination, NetworkPath::new());
        let transmission = self.transmit(&next, &envelope);
        if let TransmissionResult::Failed(reason) = &transmission {
            self.pending.fail(&request.key, reason.clone());
        }

        self.events.emit(
            self.event(Phase::RequestForwarded)
                .direction(travel)
                .sender(self.local.clone())
                .connection(next.info())
                .message(envelope.message)
                .transmission(transmission),
        );

        let resolution = self
            .await_resolution(&request.key, resolution)
            .await
            .ok_or(CallFailure::Abandoned)?;

        let failure = match resolution.outcome {
            Outcome::Completed {
                response: OcppMessage::CallResult(result),
                ..
            } => return Ok(result),
            Outcome::Completed {
                response: OcppMessage::CallError(err),
                ..
            } => CallFailure::Rejected {
                code: err.error_code,
                description: err.error_description,
                details: err.error_details,
            },
            Outcome::Completed {
                response: OcppMessage::Call(_),
                ..
            } => CallFailure::Rejected {
                code: ErrorCode::ProtocolError,
                description: "answered with a call".to_string(),
                details: serde_json::Value::Null,
            },
            Outcome::TimedOut => {
                self.emit_local_failure(Phase::Timeout, &resolution.request, resolution.runtime);
                CallFailure::Timeout(destination.clone())
            }
            Outcome::ConnectionLost { reason } => {
                self.emit_local_failure(Phase::ConnectionLost, &resolution.request, resolution.runtime);
                CallFailure::ConnectionLost {
                    node: resolution.request.next_hop.clone(),
                    reason,
                }
            }
            Outcome::TransmissionFailed { reason } => {
                self.emit_local_failure(Phase::TransmissionFailed, &resolution.request, resolution.runtime);
                CallFailure::TransmissionFailed(reason)
            }
        };
        Err(failure)
    }

    fn emit_local_failure(&self, phase: Phase, request: &PendingRequest, runtime: Duration) {
        self.events.emit(
            self.event(phase)
                .action(request.action.clone())
                .sender(request.next_hop.clone())
                .runtime(runtime)
                .detail(format!("local call {} to {}", request.key.message_id, request.destination)),
        );
    }

    fn outbound_envelope(next: &Connection, call: Call, destination: &NodeId, path: NetworkPath) -> Envelope {
        match next.mode() {
            NetworkingMode::OverlayNetwork => Envelope::routed(call, destination.clone(), path),
            NetworkingMode::Standard => Envelope::plain(call),
        }
    }

    /// Response framing back along `path`: addressed to its origin, one hop shorter
    fn reply_envelope(conn: &Connection, message: OcppMessage, path: &NetworkPath) -> Envelope {
        match (conn.mode(), path.origin()) {
            (NetworkingMode::OverlayNetwork, Some(origin)) => Envelope::routed(message, origin.clone(), path.retreat()),
            _ => Envelope::plain(message),
        }
    }

    fn transmit(&self, conn: &Connection, envelope: &Envelope) -> TransmissionResult {
        match conn.send(envelope) {
            Ok(()) => TransmissionResult::Success,
            Err(err) => {
                warn!("Send to {} ({}) failed: {}", conn.node_id(), conn.id(), err);
                TransmissionResult::Failed(err.to_string())
            }
        }
    }

    fn event(&self, phase: Phase) -> LifecycleEvent {
        LifecycleEvent::new(phase, self.clock.utc_now())
    }
}
