//! Pending request table
//!
//! Tracks every Call this node has sent and still expects an answer for.
//! Entries are keyed by the connection the Call went out on plus the
//! outbound MessageId; a second index over (origin connection, origin
//! MessageId) rejects duplicate requests from the same requester.
//!
//! Every terminal transition (response, deadline, send failure, connection
//! loss) starts by removing the entry from the map. Only the caller that
//! removed it sends on the resolution channel, so each request resolves
//! exactly once no matter how the transitions race.

use std::fmt;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::ocpp::{OcppMessage, RoutingHeader};
use crate::types::{ConnectionId, NetworkPath, NodeId};

/// Outbound correlation key: connection the Call was sent on + its MessageId
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub connection: ConnectionId,
    pub message_id: String,
}

impl PendingKey {
    pub fn new(connection: ConnectionId, message_id: impl Into<String>) -> Self {
        Self {
            connection,
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.message_id)
    }
}

/// Who is waiting for the answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A caller inside this node
    Local,
    /// A neighbour whose Call was forwarded
    Remote {
        connection: ConnectionId,
        node_id: NodeId,
        message_id: String,
    },
}

impl Origin {
    fn key(&self) -> Option<(ConnectionId, String)> {
        match self {
            Origin::Local => None,
            Origin::Remote {
                connection,
                message_id,
                ..
            } => Some((*connection, message_id.clone())),
        }
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Origin::Local => None,
            Origin::Remote { connection, .. } => Some(*connection),
        }
    }
}

/// Why a connection's exchanges were cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LossReason {
    Disconnected,
    /// Replaced by a newer connection for the same node
    Evicted,
    Shutdown,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::Disconnected => write!(f, "disconnected"),
            LossReason::Evicted => write!(f, "replaced by a newer connection"),
            LossReason::Shutdown => write!(f, "node shutting down"),
        }
    }
}

/// Terminal state an exchange resolved in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExchangeState {
    Completed,
    TimedOut,
    ConnectionLost,
    TransmissionFailed,
}

/// An in-flight request
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub key: PendingKey,
    pub origin: Origin,
    /// Path the Call had travelled when it reached this node
    pub origin_path: NetworkPath,
    pub action: String,
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub sent_at: Instant,
    pub timeout_at: Instant,
}

/// How an exchange ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        response: OcppMessage,
        routing: Option<RoutingHeader>,
    },
    TimedOut,
    TransmissionFailed {
        reason: String,
    },
    ConnectionLost {
        reason: LossReason,
    },
}

impl Outcome {
    pub fn state(&self) -> ExchangeState {
        match self {
            Outcome::Completed { .. } => ExchangeState::Completed,
            Outcome::TimedOut => ExchangeState::TimedOut,
            Outcome::TransmissionFailed { .. } => ExchangeState::TransmissionFailed,
            Outcome::ConnectionLost { .. } => ExchangeState::ConnectionLost,
        }
    }
}

/// Delivered once per request on its resolution channel
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: PendingRequest,
    pub outcome: Outcome,
    /// Time from sending to resolution
    pub runtime: Duration,
}

pub type ResolutionReceiver = oneshot::Receiver<Resolution>;

/// Parameters of a request about to be sent
#[derive(Debug, Clone)]
pub struct NewExchange {
    pub connection: ConnectionId,
    pub next_hop: NodeId,
    /// Used as the outbound MessageId unless already taken on that connection
    pub preferred_message_id: String,
    pub origin: Origin,
    pub origin_path: NetworkPath,
    pub action: String,
    pub destination: NodeId,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("message id {message_id} already in flight from {connection}")]
    DuplicateMessageId {
        connection: ConnectionId,
        message_id: String,
    },

    #[error("no pending request {message_id} on {connection}")]
    NotFound {
        connection: ConnectionId,
        message_id: String,
    },
}

struct Slot {
    request: PendingRequest,
    resolver: oneshot::Sender<Resolution>,
}

/// Concurrent table of in-flight requests
pub struct PendingTable {
    entries: DashMap<PendingKey, Slot>,
    origins: DashMap<(ConnectionId, String), PendingKey>,
    clock: SharedClock,
}

impl PendingTable {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            origins: DashMap::new(),
            clock,
        }
    }

    /// Record a request before it is sent.
    ///
    /// Fails without side effects if the origin already has a request with
    /// the same MessageId in flight.
    pub fn register(&self, exchange: NewExchange) -> Result<(PendingRequest, ResolutionReceiver), PendingError> {
        let origin_key = exchange.origin.key();
        let mut key = PendingKey::new(exchange.connection, exchange.preferred_message_id.clone());

        if let Some(origin_key) = &origin_key {
            match self.origins.entry(origin_key.clone()) {
                Entry::Occupied(_) => {
                    return Err(PendingError::DuplicateMessageId {
                        connection: origin_key.0,
                        message_id: origin_key.1.clone(),
                    });
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(key.clone());
                }
            }
        }

        let now = self.clock.now();
        let (resolver, receiver) = oneshot::channel();
        let mut resolver = Some(resolver);

        let request = loop {
            match self.entries.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    let request = PendingRequest {
                        key: key.clone(),
                        origin: exchange.origin.clone(),
                        origin_path: exchange.origin_path.clone(),
                        action: exchange.action.clone(),
                        destination: exchange.destination.clone(),
                        next_hop: exchange.next_hop.clone(),
                        sent_at: now,
                        timeout_at: now + exchange.timeout,
                    };
                    if let Some(resolver) = resolver.take() {
                        vacant.insert(Slot {
                            request: request.clone(),
                            resolver,
                        });
                    }
                    break request;
                }
                Entry::Occupied(_) => {
                    // Same id already used on that link by another requester
                    let fresh = Uuid::new_v4().to_string();
                    debug!(
                        "Message id {} busy on {}, sending as {}",
                        key.message_id, key.connection, fresh
                    );
                    key = PendingKey::new(exchange.connection, fresh);
                }
            }
        };

        if let Some(origin_key) = origin_key {
            if request.key.message_id != exchange.preferred_message_id {
                self.origins.insert(origin_key, request.key.clone());
            }
        }

        debug!(
            "Pending {} {} -> {} (timeout {:?})",
            request.key, request.action, request.destination, exchange.timeout
        );
        Ok((request, receiver))
    }

    /// Resolve a request with the response that arrived on `connection`
    pub fn complete(
        &self,
        connection: ConnectionId,
        message_id: &str,
        response: OcppMessage,
        routing: Option<RoutingHeader>,
    ) -> Result<PendingRequest, PendingError> {
        let key = PendingKey::new(connection, message_id);
        let (_, slot) = self.entries.remove(&key).ok_or_else(|| PendingError::NotFound {
            connection,
            message_id: message_id.to_string(),
        })?;

        let request = slot.request.clone();
        self.finish(slot, Outcome::Completed { response, routing });
        Ok(request)
    }

    /// Resolve a request whose Call could not be handed to the transport
    pub fn fail(&self, key: &PendingKey, reason: impl Into<String>) -> bool {
        match self.entries.remove(key) {
            Some((_, slot)) => {
                self.finish(slot, Outcome::TransmissionFailed { reason: reason.into() });
                true
            }
            None => false,
        }
    }

    /// Resolve a request as timed out. No-op if it already resolved.
    pub fn expire(&self, key: &PendingKey) -> bool {
        match self.entries.remove(key) {
            Some((_, slot)) => {
                info!(
                    "Request {} ({}) to {} timed out",
                    slot.request.key, slot.request.action, slot.request.destination
                );
                self.finish(slot, Outcome::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Expire everything whose deadline is at or before `now`
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let overdue: Vec<PendingKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().request.timeout_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        overdue.iter().filter(|key| self.expire(key)).count()
    }

    /// Resolve every request sent on, or originating from, a connection
    pub fn cancel_all(&self, connection: ConnectionId, reason: LossReason) -> usize {
        let owned: Vec<PendingKey> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.key().connection == connection
                    || entry.value().request.origin.connection() == Some(connection)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for key in owned {
            if let Some((_, slot)) = self.entries.remove(&key) {
                self.finish(slot, Outcome::ConnectionLost { reason });
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            warn!("Cancelled {} pending request(s) on {}: {}", cancelled, connection, reason);
        }
        cancelled
    }

    fn finish(&self, slot: Slot, outcome: Outcome) {
        let Slot { request, resolver } = slot;

        if let Some(origin_key) = request.origin.key() {
            self.origins.remove_if(&origin_key, |_, key| *key == request.key);
        }

        let runtime = self.clock.now().saturating_duration_since(request.sent_at);
        debug!("Pending {} resolved {:?} after {:?}", request.key, outcome.state(), runtime);

        let key = request.key.clone();
        if resolver
            .send(Resolution {
                request,
                outcome,
                runtime,
            })
            .is_err()
        {
            debug!("Nobody waiting on resolution of {}", key);
        }
    }

    pub fn get(&self, key: &PendingKey) -> Option<PendingRequest> {
        self.entries.get(key).map(|slot| slot.request.clone())
    }

    /// Number of requests sent on a connection still awaiting an answer
    pub fn in_flight_on(&self, connection: ConnectionId) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.key().connection == connection)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
