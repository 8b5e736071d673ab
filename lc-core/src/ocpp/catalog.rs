//! Action catalog
//!
//! A dispatch table built once at startup: action name to direction of
//! travel, plus an optional handler for actions this node answers itself.
//! Actions missing from the table are still routed; they just skip the
//! direction check.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::messages::ErrorCode;
use crate::types::{ConnectionId, NetworkPath, NodeId, TravelDirection};

/// Which way an action may travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionDirection {
    ToCsms,
    ToChargingStation,
    Bidirectional,
}

impl ActionDirection {
    pub fn allows(&self, travel: TravelDirection) -> bool {
        match self {
            ActionDirection::Bidirectional => true,
            ActionDirection::ToCsms => travel == TravelDirection::ToCsms,
            ActionDirection::ToChargingStation => travel == TravelDirection::ToChargingStation,
        }
    }
}

/// OCPP 2.0.1 action set
const OCPP201_ACTIONS: &[(&str, ActionDirection)] = &[
    // CS -> CSMS
    ("Authorize", ActionDirection::ToCsms),
    ("BootNotification", ActionDirection::ToCsms),
    ("ClearedChargingLimit", ActionDirection::ToCsms),
    ("FirmwareStatusNotification", ActionDirection::ToCsms),
    ("Get15118EVCertificate", ActionDirection::ToCsms),
    ("GetCertificateStatus", ActionDirection::ToCsms),
    ("Heartbeat", ActionDirection::ToCsms),
    ("LogStatusNotification", ActionDirection::ToCsms),
    ("MeterValues", ActionDirection::ToCsms),
    ("NotifyChargingLimit", ActionDirection::ToCsms),
    ("NotifyCustomerInformation", ActionDirection::ToCsms),
    ("NotifyDisplayMessages", ActionDirection::ToCsms),
    ("NotifyEVChargingNeeds", ActionDirection::ToCsms),
    ("NotifyEVChargingSchedule", ActionDirection::ToCsms),
    ("NotifyEvent", ActionDirection::ToCsms),
    ("NotifyMonitoringReport", ActionDirection::ToCsms),
    ("NotifyReport", ActionDirection::ToCsms),
    ("PublishFirmwareStatusNotification", ActionDirection::ToCsms),
    ("ReportChargingProfiles", ActionDirection::ToCsms),
    ("ReservationStatusUpdate", ActionDirection::ToCsms),
    ("SecurityEventNotification", ActionDirection::ToCsms),
    ("SignCertificate", ActionDirection::ToCsms),
    ("StatusNotification", ActionDirection::ToCsms),
    ("TransactionEvent", ActionDirection::ToCsms),
    // CSMS -> CS
    ("CancelReservation", ActionDirection::ToChargingStation),
    ("CertificateSigned", ActionDirection::ToChargingStation),
    ("ChangeAvailability", ActionDirection::ToChargingStation),
    ("ClearCache", ActionDirection::ToChargingStation),
    ("ClearChargingProfile", ActionDirection::ToChargingStation),
    ("ClearDisplayMessage", ActionDirection::ToChargingStation),
    ("ClearVariableMonitoring", ActionDirection::ToChargingStation),
    ("CostUpdated", ActionDirection::ToChargingStation),
    ("CustomerInformation", ActionDirection::ToChargingStation),
    ("DeleteCertificate", ActionDirection::ToChargingStation),
    ("GetBaseReport", ActionDirection::ToChargingStation),
    ("GetChargingProfiles", ActionDirection::ToChargingStation),
    ("GetCompositeSchedule", ActionDirection::ToChargingStation),
    ("GetDisplayMessages", ActionDirection::ToChargingStation),
    ("GetInstalledCertificateIds", ActionDirection::ToChargingStation),
    ("GetLocalListVersion", ActionDirection::ToChargingStation),
    ("GetLog", ActionDirection::ToChargingStation),
    ("GetMonitoringReport", ActionDirection::ToChargingStation),
    ("GetReport", ActionDirection::ToChargingStation),
    ("GetTransactionStatus", ActionDirection::ToChargingStation),
    ("GetVariables", ActionDirection::ToChargingStation),
    ("InstallCertificate", ActionDirection::ToChargingStation),
    ("PublishFirmware", ActionDirection::ToChargingStation),
    ("RequestStartTransaction", ActionDirection::ToChargingStation),
    ("RequestStopTransaction", ActionDirection::ToChargingStation),
    ("ReserveNow", ActionDirection::ToChargingStation),
    ("Reset", ActionDirection::ToChargingStation),
    ("SendLocalList", ActionDirection::ToChargingStation),
    ("SetChargingProfile", ActionDirection::ToChargingStation),
    ("SetDisplayMessage", ActionDirection::ToChargingStation),
    ("SetMonitoringBase", ActionDirection::ToChargingStation),
    ("SetMonitoringLevel", ActionDirection::ToChargingStation),
    ("SetNetworkProfile", ActionDirection::ToChargingStation),
    ("SetVariableMonitoring", ActionDirection::ToChargingStation),
    ("SetVariables", ActionDirection::ToChargingStation),
    ("TriggerMessage", ActionDirection::ToChargingStation),
    ("UnlockConnector", ActionDirection::ToChargingStation),
    ("UnpublishFirmware", ActionDirection::ToChargingStation),
    ("UpdateFirmware", ActionDirection::ToChargingStation),
    // Both
    ("DataTransfer", ActionDirection::Bidirectional),
];

/// What a local handler sees about the call it answers
#[derive(Debug, Clone)]
pub struct CallContext {
    /// This node
    pub local: NodeId,
    /// Neighbour the call arrived from
    pub sender: NodeId,
    pub connection: ConnectionId,
    pub message_id: String,
    pub action: String,
    /// Hops the call took, origin first
    pub network_path: NetworkPath,
}

/// Failure reported by a local handler, sent back as a CALLERROR
#[derive(Debug, Clone, Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Local handler for one action
pub type ActionHandler = Arc<dyn Fn(&CallContext, &Value) -> Result<Value, HandlerError> + Send + Sync>;

#[derive(Clone)]
struct ActionEntry {
    direction: ActionDirection,
    handler: Option<ActionHandler>,
}

/// Action name to direction and optional local handler
#[derive(Clone, Default)]
pub struct ActionCatalog {
    actions: HashMap<String, ActionEntry>,
}

impl ActionCatalog {
    /// Empty catalog: every action is routed, none validated
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the OCPP 2.0.1 action directions
    pub fn ocpp201() -> Self {
        let mut catalog = Self::new();
        for (action, direction) in OCPP201_ACTIONS {
            catalog = catalog.with_action(*action, *direction);
        }
        catalog
    }

    /// Declare (or redeclare) an action's direction
    pub fn with_action(mut self, action: impl Into<String>, direction: ActionDirection) -> Self {
        let action = action.into();
        let handler = self.actions.get(&action).and_then(|e| e.handler.clone());
        self.actions.insert(action, ActionEntry { direction, handler });
        self
    }

    /// Answer an action locally instead of forwarding it.
    ///
    /// Unknown actions are declared bidirectional.
    pub fn with_handler<F>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CallContext, &Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let entry = self
            .actions
            .entry(action.into())
            .or_insert(ActionEntry {
                direction: ActionDirection::Bidirectional,
                handler: None,
            });
        entry.handler = Some(Arc::new(handler));
        self
    }

    pub fn direction(&self, action: &str) -> Option<ActionDirection> {
        self.actions.get(action).map(|e| e.direction)
    }

    pub fn handler(&self, action: &str) -> Option<ActionHandler> {
        self.actions.get(action).and_then(|e| e.handler.clone())
    }

    pub fn handles_locally(&self, action: &str) -> bool {
        self.actions
            .get(action)
            .map(|e| e.handler.is_some())
            .unwrap_or(false)
    }

    /// Whether an action may travel in this direction (unknown actions may)
    pub fn permits(&self, action: &str, travel: TravelDirection) -> bool {
        self.direction(action)
            .map(|d| d.allows(travel))
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for ActionCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local: Vec<&String> = self
            .actions
            .iter()
            .filter(|(_, e)| e.handler.is_some())
            .map(|(a, _)| a)
            .collect();
        f.debug_struct("ActionCatalog")
            .field("actions", &self.actions.len())
            .field("local", &local)
            .finish()
    }
}
