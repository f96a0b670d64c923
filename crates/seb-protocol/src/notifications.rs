//! Monitoring notifications — server-side events with no response expected.
//!
//! Background sweeps and state transitions publish [`MonitoringEvent`]s;
//! subscribers render them as JSON-RPC notifications.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::connection::ConnectionStatus;
use crate::jsonrpc::RpcNotification;

/// All notification names.
pub struct Notifications;

impl Notifications {
    pub const CONNECTION_STATUS_CHANGED: &str = "connection/statusChanged";
    pub const MONITORING_MISSING_PING: &str = "monitoring/missingPing";
    pub const MONITORING_PING_RECOVERED: &str = "monitoring/pingRecovered";
}

/// Type alias for notification names.
pub type NotificationName = &'static str;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MonitoringEvent {
    StatusChanged {
        token: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    MissingPing {
        token: String,
        last_ping: u64,
        detected_at: u64,
    },
    PingRecovered {
        token: String,
        at: u64,
    },
}

impl MonitoringEvent {
    pub fn token(&self) -> &str {
        match self {
            Self::StatusChanged { token, .. }
            | Self::MissingPing { token, .. }
            | Self::PingRecovered { token, .. } => token,
        }
    }

    pub fn method(&self) -> NotificationName {
        match self {
            Self::StatusChanged { .. } => Notifications::CONNECTION_STATUS_CHANGED,
            Self::MissingPing { .. } => Notifications::MONITORING_MISSING_PING,
            Self::PingRecovered { .. } => Notifications::MONITORING_PING_RECOVERED,
        }
    }

    pub fn to_notification(&self) -> RpcNotification {
        let params = match self {
            Self::StatusChanged { token, from, to } => json!({
                "connectionToken": token,
                "from": from,
                "to": to,
            }),
            Self::MissingPing { token, last_ping, detected_at } => json!({
                "connectionToken": token,
                "lastPing": last_ping,
                "detectedAt": detected_at,
            }),
            Self::PingRecovered { token, at } => json!({
                "connectionToken": token,
                "at": at,
            }),
        };
        RpcNotification::new(self.method(), Some(params))
    }
}
