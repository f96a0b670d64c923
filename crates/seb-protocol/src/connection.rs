//! Client connection record and lifecycle status.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a client connection.
///
/// `Closed` and `Disabled` are terminal. `Authenticated` and `Active` are
/// the established states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Undefined,
    ConnectionRequested,
    Authenticated,
    Active,
    Closed,
    Disabled,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Disabled)
    }

    pub fn is_established(self) -> bool {
        matches!(self, Self::Authenticated | Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "UNDEFINED",
            Self::ConnectionRequested => "CONNECTION_REQUESTED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
            Self::Disabled => "DISABLED",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exam client's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConnection {
    /// Durable surrogate key assigned by the persistence collaborator.
    pub id: u64,
    pub connection_token: String,
    pub institution_id: u64,
    pub exam_id: Option<u64>,
    pub status: ConnectionStatus,
    pub user_session_id: Option<String>,
    pub client_address: String,
    /// Per-client address behind a shared VDI address.
    pub virtual_client_address: Option<String>,
    pub seb_version: Option<String>,
    pub os_name: Option<String>,
    pub machine_name: Option<String>,
    pub client_id_tag: Option<String>,
    /// Unix epoch milliseconds.
    pub creation_time: u64,
    /// Bumped on every committed write; the store's compare-and-swap key.
    #[serde(default)]
    pub version: u64,
}

impl ClientConnection {
    pub fn is_established(&self) -> bool {
        self.status.is_established()
    }

    /// Whether `address` is one this connection is known to originate from.
    pub fn matches_address(&self, address: &str) -> bool {
        self.client_address == address
            || self.virtual_client_address.as_deref() == Some(address)
    }
}

/// Optional fields merged into a connection by `update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    pub exam_id: Option<u64>,
    pub user_session_id: Option<String>,
    pub client_address: Option<String>,
    pub seb_version: Option<String>,
    pub os_name: Option<String>,
    pub machine_name: Option<String>,
    pub client_id_tag: Option<String>,
}
