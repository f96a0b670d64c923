//! JSON-RPC adapters — one [`crate::Service`] per method namespace.
//!
//! Each adapter decodes params, calls the `SessionManager`, and encodes
//! the result. Core errors convert into RPC errors through `?`.

mod client;
mod connection;
mod instruction;
mod monitoring;
mod notification;
mod proctoring;

pub use client::ClientService;
pub use connection::ConnectionService;
pub use instruction::InstructionService;
pub use monitoring::MonitoringService;
pub use notification::NotificationService;
pub use proctoring::ProctoringService;

use seb_protocol::{ClientConnection, RpcError, SessionError};
use serde::Deserialize;
use serde_json::{Value, json};

fn parse_params<T: for<'de> Deserialize<'de>>(params: Option<Value>) -> Result<T, RpcError> {
    match params {
        Some(v) => serde_json::from_value(v)
            .map_err(|e| RpcError::invalid_params(format!("Invalid parameters: {e}"))),
        None => Err(RpcError::invalid_params("Parameters required")),
    }
}

/// Per-token outcome list of a bulk operation.
fn bulk_results(results: Vec<(String, Result<ClientConnection, SessionError>)>) -> Value {
    let items: Vec<Value> = results
        .into_iter()
        .map(|(token, result)| match result {
            Ok(connection) => json!({ "connectionToken": token, "status": connection.status }),
            Err(e) => json!({ "connectionToken": token, "error": RpcError::from(e) }),
        })
        .collect();
    json!({ "results": items })
}
