//! `connection/*` — lifecycle calls from the SEB client and the operator.

use std::sync::Arc;

use seb_protocol::{ConnectionUpdate, HandlerResult, Methods, RpcError};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{bulk_results, parse_params};
use crate::Service;
use crate::manager::SessionManager;
use crate::state::EstablishRequest;
use crate::store::NewConnection;

pub struct ConnectionService {
    manager: Arc<SessionManager>,
}

impl ConnectionService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    institution_id: Option<u64>,
    client_address: String,
    exam_id: Option<u64>,
    seb_version: Option<String>,
    os_name: Option<String>,
    machine_name: Option<String>,
    client_id_tag: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateParams {
    connection_token: String,
    #[serde(flatten)]
    update: ConnectionUpdate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EstablishParams {
    connection_token: String,
    institution_id: Option<u64>,
    exam_id: Option<u64>,
    client_address: String,
    user_session_id: Option<String>,
    client_id_tag: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseParams {
    connection_token: String,
    institution_id: u64,
    client_address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisableParams {
    connection_token: String,
    institution_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisableManyParams {
    connection_tokens: Vec<String>,
    institution_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenParams {
    connection_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExamParams {
    exam_id: u64,
}

impl Service for ConnectionService {
    fn namespace(&self) -> &str {
        "connection"
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
        match method {
            Methods::CONNECTION_CREATE => {
                let p: CreateParams = parse_params(params)?;
                let connection = self.manager.create_connection(NewConnection {
                    institution_id: p.institution_id,
                    client_address: p.client_address,
                    exam_id: p.exam_id,
                    seb_version: p.seb_version,
                    os_name: p.os_name,
                    machine_name: p.machine_name,
                    client_id_tag: p.client_id_tag,
                })?;
                Ok(json!(connection))
            }

            Methods::CONNECTION_UPDATE => {
                let p: UpdateParams = parse_params(params)?;
                let connection = self.manager.update_connection(&p.connection_token, &p.update)?;
                Ok(json!(connection))
            }

            Methods::CONNECTION_ESTABLISH => {
                let p: EstablishParams = parse_params(params)?;
                let institution_id = p
                    .institution_id
                    .ok_or_else(|| RpcError::invalid_params("institutionId is required"))?;
                let request = EstablishRequest {
                    institution_id,
                    exam_id: p.exam_id,
                    client_address: p.client_address,
                    user_session_id: p.user_session_id,
                    client_id_tag: p.client_id_tag,
                };
                let connection = self.manager.establish_connection(&p.connection_token, &request)?;
                Ok(json!(connection))
            }

            Methods::CONNECTION_CLOSE => {
                let p: CloseParams = parse_params(params)?;
                let connection = self
                    .manager
                    .close_connection(&p.connection_token, p.institution_id, &p.client_address)?;
                Ok(json!(connection))
            }

            Methods::CONNECTION_DISABLE => {
                let p: DisableParams = parse_params(params)?;
                let connection = self.manager.disable_connection(&p.connection_token, p.institution_id)?;
                Ok(json!(connection))
            }

            Methods::CONNECTION_DISABLE_MANY => {
                let p: DisableManyParams = parse_params(params)?;
                Ok(bulk_results(self.manager.disable_connections(&p.connection_tokens, p.institution_id)))
            }

            Methods::CONNECTION_GET => {
                let p: TokenParams = parse_params(params)?;
                Ok(json!(self.manager.get_connection(&p.connection_token)?))
            }

            Methods::CONNECTION_LIST_FOR_EXAM => {
                let p: ExamParams = parse_params(params)?;
                let mut connections = self.manager.connections_for_exam(p.exam_id);
                connections.sort_by_key(|c| c.id);
                Ok(json!({ "connections": connections }))
            }

            Methods::CONNECTION_CLOSE_EXAM => {
                let p: ExamParams = parse_params(params)?;
                Ok(bulk_results(self.manager.close_connections_of_exam(p.exam_id)))
            }

            _ => Err(RpcError::method_not_found(method)),
        }
    }
}
