//! `seb/*` — the calls a running SEB client makes.

use std::sync::Arc;

use seb_protocol::{HandlerResult, Methods, RpcError, WireEvent};
use serde::Deserialize;
use serde_json::{Value, json};

use super::parse_params;
use crate::Service;
use crate::manager::SessionManager;

pub struct ClientService {
    manager: Arc<SessionManager>,
}

impl ClientService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PingParams {
    connection_token: String,
    #[serde(default)]
    ping_number: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventParams {
    connection_token: String,
    #[serde(flatten)]
    event: WireEvent,
}

impl Service for ClientService {
    fn namespace(&self) -> &str {
        "seb"
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
        match method {
            Methods::SEB_PING => {
                let p: PingParams = parse_params(params)?;
                let instruction = self
                    .manager
                    .notify_ping(&p.connection_token, p.ping_number)?
                    .map(|i| i.to_wire());
                Ok(json!({ "instruction": instruction }))
            }

            Methods::SEB_EVENT => {
                let p: EventParams = parse_params(params)?;
                let event = self.manager.notify_client_event(&p.connection_token, p.event)?;
                Ok(json!({ "id": event.id, "event": WireEvent::encode(&event) }))
            }

            _ => Err(RpcError::method_not_found(method)),
        }
    }
}
