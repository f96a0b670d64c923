//! `notification/*` — pending lock-screen and raise-hand notifications.

use std::sync::Arc;

use seb_protocol::{HandlerResult, Methods, RpcError};
use serde::Deserialize;
use serde_json::{Value, json};

use super::parse_params;
use crate::Service;
use crate::manager::SessionManager;

pub struct NotificationService {
    manager: Arc<SessionManager>,
}

impl NotificationService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenParams {
    connection_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmParams {
    connection_token: String,
    notification_id: u64,
}

impl Service for NotificationService {
    fn namespace(&self) -> &str {
        "notification"
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
        match method {
            Methods::NOTIFICATION_PENDING => {
                let p: TokenParams = parse_params(params)?;
                let pending = self.manager.pending_notifications(&p.connection_token)?;
                Ok(json!({ "notifications": pending }))
            }

            Methods::NOTIFICATION_HAS_PENDING => {
                let p: TokenParams = parse_params(params)?;
                Ok(json!({ "pending": self.manager.has_pending_notification(&p.connection_token)? }))
            }

            Methods::NOTIFICATION_CONFIRM => {
                let p: ConfirmParams = parse_params(params)?;
                let confirmed = self.manager.confirm_notification(&p.connection_token, p.notification_id)?;
                Ok(json!({ "confirmed": confirmed }))
            }

            _ => Err(RpcError::method_not_found(method)),
        }
    }
}
