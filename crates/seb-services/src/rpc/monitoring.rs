//! `monitoring/*` — read-only view for the monitoring console.

use std::sync::Arc;

use seb_protocol::{HandlerResult, Methods, RpcError};
use serde_json::{Value, json};

use crate::Service;
use crate::manager::SessionManager;

pub struct MonitoringService {
    manager: Arc<SessionManager>,
}

impl MonitoringService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

impl Service for MonitoringService {
    fn namespace(&self) -> &str {
        "monitoring"
    }

    async fn handle(&self, method: &str, _params: Option<Value>) -> HandlerResult {
        match method {
            Methods::MONITORING_INCIDENTS => Ok(json!({
                "incidents": self.manager.incidents(),
                "thresholdMs": self.manager.ping_monitor().threshold_ms(),
            })),

            _ => Err(RpcError::method_not_found(method)),
        }
    }
}
