//! `proctoring/*` — operator room actions and exam end.

use std::sync::Arc;

use seb_protocol::{HandlerResult, Methods, RpcError};
use serde::Deserialize;
use serde_json::{Value, json};

use super::parse_params;
use crate::Service;
use crate::manager::SessionManager;

pub struct ProctoringService {
    manager: Arc<SessionManager>,
}

impl ProctoringService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExamParams {
    exam_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakOutParams {
    exam_id: u64,
    subject: String,
    connection_tokens: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseRoomParams {
    exam_id: u64,
    room_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TownhallParams {
    exam_id: u64,
    subject: Option<String>,
}

impl Service for ProctoringService {
    fn namespace(&self) -> &str {
        "proctoring"
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
        match method {
            Methods::PROCTORING_ROOMS => {
                let p: ExamParams = parse_params(params)?;
                Ok(json!({ "rooms": self.manager.rooms(p.exam_id).await? }))
            }

            Methods::PROCTORING_BREAK_OUT => {
                let p: BreakOutParams = parse_params(params)?;
                let room = self
                    .manager
                    .create_break_out_room(p.exam_id, &p.subject, &p.connection_tokens)
                    .await?;
                Ok(json!(room))
            }

            Methods::PROCTORING_CLOSE_ROOM => {
                let p: CloseRoomParams = parse_params(params)?;
                Ok(json!(self.manager.close_proctoring_room(p.exam_id, &p.room_name).await?))
            }

            Methods::PROCTORING_OPEN_TOWNHALL => {
                let p: TownhallParams = parse_params(params)?;
                Ok(json!(self.manager.open_townhall(p.exam_id, p.subject.as_deref()).await?))
            }

            Methods::PROCTORING_END_EXAM => {
                let p: ExamParams = parse_params(params)?;
                let report = self.manager.end_exam(p.exam_id).await?;
                Ok(json!({
                    "closed": report.closed,
                    "failed": report.failed,
                    "roomsDisposed": report.rooms_disposed,
                }))
            }

            _ => Err(RpcError::method_not_found(method)),
        }
    }
}
