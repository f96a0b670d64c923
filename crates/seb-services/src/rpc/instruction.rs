//! `instruction/*` — operator-issued instructions and client confirmations.

use std::collections::BTreeMap;
use std::sync::Arc;

use seb_protocol::{HandlerResult, InstructionKind, Methods, RpcError, WireInstruction};
use serde::Deserialize;
use serde_json::{Value, json};

use super::parse_params;
use crate::Service;
use crate::manager::SessionManager;

pub struct InstructionService {
    manager: Arc<SessionManager>,
}

impl InstructionService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterParams {
    exam_id: u64,
    instruction: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    connection_tokens: Vec<String>,
    #[serde(default)]
    needs_confirmation: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmParams {
    connection_token: String,
    confirm_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenParams {
    connection_token: String,
}

impl Service for InstructionService {
    fn namespace(&self) -> &str {
        "instruction"
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
        match method {
            Methods::INSTRUCTION_REGISTER => {
                let p: RegisterParams = parse_params(params)?;
                let kind = InstructionKind::from_wire(&p.instruction, &p.attributes)?;
                let registered =
                    self.manager
                        .register_instruction(p.exam_id, kind, &p.connection_tokens, p.needs_confirmation)?;
                let confirm_ids: Vec<&str> = registered.iter().filter_map(|i| i.confirm_id.as_deref()).collect();
                Ok(json!({ "registered": registered.len(), "confirmIds": confirm_ids }))
            }

            Methods::INSTRUCTION_CONFIRM => {
                let p: ConfirmParams = parse_params(params)?;
                let confirmed = self.manager.confirm_instruction(&p.connection_token, &p.confirm_id);
                Ok(json!({ "confirmed": confirmed }))
            }

            Methods::INSTRUCTION_AWAITING => {
                let p: TokenParams = parse_params(params)?;
                let awaiting: Vec<WireInstruction> = self
                    .manager
                    .awaiting_confirmation(&p.connection_token)
                    .iter()
                    .map(|i| i.to_wire())
                    .collect();
                Ok(json!({ "instructions": awaiting }))
            }

            _ => Err(RpcError::method_not_found(method)),
        }
    }
}
