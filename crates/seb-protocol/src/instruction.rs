//! Server-to-client instructions.
//!
//! Inside the server an instruction is an [`InstructionKind`] with a typed
//! payload. On the wire it is `{ "instruction": "SEB_PROCTORING",
//! "attributes": { "method": "JOIN", ... } }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::room::RoomAccess;

/// Attribute key carrying the confirmation id of an instruction.
pub const CONFIRM_ID_ATTRIBUTE: &str = "confirmId";

/// External instruction type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructionType {
    SebQuit,
    SebProctoring,
    SebReconfigureSettings,
    NotificationConfirm,
    SebForceLockScreen,
}

impl InstructionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SebQuit => "SEB_QUIT",
            Self::SebProctoring => "SEB_PROCTORING",
            Self::SebReconfigureSettings => "SEB_RECONFIGURE_SETTINGS",
            Self::NotificationConfirm => "NOTIFICATION_CONFIRM",
            Self::SebForceLockScreen => "SEB_FORCE_LOCK_SCREEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SEB_QUIT" => Some(Self::SebQuit),
            "SEB_PROCTORING" => Some(Self::SebProctoring),
            "SEB_RECONFIGURE_SETTINGS" => Some(Self::SebReconfigureSettings),
            "NOTIFICATION_CONFIRM" => Some(Self::NotificationConfirm),
            "SEB_FORCE_LOCK_SCREEN" => Some(Self::SebForceLockScreen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProctoringAction {
    Join,
    Leave,
}

impl ProctoringAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Join => "JOIN",
            Self::Leave => "LEAVE",
        }
    }
}

/// Typed instruction payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InstructionKind {
    Quit,
    Proctoring {
        action: ProctoringAction,
        room_name: String,
        subject: String,
        access: Option<RoomAccess>,
    },
    ReconfigureSettings {
        settings_url: Option<String>,
        reset_proctoring: bool,
    },
    NotificationConfirm {
        notification_id: u64,
    },
    ForceLockScreen {
        message: Option<String>,
    },
}

impl InstructionKind {
    pub fn instruction_type(&self) -> InstructionType {
        match self {
            Self::Quit => InstructionType::SebQuit,
            Self::Proctoring { .. } => InstructionType::SebProctoring,
            Self::ReconfigureSettings { .. } => InstructionType::SebReconfigureSettings,
            Self::NotificationConfirm { .. } => InstructionType::NotificationConfirm,
            Self::ForceLockScreen { .. } => InstructionType::SebForceLockScreen,
        }
    }

    /// Flatten the payload into the external string-keyed attribute map.
    pub fn to_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        match self {
            Self::Quit => {}
            Self::Proctoring { action, room_name, subject, access } => {
                attrs.insert("method".into(), action.as_str().into());
                attrs.insert("roomName".into(), room_name.clone());
                attrs.insert("subject".into(), subject.clone());
                if let Some(access) = access {
                    attrs.insert("serviceUrl".into(), access.server_url.clone());
                    attrs.insert("accessToken".into(), access.room_token.clone());
                }
            }
            Self::ReconfigureSettings { settings_url, reset_proctoring } => {
                if let Some(url) = settings_url {
                    attrs.insert("url".into(), url.clone());
                }
                if *reset_proctoring {
                    attrs.insert("resetProctoring".into(), "true".into());
                }
            }
            Self::NotificationConfirm { notification_id } => {
                attrs.insert("id".into(), notification_id.to_string());
            }
            Self::ForceLockScreen { message } => {
                if let Some(message) = message {
                    attrs.insert("message".into(), message.clone());
                }
            }
        }
        attrs
    }

    /// Build a typed payload from the external type name and attributes.
    pub fn from_wire(instruction: &str, attrs: &BTreeMap<String, String>) -> Result<Self, SessionError> {
        let kind = InstructionType::parse(instruction)
            .ok_or_else(|| SessionError::validation(format!("unknown instruction type: {instruction}")))?;

        let required = |key: &str| {
            attrs
                .get(key)
                .cloned()
                .ok_or_else(|| SessionError::validation(format!("{instruction} requires attribute '{key}'")))
        };

        Ok(match kind {
            InstructionType::SebQuit => Self::Quit,
            InstructionType::SebProctoring => {
                let action = match required("method")?.as_str() {
                    "JOIN" => ProctoringAction::Join,
                    "LEAVE" => ProctoringAction::Leave,
                    other => {
                        return Err(SessionError::validation(format!("unknown proctoring method: {other}")));
                    }
                };
                let access = match (attrs.get("serviceUrl"), attrs.get("accessToken")) {
                    (Some(url), Some(token)) => Some(RoomAccess {
                        server_url: url.clone(),
                        room_token: token.clone(),
                    }),
                    _ => None,
                };
                Self::Proctoring {
                    action,
                    room_name: required("roomName")?,
                    subject: attrs.get("subject").cloned().unwrap_or_default(),
                    access,
                }
            }
            InstructionType::SebReconfigureSettings => Self::ReconfigureSettings {
                settings_url: attrs.get("url").cloned(),
                reset_proctoring: attrs.get("resetProctoring").is_some_and(|v| v == "true"),
            },
            InstructionType::NotificationConfirm => {
                let id = required("id")?;
                let notification_id = id
                    .parse()
                    .map_err(|_| SessionError::validation(format!("invalid notification id: {id}")))?;
                Self::NotificationConfirm { notification_id }
            }
            InstructionType::SebForceLockScreen => Self::ForceLockScreen {
                message: attrs.get("message").cloned(),
            },
        })
    }
}

/// A queued instruction for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInstruction {
    /// Assigned by the queue; unique per process.
    pub id: u64,
    pub exam_id: u64,
    pub connection_token: String,
    pub kind: InstructionKind,
    pub needs_confirmation: bool,
    pub confirm_id: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

impl ClientInstruction {
    pub fn instruction_type(&self) -> InstructionType {
        self.kind.instruction_type()
    }

    pub fn to_wire(&self) -> WireInstruction {
        let mut attributes = self.kind.to_attributes();
        if let Some(confirm_id) = &self.confirm_id {
            attributes.insert(CONFIRM_ID_ATTRIBUTE.into(), confirm_id.clone());
        }
        WireInstruction {
            instruction: self.instruction_type().as_str().to_string(),
            attributes,
        }
    }
}

/// External shape of an instruction, embedded in ping responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireInstruction {
    pub instruction: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}
