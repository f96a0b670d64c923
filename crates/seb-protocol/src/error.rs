//! Session error taxonomy and JSON-RPC 2.0 error objects.
//!
//! [`SessionError`] is what every core operation returns. The transport
//! boundary converts it into an [`RpcError`] with a stable numeric code.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Errors surfaced by the session-management core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A required field is missing or malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal transition, address mismatch, or disable-after-establish.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Unknown connection token, room, or notification.
    #[error("not found: {0}")]
    NotFound(String),

    /// The connection has no exam bound where one is required.
    #[error("no exam bound to connection {0}")]
    MissingExam(String),

    /// The persistence collaborator kept failing after bounded retries.
    #[error("store unavailable: {0}")]
    TransientStore(String),

    /// A concurrent mutation held the token; the caller may retry.
    #[error("concurrent modification of {0}, retry")]
    Conflict(String),
}

impl SessionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Conflict(_))
    }
}

/// Failure reported by a persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Standard JSON-RPC 2.0 error codes plus session-specific codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    // JSON-RPC 2.0 standard errors
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,

    // Server errors
    ServerError,
    ServerNotInitialized,
    ServerShuttingDown,

    // Session errors
    StateConflict,
    NotFound,
    MissingExam,
    TransientStore,
    Conflict,

    Custom(i32),
}

impl RpcErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::ServerNotInitialized => -32001,
            Self::ServerShuttingDown => -32002,
            Self::StateConflict => -32020,
            Self::NotFound => -32021,
            Self::MissingExam => -32022,
            Self::TransientStore => -32023,
            Self::Conflict => -32024,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::ServerError,
            -32001 => Self::ServerNotInitialized,
            -32002 => Self::ServerShuttingDown,
            -32020 => Self::StateConflict,
            -32021 => Self::NotFound,
            -32022 => Self::MissingExam,
            -32023 => Self::TransientStore,
            -32024 => Self::Conflict,
            c => Self::Custom(c),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(RpcErrorCode::MethodNotFound, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalError, message)
    }

    pub fn not_initialized() -> Self {
        Self::new(RpcErrorCode::ServerNotInitialized, "Server is not initialized")
    }

    pub fn shutting_down() -> Self {
        Self::new(RpcErrorCode::ServerShuttingDown, "Server is shutting down")
    }

    pub fn error_code(&self) -> RpcErrorCode {
        RpcErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC Error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        let retryable = err.is_retryable();
        let code = match &err {
            SessionError::Validation(_) => RpcErrorCode::InvalidParams,
            SessionError::StateConflict(_) => RpcErrorCode::StateConflict,
            SessionError::NotFound(_) => RpcErrorCode::NotFound,
            SessionError::MissingExam(_) => RpcErrorCode::MissingExam,
            SessionError::TransientStore(_) => RpcErrorCode::TransientStore,
            SessionError::Conflict(_) => RpcErrorCode::Conflict,
        };
        let rpc = Self::new(code, err.to_string());
        if retryable {
            rpc.with_data(json!({ "retryable": true }))
        } else {
            rpc
        }
    }
}
