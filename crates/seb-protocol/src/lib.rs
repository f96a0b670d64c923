//! SEB session protocol types.
//!
//! Data model of the client connection session subsystem, its error
//! taxonomy, and the JSON-RPC 2.0 envelope used at the transport boundary.
//! Typed instructions and events live here together with their mapping to
//! the string-keyed external wire format.

pub mod connection;
pub mod error;
pub mod event;
pub mod instruction;
pub mod jsonrpc;
pub mod methods;
pub mod notifications;
pub mod room;

pub use connection::{ClientConnection, ConnectionStatus, ConnectionUpdate};
pub use error::{RpcError, RpcErrorCode, SessionError, StoreError};
pub use event::{ClientEvent, EventFilter, EventKind, NotificationKind, WireEvent};
pub use instruction::{
    ClientInstruction, InstructionKind, InstructionType, ProctoringAction, WireInstruction,
};
pub use jsonrpc::{
    HandlerResult, RequestId, RpcErrorResponse, RpcNotification, RpcRequest, RpcResponse,
    RpcSuccessResponse,
};
pub use methods::{MethodName, Methods};
pub use notifications::{MonitoringEvent, NotificationName, Notifications};
pub use room::{ProctoringRoom, RoomAccess, RoomType};
