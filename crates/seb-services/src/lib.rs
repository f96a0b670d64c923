//! SEB client connection session management.
//!
//! The core keeps track of every exam client's connection: its lifecycle
//! ([`store`], [`state`]), its liveness ([`ping`]), the instructions waiting
//! for it ([`instruction`]), its pending notifications ([`notification`]),
//! and its proctoring room ([`proctoring`]). [`SessionManager`] wires these
//! together; the [`rpc`] adapters expose them by JSON-RPC method namespace.

pub mod clock;
pub mod config;
pub mod exam;
pub mod instruction;
pub mod manager;
pub mod notification;
pub mod persistence;
pub mod ping;
pub mod proctoring;
pub mod retry;
pub mod rpc;
pub mod state;
pub mod store;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SessionConfig};
pub use exam::{ExamDirectory, ExamInfo, InMemoryExamDirectory};
pub use instruction::{CleanupReport, InstructionQueue};
pub use manager::{ExamEndReport, SessionManager};
pub use notification::NotificationCache;
pub use persistence::{InMemoryPersistence, SessionPersistence};
pub use ping::{Liveness, PingMonitor, SweepReport};
pub use proctoring::{InMemoryProctoringBackend, ProctoringBackend, ProctoringRoomAssignor, ReconcileReport};
pub use state::EstablishRequest;
pub use store::{ConnectionStore, NewConnection};
pub use version::{AcceptAnyVersion, ClientVersionPolicy, MinimumVersionPolicy};

use seb_protocol::HandlerResult;

/// Trait implemented by every JSON-RPC service.
///
/// Each service handles one namespace of methods (e.g., "connection/*").
pub trait Service: Send + Sync {
    /// The namespace prefix this service handles (e.g., "connection", "seb").
    fn namespace(&self) -> &str;

    /// Handle a JSON-RPC request within this service's namespace.
    ///
    /// `method` is the full method string (e.g., "seb/ping").
    fn handle(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> impl std::future::Future<Output = HandlerResult> + Send;

    /// Initialize the service (called once at startup).
    fn init(&self) -> impl std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send {
        async { Ok(()) }
    }

    /// Shutdown the service (called once at server shutdown).
    fn shutdown(&self) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }
}
