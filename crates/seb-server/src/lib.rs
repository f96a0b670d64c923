//! SEB Session Server — routes JSON-RPC requests to service adapters and
//! drives the periodic session jobs.
//!
//! The server owns all services, runs the middleware hooks around each
//! request, and provides the `RequestHandler` implementation for the
//! transport layer. The
//! scheduler runs ping sweeps, room reconciliation and instruction cleanup
//! on their own intervals, never on a request path.

pub mod jobs;
pub mod middleware;
pub mod router;
pub mod scheduler;

pub use jobs::{InstructionCleanupJob, PingSweepJob, RoomReconcileJob};
pub use middleware::{Middleware, MiddlewareChain, RequestLogMiddleware};
pub use router::SessionServer;
pub use scheduler::{Job, JobError, Scheduler, SchedulerHandle};
