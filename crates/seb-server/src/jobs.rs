//! The periodic session jobs.

use std::sync::Arc;
use std::time::Duration;

use seb_services::SessionManager;
use tracing::debug;

use crate::scheduler::{Job, JobError};

/// Flags connections whose last ping is older than the threshold.
pub struct PingSweepJob {
    manager: Arc<SessionManager>,
}

impl PingSweepJob {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

impl Job for PingSweepJob {
    fn name(&self) -> &str {
        "ping-sweep"
    }

    fn interval(&self) -> Duration {
        self.manager.config().ping_sweep_interval()
    }

    async fn run(&self) -> Result<(), JobError> {
        self.manager.sweep_pings();
        Ok(())
    }
}

/// Assigns waiting connections to proctoring rooms.
pub struct RoomReconcileJob {
    manager: Arc<SessionManager>,
}

impl RoomReconcileJob {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

impl Job for RoomReconcileJob {
    fn name(&self) -> &str {
        "proctoring-reconcile"
    }

    fn interval(&self) -> Duration {
        self.manager.config().proctoring_interval()
    }

    async fn run(&self) -> Result<(), JobError> {
        let report = self.manager.reconcile_rooms().await;
        if report.failures > 0 {
            return Err(format!(
                "{} of {} exams had failures ({} assigned)",
                report.failures, report.exams, report.assigned
            )
            .into());
        }
        Ok(())
    }
}

/// Expires queued instructions and evicts terminal connections.
pub struct InstructionCleanupJob {
    manager: Arc<SessionManager>,
}

impl InstructionCleanupJob {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

impl Job for InstructionCleanupJob {
    fn name(&self) -> &str {
        "instruction-cleanup"
    }

    fn interval(&self) -> Duration {
        self.manager.config().instruction_cleanup_interval()
    }

    async fn run(&self) -> Result<(), JobError> {
        let report = self.manager.cleanup();
        debug!("Cleanup removed {} expired instructions", report.expired);
        Ok(())
    }
}
