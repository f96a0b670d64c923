//! SessionManager — the session subsystem wired together.
//!
//! Owns one instance of each component and the collaborator handles, and
//! adds the cross-component steps: liveness tracking on establish, room
//! marking on activation, version checks, event ingestion, and exam end.

use std::sync::Arc;

use seb_protocol::{
    ClientConnection, ClientEvent, ClientInstruction, ConnectionStatus, ConnectionUpdate, EventKind, InstructionKind,
    MonitoringEvent, ProctoringRoom, SessionError, WireEvent,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::exam::{ExamDirectory, InMemoryExamDirectory};
use crate::instruction::{CleanupReport, InstructionQueue};
use crate::notification::NotificationCache;
use crate::persistence::{InMemoryPersistence, SessionPersistence};
use crate::ping::{PingMonitor, SweepReport};
use crate::proctoring::{InMemoryProctoringBackend, ProctoringBackend, ProctoringRoomAssignor, ReconcileReport};
use crate::retry::with_retry;
use crate::state::EstablishRequest;
use crate::store::{ConnectionStore, NewConnection};
use crate::version::{AcceptAnyVersion, ClientVersionPolicy, MinimumVersionPolicy};

/// Capacity of the monitoring event channel.
const MONITORING_CHANNEL_CAPACITY: usize = 1024;

/// Default subject of a town-hall room.
pub const TOWNHALL_SUBJECT: &str = "Town-hall";

/// Result of ending an exam.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExamEndReport {
    pub closed: usize,
    pub failed: Vec<String>,
    pub rooms_disposed: usize,
}

pub struct SessionManager {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    persistence: Arc<dyn SessionPersistence>,
    exams: Arc<dyn ExamDirectory>,
    version_policy: Arc<dyn ClientVersionPolicy>,
    store: Arc<ConnectionStore>,
    ping: PingMonitor,
    instructions: Arc<InstructionQueue>,
    notifications: Arc<NotificationCache>,
    proctoring: ProctoringRoomAssignor,
    events: broadcast::Sender<MonitoringEvent>,
}

impl SessionManager {
    pub fn new<B: ProctoringBackend + 'static>(
        config: SessionConfig,
        persistence: Arc<dyn SessionPersistence>,
        exams: Arc<dyn ExamDirectory>,
        clock: Arc<dyn Clock>,
        backend: B,
    ) -> Self {
        let (events, _) = broadcast::channel(MONITORING_CHANNEL_CAPACITY);
        let retries = config.store_retry_attempts;

        let store = Arc::new(ConnectionStore::new(
            persistence.clone(),
            exams.clone(),
            clock.clone(),
            events.clone(),
            retries,
            config.lock_timeout(),
        ));
        let instructions = Arc::new(InstructionQueue::new(
            persistence.clone(),
            clock.clone(),
            retries,
            config.instruction_ttl_ms,
        ));
        let notifications = Arc::new(NotificationCache::new(persistence.clone(), retries));
        let ping = PingMonitor::new(
            store.clone(),
            instructions.clone(),
            notifications.clone(),
            events.clone(),
            config.ping_threshold_ms,
        );
        let proctoring = ProctoringRoomAssignor::new(
            backend,
            store.clone(),
            exams.clone(),
            instructions.clone(),
            persistence.clone(),
            config.collecting_room_capacity,
            retries,
        );
        let version_policy: Arc<dyn ClientVersionPolicy> = match &config.minimum_seb_version {
            Some(minimum) => Arc::new(MinimumVersionPolicy::new(minimum)),
            None => Arc::new(AcceptAnyVersion),
        };

        Self {
            config,
            clock,
            persistence,
            exams,
            version_policy,
            store,
            ping,
            instructions,
            notifications,
            proctoring,
            events,
        }
    }

    /// Everything in memory, with exams taken from the config.
    pub fn in_memory(config: SessionConfig) -> Self {
        let exams = Arc::new(InMemoryExamDirectory::with_exams(config.exams.clone()));
        Self::new(
            config,
            Arc::new(InMemoryPersistence::new()),
            exams,
            Arc::new(SystemClock),
            InMemoryProctoringBackend::new("https://proctoring.local"),
        )
    }

    pub fn with_version_policy(mut self, policy: Arc<dyn ClientVersionPolicy>) -> Self {
        self.version_policy = policy;
        self
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &ConnectionStore {
        &self.store
    }

    pub fn ping_monitor(&self) -> &PingMonitor {
        &self.ping
    }

    pub fn instructions(&self) -> &InstructionQueue {
        &self.instructions
    }

    pub fn notifications(&self) -> &NotificationCache {
        &self.notifications
    }

    pub fn proctoring(&self) -> &ProctoringRoomAssignor {
        &self.proctoring
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.events.subscribe()
    }

    // ── Connection lifecycle ──────────────────────────────────────────────

    pub fn create_connection(&self, request: NewConnection) -> Result<ClientConnection, SessionError> {
        let connection = self.store.create_connection(request)?;
        self.enforce_version(connection)
    }

    pub fn update_connection(&self, token: &str, update: &ConnectionUpdate) -> Result<ClientConnection, SessionError> {
        let connection = self.store.update_connection(token, update)?;
        if update.seb_version.is_some() {
            return self.enforce_version(connection);
        }
        Ok(connection)
    }

    pub fn establish_connection(&self, token: &str, request: &EstablishRequest) -> Result<ClientConnection, SessionError> {
        let connection = self.store.establish_connection(token, request)?;
        self.ping.track(token, connection.id, self.clock.now_ms());

        if connection.status == ConnectionStatus::Active {
            if let Some(exam) = connection.exam_id.and_then(|id| self.exams.exam(id)) {
                if exam.proctoring_enabled {
                    self.proctoring.mark_for_assignment(token, exam.id);
                }
            }
        }
        Ok(connection)
    }

    pub fn close_connection(&self, token: &str, institution_id: u64, client_address: &str) -> Result<ClientConnection, SessionError> {
        let connection = self.store.close_connection(token, institution_id, client_address)?;
        self.release(&connection);
        Ok(connection)
    }

    pub fn disable_connection(&self, token: &str, institution_id: u64) -> Result<ClientConnection, SessionError> {
        let connection = self.store.disable_connection(token, institution_id)?;
        self.release(&connection);
        Ok(connection)
    }

    pub fn disable_connections(&self, tokens: &[String], institution_id: u64) -> Vec<(String, Result<ClientConnection, SessionError>)> {
        let results = self.store.disable_connections(tokens, institution_id);
        for connection in results.iter().filter_map(|(_, r)| r.as_ref().ok()) {
            self.release(connection);
        }
        results
    }

    pub fn close_connections_of_exam(&self, exam_id: u64) -> Vec<(String, Result<ClientConnection, SessionError>)> {
        let results = self.store.close_connections_of_exam(exam_id);
        for connection in results.iter().filter_map(|(_, r)| r.as_ref().ok()) {
            self.release(connection);
        }
        results
    }

    pub fn get_connection(&self, token: &str) -> Result<ClientConnection, SessionError> {
        self.store.get(token)
    }

    pub fn connections_for_exam(&self, exam_id: u64) -> Vec<ClientConnection> {
        self.store.connections_for_exam(exam_id)
    }

    /// Close every connection of the exam, then release its rooms.
    pub async fn end_exam(&self, exam_id: u64) -> Result<ExamEndReport, SessionError> {
        let results = self.close_connections_of_exam(exam_id);
        let failed: Vec<String> = results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(token, _)| token.clone())
            .collect();
        let rooms_disposed = self.proctoring.dispose_rooms_for_exam(exam_id).await?;

        let report = ExamEndReport {
            closed: results.len() - failed.len(),
            failed,
            rooms_disposed,
        };
        info!(
            "Exam {} ended: {} closed, {} failed, {} rooms disposed",
            exam_id,
            report.closed,
            report.failed.len(),
            report.rooms_disposed
        );
        Ok(report)
    }

    // ── Client calls ──────────────────────────────────────────────────────

    /// Ping at the server's current time.
    pub fn notify_ping(&self, token: &str, ping_number: u64) -> Result<Option<ClientInstruction>, SessionError> {
        self.ping.notify_ping(token, self.clock.now_ms(), ping_number)
    }

    /// Store a client event. Notification events invalidate the pending
    /// indicator after the write; a client-side confirmation confirms the
    /// referenced notification.
    pub fn notify_client_event(&self, token: &str, event: WireEvent) -> Result<ClientEvent, SessionError> {
        let connection = self.store.get(token)?;
        let mut event = event.decode(connection.id, self.clock.now_ms())?;

        event.id = with_retry(self.config.store_retry_attempts, "append event", || {
            self.persistence.append_event(&event)
        })?;

        match event.kind {
            EventKind::Notification { notification, .. } => {
                self.notifications.invalidate(connection.id);
                info!("Notification {:?} from {} (event {})", notification, token, event.id);
            }
            EventKind::NotificationConfirmed => {
                if let Some(id) = event.confirmed_notification_id() {
                    self.notifications.confirm_pending_notification(id, connection.id)?;
                }
            }
            EventKind::ErrorLog => warn!("Client {} reported: {}", token, event.text.as_deref().unwrap_or_default()),
            _ => {}
        }
        Ok(event)
    }

    // ── Instructions ──────────────────────────────────────────────────────

    /// Queue an instruction for known connections.
    pub fn register_instruction(
        &self,
        exam_id: u64,
        kind: InstructionKind,
        tokens: &[String],
        needs_confirmation: bool,
    ) -> Result<Vec<ClientInstruction>, SessionError> {
        if tokens.is_empty() {
            return Err(SessionError::validation("at least one connection token is required"));
        }
        for token in tokens {
            self.store.get(token)?;
        }
        self.instructions
            .register_instruction(exam_id, kind, tokens.iter().map(String::as_str), needs_confirmation)
    }

    pub fn confirm_instruction(&self, token: &str, confirm_id: &str) -> bool {
        self.instructions.confirm_instruction_done(token, confirm_id)
    }

    pub fn awaiting_confirmation(&self, token: &str) -> Vec<ClientInstruction> {
        self.instructions.awaiting_confirmation(token)
    }

    // ── Notifications ─────────────────────────────────────────────────────

    pub fn has_pending_notification(&self, token: &str) -> Result<bool, SessionError> {
        let connection = self.store.get(token)?;
        self.notifications.has_any_pending_notification(connection.id)
    }

    pub fn pending_notifications(&self, token: &str) -> Result<Vec<ClientEvent>, SessionError> {
        let connection = self.store.get(token)?;
        self.notifications.get_pending_notifications(connection.id)
    }

    /// Operator confirmation. The client is told to lower its hand or
    /// unlock via a NOTIFICATION_CONFIRM instruction.
    pub fn confirm_notification(&self, token: &str, notification_id: u64) -> Result<bool, SessionError> {
        let connection = self.store.get(token)?;
        let confirmed = self
            .notifications
            .confirm_pending_notification(notification_id, connection.id)?;

        if confirmed && !connection.status.is_terminal() {
            self.instructions.register_instruction(
                connection.exam_id.unwrap_or_default(),
                InstructionKind::NotificationConfirm { notification_id },
                [token],
                false,
            )?;
        }
        Ok(confirmed)
    }

    // ── Proctoring ────────────────────────────────────────────────────────

    pub async fn rooms(&self, exam_id: u64) -> Result<Vec<ProctoringRoom>, SessionError> {
        self.proctoring.rooms(exam_id).await
    }

    pub async fn create_break_out_room(&self, exam_id: u64, subject: &str, tokens: &[String]) -> Result<ProctoringRoom, SessionError> {
        self.proctoring.create_break_out_room(exam_id, subject, tokens).await
    }

    pub async fn close_proctoring_room(&self, exam_id: u64, room_name: &str) -> Result<ProctoringRoom, SessionError> {
        self.proctoring.close_proctoring_room(exam_id, room_name).await
    }

    pub async fn open_townhall(&self, exam_id: u64, subject: Option<&str>) -> Result<ProctoringRoom, SessionError> {
        self.proctoring
            .open_townhall(exam_id, subject.unwrap_or(TOWNHALL_SUBJECT))
            .await
    }

    // ── Monitoring ────────────────────────────────────────────────────────

    pub fn incidents(&self) -> Vec<String> {
        self.ping.incidents()
    }

    // ── Periodic work ─────────────────────────────────────────────────────

    pub fn sweep_pings(&self) -> SweepReport {
        self.ping.sweep_at(self.clock.now_ms())
    }

    pub async fn reconcile_rooms(&self) -> ReconcileReport {
        self.proctoring.reconcile().await
    }

    /// Expire instructions, then drop terminal connections from memory
    /// along with anything cached for them since they were released.
    pub fn cleanup(&self) -> CleanupReport {
        let report = self.instructions.cleanup_instructions_at(self.clock.now_ms(), &self.store);
        for connection_id in self.store.evict_terminal() {
            self.notifications.evict(connection_id);
        }
        report
    }

    /// Re-queue persisted instructions. Call once at startup.
    pub fn restore(&self) -> Result<usize, SessionError> {
        self.instructions.restore()
    }

    // ── Internal ──────────────────────────────────────────────────────────

    /// Reject a client whose SEB version the policy refuses: queue a quit
    /// and disable the connection if it was never established.
    fn enforce_version(&self, connection: ClientConnection) -> Result<ClientConnection, SessionError> {
        let Some(version) = connection.seb_version.as_deref() else {
            return Ok(connection);
        };
        if self.version_policy.accepts(version) {
            return Ok(connection);
        }

        let token = connection.connection_token.clone();
        warn!("Rejecting {}: SEB version {} is not allowed", token, version);
        self.instructions.register_instruction(
            connection.exam_id.unwrap_or_default(),
            InstructionKind::Quit,
            [token.as_str()],
            false,
        )?;

        if connection.is_established() {
            return Ok(connection);
        }
        let disabled = self.store.disable_unestablished(&token)?;
        self.release(&disabled);
        Ok(disabled)
    }

    /// Stop tracking a connection that reached a terminal state.
    fn release(&self, connection: &ClientConnection) {
        let token = connection.connection_token.as_str();
        self.ping.forget(token);
        self.proctoring.forget(token);
        self.notifications.evict(connection.id);
    }
}
