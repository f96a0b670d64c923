//! ConnectionStore — concurrent registry of connection state keyed by token.
//!
//! Every entry sits behind its own lock. A mutation takes that lock, reads
//! the current record, runs the pure transition from [`crate::state`],
//! writes through to persistence, and only then replaces the in-memory
//! record and bumps its `version`. Two mutations on one token therefore
//! never interleave, and a failed durable write leaves memory untouched.
//! A mutation that cannot get the lock within `lock_timeout` fails with the
//! retryable [`SessionError::Conflict`].
//!
//! Only this module writes `status`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use seb_protocol::{ClientConnection, ConnectionStatus, ConnectionUpdate, MonitoringEvent, SessionError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::exam::ExamDirectory;
use crate::persistence::SessionPersistence;
use crate::retry::with_retry;
use crate::state::{self, EstablishRequest};

/// Parameters of a create call. `institution_id` is optional here so the
/// missing-field case reaches validation instead of failing to decode.
#[derive(Debug, Clone, Default)]
pub struct NewConnection {
    pub institution_id: Option<u64>,
    pub client_address: String,
    pub exam_id: Option<u64>,
    pub seb_version: Option<String>,
    pub os_name: Option<String>,
    pub machine_name: Option<String>,
    pub client_id_tag: Option<String>,
}

type Slot = Arc<Mutex<ClientConnection>>;

pub struct ConnectionStore {
    entries: DashMap<String, Slot>,
    persistence: Arc<dyn SessionPersistence>,
    exams: Arc<dyn ExamDirectory>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MonitoringEvent>,
    retry_attempts: u32,
    lock_timeout: Duration,
}

impl ConnectionStore {
    pub fn new(
        persistence: Arc<dyn SessionPersistence>,
        exams: Arc<dyn ExamDirectory>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<MonitoringEvent>,
        retry_attempts: u32,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            persistence,
            exams,
            clock,
            events,
            retry_attempts,
            lock_timeout,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub fn create_connection(&self, request: NewConnection) -> Result<ClientConnection, SessionError> {
        let institution_id = request
            .institution_id
            .ok_or_else(|| SessionError::validation("institutionId is required"))?;
        if let Some(exam_id) = request.exam_id {
            self.check_exam(exam_id, institution_id)?;
        }

        let mut token = uuid::Uuid::new_v4().to_string();
        while self.entries.contains_key(&token) {
            token = uuid::Uuid::new_v4().to_string();
        }

        let mut connection = ClientConnection {
            id: 0,
            connection_token: token.clone(),
            institution_id,
            exam_id: request.exam_id,
            status: ConnectionStatus::ConnectionRequested,
            user_session_id: None,
            client_address: request.client_address,
            virtual_client_address: None,
            seb_version: request.seb_version,
            os_name: request.os_name,
            machine_name: request.machine_name,
            client_id_tag: request.client_id_tag,
            creation_time: self.clock.now_ms(),
            version: 1,
        };
        connection.id = with_retry(self.retry_attempts, "create connection", || {
            self.persistence.create_connection(&connection)
        })?;

        match self.entries.entry(token.clone()) {
            Entry::Occupied(_) => return Err(SessionError::Conflict(token)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(connection.clone())));
            }
        }

        info!(
            "Connection created: {} (institution {}, address {})",
            token, institution_id, connection.client_address
        );
        self.publish_status(&token, ConnectionStatus::Undefined, ConnectionStatus::ConnectionRequested);
        Ok(connection)
    }

    pub fn update_connection(&self, token: &str, update: &ConnectionUpdate) -> Result<ClientConnection, SessionError> {
        self.mutate(token, |current| {
            if let Some(exam_id) = update.exam_id.filter(|id| current.exam_id != Some(*id)) {
                self.check_exam(exam_id, current.institution_id)?;
            }
            let exam = update.exam_id.or(current.exam_id);
            let vdi = exam.is_some_and(|id| self.exams.is_vdi(id));
            state::apply_update(current, update, vdi).map(Some)
        })
    }

    pub fn establish_connection(&self, token: &str, request: &EstablishRequest) -> Result<ClientConnection, SessionError> {
        self.mutate(token, |current| {
            if let (None, Some(exam_id)) = (current.exam_id, request.exam_id) {
                self.check_exam(exam_id, current.institution_id)?;
            }
            state::apply_establish(current, request, |exam| self.exams.is_vdi(exam)).map(Some)
        })
    }

    /// Idempotent: closing a closed connection returns it unchanged.
    pub fn close_connection(&self, token: &str, institution_id: u64, client_address: &str) -> Result<ClientConnection, SessionError> {
        self.mutate(token, |current| {
            if !current.matches_address(client_address) {
                debug!("Close for {} from unrecorded address {}", token, client_address);
            }
            state::apply_close(current, institution_id)
        })
    }

    pub fn disable_connection(&self, token: &str, institution_id: u64) -> Result<ClientConnection, SessionError> {
        self.mutate(token, |current| state::apply_disable(current, Some(institution_id)))
    }

    /// Disable on behalf of the server, e.g. a failed version check.
    pub fn disable_unestablished(&self, token: &str) -> Result<ClientConnection, SessionError> {
        self.mutate(token, |current| state::apply_disable(current, None))
    }

    /// Each token is processed independently; one failure does not stop the rest.
    pub fn disable_connections(&self, tokens: &[String], institution_id: u64) -> Vec<(String, Result<ClientConnection, SessionError>)> {
        tokens
            .iter()
            .map(|token| (token.clone(), self.disable_connection(token, institution_id)))
            .collect()
    }

    /// Close every non-terminal connection of an exam, continuing past failures.
    pub fn close_connections_of_exam(&self, exam_id: u64) -> Vec<(String, Result<ClientConnection, SessionError>)> {
        let tokens: Vec<String> = self
            .connections_for_exam(exam_id)
            .into_iter()
            .filter(|c| !c.status.is_terminal())
            .map(|c| c.connection_token)
            .collect();

        let results: Vec<_> = tokens
            .into_iter()
            .map(|token| {
                let result = self.mutate(&token, state::apply_server_close);
                (token, result)
            })
            .collect();

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!("Closed connections of exam {}: {} processed, {} failed", exam_id, results.len(), failed);
        results
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// Current record, loading it from persistence if it is not cached.
    pub fn get(&self, token: &str) -> Result<ClientConnection, SessionError> {
        let slot = self.slot(token)?;
        let record = slot.lock().clone();
        Ok(record)
    }

    /// Cached record only; never touches persistence.
    pub fn peek(&self, token: &str) -> Option<ClientConnection> {
        let slot = self.entries.get(token).map(|s| s.value().clone())?;
        let record = slot.lock().clone();
        Some(record)
    }

    pub fn status(&self, token: &str) -> Option<ConnectionStatus> {
        self.peek(token).map(|c| c.status)
    }

    /// Status from the cache, else from persistence. Unlike [`Self::get`]
    /// a durable hit is not brought back into memory.
    pub fn lookup_status(&self, token: &str) -> Result<Option<ConnectionStatus>, SessionError> {
        if let Some(status) = self.status(token) {
            return Ok(Some(status));
        }
        let stored = with_retry(self.retry_attempts, "load connection", || {
            self.persistence.load_connection(token)
        })?;
        Ok(stored.map(|c| c.status))
    }

    pub fn connections_for_exam(&self, exam_id: u64) -> Vec<ClientConnection> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.exam_id == Some(exam_id))
            .collect()
    }

    /// Point-in-time list of tokens in AUTHENTICATED or ACTIVE.
    pub fn established_tokens(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.is_established())
            .map(|c| c.connection_token)
            .collect()
    }

    pub fn active_tokens_for_exam(&self, exam_id: u64) -> Vec<String> {
        self.connections_for_exam(exam_id)
            .into_iter()
            .filter(|c| c.status == ConnectionStatus::Active)
            .map(|c| c.connection_token)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop terminal connections from memory and return their ids. They
    /// stay durable and are reloaded on demand by [`Self::get`].
    pub fn evict_terminal(&self) -> Vec<u64> {
        let mut evicted = Vec::new();
        self.entries.retain(|_, slot| match slot.try_lock() {
            Some(record) if record.status.is_terminal() => {
                evicted.push(record.id);
                false
            }
            _ => true,
        });
        if !evicted.is_empty() {
            debug!("Evicted {} terminal connections from memory", evicted.len());
        }
        evicted
    }

    // ── Internal ──────────────────────────────────────────────────────────

    /// The exam must exist and belong to the connection's institution
    /// before a connection may bind to it.
    fn check_exam(&self, exam_id: u64, institution_id: u64) -> Result<(), SessionError> {
        match self.exams.exam(exam_id) {
            Some(exam) if exam.institution_id != institution_id => Err(SessionError::validation(format!(
                "exam {exam_id} does not belong to institution {institution_id}"
            ))),
            Some(_) => Ok(()),
            None => Err(SessionError::validation(format!("unknown exam {exam_id}"))),
        }
    }

    /// Clone the records without holding any map lock across the whole pass.
    fn snapshot(&self) -> Vec<ClientConnection> {
        let slots: Vec<Slot> = self.entries.iter().map(|e| e.value().clone()).collect();
        slots.into_iter().map(|slot| slot.lock().clone()).collect()
    }

    fn slot(&self, token: &str) -> Result<Slot, SessionError> {
        if let Some(slot) = self.entries.get(token) {
            return Ok(slot.value().clone());
        }
        let loaded = with_retry(self.retry_attempts, "load connection", || {
            self.persistence.load_connection(token)
        })?
        .ok_or_else(|| SessionError::not_found(format!("connection {token}")))?;

        debug!("Connection {} reloaded from persistence", token);
        let slot = self
            .entries
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .value()
            .clone();
        Ok(slot)
    }

    /// Read-validate-write under the token's lock. `transition` returns
    /// `None` for an idempotent no-op.
    fn mutate<F>(&self, token: &str, transition: F) -> Result<ClientConnection, SessionError>
    where
        F: FnOnce(&ClientConnection) -> Result<Option<ClientConnection>, SessionError>,
    {
        let slot = self.slot(token)?;
        let Some(mut guard) = slot.try_lock_for(self.lock_timeout) else {
            warn!("Lock timeout on connection {}", token);
            return Err(SessionError::Conflict(token.to_string()));
        };

        let current = guard.clone();
        let Some(mut next) = transition(&current)? else {
            return Ok(current);
        };
        next.version = current.version + 1;

        with_retry(self.retry_attempts, "save connection", || self.persistence.save_connection(&next))?;
        *guard = next.clone();
        drop(guard);

        if current.status != next.status {
            info!("Connection {}: {} -> {}", token, current.status, next.status);
            self.publish_status(token, current.status, next.status);
        }
        Ok(next)
    }

    fn publish_status(&self, token: &str, from: ConnectionStatus, to: ConnectionStatus) {
        // No subscribers is fine.
        let _ = self.events.send(MonitoringEvent::StatusChanged {
            token: token.to_string(),
            from,
            to,
        });
    }
}
