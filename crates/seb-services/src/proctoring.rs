//! ProctoringRoomAssignor — batch reconciliation of proctoring rooms.
//!
//! Room changes for one exam are serialized by that exam's lock. The
//! periodic [`ProctoringRoomAssignor::reconcile`] pass and the operator
//! actions (break-out, close, town-hall, disposal) all take it, so two
//! callers can never both create the exam's collecting room.
//!
//! Per moved member the order is: queue LEAVE/JOIN instructions, persist
//! the affected rooms, then commit them in memory. If the target room
//! cannot be saved, the source room is saved back as it was. A member whose
//! move fails stays marked and is retried on the next pass; JOIN and LEAVE
//! are safe to resend.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use seb_protocol::{
    ConnectionStatus, InstructionKind, ProctoringAction, ProctoringRoom, RoomAccess, RoomType, SessionError,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::exam::ExamDirectory;
use crate::instruction::InstructionQueue;
use crate::persistence::SessionPersistence;
use crate::retry::with_retry;
use crate::store::ConnectionStore;

/// The remote meeting service that actually hosts rooms.
pub trait ProctoringBackend: Send + Sync {
    /// Create the room remotely and return what clients need to join it.
    fn provision_room(&self, room: &ProctoringRoom) -> impl Future<Output = Result<RoomAccess, String>> + Send;

    fn dispose_room(&self, room: &ProctoringRoom) -> impl Future<Output = Result<(), String>> + Send;
}

impl<B: ProctoringBackend> ProctoringBackend for Arc<B> {
    fn provision_room(&self, room: &ProctoringRoom) -> impl Future<Output = Result<RoomAccess, String>> + Send {
        self.as_ref().provision_room(room)
    }

    fn dispose_room(&self, room: &ProctoringRoom) -> impl Future<Output = Result<(), String>> + Send {
        self.as_ref().dispose_room(room)
    }
}

/// Object-safe wrapper for the ProctoringBackend trait.
trait ProctoringBackendDyn: Send + Sync {
    fn provision_dyn<'a>(
        &'a self,
        room: &'a ProctoringRoom,
    ) -> Pin<Box<dyn Future<Output = Result<RoomAccess, String>> + Send + 'a>>;
    fn dispose_dyn<'a>(&'a self, room: &'a ProctoringRoom) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;
}

impl<T: ProctoringBackend> ProctoringBackendDyn for T {
    fn provision_dyn<'a>(
        &'a self,
        room: &'a ProctoringRoom,
    ) -> Pin<Box<dyn Future<Output = Result<RoomAccess, String>> + Send + 'a>> {
        Box::pin(self.provision_room(room))
    }
    fn dispose_dyn<'a>(&'a self, room: &'a ProctoringRoom) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(self.dispose_room(room))
    }
}

/// Backend that hands out local room tokens without talking to anything.
pub struct InMemoryProctoringBackend {
    server_url: String,
    provisioned: DashMap<String, RoomAccess>,
    unavailable: AtomicBool,
}

impl InMemoryProctoringBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            provisioned: DashMap::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make provisioning fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn provisioned_count(&self) -> usize {
        self.provisioned.len()
    }

    pub fn is_provisioned(&self, room_name: &str) -> bool {
        self.provisioned.contains_key(room_name)
    }
}

impl ProctoringBackend for InMemoryProctoringBackend {
    async fn provision_room(&self, room: &ProctoringRoom) -> Result<RoomAccess, String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(format!("meeting service unavailable, cannot provision {}", room.name));
        }
        let access = RoomAccess {
            server_url: self.server_url.clone(),
            room_token: uuid::Uuid::new_v4().simple().to_string(),
        };
        self.provisioned.insert(room.name.clone(), access.clone());
        Ok(access)
    }

    async fn dispose_room(&self, room: &ProctoringRoom) -> Result<(), String> {
        self.provisioned.remove(&room.name);
        Ok(())
    }
}

/// Rooms of one exam. Guarded by the exam's lock.
#[derive(Default)]
struct ExamRooms {
    loaded: bool,
    rooms: BTreeMap<String, ProctoringRoom>,
    /// The collecting room that survives while the exam runs.
    default_collecting: Option<String>,
    /// Rooms that lost a member during the current pass.
    vacated: BTreeSet<String>,
}

impl ExamRooms {
    fn room_of(&self, token: &str) -> Option<String> {
        self.rooms
            .values()
            .find(|r| r.members.contains(token))
            .map(|r| r.name.clone())
    }

    fn townhall(&self) -> Option<&ProctoringRoom> {
        self.rooms.values().find(|r| r.room_type == RoomType::Townhall)
    }

    /// Collecting rooms, default first.
    fn collecting(&self) -> Vec<&ProctoringRoom> {
        let mut rooms: Vec<&ProctoringRoom> = self
            .rooms
            .values()
            .filter(|r| r.room_type == RoomType::Collecting)
            .collect();
        rooms.sort_by_key(|r| Some(&r.name) != self.default_collecting.as_ref());
        rooms
    }

    fn is_default(&self, name: &str) -> bool {
        self.default_collecting.as_deref() == Some(name)
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub exams: usize,
    pub assigned: usize,
    pub pruned: usize,
    pub disposed: usize,
    pub failures: usize,
}

impl ReconcileReport {
    fn merge(&mut self, other: ReconcileReport) {
        self.exams += other.exams;
        self.assigned += other.assigned;
        self.pruned += other.pruned;
        self.disposed += other.disposed;
        self.failures += other.failures;
    }
}

pub struct ProctoringRoomAssignor {
    exam_rooms: DashMap<u64, Arc<Mutex<ExamRooms>>>,
    /// token -> exam id of connections waiting for a room.
    pending: DashMap<String, u64>,
    store: Arc<ConnectionStore>,
    exams: Arc<dyn ExamDirectory>,
    instructions: Arc<InstructionQueue>,
    persistence: Arc<dyn SessionPersistence>,
    backend: Box<dyn ProctoringBackendDyn>,
    collecting_capacity: usize,
    retry_attempts: u32,
}

impl ProctoringRoomAssignor {
    pub fn new<B: ProctoringBackend + 'static>(
        backend: B,
        store: Arc<ConnectionStore>,
        exams: Arc<dyn ExamDirectory>,
        instructions: Arc<InstructionQueue>,
        persistence: Arc<dyn SessionPersistence>,
        collecting_capacity: usize,
        retry_attempts: u32,
    ) -> Self {
        Self {
            exam_rooms: DashMap::new(),
            pending: DashMap::new(),
            store,
            exams,
            instructions,
            persistence,
            backend: Box::new(backend),
            collecting_capacity,
            retry_attempts,
        }
    }

    /// Flag a connection for the next reconciliation pass.
    pub fn mark_for_assignment(&self, token: &str, exam_id: u64) {
        debug!("Connection {} marked for room assignment in exam {}", token, exam_id);
        self.pending.insert(token.to_string(), exam_id);
    }

    pub fn is_marked(&self, token: &str) -> bool {
        self.pending.contains_key(token)
    }

    pub fn forget(&self, token: &str) {
        self.pending.remove(token);
    }

    /// Assign every marked ACTIVE connection of every proctored exam.
    /// One exam's failure never stops the others.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.pending
            .retain(|token, _| self.store.status(token) == Some(ConnectionStatus::Active));

        let mut report = ReconcileReport::default();
        for exam_id in self.exams.proctored_exams() {
            match self.reconcile_exam(exam_id).await {
                Ok(exam_report) => report.merge(exam_report),
                Err(e) => {
                    warn!("Room reconciliation for exam {} failed: {}", exam_id, e);
                    report.failures += 1;
                }
            }
        }

        if report.assigned + report.pruned + report.disposed + report.failures > 0 {
            info!(
                "Proctoring reconcile: {} assigned, {} pruned, {} disposed, {} failures",
                report.assigned, report.pruned, report.disposed, report.failures
            );
        }
        report
    }

    async fn reconcile_exam(&self, exam_id: u64) -> Result<ReconcileReport, SessionError> {
        let lock = self.exam_lock(exam_id);
        let mut rooms = lock.lock().await;
        self.ensure_loaded(exam_id, &mut rooms)?;

        let mut report = ReconcileReport {
            exams: 1,
            pruned: self.prune(exam_id, &mut rooms),
            ..Default::default()
        };

        let waiting: Vec<String> = self
            .store
            .active_tokens_for_exam(exam_id)
            .into_iter()
            .filter(|token| self.pending.get(token).is_some_and(|e| *e == exam_id))
            .collect();

        for token in waiting {
            let target = match self.target_room(exam_id, &mut rooms).await {
                Ok(target) => target,
                Err(e) => {
                    warn!("No room available in exam {}: {}", exam_id, e);
                    report.failures += 1;
                    break;
                }
            };
            match self.move_member(exam_id, &mut rooms, &token, &target) {
                Ok(()) => {
                    self.pending.remove(&token);
                    report.assigned += 1;
                }
                Err(e) => {
                    warn!("Assigning {} to room {} failed: {}", token, target, e);
                    report.failures += 1;
                }
            }
        }

        report.disposed = self.dispose_vacated(exam_id, &mut rooms).await;
        Ok(report)
    }

    /// Operator action: open a break-out room and move the given active
    /// connections into it.
    pub async fn create_break_out_room(
        &self,
        exam_id: u64,
        subject: &str,
        tokens: &[String],
    ) -> Result<ProctoringRoom, SessionError> {
        self.require_proctored(exam_id)?;
        if tokens.is_empty() {
            return Err(SessionError::validation("a break-out room needs at least one connection"));
        }
        for token in tokens {
            let connection = self.store.get(token)?;
            if connection.status != ConnectionStatus::Active || connection.exam_id != Some(exam_id) {
                return Err(SessionError::state_conflict(format!(
                    "connection {token} is not active in exam {exam_id}"
                )));
            }
        }

        let lock = self.exam_lock(exam_id);
        let mut rooms = lock.lock().await;
        self.ensure_loaded(exam_id, &mut rooms)?;

        let name = self.open_room(exam_id, &mut rooms, RoomType::BreakOut, subject).await?;
        for token in tokens {
            self.pending.remove(token);
            if let Err(e) = self.move_member(exam_id, &mut rooms, token, &name) {
                warn!("Moving {} to break-out room {} failed: {}", token, name, e);
                self.mark_for_assignment(token, exam_id);
            }
        }
        self.dispose_vacated(exam_id, &mut rooms).await;

        rooms
            .rooms
            .get(&name)
            .cloned()
            .ok_or_else(|| SessionError::not_found(format!("room {name}")))
    }

    /// Operator action: close a room. Members are told to leave, get their
    /// proctoring settings reset, and are marked to rejoin a collecting room.
    pub async fn close_proctoring_room(&self, exam_id: u64, room_name: &str) -> Result<ProctoringRoom, SessionError> {
        let lock = self.exam_lock(exam_id);
        let mut rooms = lock.lock().await;
        self.ensure_loaded(exam_id, &mut rooms)?;

        let room = rooms
            .rooms
            .get(room_name)
            .cloned()
            .ok_or_else(|| SessionError::not_found(format!("room {room_name} of exam {exam_id}")))?;
        if room.room_type == RoomType::Collecting && !room.is_empty() && self.exams.is_running(exam_id) {
            return Err(SessionError::state_conflict(format!(
                "collecting room {room_name} still has members while exam {exam_id} runs"
            )));
        }

        if !room.is_empty() {
            let members = room.members.iter().map(String::as_str);
            self.instructions
                .register_instruction(exam_id, leave(&room), members.clone(), false)?;
            self.instructions.register_instruction(
                exam_id,
                InstructionKind::ReconfigureSettings { settings_url: None, reset_proctoring: true },
                members,
                false,
            )?;
        }

        self.dispose_room(exam_id, &mut rooms, room_name).await?;
        for token in &room.members {
            self.mark_for_assignment(token, exam_id);
        }
        info!("Closed {:?} room {} of exam {} ({} members)", room.room_type, room_name, exam_id, room.size());
        Ok(room)
    }

    /// Operator action: open the exam's town-hall and move everyone there.
    /// Returns the open town-hall if there already is one.
    pub async fn open_townhall(&self, exam_id: u64, subject: &str) -> Result<ProctoringRoom, SessionError> {
        self.require_proctored(exam_id)?;

        let lock = self.exam_lock(exam_id);
        let mut rooms = lock.lock().await;
        self.ensure_loaded(exam_id, &mut rooms)?;

        if let Some(existing) = rooms.townhall() {
            return Ok(existing.clone());
        }
        let name = self.open_room(exam_id, &mut rooms, RoomType::Townhall, subject).await?;
        for token in self.store.active_tokens_for_exam(exam_id) {
            self.mark_for_assignment(&token, exam_id);
        }

        rooms
            .rooms
            .get(&name)
            .cloned()
            .ok_or_else(|| SessionError::not_found(format!("room {name}")))
    }

    /// Release the rooms of an exam. Empty rooms go immediately; the
    /// default collecting room stays while the exam is still running.
    pub async fn dispose_rooms_for_exam(&self, exam_id: u64) -> Result<usize, SessionError> {
        let lock = self.exam_lock(exam_id);
        let mut rooms = lock.lock().await;
        self.ensure_loaded(exam_id, &mut rooms)?;
        self.prune(exam_id, &mut rooms);

        let running = self.exams.is_running(exam_id);
        let names: Vec<String> = rooms
            .rooms
            .values()
            .filter(|r| {
                if running {
                    r.is_empty() && !rooms.is_default(&r.name)
                } else {
                    true
                }
            })
            .map(|r| r.name.clone())
            .collect();

        let mut disposed = 0;
        for name in names {
            match self.dispose_room(exam_id, &mut rooms, &name).await {
                Ok(()) => disposed += 1,
                Err(e) => warn!("Disposing room {} of exam {} failed: {}", name, exam_id, e),
            }
        }
        rooms.vacated.clear();
        if !running {
            self.pending.retain(|_, exam| *exam != exam_id);
        }
        info!("Disposed {} room(s) of exam {}", disposed, exam_id);
        Ok(disposed)
    }

    pub async fn rooms(&self, exam_id: u64) -> Result<Vec<ProctoringRoom>, SessionError> {
        let lock = self.exam_lock(exam_id);
        let mut rooms = lock.lock().await;
        self.ensure_loaded(exam_id, &mut rooms)?;
        Ok(rooms.rooms.values().cloned().collect())
    }

    // ── Internal ──────────────────────────────────────────────────────────

    fn exam_lock(&self, exam_id: u64) -> Arc<Mutex<ExamRooms>> {
        self.exam_rooms.entry(exam_id).or_default().value().clone()
    }

    fn require_proctored(&self, exam_id: u64) -> Result<(), SessionError> {
        match self.exams.exam(exam_id) {
            Some(exam) if exam.proctoring_enabled => Ok(()),
            Some(_) => Err(SessionError::validation(format!("exam {exam_id} has no proctoring enabled"))),
            None => Err(SessionError::validation(format!("unknown exam {exam_id}"))),
        }
    }

    fn ensure_loaded(&self, exam_id: u64, rooms: &mut ExamRooms) -> Result<(), SessionError> {
        if rooms.loaded {
            return Ok(());
        }
        let stored = with_retry(self.retry_attempts, "load rooms", || self.persistence.load_rooms_for_exam(exam_id))?;
        for room in stored {
            rooms.rooms.insert(room.name.clone(), room);
        }
        rooms.default_collecting = rooms
            .rooms
            .values()
            .find(|r| r.room_type == RoomType::Collecting && r.primary)
            .map(|r| r.name.clone());
        rooms.loaded = true;
        if !rooms.rooms.is_empty() {
            debug!("Loaded {} room(s) of exam {}", rooms.rooms.len(), exam_id);
        }
        Ok(())
    }

    /// Remove members that are no longer active in this exam.
    fn prune(&self, exam_id: u64, rooms: &mut ExamRooms) -> usize {
        let mut pruned = 0;
        let names: Vec<String> = rooms.rooms.keys().cloned().collect();
        for name in names {
            let Some(room) = rooms.rooms.get(&name) else { continue };
            let gone: Vec<String> = room
                .members
                .iter()
                .filter(|token| !self.is_active_in(token, exam_id))
                .cloned()
                .collect();
            if gone.is_empty() {
                continue;
            }

            let mut updated = room.clone();
            for token in &gone {
                updated.members.remove(token);
                self.pending.remove(token);
            }
            if let Err(e) = self.save_room(&updated) {
                warn!("Pruning room {} of exam {} failed: {}", name, exam_id, e);
                continue;
            }
            pruned += gone.len();
            rooms.rooms.insert(name.clone(), updated);
            rooms.vacated.insert(name);
        }
        pruned
    }

    fn is_active_in(&self, token: &str, exam_id: u64) -> bool {
        self.store
            .peek(token)
            .is_some_and(|c| c.status == ConnectionStatus::Active && c.exam_id == Some(exam_id))
    }

    /// Room the next waiting connection goes to, opening a collecting room
    /// if none has space.
    async fn target_room(&self, exam_id: u64, rooms: &mut ExamRooms) -> Result<String, SessionError> {
        if let Some(townhall) = rooms.townhall() {
            return Ok(townhall.name.clone());
        }
        let capacity = self.collecting_capacity;
        if let Some(room) = rooms
            .collecting()
            .into_iter()
            .find(|r| capacity == 0 || r.size() < capacity)
        {
            return Ok(room.name.clone());
        }

        let ordinal = rooms.collecting().len() + 1;
        let subject = format!("Exam {exam_id} collecting room {ordinal}");
        self.open_room(exam_id, rooms, RoomType::Collecting, &subject).await
    }

    async fn open_room(
        &self,
        exam_id: u64,
        rooms: &mut ExamRooms,
        room_type: RoomType,
        subject: &str,
    ) -> Result<String, SessionError> {
        let mut name = uuid::Uuid::new_v4().to_string();
        while rooms.rooms.contains_key(&name) {
            name = uuid::Uuid::new_v4().to_string();
        }

        let mut room = ProctoringRoom::new(exam_id, name.clone(), room_type, subject);
        room.primary = room_type == RoomType::Collecting && rooms.default_collecting.is_none();
        let access = self
            .backend
            .provision_dyn(&room)
            .await
            .map_err(|e| SessionError::TransientStore(format!("proctoring backend: {e}")))?;
        room.access = Some(access);

        if let Err(e) = self.save_room(&room) {
            if let Err(dispose) = self.backend.dispose_dyn(&room).await {
                warn!("Releasing unsaved room {} failed: {}", name, dispose);
            }
            return Err(e);
        }
        if room.primary {
            rooms.default_collecting = Some(name.clone());
        }
        rooms.rooms.insert(name.clone(), room);
        info!("Opened {:?} room {} for exam {}", room_type, name, exam_id);
        Ok(name)
    }

    async fn dispose_room(&self, exam_id: u64, rooms: &mut ExamRooms, name: &str) -> Result<(), SessionError> {
        with_retry(self.retry_attempts, "delete room", || self.persistence.delete_room(exam_id, name))?;
        let Some(room) = rooms.rooms.remove(name) else {
            return Ok(());
        };
        if rooms.is_default(name) {
            rooms.default_collecting = None;
        }
        rooms.vacated.remove(name);
        if let Err(e) = self.backend.dispose_dyn(&room).await {
            warn!("Meeting service did not release room {}: {}", name, e);
        }
        debug!("Disposed room {} of exam {}", name, exam_id);
        Ok(())
    }

    /// Dispose rooms that were emptied during this pass, except the
    /// default collecting room.
    async fn dispose_vacated(&self, exam_id: u64, rooms: &mut ExamRooms) -> usize {
        let vacated = std::mem::take(&mut rooms.vacated);
        let mut disposed = 0;
        for name in vacated {
            let empty = rooms.rooms.get(&name).is_some_and(ProctoringRoom::is_empty);
            if !empty || rooms.is_default(&name) {
                continue;
            }
            match self.dispose_room(exam_id, rooms, &name).await {
                Ok(()) => disposed += 1,
                Err(e) => warn!("Disposing empty room {} failed: {}", name, e),
            }
        }
        disposed
    }

    /// Move `token` into `target`, leaving its current room.
    fn move_member(&self, exam_id: u64, rooms: &mut ExamRooms, token: &str, target: &str) -> Result<(), SessionError> {
        let current = rooms.room_of(token);
        let mut target_room = rooms
            .rooms
            .get(target)
            .cloned()
            .ok_or_else(|| SessionError::not_found(format!("room {target}")))?;
        let mut source_room = current
            .as_deref()
            .filter(|name| *name != target)
            .and_then(|name| rooms.rooms.get(name).cloned());

        if let Some(source) = &source_room {
            self.instructions.register_instruction(exam_id, leave(source), [token], false)?;
        }
        self.instructions.register_instruction(exam_id, join(&target_room), [token], false)?;

        if let Some(source) = &mut source_room {
            source.members.remove(token);
            self.save_room(source)?;
        }
        target_room.members.insert(token.to_string());
        if let Err(e) = self.save_room(&target_room) {
            // Undo the source save; memory still lists the member there.
            let original = source_room.as_ref().and_then(|source| rooms.rooms.get(&source.name));
            if let Some(original) = original {
                if let Err(restore) = self.save_room(original) {
                    warn!("Restoring room {} after a failed move of {} failed: {}", original.name, token, restore);
                }
            }
            return Err(e);
        }

        if let Some(source) = source_room {
            rooms.vacated.insert(source.name.clone());
            rooms.rooms.insert(source.name.clone(), source);
        }
        rooms.rooms.insert(target_room.name.clone(), target_room);
        debug!("Connection {} joined room {} of exam {}", token, target, exam_id);
        Ok(())
    }

    fn save_room(&self, room: &ProctoringRoom) -> Result<(), SessionError> {
        with_retry(self.retry_attempts, "save room", || self.persistence.save_room(room))
    }
}

fn join(room: &ProctoringRoom) -> InstructionKind {
    InstructionKind::Proctoring {
        action: ProctoringAction::Join,
        room_name: room.name.clone(),
        subject: room.subject.clone(),
        access: room.access.clone(),
    }
}

fn leave(room: &ProctoringRoom) -> InstructionKind {
    InstructionKind::Proctoring {
        action: ProctoringAction::Leave,
        room_name: room.name.clone(),
        subject: room.subject.clone(),
        access: None,
    }
}
