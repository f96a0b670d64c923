//! Persistence collaborator.
//!
//! The core treats these calls as durable, synchronous writes and never
//! relies on them for concurrency control. [`InMemoryPersistence`] backs the
//! binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use seb_protocol::{
    ClientConnection, ClientEvent, ClientInstruction, EventFilter, EventKind, ProctoringRoom,
    StoreError,
};

pub trait SessionPersistence: Send + Sync {
    /// Insert a new connection and return its durable id.
    fn create_connection(&self, connection: &ClientConnection) -> Result<u64, StoreError>;
    fn save_connection(&self, connection: &ClientConnection) -> Result<(), StoreError>;
    fn load_connection(&self, token: &str) -> Result<Option<ClientConnection>, StoreError>;

    /// Append an event and return its id.
    fn append_event(&self, event: &ClientEvent) -> Result<u64, StoreError>;
    fn load_events(&self, connection_id: u64, filter: EventFilter) -> Result<Vec<ClientEvent>, StoreError>;
    /// Mark a notification event confirmed. Returns false if no pending
    /// notification with that id exists for the connection.
    fn confirm_notification(&self, notification_id: u64, connection_id: u64) -> Result<bool, StoreError>;

    fn save_instruction(&self, instruction: &ClientInstruction) -> Result<(), StoreError>;
    fn load_instructions(&self) -> Result<Vec<ClientInstruction>, StoreError>;
    fn delete_instruction(&self, instruction_id: u64) -> Result<(), StoreError>;

    fn save_room(&self, room: &ProctoringRoom) -> Result<(), StoreError>;
    fn load_rooms_for_exam(&self, exam_id: u64) -> Result<Vec<ProctoringRoom>, StoreError>;
    fn delete_room(&self, exam_id: u64, name: &str) -> Result<(), StoreError>;
}

/// Process-local persistence with optional fault injection.
#[derive(Default)]
pub struct InMemoryPersistence {
    connections: RwLock<HashMap<String, ClientConnection>>,
    events: RwLock<Vec<ClientEvent>>,
    instructions: RwLock<BTreeMap<u64, ClientInstruction>>,
    rooms: RwLock<BTreeMap<(u64, String), ProctoringRoom>>,
    next_connection_id: AtomicU64,
    next_event_id: AtomicU64,
    failures_pending: AtomicU32,
    successes_before_failure: AtomicU32,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a [`StoreError`].
    pub fn fail_next(&self, count: u32) {
        self.fail_after(0, count);
    }

    /// Let `successes` calls through, then fail the `count` after them.
    pub fn fail_after(&self, successes: u32, count: u32) {
        self.successes_before_failure.store(successes, Ordering::SeqCst);
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.read().len()
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        if self.failures_pending.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        let skipped = self
            .successes_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if skipped {
            return Ok(());
        }
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::new("injected store failure"))
        } else {
            Ok(())
        }
    }
}

impl SessionPersistence for InMemoryPersistence {
    fn create_connection(&self, connection: &ClientConnection) -> Result<u64, StoreError> {
        self.check_fault()?;
        let mut connections = self.connections.write();
        if connections.contains_key(&connection.connection_token) {
            return Err(StoreError::new(format!(
                "duplicate connection token {}",
                connection.connection_token
            )));
        }
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = connection.clone();
        stored.id = id;
        connections.insert(stored.connection_token.clone(), stored);
        Ok(id)
    }

    fn save_connection(&self, connection: &ClientConnection) -> Result<(), StoreError> {
        self.check_fault()?;
        self.connections
            .write()
            .insert(connection.connection_token.clone(), connection.clone());
        Ok(())
    }

    fn load_connection(&self, token: &str) -> Result<Option<ClientConnection>, StoreError> {
        self.check_fault()?;
        Ok(self.connections.read().get(token).cloned())
    }

    fn append_event(&self, event: &ClientEvent) -> Result<u64, StoreError> {
        self.check_fault()?;
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = event.clone();
        stored.id = id;
        self.events.write().push(stored);
        Ok(id)
    }

    fn load_events(&self, connection_id: u64, filter: EventFilter) -> Result<Vec<ClientEvent>, StoreError> {
        self.check_fault()?;
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.connection_id == connection_id && filter.matches(e))
            .cloned()
            .collect())
    }

    fn confirm_notification(&self, notification_id: u64, connection_id: u64) -> Result<bool, StoreError> {
        self.check_fault()?;
        let mut events = self.events.write();
        let target = events.iter_mut().find(|e| {
            e.id == notification_id && e.connection_id == connection_id && e.kind.is_pending_notification()
        });
        match target {
            Some(event) => {
                if let EventKind::Notification { notification, .. } = event.kind {
                    event.kind = EventKind::Notification { notification, confirmed: true };
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn save_instruction(&self, instruction: &ClientInstruction) -> Result<(), StoreError> {
        self.check_fault()?;
        self.instructions.write().insert(instruction.id, instruction.clone());
        Ok(())
    }

    fn load_instructions(&self) -> Result<Vec<ClientInstruction>, StoreError> {
        self.check_fault()?;
        Ok(self.instructions.read().values().cloned().collect())
    }

    fn delete_instruction(&self, instruction_id: u64) -> Result<(), StoreError> {
        self.check_fault()?;
        self.instructions.write().remove(&instruction_id);
        Ok(())
    }

    fn save_room(&self, room: &ProctoringRoom) -> Result<(), StoreError> {
        self.check_fault()?;
        self.rooms
            .write()
            .insert((room.exam_id, room.name.clone()), room.clone());
        Ok(())
    }

    fn load_rooms_for_exam(&self, exam_id: u64) -> Result<Vec<ProctoringRoom>, StoreError> {
        self.check_fault()?;
        Ok(self
            .rooms
            .read()
            .iter()
            .filter(|((exam, _), _)| *exam == exam_id)
            .map(|(_, room)| room.clone())
            .collect())
    }

    fn delete_room(&self, exam_id: u64, name: &str) -> Result<(), StoreError> {
        self.check_fault()?;
        self.rooms.write().remove(&(exam_id, name.to_string()));
        Ok(())
    }
}
