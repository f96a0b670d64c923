//! NotificationCache — "has pending notification" per connection.
//!
//! The indicator is derived from stored notification events and cached per
//! connection id. Writers commit to persistence first and invalidate after.
//! Every invalidation stamps the entry with a fresh generation from one
//! counter shared by all entries, and a reader only stores what it computed
//! if the generation it started from is still current, so a value computed
//! before a write (or before an eviction) can never land in the cache after it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use seb_protocol::{ClientEvent, EventFilter, SessionError};
use tracing::{debug, info};

use crate::persistence::SessionPersistence;
use crate::retry::with_retry;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    generation: u64,
    pending: Option<bool>,
}

pub struct NotificationCache {
    entries: DashMap<u64, CacheEntry>,
    generations: AtomicU64,
    persistence: Arc<dyn SessionPersistence>,
    retry_attempts: u32,
}

impl NotificationCache {
    pub fn new(persistence: Arc<dyn SessionPersistence>, retry_attempts: u32) -> Self {
        Self {
            entries: DashMap::new(),
            generations: AtomicU64::new(1),
            persistence,
            retry_attempts,
        }
    }

    /// Cache-first lookup.
    pub fn has_any_pending_notification(&self, connection_id: u64) -> Result<bool, SessionError> {
        let generation = {
            let entry = self.entry(connection_id);
            if let Some(pending) = entry.pending {
                return Ok(pending);
            }
            entry.generation
        };

        let pending = !self.load_pending(connection_id)?.is_empty();
        self.fill(connection_id, generation, pending);
        Ok(pending)
    }

    /// Unconfirmed notification events of a connection, oldest first.
    pub fn get_pending_notifications(&self, connection_id: u64) -> Result<Vec<ClientEvent>, SessionError> {
        let generation = self.entry(connection_id).generation;
        let mut pending = self.load_pending(connection_id)?;
        pending.sort_by_key(|e| (e.timestamp, e.id));
        self.fill(connection_id, generation, !pending.is_empty());
        Ok(pending)
    }

    /// Mark a notification confirmed, then evict the cached indicator.
    /// Returns false if no such pending notification exists.
    pub fn confirm_pending_notification(&self, notification_id: u64, connection_id: u64) -> Result<bool, SessionError> {
        let confirmed = with_retry(self.retry_attempts, "confirm notification", || {
            self.persistence.confirm_notification(notification_id, connection_id)
        })?;
        self.invalidate(connection_id);

        if confirmed {
            info!("Notification {} of connection {} confirmed", notification_id, connection_id);
        } else {
            debug!("No pending notification {} for connection {}", notification_id, connection_id);
        }
        Ok(confirmed)
    }

    /// Forget the cached indicator. Call after the write that changed it.
    pub fn invalidate(&self, connection_id: u64) {
        let generation = self.next_generation();
        self.entries.insert(connection_id, CacheEntry { generation, pending: None });
    }

    /// Drop everything held for a connection that reached a terminal state.
    pub fn evict(&self, connection_id: u64) {
        if self.entries.remove(&connection_id).is_some() {
            debug!("Notification cache evicted connection {}", connection_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached value without loading, for diagnostics and tests.
    pub fn cached(&self, connection_id: u64) -> Option<bool> {
        self.entries.get(&connection_id).and_then(|e| e.pending)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst)
    }

    fn entry(&self, connection_id: u64) -> dashmap::mapref::one::RefMut<'_, u64, CacheEntry> {
        self.entries.entry(connection_id).or_insert_with(|| CacheEntry {
            generation: self.next_generation(),
            pending: None,
        })
    }

    fn load_pending(&self, connection_id: u64) -> Result<Vec<ClientEvent>, SessionError> {
        with_retry(self.retry_attempts, "load notifications", || {
            self.persistence
                .load_events(connection_id, EventFilter::Notifications { pending_only: true })
        })
    }

    fn fill(&self, connection_id: u64, generation: u64, pending: bool) {
        if let Some(mut entry) = self.entries.get_mut(&connection_id) {
            if entry.generation == generation {
                entry.pending = Some(pending);
            }
        }
    }
}
