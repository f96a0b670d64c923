//! InstructionQueue — per-connection outbound mailbox.
//!
//! Each connection token owns a FIFO. `poll_instruction` pops the head, so
//! an instruction is handed to exactly one poll. Instructions that need a
//! confirmation are tracked separately until the client echoes their
//! confirm id.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use seb_protocol::{ClientInstruction, ConnectionStatus, InstructionKind, SessionError};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::persistence::SessionPersistence;
use crate::retry::with_retry;
use crate::store::ConnectionStore;

/// Outcome of one cleanup pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub dropped_mailboxes: usize,
    pub expired_trackers: usize,
}

pub struct InstructionQueue {
    mailboxes: DashMap<String, VecDeque<ClientInstruction>>,
    /// token -> confirm id -> instruction
    awaiting: DashMap<String, BTreeMap<String, ClientInstruction>>,
    next_id: AtomicU64,
    persistence: Arc<dyn SessionPersistence>,
    clock: Arc<dyn Clock>,
    retry_attempts: u32,
    ttl_ms: u64,
}

impl InstructionQueue {
    pub fn new(persistence: Arc<dyn SessionPersistence>, clock: Arc<dyn Clock>, retry_attempts: u32, ttl_ms: u64) -> Self {
        Self {
            mailboxes: DashMap::new(),
            awaiting: DashMap::new(),
            next_id: AtomicU64::new(1),
            persistence,
            clock,
            retry_attempts,
            ttl_ms,
        }
    }

    /// Append one instruction per target token.
    ///
    /// Everything is written durably before any mailbox changes; if a write
    /// fails, the ones already written are rolled back and no mailbox sees
    /// the instruction.
    pub fn register_instruction<'a>(
        &self,
        exam_id: u64,
        kind: InstructionKind,
        tokens: impl IntoIterator<Item = &'a str>,
        needs_confirmation: bool,
    ) -> Result<Vec<ClientInstruction>, SessionError> {
        let now = self.clock.now_ms();
        let mut targets: Vec<&str> = tokens.into_iter().collect();
        targets.sort_unstable();
        targets.dedup();

        let instructions: Vec<ClientInstruction> = targets
            .into_iter()
            .map(|token| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                ClientInstruction {
                    id,
                    exam_id,
                    connection_token: token.to_string(),
                    kind: kind.clone(),
                    needs_confirmation,
                    confirm_id: needs_confirmation.then(|| format!("{exam_id}-{id}")),
                    created_at: now,
                }
            })
            .collect();

        let mut written = Vec::with_capacity(instructions.len());
        for instruction in &instructions {
            let saved = with_retry(self.retry_attempts, "save instruction", || {
                self.persistence.save_instruction(instruction)
            });
            if let Err(e) = saved {
                for id in written {
                    if let Err(rollback) = self.persistence.delete_instruction(id) {
                        warn!("Rollback of instruction {} failed: {}", id, rollback);
                    }
                }
                return Err(e);
            }
            written.push(instruction.id);
        }

        for instruction in &instructions {
            self.enqueue(instruction.clone());
        }

        info!(
            "Registered {} for {} connection(s) of exam {}",
            kind.instruction_type().as_str(),
            instructions.len(),
            exam_id
        );
        Ok(instructions)
    }

    /// Pop the head of the token's mailbox.
    pub fn poll_instruction(&self, token: &str) -> Result<Option<ClientInstruction>, SessionError> {
        let popped = match self.mailboxes.get_mut(token) {
            Some(mut mailbox) => mailbox.pop_front(),
            None => return Ok(None),
        };
        self.mailboxes.remove_if(token, |_, mailbox| mailbox.is_empty());

        let Some(instruction) = popped else {
            return Ok(None);
        };
        // Already handed out; a failed delete only risks redelivery after a restart.
        if let Err(e) = with_retry(self.retry_attempts, "delete instruction", || {
            self.persistence.delete_instruction(instruction.id)
        }) {
            warn!("Delivered instruction {} is still persisted: {}", instruction.id, e);
        }
        debug!("Delivered instruction {} to {}", instruction.id, token);
        Ok(Some(instruction))
    }

    /// Acknowledge a delivered instruction. Returns false if nothing was
    /// waiting under that confirm id.
    pub fn confirm_instruction_done(&self, token: &str, confirm_id: &str) -> bool {
        let confirmed = self
            .awaiting
            .get_mut(token)
            .and_then(|mut tracked| tracked.remove(confirm_id))
            .is_some();
        self.awaiting.remove_if(token, |_, tracked| tracked.is_empty());

        if confirmed {
            info!("Instruction {} confirmed by {}", confirm_id, token);
        } else {
            debug!("Unknown confirm id {} from {}", confirm_id, token);
        }
        confirmed
    }

    /// Instructions registered for `token` that still await confirmation.
    pub fn awaiting_confirmation(&self, token: &str) -> Vec<ClientInstruction> {
        self.awaiting
            .get(token)
            .map(|tracked| tracked.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, token: &str) -> usize {
        self.mailboxes.get(token).map(|m| m.len()).unwrap_or(0)
    }

    /// Drop instructions older than the TTL, and the mailboxes of tokens
    /// that are closed or unknown to the store. A disabled connection keeps
    /// its mailbox so a queued quit can still reach it.
    pub fn cleanup_instructions_at(&self, now: u64, store: &ConnectionStore) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = now.saturating_sub(self.ttl_ms);
        let tokens: Vec<String> = self.mailboxes.iter().map(|e| e.key().clone()).collect();

        for token in tokens {
            let mut dropped = Vec::new();
            if is_gone(store, &token) {
                if let Some((_, mailbox)) = self.mailboxes.remove(&token) {
                    dropped.extend(mailbox.into_iter().map(|i| i.id));
                    report.dropped_mailboxes += 1;
                }
            } else if let Some(mut mailbox) = self.mailboxes.get_mut(&token) {
                mailbox.retain(|i| {
                    let keep = i.created_at >= cutoff;
                    if !keep {
                        dropped.push(i.id);
                    }
                    keep
                });
                report.expired += dropped.len();
            }
            self.mailboxes.remove_if(&token, |_, mailbox| mailbox.is_empty());

            for id in dropped {
                if let Err(e) = with_retry(self.retry_attempts, "delete instruction", || self.persistence.delete_instruction(id)) {
                    warn!("Cleanup could not delete instruction {}: {}", id, e);
                }
            }
        }

        self.awaiting.retain(|token, tracked| {
            let before = tracked.len();
            if is_gone(store, token) {
                tracked.clear();
            } else {
                tracked.retain(|_, i| i.created_at >= cutoff);
            }
            report.expired_trackers += before - tracked.len();
            !tracked.is_empty()
        });

        if report != CleanupReport::default() {
            info!(
                "Instruction cleanup: {} expired, {} mailboxes dropped, {} trackers expired",
                report.expired, report.dropped_mailboxes, report.expired_trackers
            );
        }
        report
    }

    /// Re-queue instructions that were persisted but never delivered.
    pub fn restore(&self) -> Result<usize, SessionError> {
        let mut instructions = with_retry(self.retry_attempts, "load instructions", || self.persistence.load_instructions())?;
        instructions.sort_by_key(|i| i.id);

        let count = instructions.len();
        for instruction in instructions {
            self.next_id.fetch_max(instruction.id + 1, Ordering::SeqCst);
            self.enqueue(instruction);
        }
        if count > 0 {
            info!("Restored {} queued instruction(s)", count);
        }
        Ok(count)
    }

    fn enqueue(&self, instruction: ClientInstruction) {
        if let Some(confirm_id) = &instruction.confirm_id {
            self.awaiting
                .entry(instruction.connection_token.clone())
                .or_default()
                .insert(confirm_id.clone(), instruction.clone());
        }
        self.mailboxes
            .entry(instruction.connection_token.clone())
            .or_default()
            .push_back(instruction);
    }
}

/// Whether nothing can be delivered to `token` any more: the connection is
/// closed or was never recorded. Lookup failures count as live so cleanup
/// never drops a mailbox on a store hiccup.
fn is_gone(store: &ConnectionStore, token: &str) -> bool {
    match store.lookup_status(token) {
        Ok(Some(status)) => status == ConnectionStatus::Closed,
        Ok(None) => true,
        Err(e) => {
            debug!("Cleanup keeps mailbox of {}: {}", token, e);
            false
        }
    }
}
