//! PingMonitor — liveness bookkeeping and missing-ping detection.
//!
//! Liveness lives in its own map, next to the connection record rather than
//! inside it, so the ping path never waits on a status transition.

use std::sync::Arc;

use dashmap::DashMap;
use seb_protocol::{ClientInstruction, MonitoringEvent, SessionError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::instruction::InstructionQueue;
use crate::notification::NotificationCache;
use crate::store::ConnectionStore;

/// Per-connection liveness record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    pub connection_id: u64,
    pub last_ping: u64,
    pub last_ping_number: u64,
    /// Set by the sweep, cleared by the next ping.
    pub missing_ping: bool,
    /// Pending-notification indicator, refreshed on every ping.
    pub pending_notification: bool,
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub flagged: usize,
    pub recovered: usize,
    pub skipped: usize,
}

pub struct PingMonitor {
    liveness: DashMap<String, Liveness>,
    store: Arc<ConnectionStore>,
    instructions: Arc<InstructionQueue>,
    notifications: Arc<NotificationCache>,
    events: broadcast::Sender<MonitoringEvent>,
    threshold_ms: u64,
}

impl PingMonitor {
    pub fn new(
        store: Arc<ConnectionStore>,
        instructions: Arc<InstructionQueue>,
        notifications: Arc<NotificationCache>,
        events: broadcast::Sender<MonitoringEvent>,
        threshold_ms: u64,
    ) -> Self {
        Self {
            liveness: DashMap::new(),
            store,
            instructions,
            notifications,
            events,
            threshold_ms,
        }
    }

    pub fn threshold_ms(&self) -> u64 {
        self.threshold_ms
    }

    /// Start tracking a connection as if it had just pinged. Called when a
    /// connection is established so a client that never pings is flagged.
    pub fn track(&self, token: &str, connection_id: u64, now: u64) {
        self.liveness.entry(token.to_string()).or_insert(Liveness {
            connection_id,
            last_ping: now,
            last_ping_number: 0,
            missing_ping: false,
            pending_notification: false,
        });
    }

    pub fn forget(&self, token: &str) {
        self.liveness.remove(token);
    }

    /// Record a ping and return the next instruction for the client, if any.
    pub fn notify_ping(&self, token: &str, timestamp: u64, ping_number: u64) -> Result<Option<ClientInstruction>, SessionError> {
        let connection_id = match self.liveness.get(token) {
            Some(entry) => entry.connection_id,
            None => self.store.get(token)?.id,
        };

        let recovered = {
            let mut entry = self.liveness.entry(token.to_string()).or_insert(Liveness {
                connection_id,
                last_ping: timestamp,
                last_ping_number: ping_number,
                missing_ping: false,
                pending_notification: false,
            });
            // Out-of-order pings never move the clock backwards.
            entry.last_ping = entry.last_ping.max(timestamp);
            entry.last_ping_number = entry.last_ping_number.max(ping_number);
            std::mem::replace(&mut entry.missing_ping, false)
        };

        if recovered {
            info!("Ping recovered for {}", token);
            let _ = self.events.send(MonitoringEvent::PingRecovered {
                token: token.to_string(),
                at: timestamp,
            });
        }

        match self.notifications.has_any_pending_notification(connection_id) {
            Ok(pending) => {
                if let Some(mut entry) = self.liveness.get_mut(token) {
                    entry.pending_notification = pending;
                }
            }
            Err(e) => warn!("Pending-notification lookup failed for {}: {}", token, e),
        }

        self.instructions.poll_instruction(token)
    }

    /// Flag every established connection whose last ping is older than the
    /// threshold and clear flags of those that pinged again.
    ///
    /// Works on a snapshot of established tokens; connections that close
    /// meanwhile are skipped.
    pub fn sweep_at(&self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();

        for token in self.store.established_tokens() {
            match self.store.status(&token) {
                Some(status) if status.is_established() => {}
                _ => {
                    report.skipped += 1;
                    continue;
                }
            }

            let Some(mut entry) = self.liveness.get_mut(&token) else {
                // Established before this process started tracking it.
                if let Some(connection) = self.store.peek(&token) {
                    self.track(&token, connection.id, now);
                }
                report.skipped += 1;
                continue;
            };
            report.checked += 1;

            let silent_for = now.saturating_sub(entry.last_ping);
            if silent_for > self.threshold_ms {
                if !entry.missing_ping {
                    entry.missing_ping = true;
                    let last_ping = entry.last_ping;
                    drop(entry);
                    report.flagged += 1;
                    warn!("Missing ping for {} ({} ms since last ping)", token, silent_for);
                    let _ = self.events.send(MonitoringEvent::MissingPing {
                        token: token.clone(),
                        last_ping,
                        detected_at: now,
                    });
                }
            } else if entry.missing_ping {
                entry.missing_ping = false;
                drop(entry);
                report.recovered += 1;
                info!("Ping recovered for {}", token);
                let _ = self.events.send(MonitoringEvent::PingRecovered { token: token.clone(), at: now });
            }
        }

        // Drop liveness of connections that are no longer established.
        self.liveness
            .retain(|token, _| self.store.status(token).is_some_and(|s| s.is_established()));

        debug!(
            "Ping sweep: {} checked, {} flagged, {} recovered, {} skipped",
            report.checked, report.flagged, report.recovered, report.skipped
        );
        report
    }

    pub fn is_missing_ping(&self, token: &str) -> bool {
        self.liveness.get(token).is_some_and(|e| e.missing_ping)
    }

    pub fn liveness(&self, token: &str) -> Option<Liveness> {
        self.liveness.get(token).map(|e| e.clone())
    }

    /// Tokens currently flagged, sorted.
    pub fn incidents(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .liveness
            .iter()
            .filter(|e| e.missing_ping)
            .map(|e| e.key().clone())
            .collect();
        tokens.sort();
        tokens
    }
}
