//! Client events — append-only telemetry and notification records.
//!
//! Wire format: `{ "type": "INFO_LOG", "timestamp": 1700000000000,
//! "numValue": 1.0, "text": "..." }`. Notification subtypes travel inside
//! the text as a leading tag (`<lockscreen>`, `<raisehand>`).

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

const LOCK_SCREEN_TAG: &str = "<lockscreen>";
const RAISE_HAND_TAG: &str = "<raisehand>";

/// Kind of a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    LockScreen,
    RaiseHand,
}

impl NotificationKind {
    fn tag(self) -> &'static str {
        match self {
            Self::LockScreen => LOCK_SCREEN_TAG,
            Self::RaiseHand => RAISE_HAND_TAG,
        }
    }
}

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    DebugLog,
    InfoLog,
    WarnLog,
    ErrorLog,
    LastPing,
    Notification {
        notification: NotificationKind,
        confirmed: bool,
    },
    /// Sent by the client when it resolves a notification on its own.
    /// `num_value` carries the id of the notification event.
    NotificationConfirmed,
}

impl EventKind {
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification { .. })
    }

    pub fn is_pending_notification(&self) -> bool {
        matches!(self, Self::Notification { confirmed: false, .. })
    }
}

/// A stored client event. `id` is 0 until the persistence layer assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEvent {
    pub id: u64,
    pub connection_id: u64,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ClientEvent {
    /// Id of the notification a NOTIFICATION_CONFIRMED event refers to.
    pub fn confirmed_notification_id(&self) -> Option<u64> {
        match self.kind {
            EventKind::NotificationConfirmed => self.num_value.and_then(notification_id),
            _ => None,
        }
    }
}

/// Selects which events `load_events` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Notifications { pending_only: bool },
}

impl EventFilter {
    pub fn matches(&self, event: &ClientEvent) -> bool {
        match self {
            Self::All => true,
            Self::Notifications { pending_only: false } => event.kind.is_notification(),
            Self::Notifications { pending_only: true } => event.kind.is_pending_notification(),
        }
    }
}

/// An event as the client sends it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: Option<u64>,
    pub num_value: Option<f64>,
    pub text: Option<String>,
}

impl WireEvent {
    /// Decode into a typed event for `connection_id`. A missing timestamp
    /// falls back to `received_at`.
    pub fn decode(self, connection_id: u64, received_at: u64) -> Result<ClientEvent, SessionError> {
        let mut text = self.text;
        let kind = match self.event_type.as_str() {
            "DEBUG_LOG" => EventKind::DebugLog,
            "INFO_LOG" => EventKind::InfoLog,
            "WARN_LOG" => EventKind::WarnLog,
            "ERROR_LOG" => EventKind::ErrorLog,
            "LAST_PING" => EventKind::LastPing,
            "NOTIFICATION" => {
                let (notification, rest) = split_notification_tag(text.as_deref())
                    .ok_or_else(|| SessionError::validation("notification without a known type tag"))?;
                text = rest;
                EventKind::Notification { notification, confirmed: false }
            }
            "NOTIFICATION_CONFIRMED" => {
                if self.num_value.and_then(notification_id).is_none() {
                    return Err(SessionError::validation(
                        "NOTIFICATION_CONFIRMED requires numValue with the notification id",
                    ));
                }
                EventKind::NotificationConfirmed
            }
            other => {
                return Err(SessionError::validation(format!("unknown event type: {other}")));
            }
        };

        Ok(ClientEvent {
            id: 0,
            connection_id,
            kind,
            timestamp: self.timestamp.unwrap_or(received_at),
            num_value: self.num_value,
            text,
        })
    }

    /// Encode a typed event back into the client wire shape.
    pub fn encode(event: &ClientEvent) -> Self {
        let (event_type, text) = match event.kind {
            EventKind::DebugLog => ("DEBUG_LOG", event.text.clone()),
            EventKind::InfoLog => ("INFO_LOG", event.text.clone()),
            EventKind::WarnLog => ("WARN_LOG", event.text.clone()),
            EventKind::ErrorLog => ("ERROR_LOG", event.text.clone()),
            EventKind::LastPing => ("LAST_PING", event.text.clone()),
            EventKind::Notification { notification, .. } => {
                let body = event.text.as_deref().unwrap_or_default();
                let tagged = if body.is_empty() {
                    notification.tag().to_string()
                } else {
                    format!("{} {body}", notification.tag())
                };
                ("NOTIFICATION", Some(tagged))
            }
            EventKind::NotificationConfirmed => ("NOTIFICATION_CONFIRMED", event.text.clone()),
        };
        Self {
            event_type: event_type.to_string(),
            timestamp: Some(event.timestamp),
            num_value: event.num_value,
            text,
        }
    }
}

/// A notification id carried in `numValue`: a non-negative whole number
/// that an `f64` represents exactly.
fn notification_id(value: f64) -> Option<u64> {
    const MAX_EXACT: f64 = (1u64 << 53) as f64;
    (value.fract() == 0.0 && (0.0..=MAX_EXACT).contains(&value)).then_some(value as u64)
}

fn split_notification_tag(text: Option<&str>) -> Option<(NotificationKind, Option<String>)> {
    let text = text?.trim_start();
    for kind in [NotificationKind::LockScreen, NotificationKind::RaiseHand] {
        if let Some(rest) = text.strip_prefix(kind.tag()) {
            let rest = rest.trim();
            let rest = (!rest.is_empty()).then(|| rest.to_string());
            return Some((kind, rest));
        }
    }
    None
}
