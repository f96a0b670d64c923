//! Proctoring rooms.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomType {
    /// Default room new connections are gathered in.
    Collecting,
    /// Aggregates every connection of the exam; supersedes collecting rooms while open.
    Townhall,
    /// Operator-created room for a chosen set of connections.
    BreakOut,
}

/// Credentials a client needs to join a room on the meeting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAccess {
    pub server_url: String,
    pub room_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringRoom {
    pub exam_id: u64,
    /// Unique per exam.
    pub name: String,
    pub room_type: RoomType,
    pub subject: String,
    pub members: BTreeSet<String>,
    pub access: Option<RoomAccess>,
    /// The exam's default collecting room, kept open while the exam runs.
    #[serde(default)]
    pub primary: bool,
}

impl ProctoringRoom {
    pub fn new(exam_id: u64, name: impl Into<String>, room_type: RoomType, subject: impl Into<String>) -> Self {
        Self {
            exam_id,
            name: name.into(),
            room_type,
            subject: subject.into(),
            members: BTreeSet::new(),
            access: None,
            primary: false,
        }
    }

    /// Number of member connections.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
