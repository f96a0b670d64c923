//! Exam directory collaborator — the live exam lookups the core needs.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamInfo {
    pub id: u64,
    pub institution_id: u64,
    /// Many clients may share one physical address.
    #[serde(default)]
    pub vdi: bool,
    #[serde(default)]
    pub proctoring_enabled: bool,
    #[serde(default = "default_running")]
    pub running: bool,
}

fn default_running() -> bool {
    true
}

pub trait ExamDirectory: Send + Sync {
    fn exam(&self, exam_id: u64) -> Option<ExamInfo>;
    /// Ids of running exams with proctoring enabled.
    fn proctored_exams(&self) -> Vec<u64>;

    fn is_vdi(&self, exam_id: u64) -> bool {
        self.exam(exam_id).is_some_and(|e| e.vdi)
    }

    fn is_running(&self, exam_id: u64) -> bool {
        self.exam(exam_id).is_some_and(|e| e.running)
    }
}

#[derive(Default)]
pub struct InMemoryExamDirectory {
    exams: DashMap<u64, ExamInfo>,
}

impl InMemoryExamDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exams(exams: impl IntoIterator<Item = ExamInfo>) -> Self {
        let dir = Self::new();
        for exam in exams {
            dir.upsert(exam);
        }
        dir
    }

    pub fn upsert(&self, exam: ExamInfo) {
        self.exams.insert(exam.id, exam);
    }

    pub fn set_running(&self, exam_id: u64, running: bool) {
        if let Some(mut exam) = self.exams.get_mut(&exam_id) {
            exam.running = running;
        }
    }
}

impl ExamDirectory for InMemoryExamDirectory {
    fn exam(&self, exam_id: u64) -> Option<ExamInfo> {
        self.exams.get(&exam_id).map(|e| e.clone())
    }

    fn proctored_exams(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .exams
            .iter()
            .filter(|e| e.proctoring_enabled && e.running)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
