//! Shared data models for codeclass sessions and the session REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Problems ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedFile {
    pub name: String,
    pub content: String,
}

/// Per-run execution knobs. Every field is optional so that a partial update
/// never wipes settings the other side already knows about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_files: Option<Vec<AttachedFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl ExecutionSettings {
    pub fn is_empty(&self) -> bool {
        self.random_seed.is_none() && self.attached_files.is_none() && self.stdin.is_none()
    }

    /// Overlay the fields present in `other`, leaving absent ones untouched.
    pub fn merge(&mut self, other: &ExecutionSettings) {
        if other.random_seed.is_some() {
            self.random_seed = other.random_seed;
        }
        if other.attached_files.is_some() {
            self.attached_files = other.attached_files.clone();
        }
        if other.stdin.is_some() {
            self.stdin = other.stdin.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub starter_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_settings: Option<ExecutionSettings>,
}

// --- Sessions ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub problem: Option<Problem>,
    /// Student whose code is on the public view, if any.
    #[serde(default)]
    pub featured_student_id: Option<String>,
    /// Copy of that student's code taken when they were featured.
    /// It does not follow later edits.
    #[serde(default)]
    pub featured_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// One participant as the server reports it in snapshots and join replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentState {
    #[serde(alias = "studentId", alias = "id")]
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "lastUpdated")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_settings: Option<ExecutionSettings>,
}

/// The featured-submission projection used by the public view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeaturedStudent {
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl FeaturedStudent {
    pub fn new(student_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            student_id: Some(student_id.into()),
            code: Some(code.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.student_id.is_none()
    }
}

/// Body of `GET /sessions/{id}/state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateResponse {
    pub session: Session,
    #[serde(default)]
    pub students: Vec<StudentState>,
    #[serde(default)]
    pub featured_student: FeaturedStudent,
}

// --- Mutations ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCodeRequest {
    pub student_id: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_settings: Option<ExecutionSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCodeRequest {
    pub student_id: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_settings: Option<ExecutionSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall time in milliseconds as measured by the runner.
    #[serde(default)]
    pub execution_time: Option<u64>,
}

/// `studentId: null` clears the featured submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStudentRequest {
    pub student_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
    pub student_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionResponse {
    pub success: bool,
    /// Previously saved state for a returning student.
    #[serde(default)]
    pub student: Option<StudentState>,
}
