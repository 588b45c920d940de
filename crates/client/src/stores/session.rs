//! Session store: the client's projection of one session.
//!
//! The state is filled from a REST snapshot and then patched by channel
//! events and optimistic mutation results. All three go through the same
//! functions on [`SessionState`], so a local write and its later echo are
//! applied identically. Events are applied in arrival order; nothing is
//! reordered or compared by timestamp.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use codeclass_shared::{
    ExecutionSettings, FeaturedStudent, Problem, Session, SessionEvent, SessionStateResponse,
    SessionStatus, StudentPayload, StudentState,
};
use tokio::sync::watch;

use crate::api_client::SessionApi;
use crate::error::Operation;
use crate::retry::{with_retry, RetryPolicy};

/// Name given to a student whose first event carried none.
pub const UNKNOWN_STUDENT_NAME: &str = "Anonymous";

/// A student entry in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Student {
    pub user_id: String,
    pub name: String,
    /// Full current text, not a diff
    pub code: String,
    pub last_update: Option<DateTime<Utc>>,
    pub execution_settings: Option<ExecutionSettings>,
}

impl From<StudentState> for Student {
    fn from(s: StudentState) -> Self {
        Self {
            user_id: s.user_id,
            name: s.name.unwrap_or_else(|| UNKNOWN_STUDENT_NAME.to_string()),
            code: s.code.unwrap_or_default(),
            last_update: s.last_update,
            execution_settings: s.execution_settings,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub session: Option<Session>,
    /// Keyed by user id, one entry per participant
    pub students: HashMap<String, Student>,
    pub featured: FeaturedStudent,
    pub loading: bool,
    pub error: Option<String>,
    /// Set once the first snapshot fetch has finished, whatever its outcome
    pub initial_load_done: bool,
}

impl SessionState {
    /// Replace session, students and featured submission with a snapshot.
    pub fn apply_snapshot(&mut self, snapshot: SessionStateResponse) {
        self.students = snapshot
            .students
            .into_iter()
            .map(|s| (s.user_id.clone(), Student::from(s)))
            .collect();
        self.featured = snapshot.featured_student;
        self.session = Some(snapshot.session);
        self.error = None;
    }

    /// Insert or update a student by user id.
    ///
    /// Absent name, code and settings keep what is already there (a new
    /// entry gets a placeholder name and empty code). A missing timestamp
    /// means `now`.
    pub fn upsert_student(&mut self, patch: StudentPayload, now: DateTime<Utc>) {
        let last_update = Some(patch.last_update.unwrap_or(now));
        match self.students.get_mut(&patch.user_id) {
            Some(existing) => {
                if let Some(name) = patch.name {
                    existing.name = name;
                }
                if let Some(code) = patch.code {
                    existing.code = code;
                }
                existing.last_update = last_update;
                if let Some(settings) = patch.execution_settings {
                    existing
                        .execution_settings
                        .get_or_insert_with(ExecutionSettings::default)
                        .merge(&settings);
                }
            }
            None => {
                let student = Student {
                    user_id: patch.user_id.clone(),
                    name: patch.name.unwrap_or_else(|| UNKNOWN_STUDENT_NAME.to_string()),
                    code: patch.code.unwrap_or_default(),
                    last_update,
                    execution_settings: patch.execution_settings,
                };
                self.students.insert(patch.user_id, student);
            }
        }
    }

    /// Remove a student. Returns whether one was there.
    pub fn remove_student(&mut self, user_id: &str) -> bool {
        self.students.remove(user_id).is_some()
    }

    pub fn end_session(&mut self, ended_at: DateTime<Utc>) {
        if let Some(session) = self.session.as_mut() {
            session.status = SessionStatus::Completed;
            session.ended_at = Some(ended_at);
        }
    }

    /// Set the featured submission on the session and the standalone projection.
    pub fn set_featured(&mut self, student_id: Option<String>, code: Option<String>) {
        if let Some(session) = self.session.as_mut() {
            session.featured_student_id = student_id.clone();
            session.featured_code = code.clone();
        }
        self.featured = FeaturedStudent { student_id, code };
    }

    pub fn replace_problem(&mut self, problem: Problem) {
        if let Some(session) = self.session.as_mut() {
            session.problem = Some(problem);
        }
    }

    pub fn apply_event(&mut self, event: SessionEvent, now: DateTime<Utc>) {
        match event {
            SessionEvent::StudentJoined(patch) | SessionEvent::StudentCodeUpdated(patch) => {
                self.upsert_student(patch, now);
            }
            SessionEvent::StudentRemoved(payload) => {
                self.remove_student(&payload.user_id);
            }
            SessionEvent::SessionEnded(payload) => {
                self.end_session(payload.ended_at.unwrap_or(now));
            }
            SessionEvent::FeaturedStudentChanged(payload) => {
                self.set_featured(payload.featured_student_id, payload.featured_code);
            }
            SessionEvent::ProblemUpdated(payload) => {
                self.replace_problem(payload.problem);
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_completed)
    }

    /// Students ordered by name, then id.
    pub fn roster(&self) -> Vec<&Student> {
        let mut students: Vec<&Student> = self.students.values().collect();
        students.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.user_id.cmp(&b.user_id)));
        students
    }
}

/// Shared handle to one session's state. Cloning shares the same state.
#[derive(Clone)]
pub struct SessionStore {
    session_id: String,
    state: Arc<watch::Sender<SessionState>>,
    load_started: Arc<AtomicBool>,
}

impl SessionStore {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            session_id: session_id.into(),
            state: Arc::new(state),
            load_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.state.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Read-modify-write under the channel's lock so concurrent patches never lose updates.
    pub fn update(&self, f: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(f);
    }

    pub fn apply_event(&self, event: SessionEvent) {
        let now = Utc::now();
        self.update(|state| state.apply_event(event, now));
    }

    pub fn apply_snapshot(&self, snapshot: SessionStateResponse) {
        self.update(|state| state.apply_snapshot(snapshot));
    }

    pub fn student(&self, user_id: &str) -> Option<Student> {
        self.read(|state| state.students.get(user_id).cloned())
    }

    pub fn is_completed(&self) -> bool {
        self.read(SessionState::is_completed)
    }

    pub fn initial_load_done(&self) -> bool {
        self.read(|state| state.initial_load_done)
    }

    /// Fetch the first snapshot. Only the first call per store does any work.
    /// Returns whether this call fetched.
    pub async fn ensure_loaded(&self, api: &dyn SessionApi, retry: &RetryPolicy) -> bool {
        if self.session_id.is_empty() {
            return false;
        }
        if self.load_started.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.update(|state| {
            state.loading = true;
            state.error = None;
        });

        let label = format!("{} {}", Operation::LoadSession, self.session_id);
        let session_id = self.session_id.as_str();
        let result = with_retry(retry, &label, move || api.fetch_state(session_id)).await;

        match result {
            Ok(snapshot) => {
                crate::log_info!(
                    "Loaded session {} with {} students",
                    self.session_id,
                    snapshot.students.len()
                );
                self.update(|state| {
                    state.apply_snapshot(snapshot);
                    state.loading = false;
                    state.initial_load_done = true;
                });
            }
            Err(failure) => {
                let message = failure
                    .error
                    .server_message()
                    .unwrap_or_else(|| failure.error.to_string());
                crate::log_error!("Failed to load session {}: {}", self.session_id, message);
                self.update(|state| {
                    state.loading = false;
                    state.error = Some(message);
                    state.initial_load_done = true;
                });
            }
        }
        true
    }
}
