//! Outbound session actions: save code, run code, feature a student, join.
//!
//! Every call goes through [`with_retry`]. Code saves are debounced per
//! student and patch the store once the server accepted them; featuring
//! patches the store before the request goes out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use codeclass_shared::{
    ExecuteCodeRequest, ExecutionResult, ExecutionSettings, FeatureStudentRequest, FeaturedStudent,
    JoinSessionRequest, JoinSessionResponse, StudentPayload, UpdateCodeRequest,
};
use futures_util::FutureExt;

use crate::api_client::SessionApi;
use crate::debounce::Debouncer;
use crate::error::{MutationError, Operation};
use crate::retry::{with_retry, RetryPolicy};
use crate::stores::SessionStore;

#[derive(Debug, Clone)]
struct PendingCode {
    code: String,
    execution_settings: Option<ExecutionSettings>,
    ticket: u64,
}

/// Hands out one ticket per code save. Only the newest ticket of a student
/// may still write; older saves still retrying drop out.
#[derive(Default)]
struct WriteTickets {
    next: AtomicU64,
    latest: Mutex<HashMap<String, u64>>,
}

impl WriteTickets {
    fn issue(&self, user_id: &str) -> u64 {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), ticket);
        ticket
    }

    fn is_latest(&self, user_id: &str, ticket: u64) -> bool {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .is_some_and(|latest| *latest == ticket)
    }
}

/// The parts of the pipeline a debounced save needs after its caller is gone.
#[derive(Clone)]
struct CodeWriter {
    api: Arc<dyn SessionApi>,
    store: SessionStore,
    retry: RetryPolicy,
    tickets: Arc<WriteTickets>,
}

impl CodeWriter {
    async fn write(
        &self,
        user_id: String,
        code: String,
        execution_settings: Option<ExecutionSettings>,
        ticket: u64,
    ) -> Result<(), MutationError> {
        if self.store.is_completed() {
            crate::log_debug!("Session ended, not saving code for {}", user_id);
            return Err(MutationError::session_completed(Operation::UpdateCode));
        }

        let session_id = self.store.session_id();
        let request = UpdateCodeRequest {
            student_id: user_id.clone(),
            code,
            execution_settings,
        };
        let label = format!("{} for {}", Operation::UpdateCode, user_id);
        let api = self.api.as_ref();
        let tickets = self.tickets.as_ref();
        let req = &request;
        let sent = with_retry(&self.retry, &label, move || async move {
            if !tickets.is_latest(&req.student_id, ticket) {
                return Ok(false);
            }
            api.update_code(session_id, req).await.map(|()| true)
        })
        .await
        .map_err(|failure| MutationError::from_failure(Operation::UpdateCode, failure))?;

        if !sent || !self.tickets.is_latest(&user_id, ticket) {
            crate::log_debug!("Code save for {} superseded by a newer one", user_id);
            return Ok(());
        }

        let now = Utc::now();
        self.store.update(|state| {
            state.upsert_student(
                StudentPayload {
                    user_id: request.student_id,
                    name: None,
                    code: Some(request.code),
                    last_update: Some(now),
                    execution_settings: request.execution_settings,
                },
                now,
            )
        });
        Ok(())
    }
}

pub struct MutationPipeline {
    writer: CodeWriter,
    code_saves: Debouncer<String, PendingCode>,
}

impl MutationPipeline {
    pub fn new(api: Arc<dyn SessionApi>, store: SessionStore, retry: RetryPolicy, debounce: Duration) -> Self {
        let writer = CodeWriter {
            api,
            store,
            retry,
            tickets: Arc::default(),
        };
        let for_timer = writer.clone();
        let code_saves = Debouncer::new(debounce, move |user_id: String, pending: PendingCode| {
            let writer = for_timer.clone();
            async move {
                match writer
                    .write(user_id.clone(), pending.code, pending.execution_settings, pending.ticket)
                    .await
                {
                    Ok(()) => crate::log_debug!("Saved code for {}", user_id),
                    Err(e) => crate::log_warn!("Code save for {} failed: {}", user_id, e),
                }
            }
            .boxed()
        });
        Self { writer, code_saves }
    }

    fn session_id(&self) -> &str {
        self.writer.store.session_id()
    }

    /// Queue a code save. Calls within the debounce window replace each other;
    /// only the last one is written. An earlier save still retrying stops
    /// once this one is queued.
    pub fn update_code(&self, user_id: &str, code: impl Into<String>, execution_settings: Option<ExecutionSettings>) {
        if self.writer.store.is_completed() {
            crate::log_debug!("Session ended, ignoring code edit from {}", user_id);
            return;
        }
        self.code_saves.arm(
            user_id.to_string(),
            PendingCode {
                code: code.into(),
                execution_settings,
                ticket: self.writer.tickets.issue(user_id),
            },
        );
    }

    /// Save code right away, bypassing the debounce.
    pub async fn update_code_now(
        &self,
        user_id: &str,
        code: impl Into<String>,
        execution_settings: Option<ExecutionSettings>,
    ) -> Result<(), MutationError> {
        self.code_saves.cancel(&user_id.to_string());
        let ticket = self.writer.tickets.issue(user_id);
        self.writer
            .write(user_id.to_string(), code.into(), execution_settings, ticket)
            .await
    }

    /// Write every queued save now. Returns how many were sent.
    pub async fn flush_pending_code(&self) -> usize {
        self.code_saves.flush_all().await
    }

    /// Drop every queued save without sending it.
    pub fn discard_pending_code(&self) {
        self.code_saves.cancel_all();
    }

    pub fn has_pending_code(&self, user_id: &str) -> bool {
        self.code_saves.is_pending(&user_id.to_string())
    }

    /// Run code and return the runner's result. The store is not touched.
    pub async fn execute_code(
        &self,
        user_id: &str,
        code: impl Into<String>,
        execution_settings: Option<ExecutionSettings>,
    ) -> Result<ExecutionResult, MutationError> {
        let request = ExecuteCodeRequest {
            student_id: user_id.to_string(),
            code: code.into(),
            execution_settings,
        };
        let label = format!("{} for {}", Operation::ExecuteCode, user_id);
        let api = self.writer.api.as_ref();
        let session_id = self.session_id();
        let req = &request;
        with_retry(&self.writer.retry, &label, move || api.execute_code(session_id, req))
            .await
            .map_err(|failure| MutationError::from_failure(Operation::ExecuteCode, failure))
    }

    /// Put a student's current code on the public view.
    ///
    /// The local projection switches before the request is sent. If the
    /// server refuses and nothing else changed the projection meanwhile, it
    /// is put back.
    pub async fn feature_student(&self, user_id: &str) -> Result<(), MutationError> {
        let code = self.writer.store.student(user_id).map(|s| s.code);
        let optimistic = FeaturedStudent {
            student_id: Some(user_id.to_string()),
            code,
        };
        self.send_feature(optimistic).await
    }

    /// Take whatever is featured off the public view.
    pub async fn clear_featured(&self) -> Result<(), MutationError> {
        self.send_feature(FeaturedStudent::default()).await
    }

    async fn send_feature(&self, optimistic: FeaturedStudent) -> Result<(), MutationError> {
        let mut previous = FeaturedStudent::default();
        let applied = optimistic.clone();
        self.writer.store.update(|state| {
            previous = state.featured.clone();
            state.set_featured(applied.student_id, applied.code);
        });

        let request = FeatureStudentRequest {
            student_id: optimistic.student_id.clone(),
        };
        let label = match &optimistic.student_id {
            Some(id) => format!("{} {}", Operation::FeatureStudent, id),
            None => "clear featured".to_string(),
        };
        let api = self.writer.api.as_ref();
        let session_id = self.session_id();
        let req = &request;
        let result = with_retry(&self.writer.retry, &label, move || api.feature_student(session_id, req)).await;

        if let Err(failure) = result {
            self.writer.store.update(|state| {
                if state.featured == optimistic {
                    state.set_featured(previous.student_id, previous.code);
                }
            });
            return Err(MutationError::from_failure(Operation::FeatureStudent, failure));
        }
        Ok(())
    }

    /// Enroll in the session. A returning student gets their saved state back.
    pub async fn join_session(&self, user_id: &str, name: &str) -> Result<JoinSessionResponse, MutationError> {
        let request = JoinSessionRequest {
            student_id: user_id.to_string(),
            name: name.to_string(),
        };
        let label = format!("{} as {}", Operation::JoinSession, user_id);
        let api = self.writer.api.as_ref();
        let session_id = self.session_id();
        let req = &request;
        let response = with_retry(&self.writer.retry, &label, move || api.join_session(session_id, req))
            .await
            .map_err(|failure| MutationError::from_failure(Operation::JoinSession, failure))?;

        if let Some(student) = &response.student {
            crate::log_info!(
                "Joined session {} as {} (restored {} bytes of code)",
                self.session_id(),
                user_id,
                student.code.as_ref().map_or(0, String::len)
            );
        }
        Ok(response)
    }
}
