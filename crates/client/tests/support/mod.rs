//! In-memory stand-ins for the REST API and the realtime provider.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use codeclass_client::ws::{ChannelFrame, ChannelHandle, JoinOptions, JoinedChannel, RealtimeBackend, TrackStatus};
use codeclass_client::SessionApi;
use codeclass_shared::{
    ApiError, ExecuteCodeRequest, ExecutionResult, FeatureStudentRequest, FeaturedStudent, JoinSessionRequest,
    JoinSessionResponse, RealtimeError, Session, SessionStateResponse, SessionStatus, StudentState,
    SubscriptionStatus, UpdateCodeRequest,
};
use futures_channel::mpsc::{self, UnboundedSender};
use serde_json::Value;
use tokio::time::Instant;

pub const SESSION_ID: &str = "sess-1";

pub fn student(user_id: &str, name: &str, code: &str) -> StudentState {
    StudentState {
        user_id: user_id.to_string(),
        name: Some(name.to_string()),
        code: Some(code.to_string()),
        last_update: Utc.timestamp_opt(1_704_067_200, 0).single(),
        execution_settings: None,
    }
}

pub fn snapshot(students: Vec<StudentState>) -> SessionStateResponse {
    SessionStateResponse {
        session: Session {
            id: SESSION_ID.to_string(),
            section_id: Some("sec-1".to_string()),
            status: SessionStatus::Active,
            problem: None,
            featured_student_id: None,
            featured_code: None,
            created_at: None,
            ended_at: None,
        },
        students,
        featured_student: FeaturedStudent::default(),
    }
}

pub fn http_error(status: u16, message: &str) -> ApiError {
    ApiError::Http {
        status,
        body: format!(r#"{{"error":"{}"}}"#, message),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// Scripted REST API. Errors queued per endpoint are returned first, in order.
pub struct FakeApi {
    snapshot: Mutex<SessionStateResponse>,
    fetch_errors: Mutex<VecDeque<ApiError>>,
    update_errors: Mutex<VecDeque<ApiError>>,
    feature_errors: Mutex<VecDeque<ApiError>>,
    execute_errors: Mutex<VecDeque<ApiError>>,
    fetches: Mutex<Vec<Instant>>,
    updates: Mutex<Vec<(Instant, UpdateCodeRequest)>>,
    executes: Mutex<Vec<ExecuteCodeRequest>>,
    features: Mutex<Vec<FeatureStudentRequest>>,
    joins: Mutex<Vec<JoinSessionRequest>>,
    feature_latency: Mutex<Duration>,
    fetch_latency: Mutex<Duration>,
    join_reply: Mutex<Option<StudentState>>,
}

impl FakeApi {
    pub fn new(snapshot: SessionStateResponse) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(snapshot),
            fetch_errors: Mutex::default(),
            update_errors: Mutex::default(),
            feature_errors: Mutex::default(),
            execute_errors: Mutex::default(),
            fetches: Mutex::default(),
            updates: Mutex::default(),
            executes: Mutex::default(),
            features: Mutex::default(),
            joins: Mutex::default(),
            feature_latency: Mutex::new(Duration::ZERO),
            fetch_latency: Mutex::new(Duration::ZERO),
            join_reply: Mutex::default(),
        })
    }

    pub fn set_snapshot(&self, snapshot: SessionStateResponse) {
        *lock(&self.snapshot) = snapshot;
    }

    pub fn fail_fetch(&self, error: ApiError) {
        lock(&self.fetch_errors).push_back(error);
    }

    pub fn fail_update(&self, error: ApiError) {
        lock(&self.update_errors).push_back(error);
    }

    pub fn fail_feature(&self, error: ApiError) {
        lock(&self.feature_errors).push_back(error);
    }

    pub fn fail_execute(&self, error: ApiError) {
        lock(&self.execute_errors).push_back(error);
    }

    pub fn set_feature_latency(&self, latency: Duration) {
        *lock(&self.feature_latency) = latency;
    }

    pub fn set_fetch_latency(&self, latency: Duration) {
        *lock(&self.fetch_latency) = latency;
    }

    pub fn set_join_reply(&self, student: StudentState) {
        *lock(&self.join_reply) = Some(student);
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.fetches).len()
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        lock(&self.fetches).clone()
    }

    pub fn updates(&self) -> Vec<UpdateCodeRequest> {
        lock(&self.updates).iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn update_times(&self) -> Vec<Instant> {
        lock(&self.updates).iter().map(|(t, _)| *t).collect()
    }

    pub fn executes(&self) -> Vec<ExecuteCodeRequest> {
        lock(&self.executes).clone()
    }

    pub fn features(&self) -> Vec<FeatureStudentRequest> {
        lock(&self.features).clone()
    }

    pub fn joins(&self) -> Vec<JoinSessionRequest> {
        lock(&self.joins).clone()
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn fetch_state(&self, _session_id: &str) -> Result<SessionStateResponse, ApiError> {
        lock(&self.fetches).push(Instant::now());
        let latency = *lock(&self.fetch_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = lock(&self.fetch_errors).pop_front() {
            return Err(error);
        }
        Ok(lock(&self.snapshot).clone())
    }

    async fn update_code(&self, _session_id: &str, request: &UpdateCodeRequest) -> Result<(), ApiError> {
        lock(&self.updates).push((Instant::now(), request.clone()));
        match lock(&self.update_errors).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn execute_code(
        &self,
        _session_id: &str,
        request: &ExecuteCodeRequest,
    ) -> Result<ExecutionResult, ApiError> {
        lock(&self.executes).push(request.clone());
        if let Some(error) = lock(&self.execute_errors).pop_front() {
            return Err(error);
        }
        Ok(ExecutionResult {
            success: true,
            output: format!("ran {} bytes\n", request.code.len()),
            error: None,
            execution_time: Some(12),
        })
    }

    async fn feature_student(&self, _session_id: &str, request: &FeatureStudentRequest) -> Result<(), ApiError> {
        lock(&self.features).push(request.clone());
        let latency = *lock(&self.feature_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match lock(&self.feature_errors).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn join_session(
        &self,
        _session_id: &str,
        request: &JoinSessionRequest,
    ) -> Result<JoinSessionResponse, ApiError> {
        lock(&self.joins).push(request.clone());
        Ok(JoinSessionResponse {
            success: true,
            student: lock(&self.join_reply).clone(),
        })
    }
}

#[derive(Default)]
struct HandleLog {
    tracked: Mutex<Vec<Value>>,
    leaves: AtomicUsize,
}

struct FakeHandle {
    log: Arc<HandleLog>,
}

#[async_trait]
impl ChannelHandle for FakeHandle {
    async fn track(&self, meta: Value) -> TrackStatus {
        lock(&self.log.tracked).push(meta);
        TrackStatus::Ok
    }

    async fn leave(&self) {
        self.log.leaves.fetch_add(1, Ordering::SeqCst);
    }
}

/// Realtime provider whose frames are pushed by the test.
///
/// Every join answers with the configured status frame (if any) right away.
pub struct FakeBackend {
    join_status: Mutex<Option<SubscriptionStatus>>,
    joins: Mutex<Vec<(String, JoinOptions)>>,
    senders: Mutex<Vec<UnboundedSender<ChannelFrame>>>,
    log: Arc<HandleLog>,
}

impl FakeBackend {
    pub fn new(join_status: Option<SubscriptionStatus>) -> Arc<Self> {
        Arc::new(Self {
            join_status: Mutex::new(join_status),
            joins: Mutex::default(),
            senders: Mutex::default(),
            log: Arc::new(HandleLog::default()),
        })
    }

    pub fn set_join_status(&self, status: Option<SubscriptionStatus>) {
        *lock(&self.join_status) = status;
    }

    pub fn join_count(&self) -> usize {
        lock(&self.joins).len()
    }

    pub fn last_join(&self) -> Option<(String, JoinOptions)> {
        lock(&self.joins).last().cloned()
    }

    pub fn leave_count(&self) -> usize {
        self.log.leaves.load(Ordering::SeqCst)
    }

    pub fn tracked(&self) -> Vec<Value> {
        lock(&self.log.tracked).clone()
    }

    /// Push a frame to the most recently joined channel.
    pub fn emit(&self, frame: ChannelFrame) {
        if let Some(tx) = lock(&self.senders).last() {
            let _ = tx.unbounded_send(frame);
        }
    }
}

#[async_trait]
impl RealtimeBackend for FakeBackend {
    async fn join(&self, topic: &str, options: JoinOptions) -> Result<JoinedChannel, RealtimeError> {
        lock(&self.joins).push((topic.to_string(), options));
        let (tx, rx) = mpsc::unbounded();
        if let Some(status) = *lock(&self.join_status) {
            let _ = tx.unbounded_send(ChannelFrame::status(status));
        }
        lock(&self.senders).push(tx);
        Ok(JoinedChannel {
            frames: rx,
            handle: Arc::new(FakeHandle { log: self.log.clone() }),
        })
    }
}

/// Let spawned tasks run without advancing the paused clock much.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}
