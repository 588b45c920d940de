//! HTTP client for the session REST API.

use async_trait::async_trait;
use codeclass_shared::{
    ApiError, ExecuteCodeRequest, ExecutionResult, FeatureStudentRequest, JoinSessionRequest,
    JoinSessionResponse, SessionStateResponse, UpdateCodeRequest,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The REST boundary the sync core reads snapshots from and writes through.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// `GET /sessions/{id}/state`
    async fn fetch_state(&self, session_id: &str) -> Result<SessionStateResponse, ApiError>;

    /// `POST /sessions/{id}/code`
    async fn update_code(&self, session_id: &str, request: &UpdateCodeRequest) -> Result<(), ApiError>;

    /// `POST /sessions/{id}/execute`
    async fn execute_code(
        &self,
        session_id: &str,
        request: &ExecuteCodeRequest,
    ) -> Result<ExecutionResult, ApiError>;

    /// `POST /sessions/{id}/feature`
    async fn feature_student(
        &self,
        session_id: &str,
        request: &FeatureStudentRequest,
    ) -> Result<(), ApiError>;

    /// `POST /sessions/{id}/join`
    async fn join_session(
        &self,
        session_id: &str,
        request: &JoinSessionRequest,
    ) -> Result<JoinSessionResponse, ApiError>;
}

/// HTTP client for the session API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            api_key: None,
            access_token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Configure credentials sent with every request
    pub fn with_credentials(mut self, api_key: Option<String>, access_token: Option<String>) -> Self {
        self.api_key = api_key;
        self.access_token = access_token;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    fn session_path(session_id: &str, action: &str) -> String {
        format!("/sessions/{}/{}", urlencoding::encode(session_id), action)
    }

    fn authorize(&self, mut rb: RequestBuilder) -> RequestBuilder {
        if let Some(key) = &self.api_key {
            rb = rb.header("apikey", key);
        }
        if let Some(token) = &self.access_token {
            rb = rb.bearer_auth(token);
        }
        rb
    }

    /// Make a GET request
    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let url = self.url(path);
        let rb = self.authorize(self.client.get(&url));

        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }

        serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    /// Make a POST request with JSON body
    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let url = self.url(path);
        let body_bytes = serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))?;

        let resp = self
            .authorize(self.client.post(&url))
            .body(body_bytes)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp.text().await.map_err(|e| ApiError::Network(e.to_string()))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }

        if text.is_empty() {
            serde_json::from_str("null").map_err(|e| ApiError::Deserialize(e.to_string()))
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
        }
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionApi for ApiClient {
    async fn fetch_state(&self, session_id: &str) -> Result<SessionStateResponse, ApiError> {
        self.get_json(&Self::session_path(session_id, "state")).await
    }

    async fn update_code(&self, session_id: &str, request: &UpdateCodeRequest) -> Result<(), ApiError> {
        let _: serde_json::Value = self.post_json(&Self::session_path(session_id, "code"), request).await?;
        Ok(())
    }

    async fn execute_code(
        &self,
        session_id: &str,
        request: &ExecuteCodeRequest,
    ) -> Result<ExecutionResult, ApiError> {
        self.post_json(&Self::session_path(session_id, "execute"), request).await
    }

    async fn feature_student(
        &self,
        session_id: &str,
        request: &FeatureStudentRequest,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .post_json(&Self::session_path(session_id, "feature"), request)
            .await?;
        Ok(())
    }

    async fn join_session(
        &self,
        session_id: &str,
        request: &JoinSessionRequest,
    ) -> Result<JoinSessionResponse, ApiError> {
        self.post_json(&Self::session_path(session_id, "join"), request).await
    }
}
