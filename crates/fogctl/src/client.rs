//! HTTP client for the fogd daemon.

use fog_core::{Id, RepoRecord, Run, RunEvent, Session};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: fogd\n  → or set FOG_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("session is busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::Http {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Request payload for POST /api/sessions.
#[derive(Debug, Serialize)]
pub struct CreateSessionRequest {
    pub repo: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    pub autopr: bool,
}

/// Response from POST /api/sessions.
#[derive(Debug, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: Id,
    pub run_id: Id,
    pub status: String,
}

/// Response from POST /api/sessions/{id}/runs.
#[derive(Debug, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: Id,
    pub session: Id,
    pub status: String,
}

/// Response from GET /api/sessions/{id}.
#[derive(Debug, Deserialize)]
pub struct SessionBundle {
    pub session: Session,
    pub runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
}

/// HTTP client for fogd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Probe /api/health.
    pub async fn check_health(&self) -> Result<bool> {
        let url = format!("{}/api/health", self.base_url);
        let response = self.http.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    pub async fn create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        let url = format!("{}/api/sessions", self.base_url);
        let response = self.http.post(&url).json(req).send().await?;
        Self::parse(response).await
    }

    pub async fn create_run(
        &self,
        session_id: &str,
        prompt: &str,
        queue: bool,
    ) -> Result<CreateRunResponse> {
        let url = format!("{}/api/sessions/{session_id}/runs", self.base_url);
        let body = serde_json::json!({ "prompt": prompt, "queue": queue });
        let response = self.http.post(&url).json(&body).send().await?;
        Self::parse(response).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let url = format!("{}/api/sessions", self.base_url);
        let response = self.http.get(&url).send().await?;
        Self::parse(response).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionBundle> {
        let url = format!("{}/api/sessions/{session_id}", self.base_url);
        let response = self.http.get(&url).send().await?;
        Self::parse(response).await
    }

    pub async fn list_events(
        &self,
        session_id: &str,
        run_id: &str,
        since: i64,
    ) -> Result<Vec<RunEvent>> {
        let url = format!(
            "{}/api/sessions/{session_id}/runs/{run_id}/events?since={since}",
            self.base_url
        );
        let response = self.http.get(&url).send().await?;
        Self::parse(response).await
    }

    pub async fn cancel_run(&self, session_id: &str, run_id: &str) -> Result<()> {
        let url = format!(
            "{}/api/sessions/{session_id}/runs/{run_id}/cancel",
            self.base_url
        );
        let response = self.http.post(&url).send().await?;
        Self::expect_ok(response).await
    }

    pub async fn archive_session(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/api/sessions/{session_id}/archive", self.base_url);
        let response = self.http.post(&url).send().await?;
        Self::expect_ok(response).await
    }

    pub async fn list_repos(&self) -> Result<Vec<RepoRecord>> {
        let url = format!("{}/api/repos", self.base_url);
        let response = self.http.get(&url).send().await?;
        Self::parse(response).await
    }

    pub async fn import_repo(&self, name: &str, repo_url: &str) -> Result<RepoRecord> {
        let url = format!("{}/api/repos/import", self.base_url);
        let body = serde_json::json!({ "name": name, "url": repo_url });
        let response = self.http.post(&url).json(&body).send().await?;
        Self::parse(response).await
    }

    pub async fn get_settings(&self) -> Result<HashMap<String, String>> {
        let url = format!("{}/api/settings", self.base_url);
        let response = self.http.get(&url).send().await?;
        Self::parse(response).await
    }

    pub async fn put_settings(&self, settings: &HashMap<String, String>) -> Result<()> {
        let url = format!("{}/api/settings", self.base_url);
        let response = self.http.put(&url).json(settings).send().await?;
        Self::expect_ok(response).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ClientError::InvalidResponse(e.to_string()));
        }
        Err(Self::api_error(status, response).await)
    }

    async fn expect_ok(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Self::api_error(status, response).await)
    }

    async fn api_error(status: reqwest::StatusCode, response: reqwest::Response) -> ClientError {
        let message = match response.json::<ApiError>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        match status.as_u16() {
            404 => ClientError::NotFound(message),
            409 => ClientError::Busy(message),
            code => ClientError::Http {
                status: code,
                message,
            },
        }
    }
}
