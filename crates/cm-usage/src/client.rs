use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::record::CallEvent;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("usage API rejected the session")]
    Unauthorized,
    #[error("usage API returned HTTP {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

/// The persisted usage store, as seen by the tracker. Both calls are
/// best-effort; the tracker logs failures and carries on.
#[async_trait]
pub trait UsageBackend: Send + Sync {
    /// Raw snapshot: `{callsToday, history, ...}`. Validation happens in the reducer.
    async fn fetch_snapshot(&self) -> Result<Value, SyncError>;

    async fn record_call(&self, event: &CallEvent) -> Result<(), SyncError>;
}

/// Optional authenticated identity for the usage API.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub token: String,
}

pub struct HttpUsageClient {
    http: reqwest::Client,
    base_url: String,
    session: Option<Session>,
}

impl HttpUsageClient {
    pub fn new(base_url: impl Into<String>, session: Option<Session>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.session {
            Some(session) => req.bearer_auth(&session.token),
            None => req,
        }
    }

    fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SyncError> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized);
        }
        if !status.is_success() {
            return Err(SyncError::Status(status.as_u16()));
        }
        Ok(resp)
    }
}

#[async_trait]
impl UsageBackend for HttpUsageClient {
    async fn fetch_snapshot(&self) -> Result<Value, SyncError> {
        let resp = self
            .authorize(self.http.get(self.url("/api/usage/stats")))
            .send()
            .await?;
        let resp = Self::check_status(resp)?;
        Ok(resp.json::<Value>().await?)
    }

    async fn record_call(&self, event: &CallEvent) -> Result<(), SyncError> {
        let resp = self
            .authorize(self.http.post(self.url("/api/usage/record")))
            .json(event)
            .send()
            .await?;
        Self::check_status(resp)?;
        Ok(())
    }
}

/// Map the store's wire snapshot (`history`) onto the reducer's keys (`callHistory`).
pub fn persisted_from_snapshot(snapshot: &Value) -> Value {
    serde_json::json!({
        "callsToday": snapshot.get("callsToday").cloned().unwrap_or(Value::Null),
        "callHistory": snapshot.get("history").cloned().unwrap_or(Value::Null),
    })
}
