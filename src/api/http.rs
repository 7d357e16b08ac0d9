use crate::api::{AttendanceApi, NewSession, SyncRecord, SyncRequest, SyncResponse};
use crate::database::models::{AttendanceEntry, Session};
use crate::error::ScanError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// reqwest-backed implementation of [`AttendanceApi`].
#[derive(Clone)]
pub struct HttpAttendanceApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct SessionsEnvelope {
    success: bool,
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDetail {
    #[serde(default)]
    attendance_records: Vec<AttendanceEntry>,
}

#[derive(Deserialize)]
struct SessionDetailEnvelope {
    success: bool,
    session: Option<SessionDetail>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct CreatedSessionEnvelope {
    success: bool,
    session: Option<Session>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpAttendanceApi {
    pub fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Cheap reachability check used by the connectivity monitor.
    pub async fn ping(&self) -> bool {
        let request = self.authorized(self.client.head(self.url("/attendance/sessions")));
        match request.send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                tracing::debug!("API unreachable: {}", e);
                false
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ScanError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ScanError::sync(format!("server returned {}: {}", status, body)));
    }
    Ok(response.json::<T>().await?)
}

fn rejected(what: &str, error: Option<String>) -> ScanError {
    ScanError::sync(format!(
        "{} rejected: {}",
        what,
        error.unwrap_or_else(|| "unknown error".to_string())
    ))
}

#[async_trait]
impl AttendanceApi for HttpAttendanceApi {
    async fn list_active_sessions(&self) -> Result<Vec<Session>, ScanError> {
        let request = self
            .authorized(self.client.get(self.url("/attendance/sessions")))
            .query(&[("status", "active")]);
        let envelope: SessionsEnvelope = decode(request.send().await?).await?;
        if !envelope.success {
            return Err(rejected("session listing", envelope.error));
        }

        Ok(envelope
            .sessions
            .into_iter()
            .filter(Session::is_active)
            .collect())
    }

    async fn session_attendance(&self, session_id: i64) -> Result<Vec<AttendanceEntry>, ScanError> {
        let request = self.authorized(
            self.client
                .get(self.url(&format!("/attendance/sessions/{}", session_id))),
        );
        let envelope: SessionDetailEnvelope = decode(request.send().await?).await?;
        if !envelope.success {
            return Err(rejected("session detail", envelope.error));
        }

        Ok(envelope
            .session
            .map(|detail| detail.attendance_records)
            .unwrap_or_default())
    }

    async fn sync_records(&self, records: &[SyncRecord]) -> Result<SyncResponse, ScanError> {
        let request = self
            .authorized(self.client.post(self.url("/attendance/sync")))
            .json(&SyncRequest { records });
        let response: SyncResponse = decode(request.send().await?).await?;
        if !response.success {
            return Err(rejected("sync batch", response.error));
        }
        Ok(response)
    }

    async fn create_session(&self, new_session: &NewSession) -> Result<Session, ScanError> {
        let request = self
            .authorized(self.client.post(self.url("/attendance/sessions")))
            .json(new_session);
        let envelope: CreatedSessionEnvelope = decode(request.send().await?).await?;
        match (envelope.success, envelope.session) {
            (true, Some(session)) => Ok(session),
            (_, _) => Err(rejected("session creation", envelope.error)),
        }
    }
}
