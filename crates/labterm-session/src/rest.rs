//! HTTP transport for the lab portal console API.
//!
//! Routes (relative to `backend.base_url`):
//!
//! | operation        | request                                              |
//! |------------------|------------------------------------------------------|
//! | list consoles    | `GET  /labs/{lab}/nodes/{node}/consoles`             |
//! | create session   | `POST /labs/{lab}/nodes/{node}/sessions`             |
//! | close session    | `DELETE /sessions/{session}`                         |
//! | fetch log        | `GET  /labs/{lab}/nodes/{node}/consoles/{id}/log`    |
//! | send command     | `POST /sessions/{session}/input`                     |
//! | probe            | `GET  /health`                                       |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::backend::ConsoleBackend;
use crate::config::BackendConfig;
use crate::error::ConsoleError;
use crate::types::{ConsoleInfo, CreatedSession, LogPayload, ProbeResult, Session};

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Deserialize)]
#[serde(untagged)]
enum ConsoleListBody {
    Bare(Vec<ConsoleInfo>),
    Wrapped { consoles: Vec<ConsoleInfo> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CreateBody {
    Bare(CreatedSession),
    Wrapped { session: CreatedSession },
}

pub struct RestBackend {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .field("auth", &self.auth_token.is_some())
            .finish()
    }
}

impl RestBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self, ConsoleError> {
        let base_url = normalize_base_url(&cfg.base_url)?;
        let client = Client::builder()
            .timeout(cfg.request_timeout())
            .connect_timeout(cfg.connect_timeout())
            .build()
            .map_err(|e| ConsoleError::invalid(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            auth_token: cfg.auth_token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn node_url(&self, lab_id: &str, node_id: &str, rest: &[&str]) -> String {
        let mut segments = vec!["labs", lab_id, "nodes", node_id];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    async fn execute(&self, request: RequestBuilder, resource: &str) -> Result<Response, ConsoleError> {
        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), resource, "console backend request rejected");
        Err(map_status(status, resource, &body, retry_after))
    }
}

#[async_trait]
impl ConsoleBackend for RestBackend {
    async fn list_consoles(
        &self,
        lab_id: &str,
        node_id: &str,
    ) -> Result<Vec<ConsoleInfo>, ConsoleError> {
        let url = self.node_url(lab_id, node_id, &["consoles"]);
        let response = self
            .execute(self.client.get(url), &format!("node {node_id}"))
            .await?;
        let body: ConsoleListBody = response.json().await.map_err(map_decode)?;
        Ok(match body {
            ConsoleListBody::Bare(list) | ConsoleListBody::Wrapped { consoles: list } => list,
        })
    }

    async fn create_session(
        &self,
        lab_id: &str,
        node_id: &str,
        console_type: Option<&str>,
    ) -> Result<CreatedSession, ConsoleError> {
        let url = self.node_url(lab_id, node_id, &["sessions"]);
        let payload = match console_type {
            Some(kind) => json!({ "type": kind }),
            None => json!({}),
        };
        let response = self
            .execute(self.client.post(url).json(&payload), &format!("node {node_id}"))
            .await?;
        let body: CreateBody = response.json().await.map_err(map_decode)?;
        Ok(match body {
            CreateBody::Bare(created) | CreateBody::Wrapped { session: created } => created,
        })
    }

    async fn close_session(&self, session_id: &str) -> Result<(), ConsoleError> {
        let url = self.url(&["sessions", session_id]);
        match self
            .execute(self.client.delete(url), &format!("session {session_id}"))
            .await
        {
            Ok(_) => Ok(()),
            // Already gone on the remote side.
            Err(ConsoleError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn fetch_log(
        &self,
        lab_id: &str,
        node_id: &str,
        console_id: &str,
    ) -> Result<LogPayload, ConsoleError> {
        let url = self.node_url(lab_id, node_id, &["consoles", console_id, "log"]);
        let response = self
            .execute(self.client.get(url), &format!("console log {console_id}"))
            .await?;
        let body = response.text().await.map_err(map_transport)?;
        Ok(decode_log_body(&body))
    }

    async fn send_command(&self, session: &Session, command: &str) -> Result<(), ConsoleError> {
        let url = self.url(&["sessions", &session.session_id, "input"]);
        self.execute(
            self.client.post(url).json(&json!({ "command": command })),
            &format!("session {}", session.session_id),
        )
        .await?;
        Ok(())
    }

    async fn probe_availability(&self) -> Result<ProbeResult, ConsoleError> {
        let url = self.url(&["health"]);
        let mut request = self.client.get(url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let started = Instant::now();
        let response = request.send().await.map_err(map_transport)?;
        let latency = started.elapsed();
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, "health", &body, None));
        }
        Ok(ProbeResult {
            reachable: status.is_success(),
            latency,
        })
    }
}

/// Trim and validate the configured base URL.
pub fn normalize_base_url(raw: &str) -> Result<String, ConsoleError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConsoleError::invalid("backend base_url is empty"));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConsoleError::invalid(format!(
            "backend base_url must be http(s): {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn map_status(
    status: StatusCode,
    resource: &str,
    body: &str,
    retry_after: Option<Duration>,
) -> ConsoleError {
    match status {
        StatusCode::UNAUTHORIZED => ConsoleError::AuthExpired {
            message: error_summary(body).unwrap_or_else(|| "unauthorized".into()),
        },
        StatusCode::NOT_FOUND => ConsoleError::not_found(resource),
        StatusCode::TOO_MANY_REQUESTS => ConsoleError::RateLimited { retry_after },
        other => ConsoleError::Request {
            status: other.as_u16(),
            message: error_summary(body).unwrap_or_else(|| {
                other
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string()
            }),
        },
    }
}

fn map_transport(err: reqwest::Error) -> ConsoleError {
    if err.is_timeout() {
        ConsoleError::Unreachable {
            message: "request timed out".into(),
        }
    } else if err.is_decode() {
        map_decode(err)
    } else {
        ConsoleError::Unreachable {
            message: err.to_string(),
        }
    }
}

fn map_decode(err: reqwest::Error) -> ConsoleError {
    ConsoleError::Decode {
        message: err.to_string(),
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Short human-readable reason from an error body.
fn error_summary(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let text = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => ["error", "message", "detail"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| trimmed.to_string()),
        _ => trimmed.to_string(),
    };
    Some(text.chars().take(MAX_ERROR_BODY_CHARS).collect())
}

/// Interpret a log response body.
///
/// Accepts a JSON array of lines, a JSON string, an object carrying either
/// under `lines`, `log`, `content` or `output`, or plain text.
pub fn decode_log_body(body: &str) -> LogPayload {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => payload_from_value(value, true)
            .unwrap_or_else(|| LogPayload::Blob(body.to_string())),
        Err(_) => LogPayload::Blob(body.to_string()),
    }
}

fn payload_from_value(value: Value, allow_object: bool) -> Option<LogPayload> {
    match value {
        Value::String(text) => Some(LogPayload::Blob(text)),
        Value::Array(items) => Some(LogPayload::Lines(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
        )),
        Value::Null => Some(LogPayload::Lines(Vec::new())),
        Value::Object(mut map) if allow_object => ["lines", "log", "content", "output"]
            .iter()
            .find_map(|k| map.remove(*k))
            .and_then(|inner| payload_from_value(inner, false)),
        _ => None,
    }
}
