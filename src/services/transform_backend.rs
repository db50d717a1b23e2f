use crate::models::{BuildPagesRequest, PageBatch, PrepareRequest, TransformResult};
use crate::utils::retry::{RetryPolicy, Retryable};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Network error talking to Apps Script: {0}")]
    Network(String),

    /// The deployment answered with a web page (login wall, wrong URL, error page).
    #[error("Apps Script returned HTML instead of JSON (check the deployment URL and access): {snippet}")]
    HtmlResponse { status: u16, snippet: String },

    #[error("Apps Script returned invalid JSON: {snippet}")]
    InvalidJson { status: u16, snippet: String },

    /// The backend answered `ok: false`.
    #[error("{0}")]
    Rejected(String),

    #[error("Apps Script responded with status {status}: {snippet}")]
    Status { status: u16, snippet: String },

    #[error("Apps Script returned an unexpected payload: {0}")]
    Payload(String),
}

impl UpstreamError {
    /// True when the backend explicitly refused the request, as opposed to a
    /// transport or deployment problem.
    pub fn is_rejection(&self) -> bool {
        matches!(self, UpstreamError::Rejected(_))
    }
}

impl Retryable for UpstreamError {
    fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Network(_) => true,
            UpstreamError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::Network(err.to_string())
    }
}

/// The spreadsheet transformation service.
#[async_trait::async_trait]
pub trait TransformBackend: Send + Sync {
    /// Uploads the workbook and builds the output spreadsheet.
    async fn prepare(&self, request: PrepareRequest) -> Result<TransformResult, UpstreamError>;

    /// Fetches one batch of rendered HTML pages.
    async fn build_pages(&self, request: &BuildPagesRequest) -> Result<PageBatch, UpstreamError>;
}

/// Client for an Apps Script web app deployed with a `doPost` handler that
/// dispatches on `action`.
pub struct AppsScriptClient {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl AppsScriptClient {
    pub fn new(url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.trim().to_string(),
            retry,
        })
    }

    async fn call(&self, action: &str, payload: &Value) -> Result<Value, UpstreamError> {
        self.retry
            .run(&format!("Apps Script '{}'", action), move || {
                self.send_once(payload)
            })
            .await
    }

    async fn send_once(&self, payload: &Value) -> Result<Value, UpstreamError> {
        // Apps Script answers POSTs with a 302 to script.googleusercontent.com;
        // reqwest follows it by default.
        let resp = self.client.post(&self.url).json(payload).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_backend_response(status, &body)
    }
}

#[async_trait::async_trait]
impl TransformBackend for AppsScriptClient {
    async fn prepare(&self, request: PrepareRequest) -> Result<TransformResult, UpstreamError> {
        let payload = prepare_payload(&request);
        tracing::info!(
            "📤 prepare: {} ({} bytes, headerRow={}, prefix={})",
            request.file.file_name,
            request.file.bytes.len(),
            request.header_row,
            request.sheet_prefix
        );
        let value = self.call("prepare", &payload).await?;
        Ok(TransformResult::new(value))
    }

    async fn build_pages(&self, request: &BuildPagesRequest) -> Result<PageBatch, UpstreamError> {
        let payload = build_pages_payload(request);
        let value = self.call("buildPages", &payload).await?;
        serde_json::from_value(value).map_err(|e| UpstreamError::Payload(e.to_string()))
    }
}

pub fn prepare_payload(request: &PrepareRequest) -> Value {
    json!({
        "action": "prepare",
        "fileName": request.file.file_name,
        "mimeType": request.file.content_type,
        "fileBase64": BASE64.encode(&request.file.bytes),
        "headerRow": request.header_row,
        "sheetPrefix": request.sheet_prefix,
        "outputName": request.output_name,
    })
}

pub fn build_pages_payload(request: &BuildPagesRequest) -> Value {
    json!({
        "action": "buildPages",
        "outputSpreadsheetId": request.output_id,
        "selectedHeaders": request.selected_headers,
        "cfg": request.cfg,
        "offset": request.offset,
        "limit": request.limit,
    })
}

/// Classifies a backend reply. HTML and non-JSON bodies are never treated as data.
pub fn parse_backend_response(status: StatusCode, body: &str) -> Result<Value, UpstreamError> {
    let trimmed = body.trim_start_matches('\u{feff}').trim();

    if trimmed.starts_with('<') {
        return Err(UpstreamError::HtmlResponse {
            status: status.as_u16(),
            snippet: snippet(trimmed),
        });
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) if !status.is_success() => {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                snippet: snippet(trimmed),
            });
        }
        Err(_) => {
            return Err(UpstreamError::InvalidJson {
                status: status.as_u16(),
                snippet: snippet(trimmed),
            });
        }
    };

    if !value.is_object() {
        return Err(UpstreamError::InvalidJson {
            status: status.as_u16(),
            snippet: snippet(trimmed),
        });
    }

    if value.get("ok").and_then(Value::as_bool) == Some(false) {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or("unknown error");
        return Err(UpstreamError::Rejected(message.to_string()));
    }

    if !status.is_success() {
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            snippet: snippet(trimmed),
        });
    }

    Ok(value)
}

fn snippet(body: &str) -> String {
    let mut out: String = body.chars().take(SNIPPET_CHARS).collect();
    if body.chars().nth(SNIPPET_CHARS).is_some() {
        out.push('…');
    }
    out
}
