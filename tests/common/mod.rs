#![allow(dead_code)]

use axum::body::Body;
use http_body_util::BodyExt;
use serde_json::Value;
use sheet_render_gateway::config::GatewayConfig;
use sheet_render_gateway::models::{
    BuildPagesRequest, PageBatch, PageDescriptor, PrepareRequest, RasterImage, TransformResult,
};
use sheet_render_gateway::services::renderer::{
    PageRender, RenderEngine, RenderError, RenderSession,
};
use sheet_render_gateway::services::transform_backend::{TransformBackend, UpstreamError};
use sheet_render_gateway::{AppState, create_app};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type PrepareReply = Box<dyn Fn() -> Result<Value, UpstreamError> + Send + Sync>;

/// Scripted transform backend. `buildPages` call `n` answers with `batches[n]`,
/// repeating the last batch once the script runs out.
pub struct FakeBackend {
    prepare_reply: PrepareReply,
    batches: Vec<PageBatch>,
    pub prepare_calls: Mutex<Vec<PrepareRequest>>,
    pub build_calls: Mutex<Vec<BuildPagesRequest>>,
}

impl FakeBackend {
    pub fn new(batches: Vec<PageBatch>) -> Self {
        Self {
            prepare_reply: Box::new(|| -> Result<Value, UpstreamError> {
                Ok(serde_json::json!({
                    "ok": true,
                    "outputSpreadsheetId": "out-123",
                    "outputUrl": "https://docs.google.com/spreadsheets/d/out-123",
                    "headers": ["Name", "Qty"]
                }))
            }),
            batches,
            prepare_calls: Mutex::new(Vec::new()),
            build_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_prepare<F>(mut self, reply: F) -> Self
    where
        F: Fn() -> Result<Value, UpstreamError> + Send + Sync + 'static,
    {
        self.prepare_reply = Box::new(reply);
        self
    }

    pub fn build_offsets(&self) -> Vec<u64> {
        self.build_calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect()
    }

    pub fn build_call_count(&self) -> usize {
        self.build_calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl TransformBackend for FakeBackend {
    async fn prepare(&self, request: PrepareRequest) -> Result<TransformResult, UpstreamError> {
        self.prepare_calls.lock().unwrap().push(request);
        (self.prepare_reply)().map(TransformResult::new)
    }

    async fn build_pages(&self, request: &BuildPagesRequest) -> Result<PageBatch, UpstreamError> {
        let mut calls = self.build_calls.lock().unwrap();
        let index = calls.len().min(self.batches.len().saturating_sub(1));
        calls.push(request.clone());
        self.batches
            .get(index)
            .cloned()
            .ok_or_else(|| UpstreamError::Payload("no batches scripted".to_string()))
    }
}

/// Pages named `{prefix}{start}..` with the name as their html.
pub fn pages(prefix: &str, start: usize, count: usize) -> Vec<PageDescriptor> {
    (start..start + count)
        .map(|i| PageDescriptor {
            name: format!("{}{}", prefix, i),
            html: format!("{}{}", prefix, i),
            width: None,
        })
        .collect()
}

pub fn batch(pages: Vec<PageDescriptor>, done: bool, next_offset: Option<u64>) -> PageBatch {
    PageBatch {
        pages,
        done,
        next_offset,
    }
}

/// Counts sessions and renders; fails on the page whose html equals `fail_on`.
#[derive(Default)]
pub struct FakeRenderer {
    pub fail_on: Option<String>,
    pub acquired: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
    pub rendered: Arc<Mutex<Vec<String>>>,
}

impl FakeRenderer {
    pub fn failing_on(html: &str) -> Self {
        Self {
            fail_on: Some(html.to_string()),
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RenderEngine for FakeRenderer {
    async fn acquire(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            fail_on: self.fail_on.clone(),
            released: self.released.clone(),
            rendered: self.rendered.clone(),
        }))
    }
}

struct FakeSession {
    fail_on: Option<String>,
    released: Arc<AtomicUsize>,
    rendered: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl RenderSession for FakeSession {
    async fn render(&self, page: &PageRender<'_>) -> Result<RasterImage, RenderError> {
        self.rendered.lock().unwrap().push(page.html.to_string());
        if self.fail_on.as_deref() == Some(page.html) {
            return Err(RenderError::Failed(format!("boom on {}", page.html)));
        }
        Ok(RasterImage::new(format!("PNG:{}", page.html).into_bytes()))
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        apps_script_url: "http://127.0.0.1:9/exec".to_string(),
        render_engine: "placeholder".to_string(),
        ..GatewayConfig::default()
    }
}

pub fn app_with(
    config: GatewayConfig,
    backend: Arc<FakeBackend>,
    renderer: Arc<FakeRenderer>,
) -> axum::Router {
    create_app(AppState {
        config,
        backend,
        renderer,
    })
}

pub async fn body_bytes(body: Body) -> Vec<u8> {
    body.collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(body: Body) -> Value {
    serde_json::from_slice(&body_bytes(body).await).unwrap()
}

/// Entry names and contents, in archive order.
pub fn zip_entries(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            file.read_to_end(&mut data).unwrap();
            (file.name().to_string(), data)
        })
        .collect()
}

pub const BOUNDARY: &str = "---------------------------sheetrendergateway";

/// Multipart body with an optional spreadsheet and text fields.
pub fn multipart_body(file: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((filename, content)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn upload<'a>(name: &'a str, content: &'a [u8]) -> Option<(&'a str, &'a [u8])> {
    Some((name, content))
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}
