use crate::config::GatewayConfig;
use crate::models::{RasterImage, Viewport};
use crate::utils::retry::{RetryPolicy, Retryable};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// How long the font check may hold a render before it is abandoned.
const FONT_WAIT_TIMEOUT_MS: u64 = 5_000;

const FONTS_READY_FN: &str = "() => !document.fonts || document.fonts.status === 'loaded'";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Rendering engine unavailable: {0}")]
    Unavailable(String),

    #[error("Network error talking to the rendering engine: {0}")]
    Network(String),

    #[error("Rendering engine responded with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Rendering engine returned an empty image")]
    EmptyImage,

    #[error("Render failed: {0}")]
    Failed(String),
}

impl Retryable for RenderError {
    fn is_transient(&self) -> bool {
        match self {
            RenderError::Network(_) => true,
            RenderError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RenderError {
    fn from(err: reqwest::Error) -> Self {
        RenderError::Network(err.to_string())
    }
}

/// One page to rasterize.
#[derive(Debug, Clone, Copy)]
pub struct PageRender<'a> {
    pub html: &'a str,
    pub viewport: Viewport,
    /// Extra settle time after load, for late layout or scripts.
    pub wait_ms: u64,
}

/// Source of rendering sessions. A run acquires exactly one session and reuses it
/// for every page.
#[async_trait::async_trait]
pub trait RenderEngine: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn RenderSession>, RenderError>;
}

/// A held rendering-engine handle. Dropping it releases the underlying resource.
#[async_trait::async_trait]
pub trait RenderSession: Send + Sync {
    /// Full-page PNG screenshot of `page.html`.
    async fn render(&self, page: &PageRender<'_>) -> Result<RasterImage, RenderError>;
}

/// Headless Chrome behind a Browserless instance (`POST /screenshot`).
///
/// Every screenshot call runs in a fresh incognito context on the Browserless
/// side. The semaphore caps how many runs drive the browser at once.
pub struct BrowserlessEngine {
    client: reqwest::Client,
    endpoint: String,
    sessions: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl BrowserlessEngine {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        timeout: Duration,
        max_sessions: usize,
        retry: RetryPolicy,
    ) -> Result<Self, RenderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RenderError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        let mut endpoint = format!("{}/screenshot", base_url.trim_end_matches('/'));
        if let Some(token) = token {
            endpoint.push_str("?token=");
            endpoint.extend(utf8_percent_encode(token, NON_ALPHANUMERIC));
        }

        tracing::info!(
            "🖼️  Browserless engine at {} (max_sessions={})",
            base_url,
            max_sessions
        );

        Ok(Self {
            client,
            endpoint,
            sessions: Arc::new(Semaphore::new(max_sessions.max(1))),
            retry,
        })
    }

    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }
}

#[async_trait::async_trait]
impl RenderEngine for BrowserlessEngine {
    async fn acquire(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        let permit = self
            .sessions
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RenderError::Unavailable("Browser session pool closed".to_string()))?;

        tracing::debug!("🧭 Browser session acquired");
        Ok(Box::new(BrowserlessSession {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            retry: self.retry.clone(),
            _permit: permit,
        }))
    }
}

struct BrowserlessSession {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
    _permit: OwnedSemaphorePermit,
}

impl BrowserlessSession {
    async fn screenshot(&self, payload: &Value) -> Result<RasterImage, RenderError> {
        let resp = self.client.post(&self.endpoint).json(payload).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RenderError::Api {
                status: status.as_u16(),
                message: message.chars().take(300).collect(),
            });
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(RenderError::EmptyImage);
        }
        Ok(RasterImage::new(bytes))
    }
}

#[async_trait::async_trait]
impl RenderSession for BrowserlessSession {
    async fn render(&self, page: &PageRender<'_>) -> Result<RasterImage, RenderError> {
        let payload = screenshot_payload(page);
        self.retry
            .run("Browserless screenshot", || self.screenshot(&payload))
            .await
    }
}

impl Drop for BrowserlessSession {
    fn drop(&mut self) {
        tracing::debug!("🧭 Browser session released");
    }
}

/// Request body for Browserless `/screenshot`.
///
/// `bestAttempt` lets the font check time out without failing the render.
pub fn screenshot_payload(page: &PageRender<'_>) -> Value {
    json!({
        "html": page.html,
        "viewport": page.viewport,
        "gotoOptions": { "waitUntil": "networkidle0" },
        "waitForFunction": { "fn": FONTS_READY_FN, "timeout": FONT_WAIT_TIMEOUT_MS },
        "waitForTimeout": page.wait_ms,
        "bestAttempt": true,
        "options": { "type": "png", "fullPage": true },
    })
}

/// Blank white PNG of the viewport size. For local development without a browser.
pub struct PlaceholderEngine;

#[async_trait::async_trait]
impl RenderEngine for PlaceholderEngine {
    async fn acquire(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        tracing::warn!("PlaceholderEngine: pages will be rendered as blank images");
        Ok(Box::new(PlaceholderSession))
    }
}

struct PlaceholderSession;

#[async_trait::async_trait]
impl RenderSession for PlaceholderSession {
    async fn render(&self, page: &PageRender<'_>) -> Result<RasterImage, RenderError> {
        blank_png(page.viewport.width, page.viewport.height)
    }
}

pub fn blank_png(width: u32, height: u32) -> Result<RasterImage, RenderError> {
    let canvas = image::RgbImage::from_pixel(width.max(1), height.max(1), image::Rgb([255, 255, 255]));
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(canvas)
        .write_to(&mut buf, image::ImageOutputFormat::Png)
        .map_err(|e| RenderError::Failed(e.to_string()))?;
    Ok(RasterImage::new(buf.into_inner()))
}

/// Factory function to create the rendering engine named in the config
pub fn create_render_engine(config: &GatewayConfig) -> Result<Arc<dyn RenderEngine>, RenderError> {
    match config.render_engine.to_lowercase().as_str() {
        "browserless" => Ok(Arc::new(BrowserlessEngine::new(
            &config.browserless_url,
            config.browserless_token.as_deref(),
            config.render_timeout,
            config.max_concurrent_renders,
            config.render_retry.clone(),
        )?)),
        "placeholder" | "none" => Ok(Arc::new(PlaceholderEngine)),
        other => {
            tracing::warn!("Unknown render engine '{}', using PlaceholderEngine", other);
            Ok(Arc::new(PlaceholderEngine))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(html: &str) -> PageRender<'_> {
        PageRender {
            html,
            viewport: Viewport {
                width: 1280,
                height: 900,
                device_scale_factor: 2.0,
            },
            wait_ms: 250,
        }
    }

    #[test]
    fn test_screenshot_payload() {
        let payload = screenshot_payload(&page("<table></table>"));
        assert_eq!(payload["html"], "<table></table>");
        assert_eq!(payload["viewport"]["width"], 1280);
        assert_eq!(payload["viewport"]["height"], 900);
        assert_eq!(payload["viewport"]["deviceScaleFactor"], 2.0);
        assert_eq!(payload["waitForTimeout"], 250);
        assert_eq!(payload["options"]["fullPage"], true);
        assert_eq!(payload["options"]["type"], "png");
        assert_eq!(payload["gotoOptions"]["waitUntil"], "networkidle0");
    }

    #[tokio::test]
    async fn test_session_permit_released_on_drop() {
        let engine = BrowserlessEngine::new(
            "http://127.0.0.1:1",
            None,
            Duration::from_secs(1),
            1,
            RetryPolicy::single_attempt(),
        )
        .unwrap();

        let session = engine.acquire().await.unwrap();
        assert_eq!(engine.available_sessions(), 0);
        drop(session);
        assert_eq!(engine.available_sessions(), 1);
    }

    #[test]
    fn test_token_is_query_encoded() {
        let engine = BrowserlessEngine::new(
            "http://browserless:3000/",
            Some("a&b+c#d"),
            Duration::from_secs(1),
            1,
            RetryPolicy::single_attempt(),
        )
        .unwrap();
        assert_eq!(
            engine.endpoint,
            "http://browserless:3000/screenshot?token=a%26b%2Bc%23d"
        );
    }

    #[tokio::test]
    async fn test_unreachable_browserless_is_network_error() {
        let engine = BrowserlessEngine::new(
            "http://127.0.0.1:1",
            Some("secret"),
            Duration::from_secs(2),
            1,
            RetryPolicy::single_attempt(),
        )
        .unwrap();
        let session = engine.acquire().await.unwrap();
        let err = session.render(&page("<p/>")).await.unwrap_err();
        assert!(matches!(err, RenderError::Network(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_placeholder_renders_png() {
        let session = PlaceholderEngine.acquire().await.unwrap();
        let image = session.render(&page("<p/>")).await.unwrap();
        assert!(image.as_bytes().starts_with(b"\x89PNG\r\n\x1a\n"));
    }

    #[test]
    fn test_create_render_engine() {
        let config = GatewayConfig {
            render_engine: "placeholder".to_string(),
            ..GatewayConfig::default()
        };
        assert!(create_render_engine(&config).is_ok());

        let config = GatewayConfig::default();
        assert!(create_render_engine(&config).is_ok());
    }
}
