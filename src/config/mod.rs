use crate::utils::retry::RetryPolicy;
use std::env;
use std::time::Duration;

/// Runtime configuration for the gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deployed Apps Script web app URL (the transform backend)
    pub apps_script_url: String,

    /// Shared secret expected in `X-API-Key`. `None` disables the check.
    pub api_key: Option<String>,

    /// Rendering engine: "browserless" or "placeholder" (default: "browserless")
    pub render_engine: String,

    /// Browserless base URL (default: "http://127.0.0.1:3000")
    pub browserless_url: String,

    /// Browserless API token, sent as `?token=`
    pub browserless_token: Option<String>,

    /// Maximum spreadsheet upload size in bytes (default: 50 MB)
    pub max_upload_size: usize,

    /// Pages requested per `buildPages` call (default: 10)
    pub page_batch_size: u32,

    /// Upper bound on `buildPages` calls per run (default: 500)
    pub max_page_batches: u32,

    /// Archive chunks buffered between the encoder and the client (default: 16)
    pub archive_channel_capacity: usize,

    /// Deflate archive entries; stored otherwise (default: true)
    pub archive_deflate: bool,

    /// Append an `ERROR.txt` entry when a run fails mid-stream (default: false)
    pub archive_error_marker: bool,

    /// Browser sessions allowed at once across all runs (default: 2)
    pub max_concurrent_renders: usize,

    /// Timeout for a single transform backend call (default: 120s)
    pub backend_timeout: Duration,

    /// Timeout for a single screenshot call (default: 60s)
    pub render_timeout: Duration,

    pub backend_retry: RetryPolicy,
    pub render_retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            apps_script_url: String::new(),
            api_key: None,
            render_engine: "browserless".to_string(),
            browserless_url: "http://127.0.0.1:3000".to_string(),
            browserless_token: None,
            max_upload_size: 50 * 1024 * 1024, // 50 MB
            page_batch_size: 10,
            max_page_batches: 500,
            archive_channel_capacity: 16,
            archive_deflate: true,
            archive_error_marker: false,
            max_concurrent_renders: 2,
            backend_timeout: Duration::from_secs(120),
            render_timeout: Duration::from_secs(60),
            backend_retry: RetryPolicy::single_attempt(),
            render_retry: RetryPolicy::single_attempt(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();
        let base_delay = env::var("RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default.backend_retry.base_delay);

        Self {
            apps_script_url: env::var("APPS_SCRIPT_URL").unwrap_or(default.apps_script_url),

            api_key: env::var("API_KEY").ok().filter(|v| !v.trim().is_empty()),

            render_engine: env::var("RENDER_ENGINE").unwrap_or(default.render_engine),

            browserless_url: env::var("BROWSERLESS_URL").unwrap_or(default.browserless_url),

            browserless_token: env::var("BROWSERLESS_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),

            max_upload_size: env::var("MAX_UPLOAD_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_upload_size),

            page_batch_size: env::var("PAGE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.page_batch_size),

            max_page_batches: env::var("MAX_PAGE_BATCHES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.max_page_batches),

            archive_channel_capacity: env::var("ARCHIVE_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.archive_channel_capacity),

            archive_deflate: env::var("ARCHIVE_COMPRESSION")
                .map(|v| v.to_lowercase() != "stored")
                .unwrap_or(default.archive_deflate),

            archive_error_marker: env::var("ARCHIVE_ERROR_MARKER")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.archive_error_marker),

            max_concurrent_renders: env::var("MAX_CONCURRENT_RENDERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.max_concurrent_renders),

            backend_timeout: env::var("BACKEND_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.backend_timeout),

            render_timeout: env::var("RENDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.render_timeout),

            backend_retry: RetryPolicy {
                max_attempts: env::var("BACKEND_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default.backend_retry.max_attempts),
                base_delay,
            },

            render_retry: RetryPolicy {
                max_attempts: env::var("RENDER_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default.render_retry.max_attempts),
                base_delay,
            },
        }
    }

    /// Local setup: Apps Script dev deployment, no key, placeholder images
    pub fn development() -> Self {
        Self {
            apps_script_url: env::var("APPS_SCRIPT_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8788/exec".to_string()),
            api_key: None,
            render_engine: "placeholder".to_string(),
            ..Self::default()
        }
    }

    /// Checks settings the service cannot start without
    pub fn validate(&self) -> Result<(), String> {
        if self.apps_script_url.trim().is_empty() {
            return Err("APPS_SCRIPT_URL must be set".to_string());
        }
        if !self.apps_script_url.starts_with("http://")
            && !self.apps_script_url.starts_with("https://")
        {
            return Err(format!(
                "APPS_SCRIPT_URL must be an http(s) URL, got '{}'",
                self.apps_script_url
            ));
        }
        Ok(())
    }
}
