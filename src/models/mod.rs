use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_HEADER_ROW: u32 = 6;
pub const DEFAULT_SHEET_PREFIX: &str = "CT";
pub const DEFAULT_OUTPUT_NAME: &str = "output";

pub const DEFAULT_MIN_WIDTH: u32 = 1200;
pub const DEFAULT_DEVICE_SCALE_FACTOR: f64 = 2.0;
pub const DEFAULT_WAIT_MS: u64 = 300;

/// Viewport height is fixed; screenshots are full-page so it only affects layout.
pub const VIEWPORT_HEIGHT: u32 = 900;

/// Spreadsheet received from the client.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// Everything the `prepare` action needs.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub file: UploadedFile,
    pub header_row: u32,
    pub sheet_prefix: String,
    pub output_name: String,
}

/// Backend reply to `prepare`. Kept as raw JSON so it can be passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult(Value);

impl TransformResult {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Identifier of the spreadsheet the backend produced.
    pub fn output_id(&self) -> Option<String> {
        ["outputSpreadsheetId", "outputId"]
            .iter()
            .filter_map(|key| self.0.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|id| !id.is_empty())
            .map(str::to_string)
    }

    pub fn output_url(&self) -> Option<String> {
        self.0
            .get("outputUrl")
            .and_then(Value::as_str)
            .filter(|url| !url.trim().is_empty())
            .map(str::to_string)
    }

    /// Column headers detected by the backend, if it reported any.
    pub fn headers(&self) -> Option<Vec<String>> {
        self.0.get("headers").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }
}

/// One renderable page as described by the backend.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PageDescriptor {
    pub name: String,
    pub html: String,
    /// Natural table width in CSS px, when the backend measured it.
    #[serde(default)]
    pub width: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageBatch {
    #[serde(default)]
    pub pages: Vec<PageDescriptor>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub next_offset: Option<u64>,
}

/// `cfg` object as sent by the client. Unknown keys are forwarded to the backend.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfigInput {
    #[validate(range(min = 200, max = 8000, message = "minWidth must be between 200 and 8000"))]
    pub min_width: Option<u32>,

    #[validate(range(
        min = 0.5,
        max = 4.0,
        message = "deviceScaleFactor must be between 0.5 and 4"
    ))]
    pub device_scale_factor: Option<f64>,

    #[validate(range(max = 30000, message = "waitMs must not exceed 30000"))]
    pub wait_ms: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RenderConfigInput {
    pub fn resolve(self) -> RenderSettings {
        RenderSettings {
            min_width: self.min_width.unwrap_or(DEFAULT_MIN_WIDTH),
            device_scale_factor: self
                .device_scale_factor
                .unwrap_or(DEFAULT_DEVICE_SCALE_FACTOR),
            wait_ms: self.wait_ms.unwrap_or(DEFAULT_WAIT_MS),
            extra: self.extra,
        }
    }
}

/// Render configuration with defaults applied.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderSettings {
    pub min_width: u32,
    pub device_scale_factor: f64,
    pub wait_ms: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderConfigInput::default().resolve()
    }
}

impl RenderSettings {
    pub fn viewport_for(&self, page: &PageDescriptor) -> Viewport {
        Viewport {
            width: page.width.unwrap_or(0).max(self.min_width),
            height: VIEWPORT_HEIGHT,
            device_scale_factor: self.device_scale_factor,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

/// JSON body of `POST /api/render`.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub output_spreadsheet_id: Option<String>,
    pub selected_headers: Option<Vec<String>>,
    #[validate(nested)]
    pub cfg: Option<RenderConfigInput>,
    pub zip_name: Option<String>,
    #[serde(rename = "output_url")]
    pub output_url: Option<String>,
}

/// `buildPages` request for one cursor position.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildPagesRequest {
    pub output_id: String,
    pub selected_headers: Option<Vec<String>>,
    pub cfg: RenderSettings,
    pub offset: u64,
    pub limit: u32,
}

/// A render run, fully validated.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub run_id: Uuid,
    pub output_id: String,
    pub selected_headers: Option<Vec<String>>,
    pub settings: RenderSettings,
}

impl RenderJob {
    pub fn new(
        output_id: String,
        selected_headers: Option<Vec<String>>,
        settings: RenderSettings,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            output_id,
            // An empty filter means "all columns"
            selected_headers: selected_headers.filter(|h| !h.is_empty()),
            settings,
        }
    }
}

/// PNG bytes produced by the rendering engine for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage(Bytes);

impl RasterImage {
    pub const EXTENSION: &'static str = "png";

    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transform_result_accessors() {
        let result = TransformResult::new(json!({
            "ok": true,
            "outputSpreadsheetId": "  1AbC  ",
            "outputUrl": "https://docs.google.com/spreadsheets/d/1AbC",
            "headers": ["Name", "Qty", 3]
        }));
        assert_eq!(result.output_id().as_deref(), Some("1AbC"));
        assert_eq!(
            result.output_url().as_deref(),
            Some("https://docs.google.com/spreadsheets/d/1AbC")
        );
        assert_eq!(result.headers(), Some(vec!["Name".to_string(), "Qty".to_string()]));

        let fallback = TransformResult::new(json!({"outputSpreadsheetId": "", "outputId": "x"}));
        assert_eq!(fallback.output_id().as_deref(), Some("x"));
        assert!(TransformResult::new(json!({"ok": true})).output_id().is_none());
    }

    #[test]
    fn test_page_batch_defaults() {
        let batch: PageBatch =
            serde_json::from_value(json!({"pages": [{"name": "A", "html": "<p>a</p>"}]}))
                .unwrap();
        assert!(!batch.done);
        assert_eq!(batch.next_offset, None);
        assert_eq!(batch.pages[0].width, None);
    }

    #[test]
    fn test_render_config_defaults_and_passthrough() {
        let input: RenderConfigInput =
            serde_json::from_value(json!({"waitMs": 50, "theme": "dark"})).unwrap();
        let settings = input.resolve();
        assert_eq!(settings.min_width, DEFAULT_MIN_WIDTH);
        assert_eq!(settings.wait_ms, 50);
        let wire = serde_json::to_value(&settings).unwrap();
        assert_eq!(wire["theme"], "dark");
        assert_eq!(wire["minWidth"], 1200);
    }

    #[test]
    fn test_render_config_validation() {
        let input: RenderConfigInput =
            serde_json::from_value(json!({"deviceScaleFactor": 9.0})).unwrap();
        assert!(input.validate().is_err());

        let input: RenderConfigInput = serde_json::from_value(json!({"minWidth": 800})).unwrap();
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_viewport_uses_wider_of_page_and_min_width() {
        let settings = RenderSettings::default();
        let narrow = PageDescriptor {
            name: "a".into(),
            html: String::new(),
            width: Some(600),
        };
        let wide = PageDescriptor {
            width: Some(2400),
            ..narrow.clone()
        };
        assert_eq!(settings.viewport_for(&narrow).width, 1200);
        assert_eq!(settings.viewport_for(&wide).width, 2400);
        assert_eq!(settings.viewport_for(&wide).height, VIEWPORT_HEIGHT);
    }

    #[test]
    fn test_render_job_drops_empty_header_filter() {
        let job = RenderJob::new("id".into(), Some(vec![]), RenderSettings::default());
        assert!(job.selected_headers.is_none());
    }
}
