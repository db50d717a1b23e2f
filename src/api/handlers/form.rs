use crate::api::error::AppError;
use crate::models::{
    DEFAULT_HEADER_ROW, DEFAULT_OUTPUT_NAME, DEFAULT_SHEET_PREFIX, PrepareRequest,
    RenderConfigInput, UploadedFile,
};
use axum::extract::Multipart;
use axum::extract::multipart::MultipartError;
use validator::Validate;

/// Fields of the multipart form shared by `/api/prepare` and `/api/run`.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub file: Option<UploadedFile>,
    pub header_row: Option<String>,
    pub sheet_prefix: Option<String>,
    pub output_name: Option<String>,
    pub zip_name: Option<String>,
    pub cfg_json: Option<String>,
    pub selected_headers_json: Option<String>,
}

fn multipart_error(e: MultipartError) -> AppError {
    let err_msg = e.to_string();
    if err_msg.contains("length limit exceeded") {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::Validation(format!("Malformed multipart body: {}", err_msg))
    }
}

/// Reads the whole form. Unknown fields are skipped.
pub async fn read_upload_form(
    mut multipart: Multipart,
    max_upload_size: usize,
) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            let file_name = field
                .file_name()
                .map(str::to_string)
                .unwrap_or_else(|| "upload.xlsx".to_string());
            let content_type = field
                .content_type()
                .map(str::to_string)
                .filter(|ct| ct != mime::APPLICATION_OCTET_STREAM.as_ref())
                .unwrap_or_else(|| guess_spreadsheet_mime(&file_name).to_string());
            let bytes = field.bytes().await.map_err(multipart_error)?;

            if bytes.len() > max_upload_size {
                return Err(AppError::PayloadTooLarge(format!(
                    "File exceeds the {} byte upload limit",
                    max_upload_size
                )));
            }

            form.file = Some(UploadedFile {
                file_name,
                content_type,
                bytes,
            });
            continue;
        }

        let slot = match name.as_str() {
            "headerRow" => &mut form.header_row,
            "sheetPrefix" => &mut form.sheet_prefix,
            "outputName" => &mut form.output_name,
            "zipName" => &mut form.zip_name,
            "cfgJson" => &mut form.cfg_json,
            "selectedHeadersJson" => &mut form.selected_headers_json,
            _ => {
                tracing::debug!("Ignoring unknown form field '{}'", name);
                continue;
            }
        };
        let text = field.text().await.map_err(multipart_error)?;
        let text = text.trim();
        if !text.is_empty() {
            *slot = Some(text.to_string());
        }
    }

    Ok(form)
}

impl UploadForm {
    /// Builds the `prepare` call, applying defaults for omitted fields.
    pub fn prepare_request(&self) -> Result<PrepareRequest, AppError> {
        let file = self
            .file
            .clone()
            .ok_or_else(|| AppError::Validation("No file provided".to_string()))?;
        if file.bytes.is_empty() {
            return Err(AppError::Validation("Uploaded file is empty".to_string()));
        }

        let header_row = match self.header_row.as_deref() {
            None => DEFAULT_HEADER_ROW,
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|row| *row >= 1)
                .ok_or_else(|| {
                    AppError::Validation(format!(
                        "headerRow must be a positive integer, got '{}'",
                        raw
                    ))
                })?,
        };

        let sheet_prefix = self
            .sheet_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_SHEET_PREFIX.to_string());

        let output_name = self
            .output_name
            .clone()
            .unwrap_or_else(|| default_output_name(&file.file_name));

        Ok(PrepareRequest {
            file,
            header_row,
            sheet_prefix,
            output_name,
        })
    }

    /// Parsed and range-checked `cfgJson`; absent means all defaults.
    pub fn render_config(&self) -> Result<RenderConfigInput, AppError> {
        let cfg = match self.cfg_json.as_deref() {
            None => RenderConfigInput::default(),
            Some(raw) => serde_json::from_str::<RenderConfigInput>(raw)
                .map_err(|e| AppError::Validation(format!("cfgJson is not valid: {}", e)))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn selected_headers(&self) -> Result<Option<Vec<String>>, AppError> {
        match self.selected_headers_json.as_deref() {
            None | Some("null") => Ok(None),
            Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                .map(|headers| Some(headers).filter(|h| !h.is_empty()))
                .map_err(|e| {
                    AppError::Validation(format!(
                        "selectedHeadersJson must be a JSON array of strings: {}",
                        e
                    ))
                }),
        }
    }
}

/// Upload name without its extension, or the generic default.
fn default_output_name(file_name: &str) -> String {
    let stem = match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    };
    let stem = stem.trim();
    if stem.is_empty() {
        DEFAULT_OUTPUT_NAME.to_string()
    } else {
        stem.to_string()
    }
}

fn guess_spreadsheet_mime(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".xlsx") {
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
    } else if lower.ends_with(".xls") {
        "application/vnd.ms-excel"
    } else if lower.ends_with(".csv") {
        "text/csv"
    } else if lower.ends_with(".ods") {
        "application/vnd.oasis.opendocument.spreadsheet"
    } else {
        "application/octet-stream"
    }
}
