use crate::AppState;
use crate::api::error::AppError;
use crate::models::{RenderJob, RenderRequest};
use crate::services::pipeline::spawn_render_run;
use crate::utils::validation::{attachment_disposition, resolve_zip_name};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use validator::Validate;

pub const OUTPUT_ID_HEADER: &str = "x-output-id";
pub const OUTPUT_URL_HEADER: &str = "x-output-url";

/// Renders an already prepared spreadsheet into a streamed zip of page images.
pub async fn render(
    State(state): State<AppState>,
    payload: Result<Json<RenderRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    request.validate()?;

    let output_id = request
        .output_spreadsheet_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Validation("outputSpreadsheetId is required".to_string()))?
        .to_string();

    let settings = request.cfg.unwrap_or_default().resolve();
    let job = RenderJob::new(output_id, request.selected_headers, settings);

    stream_archive(
        &state,
        job,
        request.zip_name.as_deref(),
        request.output_url.as_deref(),
    )
}

/// Starts the render run and answers with the archive stream. Everything that
/// can be rejected is checked before the run is spawned.
pub(crate) fn stream_archive(
    state: &AppState,
    job: RenderJob,
    zip_name: Option<&str>,
    output_url: Option<&str>,
) -> Result<Response, AppError> {
    let zip_name = resolve_zip_name(zip_name);
    let disposition = HeaderValue::from_str(&attachment_disposition(&zip_name))
        .map_err(|e| AppError::Internal(format!("Invalid Content-Disposition: {}", e)))?;
    let output_id = HeaderValue::from_str(&job.output_id).map_err(|_| {
        AppError::Validation("outputSpreadsheetId contains invalid characters".to_string())
    })?;
    let output_url = output_url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(HeaderValue::from_str)
        .transpose()
        .map_err(|_| AppError::Validation("output_url contains invalid characters".to_string()))?;

    tracing::info!(
        "📦 Streaming {} for output {} (run {})",
        zip_name,
        job.output_id,
        job.run_id
    );

    let (archive, _run) = spawn_render_run(state.pipeline(), job);

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CACHE_CONTROL, "no-store")
        .header(OUTPUT_ID_HEADER, output_id);
    if let Some(url) = output_url {
        response = response.header(OUTPUT_URL_HEADER, url);
    }

    response
        .body(archive.into_body())
        .map_err(|e| AppError::Internal(e.to_string()))
}
