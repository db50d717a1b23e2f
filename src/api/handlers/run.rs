use crate::AppState;
use crate::api::error::AppError;
use crate::api::handlers::form::read_upload_form;
use crate::api::handlers::render::stream_archive;
use crate::models::RenderJob;
use crate::services::transform_backend::UpstreamError;
use axum::{
    extract::{Multipart, State},
    response::Response,
};

/// `prepare` followed by `render` in one request.
pub async fn run(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let form = read_upload_form(multipart, state.config.max_upload_size).await?;

    // Reject malformed render options before spending a backend call
    let cfg = form.render_config()?;
    let selected_headers = form.selected_headers()?;
    let request = form.prepare_request()?;
    let zip_name = form
        .zip_name
        .clone()
        .unwrap_or_else(|| request.output_name.clone());

    tracing::info!(
        "🚀 Run for '{}' ({} bytes)",
        request.file.file_name,
        request.file.bytes.len()
    );

    let prepared = state.backend.prepare(request).await?;
    let output_id = prepared.output_id().ok_or_else(|| {
        UpstreamError::Payload("prepare response has no outputSpreadsheetId".to_string())
    })?;

    let headers = selected_headers.or_else(|| prepared.headers());
    let job = RenderJob::new(output_id, headers, cfg.resolve());
    let output_url = prepared.output_url();

    stream_archive(&state, job, Some(&zip_name), output_url.as_deref())
}
