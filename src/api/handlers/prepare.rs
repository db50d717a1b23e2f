use crate::AppState;
use crate::api::error::AppError;
use crate::api::handlers::form::read_upload_form;
use axum::{
    Json,
    extract::{Multipart, State},
};
use serde_json::Value;

/// Relays the spreadsheet to the transform backend and returns its JSON as-is.
pub async fn prepare(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let form = read_upload_form(multipart, state.config.max_upload_size).await?;
    let request = form.prepare_request()?;

    tracing::info!(
        "📥 Preparing '{}' ({} bytes, headerRow={}, prefix={})",
        request.file.file_name,
        request.file.bytes.len(),
        request.header_row,
        request.sheet_prefix
    );

    let result = state.backend.prepare(request).await?;
    Ok(Json(result.into_value()))
}
