use crate::api::error::AppError;
use axum::{Json, http::Uri};
use serde_json::{Value, json};

pub const ENDPOINTS: [&str; 3] = ["POST /api/prepare", "POST /api/render", "POST /api/run"];

/// Service descriptor returned for any `GET`.
pub async fn index() -> Json<Value> {
    Json(json!({
        "ok": true,
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ENDPOINTS,
    }))
}

pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No endpoint at {}", uri.path()))
}
