use crate::AppState;
use crate::api::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests without the configured `X-API-Key`. No key configured, no check.
pub async fn api_key_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.config.api_key.as_deref() {
        let provided = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();

        if !keys_match(provided.as_bytes(), expected.as_bytes()) {
            tracing::warn!(
                "🔒 Rejected {} {}: missing or invalid API key",
                req.method(),
                req.uri().path()
            );
            return Err(AppError::Unauthorized(
                "Missing or invalid X-API-Key".to_string(),
            ));
        }
    }

    Ok(next.run(req).await)
}

/// Length-dependent but otherwise constant-time comparison.
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
