use crate::api::error::AppError;
use crate::api::handlers::index::index;
use axum::{
    extract::Request,
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// `GET` on any path describes the service; only `POST` reaches the routes.
pub async fn method_guard(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    match method {
        Method::POST => next.run(req).await,
        Method::GET => index().await.into_response(),
        _ => AppError::MethodNotAllowed(format!("Method {} is not allowed", method))
            .into_response(),
    }
}
