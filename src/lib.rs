pub mod api;
pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::api::handlers;
use crate::api::middleware::{auth, cors, method_guard};
use crate::config::GatewayConfig;
use crate::services::pipeline::{PipelineSettings, RenderPipeline};
use crate::services::renderer::RenderEngine;
use crate::services::transform_backend::TransformBackend;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::post,
};
use std::sync::Arc;

/// Slack on top of the file limit for the other multipart fields and framing.
const FORM_OVERHEAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub backend: Arc<dyn TransformBackend>,
    pub renderer: Arc<dyn RenderEngine>,
}

impl AppState {
    pub fn pipeline(&self) -> RenderPipeline {
        RenderPipeline::new(
            self.backend.clone(),
            self.renderer.clone(),
            PipelineSettings::from(&self.config),
        )
    }
}

pub fn create_app(state: AppState) -> Router {
    let body_limit = state.config.max_upload_size + FORM_OVERHEAD_BYTES;

    // Layers run outermost-last: CORS, then the API key, then the method guard.
    Router::new()
        .route("/api/prepare", post(handlers::prepare::prepare))
        .route("/api/render", post(handlers::render::render))
        .route("/api/run", post(handlers::run::run))
        .fallback(handlers::index::not_found)
        .layer(from_fn(method_guard::method_guard))
        .layer(from_fn_with_state(state.clone(), auth::api_key_middleware))
        .layer(from_fn(cors::cors_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
