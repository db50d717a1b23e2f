use crate::config::GatewayConfig;
use crate::services::transform_backend::{AppsScriptClient, TransformBackend};
use std::sync::Arc;
use tracing::info;

pub fn setup_backend(config: &GatewayConfig) -> anyhow::Result<Arc<dyn TransformBackend>> {
    info!(
        "📜 Apps Script backend: {} (timeout={:?}, attempts={})",
        config.apps_script_url, config.backend_timeout, config.backend_retry.max_attempts
    );

    let client = AppsScriptClient::new(
        &config.apps_script_url,
        config.backend_timeout,
        config.backend_retry.clone(),
    )?;
    Ok(Arc::new(client))
}
