use crate::config::GatewayConfig;
use crate::services::renderer::{RenderEngine, create_render_engine};
use std::sync::Arc;
use tracing::info;

pub fn setup_renderer(config: &GatewayConfig) -> anyhow::Result<Arc<dyn RenderEngine>> {
    if config.render_engine.eq_ignore_ascii_case("placeholder") {
        info!("🧪 Placeholder renderer enabled: pages become blank PNGs");
    } else {
        info!(
            "🌐 Render engine: {} at {} ({} concurrent sessions)",
            config.render_engine, config.browserless_url, config.max_concurrent_renders
        );
    }

    Ok(create_render_engine(config)?)
}
