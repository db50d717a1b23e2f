use crate::config::GatewayConfig;
use crate::models::{RasterImage, RenderJob};
use crate::services::archive::{ArchiveBody, ArchiveError, ArchiveState, ArchiveWriter, archive_channel};
use crate::services::pagination::{PageCursor, PageFetcher, PaginationError};
use crate::services::renderer::{PageRender, RenderEngine, RenderError};
use crate::services::transform_backend::TransformBackend;
use crate::utils::validation::ensure_extension;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Entry appended to a failed archive when error markers are enabled.
pub const ERROR_MARKER_NAME: &str = "ERROR.txt";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Pagination(#[from] PaginationError),

    #[error("Could not open a rendering session: {0}")]
    Session(RenderError),

    #[error("Rendering page '{page}' failed: {source}")]
    Render {
        page: String,
        #[source]
        source: RenderError,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: u32,
    pub max_batches: u32,
    pub channel_capacity: usize,
    pub deflate: bool,
    pub error_marker: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for PipelineSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            batch_size: config.page_batch_size,
            max_batches: config.max_page_batches,
            channel_capacity: config.archive_channel_capacity,
            deflate: config.archive_deflate,
            error_marker: config.archive_error_marker,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pages_written: usize,
    pub batches_fetched: u32,
    pub bytes_sent: u64,
}

/// Fetch -> render -> archive, strictly sequential within one run.
#[derive(Clone)]
pub struct RenderPipeline {
    backend: Arc<dyn TransformBackend>,
    renderer: Arc<dyn RenderEngine>,
    settings: PipelineSettings,
}

impl RenderPipeline {
    pub fn new(
        backend: Arc<dyn TransformBackend>,
        renderer: Arc<dyn RenderEngine>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            backend,
            renderer,
            settings,
        }
    }

    /// Runs `job` into `writer`. The writer is finalized before this returns,
    /// whether the run succeeded or not.
    pub async fn run(
        &self,
        job: &RenderJob,
        writer: &mut ArchiveWriter,
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();
        let outcome = self.render_pages(job, writer, &mut summary).await;

        if let Err(e) = &outcome {
            tracing::error!(
                "❌ Run ended early after {} pages / {} batches: {}",
                summary.pages_written,
                summary.batches_fetched,
                e
            );
            if self.settings.error_marker && !writer.is_finalized() {
                let message = format!(
                    "Rendering stopped after {} pages.\n\n{}\n",
                    summary.pages_written, e
                );
                if let Err(marker_err) = writer.add_entry(ERROR_MARKER_NAME, message.as_bytes()).await {
                    tracing::warn!("Could not write error marker: {}", marker_err);
                }
            }
        }

        let finalized = if writer.is_finalized() {
            Err(ArchiveError::InvalidState {
                state: ArchiveState::Finalized,
                action: "finalize",
            })
        } else {
            writer.finish().await
        };

        match (outcome, finalized) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(archive)) => {
                summary.bytes_sent = archive.bytes_sent;
                Ok(summary)
            }
        }
    }

    async fn render_pages(
        &self,
        job: &RenderJob,
        writer: &mut ArchiveWriter,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        // Held for the whole run; dropping it releases the browser slot on every path.
        let session = self
            .renderer
            .acquire()
            .await
            .map_err(PipelineError::Session)?;

        let cursor = PageCursor::new(self.settings.batch_size, self.settings.max_batches);
        let mut fetcher = PageFetcher::new(self.backend.as_ref(), job, cursor);

        while let Some(pages) = fetcher.next_batch().await? {
            summary.batches_fetched = fetcher.cursor().batches_fetched();

            for page in pages {
                let render = PageRender {
                    html: &page.html,
                    viewport: job.settings.viewport_for(&page),
                    wait_ms: job.settings.wait_ms,
                };
                let image = session
                    .render(&render)
                    .await
                    .map_err(|source| PipelineError::Render {
                        page: page.name.clone(),
                        source,
                    })?;

                let entry_name = ensure_extension(&page.name, RasterImage::EXTENSION);
                let written = writer.add_entry(&entry_name, image.as_bytes()).await?;
                summary.pages_written += 1;
                tracing::debug!("🖼️  {} ({} bytes)", written, image.len());
            }
        }

        Ok(())
    }
}

/// Opens the archive stream and runs `job` on a detached task feeding it.
/// The body can be returned to the client right away.
pub fn spawn_render_run(
    pipeline: RenderPipeline,
    job: RenderJob,
) -> (ArchiveBody, JoinHandle<Result<RunSummary, PipelineError>>) {
    let (mut writer, body) = archive_channel(
        pipeline.settings.channel_capacity,
        pipeline.settings.deflate,
    );

    let span = tracing::info_span!(
        "render_run",
        run_id = %job.run_id,
        output_id = %job.output_id,
    );

    let task = tokio::spawn(
        async move {
            tracing::info!("🎬 Render run started");
            let result = pipeline.run(&job, &mut writer).await;
            if let Ok(summary) = &result {
                tracing::info!(
                    "✅ Render run complete: {} pages in {} batches, {} bytes",
                    summary.pages_written,
                    summary.batches_fetched,
                    summary.bytes_sent
                );
            }
            result
        }
        .instrument(span),
    );

    (body, task)
}
