use crate::models::{BuildPagesRequest, PageBatch, PageDescriptor, RenderJob};
use crate::services::transform_backend::{TransformBackend, UpstreamError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Backend did not report completion after {0} batches")]
    LimitExceeded(u32),

    #[error("Backend moved the page offset backwards ({from} -> {to})")]
    CursorRegressed { from: u64, to: u64 },
}

/// Offset/limit position in the backend's page sequence. The backend is
/// authoritative: the next offset is whatever it reports, not `offset + limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    offset: u64,
    limit: u32,
    batches: u32,
    max_batches: u32,
    done: bool,
}

impl PageCursor {
    pub fn new(limit: u32, max_batches: u32) -> Self {
        Self {
            offset: 0,
            limit: limit.max(1),
            batches: 0,
            max_batches: max_batches.max(1),
            done: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn batches_fetched(&self) -> u32 {
        self.batches
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fails once the batch budget is spent without the backend saying `done`.
    pub fn check_budget(&self) -> Result<(), PaginationError> {
        if self.batches >= self.max_batches {
            return Err(PaginationError::LimitExceeded(self.batches));
        }
        Ok(())
    }

    /// Records a received batch. `done` ends the sequence regardless of `nextOffset`.
    pub fn advance(&mut self, batch: &PageBatch) -> Result<(), PaginationError> {
        self.batches += 1;
        if batch.done {
            self.done = true;
            return Ok(());
        }

        let next = batch
            .next_offset
            .unwrap_or(self.offset + batch.pages.len() as u64);
        if next < self.offset {
            return Err(PaginationError::CursorRegressed {
                from: self.offset,
                to: next,
            });
        }
        self.offset = next;
        Ok(())
    }
}

/// Lazily pulls page batches for one render job, one request at a time.
pub struct PageFetcher<'a> {
    backend: &'a dyn TransformBackend,
    job: &'a RenderJob,
    cursor: PageCursor,
}

impl<'a> PageFetcher<'a> {
    pub fn new(backend: &'a dyn TransformBackend, job: &'a RenderJob, cursor: PageCursor) -> Self {
        Self {
            backend,
            job,
            cursor,
        }
    }

    pub fn cursor(&self) -> &PageCursor {
        &self.cursor
    }

    /// Next batch of pages, or `None` once the backend has reported `done`.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<PageDescriptor>>, PaginationError> {
        if self.cursor.is_done() {
            return Ok(None);
        }
        self.cursor.check_budget()?;

        let request = BuildPagesRequest {
            output_id: self.job.output_id.clone(),
            selected_headers: self.job.selected_headers.clone(),
            cfg: self.job.settings.clone(),
            offset: self.cursor.offset(),
            limit: self.cursor.limit(),
        };

        let batch = self.backend.build_pages(&request).await?;
        tracing::info!(
            "📄 Batch {} at offset {}: {} pages (done={}, nextOffset={:?})",
            self.cursor.batches_fetched() + 1,
            request.offset,
            batch.pages.len(),
            batch.done,
            batch.next_offset
        );

        self.cursor.advance(&batch)?;
        Ok(Some(batch.pages))
    }
}
