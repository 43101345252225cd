//! Paged extraction
//!
//! Pages are addressed by record offset under a fixed ordering, so any
//! offset handed out as a cursor can be fetched again with the same result.

use crate::ingest::error::FetchError;
use crate::ingest::schema::SourceSchema;
use crate::ingest::settings::RetryPolicy;
use crate::ingest::source::{FeatureSource, PageRequest, RawRecord};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Records of one page, in source order
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub offset: u64,
    pub records: Vec<RawRecord>,
}

#[derive(Debug)]
pub enum FetchOutcome {
    Batch {
        batch: RecordBatch,
        /// Offset of the following page; `None` when this was the last one
        next: Option<u64>,
    },
    Done,
}

pub struct BatchFetcher {
    source: Arc<dyn FeatureSource>,
    batch_size: u32,
    order_by: String,
    return_geometry: bool,
    retry: RetryPolicy,
}

impl BatchFetcher {
    pub fn new(
        source: Arc<dyn FeatureSource>,
        schema: &SourceSchema,
        batch_size: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            batch_size,
            order_by: schema.object_id_field.clone(),
            return_geometry: schema.has_geometry(),
            retry,
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Fetch the page starting at `offset`, retrying transient failures
    #[instrument(skip(self))]
    pub async fn fetch(&self, offset: u64) -> Result<FetchOutcome, FetchError> {
        let request = PageRequest {
            offset,
            limit: self.batch_size,
            order_by: self.order_by.clone(),
            return_geometry: self.return_geometry,
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        let page = loop {
            match self.source.fetch_page(&request).await {
                Ok(page) => break page,
                Err(source) if !source.is_transient() => {
                    return Err(FetchError::Permanent { offset, source });
                },
                Err(source) if attempt >= max_attempts => {
                    return Err(FetchError::Exhausted {
                        offset,
                        attempts: attempt,
                        source,
                    });
                },
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Fetch attempt {}/{} at offset {} failed: {}; retrying in {:?}",
                        attempt, max_attempts, offset, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        };

        let count = page.records.len() as u64;
        if count == 0 {
            debug!(offset, "Empty page, extraction finished");
            return Ok(FetchOutcome::Done);
        }

        let short = count < u64::from(self.batch_size);
        let next = if short && !page.exceeded_transfer_limit {
            None
        } else {
            Some(offset + count)
        };

        debug!(offset, count, ?next, "Fetched page");

        Ok(FetchOutcome::Batch {
            batch: RecordBatch {
                offset,
                records: page.records,
            },
            next,
        })
    }
}
