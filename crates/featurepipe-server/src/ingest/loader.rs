//! Batch loading into the target table
//!
//! The first call prepares the table; every call after that is one upsert
//! transaction. Loads are issued one at a time by the orchestrator, so two
//! batches never write the same row concurrently.

use crate::ingest::error::LoadError;
use crate::ingest::job::LoadMode;
use crate::ingest::sink::{FeatureSink, LoadOutcome, TableTarget};
use crate::ingest::transformer::TransformedRow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct TableLoader {
    sink: Arc<dyn FeatureSink>,
    target: TableTarget,
    mode: LoadMode,
    prepared: bool,
}

impl TableLoader {
    pub fn new(sink: Arc<dyn FeatureSink>, target: TableTarget, mode: LoadMode) -> Self {
        Self {
            sink,
            target,
            mode,
            prepared: false,
        }
    }

    /// Create or extend the table, and empty it in replace mode. Runs once.
    #[instrument(skip(self), fields(table = %self.target.table))]
    pub async fn prepare(&mut self) -> Result<(), LoadError> {
        if self.prepared {
            return Ok(());
        }

        self.sink.ensure_table(&self.target).await?;
        if self.mode == LoadMode::Replace {
            info!("Replace mode: emptying {}.{}", self.target.schema, self.target.table);
            self.sink.truncate(&self.target).await?;
        }

        self.prepared = true;
        Ok(())
    }

    /// Upsert one batch in a single transaction
    pub async fn load(&mut self, rows: Vec<TransformedRow>) -> Result<LoadOutcome, LoadError> {
        self.prepare().await?;

        let rows = dedupe_last(rows);
        if rows.is_empty() {
            debug!("Nothing to load");
            return Ok(LoadOutcome::default());
        }

        self.sink.upsert_batch(&self.target, &rows).await
    }
}

/// Keep the last occurrence of each feature id, preserving first-seen order
pub fn dedupe_last(rows: Vec<TransformedRow>) -> Vec<TransformedRow> {
    let mut position: HashMap<i64, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<TransformedRow> = Vec::with_capacity(rows.len());

    for row in rows {
        match position.get(&row.feature_id) {
            Some(&i) => out[i] = row,
            None => {
                position.insert(row.feature_id, out.len());
                out.push(row);
            },
        }
    }

    out
}
