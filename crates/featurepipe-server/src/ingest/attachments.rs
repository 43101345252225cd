//! Attachment archival
//!
//! For every row of a batch, lists the feature's attachments, downloads each
//! payload and uploads it to object storage under a key derived from the
//! feature id and attachment id. Re-running a batch overwrites the same keys.

use crate::ingest::error::{AttachmentError, RecordError};
use crate::ingest::source::{AttachmentInfo, FeatureSource};
use crate::ingest::transformer::TransformedRow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Object ids per `queryAttachments` request
const LIST_CHUNK_SIZE: usize = 100;

/// Longest file extension carried into a storage key
const MAX_EXTENSION_LEN: usize = 10;

/// Object storage the pipeline archives attachments into
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, overwriting any existing object, and return
    /// the object's URI
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> anyhow::Result<String>;
}

/// One attachment of one feature
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRecord {
    pub attachment_id: i64,
    pub feature_id: i64,
    pub global_id: Option<String>,
    pub info: AttachmentInfo,
    /// Set once the payload is archived; `None` when the transfer failed
    pub storage_uri: Option<String>,
}

#[derive(Debug, Default)]
pub struct AttachOutcome {
    pub stored: u64,
    pub errors: Vec<RecordError>,
}

/// Deterministic storage key: `{table}/{feature_id}/{attachment_id}[.ext]`
pub fn attachment_key(table: &str, feature_id: i64, attachment_id: i64, name: Option<&str>) -> String {
    let extension = name
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        });

    match extension {
        Some(ext) => format!("{}/{}/{}.{}", table, feature_id, attachment_id, ext),
        None => format!("{}/{}/{}", table, feature_id, attachment_id),
    }
}

pub struct AttachmentStore {
    source: Arc<dyn FeatureSource>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    table: String,
    concurrency: usize,
}

impl AttachmentStore {
    pub fn new(
        source: Arc<dyn FeatureSource>,
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        table: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            store,
            bucket: bucket.into(),
            table: table.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Archive the attachments of `rows` and attach their records to them.
    /// Failures are returned as record errors; rows are never dropped.
    #[instrument(skip_all, fields(rows = rows.len()))]
    pub async fn process(&self, rows: &mut [TransformedRow]) -> AttachOutcome {
        let mut outcome = AttachOutcome::default();

        let index: HashMap<i64, usize> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.feature_id, i))
            .collect();
        let ids: Vec<i64> = rows.iter().map(|row| row.feature_id).collect();

        let mut pending = Vec::new();
        for chunk in ids.chunks(LIST_CHUNK_SIZE) {
            match self.source.query_attachments(chunk).await {
                Ok(groups) => {
                    for group in groups {
                        let Some(&row) = index.get(&group.parent_object_id) else {
                            debug!(feature_id = group.parent_object_id, "Attachment group for unknown feature");
                            continue;
                        };
                        for info in group.attachment_infos {
                            pending.push((
                                row,
                                AttachmentRecord {
                                    attachment_id: info.id,
                                    feature_id: group.parent_object_id,
                                    global_id: group.parent_global_id.clone(),
                                    info,
                                    storage_uri: None,
                                },
                            ));
                        }
                    }
                },
                Err(e) => {
                    let err = AttachmentError::List(e);
                    warn!("Listing attachments for {} features failed: {}", chunk.len(), err);
                    outcome.errors.push(RecordError::attachment(None, None, &err));
                },
            }
        }

        debug!(attachments = pending.len(), "Transferring attachments");

        let results: Vec<_> = stream::iter(pending)
            .map(|(row, mut record)| async move {
                let result = self.transfer(&record).await;
                if let Ok(uri) = &result {
                    record.storage_uri = Some(uri.clone());
                }
                (row, record, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (row, record, result) in results {
            match result {
                Ok(_) => outcome.stored += 1,
                Err(err) => {
                    warn!(
                        feature_id = record.feature_id,
                        attachment_id = record.attachment_id,
                        "Attachment transfer failed: {}",
                        err
                    );
                    outcome.errors.push(RecordError::attachment(
                        Some(record.feature_id),
                        Some(record.attachment_id),
                        &err,
                    ));
                },
            }
            rows[row].attachments.push(record);
        }

        for row in rows.iter_mut() {
            row.attachments.sort_by_key(|a| a.attachment_id);
        }
        outcome.errors.sort_by_key(|e| (e.feature_id, e.attachment_id));

        outcome
    }

    async fn transfer(&self, record: &AttachmentRecord) -> Result<String, AttachmentError> {
        let data = self
            .source
            .fetch_attachment(record.feature_id, &record.info)
            .await
            .map_err(AttachmentError::Download)?;

        let key = attachment_key(
            &self.table,
            record.feature_id,
            record.attachment_id,
            record.info.name.as_deref(),
        );

        self.store
            .put(&self.bucket, &key, data, record.info.content_type.as_deref())
            .await
            .map_err(|e| AttachmentError::Upload {
                key,
                message: e.to_string(),
            })
    }
}
