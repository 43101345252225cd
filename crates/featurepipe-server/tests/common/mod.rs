//! In-memory collaborators for pipeline tests
//!
//! `FakeSource` serves a fixed list of records, `FakeSink` keeps a table in a
//! map keyed by feature id, and `FakeStore` records uploaded objects. Each
//! can be told to fail on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use featurepipe_common::{JobSummary, LogLevel, ProgressEvent};
use featurepipe_server::ingest::error::{LoadError, SourceError};
use featurepipe_server::ingest::sink::{FeatureSink, LoadOutcome, TableTarget};
use featurepipe_server::ingest::source::{
    AttachmentGroup, AttachmentInfo, FeaturePage, FeatureSource, FieldInfo, LayerMetadata,
    PageRequest, RawRecord, SpatialReference,
};
use featurepipe_server::ingest::transformer::TransformedRow;
use featurepipe_server::ingest::{
    JobSpec, ObjectStore, PipelineOrchestrator, PipelineSettings, ProgressReporter, RetryPolicy,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const LAYER_URL: &str =
    "https://services.arcgis.com/abc/arcgis/rest/services/Trees/FeatureServer/0";

// ============================================================================
// Fixtures
// ============================================================================

/// Point layer with an object id, a name and a height
pub fn point_layer(wkid: Option<u32>) -> LayerMetadata {
    LayerMetadata {
        name: Some("Trees".to_string()),
        fields: vec![
            FieldInfo::new("OBJECTID", "esriFieldTypeOID"),
            FieldInfo::new("Name", "esriFieldTypeString"),
            FieldInfo::new("Height", "esriFieldTypeDouble"),
        ],
        geometry_type: Some("esriGeometryPoint".to_string()),
        object_id_field: Some("OBJECTID".to_string()),
        source_spatial_reference: wkid.map(|wkid| SpatialReference {
            wkid: Some(wkid),
            latest_wkid: None,
        }),
        ..Default::default()
    }
}

/// Attribute-only table
pub fn table_layer() -> LayerMetadata {
    LayerMetadata {
        geometry_type: None,
        source_spatial_reference: None,
        ..point_layer(None)
    }
}

pub fn attributes(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn point_record(oid: i64, x: f64, y: f64) -> RawRecord {
    RawRecord {
        attributes: attributes(json!({
            "OBJECTID": oid,
            "Name": format!("tree {}", oid),
            "Height": oid as f64 / 10.0,
        })),
        geometry: Some(json!({"x": x, "y": y})),
    }
}

/// `count` point records with object ids starting at 1
pub fn point_records(count: i64) -> Vec<RawRecord> {
    (1..=count)
        .map(|oid| point_record(oid, -73.9 + oid as f64 * 0.001, 40.7))
        .collect()
}

pub fn spec(batch_size: u32) -> JobSpec {
    let mut spec = JobSpec::new(LAYER_URL, "trees").unwrap();
    spec.batch_size = batch_size;
    spec
}

/// Default settings with millisecond backoff
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

// ============================================================================
// FakeSource
// ============================================================================

pub struct FakeSource {
    meta: LayerMetadata,
    records: Vec<RawRecord>,
    attachments: HashMap<i64, Vec<AttachmentInfo>>,
    /// Remaining failures per page offset; `true` for transient ones
    page_failures: Mutex<HashMap<u64, (u32, bool)>>,
    failing_attachments: HashSet<i64>,
    describe_error: Option<String>,
    requests: Mutex<Vec<PageRequest>>,
}

impl FakeSource {
    pub fn new(meta: LayerMetadata, records: Vec<RawRecord>) -> Self {
        Self {
            meta,
            records,
            attachments: HashMap::new(),
            page_failures: Mutex::new(HashMap::new()),
            failing_attachments: HashSet::new(),
            describe_error: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// One attachment per feature with id `feature_id * 10`
    pub fn with_attachment_per_feature(mut self) -> Self {
        self.meta.has_attachments = true;
        for record in &self.records {
            let oid = record
                .attributes
                .get("OBJECTID")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            self.attachments.insert(
                oid,
                vec![AttachmentInfo {
                    id: oid * 10,
                    name: Some(format!("photo_{}.JPG", oid)),
                    size: Some(4),
                    content_type: Some("image/jpeg".to_string()),
                    keywords: None,
                    exif_info: None,
                    url: None,
                }],
            );
        }
        self
    }

    pub fn failing_attachment(mut self, attachment_id: i64) -> Self {
        self.failing_attachments.insert(attachment_id);
        self
    }

    /// The page at `offset` fails `times` times before succeeding
    pub fn failing_page(self, offset: u64, times: u32, transient: bool) -> Self {
        self.page_failures
            .lock()
            .unwrap()
            .insert(offset, (times, transient));
        self
    }

    pub fn unreachable(mut self, message: &str) -> Self {
        self.describe_error = Some(message.to_string());
        self
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeatureSource for FakeSource {
    async fn describe(&self) -> Result<LayerMetadata, SourceError> {
        match &self.describe_error {
            Some(message) => Err(SourceError::Status {
                status: 404,
                body: message.clone(),
            }),
            None => Ok(self.meta.clone()),
        }
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeaturePage, SourceError> {
        self.requests.lock().unwrap().push(request.clone());

        if let Some((remaining, transient)) =
            self.page_failures.lock().unwrap().get_mut(&request.offset)
        {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Status {
                    status: if *transient { 503 } else { 400 },
                    body: "page unavailable".to_string(),
                });
            }
        }

        let start = (request.offset as usize).min(self.records.len());
        let end = (start + request.limit as usize).min(self.records.len());
        let mut records = self.records[start..end].to_vec();
        if !request.return_geometry {
            for record in &mut records {
                record.geometry = None;
            }
        }

        Ok(FeaturePage {
            records,
            exceeded_transfer_limit: false,
        })
    }

    async fn query_attachments(
        &self,
        object_ids: &[i64],
    ) -> Result<Vec<AttachmentGroup>, SourceError> {
        Ok(object_ids
            .iter()
            .filter_map(|oid| {
                self.attachments.get(oid).map(|infos| AttachmentGroup {
                    parent_object_id: *oid,
                    parent_global_id: None,
                    attachment_infos: infos.clone(),
                })
            })
            .collect())
    }

    async fn fetch_attachment(
        &self,
        _feature_id: i64,
        attachment: &AttachmentInfo,
    ) -> Result<Bytes, SourceError> {
        if self.failing_attachments.contains(&attachment.id) {
            return Err(SourceError::Status {
                status: 404,
                body: "attachment not found".to_string(),
            });
        }
        Ok(Bytes::from(attachment.id.to_be_bytes().to_vec()))
    }
}

// ============================================================================
// FakeSink
// ============================================================================

#[derive(Default)]
pub struct FakeSink {
    rows: Mutex<BTreeMap<i64, TransformedRow>>,
    targets: Mutex<Vec<TableTarget>>,
    truncates: AtomicUsize,
    upserts: AtomicUsize,
    /// 1-based upsert calls that roll back
    failing_upserts: HashSet<usize>,
    /// Cancel this token once the given upsert call has committed
    cancel_after: Option<(usize, CancellationToken)>,
    /// Every upsert takes this long before committing
    upsert_delay: Option<Duration>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_upsert(mut self, call: usize) -> Self {
        self.failing_upserts.insert(call);
        self
    }

    pub fn cancel_after(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((call, token));
        self
    }

    pub fn slow_upserts(mut self, delay: Duration) -> Self {
        self.upsert_delay = Some(delay);
        self
    }

    pub fn rows(&self) -> BTreeMap<i64, TransformedRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn targets(&self) -> Vec<TableTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn truncate_calls(&self) -> usize {
        self.truncates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureSink for FakeSink {
    async fn ensure_table(&self, target: &TableTarget) -> Result<(), LoadError> {
        self.targets.lock().unwrap().push(target.clone());
        Ok(())
    }

    async fn truncate(&self, _target: &TableTarget) -> Result<(), LoadError> {
        self.truncates.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().unwrap().clear();
        Ok(())
    }

    async fn upsert_batch(
        &self,
        _target: &TableTarget,
        rows: &[TransformedRow],
    ) -> Result<LoadOutcome, LoadError> {
        let call = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.upsert_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_upserts.contains(&call) {
            return Err(LoadError::Rejected(format!("upsert {} rolled back", call)));
        }

        let mut table = self.rows.lock().unwrap();
        let mut attachments = 0;
        for row in rows {
            attachments += row.attachments.len() as u64;
            table.insert(row.feature_id, row.clone());
        }
        drop(table);

        if let Some((after, token)) = &self.cancel_after {
            if call == *after {
                token.cancel();
            }
        }

        Ok(LoadOutcome {
            rows: rows.len() as u64,
            attachments,
        })
    }
}

// ============================================================================
// FakeStore
// ============================================================================

#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl FakeStore {
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        _content_type: Option<&str>,
    ) -> anyhow::Result<String> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(format!("s3://{}/{}", bucket, key))
    }
}

// ============================================================================
// Running jobs
// ============================================================================

/// Run a job to completion, collecting every event it streamed
pub async fn run_job(
    orchestrator: &PipelineOrchestrator,
    spec: JobSpec,
    cancel: CancellationToken,
) -> (JobSummary, Vec<ProgressEvent>) {
    let (reporter, mut rx) = ProgressReporter::channel(spec.log_level, 64);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    let summary = orchestrator.run(spec, reporter, cancel).await;
    let events = collector.await.unwrap();
    (summary, events)
}

pub fn orchestrator(
    source: Arc<FakeSource>,
    sink: Arc<FakeSink>,
    settings: PipelineSettings,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(source, sink, settings)
}

pub fn warnings(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Log {
                level: LogLevel::Warn,
                message,
            } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
