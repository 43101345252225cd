//! Job orchestration
//!
//! A job moves through `initializing → probing → streaming → completed |
//! failed`. While streaming, a producer fetches, transforms and attaches
//! batches ahead of the loader, bounded by `max_in_flight` permits: a permit
//! is taken before a page is fetched and released once that batch's load
//! commits or rolls back. Loads run strictly one after another in fetch
//! order.
//!
//! All progress counters live in [`JobState`], owned by the consuming side,
//! so events reach the caller in completion order.

use crate::ingest::attachments::{AttachOutcome, AttachmentStore, ObjectStore};
use crate::ingest::error::{FetchError, JobError, LoadError, RecordError};
use crate::ingest::fetcher::{BatchFetcher, FetchOutcome};
use crate::ingest::job::JobSpec;
use crate::ingest::loader::TableLoader;
use crate::ingest::progress::{Delivery, ProgressReporter};
use crate::ingest::schema::SchemaProbe;
use crate::ingest::settings::PipelineSettings;
use crate::ingest::sink::{FeatureSink, LoadOutcome, TableTarget};
use crate::ingest::source::FeatureSource;
use crate::ingest::transformer::{GeometryTransformer, TransformedRow};
use featurepipe_common::{
    BatchErrorKind, JobProgress, JobStatus, JobSummary, LogLevel, Phase, ProgressEvent, Stage,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Stage messages buffered between producer and consumer
const BATCH_CHANNEL_CAPACITY: usize = 32;

/// In partial-success mode, this many failed pages in a row end the job
const MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 3;

/// How long the final summary waits for room in a stalled stream
const SUMMARY_GRACE: Duration = Duration::from_secs(2);

pub struct PipelineOrchestrator {
    source: Arc<dyn FeatureSource>,
    sink: Arc<dyn FeatureSink>,
    store: Option<Arc<dyn ObjectStore>>,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        source: Arc<dyn FeatureSource>,
        sink: Arc<dyn FeatureSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            sink,
            store: None,
            settings,
        }
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run one job to completion. Never fails: every outcome, including
    /// cancellation, ends in a summary that is also the last event sent.
    #[instrument(skip_all, fields(table = %spec.table, url = %spec.url))]
    pub async fn run(
        &self,
        spec: JobSpec,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> JobSummary {
        let started = Instant::now();
        let deadline = self.settings.job_timeout.map(|after| Deadline {
            at: started + after,
            after,
        });

        let mut job = JobState::new(&reporter, &cancel, deadline);
        job.set_phase(Phase::Initializing).await;

        if let Err(e) = self.execute(&spec, &mut job).await {
            job.fail(e);
        }

        job.finish(started).await
    }

    async fn execute(&self, spec: &JobSpec, job: &mut JobState<'_>) -> Result<(), JobError> {
        spec.validate()?;

        let bucket = spec.bucket.as_deref().filter(|_| spec.attachments_enabled());
        if bucket.is_some() && self.store.is_none() {
            return Err(JobError::InvalidSpec(
                "save_attachments requires object storage to be configured".to_string(),
            ));
        }

        job.set_phase(Phase::Probing).await;
        let probe = SchemaProbe::new(self.source.as_ref(), self.settings.default_crs);
        let probed = tokio::select! {
            result = probe.probe(spec) => result?,
            err = interrupted(job.cancel, job.deadline) => return Err(err),
        };

        for warning in &probed.warnings {
            job.log(LogLevel::Warn, warning.clone()).await;
        }

        let schema = Arc::new(probed.schema);
        job.log(
            LogLevel::Info,
            format!(
                "Layer {}: {} fields, {}, source CRS {}",
                schema.layer_name.as_deref().unwrap_or("(unnamed)"),
                schema.fields.len(),
                schema
                    .geometry
                    .map_or_else(|| "no geometry".to_string(), |g| format!("{:?} geometry", g)),
                schema.source_crs
            ),
        )
        .await;

        let target_crs = spec.target_crs.unwrap_or(schema.source_crs);
        let transformer = GeometryTransformer::new(schema.clone(), target_crs);
        let reprojection = transformer.reprojection();
        if schema.has_geometry() && reprojection.is_deferred() {
            job.log(
                LogLevel::Info,
                format!(
                    "Reprojecting {} to {} in the database",
                    schema.source_crs, target_crs
                ),
            )
            .await;
        }

        let attachments = match (&self.store, bucket) {
            (Some(store), Some(bucket)) if schema.has_attachments => Some(AttachmentStore::new(
                self.source.clone(),
                store.clone(),
                bucket,
                spec.table.clone(),
                self.settings.attachment_concurrency,
            )),
            (Some(_), Some(_)) => {
                job.log(LogLevel::Info, "Layer has no attachments, nothing to archive")
                    .await;
                None
            },
            _ => None,
        };

        let target = TableTarget::from_schema(spec, &schema, reprojection);
        let mut loader = TableLoader::new(self.sink.clone(), target, spec.mode);

        job.set_phase(Phase::Streaming).await;
        tokio::select! {
            result = loader.prepare() => result.map_err(JobError::Prepare)?,
            err = interrupted(job.cancel, job.deadline) => return Err(err),
        }
        job.log(
            LogLevel::Info,
            format!(
                "Loading into {}.{} from offset {} in batches of {}",
                spec.schema, spec.table, spec.start_offset, probed.page_size
            ),
        )
        .await;

        let fetcher = BatchFetcher::new(
            self.source.clone(),
            &schema,
            probed.page_size,
            self.settings.retry,
        );

        let stop = job.cancel.child_token();
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let producer = Producer {
            fetcher: &fetcher,
            transformer: &transformer,
            attachments: attachments.as_ref(),
            permits: Arc::new(Semaphore::new(self.settings.max_in_flight.max(1))),
            stop: stop.clone(),
            start_offset: spec.start_offset,
            partial_success: spec.partial_success,
        };

        tokio::join!(
            producer.run(tx),
            consume(job, loader, rx, stop, spec.partial_success)
        );

        Ok(())
    }
}

// ============================================================================
// Producer: fetch, transform, attach
// ============================================================================

/// A batch that is ready to load. Holds its in-flight permit.
struct PreparedBatch {
    batch: u64,
    offset: u64,
    fetched: u64,
    rows: Vec<TransformedRow>,
    permit: OwnedSemaphorePermit,
}

enum BatchMessage {
    Fetched {
        batch: u64,
        offset: u64,
        records: u64,
    },
    Transformed {
        batch: u64,
        rows: u64,
        errors: Vec<RecordError>,
    },
    Attached {
        batch: u64,
        outcome: AttachOutcome,
    },
    Ready(PreparedBatch),
    FetchFailed {
        batch: u64,
        error: FetchError,
        fatal: bool,
    },
}

struct Producer<'a> {
    fetcher: &'a BatchFetcher,
    transformer: &'a GeometryTransformer,
    attachments: Option<&'a AttachmentStore>,
    permits: Arc<Semaphore>,
    stop: CancellationToken,
    start_offset: u64,
    partial_success: bool,
}

impl Producer<'_> {
    async fn run(self, tx: mpsc::Sender<BatchMessage>) {
        let mut cursor = self.start_offset;
        let mut batch = 0u64;
        let mut consecutive_failures = 0u32;

        loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.stop.cancelled() => break,
            };
            batch += 1;

            let fetched = tokio::select! {
                result = self.fetcher.fetch(cursor) => result,
                _ = self.stop.cancelled() => break,
            };

            let (records, next) = match fetched {
                Ok(FetchOutcome::Done) => break,
                Ok(FetchOutcome::Batch { batch: page, next }) => {
                    consecutive_failures = 0;
                    (page.records, next)
                },
                Err(error) => {
                    consecutive_failures += 1;
                    let fatal = !self.partial_success
                        || consecutive_failures >= MAX_CONSECUTIVE_PAGE_FAILURES;
                    let sent = tx
                        .send(BatchMessage::FetchFailed {
                            batch,
                            error,
                            fatal,
                        })
                        .await;
                    if fatal || sent.is_err() {
                        break;
                    }
                    cursor += u64::from(self.fetcher.batch_size());
                    continue;
                },
            };

            let offset = cursor;
            let fetched = records.len() as u64;
            if tx
                .send(BatchMessage::Fetched {
                    batch,
                    offset,
                    records: fetched,
                })
                .await
                .is_err()
            {
                break;
            }

            let output = self.transformer.transform(records);
            let mut rows = output.rows;
            if tx
                .send(BatchMessage::Transformed {
                    batch,
                    rows: rows.len() as u64,
                    errors: output.errors,
                })
                .await
                .is_err()
            {
                break;
            }

            if let Some(store) = self.attachments {
                let outcome = tokio::select! {
                    outcome = store.process(&mut rows) => outcome,
                    _ = self.stop.cancelled() => break,
                };
                if tx.send(BatchMessage::Attached { batch, outcome }).await.is_err() {
                    break;
                }
            }

            let ready = PreparedBatch {
                batch,
                offset,
                fetched,
                rows,
                permit,
            };
            if tx.send(BatchMessage::Ready(ready)).await.is_err() {
                break;
            }

            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }
    }
}

// ============================================================================
// Consumer: sequential loads and progress accounting
// ============================================================================

/// A finished load; dropping it releases the batch's permit
struct LoadedBatch {
    batch: u64,
    offset: u64,
    fetched: u64,
    _permit: OwnedSemaphorePermit,
}

type LoadFuture = BoxFuture<'static, (TableLoader, LoadedBatch, Result<LoadOutcome, LoadError>)>;

fn load_batch(mut loader: TableLoader, prepared: PreparedBatch) -> LoadFuture {
    async move {
        let PreparedBatch {
            batch,
            offset,
            fetched,
            rows,
            permit,
        } = prepared;
        let result = loader.load(rows).await;
        let loaded = LoadedBatch {
            batch,
            offset,
            fetched,
            _permit: permit,
        };
        (loader, loaded, result)
    }
    .boxed()
}

async fn consume(
    job: &mut JobState<'_>,
    loader: TableLoader,
    mut rx: mpsc::Receiver<BatchMessage>,
    stop: CancellationToken,
    partial_success: bool,
) {
    let mut loader = Some(loader);
    let mut loads: FuturesUnordered<LoadFuture> = FuturesUnordered::new();
    let mut ready: VecDeque<PreparedBatch> = VecDeque::new();
    let mut producer_done = false;
    let mut stop_seen = false;

    loop {
        if stop.is_cancelled() {
            if !ready.is_empty() {
                info!("Discarding {} prepared batches", ready.len());
                ready.clear();
            }
        } else if loads.is_empty() {
            if let Some(next) = ready.pop_front() {
                if let Some(idle) = loader.take() {
                    loads.push(load_batch(idle, next));
                }
            }
        }

        if loads.is_empty() && producer_done && ready.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            Some((returned, loaded, result)) = loads.next(), if !loads.is_empty() => {
                loader = Some(returned);
                job.loaded(loaded, result, partial_success, &stop).await;
            }
            message = rx.recv(), if !producer_done => match message {
                Some(BatchMessage::Ready(prepared)) => ready.push_back(prepared),
                Some(message) => job.handle(message).await,
                None => producer_done = true,
            },
            _ = stop.cancelled(), if !stop_seen => {
                stop_seen = true;
                if job.cancel.is_cancelled() && !job.timed_out {
                    job.log(LogLevel::Warn, "Job cancelled, finishing the batch in flight").await;
                }
            }
            _ = wait_deadline(job.deadline), if job.deadline.is_some() && !job.timed_out => {
                job.time_out();
            }
        }
    }
}

// ============================================================================
// Job state
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    after: Duration,
}

async fn wait_deadline(deadline: Option<Deadline>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.at).await,
        None => std::future::pending().await,
    }
}

/// Resolves when the job is cancelled or runs out of time
async fn interrupted(cancel: &CancellationToken, deadline: Option<Deadline>) -> JobError {
    tokio::select! {
        _ = cancel.cancelled() => JobError::Cancelled,
        _ = wait_deadline(deadline) => {
            JobError::TimedOut(deadline.map(|d| d.after).unwrap_or_default())
        }
    }
}

struct JobState<'a> {
    reporter: &'a ProgressReporter,
    cancel: &'a CancellationToken,
    deadline: Option<Deadline>,
    progress: JobProgress,
    /// First error that ended the job
    failure: Option<JobError>,
    last_cursor: Option<u64>,
    /// Lowest offset of a page that was skipped or rolled back; the resume
    /// cursor never moves past it
    first_gap: Option<u64>,
    timed_out: bool,
}

impl<'a> JobState<'a> {
    fn new(
        reporter: &'a ProgressReporter,
        cancel: &'a CancellationToken,
        deadline: Option<Deadline>,
    ) -> Self {
        Self {
            reporter,
            cancel,
            deadline,
            progress: JobProgress::default(),
            failure: None,
            last_cursor: None,
            first_gap: None,
            timed_out: false,
        }
    }

    fn fail(&mut self, err: JobError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    /// Fail the job with a timeout and stop every stage
    fn time_out(&mut self) {
        if self.timed_out {
            return;
        }
        self.timed_out = true;
        if let Some(deadline) = self.deadline {
            warn!("Job timed out after {:?}, stopping", deadline.after);
            self.fail(JobError::TimedOut(deadline.after));
        }
        self.cancel.cancel();
    }

    fn record_gap(&mut self, offset: u64) {
        self.first_gap = Some(self.first_gap.map_or(offset, |gap| gap.min(offset)));
    }

    fn resume_cursor(&self, next: u64) -> u64 {
        self.first_gap.map_or(next, |gap| gap.min(next))
    }

    /// A closed stream means the caller left; stop the job
    fn disconnected(&self) {
        if !self.cancel.is_cancelled() {
            warn!("Progress stream closed by the caller, cancelling job");
            self.cancel.cancel();
        }
    }

    /// Send an event. A full channel never outlasts the deadline or a
    /// cancellation: past either, the event is dropped.
    async fn emit(&mut self, event: ProgressEvent) {
        let deadline = self.deadline.filter(|_| !self.timed_out);
        let give_up = interrupted(self.cancel, deadline);
        match self.reporter.emit_or(event, give_up).await {
            Delivery::Sent => {},
            Delivery::Closed => self.disconnected(),
            Delivery::Abandoned if self.cancel.is_cancelled() => {
                debug!("Caller is not reading, dropping progress event");
            },
            Delivery::Abandoned => self.time_out(),
        }
    }

    async fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        match self.reporter.log_event(level, message) {
            Some(event) => self.emit(event).await,
            None if self.reporter.is_closed() => self.disconnected(),
            None => {},
        }
    }

    async fn set_phase(&mut self, phase: Phase) {
        self.progress.phase = phase;
        self.emit(ProgressEvent::Phase { phase }).await;
    }

    async fn stage(&mut self, batch: u64, stage: Stage, records: u64, next_cursor: Option<u64>) {
        self.emit(ProgressEvent::Stage {
            batch,
            stage,
            records,
            next_cursor,
            progress: self.progress.clone(),
        })
        .await;
    }

    async fn record_errors(&mut self, batch: u64, errors: Vec<RecordError>) {
        self.progress.errors += errors.len() as u64;
        for err in errors {
            self.emit(ProgressEvent::RecordError {
                kind: err.kind,
                batch,
                feature_id: err.feature_id,
                attachment_id: err.attachment_id,
                message: err.message,
            })
            .await;
        }
    }

    async fn handle(&mut self, message: BatchMessage) {
        match message {
            BatchMessage::Fetched {
                batch,
                offset,
                records,
            } => {
                self.progress.records_fetched += records;
                self.log(
                    LogLevel::Debug,
                    format!("Batch {}: fetched {} records at offset {}", batch, records, offset),
                )
                .await;
                self.stage(batch, Stage::Fetch, records, None).await;
            },
            BatchMessage::Transformed {
                batch,
                rows,
                errors,
            } => {
                self.progress.records_skipped += errors.len() as u64;
                if !errors.is_empty() {
                    self.log(
                        LogLevel::Debug,
                        format!("Batch {}: skipped {} invalid records", batch, errors.len()),
                    )
                    .await;
                }
                self.record_errors(batch, errors).await;
                self.stage(batch, Stage::Transform, rows, None).await;
            },
            BatchMessage::Attached { batch, outcome } => {
                self.progress.attachments_stored += outcome.stored;
                self.progress.attachment_failures += outcome.errors.len() as u64;
                self.record_errors(batch, outcome.errors).await;
                self.stage(batch, Stage::Attach, outcome.stored, None).await;
            },
            BatchMessage::FetchFailed {
                batch,
                error,
                fatal,
            } => {
                self.progress.pages_failed += 1;
                self.progress.errors += 1;
                self.record_gap(error.offset());
                error!(batch, fatal, "Fetch failed: {}", error);
                self.emit(ProgressEvent::BatchError {
                    kind: BatchErrorKind::Fetch,
                    batch,
                    cursor: error.offset(),
                    message: error.to_string(),
                    fatal,
                })
                .await;
                if fatal {
                    self.fail(JobError::Fetch(error));
                }
            },
            BatchMessage::Ready(_) => {},
        }
    }

    async fn loaded(
        &mut self,
        loaded: LoadedBatch,
        result: Result<LoadOutcome, LoadError>,
        partial_success: bool,
        stop: &CancellationToken,
    ) {
        let batch = loaded.batch;
        match result {
            Ok(outcome) => {
                let next_cursor = self.resume_cursor(loaded.offset + loaded.fetched);
                self.progress.records_loaded += outcome.rows;
                self.progress.batches_loaded += 1;
                self.last_cursor = Some(next_cursor);
                self.log(
                    LogLevel::Debug,
                    format!(
                        "Batch {}: committed {} rows, {} attachment records",
                        batch, outcome.rows, outcome.attachments
                    ),
                )
                .await;
                self.stage(batch, Stage::Load, outcome.rows, Some(next_cursor))
                    .await;
            },
            Err(source) => {
                let fatal = !partial_success;
                self.record_gap(loaded.offset);
                self.progress.batches_failed += 1;
                self.progress.errors += 1;
                error!(batch, fatal, "Load failed, batch rolled back: {}", source);
                self.emit(ProgressEvent::BatchError {
                    kind: BatchErrorKind::Load,
                    batch,
                    cursor: loaded.offset,
                    message: source.to_string(),
                    fatal,
                })
                .await;
                if fatal {
                    self.fail(JobError::Load { batch, source });
                    stop.cancel();
                }
            },
        }
    }

    async fn finish(mut self, started: Instant) -> JobSummary {
        let failure = self
            .failure
            .take()
            .or_else(|| self.cancel.is_cancelled().then_some(JobError::Cancelled));

        let (status, reason) = match &failure {
            Some(err) => (JobStatus::Failed, Some(err.to_string())),
            None if self.progress.errors > 0 => (JobStatus::CompletedWithErrors, None),
            None => (JobStatus::Completed, None),
        };

        let phase = if failure.is_some() {
            Phase::Failed
        } else {
            Phase::Completed
        };
        self.set_phase(phase).await;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &reason {
            Some(reason) => self.log(LogLevel::Error, format!("Job failed: {}", reason)).await,
            None => {
                self.log(
                    LogLevel::Info,
                    format!(
                        "Job {}: {} records loaded, {} skipped in {}ms",
                        status, self.progress.records_loaded, self.progress.records_skipped, elapsed_ms
                    ),
                )
                .await
            },
        }

        let summary = JobSummary::from_progress(
            status,
            reason,
            &self.progress,
            elapsed_ms,
            self.last_cursor,
        );
        let summary_event = ProgressEvent::Summary(summary.clone());
        if tokio::time::timeout(SUMMARY_GRACE, self.reporter.emit(summary_event))
            .await
            .is_err()
        {
            warn!("Caller is not reading, summary not delivered");
        }

        info!(
            status = %summary.status,
            loaded = summary.records_loaded,
            skipped = summary.records_skipped,
            elapsed_ms,
            "Job finished"
        );

        summary
    }
}
