//! `/agol2pg`: start an ingestion job and stream its progress as NDJSON

use crate::api::AppState;
use crate::config::PipelineConfig;
use crate::error::{AppError, AppResult};
use crate::ingest::progress::DEFAULT_CHANNEL_CAPACITY;
use crate::ingest::{
    ArcGisClient, Crs, JobSpec, LoadMode, PipelineOrchestrator, PostgisSink, ProgressReporter,
};
use axum::{
    body::Body,
    extract::{Form, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use featurepipe_common::{LogLevel, ProgressEvent};
use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;
use tracing::info;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Job parameters as sent by the caller, from a query string or a form body.
/// Everything arrives as text and is parsed in [`JobRequest::into_spec`].
#[derive(Debug, Default, Deserialize)]
pub struct JobRequest {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub table: Option<String>,
    pub schema: Option<String>,
    pub geometry_name: Option<String>,
    pub batch: Option<String>,
    pub save_attachments: Option<String>,
    pub bucket: Option<String>,
    pub source_epsg: Option<String>,
    pub target_epsg: Option<String>,
    pub loglevel: Option<String>,
    pub upsert_key: Option<String>,
    pub token: Option<String>,
    pub start_offset: Option<String>,
    pub partial_success: Option<String>,
    pub mode: Option<String>,
}

impl JobRequest {
    /// Build the immutable job. `default_bucket` is used when attachments are
    /// requested without a bucket.
    pub fn into_spec(
        self,
        defaults: &PipelineConfig,
        default_bucket: Option<&str>,
    ) -> AppResult<JobSpec> {
        let url = required(self.url, "url")?;
        let table = required(self.table, "table")?;
        let mut spec = JobSpec::new(&url, &table)?;

        if let Some(schema) = present(self.schema) {
            spec.schema = schema.to_lowercase();
        }
        if let Some(geometry) = present(self.geometry_name) {
            spec.geometry_column = geometry.to_lowercase();
        }
        if let Some(batch) = present(self.batch) {
            spec.batch_size = parse(&batch, "batch")?;
        }
        if let Some(flag) = present(self.save_attachments) {
            spec.save_attachments = parse_bool(&flag, "save_attachments")?;
        }
        spec.bucket = present(self.bucket).or_else(|| {
            spec.save_attachments
                .then(|| default_bucket.map(str::to_string))
                .flatten()
        });
        if let Some(epsg) = present(self.source_epsg) {
            spec.source_crs = Some(parse_crs(&epsg, "source_epsg")?);
        }
        if let Some(epsg) = present(self.target_epsg) {
            spec.target_crs = Some(parse_crs(&epsg, "target_epsg")?);
        }
        if let Some(level) = present(self.loglevel) {
            spec.log_level = LogLevel::from_str(&level)
                .map_err(|_| AppError::Validation(format!("invalid loglevel `{}`", level)))?;
        }
        spec.upsert_key = present(self.upsert_key).map(|key| key.to_lowercase());
        spec.token = present(self.token);
        if let Some(offset) = present(self.start_offset) {
            spec.start_offset = parse(&offset, "start_offset")?;
        }
        spec.partial_success = match present(self.partial_success) {
            Some(flag) => parse_bool(&flag, "partial_success")?,
            None => defaults.partial_success,
        };
        if let Some(mode) = present(self.mode) {
            spec.mode = LoadMode::from_str(&mode).map_err(AppError::Validation)?;
        }

        spec.validate()?;
        Ok(spec)
    }
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, name: &str) -> AppResult<String> {
    present(value).ok_or_else(|| AppError::Validation(format!("`{}` is required", name)))
}

fn parse<T: FromStr>(value: &str, name: &str) -> AppResult<T> {
    value
        .parse()
        .map_err(|_| AppError::Validation(format!("invalid {} `{}`", name, value)))
}

fn parse_bool(value: &str, name: &str) -> AppResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AppError::Validation(format!("invalid {} `{}`", name, value))),
    }
}

fn parse_crs(value: &str, name: &str) -> AppResult<Crs> {
    Crs::from_str(value).map_err(|e| AppError::Validation(format!("{}: {}", name, e)))
}

pub async fn start_job_query(
    State(state): State<AppState>,
    Query(request): Query<JobRequest>,
) -> AppResult<Response> {
    start_job(state, request).await
}

pub async fn start_job_form(
    State(state): State<AppState>,
    Form(request): Form<JobRequest>,
) -> AppResult<Response> {
    start_job(state, request).await
}

fn authorize(state: &AppState, api_key: Option<&str>) -> AppResult<()> {
    match api_key {
        Some(key) if !key.is_empty() && keys_match(key, &state.config.api.api_key) => Ok(()),
        Some(_) => Err(AppError::Unauthorized("invalid api_key".to_string())),
        None => Err(AppError::Unauthorized("api_key is required".to_string())),
    }
}

/// Compares digests so the time taken does not depend on where the keys differ
fn keys_match(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given
        .iter()
        .zip(expected.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// NDJSON body over the job's events. The body owns `guard`: when the caller
/// goes away the body is dropped and the job is cancelled.
fn progress_body(rx: mpsc::Receiver<ProgressEvent>, guard: DropGuard) -> Body {
    let lines = ReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        event.to_line().map(Bytes::from)
    });
    Body::from_stream(lines)
}

async fn start_job(state: AppState, mut request: JobRequest) -> AppResult<Response> {
    authorize(&state, request.api_key.take().as_deref())?;

    let default_bucket = state.storage.as_ref().and_then(|s| s.default_bucket());
    let spec = request.into_spec(&state.config.pipeline, default_bucket)?;

    if spec.attachments_enabled() && state.storage.is_none() {
        return Err(AppError::Validation(
            "save_attachments requires object storage to be configured".to_string(),
        ));
    }

    let mut source = ArcGisClient::new(state.http.clone(), spec.url.clone())
        .with_token_provider(state.tokens.clone());
    if let Some(token) = &spec.token {
        source = source.with_token(token.clone());
    }

    let mut orchestrator = PipelineOrchestrator::new(
        Arc::new(source),
        Arc::new(PostgisSink::new(state.db.clone())),
        state.config.pipeline.settings(),
    );
    if let Some(storage) = &state.storage {
        orchestrator = orchestrator.with_object_store(Arc::new(storage.clone()));
    }

    let (reporter, rx) = ProgressReporter::channel(spec.log_level, DEFAULT_CHANNEL_CAPACITY);
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();

    info!(url = %spec.url, schema = %spec.schema, table = %spec.table, "Starting job");
    tokio::spawn(async move {
        orchestrator.run(spec, reporter, cancel).await;
    });

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        progress_body(rx, guard),
    )
        .into_response())
}
