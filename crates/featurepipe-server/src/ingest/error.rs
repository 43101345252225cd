//! Error types for the ingestion pipeline
//!
//! Record-level errors (`GeometryError`, `CoercionError`, `AttachmentError`)
//! never leave their batch; they are folded into [`RecordError`] values and
//! counted. Page-, batch- and schema-level errors surface to the orchestrator
//! as [`JobError`].

use featurepipe_common::RecordErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the feature service
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// ArcGIS reports most failures as a 200 response with an `error` object
    #[error("service error {code}: {message}")]
    Service { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl SourceError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_body()
                    || e.status().is_some_and(|s| is_transient_status(s.as_u16()))
            },
            SourceError::Status { status, .. } => is_transient_status(*status),
            SourceError::Service { code, .. } => {
                u16::try_from(*code).is_ok_and(is_transient_status)
            },
            SourceError::Decode(_) | SourceError::Auth(_) => false,
        }
    }
}

impl SourceError {
    /// ArcGIS 498 (invalid token) or 499 (token required)
    pub fn is_token_rejected(&self) -> bool {
        match self {
            SourceError::Status { status, .. } => matches!(status, 498 | 499),
            SourceError::Service { code, .. } => matches!(code, 498 | 499),
            _ => false,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Layer metadata could not be turned into a usable schema. Always fatal.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("feature service unreachable: {0}")]
    Unreachable(#[source] SourceError),

    #[error("invalid layer metadata: {0}")]
    Invalid(String),

    #[error("column `{column}` collides with source field `{field}`")]
    ColumnCollision { column: String, field: String },
}

/// A page could not be fetched
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page at offset {offset} failed after {attempts} attempts: {source}")]
    Exhausted {
        offset: u64,
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("page at offset {offset} failed: {source}")]
    Permanent {
        offset: u64,
        #[source]
        source: SourceError,
    },
}

impl FetchError {
    pub fn offset(&self) -> u64 {
        match self {
            FetchError::Exhausted { offset, .. } | FetchError::Permanent { offset, .. } => *offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("non-finite coordinate")]
    NonFinite,

    #[error("malformed coordinate: {0}")]
    BadCoordinate(String),

    #[error("path has {0} vertices, at least 2 required")]
    ShortPath(usize),

    #[error("ring has {0} vertices, at least 4 required")]
    ShortRing(usize),

    #[error("unrecognized geometry: {0}")]
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("field `{field}`: cannot read {value} as {expected}")]
pub struct CoercionError {
    pub field: String,
    pub expected: &'static str,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("listing attachments failed: {0}")]
    List(#[source] SourceError),

    #[error("download failed: {0}")]
    Download(#[source] SourceError),

    #[error("upload to `{key}` failed: {message}")]
    Upload { key: String, message: String },
}

/// A batch failed to load and its transaction was rolled back
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("batch rejected: {0}")]
    Rejected(String),
}

/// Reason a job ended in `failed`
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("target table setup failed: {0}")]
    Prepare(#[source] LoadError),

    #[error("batch {batch} failed to load: {source}")]
    Load {
        batch: u64,
        #[source]
        source: LoadError,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// A record-level problem, reported on the stream and counted
#[derive(Debug, Clone, PartialEq)]
pub struct RecordError {
    pub kind: RecordErrorKind,
    pub feature_id: Option<i64>,
    pub attachment_id: Option<i64>,
    pub message: String,
}

impl RecordError {
    pub fn geometry(feature_id: i64, err: &GeometryError) -> Self {
        Self {
            kind: RecordErrorKind::Geometry,
            feature_id: Some(feature_id),
            attachment_id: None,
            message: err.to_string(),
        }
    }

    pub fn coercion(feature_id: Option<i64>, err: &CoercionError) -> Self {
        Self {
            kind: RecordErrorKind::Coercion,
            feature_id,
            attachment_id: None,
            message: err.to_string(),
        }
    }

    pub fn attachment(
        feature_id: Option<i64>,
        attachment_id: Option<i64>,
        err: &AttachmentError,
    ) -> Self {
        Self {
            kind: RecordErrorKind::Attachment,
            feature_id,
            attachment_id,
            message: err.to_string(),
        }
    }
}
