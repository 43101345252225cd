//! Progress events streamed to the caller while an ingestion job runs.
//!
//! Each event serializes to one JSON object tagged by `event`, written as a
//! single line of an NDJSON response. The last line of every stream is a
//! `summary`.

use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Initializing,
    Probing,
    Streaming,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

/// Final outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-batch pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Transform,
    Attach,
    Load,
}

/// Class of a record-level (non-fatal) error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordErrorKind {
    Geometry,
    Coercion,
    Attachment,
}

/// Class of a page- or batch-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchErrorKind {
    Fetch,
    Load,
}

/// Running counters for a job. Counters only ever grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobProgress {
    pub phase: Phase,
    pub records_fetched: u64,
    pub records_loaded: u64,
    pub records_skipped: u64,
    pub attachments_stored: u64,
    pub attachment_failures: u64,
    pub batches_loaded: u64,
    /// Batches rolled back by the sink
    pub batches_failed: u64,
    /// Pages that could not be fetched
    pub pages_failed: u64,
    pub errors: u64,
}

/// One line of the progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Log {
        level: LogLevel,
        message: String,
    },
    Phase {
        phase: Phase,
    },
    /// A stage of one batch finished. `records` is the number of records the
    /// stage handled; `next_cursor` is set on `load` events and is the offset
    /// a restarted job should resume from.
    Stage {
        batch: u64,
        stage: Stage,
        records: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_cursor: Option<u64>,
        progress: JobProgress,
    },
    RecordError {
        kind: RecordErrorKind,
        batch: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feature_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment_id: Option<i64>,
        message: String,
    },
    BatchError {
        kind: BatchErrorKind,
        batch: u64,
        cursor: u64,
        message: String,
        fatal: bool,
    },
    Summary(JobSummary),
}

impl ProgressEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        ProgressEvent::Log {
            level,
            message: message.into(),
        }
    }

    /// Serialize as one NDJSON line, trailing newline included.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn is_summary(&self) -> bool {
        matches!(self, ProgressEvent::Summary(_))
    }
}

/// Terminal record of a job. `reason` is always set when `status` is
/// `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub records_fetched: u64,
    pub records_loaded: u64,
    pub records_skipped: u64,
    pub attachments_stored: u64,
    pub attachment_failures: u64,
    pub load_failures: u64,
    pub fetch_failures: u64,
    pub batches_loaded: u64,
    pub elapsed_ms: u64,
    /// Offset a restarted job should resume from: after the last committed
    /// batch, but never past a page that failed to load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<u64>,
}

impl JobSummary {
    pub fn from_progress(
        status: JobStatus,
        reason: Option<String>,
        progress: &JobProgress,
        elapsed_ms: u64,
        last_cursor: Option<u64>,
    ) -> Self {
        Self {
            status,
            reason,
            records_fetched: progress.records_fetched,
            records_loaded: progress.records_loaded,
            records_skipped: progress.records_skipped,
            attachments_stored: progress.attachments_stored,
            attachment_failures: progress.attachment_failures,
            load_failures: progress.batches_failed,
            fetch_failures: progress.pages_failed,
            batches_loaded: progress.batches_loaded,
            elapsed_ms,
            last_cursor,
        }
    }
}
