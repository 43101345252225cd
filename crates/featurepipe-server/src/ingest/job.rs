//! Job specification

use crate::ingest::error::JobError;
use crate::ingest::projection::Crs;
use featurepipe_common::LogLevel;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Default target schema
pub const DEFAULT_SCHEMA: &str = "public";

/// Default geometry column name
pub const DEFAULT_GEOMETRY_COLUMN: &str = "geom";

/// Default records per page and per load transaction
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

/// Upper bound on the page size a job may request
pub const MAX_BATCH_SIZE: u32 = 10_000;

/// Plain SQL identifier, at most 63 bytes
const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,62}$";

/// How the target table is treated before loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Insert new ids, update existing ones, keep the rest
    #[default]
    Upsert,
    /// Empty the table before the first batch
    Replace,
}

impl std::str::FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "upsert" => Ok(LoadMode::Upsert),
            "replace" | "overwrite" => Ok(LoadMode::Replace),
            other => Err(format!("unknown load mode: {}", other)),
        }
    }
}

/// Everything one ingestion job needs. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    /// Feature layer URL, e.g. `.../FeatureServer/0`
    pub url: Url,
    pub schema: String,
    pub table: String,
    pub geometry_column: String,
    pub batch_size: u32,
    pub save_attachments: bool,
    pub bucket: Option<String>,
    /// Overrides the CRS declared by the layer
    pub source_crs: Option<Crs>,
    /// Defaults to the source CRS
    pub target_crs: Option<Crs>,
    /// Verbosity of log lines copied into the progress stream
    pub log_level: LogLevel,
    /// Sink column for the object id; defaults to the laundered OID field
    pub upsert_key: Option<String>,
    pub token: Option<String>,
    pub start_offset: u64,
    pub partial_success: bool,
    pub mode: LoadMode,
}

impl JobSpec {
    /// Spec with defaults for everything but the layer and the table.
    /// The table name is folded to lowercase.
    pub fn new(url: &str, table: &str) -> Result<Self, JobError> {
        let url = parse_layer_url(url)?;
        Ok(Self {
            url,
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.to_lowercase(),
            geometry_column: DEFAULT_GEOMETRY_COLUMN.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            save_attachments: false,
            bucket: None,
            source_crs: None,
            target_crs: None,
            log_level: LogLevel::Info,
            upsert_key: None,
            token: None,
            start_offset: 0,
            partial_success: false,
            mode: LoadMode::Upsert,
        })
    }

    pub fn validate(&self) -> Result<(), JobError> {
        let identifier = Regex::new(IDENTIFIER_PATTERN)
            .map_err(|e| JobError::InvalidSpec(e.to_string()))?;

        for (what, value) in [
            ("table", self.table.as_str()),
            ("schema", self.schema.as_str()),
            ("geometry_name", self.geometry_column.as_str()),
        ] {
            if !identifier.is_match(value) {
                return Err(JobError::InvalidSpec(format!(
                    "{} `{}` is not a valid identifier",
                    what, value
                )));
            }
        }

        if let Some(key) = &self.upsert_key {
            if !identifier.is_match(key) {
                return Err(JobError::InvalidSpec(format!(
                    "upsert_key `{}` is not a valid identifier",
                    key
                )));
            }
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(JobError::InvalidSpec(format!(
                "batch must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }

        if self.save_attachments && self.bucket.as_deref().map_or(true, str::is_empty) {
            return Err(JobError::InvalidSpec(
                "save_attachments requires a bucket".to_string(),
            ));
        }

        Ok(())
    }

    /// Attachments are archived only when asked for and a bucket is set
    pub fn attachments_enabled(&self) -> bool {
        self.save_attachments && self.bucket.as_deref().is_some_and(|b| !b.is_empty())
    }

    /// Table holding attachment metadata
    pub fn attachments_table(&self) -> String {
        format!("{}_attach", self.table)
    }
}

/// Accept http(s) layer URLs; trailing slashes and query strings are dropped
pub fn parse_layer_url(raw: &str) -> Result<Url, JobError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| JobError::InvalidSpec(format!("invalid url `{}`: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(JobError::InvalidSpec(format!(
            "unsupported url scheme `{}`",
            url.scheme()
        )));
    }

    url.set_query(None);
    url.set_fragment(None);
    let trimmed = url.path().trim_end_matches('/').to_string();
    url.set_path(&trimmed);
    Ok(url)
}
