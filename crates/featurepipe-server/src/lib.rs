//! Featurepipe Server Library
//!
//! Copies ArcGIS feature layers into PostGIS tables.
//!
//! # Overview
//!
//! A caller posts a job to `/agol2pg` naming a feature layer and a target
//! table. The server pages through the layer, normalizes and reprojects each
//! geometry, optionally archives attachments to S3, and upserts every page
//! in its own transaction. Progress is streamed back as NDJSON, one
//! [`featurepipe_common::ProgressEvent`] per line, ending with a summary.
//!
//! - **ingest**: the pipeline and its seams (`FeatureSource`, `FeatureSink`,
//!   `ObjectStore`)
//! - **storage**: S3-compatible object storage
//! - **api**: the HTTP surface
//! - **config**: environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use featurepipe_server::ingest::{
//!     ArcGisClient, JobSpec, PipelineOrchestrator, PipelineSettings, PostgisSink,
//!     ProgressReporter,
//! };
//! use featurepipe_common::LogLevel;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(pool: sqlx::PgPool) -> anyhow::Result<()> {
//! let spec = JobSpec::new("https://example.com/arcgis/rest/services/Trees/FeatureServer/0", "trees")?;
//! let source = ArcGisClient::new(reqwest::Client::new(), spec.url.clone());
//! let orchestrator = PipelineOrchestrator::new(
//!     Arc::new(source),
//!     Arc::new(PostgisSink::new(pool)),
//!     PipelineSettings::default(),
//! );
//! let (reporter, _events) = ProgressReporter::channel(LogLevel::Info, 256);
//! let summary = orchestrator.run(spec, reporter, CancellationToken::new()).await;
//! println!("{}", summary.status);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod middleware;
pub mod storage;

// Re-export commonly used types
pub use error::{AppError, AppResult};
