//! Featurepipe Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared pieces used by every featurepipe component:
//!
//! - **Logging**: `tracing` subscriber setup driven by environment variables
//! - **Events**: the progress vocabulary streamed to callers while a job runs
//!
//! # Example
//!
//! ```no_run
//! use featurepipe_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod logging;

pub use events::{
    BatchErrorKind, JobProgress, JobStatus, JobSummary, Phase, ProgressEvent, RecordErrorKind,
    Stage,
};
pub use logging::LogLevel;
