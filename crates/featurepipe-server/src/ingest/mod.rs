//! Feature-service ingestion pipeline
//!
//! ```text
//! SchemaProbe (once)
//!   -> loop { BatchFetcher -> GeometryTransformer -> [AttachmentStore] -> TableLoader }
//!   -> summary
//! ```
//!
//! [`orchestrator::PipelineOrchestrator`] drives a job; the other modules are
//! the stages and the seams (`FeatureSource`, `FeatureSink`, `ObjectStore`)
//! that connect them to the outside world.

pub mod attachments;
pub mod coercion;
pub mod error;
pub mod fetcher;
pub mod geometry;
pub mod job;
pub mod loader;
pub mod orchestrator;
pub mod progress;
pub mod projection;
pub mod schema;
pub mod settings;
pub mod sink;
pub mod source;
pub mod transformer;

pub use attachments::{AttachmentStore, ObjectStore};
pub use error::{JobError, LoadError, SchemaError, SourceError};
pub use job::{JobSpec, LoadMode};
pub use orchestrator::PipelineOrchestrator;
pub use progress::ProgressReporter;
pub use projection::Crs;
pub use settings::{PipelineSettings, RetryPolicy};
pub use sink::{FeatureSink, PostgisSink};
pub use source::{ArcGisClient, FeatureSource, TokenProvider};
