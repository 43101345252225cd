//! Spatial datastore sink
//!
//! [`FeatureSink`] is what the loader needs from the datastore: idempotent
//! table setup and one transaction per batch. [`PostgisSink`] is the
//! PostgreSQL/PostGIS implementation; [`sql`] renders its statements.

pub mod postgis;
pub mod sql;

use crate::ingest::error::LoadError;
use crate::ingest::job::JobSpec;
use crate::ingest::projection::Reprojection;
use crate::ingest::schema::SourceSchema;
use crate::ingest::transformer::TransformedRow;
use async_trait::async_trait;

pub use postgis::PostgisSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub pg_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryColumn {
    pub name: String,
    /// SRID of the stored geometries
    pub srid: i32,
    /// SRID of incoming coordinates when the sink has to transform them
    pub source_srid: Option<i32>,
}

/// Shape of the table a job loads into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub schema: String,
    pub table: String,
    /// `bigint PRIMARY KEY` holding the source object id
    pub key_column: String,
    /// Attribute columns, aligned with `TransformedRow::values`
    pub columns: Vec<ColumnDef>,
    pub geometry: Option<GeometryColumn>,
    pub attachments_table: Option<String>,
}

impl TableTarget {
    pub fn from_schema(spec: &JobSpec, schema: &SourceSchema, reprojection: Reprojection) -> Self {
        let columns = schema
            .fields
            .iter()
            .map(|f| ColumnDef {
                name: f.column.clone(),
                pg_type: f.field_type.pg_type(),
            })
            .collect();

        let geometry = schema.has_geometry().then(|| GeometryColumn {
            name: spec.geometry_column.clone(),
            srid: reprojection.target().srid(),
            source_srid: reprojection
                .is_deferred()
                .then(|| reprojection.output_crs().srid()),
        });

        Self {
            schema: spec.schema.clone(),
            table: spec.table.clone(),
            key_column: schema.key_column.clone(),
            columns,
            geometry,
            attachments_table: spec.attachments_enabled().then(|| spec.attachments_table()),
        }
    }
}

/// Rows and attachment records written by one committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows: u64,
    pub attachments: u64,
}

#[async_trait]
pub trait FeatureSink: Send + Sync {
    /// Create the target table (and attachment table) if absent, add any
    /// missing columns if present
    async fn ensure_table(&self, target: &TableTarget) -> Result<(), LoadError>;

    /// Remove every row of the target table
    async fn truncate(&self, target: &TableTarget) -> Result<(), LoadError>;

    /// Upsert `rows` in a single transaction; on error nothing is written
    async fn upsert_batch(
        &self,
        target: &TableTarget,
        rows: &[TransformedRow],
    ) -> Result<LoadOutcome, LoadError>;
}
