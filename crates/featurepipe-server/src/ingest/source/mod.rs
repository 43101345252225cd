//! Feature service access
//!
//! [`FeatureSource`] is the seam between the pipeline and a remote feature
//! service. [`arcgis::ArcGisClient`] talks to ArcGIS REST layers; tests plug
//! in in-memory sources.

pub mod arcgis;
pub mod token;

use crate::ingest::error::SourceError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};

pub use arcgis::ArcGisClient;
pub use token::{PortalCredentials, TokenProvider};

// ============================================================================
// Layer metadata
// ============================================================================

/// Layer description as returned by `GET {layer}?f=json`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
    #[serde(default)]
    pub geometry_type: Option<String>,
    #[serde(default)]
    pub object_id_field: Option<String>,
    #[serde(default)]
    pub global_id_field: Option<String>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub max_record_count: Option<u32>,
    #[serde(default)]
    pub extent: Option<Extent>,
    #[serde(default)]
    pub source_spatial_reference: Option<SpatialReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub length: Option<u32>,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extent {
    #[serde(default)]
    pub spatial_reference: Option<SpatialReference>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialReference {
    #[serde(default)]
    pub wkid: Option<u32>,
    #[serde(default)]
    pub latest_wkid: Option<u32>,
}

impl LayerMetadata {
    /// Declared spatial reference, preferring `latestWkid`
    pub fn declared_wkid(&self) -> Option<u32> {
        let from_extent = self.extent.as_ref().and_then(|e| e.spatial_reference);
        [from_extent, self.source_spatial_reference]
            .into_iter()
            .flatten()
            .find_map(|sr| sr.latest_wkid.or(sr.wkid))
    }
}

// ============================================================================
// Records and attachments
// ============================================================================

/// One feature as the service returned it
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub geometry: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct FeaturePage {
    pub records: Vec<RawRecord>,
    /// The service truncated the page at its own limit
    pub exceeded_transfer_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u32,
    /// Field to order by; paging is only repeatable with a stable order
    pub order_by: String,
    pub return_geometry: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub exif_info: Option<Value>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentGroup {
    pub parent_object_id: i64,
    #[serde(default)]
    pub parent_global_id: Option<String>,
    #[serde(default)]
    pub attachment_infos: Vec<AttachmentInfo>,
}

// ============================================================================
// Source trait
// ============================================================================

/// Read-only access to one feature layer. Implementations are shared across
/// concurrent batches.
#[async_trait]
pub trait FeatureSource: Send + Sync {
    async fn describe(&self) -> Result<LayerMetadata, SourceError>;

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeaturePage, SourceError>;

    async fn query_attachments(
        &self,
        object_ids: &[i64],
    ) -> Result<Vec<AttachmentGroup>, SourceError>;

    async fn fetch_attachment(
        &self,
        feature_id: i64,
        attachment: &AttachmentInfo,
    ) -> Result<Bytes, SourceError>;
}
