//! Source schema discovery
//!
//! The layer metadata is read once per job and frozen into a
//! [`SourceSchema`] shared by the transformer and the loader.

use crate::ingest::error::SchemaError;
use crate::ingest::geometry::GeometryKind;
use crate::ingest::job::JobSpec;
use crate::ingest::projection::Crs;
use crate::ingest::source::{FeatureSource, LayerMetadata};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// PostgreSQL truncates identifiers beyond this many bytes
const MAX_IDENTIFIER_LEN: usize = 63;

/// Attribute type of a loaded column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Text,
    Timestamp,
    Date,
    Time,
    Uuid,
}

/// What to do with a field the service declares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsriField {
    Column(FieldType),
    ObjectId,
    /// Geometry, blob and raster fields are never loaded as attributes
    Skip,
}

impl FieldType {
    pub fn from_esri(name: &str) -> EsriField {
        let ty = match name {
            "esriFieldTypeOID" => return EsriField::ObjectId,
            "esriFieldTypeGeometry" | "esriFieldTypeBlob" | "esriFieldTypeRaster" => {
                return EsriField::Skip
            },
            "esriFieldTypeSmallInteger" => FieldType::SmallInt,
            "esriFieldTypeInteger" => FieldType::Integer,
            "esriFieldTypeBigInteger" => FieldType::BigInt,
            "esriFieldTypeSingle" => FieldType::Real,
            "esriFieldTypeDouble" => FieldType::Double,
            "esriFieldTypeDate" | "esriFieldTypeTimestampOffset" => FieldType::Timestamp,
            "esriFieldTypeDateOnly" => FieldType::Date,
            "esriFieldTypeTimeOnly" => FieldType::Time,
            "esriFieldTypeGUID" | "esriFieldTypeGlobalID" => FieldType::Uuid,
            // esriFieldTypeString, esriFieldTypeXML and anything newer
            _ => FieldType::Text,
        };
        EsriField::Column(ty)
    }

    pub fn pg_type(self) -> &'static str {
        match self {
            FieldType::SmallInt => "smallint",
            FieldType::Integer => "integer",
            FieldType::BigInt => "bigint",
            FieldType::Real => "real",
            FieldType::Double => "double precision",
            FieldType::Text => "text",
            FieldType::Timestamp => "timestamptz",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::Uuid => "uuid",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Name in the service's attribute map
    pub name: String,
    /// Laundered column name in the sink
    pub column: String,
    pub field_type: FieldType,
    pub alias: Option<String>,
}

/// Where the source CRS came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrsOrigin {
    Job,
    Metadata,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSchema {
    pub layer_name: Option<String>,
    pub fields: Vec<FieldDef>,
    pub object_id_field: String,
    pub global_id_field: Option<String>,
    /// Sink column holding the object id; the upsert key
    pub key_column: String,
    pub geometry: Option<GeometryKind>,
    pub source_crs: Crs,
    pub crs_origin: CrsOrigin,
    pub has_attachments: bool,
}

impl SourceSchema {
    pub fn has_geometry(&self) -> bool {
        self.geometry.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub schema: SourceSchema,
    /// Records per page: the job's batch size, capped at the layer's
    /// `maxRecordCount`
    pub page_size: u32,
    /// Non-fatal findings, reported once each at warning level
    pub warnings: Vec<String>,
}

/// Lowercase, with anything outside `[a-z0-9_]` replaced by `_`
pub fn launder(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out.truncate(MAX_IDENTIFIER_LEN);
    out
}

/// Build the job's schema from layer metadata without any I/O
pub fn build_schema(
    meta: &LayerMetadata,
    spec: &JobSpec,
    default_crs: Crs,
) -> Result<ProbeResult, SchemaError> {
    let mut warnings = Vec::new();
    let mut fields = Vec::new();
    let mut oid_from_fields = None;

    for info in &meta.fields {
        match FieldType::from_esri(&info.field_type) {
            EsriField::ObjectId => {
                oid_from_fields.get_or_insert_with(|| info.name.clone());
            },
            EsriField::Skip => debug!(field = %info.name, "Skipping non-attribute field"),
            EsriField::Column(field_type) => fields.push(FieldDef {
                name: info.name.clone(),
                column: launder(&info.name),
                field_type,
                alias: info.alias.clone(),
            }),
        }
    }

    let object_id_field = meta
        .object_id_field
        .clone()
        .or(oid_from_fields)
        .ok_or_else(|| SchemaError::Invalid("layer declares no object id field".to_string()))?;

    // The object id is stored once, in the key column
    fields.retain(|f| f.name != object_id_field);

    let key_column = launder(spec.upsert_key.as_deref().unwrap_or(&object_id_field));
    if key_column.is_empty() {
        return Err(SchemaError::Invalid("empty upsert key".to_string()));
    }

    let geometry = meta
        .geometry_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(|t| {
            GeometryKind::from_esri(t)
                .ok_or_else(|| SchemaError::Invalid(format!("unsupported geometry type {}", t)))
        })
        .transpose()?;

    let mut seen: HashMap<&str, &str> = HashMap::new();
    seen.insert(&key_column, &object_id_field);
    if geometry.is_some() && seen.insert(&spec.geometry_column, "geometry").is_some() {
        return Err(SchemaError::ColumnCollision {
            column: spec.geometry_column.clone(),
            field: object_id_field.clone(),
        });
    }
    for field in &fields {
        if field.column.is_empty() {
            return Err(SchemaError::Invalid(format!(
                "field `{}` has no usable column name",
                field.name
            )));
        }
        if seen.insert(&field.column, &field.name).is_some() {
            return Err(SchemaError::ColumnCollision {
                column: field.column.clone(),
                field: field.name.clone(),
            });
        }
    }

    let (source_crs, crs_origin) = match (spec.source_crs, meta.declared_wkid()) {
        (Some(crs), _) => (crs, CrsOrigin::Job),
        (None, Some(wkid)) => (Crs::from_epsg(wkid), CrsOrigin::Metadata),
        (None, None) => {
            if geometry.is_some() {
                warnings.push(format!(
                    "layer declares no spatial reference, assuming {}",
                    default_crs
                ));
            }
            (default_crs, CrsOrigin::Default)
        },
    };

    let page_size = match meta.max_record_count {
        Some(max) if max > 0 && max < spec.batch_size => {
            warnings.push(format!(
                "batch {} exceeds the layer's maxRecordCount, using {}",
                spec.batch_size, max
            ));
            max
        },
        _ => spec.batch_size,
    };

    let schema = SourceSchema {
        layer_name: meta.name.clone(),
        fields,
        object_id_field,
        global_id_field: meta.global_id_field.clone().filter(|g| !g.is_empty()),
        key_column,
        geometry,
        source_crs,
        crs_origin,
        has_attachments: meta.has_attachments,
    };

    Ok(ProbeResult {
        schema,
        page_size,
        warnings,
    })
}

/// Reads layer metadata once per job
pub struct SchemaProbe<'a> {
    source: &'a dyn FeatureSource,
    default_crs: Crs,
}

impl<'a> SchemaProbe<'a> {
    pub fn new(source: &'a dyn FeatureSource, default_crs: Crs) -> Self {
        Self {
            source,
            default_crs,
        }
    }

    #[instrument(skip_all, fields(table = %spec.table))]
    pub async fn probe(&self, spec: &JobSpec) -> Result<ProbeResult, SchemaError> {
        let meta = self.source.describe().await.map_err(|e| match e {
            crate::ingest::error::SourceError::Decode(msg) => SchemaError::Invalid(msg),
            other => SchemaError::Unreachable(other),
        })?;

        let result = build_schema(&meta, spec, self.default_crs)?;

        info!(
            fields = result.schema.fields.len(),
            geometry = ?result.schema.geometry,
            crs = %result.schema.source_crs,
            attachments = result.schema.has_attachments,
            "Probed layer schema"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::source::{Extent, FieldInfo, SpatialReference};

    fn spec() -> JobSpec {
        JobSpec::new("https://example.com/arcgis/rest/services/Parks/FeatureServer/0", "parks")
            .unwrap()
    }

    fn meta() -> LayerMetadata {
        LayerMetadata {
            geometry_type: Some("esriGeometryPolygon".into()),
            object_id_field: Some("OBJECTID".into()),
            fields: vec![
                FieldInfo::new("OBJECTID", "esriFieldTypeOID"),
                FieldInfo::new("Park Name", "esriFieldTypeString"),
                FieldInfo::new("AREA_HA", "esriFieldTypeDouble"),
                FieldInfo::new("Shape", "esriFieldTypeGeometry"),
                FieldInfo::new("GlobalID", "esriFieldTypeGlobalID"),
            ],
            extent: Some(Extent {
                spatial_reference: Some(SpatialReference {
                    wkid: Some(102100),
                    latest_wkid: None,
                }),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_launder() {
        assert_eq!(launder("Park Name"), "park_name");
        assert_eq!(launder("AREA_HA"), "area_ha");
        assert_eq!(launder("2019 count"), "_2019_count");
        assert_eq!(launder(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn test_build_schema() {
        let result = build_schema(&meta(), &spec(), Crs::WGS84).unwrap();
        let schema = result.schema;

        assert!(result.warnings.is_empty());
        assert_eq!(schema.key_column, "objectid");
        assert_eq!(schema.geometry, Some(GeometryKind::Polygon));
        assert_eq!(schema.source_crs, Crs::WEB_MERCATOR);
        assert_eq!(schema.crs_origin, CrsOrigin::Metadata);

        let columns: Vec<_> = schema.fields.iter().map(|f| f.column.as_str()).collect();
        assert_eq!(columns, vec!["park_name", "area_ha", "globalid"]);
        assert_eq!(schema.fields[2].field_type, FieldType::Uuid);
    }

    #[test]
    fn test_missing_crs_warns_once() {
        let mut meta = meta();
        meta.extent = None;

        let result = build_schema(&meta, &spec(), Crs::WGS84).unwrap();
        assert_eq!(result.schema.source_crs, Crs::WGS84);
        assert_eq!(result.schema.crs_origin, CrsOrigin::Default);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_page_size_capped_by_max_record_count() {
        let mut meta = meta();
        meta.max_record_count = Some(500);

        let result = build_schema(&meta, &spec(), Crs::WGS84).unwrap();
        assert_eq!(result.page_size, 500);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("maxRecordCount"));

        meta.max_record_count = Some(2000);
        let result = build_schema(&meta, &spec(), Crs::WGS84).unwrap();
        assert_eq!(result.page_size, 1000);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_job_crs_wins() {
        let mut spec = spec();
        spec.source_crs = Some(Crs::from_epsg(2193));
        let result = build_schema(&meta(), &spec, Crs::WGS84).unwrap();
        assert_eq!(result.schema.source_crs.code(), 2193);
        assert_eq!(result.schema.crs_origin, CrsOrigin::Job);
    }

    #[test]
    fn test_no_geometry() {
        let mut meta = meta();
        meta.geometry_type = None;
        meta.extent = None;

        let result = build_schema(&meta, &spec(), Crs::WGS84).unwrap();
        assert!(!result.schema.has_geometry());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_upsert_key_collision() {
        let mut spec = spec();
        spec.upsert_key = Some("AREA_HA".into());
        let err = build_schema(&meta(), &spec, Crs::WGS84).unwrap_err();
        assert!(matches!(err, SchemaError::ColumnCollision { ref column, .. } if column == "area_ha"));
    }

    #[test]
    fn test_laundered_duplicates_rejected() {
        let mut meta = meta();
        meta.fields.push(FieldInfo::new("park name", "esriFieldTypeString"));
        assert!(matches!(
            build_schema(&meta, &spec(), Crs::WGS84),
            Err(SchemaError::ColumnCollision { .. })
        ));
    }

    #[test]
    fn test_object_id_required() {
        let meta = LayerMetadata {
            fields: vec![FieldInfo::new("NAME", "esriFieldTypeString")],
            ..Default::default()
        };
        assert!(matches!(
            build_schema(&meta, &spec(), Crs::WGS84),
            Err(SchemaError::Invalid(_))
        ));
    }
}
