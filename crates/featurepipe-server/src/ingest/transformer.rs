//! Raw records to typed rows
//!
//! Attribute values are coerced to the schema's field types. When the layer
//! carries geometry, each geometry is parsed, normalized and reprojected to
//! the job's target CRS. A record that fails either step is skipped and
//! reported; the rest of the batch carries on.

use crate::ingest::attachments::AttachmentRecord;
use crate::ingest::coercion::{coerce, TypedValue};
use crate::ingest::error::{CoercionError, RecordError};
use crate::ingest::geometry::Geometry;
use crate::ingest::projection::{Crs, Reprojection};
use crate::ingest::schema::{FieldType, SourceSchema};
use crate::ingest::source::RawRecord;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

static NULL: Value = Value::Null;

/// One record ready for the sink
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRow {
    pub feature_id: i64,
    pub global_id: Option<String>,
    /// Aligned with `SourceSchema::fields`
    pub values: Vec<TypedValue>,
    /// In `Reprojection::output_crs`; `None` when the layer has no geometry
    /// or the record's geometry is empty
    pub geometry: Option<Geometry>,
    pub attachments: Vec<AttachmentRecord>,
}

#[derive(Debug, Default)]
pub struct TransformOutput {
    pub rows: Vec<TransformedRow>,
    pub errors: Vec<RecordError>,
}

pub struct GeometryTransformer {
    schema: Arc<SourceSchema>,
    reprojection: Reprojection,
}

impl GeometryTransformer {
    pub fn new(schema: Arc<SourceSchema>, target: Crs) -> Self {
        let reprojection = Reprojection::plan(schema.source_crs, target);
        Self {
            schema,
            reprojection,
        }
    }

    pub fn reprojection(&self) -> Reprojection {
        self.reprojection
    }

    pub fn transform(&self, records: Vec<RawRecord>) -> TransformOutput {
        let mut output = TransformOutput {
            rows: Vec::with_capacity(records.len()),
            errors: Vec::new(),
        };

        for record in records {
            match self.transform_record(record) {
                Ok(row) => output.rows.push(row),
                Err(err) => {
                    debug!(feature_id = ?err.feature_id, error = %err.message, "Skipping record");
                    output.errors.push(err);
                },
            }
        }

        output
    }

    fn transform_record(&self, record: RawRecord) -> Result<TransformedRow, RecordError> {
        let RawRecord {
            attributes,
            geometry,
        } = record;

        let oid_field = &self.schema.object_id_field;
        let oid = lookup(&attributes, oid_field).unwrap_or(&NULL);
        let feature_id = match coerce(oid_field, oid, FieldType::BigInt) {
            Ok(TypedValue::BigInt(id)) => id,
            Ok(_) => {
                return Err(RecordError::coercion(
                    None,
                    &CoercionError {
                        field: oid_field.clone(),
                        expected: "object id",
                        value: "null".to_string(),
                    },
                ))
            },
            Err(err) => return Err(RecordError::coercion(None, &err)),
        };

        let values = self
            .schema
            .fields
            .iter()
            .map(|field| {
                let raw = lookup(&attributes, &field.name).unwrap_or(&NULL);
                coerce(&field.name, raw, field.field_type)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| RecordError::coercion(Some(feature_id), &err))?;

        let global_id = self
            .schema
            .global_id_field
            .as_deref()
            .and_then(|name| lookup(&attributes, name))
            .and_then(Value::as_str)
            .map(str::to_string);

        let geometry = if self.schema.has_geometry() {
            Geometry::from_esri(geometry.as_ref().unwrap_or(&NULL))
                .map_err(|err| RecordError::geometry(feature_id, &err))?
                .map(|g| self.reprojection.apply(g))
        } else {
            None
        };

        Ok(TransformedRow {
            feature_id,
            global_id,
            values,
            geometry,
            attachments: Vec::new(),
        })
    }
}

/// Exact attribute name first, then case-insensitive
fn lookup<'a>(attributes: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    attributes.get(name).or_else(|| {
        attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::geometry::{Coord, GeometryKind};
    use crate::ingest::schema::{CrsOrigin, FieldDef};
    use featurepipe_common::RecordErrorKind;
    use serde_json::json;

    fn schema(geometry: Option<GeometryKind>, crs: Crs) -> Arc<SourceSchema> {
        Arc::new(SourceSchema {
            layer_name: None,
            fields: vec![
                FieldDef {
                    name: "NAME".into(),
                    column: "name".into(),
                    field_type: FieldType::Text,
                    alias: None,
                },
                FieldDef {
                    name: "HEIGHT".into(),
                    column: "height".into(),
                    field_type: FieldType::Double,
                    alias: None,
                },
            ],
            object_id_field: "OBJECTID".into(),
            global_id_field: None,
            key_column: "objectid".into(),
            geometry,
            source_crs: crs,
            crs_origin: CrsOrigin::Metadata,
            has_attachments: false,
        })
    }

    fn record(id: i64, height: Value, geometry: Option<Value>) -> RawRecord {
        let attributes = json!({"OBJECTID": id, "NAME": format!("tree {}", id), "HEIGHT": height});
        RawRecord {
            attributes: attributes.as_object().cloned().unwrap(),
            geometry,
        }
    }

    #[test]
    fn test_identity_keeps_values() {
        let transformer =
            GeometryTransformer::new(schema(Some(GeometryKind::Point), Crs::WGS84), Crs::WGS84);
        let out = transformer.transform(vec![record(1, json!(12.5), Some(json!({"x": 174.7, "y": -41.3})))]);

        assert!(out.errors.is_empty());
        let row = &out.rows[0];
        assert_eq!(row.feature_id, 1);
        assert_eq!(row.values, vec![TypedValue::Text("tree 1".into()), TypedValue::Double(12.5)]);
        assert_eq!(row.geometry, Some(Geometry::Point(Coord::new(174.7, -41.3))));
    }

    #[test]
    fn test_reprojects_to_target() {
        let transformer = GeometryTransformer::new(
            schema(Some(GeometryKind::Point), Crs::WGS84),
            Crs::WEB_MERCATOR,
        );
        let out = transformer.transform(vec![record(1, json!(1), Some(json!({"x": 180.0, "y": 0.0})))]);
        match out.rows[0].geometry {
            Some(Geometry::Point(c)) => {
                assert!((c.x - 20_037_508.34).abs() < 0.01);
                assert!(c.y.abs() < 1e-6);
            },
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_records_are_skipped_not_fatal() {
        let transformer =
            GeometryTransformer::new(schema(Some(GeometryKind::Polyline), Crs::WGS84), Crs::WGS84);
        let out = transformer.transform(vec![
            record(1, json!(3), Some(json!({"paths": [[[0, 0], [1, 1]]]}))),
            record(2, json!(3), Some(json!({"paths": [[[0, 0]]]}))),
            record(3, json!("tall"), Some(json!({"paths": [[[0, 0], [1, 1]]]}))),
            record(4, json!(3), None),
        ]);

        assert_eq!(out.rows.iter().map(|r| r.feature_id).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(out.errors.len(), 2);
        assert_eq!(out.errors[0].kind, RecordErrorKind::Geometry);
        assert_eq!(out.errors[0].feature_id, Some(2));
        assert_eq!(out.errors[1].kind, RecordErrorKind::Coercion);
        assert_eq!(out.rows[1].geometry, None);
    }

    #[test]
    fn test_geometry_ignored_without_geometry_type() {
        let transformer = GeometryTransformer::new(schema(None, Crs::WGS84), Crs::WGS84);
        let out = transformer.transform(vec![record(1, json!(2), Some(json!("garbage")))]);
        assert!(out.errors.is_empty());
        assert_eq!(out.rows[0].geometry, None);
    }

    #[test]
    fn test_missing_object_id() {
        let transformer = GeometryTransformer::new(schema(None, Crs::WGS84), Crs::WGS84);
        let out = transformer.transform(vec![RawRecord::default()]);
        assert!(out.rows.is_empty());
        assert_eq!(out.errors[0].feature_id, None);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let transformer = GeometryTransformer::new(schema(None, Crs::WGS84), Crs::WGS84);
        let attributes = json!({"objectid": 9, "name": "oak", "height": 4});
        let out = transformer.transform(vec![RawRecord {
            attributes: attributes.as_object().cloned().unwrap(),
            geometry: None,
        }]);
        assert_eq!(out.rows[0].feature_id, 9);
        assert_eq!(out.rows[0].values[0], TypedValue::Text("oak".into()));
    }
}
