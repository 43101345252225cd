//! Esri JSON geometry normalization
//!
//! Every geometry is reduced to 2D and promoted to its multi form (points
//! stay single), then written to the sink as GeoJSON.

use crate::ingest::error::GeometryError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

pub type Path = Vec<Coord>;
/// Exterior ring first, holes after
pub type Polygon = Vec<Path>;

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Path>),
    MultiPolygon(Vec<Polygon>),
}

/// Geometry type a layer declares in its metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryKind {
    Point,
    MultiPoint,
    Polyline,
    Polygon,
    Envelope,
}

impl GeometryKind {
    pub fn from_esri(name: &str) -> Option<Self> {
        match name {
            "esriGeometryPoint" => Some(GeometryKind::Point),
            "esriGeometryMultipoint" => Some(GeometryKind::MultiPoint),
            "esriGeometryPolyline" => Some(GeometryKind::Polyline),
            "esriGeometryPolygon" => Some(GeometryKind::Polygon),
            "esriGeometryEnvelope" => Some(GeometryKind::Envelope),
            _ => None,
        }
    }
}

impl Geometry {
    /// Parse an Esri JSON geometry. `Ok(None)` is an empty geometry, which the
    /// sink stores as NULL.
    pub fn from_esri(value: &Value) -> Result<Option<Geometry>, GeometryError> {
        let obj = match value {
            Value::Null => return Ok(None),
            Value::Object(obj) => obj,
            other => return Err(GeometryError::Unrecognized(type_name(other).to_string())),
        };

        if obj.contains_key("x") {
            return parse_point(obj.get("x"), obj.get("y"));
        }

        if let Some(points) = obj.get("points") {
            let points = coords(points)?;
            if points.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Geometry::MultiPoint(points)));
        }

        if let Some(paths) = obj.get("paths") {
            let paths = array(paths, "paths")?
                .iter()
                .map(|path| {
                    let path = coords(path)?;
                    if path.len() < 2 {
                        return Err(GeometryError::ShortPath(path.len()));
                    }
                    Ok(path)
                })
                .collect::<Result<Vec<_>, _>>()?;
            if paths.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Geometry::MultiLineString(paths)));
        }

        if let Some(rings) = obj.get("rings") {
            let rings = array(rings, "rings")?
                .iter()
                .map(|ring| {
                    let ring = coords(ring)?;
                    if ring.len() < 4 {
                        return Err(GeometryError::ShortRing(ring.len()));
                    }
                    Ok(ring)
                })
                .collect::<Result<Vec<_>, _>>()?;
            if rings.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Geometry::MultiPolygon(assemble_polygons(rings))));
        }

        if obj.contains_key("xmin") {
            return parse_envelope(obj);
        }

        Err(GeometryError::Unrecognized(
            obj.keys().cloned().collect::<Vec<_>>().join(","),
        ))
    }

    /// Apply `f` to every vertex
    pub fn map_coords(self, f: impl Fn(Coord) -> Coord) -> Geometry {
        let path = |p: Path| p.into_iter().map(&f).collect::<Path>();
        match self {
            Geometry::Point(c) => Geometry::Point(f(c)),
            Geometry::MultiPoint(points) => Geometry::MultiPoint(path(points)),
            Geometry::MultiLineString(paths) => {
                Geometry::MultiLineString(paths.into_iter().map(path).collect())
            },
            Geometry::MultiPolygon(polygons) => Geometry::MultiPolygon(
                polygons
                    .into_iter()
                    .map(|rings| rings.into_iter().map(path).collect())
                    .collect(),
            ),
        }
    }

    pub fn to_geojson(&self) -> Value {
        fn pos(c: &Coord) -> Value {
            json!([c.x, c.y])
        }
        fn line(p: &[Coord]) -> Value {
            Value::Array(p.iter().map(pos).collect())
        }

        match self {
            Geometry::Point(c) => json!({ "type": "Point", "coordinates": pos(c) }),
            Geometry::MultiPoint(points) => {
                json!({ "type": "MultiPoint", "coordinates": line(points) })
            },
            Geometry::MultiLineString(paths) => json!({
                "type": "MultiLineString",
                "coordinates": paths.iter().map(|p| line(p)).collect::<Vec<_>>(),
            }),
            Geometry::MultiPolygon(polygons) => json!({
                "type": "MultiPolygon",
                "coordinates": polygons
                    .iter()
                    .map(|rings| rings.iter().map(|r| line(r)).collect::<Vec<_>>())
                    .collect::<Vec<_>>(),
            }),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>, GeometryError> {
    value
        .as_array()
        .ok_or_else(|| GeometryError::Unrecognized(format!("{} is a {}", what, type_name(value))))
}

/// Esri encodes an empty point as `x: null` or `x: "NaN"`
fn is_empty_ordinate(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("nan"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(f64::is_nan),
        _ => false,
    }
}

fn ordinate(value: &Value) -> Result<f64, GeometryError> {
    let v = value
        .as_f64()
        .ok_or_else(|| GeometryError::BadCoordinate(value.to_string()))?;
    if !v.is_finite() {
        return Err(GeometryError::NonFinite);
    }
    Ok(v)
}

fn parse_point(x: Option<&Value>, y: Option<&Value>) -> Result<Option<Geometry>, GeometryError> {
    if is_empty_ordinate(x) {
        return Ok(None);
    }
    let x = x.map(ordinate).transpose()?;
    let y = y.map(ordinate).transpose()?;
    match (x, y) {
        (Some(x), Some(y)) => Ok(Some(Geometry::Point(Coord::new(x, y)))),
        _ => Err(GeometryError::BadCoordinate("point without y".to_string())),
    }
}

/// `[[x, y, z?, m?], ...]`, extra ordinates dropped
fn coords(value: &Value) -> Result<Vec<Coord>, GeometryError> {
    array(value, "coordinate list")?
        .iter()
        .map(|pair| {
            let pair = array(pair, "vertex")?;
            match (pair.first(), pair.get(1)) {
                (Some(x), Some(y)) => Ok(Coord::new(ordinate(x)?, ordinate(y)?)),
                _ => Err(GeometryError::BadCoordinate(format!(
                    "vertex with {} ordinates",
                    pair.len()
                ))),
            }
        })
        .collect()
}

fn parse_envelope(obj: &serde_json::Map<String, Value>) -> Result<Option<Geometry>, GeometryError> {
    if is_empty_ordinate(obj.get("xmin")) {
        return Ok(None);
    }
    let get = |key: &str| {
        obj.get(key)
            .ok_or_else(|| GeometryError::BadCoordinate(format!("envelope without {}", key)))
            .and_then(ordinate)
    };
    let (xmin, ymin, xmax, ymax) = (get("xmin")?, get("ymin")?, get("xmax")?, get("ymax")?);
    let ring = vec![
        Coord::new(xmin, ymin),
        Coord::new(xmin, ymax),
        Coord::new(xmax, ymax),
        Coord::new(xmax, ymin),
        Coord::new(xmin, ymin),
    ];
    Ok(Some(Geometry::MultiPolygon(vec![vec![ring]])))
}

/// Twice the signed area; positive for clockwise rings in a y-up plane
fn clockwise_area(ring: &[Coord]) -> f64 {
    ring.windows(2)
        .map(|w| (w[1].x - w[0].x) * (w[1].y + w[0].y))
        .sum()
}

/// Even-odd ray cast; points on the boundary may land either way
fn ring_contains(ring: &[Coord], point: Coord) -> bool {
    let mut inside = false;
    for w in ring.windows(2) {
        let (a, b) = (w[0], w[1]);
        if (a.y > point.y) != (b.y > point.y) {
            let x = a.x + (point.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if point.x < x {
                inside = !inside;
            }
        }
    }
    inside
}

/// Clockwise rings are shells, counter-clockwise rings are holes. Each hole
/// goes to the smallest shell containing it; a hole outside every shell is
/// promoted to a polygon of its own.
fn assemble_polygons(rings: Vec<Path>) -> Vec<Polygon> {
    let (shells, holes): (Vec<Path>, Vec<Path>) = rings
        .into_iter()
        .partition(|ring| clockwise_area(ring) >= 0.0);

    let areas: Vec<f64> = shells.iter().map(|s| clockwise_area(s).abs()).collect();
    let mut polygons: Vec<Polygon> = shells.into_iter().map(|shell| vec![shell]).collect();

    for hole in holes {
        let owner = polygons
            .iter()
            .enumerate()
            .filter(|(_, polygon)| {
                hole.iter()
                    .take(hole.len().saturating_sub(1))
                    .any(|c| ring_contains(&polygon[0], *c))
            })
            .min_by(|(a, _), (b, _)| areas[*a].total_cmp(&areas[*b]))
            .map(|(i, _)| i);

        match owner {
            Some(i) => polygons[i].push(hole),
            None => polygons.push(vec![hole]),
        }
    }
    polygons
}
