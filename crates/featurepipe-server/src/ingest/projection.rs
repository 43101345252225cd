//! Coordinate reference systems and reprojection planning
//!
//! Geographic WGS84 and spherical Web Mercator are converted in process.
//! Any other pair is handed to the database, which wraps the geometry in
//! `ST_Transform` on insert.

use crate::ingest::geometry::{Coord, Geometry};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

const EARTH_RADIUS: f64 = 6_378_137.0;
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// An EPSG coordinate reference system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(u32);

impl Crs {
    pub const WGS84: Crs = Crs(4326);
    pub const WEB_MERCATOR: Crs = Crs(3857);

    /// Build from a well-known id, folding the Esri Web Mercator aliases
    pub fn from_epsg(code: u32) -> Self {
        match code {
            102100 | 102113 | 900913 | 3785 => Crs::WEB_MERCATOR,
            other => Crs(other),
        }
    }

    pub fn code(self) -> u32 {
        self.0
    }

    /// SRID as PostGIS expects it
    pub fn srid(self) -> i32 {
        i32::try_from(self.0).unwrap_or(i32::MAX)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

impl FromStr for Crs {
    type Err = String;

    /// Accepts `4326`, `EPSG:4326` or `epsg:4326`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .get(..5)
            .filter(|prefix| prefix.eq_ignore_ascii_case("epsg:"))
            .map_or(s, |_| &s[5..]);
        match digits.parse::<u32>() {
            Ok(code) if code > 0 => Ok(Crs::from_epsg(code)),
            _ => Err(format!("invalid EPSG code: {}", s)),
        }
    }
}

/// How geometries get from the source CRS to the target CRS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reprojection {
    Identity(Crs),
    InProcess { from: Crs, to: Crs },
    /// Coordinates stay in `from`; the sink transforms them
    Deferred { from: Crs, to: Crs },
}

impl Reprojection {
    pub fn plan(from: Crs, to: Crs) -> Self {
        if from == to {
            return Reprojection::Identity(to);
        }
        match (from, to) {
            (Crs::WGS84, Crs::WEB_MERCATOR) | (Crs::WEB_MERCATOR, Crs::WGS84) => {
                Reprojection::InProcess { from, to }
            },
            _ => Reprojection::Deferred { from, to },
        }
    }

    pub fn target(&self) -> Crs {
        match *self {
            Reprojection::Identity(crs) => crs,
            Reprojection::InProcess { to, .. } | Reprojection::Deferred { to, .. } => to,
        }
    }

    /// CRS of the coordinates handed to the sink
    pub fn output_crs(&self) -> Crs {
        match *self {
            Reprojection::Deferred { from, .. } => from,
            other => other.target(),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Reprojection::Deferred { .. })
    }

    pub fn apply(&self, geometry: Geometry) -> Geometry {
        match *self {
            Reprojection::InProcess {
                from: Crs::WGS84,
                to: Crs::WEB_MERCATOR,
            } => geometry.map_coords(lonlat_to_mercator),
            Reprojection::InProcess {
                from: Crs::WEB_MERCATOR,
                to: Crs::WGS84,
            } => geometry.map_coords(mercator_to_lonlat),
            _ => geometry,
        }
    }
}

pub fn lonlat_to_mercator(c: Coord) -> Coord {
    let lat = c.y.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    Coord::new(
        EARTH_RADIUS * c.x.to_radians(),
        EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln(),
    )
}

pub fn mercator_to_lonlat(c: Coord) -> Coord {
    Coord::new(
        (c.x / EARTH_RADIUS).to_degrees(),
        (2.0 * (c.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees(),
    )
}
