/// Building footprints used as classification targets.
use std::fmt;

use geo::{BoundingRect, Centroid, Contains, MultiPolygon};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bounds::Extent;
use crate::constants::{GEOMETRY_EXTENSION, METADATA_EXTENSION, POINTS_EXTENSION};
use crate::geojson::{Feature, Geometry};
use crate::point::Point;

/// Stable footprint identity: the footprint's index in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FootprintId(pub u32);

impl fmt::Display for FootprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A building boundary polygon. Read-only once the registry is built.
#[derive(Debug, Clone)]
pub struct Footprint {
    pub id: FootprintId,
    /// Human readable name taken from the source feature.
    pub name: String,
    /// Filesystem-safe stem shared by all output files of this footprint.
    pub filename: String,
    pub geometry: MultiPolygon<f64>,
    pub extent: Extent,
    pub properties: Map<String, Value>,
}

impl Footprint {
    pub fn new(
        id: FootprintId,
        name: &str,
        geometry: MultiPolygon<f64>,
        properties: Map<String, Value>,
    ) -> Self {
        let extent = geometry
            .bounding_rect()
            .map(Extent::from)
            .unwrap_or_else(Extent::empty);

        Self {
            id,
            name: name.to_string(),
            filename: sanitize_filename(name),
            geometry,
            extent,
            properties,
        }
    }

    /// Exact planar containment. Points on the boundary are outside.
    pub fn contains(&self, point: &Point) -> bool {
        self.extent.contains(point.x, point.y) && self.geometry.contains(&point.planar())
    }

    /// Centroid of the footprint area, falling back to the extent centre.
    pub fn center(&self) -> (f64, f64) {
        self.geometry
            .centroid()
            .map(|c| (c.x(), c.y()))
            .unwrap_or_else(|| self.extent.center())
    }

    pub fn points_filename(&self) -> String {
        format!("{}.{}", self.filename, POINTS_EXTENSION)
    }

    pub fn geometry_filename(&self) -> String {
        format!("{}.{}", self.filename, GEOMETRY_EXTENSION)
    }

    pub fn metadata_filename(&self) -> String {
        format!("{}.{}", self.filename, METADATA_EXTENSION)
    }

    /// GeoJSON feature re-saved next to the point list.
    pub fn to_feature(&self) -> Feature {
        Feature::new(
            &self.name,
            Geometry::from_multi_polygon(&self.geometry),
            self.properties.clone(),
        )
    }

    /// Metadata document persisted when the footprint is flushed.
    pub fn metadata(&self, point_count: u64) -> FootprintMetadata {
        let (x, y) = self.center();
        FootprintMetadata {
            name: self.name.clone(),
            filename: self.filename.clone(),
            coordinates: [x, y],
            extent: self.extent,
            point_count,
            properties: self.properties.clone(),
        }
    }
}

/// Per-footprint metadata file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintMetadata {
    pub name: String,
    pub filename: String,
    /// Footprint centroid `[x, y]`.
    pub coordinates: [f64; 2],
    pub extent: Extent,
    pub point_count: u64,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Replace anything outside `[A-Za-z0-9._-]` so names are safe as file stems.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // Leading dots would hide the files or escape into parent directories.
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "footprint".to_string()
    } else {
        cleaned.to_string()
    }
}
