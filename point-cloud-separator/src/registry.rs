/// Footprint registry holding the immutable set of classification targets.
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, SeparatorError};
use crate::footprint::{Footprint, FootprintId};
use crate::geojson::{Feature, FeatureCollection};
use crate::grid::SpatialGrid;
use crate::point::Point;

/// Footprints indexed by their planar extent.
///
/// Built once before ingestion; every method takes `&self`, so the registry
/// can be shared by reference across worker threads without locking.
#[derive(Debug)]
pub struct FootprintRegistry {
    grid: SpatialGrid<Footprint>,
}

impl FootprintRegistry {
    /// Index footprints. Ids must equal each footprint's position.
    pub fn new(footprints: Vec<Footprint>, bucket_size: f64) -> Self {
        debug_assert!(
            footprints
                .iter()
                .enumerate()
                .all(|(index, f)| f.id.0 as usize == index),
            "footprint ids must be dense indices"
        );

        let grid = SpatialGrid::build(footprints, |f: &Footprint| f.extent, bucket_size);
        Self { grid }
    }

    /// Load footprints from a GeoJSON feature collection.
    ///
    /// Names come from the feature id, then `name_property`, then the feature
    /// index. Features without polygon geometry are skipped.
    pub fn load(path: &Path, name_property: &str, bucket_size: f64) -> Result<Self> {
        let file = File::open(path).map_err(|source| SeparatorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let collection: FeatureCollection = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SeparatorError::Footprints {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let footprints = footprints_from_collection(collection, name_property);
        if footprints.is_empty() {
            return Err(SeparatorError::Footprints {
                path: path.to_path_buf(),
                reason: "no polygon features found".to_string(),
            });
        }

        let registry = Self::new(footprints, bucket_size);
        info!(
            footprints = registry.len(),
            buckets = registry.grid.bucket_count(),
            bucket_size,
            "Loaded footprints from {}",
            path.display()
        );
        Ok(registry)
    }

    /// Footprints whose extent bucket includes the point.
    ///
    /// Callers must still check `Footprint::contains` on each candidate.
    pub fn candidates_for<'a>(&'a self, point: &Point) -> impl Iterator<Item = &'a Footprint> + 'a {
        self.grid.query_point(point.x, point.y)
    }

    /// Footprints that exactly contain the point.
    pub fn matches_for<'a>(&'a self, point: &'a Point) -> impl Iterator<Item = &'a Footprint> + 'a {
        self.candidates_for(point)
            .filter(move |footprint| footprint.contains(point))
    }

    pub fn get(&self, id: FootprintId) -> Option<&Footprint> {
        self.grid.items().get(id.0 as usize)
    }

    pub fn footprints(&self) -> &[Footprint] {
        self.grid.items()
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }
}

fn footprints_from_collection(collection: FeatureCollection, name_property: &str) -> Vec<Footprint> {
    let mut footprints = Vec::new();
    let mut used_filenames = HashSet::new();

    for (index, feature) in collection.features.into_iter().enumerate() {
        let Some(geometry) = feature.geometry.as_ref() else {
            warn!(feature = index, "Skipping feature without geometry");
            continue;
        };
        let multi_polygon = match geometry.to_multi_polygon() {
            Ok(multi_polygon) => multi_polygon,
            Err(reason) => {
                warn!(feature = index, "Skipping feature: {}", reason);
                continue;
            }
        };

        let name = feature_name(&feature, name_property, index);
        let properties = feature.properties.unwrap_or_default();
        let id = FootprintId(footprints.len() as u32);
        let mut footprint = Footprint::new(id, &name, multi_polygon, properties);

        // Two features must never share output files.
        if !used_filenames.insert(footprint.filename.to_lowercase()) {
            footprint.filename = unused_filename(&footprint.filename, index, &mut used_filenames);
            debug!(feature = index, filename = %footprint.filename, "Renamed duplicate footprint");
        }

        footprints.push(footprint);
    }

    footprints
}

/// `<stem>_<index>`, or `<stem>_<index>_<n>` for the first free `n`; the
/// chosen name is claimed in `used`.
fn unused_filename(stem: &str, index: usize, used: &mut HashSet<String>) -> String {
    let mut candidate = format!("{}_{}", stem, index);
    let mut attempt = 2;
    while !used.insert(candidate.to_lowercase()) {
        candidate = format!("{}_{}_{}", stem, index, attempt);
        attempt += 1;
    }
    candidate
}

fn feature_name(feature: &Feature, name_property: &str, index: usize) -> String {
    if let Some(id) = &feature.id {
        return id.to_string();
    }
    match feature.properties.as_ref().and_then(|p| p.get(name_property)) {
        Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => format!("footprint_{}", index),
    }
}

/// Registry from in-memory features, used by tests and embedding callers.
pub fn registry_from_features(
    features: Vec<Feature>,
    name_property: &str,
    bucket_size: f64,
) -> FootprintRegistry {
    let collection = FeatureCollection {
        kind: "FeatureCollection".to_string(),
        features,
    };
    FootprintRegistry::new(footprints_from_collection(collection, name_property), bucket_size)
}

/// Property map helper for building features programmatically.
pub fn properties<I, K>(entries: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footprint::tests::square;
    use std::io::Write;

    fn scenario_registry() -> FootprintRegistry {
        FootprintRegistry::new(
            vec![
                square(0, "f1", 0.0, 0.0, 10.0),
                square(1, "f2", 20.0, 20.0, 5.0),
            ],
            8.0,
        )
    }

    #[test]
    fn classifies_inside_inside_outside() {
        let registry = scenario_registry();

        let p1 = Point::new(5.0, 5.0, 0.0);
        let p2 = Point::new(22.0, 22.0, 0.0);
        let p3 = Point::new(15.0, 15.0, 0.0);

        let ids = |p: &Point| registry.matches_for(p).map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(ids(&p1), vec![FootprintId(0)]);
        assert_eq!(ids(&p2), vec![FootprintId(1)]);
        assert!(ids(&p3).is_empty());
    }

    #[test]
    fn footprint_straddling_buckets_matches_from_each_bucket() {
        // Bucket size 8 splits f1 across four buckets.
        let registry = scenario_registry();
        for (x, y) in [(1.0, 1.0), (9.0, 1.0), (1.0, 9.0), (9.0, 9.0)] {
            let point = Point::new(x, y, 0.0);
            assert_eq!(registry.matches_for(&point).count(), 1, "missed at ({x}, {y})");
        }
    }

    #[test]
    fn overlapping_footprints_both_match() {
        let registry = FootprintRegistry::new(
            vec![square(0, "a", 0.0, 0.0, 10.0), square(1, "b", 5.0, 5.0, 10.0)],
            4.0,
        );
        let matched: Vec<_> = registry
            .matches_for(&Point::new(7.0, 7.0, 0.0))
            .map(|f| f.id)
            .collect();
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&FootprintId(0)));
        assert!(matched.contains(&FootprintId(1)));
    }

    #[test]
    fn loads_names_and_skips_unusable_features() {
        let json = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "id": "b/1", "properties": {},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1]]]}},
            {"type": "Feature", "properties": {"ref": "Town Hall"},
             "geometry": {"type": "Polygon", "coordinates": [[[2,2],[3,2],[3,3],[2,3]]]}},
            {"type": "Feature", "properties": {"ref": 1},
             "geometry": {"type": "LineString", "coordinates": [[0,0],[1,1]]}},
            {"type": "Feature", "properties": {},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[5,5],[6,5],[6,6]]]]}},
            {"type": "Feature", "properties": {"ref": "Town Hall"},
             "geometry": {"type": "Polygon", "coordinates": [[[8,8],[9,8],[9,9]]]}}
        ]}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("footprints.geojson");
        File::create(&path).unwrap().write_all(json.as_bytes()).unwrap();

        let registry = FootprintRegistry::load(&path, "ref", 10.0).unwrap();
        let names: Vec<_> = registry.footprints().iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["b_1", "Town_Hall", "footprint_3", "Town_Hall_4"]);
        assert_eq!(registry.get(FootprintId(2)).unwrap().name, "footprint_3");
        assert!(registry.get(FootprintId(4)).is_none());
    }

    #[test]
    fn renamed_duplicate_never_takes_an_existing_name() {
        use crate::geojson::Geometry;
        let square = || Geometry::Polygon {
            coordinates: vec![vec![
                vec![0.0, 0.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
                vec![0.0, 1.0],
            ]],
        };
        let features = ["x", "x_2", "x", "X_2_2"]
            .into_iter()
            .map(|name| Feature::new(name, square(), Map::new()))
            .collect();

        let registry = registry_from_features(features, "id", 2.0);
        let names: Vec<_> = registry.footprints().iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["x", "x_2", "x_2_2", "X_2_2_3"]);

        let mut unique: Vec<_> = names.iter().map(|n| n.to_lowercase()).collect();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn rejects_collection_without_polygons() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.geojson");
        std::fs::write(&path, r#"{"type": "FeatureCollection", "features": []}"#).unwrap();
        let err = FootprintRegistry::load(&path, "id", 10.0).unwrap_err();
        assert!(matches!(err, SeparatorError::Footprints { .. }));
    }

    #[test]
    fn builds_from_in_memory_features() {
        use crate::geojson::Geometry;
        let geometry = Geometry::Polygon {
            coordinates: vec![vec![
                vec![0.0, 0.0],
                vec![4.0, 0.0],
                vec![4.0, 4.0],
                vec![0.0, 4.0],
            ]],
        };
        let features = vec![Feature::new(
            "hall",
            geometry,
            properties([("levels", Value::from(3))]),
        )];
        let registry = registry_from_features(features, "id", 2.0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.footprints()[0].properties["levels"], 3);
    }
}
