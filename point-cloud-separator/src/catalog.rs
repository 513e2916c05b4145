/// Run-level catalog of flushed footprints and proximity lookups over it.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bounds::Extent;
use crate::constants::CATALOG_FILENAME;
use crate::error::{Result, SeparatorError};
use crate::footprint::{Footprint, FootprintId};
use crate::grid::SpatialGrid;
use crate::writer::write_json;

/// One flushed footprint as listed in `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Stem of the footprint's output files.
    pub filename: String,
    #[serde(default)]
    pub name: String,
    /// Footprint centroid `[x, y]`.
    pub coordinates: [f64; 2],
    pub extent: Extent,
    pub point_count: u64,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub buildings: Vec<CatalogEntry>,
}

/// Collects an entry per flushed footprint while the run progresses.
#[derive(Debug, Default)]
pub struct FootprintCatalog {
    entries: Mutex<BTreeMap<FootprintId, CatalogEntry>>,
}

impl FootprintCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a flush and return the footprint's cumulative point count.
    pub fn record(&self, footprint: &Footprint, points: usize) -> u64 {
        let mut entries = self.entries.lock();
        let entry = entries.entry(footprint.id).or_insert_with(|| {
            let (x, y) = footprint.center();
            CatalogEntry {
                filename: footprint.filename.clone(),
                name: footprint.name.clone(),
                coordinates: [x, y],
                extent: footprint.extent,
                point_count: 0,
            }
        });
        entry.point_count += points as u64;
        entry.point_count
    }

    /// Points recorded so far for a footprint.
    pub fn recorded_points(&self, id: FootprintId) -> u64 {
        self.entries.lock().get(&id).map_or(0, |entry| entry.point_count)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot sorted by filename.
    pub fn document(&self) -> CatalogDocument {
        let mut buildings: Vec<CatalogEntry> = self.entries.lock().values().cloned().collect();
        buildings.sort_by(|a, b| a.filename.cmp(&b.filename));
        CatalogDocument { buildings }
    }

    /// Write `metadata.json` into `output_dir`.
    pub fn write(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(CATALOG_FILENAME);
        write_json(&path, &self.document())?;
        Ok(path)
    }
}

/// Load a catalog written by a previous run.
pub fn load_catalog(path: &Path) -> Result<CatalogDocument> {
    let file = File::open(path).map_err(|source| SeparatorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Grid over catalog centroids for radius queries.
#[derive(Debug)]
pub struct CatalogIndex {
    grid: SpatialGrid<CatalogEntry>,
}

impl CatalogIndex {
    pub fn new(document: CatalogDocument, bucket_size: f64) -> Self {
        let grid = SpatialGrid::build(
            document.buildings,
            |entry: &CatalogEntry| Extent::at(entry.coordinates[0], entry.coordinates[1]),
            bucket_size,
        );
        Self { grid }
    }

    pub fn load(path: &Path, bucket_size: f64) -> Result<Self> {
        Ok(Self::new(load_catalog(path)?, bucket_size))
    }

    /// Entries whose centroid lies within `radius` of `(x, y)`, nearest first.
    pub fn nearby(&self, x: f64, y: f64, radius: f64) -> Vec<&CatalogEntry> {
        let mut found: Vec<(f64, &CatalogEntry)> = self
            .grid
            .query_range(x, y, radius)
            .map(|entry| {
                let dx = entry.coordinates[0] - x;
                let dy = entry.coordinates[1] - y;
                (dx * dx + dy * dy, entry)
            })
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.filename.cmp(&b.1.filename)));
        found.into_iter().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footprint::tests::square;

    fn entry(filename: &str, x: f64, y: f64) -> CatalogEntry {
        CatalogEntry {
            filename: filename.to_string(),
            name: filename.to_string(),
            coordinates: [x, y],
            extent: Extent::at(x, y),
            point_count: 1,
        }
    }

    #[test]
    fn accumulates_repeated_flushes() {
        let catalog = FootprintCatalog::new();
        let footprint = square(0, "b", 0.0, 0.0, 4.0);
        assert_eq!(catalog.recorded_points(footprint.id), 0);
        assert_eq!(catalog.record(&footprint, 10), 10);
        assert_eq!(catalog.record(&footprint, 5), 15);
        assert_eq!(catalog.recorded_points(footprint.id), 15);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.document().buildings[0].coordinates, [2.0, 2.0]);
    }

    #[test]
    fn writes_sorted_document_and_loads_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FootprintCatalog::new();
        catalog.record(&square(0, "zeta", 0.0, 0.0, 1.0), 1);
        catalog.record(&square(1, "alpha", 5.0, 5.0, 1.0), 2);

        let path = catalog.write(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), CATALOG_FILENAME);

        let document = load_catalog(&path).unwrap();
        let names: Vec<_> = document.buildings.iter().map(|b| b.filename.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn loads_minimal_viewer_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CATALOG_FILENAME);
        std::fs::write(
            &path,
            r#"{"buildings": [{"filename": "a", "coordinates": [1.0, 2.0],
                "extent": {"min_x": 0, "max_x": 2, "min_y": 1, "max_y": 3}, "point_count": 4}]}"#,
        )
        .unwrap();
        let document = load_catalog(&path).unwrap();
        assert_eq!(document.buildings[0].name, "");
        assert_eq!(document.buildings[0].point_count, 4);
    }

    #[test]
    fn nearby_returns_entries_in_radius_nearest_first() {
        let document = CatalogDocument {
            buildings: vec![
                entry("far", 500.0, 0.0),
                entry("edge", 0.0, 150.0),
                entry("near", 10.0, 0.0),
                entry("other_bucket", -120.0, 0.0),
            ],
        };
        let index = CatalogIndex::new(document, 100.0);

        let names: Vec<_> = index
            .nearby(0.0, 0.0, 150.0)
            .iter()
            .map(|e| e.filename.as_str())
            .collect();
        assert_eq!(names, vec!["near", "other_bucket", "edge"]);
        assert!(index.nearby(0.0, 0.0, 5.0).is_empty());
    }
}
