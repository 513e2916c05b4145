/// Minimal GeoJSON document model for footprint input and geometry output.
use geo::{Coord, LineString, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level footprint source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default = "collection_type")]
    pub kind: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FeatureId>,
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl Feature {
    pub fn new(id: &str, geometry: Geometry, properties: Map<String, Value>) -> Self {
        Self {
            kind: feature_type(),
            id: Some(FeatureId::Text(id.to_string())),
            geometry: Some(geometry),
            properties: Some(properties),
        }
    }
}

/// Feature identifiers may be strings or numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureId {
    Number(serde_json::Number),
    Text(String),
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureId::Number(n) => write!(f, "{}", n),
            FeatureId::Text(s) => f.write_str(s),
        }
    }
}

/// Position arrays are `[x, y, (z)]`; only the first two axes are used.
pub type Ring = Vec<Vec<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Polygon { coordinates: Vec<Ring> },
    MultiPolygon { coordinates: Vec<Vec<Ring>> },
    /// Any other geometry type; skipped by the footprint loader.
    #[serde(other)]
    Unsupported,
}

impl Geometry {
    /// Convert into a planar multipolygon.
    pub fn to_multi_polygon(&self) -> Result<MultiPolygon<f64>, String> {
        match self {
            Geometry::Polygon { coordinates } => {
                Ok(MultiPolygon::new(vec![polygon_from_rings(coordinates)?]))
            }
            Geometry::MultiPolygon { coordinates } => {
                let polygons = coordinates
                    .iter()
                    .map(|rings| polygon_from_rings(rings))
                    .collect::<Result<Vec<_>, _>>()?;
                if polygons.is_empty() {
                    return Err("multipolygon has no polygons".to_string());
                }
                Ok(MultiPolygon::new(polygons))
            }
            Geometry::Unsupported => Err("unsupported geometry type".to_string()),
        }
    }

    /// GeoJSON form of a multipolygon, collapsed to `Polygon` when it has one part.
    pub fn from_multi_polygon(geometry: &MultiPolygon<f64>) -> Self {
        let mut polygons: Vec<Vec<Ring>> = geometry.iter().map(rings_from_polygon).collect();
        if polygons.len() == 1 {
            Geometry::Polygon {
                coordinates: polygons.remove(0),
            }
        } else {
            Geometry::MultiPolygon {
                coordinates: polygons,
            }
        }
    }
}

fn polygon_from_rings(rings: &[Ring]) -> Result<Polygon<f64>, String> {
    let (exterior, interiors) = rings
        .split_first()
        .ok_or_else(|| "polygon has no rings".to_string())?;
    let exterior = line_string_from_ring(exterior)?;
    if exterior.0.len() < 3 {
        return Err("polygon exterior needs at least 3 positions".to_string());
    }
    let interiors = interiors
        .iter()
        .map(|ring| line_string_from_ring(ring))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn line_string_from_ring(ring: &[Vec<f64>]) -> Result<LineString<f64>, String> {
    ring.iter()
        .map(|position| match position.as_slice() {
            [x, y, ..] if x.is_finite() && y.is_finite() => Ok(Coord { x: *x, y: *y }),
            _ => Err(format!("invalid position {:?}", position)),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

fn rings_from_polygon(polygon: &Polygon<f64>) -> Vec<Ring> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(|ring| ring.coords().map(|c| vec![c.x, c.y]).collect())
        .collect()
}

fn collection_type() -> String {
    "FeatureCollection".to_string()
}

fn feature_type() -> String {
    "Feature".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_collection() {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "id": 12, "properties": {"street": "Main"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[4,0],[4,4],[0,4],[0,0]]]}},
                {"type": "Feature", "id": "b-7", "properties": null,
                 "geometry": {"type": "Point", "coordinates": [1, 2]}},
                {"type": "Feature", "geometry": null}
            ]
        }"#;
        let collection: FeatureCollection = serde_json::from_str(json).unwrap();
        assert_eq!(collection.features.len(), 3);

        let first = &collection.features[0];
        assert_eq!(first.id.as_ref().unwrap().to_string(), "12");
        let polygon = first.geometry.as_ref().unwrap().to_multi_polygon().unwrap();
        assert_eq!(polygon.0.len(), 1);
        assert_eq!(polygon.0[0].exterior().0.len(), 5);

        assert_eq!(collection.features[1].geometry, Some(Geometry::Unsupported));
        assert!(collection.features[2].geometry.is_none());
    }

    #[test]
    fn keeps_holes_and_ignores_elevation() {
        let geometry = Geometry::Polygon {
            coordinates: vec![
                vec![
                    vec![0.0, 0.0, 10.0],
                    vec![10.0, 0.0, 10.0],
                    vec![10.0, 10.0, 10.0],
                    vec![0.0, 10.0, 10.0],
                ],
                vec![vec![4.0, 4.0], vec![6.0, 4.0], vec![6.0, 6.0], vec![4.0, 6.0]],
            ],
        };
        let polygon = geometry.to_multi_polygon().unwrap();
        assert_eq!(polygon.0[0].interiors().len(), 1);
        // Exterior is closed by geo.
        assert_eq!(polygon.0[0].exterior().0.first(), polygon.0[0].exterior().0.last());
    }

    #[test]
    fn rejects_degenerate_polygons() {
        let empty = Geometry::Polygon {
            coordinates: vec![],
        };
        assert!(empty.to_multi_polygon().is_err());

        let short = Geometry::Polygon {
            coordinates: vec![vec![vec![0.0, 0.0], vec![1.0, 1.0]]],
        };
        assert!(short.to_multi_polygon().is_err());

        let bad_position = Geometry::Polygon {
            coordinates: vec![vec![vec![0.0], vec![1.0, 0.0], vec![1.0, 1.0]]],
        };
        assert!(bad_position.to_multi_polygon().is_err());
    }

    #[test]
    fn single_part_written_back_as_polygon() {
        let source = Geometry::MultiPolygon {
            coordinates: vec![vec![vec![
                vec![0.0, 0.0],
                vec![2.0, 0.0],
                vec![2.0, 2.0],
                vec![0.0, 0.0],
            ]]],
        };
        let written = Geometry::from_multi_polygon(&source.to_multi_polygon().unwrap());
        let value = serde_json::to_value(&written).unwrap();
        assert_eq!(value["type"], "Polygon");
        assert_eq!(value["coordinates"][0][1], serde_json::json!([2.0, 0.0]));
    }
}
