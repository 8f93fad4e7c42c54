//! Aggregates raw observation points into a coarse grid of count-weighted
//! rectangles, emitted as a GeoJSON `FeatureCollection`.
//!
//! The surface approximates where a taxon has been *observed*; its accuracy
//! is bounded by observation effort and by the cell size. It is not a range
//! map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CELL_SIZE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OccurrenceCell {
    /// South-west corner latitude.
    pub lat: f64,
    /// South-west corner longitude.
    pub lng: f64,
    pub count: u32,
}

impl OccurrenceCell {
    /// Closed ring in GeoJSON `[lng, lat]` order, counter-clockwise.
    pub fn ring(&self, size: f64) -> Vec<[f64; 2]> {
        let lat2 = self.lat + size;
        let lng2 = self.lng + size;
        vec![
            [self.lng, self.lat],
            [lng2, self.lat],
            [lng2, lat2],
            [self.lng, lat2],
            [self.lng, self.lat],
        ]
    }
}

#[derive(Debug, Clone)]
pub struct OccurrenceGrid {
    cell_size: f64,
    cells: BTreeMap<(i64, i64), u32>,
    accepted: usize,
    dropped: usize,
}

impl OccurrenceGrid {
    pub fn new(cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            DEFAULT_CELL_SIZE
        };
        Self {
            cell_size,
            cells: BTreeMap::new(),
            accepted: 0,
            dropped: 0,
        }
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Adds one `(lng, lat)` point; out-of-range or non-finite points are
    /// dropped and reported as `false`.
    pub fn add(&mut self, lng: f64, lat: f64) -> bool {
        let valid = lng.is_finite()
            && lat.is_finite()
            && (-180.0..=180.0).contains(&lng)
            && (-90.0..=90.0).contains(&lat);
        if !valid {
            self.dropped += 1;
            return false;
        }
        let key = (
            (lat / self.cell_size).floor() as i64,
            (lng / self.cell_size).floor() as i64,
        );
        *self.cells.entry(key).or_insert(0) += 1;
        self.accepted += 1;
        true
    }

    pub fn extend<I>(&mut self, points: I)
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        for (lng, lat) in points {
            self.add(lng, lat);
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Non-empty cells ordered by (lat, lng) of their origin.
    pub fn cells(&self) -> Vec<OccurrenceCell> {
        self.cells
            .iter()
            .map(|(&(lat_idx, lng_idx), &count)| OccurrenceCell {
                lat: lat_idx as f64 * self.cell_size,
                lng: lng_idx as f64 * self.cell_size,
                count,
            })
            .collect()
    }

    pub fn to_feature_collection(&self) -> FeatureCollection {
        let features = self
            .cells()
            .into_iter()
            .map(|cell| Feature {
                kind: FeatureType::Feature,
                properties: CellProperties { count: cell.count },
                geometry: Polygon {
                    kind: PolygonType::Polygon,
                    coordinates: vec![cell.ring(self.cell_size)],
                },
            })
            .collect();
        FeatureCollection {
            kind: CollectionType::FeatureCollection,
            features,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionType {
    FeatureCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureType {
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolygonType {
    Polygon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: CollectionType,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: FeatureType,
    pub properties: CellProperties,
    pub geometry: Polygon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellProperties {
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    #[serde(rename = "type")]
    pub kind: PolygonType,
    pub coordinates: Vec<Vec<[f64; 2]>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_coordinates_floor_towards_south_west() {
        let mut grid = OccurrenceGrid::new(1.0);
        grid.add(-0.5, -0.5);
        let cells = grid.cells();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].lat, -1.0);
        assert_eq!(cells[0].lng, -1.0);
    }

    #[test]
    fn invalid_points_are_dropped() {
        let mut grid = OccurrenceGrid::new(1.0);
        assert!(!grid.add(f64::NAN, 10.0));
        assert!(!grid.add(10.0, 95.0));
        assert!(grid.is_empty());
        assert_eq!(grid.dropped(), 2);
    }

    #[test]
    fn serializes_as_geojson() {
        let mut grid = OccurrenceGrid::new(2.0);
        grid.add(3.0, 5.0);
        let json = serde_json::to_value(grid.to_feature_collection()).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        assert_eq!(json["features"][0]["type"], "Feature");
        assert_eq!(json["features"][0]["geometry"]["type"], "Polygon");
        assert_eq!(json["features"][0]["properties"]["count"], 1);
        assert_eq!(json["features"][0]["geometry"]["coordinates"][0][2][0], 4.0);
    }
}
