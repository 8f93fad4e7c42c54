use taxon_enricher::binning::{DEFAULT_CELL_SIZE, OccurrenceGrid};

#[test]
fn three_points_make_two_cells() {
    let mut grid = OccurrenceGrid::new(DEFAULT_CELL_SIZE);
    grid.extend([(10.2, 45.1), (10.4, 45.3), (12.0, 50.0)]);

    let cells = grid.cells();
    assert_eq!(cells.len(), 2);
    assert_eq!((cells[0].lat, cells[0].lng, cells[0].count), (45.0, 10.0, 2));
    assert_eq!((cells[1].lat, cells[1].lng, cells[1].count), (50.0, 12.0, 1));

    let surface = grid.to_feature_collection();
    assert_eq!(surface.features.len(), 2);
    assert_eq!(surface.features[0].properties.count, 2);
    assert_eq!(
        surface.features[0].geometry.coordinates[0],
        vec![
            [10.0, 45.0],
            [11.0, 45.0],
            [11.0, 46.0],
            [10.0, 46.0],
            [10.0, 45.0]
        ]
    );
    for feature in &surface.features {
        let ring = &feature.geometry.coordinates[0];
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.first(), ring.last());
    }
}

#[test]
fn surface_serializes_as_geojson() {
    let mut grid = OccurrenceGrid::new(0.5);
    grid.add(-3.7, 40.4);
    let json = serde_json::to_value(grid.to_feature_collection()).unwrap();

    assert_eq!(json["type"], "FeatureCollection");
    assert_eq!(json["features"][0]["type"], "Feature");
    assert_eq!(json["features"][0]["geometry"]["type"], "Polygon");
    assert_eq!(json["features"][0]["properties"]["count"], 1);
    assert_eq!(json["features"][0]["geometry"]["coordinates"][0][0][0], -4.0);
    assert_eq!(json["features"][0]["geometry"]["coordinates"][0][0][1], 40.0);
}

#[test]
fn insertion_order_does_not_change_output() {
    let points = [(10.2, 45.1), (-70.0, -10.0), (12.0, 50.0), (10.9, 45.9)];
    let mut forward = OccurrenceGrid::new(1.0);
    forward.extend(points);
    let mut backward = OccurrenceGrid::new(1.0);
    backward.extend(points.into_iter().rev());

    assert_eq!(forward.to_feature_collection(), backward.to_feature_collection());
    assert_eq!(forward.accepted(), 4);
}

#[test]
fn non_positive_cell_size_falls_back_to_default() {
    let grid = OccurrenceGrid::new(0.0);
    assert_eq!(grid.cell_size(), DEFAULT_CELL_SIZE);
}
