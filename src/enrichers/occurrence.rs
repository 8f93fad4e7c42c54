use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::binning::{DEFAULT_CELL_SIZE, OccurrenceGrid};
use crate::domain::{EnrichmentSource, TaxonRef};
use crate::enrichers::{Enricher, EnrichmentOutcome, SkipReason};
use crate::error::EnrichError;
use crate::fetch::Fetcher;
use crate::store::SharedStore;

pub const INAT_OBSERVATIONS_URL: &str = "https://api.inaturalist.org/v1/observations";
pub const OCCURRENCE_SOURCE: &str = "inat";

const SERVICE: &str = "iNaturalist";
const PER_PAGE: &str = "200";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccurrenceOptions {
    pub pages: u32,
    pub cell_size: f64,
    pub max_points: usize,
    pub page_delay: Duration,
}

impl Default for OccurrenceOptions {
    fn default() -> Self {
        Self {
            pages: 3,
            cell_size: DEFAULT_CELL_SIZE,
            max_points: 1500,
            page_delay: Duration::from_millis(800),
        }
    }
}

/// Georeferenced observations, one page at a time. Points are `(lng, lat)`.
pub trait ObservationSource: Send + Sync {
    fn observations(
        &self,
        scientific_name: &str,
        page: u32,
    ) -> Result<Vec<(f64, f64)>, EnrichError>;
}

#[derive(Clone)]
pub struct InatClient {
    fetcher: Fetcher,
    url: String,
}

impl InatClient {
    pub fn new(fetcher: Fetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

impl ObservationSource for InatClient {
    fn observations(
        &self,
        scientific_name: &str,
        page: u32,
    ) -> Result<Vec<(f64, f64)>, EnrichError> {
        let page = page.to_string();
        let raw = self
            .fetcher
            .get_json(
                &self.url,
                &[
                    ("taxon_name", scientific_name),
                    ("geo", "true"),
                    ("verifiable", "true"),
                    ("order", "desc"),
                    ("order_by", "created_at"),
                    ("per_page", PER_PAGE),
                    ("page", &page),
                ],
            )
            .map_err(|err| EnrichError::upstream(SERVICE, err))?;
        Ok(parse_points(&raw))
    }
}

/// Extracts `geojson.coordinates` from each result; results without a
/// usable point are skipped.
pub fn parse_points(raw: &Value) -> Vec<(f64, f64)> {
    raw.get("results")
        .and_then(|value| value.as_array())
        .map(|results| {
            results
                .iter()
                .filter_map(|result| {
                    let coords = result.pointer("/geojson/coordinates")?.as_array()?;
                    match coords.as_slice() {
                        [lng, lat, ..] => Some((lng.as_f64()?, lat.as_f64()?)),
                        _ => None,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct OccurrenceEnricher<S: ObservationSource> {
    source: S,
    store: SharedStore,
    options: OccurrenceOptions,
}

impl<S: ObservationSource> OccurrenceEnricher<S> {
    pub fn new(source: S, store: SharedStore, options: OccurrenceOptions) -> Self {
        Self {
            source,
            store,
            options,
        }
    }

    /// Pages through observations until a page comes back empty, the page
    /// limit is hit, or `max_points` have been collected.
    pub fn collect_points(&self, scientific_name: &str) -> Result<Vec<(f64, f64)>, EnrichError> {
        let mut points = Vec::new();
        for page in 1..=self.options.pages.max(1) {
            let chunk = self.source.observations(scientific_name, page)?;
            let empty = chunk.is_empty();
            points.extend(chunk);
            if empty || points.len() >= self.options.max_points {
                break;
            }
            if page < self.options.pages && !self.options.page_delay.is_zero() {
                thread::sleep(self.options.page_delay);
            }
        }
        points.truncate(self.options.max_points);
        Ok(points)
    }
}

impl<S: ObservationSource> Enricher for OccurrenceEnricher<S> {
    fn source(&self) -> EnrichmentSource {
        EnrichmentSource::Occurrence
    }

    fn enrich(&self, taxon: &TaxonRef) -> Result<EnrichmentOutcome, EnrichError> {
        let points = self.collect_points(&taxon.canonical_name)?;
        let mut grid = OccurrenceGrid::new(self.options.cell_size);
        grid.extend(points);
        if grid.dropped() > 0 {
            tracing::debug!(taxon_id = %taxon.id, dropped = grid.dropped(), "invalid coordinates dropped");
        }
        if grid.is_empty() {
            return Ok(EnrichmentOutcome::Skipped(SkipReason::NoObservations));
        }

        let surface = grid.to_feature_collection();
        self.store
            .upsert_occurrence(taxon.id, OCCURRENCE_SOURCE, &surface)?;
        tracing::info!(
            taxon_id = %taxon.id,
            points = grid.accepted(),
            cells = surface.features.len(),
            "occurrence surface stored"
        );
        Ok(EnrichmentOutcome::Added)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn points_without_geometry_are_skipped() {
        let raw = json!({
            "results": [
                {"geojson": {"type": "Point", "coordinates": [10.2, 45.1]}},
                {"geojson": null},
                {"geojson": {"coordinates": [1.0]}},
                {}
            ]
        });
        assert_eq!(parse_points(&raw), vec![(10.2, 45.1)]);
    }
}
