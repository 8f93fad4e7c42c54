use chrono::NaiveDate;
use reqwest::Url;
use serde_json::Value;

use crate::domain::{EnrichmentSource, IucnCategory, PopulationTrend, TaxonRef};
use crate::enrichers::{Enricher, EnrichmentOutcome, SkipReason};
use crate::error::EnrichError;
use crate::fetch::{FetchError, Fetcher};
use crate::store::{SharedStore, StatusRecord};

const SERVICE: &str = "IUCN";
const IUCN_SEARCH_URL: &str = "https://www.iucnredlist.org/search";

pub const IUCN_ENDPOINTS: [&str; 2] = [
    "https://apiv3.iucnredlist.org/api/v3/species",
    "https://apiv4.iucnredlist.org/api/v4/species",
];

/// A Red List assessment as read from whichever API version answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assessment {
    pub category: Option<String>,
    pub trend: Option<String>,
    pub year: Option<i32>,
}

pub trait StatusClient: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    fn assessment(&self, scientific_name: &str) -> Result<Option<Assessment>, EnrichError>;
}

#[derive(Clone)]
pub struct IucnClient {
    fetcher: Fetcher,
    endpoints: Vec<String>,
    token: Option<String>,
}

impl IucnClient {
    pub fn new(fetcher: Fetcher, endpoints: Vec<String>, token: Option<String>) -> Self {
        Self {
            fetcher,
            endpoints,
            token: token.filter(|value| !value.trim().is_empty()),
        }
    }

    pub fn species_url(endpoint: &str, name: &str) -> Result<Url, EnrichError> {
        let mut url = Url::parse(endpoint)
            .map_err(|err| EnrichError::payload(SERVICE, format!("bad endpoint {endpoint}: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| EnrichError::payload(SERVICE, format!("bad endpoint {endpoint}")))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }
}

impl StatusClient for IucnClient {
    fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    fn assessment(&self, scientific_name: &str) -> Result<Option<Assessment>, EnrichError> {
        let token = self.token.as_deref().unwrap_or_default();
        let mut last_error: Option<FetchError> = None;

        for endpoint in &self.endpoints {
            let url = Self::species_url(endpoint, scientific_name)?;
            match self.fetcher.get_json(url.as_str(), &[("token", token)]) {
                Ok(raw) => return Ok(map_assessment(&raw)),
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    tracing::debug!(endpoint = %endpoint, error = %err, "IUCN endpoint failed");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => Err(EnrichError::upstream(SERVICE, err)),
            None => Ok(None),
        }
    }
}

fn first_str(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        record
            .get(*key)
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn first_year(record: &Value, keys: &[&str]) -> Option<i32> {
    keys.iter().find_map(|key| {
        let value = record.get(*key)?;
        value
            .as_i64()
            .and_then(|year| i32::try_from(year).ok())
            .or_else(|| value.as_str().and_then(|text| text.trim().get(..4)?.parse().ok()))
    })
}

/// Reads the first record of a v3 (`result`) or v4 (`data`) response,
/// accepting the field names used by either version.
pub fn map_assessment(raw: &Value) -> Option<Assessment> {
    let record = ["data", "result"].iter().find_map(|key| {
        raw.get(*key)
            .and_then(|value| value.as_array())
            .and_then(|records| records.first())
    })?;

    Some(Assessment {
        category: first_str(
            record,
            &["category", "status", "category_name", "redlist_category"],
        ),
        trend: first_str(record, &["population_trend", "trend"]),
        year: first_year(record, &["published_year", "assessed_year", "year"]),
    })
}

pub fn search_url(scientific_name: &str) -> String {
    Url::parse_with_params(
        IUCN_SEARCH_URL,
        &[("query", scientific_name), ("searchType", "species")],
    )
    .map(String::from)
    .unwrap_or_else(|_| IUCN_SEARCH_URL.to_string())
}

pub fn to_status_record(scientific_name: &str, assessment: &Assessment) -> StatusRecord {
    StatusRecord {
        category: assessment.category.as_deref().and_then(IucnCategory::parse),
        trend: assessment.trend.as_deref().map(PopulationTrend::parse),
        assessed_at: assessment
            .year
            .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1)),
        source_url: search_url(scientific_name),
    }
}

pub struct StatusEnricher<C: StatusClient> {
    client: C,
    store: SharedStore,
}

impl<C: StatusClient> StatusEnricher<C> {
    pub fn new(client: C, store: SharedStore) -> Self {
        Self { client, store }
    }
}

impl<C: StatusClient> Enricher for StatusEnricher<C> {
    fn source(&self) -> EnrichmentSource {
        EnrichmentSource::Status
    }

    fn enrich(&self, taxon: &TaxonRef) -> Result<EnrichmentOutcome, EnrichError> {
        if !self.client.is_configured() {
            return Ok(EnrichmentOutcome::Skipped(SkipReason::NotConfigured));
        }
        let Some(assessment) = self.client.assessment(&taxon.canonical_name)? else {
            tracing::warn!(
                taxon_id = %taxon.id,
                name = %taxon.canonical_name,
                "no IUCN assessment found"
            );
            return Ok(EnrichmentOutcome::Skipped(SkipReason::NoAssessment));
        };

        let record = to_status_record(&taxon.canonical_name, &assessment);
        if record.category.is_none() {
            tracing::warn!(
                taxon_id = %taxon.id,
                raw_category = assessment.category.as_deref().unwrap_or(""),
                "IUCN category missing or unrecognised"
            );
        }
        self.store.upsert_status(taxon.id, &record)?;
        tracing::info!(
            taxon_id = %taxon.id,
            category = record.category.map(|c| c.code()).unwrap_or("-"),
            "status updated"
        );
        Ok(EnrichmentOutcome::Added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn species_url_ignores_trailing_slash() {
        let url = IucnClient::species_url(
            "https://apiv3.iucnredlist.org/api/v3/species/",
            "Panthera pardus",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://apiv3.iucnredlist.org/api/v3/species/Panthera%20pardus"
        );
    }

    #[test]
    fn search_url_is_encoded() {
        assert_eq!(
            search_url("Panthera pardus"),
            "https://www.iucnredlist.org/search?query=Panthera+pardus&searchType=species"
        );
    }
}
