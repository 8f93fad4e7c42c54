use serde_json::Value;

use crate::domain::{EnrichmentSource, TaxonRef};
use crate::enrichers::{Enricher, EnrichmentOutcome, SkipReason};
use crate::error::EnrichError;
use crate::fetch::Fetcher;
use crate::store::{NewDescription, SharedStore};
use crate::text::strip_markup;

pub const EOL_BASE_URL: &str = "https://eol.org";

const SERVICE: &str = "EOL";
const DCMI_TEXT: &str = "http://purl.org/dc/dcmitype/Text";

/// Narrative text for one taxon page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPage {
    pub page_id: i64,
    pub title: String,
    pub content: String,
    pub url: String,
}

pub trait TextReference: Send + Sync {
    fn page_for(&self, scientific_name: &str) -> Result<Option<TextPage>, EnrichError>;
}

#[derive(Clone)]
pub struct EolClient {
    fetcher: Fetcher,
    base_url: String,
}

impl EolClient {
    pub fn new(fetcher: Fetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn search(&self, scientific_name: &str) -> Result<Option<i64>, EnrichError> {
        let url = format!("{}/api/search/1.0.json", self.base_url);
        let raw = self
            .fetcher
            .get_json(&url, &[("q", scientific_name)])
            .map_err(|err| EnrichError::upstream(SERVICE, err))?;
        Ok(first_result_id(&raw))
    }
}

impl TextReference for EolClient {
    fn page_for(&self, scientific_name: &str) -> Result<Option<TextPage>, EnrichError> {
        let Some(page_id) = self.search(scientific_name)? else {
            return Ok(None);
        };
        let url = format!("{}/api/pages/1.0/{page_id}.json", self.base_url);
        let raw = self
            .fetcher
            .get_json(
                &url,
                &[
                    ("images", "0"),
                    ("videos", "0"),
                    ("sounds", "0"),
                    ("maps", "0"),
                    ("texts", "6"),
                    ("details", "true"),
                ],
            )
            .map_err(|err| EnrichError::upstream(SERVICE, err))?;
        Ok(Some(map_page(
            page_id,
            scientific_name,
            &raw,
            &format!("{}/pages/{page_id}", self.base_url),
        )))
    }
}

pub fn first_result_id(raw: &Value) -> Option<i64> {
    let id = raw.pointer("/results/0/id")?;
    id.as_i64()
        .or_else(|| id.as_str().and_then(|text| text.trim().parse().ok()))
}

/// Chooses the DCMI Text object when there is one, otherwise the first
/// data object, and flattens its markup.
pub fn map_page(page_id: i64, scientific_name: &str, raw: &Value, url: &str) -> TextPage {
    let objects = raw
        .get("dataObjects")
        .and_then(|value| value.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();
    let best = objects
        .iter()
        .find(|object| object.get("subject").and_then(|s| s.as_str()) == Some(DCMI_TEXT))
        .or_else(|| objects.first());

    let title = str_field(best, "title")
        .or_else(|| str_field(Some(raw), "scientificName"))
        .unwrap_or_else(|| scientific_name.to_string());
    let content = str_field(best, "description")
        .map(|html| strip_markup(&html))
        .unwrap_or_default();

    TextPage {
        page_id,
        title,
        content,
        url: url.to_string(),
    }
}

fn str_field(value: Option<&Value>, key: &str) -> Option<String> {
    value
        .and_then(|value| value.get(key))
        .and_then(|field| field.as_str())
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(str::to_string)
}

pub struct DescriptionEnricher<T: TextReference> {
    reference: T,
    store: SharedStore,
}

impl<T: TextReference> DescriptionEnricher<T> {
    pub fn new(reference: T, store: SharedStore) -> Self {
        Self { reference, store }
    }
}

impl<T: TextReference> Enricher for DescriptionEnricher<T> {
    fn source(&self) -> EnrichmentSource {
        EnrichmentSource::Description
    }

    fn enrich(&self, taxon: &TaxonRef) -> Result<EnrichmentOutcome, EnrichError> {
        let Some(page) = self.reference.page_for(&taxon.canonical_name)? else {
            return Ok(EnrichmentOutcome::Skipped(SkipReason::NoSources));
        };
        if page.content.is_empty() {
            return Ok(EnrichmentOutcome::Skipped(SkipReason::NoText));
        }

        self.store.set_eol_id(taxon.id, page.page_id)?;
        let inserted = self.store.insert_description(
            taxon.id,
            &NewDescription {
                source: SERVICE.to_string(),
                lang: "en".to_string(),
                title: page.title,
                content: page.content,
                url: page.url,
            },
        )?;
        if !inserted {
            return Ok(EnrichmentOutcome::Skipped(SkipReason::Exists));
        }
        tracing::info!(taxon_id = %taxon.id, eol_id = page.page_id, "description added");
        Ok(EnrichmentOutcome::Added)
    }
}
