use serde_json::Value;

use crate::domain::{EnrichmentSource, TaxonRef};
use crate::enrichers::{Enricher, EnrichmentOutcome, SkipReason};
use crate::error::EnrichError;
use crate::fetch::Fetcher;
use crate::store::{NewMedia, SharedStore};
use crate::text::strip_markup;

pub const COMMONS_API_URL: &str = "https://commons.wikimedia.org/w/api.php";
pub const WIKIDATA_SPARQL_URL: &str = "https://query.wikidata.org/sparql";

const COMMONS: &str = "Wikimedia Commons";
const WIKIDATA: &str = "Wikidata P18";

const ALLOWED_LICENSES: [&str; 4] = ["cc0", "cc by", "cc by-sa", "public domain"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub url: String,
    pub thumb_url: Option<String>,
    pub title: String,
    pub author: String,
    pub license: String,
    pub source: String,
}

impl ImageCandidate {
    fn into_media(self) -> NewMedia {
        NewMedia {
            url: self.url,
            thumb_url: self.thumb_url,
            title: self.title,
            author: self.author,
            license: self.license,
            source: self.source,
        }
    }
}

/// Primary image search: first acceptable image for one query string.
pub trait CommonsSearch: Send + Sync {
    fn best_image(&self, query: &str) -> Result<Option<ImageCandidate>, EnrichError>;
}

/// Fallback: image URL linked to the taxon name in a linked-data graph.
pub trait LinkedDataImages: Send + Sync {
    fn image_for(&self, scientific_name: &str) -> Result<Option<String>, EnrichError>;
}

#[derive(Clone)]
pub struct CommonsClient {
    fetcher: Fetcher,
    api_url: String,
}

impl CommonsClient {
    pub fn new(fetcher: Fetcher, api_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_url: api_url.into(),
        }
    }
}

impl CommonsSearch for CommonsClient {
    fn best_image(&self, query: &str) -> Result<Option<ImageCandidate>, EnrichError> {
        let search = format!("{query} filetype:bitmap");
        let raw = self
            .fetcher
            .get_json(
                &self.api_url,
                &[
                    ("action", "query"),
                    ("format", "json"),
                    ("origin", "*"),
                    ("generator", "search"),
                    ("gsrsearch", &search),
                    ("gsrlimit", "12"),
                    ("prop", "imageinfo"),
                    ("iiprop", "url|user|extmetadata"),
                    ("iiurlwidth", "1200"),
                    ("iiurlheight", "1200"),
                ],
            )
            .map_err(|err| EnrichError::upstream("Commons", err))?;
        Ok(pick_commons_image(&raw))
    }
}

#[derive(Clone)]
pub struct WikidataClient {
    fetcher: Fetcher,
    sparql_url: String,
}

impl WikidataClient {
    pub fn new(fetcher: Fetcher, sparql_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            sparql_url: sparql_url.into(),
        }
    }
}

impl LinkedDataImages for WikidataClient {
    fn image_for(&self, scientific_name: &str) -> Result<Option<String>, EnrichError> {
        let query = p18_query(scientific_name);
        let raw = self
            .fetcher
            .get_json(&self.sparql_url, &[("format", "json"), ("query", &query)])
            .map_err(|err| EnrichError::upstream("Wikidata", err))?;
        Ok(raw
            .pointer("/results/bindings/0/image/value")
            .and_then(|value| value.as_str())
            .map(str::to_string))
    }
}

pub fn p18_query(scientific_name: &str) -> String {
    let literal = scientific_name.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "SELECT ?image WHERE {{ ?item wdt:P225 \"{literal}\" . ?item wdt:P18 ?image . }} LIMIT 1"
    )
}

/// True for CC0, CC BY, CC BY-SA and public-domain marks; NonCommercial and
/// NoDerivatives variants are refused.
pub fn is_permissive_license(license: &str) -> bool {
    let normalized = license.to_ascii_lowercase();
    if normalized.contains("-nc") || normalized.contains("-nd") {
        return false;
    }
    ALLOWED_LICENSES
        .iter()
        .any(|allowed| normalized.contains(allowed))
}

fn meta_value(meta: &Value, key: &str) -> Option<String> {
    meta.get(key)
        .and_then(|entry| entry.get("value"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

/// Picks the best-ranked page with an acceptable license from a generator
/// search response.
pub fn pick_commons_image(raw: &Value) -> Option<ImageCandidate> {
    let mut pages = raw
        .pointer("/query/pages")
        .and_then(|value| value.as_object())
        .map(|pages| pages.values().collect::<Vec<_>>())
        .unwrap_or_default();
    pages.sort_by_key(|page| page.get("index").and_then(|i| i.as_i64()).unwrap_or(i64::MAX));

    pages.into_iter().find_map(|page| {
        let info = page.get("imageinfo")?.as_array()?.first()?;
        let url = info.get("url")?.as_str()?.to_string();
        let meta = info.get("extmetadata").cloned().unwrap_or(Value::Null);
        let license = meta_value(&meta, "LicenseShortName").unwrap_or_default();
        if !is_permissive_license(&license) {
            return None;
        }

        let artist = meta_value(&meta, "Artist")
            .map(|artist| strip_markup(&artist))
            .filter(|artist| !artist.is_empty());
        let uploader = info
            .get("user")
            .and_then(|value| value.as_str())
            .map(str::to_string);
        let page_title = page
            .get("title")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        let title = meta_value(&meta, "ObjectName")
            .map(|name| strip_markup(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| page_title.trim_start_matches("File:").to_string());

        Some(ImageCandidate {
            url,
            thumb_url: info
                .get("thumburl")
                .and_then(|value| value.as_str())
                .map(str::to_string),
            title,
            author: artist.or(uploader).unwrap_or_else(|| "Unknown".to_string()),
            license,
            source: COMMONS.to_string(),
        })
    })
}

/// Full name, binomial, then genus plus epithet; duplicates removed.
pub fn query_variants(canonical_name: &str) -> Vec<String> {
    let parts = canonical_name.split_whitespace().collect::<Vec<_>>();
    let mut variants = vec![parts.join(" ")];
    if parts.len() >= 2 {
        variants.push(parts[..2].join(" "));
        variants.push(format!("{} {}", parts[0], parts[1]));
    }
    let mut seen = Vec::new();
    variants.retain(|variant| {
        if variant.is_empty() || seen.contains(variant) {
            false
        } else {
            seen.push(variant.clone());
            true
        }
    });
    variants
}

pub struct ImageryEnricher<C: CommonsSearch, W: LinkedDataImages> {
    commons: C,
    linked_data: W,
    store: SharedStore,
}

impl<C: CommonsSearch, W: LinkedDataImages> ImageryEnricher<C, W> {
    pub fn new(commons: C, linked_data: W, store: SharedStore) -> Self {
        Self {
            commons,
            linked_data,
            store,
        }
    }

    fn insert_if_new(
        &self,
        taxon: &TaxonRef,
        candidate: ImageCandidate,
    ) -> Result<EnrichmentOutcome, EnrichError> {
        if self.store.media_exists(taxon.id, &candidate.url)? {
            return Ok(EnrichmentOutcome::Skipped(SkipReason::Exists));
        }
        let source = candidate.source.clone();
        let url = candidate.url.clone();
        if !self.store.insert_media(taxon.id, &candidate.into_media())? {
            return Ok(EnrichmentOutcome::Skipped(SkipReason::Exists));
        }
        tracing::info!(taxon_id = %taxon.id, %source, %url, "image added");
        Ok(EnrichmentOutcome::Added)
    }
}

impl<C: CommonsSearch, W: LinkedDataImages> Enricher for ImageryEnricher<C, W> {
    fn source(&self) -> EnrichmentSource {
        EnrichmentSource::Media
    }

    fn enrich(&self, taxon: &TaxonRef) -> Result<EnrichmentOutcome, EnrichError> {
        let variants = query_variants(&taxon.canonical_name);
        let mut failures = 0usize;
        let mut last_error = None;

        for query in &variants {
            match self.commons.best_image(query) {
                Ok(Some(candidate)) => return self.insert_if_new(taxon, candidate),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(taxon_id = %taxon.id, %query, error = %err, "image search failed");
                    failures += 1;
                    last_error = Some(err);
                }
            }
        }

        if let Some(url) = self.linked_data.image_for(&taxon.canonical_name)? {
            let candidate = ImageCandidate {
                url,
                thumb_url: None,
                title: taxon.canonical_name.clone(),
                author: "Wikidata".to_string(),
                license: "Various".to_string(),
                source: WIKIDATA.to_string(),
            };
            return self.insert_if_new(taxon, candidate);
        }

        // Nothing found, but if every primary query failed the absence says
        // nothing about the taxon.
        match last_error {
            Some(err) if failures == variants.len() => Err(err),
            _ => Ok(EnrichmentOutcome::Skipped(SkipReason::NoSources)),
        }
    }
}
