//! Resolution of a scientific name to a lineage of taxon nodes, backed by
//! the GBIF backbone taxonomy.

use serde::Serialize;
use serde_json::Value;

use crate::domain::{BatchEntry, Rank, TaxonId, TaxonRef, collapse_whitespace};
use crate::error::EnrichError;
use crate::fetch::Fetcher;
use crate::store::{NewTaxonName, SharedStore};

pub const GBIF_BASE_URL: &str = "https://api.gbif.org/v1";
const SERVICE: &str = "GBIF";
const MAX_COMMON_NAMES: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMatch {
    pub key: i64,
    pub rank: Option<String>,
    pub canonical_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonDetail {
    pub key: i64,
    pub rank: Option<String>,
    pub canonical_name: String,
    pub kingdom: Option<String>,
    pub phylum: Option<String>,
    pub class: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VernacularName {
    pub name: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageStep {
    pub name: String,
    pub rank: Rank,
}

pub trait TaxonomyAuthority: Send + Sync {
    fn match_name(&self, name: &str) -> Result<NameMatch, EnrichError>;
    fn detail(&self, key: i64) -> Result<TaxonDetail, EnrichError>;
    fn vernacular_names(&self, name: &str) -> Result<Vec<VernacularName>, EnrichError>;
}

#[derive(Clone)]
pub struct GbifClient {
    fetcher: Fetcher,
    base_url: String,
}

impl GbifClient {
    pub fn new(fetcher: Fetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

impl TaxonomyAuthority for GbifClient {
    fn match_name(&self, name: &str) -> Result<NameMatch, EnrichError> {
        let url = format!("{}/species/match", self.base_url);
        let raw = self
            .fetcher
            .get_json(&url, &[("name", name)])
            .map_err(|err| EnrichError::upstream(SERVICE, err))?;
        parse_match(name, &raw)
    }

    fn detail(&self, key: i64) -> Result<TaxonDetail, EnrichError> {
        let url = format!("{}/species/{key}", self.base_url);
        let raw = self
            .fetcher
            .get_json(&url, &[])
            .map_err(|err| EnrichError::upstream(SERVICE, err))?;
        parse_detail(&raw)
    }

    fn vernacular_names(&self, name: &str) -> Result<Vec<VernacularName>, EnrichError> {
        let url = format!("{}/species/search", self.base_url);
        let raw = self
            .fetcher
            .get_json(&url, &[("q", name), ("limit", "20")])
            .map_err(|err| EnrichError::upstream(SERVICE, err))?;
        Ok(parse_vernacular_names(&raw))
    }
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn parse_match(query: &str, raw: &Value) -> Result<NameMatch, EnrichError> {
    let key = ["acceptedUsageKey", "usageKey", "speciesKey"]
        .iter()
        .find_map(|field| raw.get(*field).and_then(|value| value.as_i64()))
        .ok_or_else(|| EnrichError::NoMatch(query.to_string()))?;
    Ok(NameMatch {
        key,
        rank: str_field(raw, "rank").map(|rank| rank.to_ascii_lowercase()),
        canonical_name: str_field(raw, "canonicalName")
            .or_else(|| str_field(raw, "scientificName"))
            .unwrap_or_else(|| query.to_string()),
    })
}

pub fn parse_detail(raw: &Value) -> Result<TaxonDetail, EnrichError> {
    let key = raw
        .get("key")
        .and_then(|value| value.as_i64())
        .ok_or_else(|| EnrichError::payload(SERVICE, "species detail without key"))?;
    let canonical_name = str_field(raw, "canonicalName")
        .or_else(|| str_field(raw, "scientificName"))
        .ok_or_else(|| EnrichError::payload(SERVICE, "species detail without name"))?;
    Ok(TaxonDetail {
        key,
        rank: str_field(raw, "rank").map(|rank| rank.to_ascii_lowercase()),
        canonical_name,
        kingdom: str_field(raw, "kingdom"),
        phylum: str_field(raw, "phylum"),
        class: str_field(raw, "class"),
        order: str_field(raw, "order"),
        family: str_field(raw, "family"),
        genus: str_field(raw, "genus"),
        species: str_field(raw, "species"),
    })
}

pub fn parse_vernacular_names(raw: &Value) -> Vec<VernacularName> {
    raw.get("results")
        .and_then(|value| value.as_array())
        .and_then(|results| results.first())
        .and_then(|first| first.get("vernacularNames"))
        .and_then(|value| value.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|entry| {
                    let name =
                        str_field(entry, "vernacularName").or_else(|| str_field(entry, "name"))?;
                    Some(VernacularName {
                        name,
                        language: str_field(entry, "language"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Builds the ancestor chain, most general first, ending at the matched
/// taxon itself. Every step is strictly more specific than the previous one.
pub fn lineage(detail: &TaxonDetail) -> Result<Vec<LineageStep>, EnrichError> {
    let leaf_rank: Rank = detail
        .rank
        .as_deref()
        .ok_or_else(|| EnrichError::InvalidRank(String::new()))?
        .parse()?;

    let mut chain: Vec<LineageStep> = Vec::new();
    let mut push = |name: Option<&String>, rank: Rank| {
        if let Some(name) = name {
            let more_specific = chain.last().is_none_or(|last| rank > last.rank);
            if more_specific && rank <= leaf_rank {
                chain.push(LineageStep {
                    name: name.clone(),
                    rank,
                });
            }
        }
    };

    push(detail.kingdom.as_ref(), Rank::Kingdom);
    push(detail.phylum.as_ref(), Rank::Phylum);
    push(detail.class.as_ref(), Rank::Class);
    push(detail.order.as_ref(), Rank::Order);
    push(detail.family.as_ref(), Rank::Family);
    push(detail.genus.as_ref(), Rank::Genus);
    if leaf_rank == Rank::Subspecies {
        push(detail.species.as_ref(), Rank::Species);
    }

    // The leaf itself replaces a same-rank step taken from the classification.
    if chain.last().is_some_and(|last| last.rank == leaf_rank) {
        chain.pop();
    }
    chain.push(LineageStep {
        name: detail.canonical_name.clone(),
        rank: leaf_rank,
    });
    Ok(chain)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub taxon: TaxonRef,
    pub rank: Rank,
    pub external_key: i64,
    pub lineage: Vec<LineageStep>,
}

pub struct Resolver<A: TaxonomyAuthority> {
    authority: A,
    store: SharedStore,
    load_common_names: bool,
}

impl<A: TaxonomyAuthority> Resolver<A> {
    pub fn new(authority: A, store: SharedStore) -> Self {
        Self {
            authority,
            store,
            load_common_names: true,
        }
    }

    pub fn with_common_names(mut self, enabled: bool) -> Self {
        self.load_common_names = enabled;
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Resolution, EnrichError> {
        let query = collapse_whitespace(name);
        if query.is_empty() {
            return Err(EnrichError::InvalidBatchEntry(name.to_string()));
        }

        let matched = self.authority.match_name(&query)?;
        let detail = self.authority.detail(matched.key)?;
        let steps = lineage(&detail)?;

        let mut parent: Option<TaxonId> = None;
        for step in &steps {
            parent = Some(self.store.ensure_taxon(&step.name, step.rank, parent)?);
        }
        let leaf = parent.ok_or_else(|| EnrichError::payload(SERVICE, "empty lineage"))?;
        let leaf_rank = steps.last().map(|step| step.rank).unwrap_or(Rank::Species);

        // The leaf exists from here on; the remaining writes are best-effort.
        if let Err(err) = self.store.set_gbif_id(leaf, detail.key) {
            tracing::warn!(taxon_id = %leaf, error = %err, "failed to attach GBIF key");
        }
        self.side_load_names(leaf, &detail.canonical_name);

        tracing::info!(
            query = %query,
            taxon_id = %leaf,
            rank = %leaf_rank,
            depth = steps.len(),
            "resolved taxon"
        );

        Ok(Resolution {
            taxon: TaxonRef {
                id: leaf,
                canonical_name: detail.canonical_name.clone(),
            },
            rank: leaf_rank,
            external_key: detail.key,
            lineage: steps,
        })
    }

    /// Looks up an already stored taxon without calling the authority.
    pub fn lookup(&self, entry: &BatchEntry) -> Result<TaxonRef, EnrichError> {
        let record = match entry {
            BatchEntry::Id(id) => self.store.taxon(*id)?,
            BatchEntry::Name(name) => self.store.find_taxon_by_name(name)?,
        };
        let record = record.ok_or_else(|| EnrichError::TaxonNotFound(entry.key()))?;
        Ok(TaxonRef {
            id: record.id,
            canonical_name: record.canonical_name,
        })
    }

    fn side_load_names(&self, taxon_id: TaxonId, canonical_name: &str) {
        let scientific = NewTaxonName {
            taxon_id,
            name: canonical_name.to_string(),
            lang: "la".to_string(),
            is_scientific: true,
            source: SERVICE.to_string(),
        };
        if let Err(err) = self.store.insert_taxon_name(&scientific) {
            tracing::warn!(taxon_id = %taxon_id, error = %err, "failed to store scientific name");
        }

        if !self.load_common_names {
            return;
        }
        let names = match self.authority.vernacular_names(canonical_name) {
            Ok(names) => names,
            Err(err) => {
                tracing::debug!(taxon_id = %taxon_id, error = %err, "common names unavailable");
                return;
            }
        };
        for vernacular in names.into_iter().take(MAX_COMMON_NAMES) {
            let lang = vernacular
                .language
                .as_deref()
                .unwrap_or("und")
                .chars()
                .take(5)
                .collect::<String>();
            let row = NewTaxonName {
                taxon_id,
                name: vernacular.name,
                lang,
                is_scientific: false,
                source: SERVICE.to_string(),
            };
            if let Err(err) = self.store.insert_taxon_name(&row) {
                tracing::debug!(taxon_id = %taxon_id, error = %err, "failed to store common name");
            }
        }
    }
}
