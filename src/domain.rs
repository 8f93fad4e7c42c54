use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::EnrichError;

/// Classification level, ordered from most general to most specific.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Kingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
    Subspecies,
}

impl Rank {
    pub const ALL: [Rank; 8] = [
        Rank::Kingdom,
        Rank::Phylum,
        Rank::Class,
        Rank::Order,
        Rank::Family,
        Rank::Genus,
        Rank::Species,
        Rank::Subspecies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Kingdom => "kingdom",
            Rank::Phylum => "phylum",
            Rank::Class => "class",
            Rank::Order => "order",
            Rank::Family => "family",
            Rank::Genus => "genus",
            Rank::Species => "species",
            Rank::Subspecies => "subspecies",
        }
    }

    pub fn is_more_specific_than(&self, other: Rank) -> bool {
        *self > other
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rank {
    type Err = EnrichError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Rank::ALL
            .into_iter()
            .find(|rank| rank.as_str() == normalized)
            .ok_or_else(|| EnrichError::InvalidRank(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxonId(i64);

impl TaxonId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaxonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaxonId {
    type Err = EnrichError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = value
            .trim()
            .parse::<i64>()
            .map_err(|_| EnrichError::InvalidTaxonId(value.to_string()))?;
        if parsed <= 0 {
            return Err(EnrichError::InvalidTaxonId(value.to_string()));
        }
        Ok(Self(parsed))
    }
}

/// A resolved taxon handed to the enrichers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxonRef {
    pub id: TaxonId,
    pub canonical_name: String,
}

/// One line of a batch input file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BatchEntry {
    Name(String),
    Id(TaxonId),
}

impl BatchEntry {
    /// Key under which the entry is recorded in the checkpoint.
    pub fn key(&self) -> String {
        match self {
            BatchEntry::Name(name) => name.clone(),
            BatchEntry::Id(id) => format!("id:{id}"),
        }
    }
}

impl fmt::Display for BatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for BatchEntry {
    type Err = EnrichError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = collapse_whitespace(value);
        if normalized.is_empty() {
            return Err(EnrichError::InvalidBatchEntry(value.to_string()));
        }
        if let Some(rest) = normalized.strip_prefix("id:") {
            return Ok(BatchEntry::Id(rest.parse()?));
        }
        Ok(BatchEntry::Name(normalized))
    }
}

pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// IUCN Red List category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IucnCategory {
    #[serde(rename = "EX")]
    Extinct,
    #[serde(rename = "EW")]
    ExtinctInTheWild,
    #[serde(rename = "CR")]
    CriticallyEndangered,
    #[serde(rename = "EN")]
    Endangered,
    #[serde(rename = "VU")]
    Vulnerable,
    #[serde(rename = "NT")]
    NearThreatened,
    #[serde(rename = "LC")]
    LeastConcern,
    #[serde(rename = "DD")]
    DataDeficient,
    #[serde(rename = "NE")]
    NotEvaluated,
}

impl IucnCategory {
    pub fn code(&self) -> &'static str {
        match self {
            IucnCategory::Extinct => "EX",
            IucnCategory::ExtinctInTheWild => "EW",
            IucnCategory::CriticallyEndangered => "CR",
            IucnCategory::Endangered => "EN",
            IucnCategory::Vulnerable => "VU",
            IucnCategory::NearThreatened => "NT",
            IucnCategory::LeastConcern => "LC",
            IucnCategory::DataDeficient => "DD",
            IucnCategory::NotEvaluated => "NE",
        }
    }

    /// Accepts both the two-letter codes and the spelled-out names; the
    /// 1994 "lower risk" subcategories fold into their modern equivalents.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        let category = match normalized.as_str() {
            "ex" | "extinct" => IucnCategory::Extinct,
            "ew" | "extinct in the wild" => IucnCategory::ExtinctInTheWild,
            "cr" | "critically endangered" => IucnCategory::CriticallyEndangered,
            "en" | "endangered" => IucnCategory::Endangered,
            "vu" | "vulnerable" => IucnCategory::Vulnerable,
            "nt" | "near threatened" | "lr/nt" | "lr/cd" => IucnCategory::NearThreatened,
            "lc" | "least concern" | "lr/lc" => IucnCategory::LeastConcern,
            "dd" | "data deficient" => IucnCategory::DataDeficient,
            "ne" | "not evaluated" => IucnCategory::NotEvaluated,
            _ => return None,
        };
        Some(category)
    }
}

impl fmt::Display for IucnCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopulationTrend {
    Increasing,
    Stable,
    Decreasing,
    Unknown,
}

impl PopulationTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            PopulationTrend::Increasing => "increasing",
            PopulationTrend::Stable => "stable",
            PopulationTrend::Decreasing => "decreasing",
            PopulationTrend::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "increasing" => PopulationTrend::Increasing,
            "stable" => PopulationTrend::Stable,
            "decreasing" => PopulationTrend::Decreasing,
            _ => PopulationTrend::Unknown,
        }
    }
}

impl fmt::Display for PopulationTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The independent data sources a resolved taxon is enriched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentSource {
    Status,
    Media,
    Description,
    Occurrence,
}

impl EnrichmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentSource::Status => "status",
            EnrichmentSource::Media => "media",
            EnrichmentSource::Description => "description",
            EnrichmentSource::Occurrence => "occurrence",
        }
    }
}

impl fmt::Display for EnrichmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
