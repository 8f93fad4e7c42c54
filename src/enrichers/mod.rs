//! Source adapters that attach one kind of artifact to a resolved taxon.
//!
//! Each adapter implements [`Enricher`]; the pipeline drives a list of them
//! through [`run_enricher`], which is the only place an adapter error is
//! turned into an outcome. Adding a source never touches the orchestrator.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;

use crate::domain::{EnrichmentSource, TaxonRef};
use crate::error::EnrichError;

pub mod description;
pub mod imagery;
pub mod occurrence;
pub mod status;

pub use description::{DescriptionEnricher, EolClient, TextPage, TextReference};
pub use imagery::{
    CommonsClient, CommonsSearch, ImageCandidate, ImageryEnricher, LinkedDataImages,
    WikidataClient,
};
pub use occurrence::{InatClient, ObservationSource, OccurrenceEnricher, OccurrenceOptions};
pub use status::{Assessment, IucnClient, StatusClient, StatusEnricher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotConfigured,
    NoAssessment,
    NoSources,
    Exists,
    NoText,
    NoObservations,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::NotConfigured => "not_configured",
            SkipReason::NoAssessment => "no_assessment",
            SkipReason::NoSources => "no_sources",
            SkipReason::Exists => "exists",
            SkipReason::NoText => "no_text",
            SkipReason::NoObservations => "no_observations",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum EnrichmentOutcome {
    Added,
    Skipped(SkipReason),
    Failed(String),
}

impl EnrichmentOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, EnrichmentOutcome::Failed(_))
    }
}

impl fmt::Display for EnrichmentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichmentOutcome::Added => f.write_str("added"),
            EnrichmentOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            EnrichmentOutcome::Failed(cause) => write!(f, "failed ({cause})"),
        }
    }
}

pub trait Enricher: Send + Sync {
    fn source(&self) -> EnrichmentSource;

    /// Fetches, maps and persists one artifact. Only `Added` and `Skipped`
    /// are expected on success; failures are returned as errors.
    fn enrich(&self, taxon: &TaxonRef) -> Result<EnrichmentOutcome, EnrichError>;
}

/// Runs one adapter, logging and absorbing any failure, panics included.
pub fn run_enricher(enricher: &dyn Enricher, taxon: &TaxonRef) -> EnrichmentOutcome {
    let source = enricher.source();
    let result = match panic::catch_unwind(AssertUnwindSafe(|| enricher.enrich(taxon))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                taxon_id = %taxon.id,
                name = %taxon.canonical_name,
                %source,
                panic = %message,
                "enricher panicked"
            );
            return EnrichmentOutcome::Failed(format!("panicked: {message}"));
        }
    };
    match result {
        Ok(outcome) => {
            tracing::debug!(taxon_id = %taxon.id, %source, %outcome, "enrichment finished");
            outcome
        }
        Err(err) => {
            tracing::warn!(
                taxon_id = %taxon.id,
                name = %taxon.canonical_name,
                %source,
                error = %err,
                "enrichment failed"
            );
            EnrichmentOutcome::Failed(err.to_string())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
