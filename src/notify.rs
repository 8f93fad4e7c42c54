use serde_json::json;

use crate::domain::TaxonId;
use crate::fetch::Fetcher;

/// Tells a downstream cache that a taxon's public page changed.
/// Implementations must never fail the caller.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, taxon: TaxonId);
}

pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _taxon: TaxonId) {}
}

pub struct HttpRevalidator {
    fetcher: Fetcher,
    endpoint: String,
    token: String,
}

impl HttpRevalidator {
    pub fn new(fetcher: Fetcher, site_url: &str, token: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: format!("{}/api/revalidate", site_url.trim_end_matches('/')),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn page_path(taxon: TaxonId) -> String {
    format!("/taxon/{taxon}")
}

impl CacheInvalidator for HttpRevalidator {
    fn invalidate(&self, taxon: TaxonId) {
        let body = json!({ "path": page_path(taxon) });
        match self
            .fetcher
            .post_json(&self.endpoint, &body, Some(&self.token))
        {
            Ok(_) => tracing::debug!(taxon_id = %taxon, "page revalidated"),
            Err(err) => tracing::warn!(taxon_id = %taxon, error = %err, "revalidation failed"),
        }
    }
}
