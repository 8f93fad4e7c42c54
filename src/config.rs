use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_FAILURE_DELAY;
use crate::checkpoint::DEFAULT_CHECKPOINT_PATH;
use crate::enrichers::OccurrenceOptions;
use crate::enrichers::description::EOL_BASE_URL;
use crate::enrichers::imagery::{COMMONS_API_URL, WIKIDATA_SPARQL_URL};
use crate::enrichers::occurrence::INAT_OBSERVATIONS_URL;
use crate::enrichers::status::IUCN_ENDPOINTS;
use crate::error::EnrichError;
use crate::fetch::{DEFAULT_TIMEOUT, RetryPolicy};
use crate::rate_limit;
use crate::taxonomy::GBIF_BASE_URL;

pub const DEFAULT_CONFIG_PATH: &str = "taxon-enrich.json";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub failure_delay_ms: Option<u64>,
    #[serde(default)]
    pub common_names: Option<bool>,
    #[serde(default)]
    pub site_url: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub occurrence: Option<OccurrenceConfig>,
    #[serde(default)]
    pub endpoints: Option<EndpointConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RateLimitConfig {
    pub per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OccurrenceConfig {
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub cell_size: Option<f64>,
    #[serde(default)]
    pub max_points: Option<usize>,
    #[serde(default)]
    pub page_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub gbif: Option<String>,
    #[serde(default)]
    pub iucn: Option<Vec<String>>,
    #[serde(default)]
    pub commons: Option<String>,
    #[serde(default)]
    pub wikidata: Option<String>,
    #[serde(default)]
    pub eol: Option<String>,
    #[serde(default)]
    pub inat: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub gbif: String,
    pub iucn: Vec<String>,
    pub commons: String,
    pub wikidata: String,
    pub eol: String,
    pub inat: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            gbif: GBIF_BASE_URL.to_string(),
            iucn: IUCN_ENDPOINTS.iter().map(|url| url.to_string()).collect(),
            commons: COMMONS_API_URL.to_string(),
            wikidata: WIKIDATA_SPARQL_URL.to_string(),
            eol: EOL_BASE_URL.to_string(),
            inat: INAT_OBSERVATIONS_URL.to_string(),
        }
    }
}

/// Secrets and deployment settings read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub iucn_token: Option<String>,
    pub admin_token: Option<String>,
    pub site_url: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            iucn_token: read("IUCN_TOKEN"),
            admin_token: read("ADMIN_TOKEN"),
            site_url: read("SITE_URL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub database: Utf8PathBuf,
    pub checkpoint: Utf8PathBuf,
    pub concurrency: usize,
    pub timeout: Duration,
    pub failure_delay: Duration,
    pub common_names: bool,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimitConfig>,
    pub occurrence: OccurrenceOptions,
    pub endpoints: Endpoints,
    pub iucn_token: Option<String>,
    /// Present only when both a site URL and an admin token are known.
    pub revalidate: Option<RevalidateTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevalidateTarget {
    pub site_url: String,
    pub token: String,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file and merges it with the environment. An explicit
    /// path must exist; the default file is optional.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, EnrichError> {
        let config_path = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| EnrichError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| EnrichError::ConfigParse(err.to_string()))?
        };
        Self::resolve_config(config, Secrets::from_env())
    }

    pub fn resolve_config(config: Config, secrets: Secrets) -> Result<ResolvedConfig, EnrichError> {
        let database = match config.database {
            Some(path) => Utf8PathBuf::from(path),
            None => default_database_path()?,
        };
        let concurrency = config.concurrency.unwrap_or(1);
        if concurrency == 0 {
            return Err(EnrichError::ConfigParse(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let retry = config.retry.unwrap_or_default();
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: retry.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            base_delay: retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
        };

        if let Some(limit) = &config.rate_limit {
            rate_limit::quota(limit.per_second, limit.burst)?;
        }

        let occurrence = config.occurrence.unwrap_or_default();
        let occurrence_defaults = OccurrenceOptions::default();
        let occurrence = OccurrenceOptions {
            pages: occurrence.pages.unwrap_or(occurrence_defaults.pages),
            cell_size: occurrence.cell_size.unwrap_or(occurrence_defaults.cell_size),
            max_points: occurrence.max_points.unwrap_or(occurrence_defaults.max_points),
            page_delay: occurrence
                .page_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(occurrence_defaults.page_delay),
        };

        let endpoint_overrides = config.endpoints.unwrap_or_default();
        let defaults = Endpoints::default();
        let endpoints = Endpoints {
            gbif: endpoint_overrides.gbif.unwrap_or(defaults.gbif),
            iucn: endpoint_overrides
                .iucn
                .filter(|urls| !urls.is_empty())
                .unwrap_or(defaults.iucn),
            commons: endpoint_overrides.commons.unwrap_or(defaults.commons),
            wikidata: endpoint_overrides.wikidata.unwrap_or(defaults.wikidata),
            eol: endpoint_overrides.eol.unwrap_or(defaults.eol),
            inat: endpoint_overrides.inat.unwrap_or(defaults.inat),
        };

        let site_url = secrets.site_url.or(config.site_url);
        let revalidate = match (site_url, secrets.admin_token) {
            (Some(site_url), Some(token)) => Some(RevalidateTarget { site_url, token }),
            _ => None,
        };

        Ok(ResolvedConfig {
            database,
            checkpoint: Utf8PathBuf::from(
                config
                    .checkpoint
                    .unwrap_or_else(|| DEFAULT_CHECKPOINT_PATH.to_string()),
            ),
            concurrency,
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
            failure_delay: config
                .failure_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FAILURE_DELAY),
            common_names: config.common_names.unwrap_or(true),
            retry,
            rate_limit: config.rate_limit,
            occurrence,
            endpoints,
            iucn_token: secrets.iucn_token,
            revalidate,
        })
    }
}

pub fn default_database_path() -> Result<Utf8PathBuf, EnrichError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("taxon-enricher").join("taxa.sqlite3"))
                .ok()
        })
        .ok_or_else(|| EnrichError::Filesystem("unable to resolve data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config {
            database: Some("taxa.sqlite3".to_string()),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config, Secrets::default()).unwrap();
        assert_eq!(resolved.concurrency, 1);
        assert_eq!(resolved.checkpoint, Utf8PathBuf::from(".import_checkpoint.json"));
        assert_eq!(resolved.retry, RetryPolicy::default());
        assert_eq!(resolved.endpoints.iucn.len(), 2);
        assert!(resolved.revalidate.is_none());
    }
}
