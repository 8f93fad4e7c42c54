use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;

use crate::binning::FeatureCollection;
use crate::domain::{EnrichmentSource, IucnCategory, PopulationTrend, Rank, TaxonId};
use crate::enrichers::occurrence::OCCURRENCE_SOURCE;
use crate::error::EnrichError;
use crate::schema::SCHEMA;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxonRecord {
    pub id: TaxonId,
    pub canonical_name: String,
    pub rank: Rank,
    pub parent_id: Option<TaxonId>,
    pub external_gbif_id: Option<i64>,
    pub external_eol_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaxonName {
    pub taxon_id: TaxonId,
    pub name: String,
    pub lang: String,
    pub is_scientific: bool,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub category: Option<IucnCategory>,
    pub trend: Option<PopulationTrend>,
    pub assessed_at: Option<NaiveDate>,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMedia {
    pub url: String,
    pub thumb_url: Option<String>,
    pub title: String,
    pub author: String,
    pub license: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewDescription {
    pub source: String,
    pub lang: String,
    pub title: String,
    pub content: String,
    pub url: String,
}

/// Selection of stored taxa for a backfill run, in id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonQuery {
    pub rank: Option<Rank>,
    /// Only taxa that have nothing from this source yet.
    pub missing: Option<EnrichmentSource>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Persistence for the entities the pipeline writes. Every write is either
/// idempotent or an upsert, so an interrupted item can simply be re-run.
pub trait TaxonStore: Send + Sync {
    /// Returns the id of the `(name, rank)` node, creating it under `parent`
    /// if it does not exist yet. An existing node is returned unchanged.
    fn ensure_taxon(
        &self,
        name: &str,
        rank: Rank,
        parent: Option<TaxonId>,
    ) -> Result<TaxonId, EnrichError>;
    fn set_gbif_id(&self, id: TaxonId, key: i64) -> Result<(), EnrichError>;
    fn set_eol_id(&self, id: TaxonId, eol_id: i64) -> Result<(), EnrichError>;
    fn taxon(&self, id: TaxonId) -> Result<Option<TaxonRecord>, EnrichError>;
    fn find_taxon_by_name(&self, name: &str) -> Result<Option<TaxonRecord>, EnrichError>;
    fn taxon_count(&self) -> Result<usize, EnrichError>;
    fn list_taxa(&self, query: &TaxonQuery) -> Result<Vec<TaxonId>, EnrichError>;

    /// Returns false when the identical name row already existed.
    fn insert_taxon_name(&self, name: &NewTaxonName) -> Result<bool, EnrichError>;
    fn taxon_names(&self, id: TaxonId) -> Result<Vec<String>, EnrichError>;

    fn upsert_status(&self, id: TaxonId, status: &StatusRecord) -> Result<(), EnrichError>;
    fn status(&self, id: TaxonId) -> Result<Option<StatusRecord>, EnrichError>;

    fn media_exists(&self, id: TaxonId, url: &str) -> Result<bool, EnrichError>;
    /// Inserts with approval unset; returns false when the URL was already
    /// attached to the taxon.
    fn insert_media(&self, id: TaxonId, media: &NewMedia) -> Result<bool, EnrichError>;
    fn media_count(&self, id: TaxonId) -> Result<usize, EnrichError>;

    /// Returns false when the taxon already has a description from this source.
    fn insert_description(
        &self,
        id: TaxonId,
        description: &NewDescription,
    ) -> Result<bool, EnrichError>;
    fn description_count(&self, id: TaxonId) -> Result<usize, EnrichError>;

    fn upsert_occurrence(
        &self,
        id: TaxonId,
        source: &str,
        surface: &FeatureCollection,
    ) -> Result<(), EnrichError>;
    fn occurrence(
        &self,
        id: TaxonId,
        source: &str,
    ) -> Result<Option<FeatureCollection>, EnrichError>;
}

pub type SharedStore = Arc<dyn TaxonStore>;

/// SQLite implementation of [`TaxonStore`]. Cloning shares the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EnrichError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| EnrichError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, EnrichError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, EnrichError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, EnrichError>,
    ) -> Result<T, EnrichError> {
        let mut conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut conn)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn read_taxon(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, Option<i64>, Option<i64>, Option<i64>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(
    raw: (i64, String, String, Option<i64>, Option<i64>, Option<i64>),
) -> Result<TaxonRecord, EnrichError> {
    let (id, canonical_name, rank, parent_id, external_gbif_id, external_eol_id) = raw;
    Ok(TaxonRecord {
        id: TaxonId::new(id),
        canonical_name,
        rank: rank.parse()?,
        parent_id: parent_id.map(TaxonId::new),
        external_gbif_id,
        external_eol_id,
    })
}

const TAXON_COLUMNS: &str =
    "id, canonical_name, rank, parent_id, external_gbif_id, external_eol_id";

impl TaxonStore for SqliteStore {
    fn ensure_taxon(
        &self,
        name: &str,
        rank: Rank,
        parent: Option<TaxonId>,
    ) -> Result<TaxonId, EnrichError> {
        self.with_conn(|conn| {
            // Take the write lock up front so a concurrent writer on another
            // connection waits on the busy timeout instead of failing the upgrade.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(parent_id) = parent {
                let parent_row: Option<(String, String)> = tx
                    .query_row(
                        "SELECT canonical_name, rank FROM taxon WHERE id = ?1",
                        params![parent_id.get()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let (parent_name, parent_rank) = parent_row
                    .ok_or_else(|| EnrichError::TaxonNotFound(format!("id:{parent_id}")))?;
                let parent_rank: Rank = parent_rank.parse()?;
                if !rank.is_more_specific_than(parent_rank) {
                    return Err(EnrichError::InvalidLineage {
                        child: name.to_string(),
                        child_rank: rank,
                        parent: parent_name,
                        parent_rank,
                    });
                }
            }

            tx.execute(
                "INSERT INTO taxon (canonical_name, rank, parent_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (canonical_name, rank) DO NOTHING",
                params![name, rank.as_str(), parent.map(|p| p.get()), now()],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM taxon WHERE canonical_name = ?1 AND rank = ?2",
                params![name, rank.as_str()],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(TaxonId::new(id))
        })
    }

    fn set_gbif_id(&self, id: TaxonId, key: i64) -> Result<(), EnrichError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE taxon SET external_gbif_id = ?2 WHERE id = ?1",
                params![id.get(), key],
            )?;
            Ok(())
        })
    }

    fn set_eol_id(&self, id: TaxonId, eol_id: i64) -> Result<(), EnrichError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE taxon SET external_eol_id = ?2 WHERE id = ?1",
                params![id.get(), eol_id],
            )?;
            Ok(())
        })
    }

    fn taxon(&self, id: TaxonId) -> Result<Option<TaxonRecord>, EnrichError> {
        let raw = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {TAXON_COLUMNS} FROM taxon WHERE id = ?1"),
                    params![id.get()],
                    read_taxon,
                )
                .optional()?)
        })?;
        raw.map(into_record).transpose()
    }

    fn find_taxon_by_name(&self, name: &str) -> Result<Option<TaxonRecord>, EnrichError> {
        // A name can exist at several ranks; the most specific one wins.
        let raw = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TAXON_COLUMNS} FROM taxon WHERE canonical_name = ?1"
            ))?;
            let rows = stmt
                .query_map(params![name], read_taxon)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        let mut records = raw
            .into_iter()
            .map(into_record)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|record| record.rank);
        Ok(records.pop())
    }

    fn taxon_count(&self) -> Result<usize, EnrichError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM taxon", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    fn list_taxa(&self, query: &TaxonQuery) -> Result<Vec<TaxonId>, EnrichError> {
        let missing = match query.missing {
            None => String::new(),
            Some(EnrichmentSource::Status) => {
                " AND NOT EXISTS (SELECT 1 FROM taxon_status s WHERE s.taxon_id = taxon.id)"
                    .to_string()
            }
            Some(EnrichmentSource::Media) => {
                " AND NOT EXISTS (SELECT 1 FROM media m WHERE m.taxon_id = taxon.id)".to_string()
            }
            Some(EnrichmentSource::Description) => {
                " AND NOT EXISTS (SELECT 1 FROM taxon_description d WHERE d.taxon_id = taxon.id)"
                    .to_string()
            }
            Some(EnrichmentSource::Occurrence) => format!(
                " AND NOT EXISTS (SELECT 1 FROM distribution g \
                 WHERE g.taxon_id = taxon.id AND g.source = '{OCCURRENCE_SOURCE}')"
            ),
        };
        let sql = format!(
            "SELECT id FROM taxon WHERE (?1 IS NULL OR rank = ?1){missing} \
             ORDER BY id LIMIT ?2 OFFSET ?3"
        );
        let limit = query.limit.map(|limit| limit as i64).unwrap_or(-1);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(
                    params![query.rank.map(|rank| rank.as_str()), limit, query.offset as i64],
                    |row| row.get::<_, i64>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids.into_iter().map(TaxonId::new).collect())
        })
    }

    fn insert_taxon_name(&self, name: &NewTaxonName) -> Result<bool, EnrichError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO taxon_name (taxon_id, name, lang, is_scientific, source)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (taxon_id, name, lang, is_scientific) DO NOTHING",
                params![
                    name.taxon_id.get(),
                    name.name,
                    name.lang,
                    name.is_scientific,
                    name.source
                ],
            )?;
            Ok(changed > 0)
        })
    }

    fn taxon_names(&self, id: TaxonId) -> Result<Vec<String>, EnrichError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM taxon_name WHERE taxon_id = ?1 ORDER BY id")?;
            let names = stmt
                .query_map(params![id.get()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }

    fn upsert_status(&self, id: TaxonId, status: &StatusRecord) -> Result<(), EnrichError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO taxon_status
                   (taxon_id, iucn_category, population_trend, assessed_at, source_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (taxon_id) DO UPDATE SET
                   iucn_category    = excluded.iucn_category,
                   population_trend = excluded.population_trend,
                   assessed_at      = excluded.assessed_at,
                   source_url       = excluded.source_url,
                   updated_at       = excluded.updated_at",
                params![
                    id.get(),
                    status.category.map(|c| c.code()),
                    status.trend.map(|t| t.as_str()),
                    status.assessed_at.map(|d| d.format("%Y-%m-%d").to_string()),
                    status.source_url,
                    now()
                ],
            )?;
            Ok(())
        })
    }

    fn status(&self, id: TaxonId) -> Result<Option<StatusRecord>, EnrichError> {
        let raw: Option<(Option<String>, Option<String>, Option<String>, String)> =
            self.with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT iucn_category, population_trend, assessed_at, source_url
                         FROM taxon_status WHERE taxon_id = ?1",
                        params![id.get()],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?)
            })?;
        Ok(raw.map(|(category, trend, assessed_at, source_url)| StatusRecord {
            category: category.as_deref().and_then(IucnCategory::parse),
            trend: trend.as_deref().map(PopulationTrend::parse),
            assessed_at: assessed_at
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            source_url,
        }))
    }

    fn media_exists(&self, id: TaxonId, url: &str) -> Result<bool, EnrichError> {
        self.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM media WHERE taxon_id = ?1 AND url = ?2 LIMIT 1",
                    params![id.get(), url],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            Ok(exists)
        })
    }

    fn insert_media(&self, id: TaxonId, media: &NewMedia) -> Result<bool, EnrichError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO media
                   (taxon_id, kind, url, thumb_url, title, author, license, source, approved, created_at)
                 VALUES (?1, 'image', ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8)
                 ON CONFLICT (taxon_id, url) DO NOTHING",
                params![
                    id.get(),
                    media.url,
                    media.thumb_url,
                    media.title,
                    media.author,
                    media.license,
                    media.source,
                    now()
                ],
            )?;
            Ok(changed > 0)
        })
    }

    fn media_count(&self, id: TaxonId) -> Result<usize, EnrichError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM media WHERE taxon_id = ?1",
                params![id.get()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    fn insert_description(
        &self,
        id: TaxonId,
        description: &NewDescription,
    ) -> Result<bool, EnrichError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO taxon_description
                   (taxon_id, source, lang, title, content, url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (taxon_id, source) DO NOTHING",
                params![
                    id.get(),
                    description.source,
                    description.lang,
                    description.title,
                    description.content,
                    description.url,
                    now()
                ],
            )?;
            Ok(changed > 0)
        })
    }

    fn description_count(&self, id: TaxonId) -> Result<usize, EnrichError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM taxon_description WHERE taxon_id = ?1",
                params![id.get()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    fn upsert_occurrence(
        &self,
        id: TaxonId,
        source: &str,
        surface: &FeatureCollection,
    ) -> Result<(), EnrichError> {
        let geojson = serde_json::to_string(surface)
            .map_err(|err| EnrichError::payload("distribution", err.to_string()))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO distribution (taxon_id, source, geojson, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (taxon_id, source) DO UPDATE SET
                   geojson    = excluded.geojson,
                   updated_at = excluded.updated_at",
                params![id.get(), source, geojson, now()],
            )?;
            Ok(())
        })
    }

    fn occurrence(
        &self,
        id: TaxonId,
        source: &str,
    ) -> Result<Option<FeatureCollection>, EnrichError> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT geojson FROM distribution WHERE taxon_id = ?1 AND source = ?2",
                    params![id.get(), source],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|err| EnrichError::payload("distribution", err.to_string()))
        })
        .transpose()
    }
}
