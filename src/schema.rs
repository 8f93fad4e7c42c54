//! SQL schema for the taxon store.
//!
//! Every identity in the data model is a `UNIQUE` or `PRIMARY KEY`
//! constraint here; the store's writes rely on `ON CONFLICT` against them.

pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS taxon (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    canonical_name   TEXT NOT NULL,
    rank             TEXT NOT NULL,
    parent_id        INTEGER REFERENCES taxon(id),
    external_gbif_id INTEGER,
    external_eol_id  INTEGER,
    created_at       TEXT NOT NULL,
    UNIQUE (canonical_name, rank)
);

CREATE TABLE IF NOT EXISTS taxon_name (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    taxon_id      INTEGER NOT NULL REFERENCES taxon(id),
    name          TEXT NOT NULL,
    lang          TEXT NOT NULL,
    is_scientific INTEGER NOT NULL,
    source        TEXT,
    UNIQUE (taxon_id, name, lang, is_scientific)
);

-- One row per taxon; enrichment overwrites it.
CREATE TABLE IF NOT EXISTS taxon_status (
    taxon_id         INTEGER PRIMARY KEY REFERENCES taxon(id),
    iucn_category    TEXT,
    population_trend TEXT,
    assessed_at      TEXT,
    source_url       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

-- approved is NULL until a human reviews the asset.
CREATE TABLE IF NOT EXISTS media (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    taxon_id   INTEGER NOT NULL REFERENCES taxon(id),
    kind       TEXT NOT NULL DEFAULT 'image',
    url        TEXT NOT NULL,
    thumb_url  TEXT,
    title      TEXT,
    author     TEXT,
    license    TEXT,
    source     TEXT NOT NULL,
    approved   INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE (taxon_id, url)
);

CREATE TABLE IF NOT EXISTS taxon_description (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    taxon_id   INTEGER NOT NULL REFERENCES taxon(id),
    source     TEXT NOT NULL,
    lang       TEXT NOT NULL,
    title      TEXT,
    content    TEXT NOT NULL,
    url        TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (taxon_id, source)
);

-- Derived aggregate; replaced wholesale on every run.
CREATE TABLE IF NOT EXISTS distribution (
    taxon_id   INTEGER NOT NULL REFERENCES taxon(id),
    source     TEXT NOT NULL,
    geojson    TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (taxon_id, source)
);

CREATE INDEX IF NOT EXISTS taxon_parent_idx ON taxon(parent_id);
CREATE INDEX IF NOT EXISTS media_taxon_idx  ON media(taxon_id);

PRAGMA user_version = 1;
";
