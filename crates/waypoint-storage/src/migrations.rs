//! Database schema migrations.
//!
//! Each of the profile's stores has its own schema and its own
//! `schema_migrations` table. Table definitions are kept as constants so the
//! full-wipe path can drop and recreate them.

use rusqlite::Connection;
use tracing::info;

use waypoint_core::error::WaypointError;

/// Which store a database file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreSchema {
    /// Primary store: urls, visits, segments, keyword terms, downloads.
    History,
    /// Visits past the archive threshold.
    Archived,
    /// Favicons, icon mappings and legacy thumbnails.
    Thumbnail,
    /// Full-text index partitions (created on demand).
    TextIndex,
}

impl StoreSchema {
    pub fn name(self) -> &'static str {
        match self {
            StoreSchema::History => "history",
            StoreSchema::Archived => "archived",
            StoreSchema::Thumbnail => "favicons",
            StoreSchema::TextIndex => "text_index",
        }
    }

    /// File name inside the profile directory.
    pub fn file_name(self) -> &'static str {
        match self {
            StoreSchema::History => "History",
            StoreSchema::Archived => "Archived History",
            StoreSchema::Thumbnail => "Favicons",
            StoreSchema::TextIndex => "History Index",
        }
    }
}

pub(crate) const URLS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS urls (
        id              INTEGER PRIMARY KEY,
        url             TEXT NOT NULL,
        title           TEXT NOT NULL DEFAULT '',
        visit_count     INTEGER NOT NULL DEFAULT 0,
        typed_count     INTEGER NOT NULL DEFAULT 0,
        last_visit_time INTEGER NOT NULL DEFAULT 0,
        hidden          INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS urls_url_index ON urls (url);";

pub(crate) const VISITS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS visits (
        id              INTEGER PRIMARY KEY,
        url_id          INTEGER NOT NULL,
        visit_time      INTEGER NOT NULL,
        from_visit      INTEGER NOT NULL DEFAULT 0,
        transition      INTEGER NOT NULL DEFAULT 0,
        segment_id      INTEGER NOT NULL DEFAULT 0,
        is_indexed      INTEGER NOT NULL DEFAULT 0,
        source          INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS visits_url_index ON visits (url_id);
    CREATE INDEX IF NOT EXISTS visits_from_index ON visits (from_visit);
    CREATE INDEX IF NOT EXISTS visits_time_index ON visits (visit_time);";

pub(crate) const SEGMENT_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS segments (
        id              INTEGER PRIMARY KEY,
        name            TEXT NOT NULL,
        url_id          INTEGER NOT NULL DEFAULT 0,
        pres_index      INTEGER NOT NULL DEFAULT -1
    );
    CREATE UNIQUE INDEX IF NOT EXISTS segments_name ON segments (name);
    CREATE INDEX IF NOT EXISTS segments_url_id ON segments (url_id);

    CREATE TABLE IF NOT EXISTS segment_usage (
        id              INTEGER PRIMARY KEY,
        segment_id      INTEGER NOT NULL,
        time_slot       INTEGER NOT NULL,
        visit_count     INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS segment_usage_slot
        ON segment_usage (segment_id, time_slot);
    CREATE INDEX IF NOT EXISTS segment_usage_time ON segment_usage (time_slot);";

pub(crate) const KEYWORD_SEARCH_TERMS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS keyword_search_terms (
        keyword_id      INTEGER NOT NULL,
        url_id          INTEGER NOT NULL,
        lower_term      TEXT NOT NULL,
        term            TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS keyword_search_terms_index1
        ON keyword_search_terms (keyword_id, lower_term);
    CREATE INDEX IF NOT EXISTS keyword_search_terms_index2
        ON keyword_search_terms (url_id);";

pub(crate) const DOWNLOADS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS downloads (
        id              INTEGER PRIMARY KEY,
        url             TEXT NOT NULL,
        full_path       TEXT NOT NULL,
        start_time      INTEGER NOT NULL,
        end_time        INTEGER NOT NULL DEFAULT 0,
        received_bytes  INTEGER NOT NULL DEFAULT 0,
        total_bytes     INTEGER NOT NULL DEFAULT 0,
        state           INTEGER NOT NULL DEFAULT 0,
        opened          INTEGER NOT NULL DEFAULT 0
    );";

pub(crate) const FAVICON_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS favicons (
        id              INTEGER PRIMARY KEY,
        url             TEXT NOT NULL,
        icon_type       INTEGER NOT NULL DEFAULT 1,
        last_updated    INTEGER NOT NULL DEFAULT 0,
        image_data      BLOB
    );
    CREATE INDEX IF NOT EXISTS favicons_url ON favicons (url);

    CREATE TABLE IF NOT EXISTS icon_mapping (
        id              INTEGER PRIMARY KEY,
        page_url        TEXT NOT NULL,
        icon_id         INTEGER NOT NULL,
        icon_type       INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS icon_mapping_page_url_idx ON icon_mapping (page_url);
    CREATE INDEX IF NOT EXISTS icon_mapping_icon_id_idx ON icon_mapping (icon_id);";

pub(crate) const THUMBNAILS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS thumbnails (
        page_url        TEXT PRIMARY KEY NOT NULL,
        last_updated    INTEGER NOT NULL DEFAULT 0,
        data            BLOB NOT NULL
    );";

/// Run all pending migrations for `schema`.
pub fn run_migrations(conn: &Connection, schema: StoreSchema) -> Result<(), WaypointError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| WaypointError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| WaypointError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn, schema)?;
        info!(store = schema.name(), "Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection, schema: StoreSchema) -> Result<(), WaypointError> {
    let tables: Vec<&str> = match schema {
        StoreSchema::History => vec![
            URLS_TABLE,
            VISITS_TABLE,
            SEGMENT_TABLES,
            KEYWORD_SEARCH_TERMS_TABLE,
            DOWNLOADS_TABLE,
        ],
        StoreSchema::Archived => vec![URLS_TABLE, VISITS_TABLE],
        StoreSchema::Thumbnail => vec![FAVICON_TABLES, THUMBNAILS_TABLE],
        StoreSchema::TextIndex => Vec::new(),
    };

    for sql in tables {
        conn.execute_batch(sql)
            .map_err(|e| WaypointError::Storage(format!("Migration v1 failed: {}", e)))?;
    }

    conn.execute(
        "INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema')",
        [],
    )
    .map_err(|e| WaypointError::Storage(format!("Failed to record migration v1: {}", e)))?;

    Ok(())
}
