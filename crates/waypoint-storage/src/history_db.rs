//! Primary history store.
//!
//! On top of the shared url/visit tables this store owns most-visited
//! segments with their per-day usage counters, keyword search terms and
//! downloads, plus the temporary-table dance used by the full wipe.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::{debug, info};
use url::Url;

use waypoint_core::error::WaypointError;
use waypoint_core::types::{
    DownloadRow, DownloadState, KeywordSearchTermRow, KeywordSearchTermVisit, PageUsageData,
    SegmentId, UrlId, UrlRow,
};

use crate::db::{
    from_micros, opt_to_micros, storage_err, time_from_micros, to_micros, Database,
};
use crate::migrations::{
    StoreSchema, KEYWORD_SEARCH_TERMS_TABLE, SEGMENT_TABLES, URLS_TABLE, VISITS_TABLE,
};
use crate::store::{StoreHandle, UrlStore, VisitStore};

const DAY_MICROS: i64 = 24 * 60 * 60 * 1_000_000;

/// Start of the UTC day containing `time`. Segment usage is bucketed by it.
pub fn day_slot(time: DateTime<Utc>) -> DateTime<Utc> {
    let micros = to_micros(time);
    time_from_micros(micros - micros.rem_euclid(DAY_MICROS))
}

/// Name of the segment a URL belongs to.
///
/// Two URLs share a segment when they differ only in a leading `www.`,
/// credentials, port, query or fragment.
pub fn compute_segment_name(url: &Url) -> String {
    let mut name = url.clone();
    name.set_query(None);
    name.set_fragment(None);
    if name.cannot_be_a_base() {
        return name.to_string();
    }
    let _ = name.set_username("");
    let _ = name.set_password(None);
    let _ = name.set_port(None);
    if let Some(host) = url.host_str() {
        if host.len() > 4 && host[..4].eq_ignore_ascii_case("www.") {
            let _ = name.set_host(Some(&host[4..]));
        }
    }
    name.to_string()
}

pub struct HistoryDatabase {
    db: Database,
}

impl HistoryDatabase {
    pub fn open(path: &Path) -> Result<Self, WaypointError> {
        Ok(Self {
            db: Database::new(path, StoreSchema::History)?,
        })
    }

    pub fn in_memory() -> Result<Self, WaypointError> {
        Ok(Self {
            db: Database::in_memory(StoreSchema::History)?,
        })
    }

    // =========================================================================
    // Segments
    // =========================================================================

    pub fn segment_id_for_name(&self, name: &str) -> Result<Option<SegmentId>, WaypointError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT id FROM segments WHERE name = ?1", [name], |row| {
                Ok(SegmentId(row.get(0)?))
            })
            .optional()
            .map_err(storage_err("Failed to look up segment"))
        })
    }

    pub fn create_segment(&self, url_id: UrlId, name: &str) -> Result<SegmentId, WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO segments (name, url_id) VALUES (?1, ?2)",
                rusqlite::params![name, url_id.0],
            )
            .map_err(storage_err("Failed to create segment"))?;
            Ok(SegmentId(conn.last_insert_rowid()))
        })
    }

    pub fn update_segment_representation_url(
        &self,
        segment_id: SegmentId,
        url_id: UrlId,
    ) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE segments SET url_id = ?1 WHERE id = ?2",
                rusqlite::params![url_id.0, segment_id.0],
            )
            .map_err(storage_err("Failed to update segment url"))?;
            Ok(())
        })
    }

    /// The representative URL of a segment and its presentation index.
    pub fn segment_representation(
        &self,
        segment_id: SegmentId,
    ) -> Result<Option<(UrlId, i32)>, WaypointError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT url_id, pres_index FROM segments WHERE id = ?1",
                [segment_id.0],
                |row| Ok((UrlId(row.get(0)?), row.get(1)?)),
            )
            .optional()
            .map_err(storage_err("Failed to read segment"))
        })
    }

    pub fn set_segment_presentation_index(
        &self,
        segment_id: SegmentId,
        index: i32,
    ) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE segments SET pres_index = ?1 WHERE id = ?2",
                rusqlite::params![index, segment_id.0],
            )
            .map_err(storage_err("Failed to set presentation index"))?;
            Ok(())
        })
    }

    /// Add `amount` visits to the counter of the day slot containing `time`.
    pub fn increase_segment_visit_count(
        &self,
        segment_id: SegmentId,
        time: DateTime<Utc>,
        amount: i64,
    ) -> Result<(), WaypointError> {
        let slot = to_micros(day_slot(time));
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO segment_usage (segment_id, time_slot, visit_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (segment_id, time_slot)
                 DO UPDATE SET visit_count = visit_count + excluded.visit_count",
                rusqlite::params![segment_id.0, slot, amount],
            )
            .map_err(storage_err("Failed to bump segment usage"))?;
            Ok(())
        })
    }

    /// Rank segments used since `from_time`.
    ///
    /// Each day contributes `(1 + ln(visits)) * (1 + 2 / (1 + days_ago / 7))`,
    /// so a visit counts three times as much today as it does weeks ago.
    pub fn query_segment_usage(
        &self,
        from_time: DateTime<Utc>,
        max_results: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<PageUsageData>, WaypointError> {
        let from_slot = to_micros(day_slot(from_time));
        let today = to_micros(day_slot(now));

        let usage: Vec<(i64, i64, i64)> = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT segment_id, time_slot, visit_count FROM segment_usage
                     WHERE time_slot >= ?1 ORDER BY segment_id",
                )
                .map_err(storage_err("Failed to prepare segment usage query"))?;
            let rows = stmt
                .query_map([from_slot], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(storage_err("Failed to query segment usage"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("Failed to read segment usage"))
        })?;

        let mut scores: BTreeMap<i64, f64> = BTreeMap::new();
        for (segment_id, slot, visit_count) in usage {
            if visit_count <= 0 {
                continue;
            }
            let days_ago = ((today - slot) / DAY_MICROS).max(0) as f64;
            let recency_boost = 1.0 + 2.0 / (1.0 + days_ago / 7.0);
            let day_score = 1.0 + (visit_count as f64).ln();
            *scores.entry(segment_id).or_insert(0.0) += recency_boost * day_score;
        }

        let mut ranked: Vec<(i64, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut results = Vec::new();
        for (segment_id, score) in ranked {
            if results.len() >= max_results {
                break;
            }
            let segment_id = SegmentId(segment_id);
            let Some((url_id, presentation_index)) = self.segment_representation(segment_id)?
            else {
                continue;
            };
            let Some(row) = self.get_url_row(url_id)? else {
                debug!(%segment_id, "Segment points at a missing url");
                continue;
            };
            results.push(PageUsageData {
                segment_id,
                url_id,
                url: row.url,
                title: row.title,
                score,
                presentation_index,
            });
        }
        Ok(results)
    }

    /// Delete usage counters for day slots older than `older_than`.
    pub fn delete_segment_data_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<usize, WaypointError> {
        let deleted = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM segment_usage WHERE time_slot < ?1",
                [to_micros(day_slot(older_than))],
            )
            .map_err(storage_err("Failed to delete old segment usage"))
        })?;
        info!(rows_deleted = deleted, "Old segment usage swept");
        Ok(deleted)
    }

    /// Remove the segment represented by `url_id` along with its counters.
    pub fn delete_segment_for_url(&self, url_id: UrlId) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM segment_usage
                 WHERE segment_id IN (SELECT id FROM segments WHERE url_id = ?1)",
                [url_id.0],
            )
            .map_err(storage_err("Failed to delete segment usage"))?;
            conn.execute("DELETE FROM segments WHERE url_id = ?1", [url_id.0])
                .map_err(storage_err("Failed to delete segment"))?;
            Ok(())
        })
    }

    // =========================================================================
    // Keyword search terms
    // =========================================================================

    pub fn set_keyword_search_terms_for_url(
        &self,
        url_id: UrlId,
        keyword_id: i64,
        term: &str,
    ) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO keyword_search_terms (keyword_id, url_id, lower_term, term)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![keyword_id, url_id.0, term.to_lowercase(), term],
            )
            .map_err(storage_err("Failed to set keyword search term"))?;
            Ok(())
        })
    }

    pub fn keyword_search_term_rows(
        &self,
        keyword_id: i64,
    ) -> Result<Vec<KeywordSearchTermRow>, WaypointError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT keyword_id, url_id, term FROM keyword_search_terms
                     WHERE keyword_id = ?1",
                )
                .map_err(storage_err("Failed to prepare keyword term query"))?;
            let rows = stmt
                .query_map([keyword_id], |row| {
                    Ok(KeywordSearchTermRow {
                        keyword_id: row.get(0)?,
                        url_id: UrlId(row.get(1)?),
                        term: row.get(2)?,
                    })
                })
                .map_err(storage_err("Failed to query keyword terms"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("Failed to read keyword term"))
        })
    }

    pub fn delete_all_search_terms_for_keyword(&self, keyword_id: i64) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM keyword_search_terms WHERE keyword_id = ?1",
                [keyword_id],
            )
            .map_err(storage_err("Failed to delete keyword terms"))?;
            Ok(())
        })
    }

    pub fn delete_keyword_search_terms_for_url(&self, url_id: UrlId) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM keyword_search_terms WHERE url_id = ?1",
                [url_id.0],
            )
            .map_err(storage_err("Failed to delete keyword terms for url"))?;
            Ok(())
        })
    }

    /// Most recently visited terms for `keyword_id` starting with `prefix`,
    /// compared case-insensitively. An empty prefix matches nothing.
    pub fn most_recent_keyword_search_terms(
        &self,
        keyword_id: i64,
        prefix: &str,
        max_count: usize,
    ) -> Result<Vec<KeywordSearchTermVisit>, WaypointError> {
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let lower_prefix = prefix.to_lowercase();
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT kv.term, u.last_visit_time
                     FROM keyword_search_terms kv JOIN urls u ON kv.url_id = u.id
                     WHERE kv.keyword_id = ?1
                       AND substr(kv.lower_term, 1, length(?2)) = ?2
                     ORDER BY u.last_visit_time DESC LIMIT ?3",
                )
                .map_err(storage_err("Failed to prepare keyword term lookup"))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![keyword_id, lower_prefix, max_count as i64],
                    |row| {
                        Ok(KeywordSearchTermVisit {
                            term: row.get(0)?,
                            time: from_micros(row.get(1)?),
                        })
                    },
                )
                .map_err(storage_err("Failed to query keyword terms"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("Failed to read keyword term"))
        })
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    pub fn create_download(&self, download: &DownloadRow) -> Result<i64, WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO downloads (url, full_path, start_time, end_time, received_bytes,
                                        total_bytes, state, opened)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    download.url,
                    download.path,
                    to_micros(download.start_time),
                    opt_to_micros(download.end_time),
                    download.received_bytes,
                    download.total_bytes,
                    download.state.as_i64(),
                    download.opened as i64,
                ],
            )
            .map_err(storage_err("Failed to create download"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn update_download(&self, download: &DownloadRow) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE downloads SET received_bytes = ?1, total_bytes = ?2, state = ?3,
                        end_time = ?4, opened = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    download.received_bytes,
                    download.total_bytes,
                    download.state.as_i64(),
                    opt_to_micros(download.end_time),
                    download.opened as i64,
                    download.db_handle,
                ],
            )
            .map_err(storage_err("Failed to update download"))?;
            Ok(())
        })
    }

    pub fn update_download_path(&self, db_handle: i64, path: &str) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE downloads SET full_path = ?1 WHERE id = ?2",
                rusqlite::params![path, db_handle],
            )
            .map_err(storage_err("Failed to update download path"))?;
            Ok(())
        })
    }

    pub fn query_downloads(&self) -> Result<Vec<DownloadRow>, WaypointError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, url, full_path, start_time, end_time, received_bytes,
                            total_bytes, state, opened
                     FROM downloads ORDER BY start_time",
                )
                .map_err(storage_err("Failed to prepare download query"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(DownloadRow {
                        db_handle: row.get(0)?,
                        url: row.get(1)?,
                        path: row.get(2)?,
                        start_time: time_from_micros(row.get(3)?),
                        end_time: from_micros(row.get(4)?),
                        received_bytes: row.get(5)?,
                        total_bytes: row.get(6)?,
                        state: DownloadState::from_i64(row.get(7)?),
                        opened: row.get::<_, i64>(8)? != 0,
                    })
                })
                .map_err(storage_err("Failed to query downloads"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("Failed to read download"))
        })
    }

    pub fn remove_download(&self, db_handle: i64) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM downloads WHERE id = ?1", [db_handle])
                .map_err(storage_err("Failed to remove download"))?;
            Ok(())
        })
    }

    /// Remove finished downloads started in `[begin, end)`.
    pub fn remove_downloads_between(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize, WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM downloads
                 WHERE start_time >= ?1 AND start_time < ?2 AND state != ?3",
                rusqlite::params![
                    opt_to_micros(begin),
                    end.map(to_micros).unwrap_or(i64::MAX),
                    DownloadState::InProgress.as_i64(),
                ],
            )
            .map_err(storage_err("Failed to remove downloads"))
        })
    }

    /// Downloads still marked in progress from a previous run are cancelled.
    pub fn clean_up_in_progress_entries(&self) -> Result<usize, WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE downloads SET state = ?1 WHERE state = ?2",
                rusqlite::params![
                    DownloadState::Cancelled.as_i64(),
                    DownloadState::InProgress.as_i64(),
                ],
            )
            .map_err(storage_err("Failed to clean up downloads"))
        })
    }

    pub fn next_download_id(&self) -> Result<i64, WaypointError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM downloads", [], |row| {
                row.get(0)
            })
            .map_err(storage_err("Failed to read next download id"))
        })
    }

    // =========================================================================
    // Full wipe support
    // =========================================================================

    /// Create an empty `temp_urls` table to collect the rows that survive a wipe.
    pub fn begin_temporary_url_table(&self) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                "DROP TABLE IF EXISTS temp_urls;
                 CREATE TABLE temp_urls (
                    id              INTEGER PRIMARY KEY,
                    url             TEXT NOT NULL,
                    title           TEXT NOT NULL DEFAULT '',
                    visit_count     INTEGER NOT NULL DEFAULT 0,
                    typed_count     INTEGER NOT NULL DEFAULT 0,
                    last_visit_time INTEGER NOT NULL DEFAULT 0,
                    hidden          INTEGER NOT NULL DEFAULT 0
                 );",
            )
            .map_err(storage_err("Failed to create temporary url table"))
        })
    }

    /// Copy `row` into `temp_urls`, keeping its id.
    pub fn add_temporary_url(&self, row: &UrlRow) -> Result<UrlId, WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO temp_urls (id, url, title, visit_count, typed_count,
                                        last_visit_time, hidden)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    row.id.0,
                    row.url.as_str(),
                    row.title,
                    row.visit_count,
                    row.typed_count,
                    opt_to_micros(row.last_visit),
                    row.hidden as i64,
                ],
            )
            .map_err(storage_err("Failed to add temporary url"))?;
            Ok(UrlId(conn.last_insert_rowid()))
        })
    }

    /// Replace `urls` with `temp_urls`.
    pub fn commit_temporary_url_table(&self) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE urls; ALTER TABLE temp_urls RENAME TO urls;")
                .map_err(storage_err("Failed to swap url table"))?;
            conn.execute_batch(URLS_TABLE)
                .map_err(storage_err("Failed to recreate url index"))
        })
    }

    /// Drop and recreate every table except `urls` and `downloads`.
    pub fn recreate_all_tables_but_url(&self) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                "DROP TABLE IF EXISTS visits;
                 DROP TABLE IF EXISTS segment_usage;
                 DROP TABLE IF EXISTS segments;
                 DROP TABLE IF EXISTS keyword_search_terms;",
            )
            .map_err(storage_err("Failed to drop history tables"))?;
            for sql in [VISITS_TABLE, SEGMENT_TABLES, KEYWORD_SEARCH_TERMS_TABLE] {
                conn.execute_batch(sql)
                    .map_err(storage_err("Failed to recreate history table"))?;
            }
            Ok(())
        })
    }
}

impl StoreHandle for HistoryDatabase {
    fn database(&self) -> &Database {
        &self.db
    }
}

impl UrlStore for HistoryDatabase {}
impl VisitStore for HistoryDatabase {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use waypoint_core::types::{PageTransition, VisitId, VisitRow, VisitSource};

    fn make_db() -> HistoryDatabase {
        HistoryDatabase::in_memory().unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_segment_name_normalization() {
        assert_eq!(
            compute_segment_name(&url("http://www.google.com/search?q=rust#top")),
            "http://google.com/search"
        );
        assert_eq!(
            compute_segment_name(&url("https://user:pw@WWW.Example.com:8443/a/b")),
            "https://example.com/a/b"
        );
        assert_eq!(
            compute_segment_name(&url("https://www2.example.com/")),
            "https://www2.example.com/"
        );
        assert_eq!(
            compute_segment_name(&url("about:blank?x")),
            "about:blank"
        );
    }

    #[test]
    fn test_day_slot_truncates_to_midnight() {
        let t = DateTime::parse_from_rfc3339("2026-03-04T17:45:12Z")
            .unwrap()
            .with_timezone(&Utc);
        let slot = day_slot(t);
        assert_eq!(slot.to_rfc3339(), "2026-03-04T00:00:00+00:00");
    }

    #[test]
    fn test_segment_usage_scoring_prefers_recent() {
        let db = make_db();
        let now = Utc::now();
        let recent_url = db.add_url(&UrlRow::new(url("https://recent.test/"))).unwrap();
        let old_url = db.add_url(&UrlRow::new(url("https://old.test/"))).unwrap();
        let recent = db.create_segment(recent_url, "https://recent.test/").unwrap();
        let old = db.create_segment(old_url, "https://old.test/").unwrap();

        db.increase_segment_visit_count(recent, now, 2).unwrap();
        db.increase_segment_visit_count(old, now - Duration::days(30), 2)
            .unwrap();

        let usage = db
            .query_segment_usage(now - Duration::days(60), 10, now)
            .unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].segment_id, recent);
        assert_eq!(usage[0].url, url("https://recent.test/"));
        assert_eq!(usage[0].presentation_index, -1);
        let expected = 3.0 * (1.0 + 2f64.ln());
        assert!((usage[0].score - expected).abs() < 1e-9);
        assert!(usage[0].score > usage[1].score);
    }

    #[test]
    fn test_segment_usage_accumulates_per_day() {
        let db = make_db();
        let now = Utc::now();
        let url_id = db.add_url(&UrlRow::new(url("https://a.test/"))).unwrap();
        let seg = db.create_segment(url_id, "https://a.test/").unwrap();
        db.increase_segment_visit_count(seg, now, 1).unwrap();
        db.increase_segment_visit_count(seg, now, 1).unwrap();

        let count: i64 = db
            .database()
            .with_conn(|conn| {
                conn.query_row("SELECT visit_count FROM segment_usage", [], |r| r.get(0))
                    .map_err(|e| WaypointError::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_delete_old_segment_data() {
        let db = make_db();
        let now = Utc::now();
        let url_id = db.add_url(&UrlRow::new(url("https://a.test/"))).unwrap();
        let seg = db.create_segment(url_id, "https://a.test/").unwrap();
        db.increase_segment_visit_count(seg, now - Duration::days(120), 5)
            .unwrap();
        db.increase_segment_visit_count(seg, now, 1).unwrap();

        let deleted = db
            .delete_segment_data_older_than(now - Duration::days(90))
            .unwrap();
        assert_eq!(deleted, 1);
        let usage = db
            .query_segment_usage(now - Duration::days(365), 10, now)
            .unwrap();
        assert_eq!(usage.len(), 1);
        assert!((usage[0].score - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_delete_segment_for_url() {
        let db = make_db();
        let url_id = db.add_url(&UrlRow::new(url("https://a.test/"))).unwrap();
        let seg = db.create_segment(url_id, "https://a.test/").unwrap();
        db.increase_segment_visit_count(seg, Utc::now(), 1).unwrap();
        db.delete_segment_for_url(url_id).unwrap();
        assert!(db.segment_id_for_name("https://a.test/").unwrap().is_none());
    }

    #[test]
    fn test_keyword_search_terms_prefix_and_order() {
        let db = make_db();
        let now = Utc::now();
        let mut older = UrlRow::new(url("https://search.test/?q=Rust+lang"));
        older.last_visit = Some(now - Duration::hours(2));
        let older_id = db.add_url(&older).unwrap();
        let mut newer = UrlRow::new(url("https://search.test/?q=rusqlite"));
        newer.last_visit = Some(now);
        let newer_id = db.add_url(&newer).unwrap();
        let other = db.add_url(&UrlRow::new(url("https://search.test/?q=go"))).unwrap();

        db.set_keyword_search_terms_for_url(older_id, 7, "Rust lang").unwrap();
        db.set_keyword_search_terms_for_url(newer_id, 7, "rusqlite").unwrap();
        db.set_keyword_search_terms_for_url(other, 7, "go").unwrap();

        let terms = db.most_recent_keyword_search_terms(7, "RU", 10).unwrap();
        let names: Vec<&str> = terms.iter().map(|t| t.term.as_str()).collect();
        assert_eq!(names, vec!["rusqlite", "Rust lang"]);
        assert!(db.most_recent_keyword_search_terms(7, "", 10).unwrap().is_empty());

        db.delete_all_search_terms_for_keyword(7).unwrap();
        assert!(db.keyword_search_term_rows(7).unwrap().is_empty());
    }

    #[test]
    fn test_downloads_lifecycle() {
        let db = make_db();
        let start = Utc::now();
        let mut row = DownloadRow {
            db_handle: 0,
            url: "https://files.test/a.zip".into(),
            path: "/tmp/a.zip".into(),
            start_time: start,
            end_time: None,
            received_bytes: 0,
            total_bytes: 100,
            state: DownloadState::InProgress,
            opened: false,
        };
        row.db_handle = db.create_download(&row).unwrap();
        assert_eq!(db.next_download_id().unwrap(), row.db_handle + 1);

        row.received_bytes = 100;
        row.state = DownloadState::Complete;
        row.end_time = Some(start + Duration::seconds(5));
        db.update_download(&row).unwrap();
        db.update_download_path(row.db_handle, "/tmp/b.zip").unwrap();

        let stored = db.query_downloads().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].path, "/tmp/b.zip");
        assert_eq!(stored[0].state, DownloadState::Complete);

        let removed = db.remove_downloads_between(None, None).unwrap();
        assert_eq!(removed, 1);
        assert!(db.query_downloads().unwrap().is_empty());
    }

    #[test]
    fn test_clean_up_in_progress_downloads() {
        let db = make_db();
        let row = DownloadRow {
            db_handle: 0,
            url: "https://files.test/big.iso".into(),
            path: "/tmp/big.iso".into(),
            start_time: Utc::now(),
            end_time: None,
            received_bytes: 10,
            total_bytes: 100,
            state: DownloadState::InProgress,
            opened: false,
        };
        db.create_download(&row).unwrap();
        assert_eq!(db.clean_up_in_progress_entries().unwrap(), 1);
        assert_eq!(db.query_downloads().unwrap()[0].state, DownloadState::Cancelled);
    }

    #[test]
    fn test_temporary_url_table_swap() {
        let db = make_db();
        let keep = db.add_url(&UrlRow::new(url("https://keep.test/"))).unwrap();
        db.add_url(&UrlRow::new(url("https://drop.test/"))).unwrap();

        db.begin_temporary_url_table().unwrap();
        let mut row = db.get_url_row(keep).unwrap().unwrap();
        row.visit_count = 0;
        db.add_temporary_url(&row).unwrap();
        db.commit_temporary_url_table().unwrap();

        let urls = db.all_urls().unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].id, keep);
        // Unique index is back in place.
        assert!(db.add_url(&UrlRow::new(url("https://keep.test/"))).is_err());
    }

    #[test]
    fn test_recreate_all_tables_but_url() {
        let db = make_db();
        let url_id = db.add_url(&UrlRow::new(url("https://a.test/"))).unwrap();
        db.add_visit(&VisitRow::new(
            url_id,
            Utc::now(),
            VisitId(0),
            PageTransition::LINK,
            VisitSource::Browsed,
        ))
        .unwrap();
        db.recreate_all_tables_but_url().unwrap();
        assert!(db.visits_for_url(url_id).unwrap().is_empty());
        assert_eq!(db.url_count().unwrap(), 1);
    }
}
