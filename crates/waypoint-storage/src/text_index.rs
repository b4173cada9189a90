//! Full-text index over page titles and contents using SQLite FTS5.
//!
//! Pages are partitioned into one FTS5 table per month of visit time
//! (`pages_YYYYMM`) so a range delete or a wipe only touches the tables it
//! needs. A page is buffered when its visit is recorded and written once its
//! title and contents have both arrived, or at the next commit otherwise.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, info};
use url::Url;

use waypoint_core::error::WaypointError;
use waypoint_core::types::{QueryOptions, UrlId, VisitId};

use crate::db::{opt_to_micros, storage_err, time_from_micros, to_micros, url_column, Database};
use crate::migrations::StoreSchema;

/// A page matching a text query.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    pub url: Url,
    pub title: String,
    /// Visit time the page was indexed under.
    pub time: DateTime<Utc>,
    pub snippet: String,
    /// Byte ranges of query terms inside `title`.
    pub title_match_positions: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextMatches {
    /// Newest first, one per URL.
    pub matches: Vec<TextMatch>,
    /// Earliest time covered by the search. `None` when the whole index was
    /// searched.
    pub first_time_searched: Option<DateTime<Utc>>,
}

/// The full-text index as seen by the history engine.
pub trait TextIndex: Send {
    /// Start tracking a freshly visited page.
    fn add_page_url(&mut self, url: &Url, url_id: UrlId, visit_id: VisitId, time: DateTime<Utc>);

    fn add_page_title(&mut self, url: &Url, title: &str) -> Result<(), WaypointError>;

    fn add_page_contents(&mut self, url: &Url, body: &str) -> Result<(), WaypointError>;

    /// Index a page immediately, bypassing the pending buffer.
    fn add_page_data(
        &mut self,
        url: &Url,
        url_id: UrlId,
        visit_id: VisitId,
        time: DateTime<Utc>,
        title: &str,
        body: &str,
    ) -> Result<(), WaypointError>;

    fn get_text_matches(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<TextMatches, WaypointError>;

    fn delete_url(&mut self, url: &Url) -> Result<(), WaypointError>;

    fn delete_range(
        &mut self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(), WaypointError>;

    fn delete_all(&mut self) -> Result<(), WaypointError>;

    fn begin_transaction(&mut self) -> Result<(), WaypointError>;

    fn commit_transaction(&mut self) -> Result<(), WaypointError>;
}

/// Quote every whitespace separated term so user input can never be read as
/// FTS5 operators. Terms are implicitly ANDed.
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{}\"", term))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Byte ranges in `text` where any of the query terms occur, ASCII
/// case-insensitively.
pub fn find_match_positions(text: &str, query: &str) -> Vec<(usize, usize)> {
    let haystack = text.to_ascii_lowercase();
    let mut positions = Vec::new();
    for term in query.split_whitespace() {
        let needle = term.replace('"', "").to_ascii_lowercase();
        if needle.is_empty() {
            continue;
        }
        let mut from = 0;
        while let Some(found) = haystack[from..].find(&needle) {
            let start = from + found;
            positions.push((start, start + needle.len()));
            from = start + needle.len();
        }
    }
    positions.sort_unstable();
    positions.dedup();
    positions
}

fn partition_name(time: DateTime<Utc>) -> String {
    format!("pages_{:04}{:02}", time.year(), time.month())
}

#[derive(Debug, Clone)]
struct PendingPage {
    url_id: UrlId,
    visit_id: VisitId,
    time: DateTime<Utc>,
    title: Option<String>,
    body: Option<String>,
}

/// SQLite FTS5 implementation of [`TextIndex`].
pub struct FtsTextIndex {
    db: Database,
    pending: HashMap<Url, PendingPage>,
}

impl FtsTextIndex {
    pub fn open(path: &Path) -> Result<Self, WaypointError> {
        Ok(Self {
            db: Database::new(path, StoreSchema::TextIndex)?,
            pending: HashMap::new(),
        })
    }

    pub fn in_memory() -> Result<Self, WaypointError> {
        Ok(Self {
            db: Database::in_memory(StoreSchema::TextIndex)?,
            pending: HashMap::new(),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Partition tables, newest first.
    fn partitions(&self) -> Result<Vec<String>, WaypointError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type = 'table'
                       AND name GLOB 'pages_[0-9][0-9][0-9][0-9][0-9][0-9]'
                     ORDER BY name DESC",
                )
                .map_err(storage_err("Failed to list index partitions"))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(storage_err("Failed to list index partitions"))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
                .map_err(storage_err("Failed to read partition name"))
        })
    }

    fn write_page(
        &self,
        url: &Url,
        url_id: UrlId,
        visit_id: VisitId,
        time: DateTime<Utc>,
        title: &str,
        body: &str,
    ) -> Result<(), WaypointError> {
        let table = partition_name(time);
        self.db.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5(
                    url UNINDEXED, title, body, time UNINDEXED,
                    url_id UNINDEXED, visit_id UNINDEXED
                 );",
                table
            ))
            .map_err(storage_err("Failed to create index partition"))?;
            // Only the latest visit of a URL is kept per partition.
            conn.execute(
                &format!("DELETE FROM {} WHERE url = ?1", table),
                [url.as_str()],
            )
            .map_err(storage_err("Failed to replace indexed page"))?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (url, title, body, time, url_id, visit_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    table
                ),
                rusqlite::params![url.as_str(), title, body, to_micros(time), url_id.0, visit_id.0],
            )
            .map_err(storage_err("Failed to index page"))?;
            Ok(())
        })?;
        debug!(url = %url, partition = %table, "Page indexed");
        Ok(())
    }

    fn flush_page(&self, url: &Url, page: &PendingPage) -> Result<(), WaypointError> {
        self.write_page(
            url,
            page.url_id,
            page.visit_id,
            page.time,
            page.title.as_deref().unwrap_or(""),
            page.body.as_deref().unwrap_or(""),
        )
    }

    /// Write out every buffered page with whatever data it has.
    fn flush_pending(&mut self) -> Result<(), WaypointError> {
        let pending: Vec<(Url, PendingPage)> = self.pending.drain().collect();
        for (url, page) in &pending {
            self.flush_page(url, page)?;
        }
        Ok(())
    }

    fn flush_if_complete(&mut self, url: &Url) -> Result<(), WaypointError> {
        let complete = self
            .pending
            .get(url)
            .is_some_and(|p| p.title.is_some() && p.body.is_some());
        if complete {
            if let Some(page) = self.pending.remove(url) {
                self.flush_page(url, &page)?;
            }
        }
        Ok(())
    }
}

impl TextIndex for FtsTextIndex {
    fn add_page_url(&mut self, url: &Url, url_id: UrlId, visit_id: VisitId, time: DateTime<Utc>) {
        // A newer visit replaces whatever was buffered for the URL.
        self.pending.insert(
            url.clone(),
            PendingPage {
                url_id,
                visit_id,
                time,
                title: None,
                body: None,
            },
        );
    }

    fn add_page_title(&mut self, url: &Url, title: &str) -> Result<(), WaypointError> {
        if let Some(page) = self.pending.get_mut(url) {
            page.title = Some(title.to_string());
            return self.flush_if_complete(url);
        }
        // Already written out: retitle the indexed rows.
        for table in self.partitions()? {
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!("UPDATE {} SET title = ?1 WHERE url = ?2", table),
                    rusqlite::params![title, url.as_str()],
                )
                .map_err(storage_err("Failed to retitle indexed page"))?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn add_page_contents(&mut self, url: &Url, body: &str) -> Result<(), WaypointError> {
        match self.pending.get_mut(url) {
            Some(page) => {
                page.body = Some(body.to_string());
                self.flush_if_complete(url)
            }
            None => {
                debug!(url = %url, "Contents for a page with no pending visit ignored");
                Ok(())
            }
        }
    }

    fn add_page_data(
        &mut self,
        url: &Url,
        url_id: UrlId,
        visit_id: VisitId,
        time: DateTime<Utc>,
        title: &str,
        body: &str,
    ) -> Result<(), WaypointError> {
        self.pending.remove(url);
        self.write_page(url, url_id, visit_id, time, title, body)
    }

    fn get_text_matches(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<TextMatches, WaypointError> {
        let fts_query = sanitize_fts5_query(query);
        if fts_query.is_empty() {
            return Ok(TextMatches::default());
        }
        let begin = opt_to_micros(options.begin_time);
        let end = options.end_time.map(to_micros).unwrap_or(i64::MAX);

        let mut found = Vec::new();
        for table in self.partitions()? {
            let rows: Vec<(Url, String, i64, String)> = self.db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT url, title, time, snippet({table}, 2, '', '', '...', 16)
                         FROM {table}
                         WHERE {table} MATCH ?1 AND time >= ?2 AND time < ?3",
                        table = table
                    ))
                    .map_err(storage_err("FTS5 query prepare failed"))?;
                let rows = stmt
                    .query_map(rusqlite::params![fts_query, begin, end], |row| {
                        Ok((url_column(row, 0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(storage_err("FTS5 query failed"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(storage_err("Failed to read FTS5 row"))
            })?;
            found.extend(rows);
        }

        found.sort_by(|a, b| b.2.cmp(&a.2));

        let mut seen = HashSet::new();
        let mut result = TextMatches {
            matches: Vec::new(),
            first_time_searched: options.begin_time,
        };
        for (url, title, time, snippet) in found {
            if !seen.insert(url.clone()) {
                continue;
            }
            if options.max_count != 0 && result.matches.len() >= options.max_count {
                // More matches exist before this point; the caller has not
                // seen everything back to `begin_time`.
                if let Some(last) = result.matches.last() {
                    result.first_time_searched = Some(last.time);
                }
                break;
            }
            let title_match_positions = find_match_positions(&title, query);
            result.matches.push(TextMatch {
                url,
                title,
                time: time_from_micros(time),
                snippet,
                title_match_positions,
            });
        }
        Ok(result)
    }

    fn delete_url(&mut self, url: &Url) -> Result<(), WaypointError> {
        self.pending.remove(url);
        for table in self.partitions()? {
            self.db.with_conn(|conn| {
                conn.execute(&format!("DELETE FROM {} WHERE url = ?1", table), [url.as_str()])
                    .map_err(storage_err("Failed to delete indexed page"))?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn delete_range(
        &mut self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(), WaypointError> {
        let in_range = |t: DateTime<Utc>| {
            begin.map_or(true, |b| t >= b) && end.map_or(true, |e| t < e)
        };
        self.pending.retain(|_, page| !in_range(page.time));

        let begin = opt_to_micros(begin);
        let end = end.map(to_micros).unwrap_or(i64::MAX);
        for table in self.partitions()? {
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!("DELETE FROM {} WHERE time >= ?1 AND time < ?2", table),
                    [begin, end],
                )
                .map_err(storage_err("Failed to delete indexed range"))?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn delete_all(&mut self) -> Result<(), WaypointError> {
        self.pending.clear();
        let partitions = self.partitions()?;
        let dropped = partitions.len();
        for table in partitions {
            self.db.with_conn(|conn| {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table))
                    .map_err(storage_err("Failed to drop index partition"))
            })?;
        }
        info!(partitions = dropped, "Full-text index cleared");
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<(), WaypointError> {
        self.db.begin_transaction()
    }

    fn commit_transaction(&mut self) -> Result<(), WaypointError> {
        self.flush_pending()?;
        self.db.commit_transaction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_index() -> FtsTextIndex {
        FtsTextIndex::in_memory().unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_sanitize_quotes_terms() {
        assert_eq!(sanitize_fts5_query("rust  lang"), "\"rust\" \"lang\"");
        assert_eq!(sanitize_fts5_query("a\"b OR"), "\"ab\" \"OR\"");
        assert_eq!(sanitize_fts5_query("   "), "");
    }

    #[test]
    fn test_find_match_positions() {
        assert_eq!(
            find_match_positions("Rust and rusty", "rust"),
            vec![(0, 4), (9, 13)]
        );
        assert!(find_match_positions("nothing", "rust").is_empty());
    }

    #[test]
    fn test_page_indexed_once_title_and_body_arrive() {
        let mut index = make_index();
        let page = url("https://docs.test/async");
        let now = Utc::now();
        index.add_page_url(&page, UrlId(1), VisitId(1), now);
        index.add_page_title(&page, "Async Rust").unwrap();
        assert_eq!(index.pending_count(), 1);
        index.add_page_contents(&page, "futures and executors").unwrap();
        assert_eq!(index.pending_count(), 0);

        let found = index
            .get_text_matches("executors", &QueryOptions::default())
            .unwrap();
        assert_eq!(found.matches.len(), 1);
        assert_eq!(found.matches[0].url, page);
        assert_eq!(found.matches[0].title, "Async Rust");
        assert!(found.first_time_searched.is_none());
    }

    #[test]
    fn test_commit_flushes_partial_pages() {
        let mut index = make_index();
        let page = url("https://docs.test/");
        index.begin_transaction().unwrap();
        index.add_page_url(&page, UrlId(1), VisitId(1), Utc::now());
        index.add_page_title(&page, "Borrow checker notes").unwrap();
        index.commit_transaction().unwrap();
        assert_eq!(index.pending_count(), 0);

        let found = index
            .get_text_matches("borrow", &QueryOptions::default())
            .unwrap();
        assert_eq!(found.matches.len(), 1);
        assert_eq!(found.matches[0].title_match_positions, vec![(0, 6)]);

        // Late titles update the indexed row.
        index.add_page_title(&page, "Lifetimes").unwrap();
        let found = index
            .get_text_matches("lifetimes", &QueryOptions::default())
            .unwrap();
        assert_eq!(found.matches.len(), 1);
    }

    #[test]
    fn test_matches_newest_first_and_capped() {
        let mut index = make_index();
        let now = Utc::now();
        for i in 0..3 {
            let page = url(&format!("https://blog.test/{}", i));
            index
                .add_page_data(
                    &page,
                    UrlId(i + 1),
                    VisitId(i + 1),
                    now - Duration::days(40 * i),
                    "tokio post",
                    "select loop",
                )
                .unwrap();
        }
        let all = index
            .get_text_matches("tokio", &QueryOptions::default())
            .unwrap();
        let urls: Vec<&str> = all.matches.iter().map(|m| m.url.path()).collect();
        assert_eq!(urls, vec!["/0", "/1", "/2"]);

        let capped = index
            .get_text_matches("tokio", &QueryOptions::with_max_count(2))
            .unwrap();
        assert_eq!(capped.matches.len(), 2);
        assert_eq!(
            capped.first_time_searched.map(|t| t.timestamp_micros()),
            Some((now - Duration::days(40)).timestamp_micros())
        );
    }

    #[test]
    fn test_time_window_filters() {
        let mut index = make_index();
        let now = Utc::now();
        index
            .add_page_data(&url("https://a.test/"), UrlId(1), VisitId(1), now, "rust", "")
            .unwrap();
        index
            .add_page_data(
                &url("https://b.test/"),
                UrlId(2),
                VisitId(2),
                now - Duration::days(3),
                "rust",
                "",
            )
            .unwrap();
        let options = QueryOptions {
            begin_time: Some(now - Duration::days(1)),
            end_time: None,
            max_count: 0,
        };
        let found = index.get_text_matches("rust", &options).unwrap();
        assert_eq!(found.matches.len(), 1);
        assert_eq!(found.matches[0].url, url("https://a.test/"));
    }

    #[test]
    fn test_deletes() {
        let mut index = make_index();
        let now = Utc::now();
        let a = url("https://a.test/");
        let b = url("https://b.test/");
        index.add_page_data(&a, UrlId(1), VisitId(1), now, "alpha", "").unwrap();
        index
            .add_page_data(&b, UrlId(2), VisitId(2), now - Duration::days(2), "alpha", "")
            .unwrap();

        index.delete_url(&a).unwrap();
        let found = index.get_text_matches("alpha", &QueryOptions::default()).unwrap();
        assert_eq!(found.matches.len(), 1);

        index
            .delete_range(Some(now - Duration::days(3)), Some(now))
            .unwrap();
        assert!(index
            .get_text_matches("alpha", &QueryOptions::default())
            .unwrap()
            .matches
            .is_empty());

        index.add_page_data(&a, UrlId(1), VisitId(3), now, "alpha", "").unwrap();
        index.delete_all().unwrap();
        assert!(index.partitions().unwrap().is_empty());
    }

    #[test]
    fn test_empty_query() {
        let index = make_index();
        let found = index.get_text_matches("  ", &QueryOptions::default()).unwrap();
        assert!(found.matches.is_empty());
    }
}
