//! Capability traits shared by the primary and archived history stores.
//!
//! Both stores carry identical `urls` and `visits` tables; the traits give
//! them the same row-level API through default methods so the engine can
//! treat either one as "a place URLs and visits live".

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use url::Url;

use waypoint_core::error::WaypointError;
use waypoint_core::types::{
    PageTransition, SegmentId, UrlId, UrlRow, VisitId, VisitRow, VisitSource,
};

use crate::db::{
    from_micros, opt_to_micros, storage_err, time_from_micros, to_micros, url_column, Database,
};

const URL_ROW_FIELDS: &str =
    "id, url, title, visit_count, typed_count, last_visit_time, hidden";
const VISIT_ROW_FIELDS: &str =
    "id, url_id, visit_time, from_visit, transition, segment_id, is_indexed, source";

pub(crate) fn row_to_url(row: &rusqlite::Row<'_>) -> rusqlite::Result<UrlRow> {
    Ok(UrlRow {
        id: UrlId(row.get(0)?),
        url: url_column(row, 1)?,
        title: row.get(2)?,
        visit_count: row.get(3)?,
        typed_count: row.get(4)?,
        last_visit: from_micros(row.get(5)?),
        hidden: row.get::<_, i64>(6)? != 0,
    })
}

pub(crate) fn row_to_visit(row: &rusqlite::Row<'_>) -> rusqlite::Result<VisitRow> {
    Ok(VisitRow {
        id: VisitId(row.get(0)?),
        url_id: UrlId(row.get(1)?),
        visit_time: time_from_micros(row.get(2)?),
        referring_visit: VisitId(row.get(3)?),
        transition: PageTransition(row.get::<_, i64>(4)? as u32),
        segment_id: SegmentId(row.get(5)?),
        is_indexed: row.get::<_, i64>(6)? != 0,
        source: VisitSource::from_i64(row.get(7)?),
    })
}

fn collect<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    context: &'static str,
) -> Result<Vec<T>, WaypointError> {
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(storage_err(context))
}

/// Access to the database behind a store.
pub trait StoreHandle {
    fn database(&self) -> &Database;
}

/// Row-level access to the `urls` table.
pub trait UrlStore: StoreHandle {
    fn get_url_row(&self, id: UrlId) -> Result<Option<UrlRow>, WaypointError> {
        self.database().with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM urls WHERE id = ?1", URL_ROW_FIELDS),
                [id.0],
                row_to_url,
            )
            .optional()
            .map_err(storage_err("Failed to read url row"))
        })
    }

    fn get_row_for_url(&self, url: &Url) -> Result<Option<UrlRow>, WaypointError> {
        self.database().with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM urls WHERE url = ?1", URL_ROW_FIELDS),
                [url.as_str()],
                row_to_url,
            )
            .optional()
            .map_err(storage_err("Failed to look up url"))
        })
    }

    /// Insert `row` and return its new id. `row.id` is ignored.
    fn add_url(&self, row: &UrlRow) -> Result<UrlId, WaypointError> {
        self.database().with_conn(|conn| {
            conn.execute(
                "INSERT INTO urls (url, title, visit_count, typed_count, last_visit_time, hidden)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.url.as_str(),
                    row.title,
                    row.visit_count,
                    row.typed_count,
                    opt_to_micros(row.last_visit),
                    row.hidden as i64,
                ],
            )
            .map_err(storage_err("Failed to add url"))?;
            Ok(UrlId(conn.last_insert_rowid()))
        })
    }

    fn update_url_row(&self, row: &UrlRow) -> Result<(), WaypointError> {
        self.database().with_conn(|conn| {
            conn.execute(
                "UPDATE urls SET title = ?1, visit_count = ?2, typed_count = ?3,
                        last_visit_time = ?4, hidden = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    row.title,
                    row.visit_count,
                    row.typed_count,
                    opt_to_micros(row.last_visit),
                    row.hidden as i64,
                    row.id.0,
                ],
            )
            .map_err(storage_err("Failed to update url"))?;
            Ok(())
        })
    }

    fn delete_url_row(&self, id: UrlId) -> Result<(), WaypointError> {
        self.database().with_conn(|conn| {
            conn.execute("DELETE FROM urls WHERE id = ?1", [id.0])
                .map_err(storage_err("Failed to delete url"))?;
            Ok(())
        })
    }

    fn all_urls(&self) -> Result<Vec<UrlRow>, WaypointError> {
        self.database().with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM urls ORDER BY id", URL_ROW_FIELDS))
                .map_err(storage_err("Failed to prepare url scan"))?;
            let rows = stmt
                .query_map([], row_to_url)
                .map_err(storage_err("Failed to scan urls"))?;
            collect(rows, "Failed to read url row")
        })
    }

    fn typed_urls(&self) -> Result<Vec<UrlRow>, WaypointError> {
        self.database().with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM urls WHERE typed_count > 0 ORDER BY id",
                    URL_ROW_FIELDS
                ))
                .map_err(storage_err("Failed to prepare typed url scan"))?;
            let rows = stmt
                .query_map([], row_to_url)
                .map_err(storage_err("Failed to scan typed urls"))?;
            collect(rows, "Failed to read url row")
        })
    }

    fn url_count(&self) -> Result<u64, WaypointError> {
        self.database().with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM urls", [], |row| row.get(0))
                .map_err(storage_err("Failed to count urls"))?;
            Ok(count as u64)
        })
    }
}

/// Row-level access to the `visits` table.
pub trait VisitStore: StoreHandle {
    /// Insert `visit` and return its new id. `visit.id` is ignored.
    fn add_visit(&self, visit: &VisitRow) -> Result<VisitId, WaypointError> {
        self.database().with_conn(|conn| {
            conn.execute(
                "INSERT INTO visits (url_id, visit_time, from_visit, transition, segment_id,
                                     is_indexed, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    visit.url_id.0,
                    to_micros(visit.visit_time),
                    visit.referring_visit.0,
                    i64::from(visit.transition.0),
                    visit.segment_id.0,
                    visit.is_indexed as i64,
                    visit.source.as_i64(),
                ],
            )
            .map_err(storage_err("Failed to add visit"))?;
            Ok(VisitId(conn.last_insert_rowid()))
        })
    }

    fn get_visit_row(&self, id: VisitId) -> Result<Option<VisitRow>, WaypointError> {
        self.database().with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM visits WHERE id = ?1", VISIT_ROW_FIELDS),
                [id.0],
                row_to_visit,
            )
            .optional()
            .map_err(storage_err("Failed to read visit row"))
        })
    }

    fn update_visit_row(&self, visit: &VisitRow) -> Result<(), WaypointError> {
        self.database().with_conn(|conn| {
            conn.execute(
                "UPDATE visits SET url_id = ?1, visit_time = ?2, from_visit = ?3,
                        transition = ?4, segment_id = ?5, is_indexed = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    visit.url_id.0,
                    to_micros(visit.visit_time),
                    visit.referring_visit.0,
                    i64::from(visit.transition.0),
                    visit.segment_id.0,
                    visit.is_indexed as i64,
                    visit.id.0,
                ],
            )
            .map_err(storage_err("Failed to update visit"))?;
            Ok(())
        })
    }

    fn delete_visit(&self, id: VisitId) -> Result<(), WaypointError> {
        self.database().with_conn(|conn| {
            conn.execute("DELETE FROM visits WHERE id = ?1", [id.0])
                .map_err(storage_err("Failed to delete visit"))?;
            Ok(())
        })
    }

    /// All visits to `url_id`, oldest first.
    fn visits_for_url(&self, url_id: UrlId) -> Result<Vec<VisitRow>, WaypointError> {
        self.database().with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM visits WHERE url_id = ?1 ORDER BY visit_time ASC, id ASC",
                    VISIT_ROW_FIELDS
                ))
                .map_err(storage_err("Failed to prepare visit lookup"))?;
            let rows = stmt
                .query_map([url_id.0], row_to_visit)
                .map_err(storage_err("Failed to query visits"))?;
            collect(rows, "Failed to read visit row")
        })
    }

    fn most_recent_visit_for_url(&self, url_id: UrlId) -> Result<Option<VisitRow>, WaypointError> {
        self.database().with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM visits WHERE url_id = ?1
                     ORDER BY visit_time DESC, id DESC LIMIT 1",
                    VISIT_ROW_FIELDS
                ),
                [url_id.0],
                row_to_visit,
            )
            .optional()
            .map_err(storage_err("Failed to read most recent visit"))
        })
    }

    /// Every visit in `[begin, end)`, newest first. Open bounds are unset.
    fn visits_in_range(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<VisitRow>, WaypointError> {
        let begin = opt_to_micros(begin);
        let end = end.map(to_micros).unwrap_or(i64::MAX);
        self.database().with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM visits WHERE visit_time >= ?1 AND visit_time < ?2
                     ORDER BY visit_time DESC, id DESC",
                    VISIT_ROW_FIELDS
                ))
                .map_err(storage_err("Failed to prepare range query"))?;
            let rows = stmt
                .query_map([begin, end], row_to_visit)
                .map_err(storage_err("Failed to query visit range"))?;
            collect(rows, "Failed to read visit row")
        })
    }

    /// Visits strictly older than `cutoff`, oldest first, at most `limit`.
    fn visits_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VisitRow>, WaypointError> {
        self.database().with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM visits WHERE visit_time < ?1
                     ORDER BY visit_time ASC, id ASC LIMIT ?2",
                    VISIT_ROW_FIELDS
                ))
                .map_err(storage_err("Failed to prepare archive scan"))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![to_micros(cutoff), limit as i64],
                    row_to_visit,
                )
                .map_err(storage_err("Failed to scan old visits"))?;
            collect(rows, "Failed to read visit row")
        })
    }

    /// The user-visible visits in `[begin, end)`: chain ends of main-frame,
    /// non keyword-generated navigations, newest first, one per URL.
    fn visible_visits_in_range(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        max_count: usize,
    ) -> Result<Vec<VisitRow>, WaypointError> {
        let begin = opt_to_micros(begin);
        let end = end.map(to_micros).unwrap_or(i64::MAX);
        self.database().with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM visits
                     WHERE visit_time >= ?1 AND visit_time < ?2
                       AND (transition & ?3) != 0
                       AND (transition & ?4) NOT IN (?5, ?6, ?7)
                     ORDER BY visit_time DESC, id DESC",
                    VISIT_ROW_FIELDS
                ))
                .map_err(storage_err("Failed to prepare visible visit query"))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![
                        begin,
                        end,
                        i64::from(PageTransition::CHAIN_END.0),
                        i64::from(PageTransition::CORE_MASK),
                        i64::from(PageTransition::AUTO_SUBFRAME.0),
                        i64::from(PageTransition::MANUAL_SUBFRAME.0),
                        i64::from(PageTransition::KEYWORD_GENERATED.0),
                    ],
                    row_to_visit,
                )
                .map_err(storage_err("Failed to query visible visits"))?;

            let mut seen = HashSet::new();
            let mut visits = Vec::new();
            for row in rows {
                let visit = row.map_err(storage_err("Failed to read visit row"))?;
                if !seen.insert(visit.url_id) {
                    continue;
                }
                visits.push(visit);
                if max_count != 0 && visits.len() >= max_count {
                    break;
                }
            }
            Ok(visits)
        })
    }

    /// The redirect hop that `from` led to, if any.
    fn redirect_from_visit(&self, from: VisitId) -> Result<Option<VisitRow>, WaypointError> {
        self.database().with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM visits WHERE from_visit = ?1 AND (transition & ?2) != 0
                     ORDER BY id ASC LIMIT 1",
                    VISIT_ROW_FIELDS
                ),
                rusqlite::params![from.0, i64::from(PageTransition::IS_REDIRECT_MASK)],
                row_to_visit,
            )
            .optional()
            .map_err(storage_err("Failed to follow redirect"))
        })
    }

    /// The visit that redirected to `to`, if `to` was reached by a redirect.
    fn redirect_to_visit(&self, to: VisitId) -> Result<Option<VisitRow>, WaypointError> {
        let Some(visit) = self.get_visit_row(to)? else {
            return Ok(None);
        };
        if !visit.transition.is_redirect() || !visit.referring_visit.is_set() {
            return Ok(None);
        }
        self.get_visit_row(visit.referring_visit)
    }

    fn first_visit_time(&self) -> Result<Option<DateTime<Utc>>, WaypointError> {
        self.database().with_conn(|conn| {
            let micros: Option<i64> = conn
                .query_row("SELECT MIN(visit_time) FROM visits", [], |row| row.get(0))
                .map_err(storage_err("Failed to read first visit time"))?;
            Ok(micros.and_then(from_micros))
        })
    }

    /// Number of visible visits to `url`'s scheme and host, and the first one.
    fn visible_visit_count_to_host(
        &self,
        url: &Url,
    ) -> Result<(u64, Option<DateTime<Utc>>), WaypointError> {
        let Some(host) = url.host_str() else {
            return Ok((0, None));
        };
        let prefix = format!("{}://{}/", url.scheme(), host);
        let upper = format!("{}://{}0", url.scheme(), host);
        self.database().with_conn(|conn| {
            let (count, first): (i64, Option<i64>) = conn
                .query_row(
                    "SELECT COUNT(*), MIN(v.visit_time) FROM visits v
                     JOIN urls u ON u.id = v.url_id
                     WHERE u.url >= ?1 AND u.url < ?2
                       AND (v.transition & ?3) NOT IN (?4, ?5, ?6)
                       AND (v.transition & ?7) != 0",
                    rusqlite::params![
                        prefix,
                        upper,
                        i64::from(PageTransition::CORE_MASK),
                        i64::from(PageTransition::AUTO_SUBFRAME.0),
                        i64::from(PageTransition::MANUAL_SUBFRAME.0),
                        i64::from(PageTransition::KEYWORD_GENERATED.0),
                        i64::from(PageTransition::CHAIN_END.0),
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(storage_err("Failed to count host visits"))?;
            Ok((count as u64, first.and_then(from_micros)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archived_db::ArchivedDatabase;
    use chrono::Duration;

    fn make_store() -> ArchivedDatabase {
        ArchivedDatabase::in_memory().unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn add_url(store: &ArchivedDatabase, s: &str) -> UrlId {
        store.add_url(&UrlRow::new(url(s))).unwrap()
    }

    fn visit(url_id: UrlId, at: DateTime<Utc>, from: VisitId, t: PageTransition) -> VisitRow {
        VisitRow::new(url_id, at, from, t, VisitSource::Browsed)
    }

    #[test]
    fn test_url_round_trip_through_store() {
        let store = make_store();
        let mut row = UrlRow::new(url("https://a.test/page"));
        row.title = "A".into();
        row.visit_count = 3;
        row.typed_count = 1;
        row.last_visit = DateTime::from_timestamp_micros(1_700_000_000_000_000);
        let id = store.add_url(&row).unwrap();

        let stored = store.get_row_for_url(&row.url).unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.title, "A");
        assert_eq!(stored.visit_count, 3);
        assert_eq!(stored.last_visit, row.last_visit);
        assert_eq!(store.get_url_row(id).unwrap(), Some(stored));
    }

    #[test]
    fn test_missing_rows_are_none() {
        let store = make_store();
        assert!(store.get_url_row(UrlId(42)).unwrap().is_none());
        assert!(store.get_row_for_url(&url("https://nope.test/")).unwrap().is_none());
        assert!(store.get_visit_row(VisitId(42)).unwrap().is_none());
    }

    #[test]
    fn test_visible_visits_one_per_url_newest_first() {
        let store = make_store();
        let a = add_url(&store, "https://a.test/");
        let b = add_url(&store, "https://b.test/");
        let base = Utc::now();
        let end = PageTransition::LINK | PageTransition::CHAIN_START | PageTransition::CHAIN_END;
        store.add_visit(&visit(a, base, VisitId(0), end)).unwrap();
        store
            .add_visit(&visit(b, base + Duration::seconds(1), VisitId(0), end))
            .unwrap();
        store
            .add_visit(&visit(a, base + Duration::seconds(2), VisitId(0), end))
            .unwrap();
        // Not a chain end: hidden from results.
        store
            .add_visit(&visit(b, base + Duration::seconds(3), VisitId(0), PageTransition::LINK))
            .unwrap();
        // Subframe: hidden from results.
        let sub = add_url(&store, "https://c.test/frame");
        store
            .add_visit(&visit(
                sub,
                base + Duration::seconds(4),
                VisitId(0),
                PageTransition::AUTO_SUBFRAME | PageTransition::CHAIN_END,
            ))
            .unwrap();

        let visits = store.visible_visits_in_range(None, None, 0).unwrap();
        let ids: Vec<UrlId> = visits.iter().map(|v| v.url_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(visits[0].visit_time.timestamp_micros(), (base + Duration::seconds(2)).timestamp_micros());

        let capped = store.visible_visits_in_range(None, None, 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_redirect_links() {
        let store = make_store();
        let a = add_url(&store, "https://a.test/");
        let b = add_url(&store, "https://b.test/");
        let now = Utc::now();
        let first = store
            .add_visit(&visit(a, now, VisitId(0), PageTransition::LINK | PageTransition::CHAIN_START))
            .unwrap();
        let second = store
            .add_visit(&visit(
                b,
                now,
                first,
                PageTransition::LINK | PageTransition::SERVER_REDIRECT | PageTransition::CHAIN_END,
            ))
            .unwrap();

        assert_eq!(store.redirect_from_visit(first).unwrap().unwrap().id, second);
        assert_eq!(store.redirect_to_visit(second).unwrap().unwrap().id, first);
        assert!(store.redirect_to_visit(first).unwrap().is_none());
        assert!(store.redirect_from_visit(second).unwrap().is_none());
    }

    #[test]
    fn test_visits_before_is_strict() {
        let store = make_store();
        let a = add_url(&store, "https://a.test/");
        let cutoff = Utc::now();
        store
            .add_visit(&visit(a, cutoff, VisitId(0), PageTransition::LINK))
            .unwrap();
        store
            .add_visit(&visit(a, cutoff - Duration::microseconds(1), VisitId(0), PageTransition::LINK))
            .unwrap();
        let old = store.visits_before(cutoff, 100).unwrap();
        assert_eq!(old.len(), 1);
        assert!(old[0].visit_time < cutoff);
    }

    #[test]
    fn test_visible_visit_count_to_host() {
        let store = make_store();
        let a = add_url(&store, "https://a.test/one");
        let a2 = add_url(&store, "https://a.test/two");
        let other = add_url(&store, "https://a.testing/");
        let now = Utc::now();
        let end = PageTransition::LINK | PageTransition::CHAIN_END;
        store.add_visit(&visit(a, now, VisitId(0), end)).unwrap();
        store
            .add_visit(&visit(a2, now + Duration::seconds(1), VisitId(0), end))
            .unwrap();
        store.add_visit(&visit(other, now, VisitId(0), end)).unwrap();

        let (count, first) = store
            .visible_visit_count_to_host(&url("https://a.test/anything"))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(first.map(|t| t.timestamp_micros()), Some(now.timestamp_micros()));
    }
}
