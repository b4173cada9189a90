//! Recording navigations and maintaining URL rows.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use url::Url;

use waypoint_core::error::Result;
use waypoint_core::events::HistoryEvent;
use waypoint_core::types::{
    KeywordSearchTermVisit, PageTransition, UrlId, UrlRow, VisitId, VisitRow, VisitSource,
};
use waypoint_storage::{TextIndex, UrlStore, VisitStore};

use crate::backend::HistoryBackend;

/// One navigation as reported by the host.
#[derive(Debug, Clone)]
pub struct AddPageArgs {
    pub url: Url,
    pub time: DateTime<Utc>,
    /// Owner of the navigation, usually a tab.
    pub scope: u64,
    /// Navigation entry id inside `scope`.
    pub page_id: i32,
    pub referrer: Option<Url>,
    pub transition: PageTransition,
    /// Every URL of the redirect chain ending at `url`. Empty or a single
    /// element means no redirects.
    pub redirects: Vec<Url>,
    pub source: VisitSource,
    /// The navigation replaced the current entry instead of adding one.
    pub did_replace_entry: bool,
}

impl AddPageArgs {
    pub fn new(url: Url, time: DateTime<Utc>, transition: PageTransition) -> Self {
        Self {
            url,
            time,
            scope: 0,
            page_id: 0,
            referrer: None,
            transition,
            redirects: Vec::new(),
            source: VisitSource::Browsed,
            did_replace_entry: false,
        }
    }
}

impl HistoryBackend {
    /// Record a navigation, including every hop of its redirect chain.
    pub fn add_page(&mut self, args: &AddPageArgs) -> Result<()> {
        if self.db.is_none() {
            return Ok(());
        }

        let time = self.unique_visit_time(args.time);
        let from_visit = self
            .tracker
            .get_last_visit(args.scope, args.page_id, args.referrer.as_ref());
        let core = args.transition.core();

        let mut last_visit = from_visit;
        let mut last_url_id = UrlId::default();

        if args.redirects.len() <= 1 {
            let transition = args
                .transition
                .with(PageTransition::CHAIN_START)
                .with(PageTransition::CHAIN_END);
            (last_url_id, last_visit) = self
                .add_page_visit(&args.url, time, last_visit, transition, args.source)
                .unwrap_or_default();
            self.update_segments(&args.url, from_visit, last_visit, transition, time)?;
        } else {
            let mut chain = args.redirects.clone();
            let mut first_info = PageTransition::CHAIN_START;

            if chain[0].scheme() == "about" {
                // Redirects out of about: pages are not worth showing.
                chain.remove(0);
            } else if args.transition.has(PageTransition::CLIENT_REDIRECT) {
                first_info = first_info.with(PageTransition::CLIENT_REDIRECT);
                if args.referrer.as_ref() == Some(&chain[0]) {
                    // The referrer already has a visit; continue its chain.
                    chain.remove(0);
                    if args.did_replace_entry && last_visit.is_set() {
                        self.clear_chain_end(last_visit)?;
                    }
                }
            }

            let mut info = first_info;
            let hops = chain.len();
            for (i, hop) in chain.iter().enumerate() {
                let mut transition = core | info;
                if i + 1 == hops {
                    transition = transition.with(PageTransition::CHAIN_END);
                }
                (last_url_id, last_visit) = self
                    .add_page_visit(hop, time, last_visit, transition, args.source)
                    .unwrap_or_default();
                if transition.has(PageTransition::CHAIN_START) {
                    self.update_segments(hop, from_visit, last_visit, transition, time)?;
                }
                info = PageTransition::SERVER_REDIRECT;
            }

            self.redirects.put(args.url.clone(), chain);
        }

        if args.transition.is_main_frame() && !core.core_is(PageTransition::KEYWORD_GENERATED) {
            self.tracker
                .add_visit(args.scope, args.page_id, &args.url, last_visit);
        }

        if let Some(index) = self.text_index.as_mut() {
            if last_url_id.is_set() {
                index.add_page_url(&args.url, last_url_id, last_visit, time);
            }
        }

        self.schedule_commit();
        Ok(())
    }

    /// Same-timestamp requests get strictly increasing recorded times so
    /// their visits keep their order.
    fn unique_visit_time(&mut self, requested: DateTime<Utc>) -> DateTime<Utc> {
        let recorded = match (self.last_requested_time, self.last_recorded_time) {
            (Some(last_requested), Some(last_recorded)) if last_requested == requested => {
                last_recorded + Duration::microseconds(1)
            }
            _ => requested,
        };
        self.last_requested_time = Some(requested);
        self.last_recorded_time = Some(recorded);
        recorded
    }

    fn clear_chain_end(&self, visit_id: VisitId) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        if let Some(mut visit) = db.get_visit_row(visit_id)? {
            visit.transition = visit.transition.without(PageTransition::CHAIN_END);
            db.update_visit_row(&visit)?;
        }
        Ok(())
    }

    /// Add a single visit to `url`, creating or updating its row.
    ///
    /// Failures are logged and reported as `None`; a lost visit never stops
    /// the rest of a chain from being recorded.
    pub fn add_page_visit(
        &mut self,
        url: &Url,
        time: DateTime<Utc>,
        referring_visit: VisitId,
        transition: PageTransition,
        source: VisitSource,
    ) -> Option<(UrlId, VisitId)> {
        match self.try_add_page_visit(url, time, referring_visit, transition, source) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(url = %url, "Failed to record visit: {}", e);
                None
            }
        }
    }

    fn try_add_page_visit(
        &mut self,
        url: &Url,
        time: DateTime<Utc>,
        referring_visit: VisitId,
        transition: PageTransition,
        source: VisitSource,
    ) -> Result<Option<(UrlId, VisitId)>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(None);
        };

        let hidden = !transition.is_main_frame();
        let core = transition.core();
        let typed_increment = (core == PageTransition::TYPED && !transition.is_redirect())
            || core == PageTransition::KEYWORD_GENERATED;

        let row = match db.get_row_for_url(url)? {
            Some(mut row) => {
                if core != PageTransition::RELOAD {
                    row.visit_count += 1;
                }
                if typed_increment {
                    row.typed_count += 1;
                }
                row.last_visit = Some(time);
                // Only ever un-hide.
                if !hidden {
                    row.hidden = false;
                }
                db.update_url_row(&row)?;
                row
            }
            None => {
                let mut row = UrlRow::new(url.clone());
                row.visit_count = 1;
                row.typed_count = u32::from(typed_increment);
                row.last_visit = Some(time);
                row.hidden = hidden;
                row.id = db.add_url(&row)?;
                row
            }
        };

        let visit = VisitRow::new(row.id, time, referring_visit, transition, source);
        let visit_id = db.add_visit(&visit)?;

        self.lower_first_recorded_time(time);
        debug!(url_id = %row.id, visit_id = %visit_id, transition = %transition, "Visit recorded");
        let url_id = row.id;
        self.notify(HistoryEvent::UrlVisited {
            row,
            transition,
            visit_time: time,
        });
        Ok(Some((url_id, visit_id)))
    }

    /// Add visits to `url` at the given times. Returns false if any of them
    /// could not be stored.
    pub fn add_visits(
        &mut self,
        url: &Url,
        visits: &[(DateTime<Utc>, PageTransition)],
        source: VisitSource,
    ) -> bool {
        if self.db.is_none() {
            return false;
        }
        for &(time, transition) in visits {
            if self
                .add_page_visit(url, time, VisitId::default(), transition, source)
                .is_none()
            {
                return false;
            }
        }
        self.schedule_commit();
        true
    }

    /// Set the title of `url` and of every hop of the redirect chain that
    /// most recently ended there.
    pub fn set_page_title(&mut self, url: &Url, title: &str) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        let chain = self.redirects.chain_or_self(url);

        let mut changed = Vec::new();
        for hop in &chain {
            if let Some(mut row) = db.get_row_for_url(hop)? {
                if row.title != title {
                    row.title = title.to_string();
                    db.update_url_row(&row)?;
                    changed.push(row);
                }
            }
        }

        // Only typed URLs are interesting to observers of title changes.
        let typed: Vec<UrlRow> = changed
            .iter()
            .filter(|row| row.typed_count > 0)
            .cloned()
            .collect();
        if !typed.is_empty() {
            self.notify(HistoryEvent::UrlsModified {
                changed_urls: typed,
            });
        }

        if let Some(index) = self.text_index.as_mut() {
            index.add_page_title(url, title)?;
        }

        if !changed.is_empty() {
            self.schedule_commit();
        }
        Ok(())
    }

    /// Hand the body text of a visited page to the full-text index.
    pub fn set_page_contents(&mut self, url: &Url, contents: &str) -> Result<()> {
        if let Some(index) = self.text_index.as_mut() {
            index.add_page_contents(url, contents)?;
        }
        Ok(())
    }

    /// Import fully formed rows, e.g. from another browser or from sync.
    ///
    /// Rows last visited before the archive cutoff go straight to the
    /// archived store. Each new row gets one synthetic visit unless it came
    /// from sync.
    pub fn add_pages_with_details(&mut self, rows: &[UrlRow], source: VisitSource) -> Result<()> {
        if self.db.is_none() {
            return Ok(());
        }
        let cutoff = self.archive_cutoff();
        let mut modified = Vec::new();

        for row in rows {
            let Some(last_visit) = row.last_visit else {
                debug!(url = %row.url, "Skipping imported row without a visit time");
                continue;
            };

            let added = if last_visit < cutoff {
                let Some(archived) = self.archived.as_ref() else {
                    debug!(url = %row.url, "No archived store for old imported row");
                    continue;
                };
                import_row(archived, self.text_index.as_mut(), row, last_visit, source)?
            } else {
                let Some(db) = self.db.as_ref() else {
                    return Ok(());
                };
                import_row(db, self.text_index.as_mut(), row, last_visit, source)?
            };

            if source != VisitSource::Synced {
                self.lower_first_recorded_time(last_visit);
            }
            if added && row.typed_count > 0 {
                modified.push(row.clone());
            }
        }

        if !modified.is_empty() {
            self.notify(HistoryEvent::UrlsModified {
                changed_urls: modified,
            });
        }
        self.schedule_commit();
        Ok(())
    }

    /// Make sure a row exists for a freshly bookmarked URL.
    pub fn add_page_no_visit_for_bookmark(&mut self, url: &Url) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        if db.get_row_for_url(url)?.is_some() {
            return Ok(());
        }
        let mut row = UrlRow::new(url.clone());
        row.last_visit = Some(self.now());
        row.hidden = true;
        db.add_url(&row)?;
        self.schedule_commit();
        Ok(())
    }

    // =========================================================================
    // Rows
    // =========================================================================

    pub fn get_url(&self, url: &Url) -> Result<Option<UrlRow>> {
        match self.db.as_ref() {
            Some(db) => db.get_row_for_url(url),
            None => Ok(None),
        }
    }

    /// The row for `url` and, if asked, its visits oldest first.
    pub fn query_url(&self, url: &Url, want_visits: bool) -> Result<Option<(UrlRow, Vec<VisitRow>)>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(None);
        };
        let Some(row) = db.get_row_for_url(url)? else {
            return Ok(None);
        };
        let visits = if want_visits {
            db.visits_for_url(row.id)?
        } else {
            Vec::new()
        };
        Ok(Some((row, visits)))
    }

    pub fn get_visits_for_url(&self, url_id: UrlId) -> Result<Vec<VisitRow>> {
        match self.db.as_ref() {
            Some(db) => db.visits_for_url(url_id),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_all_typed_urls(&self) -> Result<Vec<UrlRow>> {
        match self.db.as_ref() {
            Some(db) => db.typed_urls(),
            None => Ok(Vec::new()),
        }
    }

    /// Overwrite the row with `row.id`. Returns false when unloaded.
    pub fn update_url(&mut self, row: &UrlRow) -> Result<bool> {
        let Some(db) = self.db.as_ref() else {
            return Ok(false);
        };
        db.update_url_row(row)?;
        self.schedule_commit();
        Ok(true)
    }

    /// Every URL in the primary store.
    pub fn iterate_urls(&self) -> Result<Vec<Url>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(db.all_urls()?.into_iter().map(|row| row.url).collect())
    }

    /// Visible visits to the scheme and host of `url`, with the first one.
    /// `None` when history is unavailable.
    pub fn get_visible_visit_count_to_host(
        &self,
        url: &Url,
    ) -> Result<Option<(u64, Option<DateTime<Utc>>)>> {
        match self.db.as_ref() {
            Some(db) => db.visible_visit_count_to_host(url).map(Some),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Keyword search terms
    // =========================================================================

    pub fn set_keyword_search_terms_for_url(
        &mut self,
        url: &Url,
        keyword_id: i64,
        term: &str,
    ) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        let Some(row) = db.get_row_for_url(url)? else {
            debug!(url = %url, "Keyword term for unknown url ignored");
            return Ok(());
        };
        db.set_keyword_search_terms_for_url(row.id, keyword_id, term)?;
        self.notify(HistoryEvent::KeywordSearchTermUpdated {
            row,
            keyword_id,
            term: term.to_string(),
        });
        self.schedule_commit();
        Ok(())
    }

    pub fn delete_all_search_terms_for_keyword(&mut self, keyword_id: i64) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        db.delete_all_search_terms_for_keyword(keyword_id)?;
        self.schedule_commit();
        Ok(())
    }

    pub fn get_most_recent_keyword_search_terms(
        &self,
        keyword_id: i64,
        prefix: &str,
        max_count: usize,
    ) -> Result<Vec<KeywordSearchTermVisit>> {
        match self.db.as_ref() {
            Some(db) => db.most_recent_keyword_search_terms(keyword_id, prefix, max_count),
            None => Ok(Vec::new()),
        }
    }
}

/// Add `row` to `store` if missing, index it and give it a synthetic visit.
/// Returns whether the row was new.
fn import_row<S: UrlStore + VisitStore>(
    store: &S,
    text_index: Option<&mut Box<dyn TextIndex>>,
    row: &UrlRow,
    last_visit: DateTime<Utc>,
    source: VisitSource,
) -> Result<bool> {
    let (url_id, added) = match store.get_row_for_url(&row.url)? {
        Some(existing) => (existing.id, false),
        None => (store.add_url(row)?, true),
    };

    let mut indexed = false;
    if let Some(index) = text_index {
        match index.add_page_data(&row.url, url_id, VisitId::default(), last_visit, &row.title, "") {
            Ok(()) => indexed = true,
            Err(e) => warn!(url = %row.url, "Failed to index imported page: {}", e),
        }
    }

    if source != VisitSource::Synced {
        let mut visit = VisitRow::new(
            url_id,
            last_visit,
            VisitId::default(),
            PageTransition::LINK | PageTransition::CHAIN_START | PageTransition::CHAIN_END,
            source,
        );
        visit.is_indexed = indexed;
        store.add_visit(&visit)?;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use waypoint_core::clock::ManualClock;
    use waypoint_core::config::HistoryConfig;

    use crate::backend::HistoryDeps;
    use crate::bookmarks::InMemoryBookmarks;
    use crate::notify::BroadcastSink;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn make_backend() -> (HistoryBackend, tokio::sync::broadcast::Receiver<HistoryEvent>) {
        let (sink, rx) = BroadcastSink::new(64);
        let deps = HistoryDeps::new(
            Arc::new(sink),
            Arc::new(InMemoryBookmarks::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let backend = HistoryBackend::in_memory(HistoryConfig::default(), deps).unwrap();
        (backend, rx)
    }

    #[test]
    fn test_typed_link_reload_counts() {
        let (mut backend, _rx) = make_backend();
        let u = url("https://a.test/");
        let t0 = Utc::now();

        backend
            .add_page(&AddPageArgs::new(u.clone(), t0, PageTransition::TYPED))
            .unwrap();
        let row = backend.get_url(&u).unwrap().unwrap();
        assert_eq!((row.visit_count, row.typed_count), (1, 1));

        backend
            .add_page(&AddPageArgs::new(u.clone(), t0 + Duration::seconds(1), PageTransition::LINK))
            .unwrap();
        let row = backend.get_url(&u).unwrap().unwrap();
        assert_eq!((row.visit_count, row.typed_count), (2, 1));

        backend
            .add_page(&AddPageArgs::new(u.clone(), t0 + Duration::seconds(2), PageTransition::RELOAD))
            .unwrap();
        let (row, visits) = backend.query_url(&u, true).unwrap().unwrap();
        assert_eq!((row.visit_count, row.typed_count), (2, 1));
        assert_eq!(visits.len(), 3);
    }

    #[test]
    fn test_same_timestamp_gets_unique_times() {
        let (mut backend, _rx) = make_backend();
        let t = Utc::now();
        backend
            .add_page(&AddPageArgs::new(url("https://a.test/"), t, PageTransition::LINK))
            .unwrap();
        backend
            .add_page(&AddPageArgs::new(url("https://b.test/"), t, PageTransition::LINK))
            .unwrap();

        let a = backend.query_url(&url("https://a.test/"), true).unwrap().unwrap().1;
        let b = backend.query_url(&url("https://b.test/"), true).unwrap().unwrap().1;
        assert_eq!(
            b[0].visit_time.timestamp_micros(),
            a[0].visit_time.timestamp_micros() + 1
        );
    }

    #[test]
    fn test_subframe_rows_are_hidden_until_main_frame_visit() {
        let (mut backend, _rx) = make_backend();
        let frame = url("https://ads.test/frame");
        let t = Utc::now();
        backend
            .add_page(&AddPageArgs::new(frame.clone(), t, PageTransition::AUTO_SUBFRAME))
            .unwrap();
        assert!(backend.get_url(&frame).unwrap().unwrap().hidden);

        backend
            .add_page(&AddPageArgs::new(frame.clone(), t + Duration::seconds(1), PageTransition::LINK))
            .unwrap();
        assert!(!backend.get_url(&frame).unwrap().unwrap().hidden);
    }

    #[test]
    fn test_set_page_title_covers_redirect_chain() {
        let (mut backend, mut rx) = make_backend();
        let a = url("https://a.test/");
        let b = url("https://b.test/");
        let mut args = AddPageArgs::new(b.clone(), Utc::now(), PageTransition::TYPED);
        args.redirects = vec![a.clone(), b.clone()];
        backend.add_page(&args).unwrap();
        while rx.try_recv().is_ok() {}

        backend.set_page_title(&b, "Bee").unwrap();
        assert_eq!(backend.get_url(&a).unwrap().unwrap().title, "Bee");
        assert_eq!(backend.get_url(&b).unwrap().unwrap().title, "Bee");
        match rx.try_recv().unwrap() {
            // Only the first hop was typed.
            HistoryEvent::UrlsModified { changed_urls } => {
                assert_eq!(changed_urls.len(), 1);
                assert_eq!(changed_urls[0].url, a);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Same title again changes nothing.
        backend.set_page_title(&b, "Bee").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_add_pages_with_details_routes_old_rows_to_archive() {
        let (mut backend, _rx) = make_backend();
        let now = backend.now();

        let mut fresh = UrlRow::new(url("https://fresh.test/"));
        fresh.last_visit = Some(now - Duration::days(1));
        fresh.typed_count = 1;
        let mut old = UrlRow::new(url("https://old.test/"));
        old.last_visit = Some(now - Duration::days(200));

        backend
            .add_pages_with_details(&[fresh.clone(), old.clone()], VisitSource::Imported)
            .unwrap();

        let db = backend.history_db().unwrap();
        let row = db.get_row_for_url(&fresh.url).unwrap().unwrap();
        assert_eq!(db.visits_for_url(row.id).unwrap().len(), 1);
        assert!(db.get_row_for_url(&old.url).unwrap().is_none());

        let archived = backend.archived_db().unwrap();
        assert!(archived.get_row_for_url(&old.url).unwrap().is_some());
        assert!(backend.first_recorded_time() <= now - Duration::days(200));
    }

    #[test]
    fn test_synced_rows_get_no_visit() {
        let (mut backend, _rx) = make_backend();
        let mut row = UrlRow::new(url("https://synced.test/"));
        row.last_visit = Some(backend.now());
        backend
            .add_pages_with_details(&[row.clone()], VisitSource::Synced)
            .unwrap();

        let (stored, visits) = backend.query_url(&row.url, true).unwrap().unwrap();
        assert_eq!(stored.url, row.url);
        assert!(visits.is_empty());
    }

    #[test]
    fn test_keyword_terms_notify() {
        let (mut backend, mut rx) = make_backend();
        let u = url("https://search.test/?q=rust");
        backend
            .add_page(&AddPageArgs::new(u.clone(), Utc::now(), PageTransition::KEYWORD_GENERATED))
            .unwrap();
        while rx.try_recv().is_ok() {}

        backend.set_keyword_search_terms_for_url(&u, 3, "Rust").unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            HistoryEvent::KeywordSearchTermUpdated { keyword_id: 3, .. }
        ));
        let terms = backend.get_most_recent_keyword_search_terms(3, "ru", 10).unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].term, "Rust");

        backend.delete_all_search_terms_for_keyword(3).unwrap();
        assert!(backend
            .get_most_recent_keyword_search_terms(3, "ru", 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_bookmark_row_without_visit() {
        let (mut backend, _rx) = make_backend();
        let u = url("https://bookmarked.test/");
        backend.add_page_no_visit_for_bookmark(&u).unwrap();
        let (row, visits) = backend.query_url(&u, true).unwrap().unwrap();
        assert_eq!(row.visit_count, 0);
        assert!(row.hidden);
        assert!(visits.is_empty());
    }
}
