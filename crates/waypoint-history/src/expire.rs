//! Removing history: archival of old visits, targeted deletes and the full
//! wipe.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use url::Url;

use waypoint_core::error::Result;
use waypoint_core::events::HistoryEvent;
use waypoint_core::types::{IconId, PageTransition, SegmentId, UrlId, UrlRow, VisitId, VisitRow};
use waypoint_storage::{StoreHandle, UrlStore, VisitStore};

use crate::backend::HistoryBackend;

/// How many counted visits each URL lost.
#[derive(Debug, Default, Clone, Copy)]
struct CountDelta {
    visits: u32,
    typed: u32,
}

fn count_deltas(visits: &[VisitRow]) -> BTreeMap<UrlId, CountDelta> {
    let mut deltas: BTreeMap<UrlId, CountDelta> = BTreeMap::new();
    for visit in visits {
        let delta = deltas.entry(visit.url_id).or_default();
        let core = visit.transition.core();
        if core != PageTransition::RELOAD {
            delta.visits += 1;
        }
        if (core == PageTransition::TYPED && !visit.transition.is_redirect())
            || core == PageTransition::KEYWORD_GENERATED
        {
            delta.typed += 1;
        }
    }
    deltas
}

impl HistoryBackend {
    // =========================================================================
    // Archival
    // =========================================================================

    /// Move one batch of visits older than the archive threshold into the
    /// archived store. Returns how many visits moved.
    pub fn archive_old_visits(&mut self) -> Result<usize> {
        let cutoff = self.archive_cutoff();
        let (Some(db), Some(archived)) = (self.db.as_ref(), self.archived.as_ref()) else {
            return Ok(0);
        };
        let batch = db.visits_before(cutoff, self.config.archive_batch_size)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut url_ids: HashMap<UrlId, UrlId> = HashMap::new();
        let mut visit_ids: HashMap<VisitId, VisitId> = HashMap::new();
        for visit in &batch {
            let archived_url_id = match url_ids.get(&visit.url_id) {
                Some(id) => *id,
                None => {
                    let Some(row) = db.get_url_row(visit.url_id)? else {
                        debug!(visit_id = %visit.id, "Dropping visit of a missing url");
                        db.delete_visit(visit.id)?;
                        continue;
                    };
                    let id = match archived.get_row_for_url(&row.url)? {
                        Some(mut existing) => {
                            existing.title = row.title.clone();
                            existing.visit_count = row.visit_count;
                            existing.typed_count = row.typed_count;
                            existing.last_visit = existing.last_visit.max(row.last_visit);
                            existing.hidden = row.hidden;
                            archived.update_url_row(&existing)?;
                            existing.id
                        }
                        None => archived.add_url(&row)?,
                    };
                    url_ids.insert(visit.url_id, id);
                    id
                }
            };

            let mut moved = visit.clone();
            moved.url_id = archived_url_id;
            moved.referring_visit = visit_ids
                .get(&visit.referring_visit)
                .copied()
                .unwrap_or_default();
            moved.segment_id = SegmentId::default();
            let archived_id = archived.add_visit(&moved)?;
            visit_ids.insert(visit.id, archived_id);
            db.delete_visit(visit.id)?;
        }

        let deleted = self.fix_up_urls_after_visit_removal(&batch)?;
        let moved = batch.len();
        info!(
            visits_archived = moved,
            urls_deleted = deleted.len(),
            "Archived old visits"
        );
        if !deleted.is_empty() {
            self.notify(HistoryEvent::UrlsDeleted {
                all_history: false,
                urls: deleted,
            });
        }
        self.schedule_commit();
        Ok(moved)
    }

    /// Update the rows that just lost `removed` visits from the primary
    /// store. Rows left without visits are purged unless bookmarked.
    /// Returns the purged URLs.
    fn fix_up_urls_after_visit_removal(&self, removed: &[VisitRow]) -> Result<BTreeSet<Url>> {
        let mut deleted = BTreeSet::new();
        let Some(db) = self.db.as_ref() else {
            return Ok(deleted);
        };
        for (url_id, delta) in count_deltas(removed) {
            let Some(mut row) = db.get_url_row(url_id)? else {
                continue;
            };
            match db.most_recent_visit_for_url(url_id)? {
                Some(latest) => {
                    row.visit_count = row.visit_count.saturating_sub(delta.visits);
                    row.typed_count = row.typed_count.saturating_sub(delta.typed);
                    row.last_visit = Some(latest.visit_time);
                    db.update_url_row(&row)?;
                }
                None if self.bookmarks.is_bookmarked(&row.url) => {
                    row.visit_count = 0;
                    row.typed_count = 0;
                    row.last_visit = None;
                    db.update_url_row(&row)?;
                }
                None => {
                    self.purge_url_row(&row)?;
                    deleted.insert(row.url);
                }
            }
        }
        Ok(deleted)
    }

    /// Delete a row from the primary store together with its segment,
    /// keyword terms, icon mappings, orphaned icons and thumbnail.
    fn purge_url_row(&self, row: &UrlRow) -> Result<()> {
        if let Some(db) = self.db.as_ref() {
            db.delete_segment_for_url(row.id)?;
            db.delete_keyword_search_terms_for_url(row.id)?;
            db.delete_url_row(row.id)?;
        }
        self.delete_favicon_data_for_page(&row.url)
    }

    fn delete_favicon_data_for_page(&self, page_url: &Url) -> Result<()> {
        let Some(thumbnails) = self.thumbnails.as_ref() else {
            return Ok(());
        };
        let icons: BTreeSet<IconId> = thumbnails.delete_icon_mappings(page_url)?.into_iter().collect();
        for icon_id in icons {
            thumbnails.delete_favicon_if_orphaned(icon_id)?;
        }
        thumbnails.delete_thumbnail(page_url)
    }

    // =========================================================================
    // Targeted deletes
    // =========================================================================

    /// Remove `url` from every store. Bookmarked URLs lose their visits but
    /// keep a zeroed row and their icons. Returns whether the URL was
    /// removed outright.
    fn delete_one_url(&mut self, url: &Url) -> Result<bool> {
        let bookmarked = self.bookmarks.is_bookmarked(url);
        let mut found = false;

        if let Some(db) = self.db.as_ref() {
            if let Some(mut row) = db.get_row_for_url(url)? {
                found = true;
                for visit in db.visits_for_url(row.id)? {
                    db.delete_visit(visit.id)?;
                }
                if bookmarked {
                    row.visit_count = 0;
                    row.typed_count = 0;
                    row.last_visit = None;
                    db.update_url_row(&row)?;
                } else {
                    db.delete_segment_for_url(row.id)?;
                    db.delete_keyword_search_terms_for_url(row.id)?;
                    db.delete_url_row(row.id)?;
                }
            }
        }

        if let Some(archived) = self.archived.as_ref() {
            if let Some(row) = archived.get_row_for_url(url)? {
                found = true;
                for visit in archived.visits_for_url(row.id)? {
                    archived.delete_visit(visit.id)?;
                }
                archived.delete_url_row(row.id)?;
            }
        }

        if let Some(index) = self.text_index.as_mut() {
            index.delete_url(url)?;
        }

        if bookmarked {
            return Ok(false);
        }
        self.delete_favicon_data_for_page(url)?;
        Ok(found)
    }

    /// Delete everything about `url` and commit right away.
    pub fn delete_url(&mut self, url: &Url) -> Result<()> {
        self.delete_urls(std::slice::from_ref(url))
    }

    /// Delete everything about each URL and commit right away. Unknown URLs
    /// are ignored.
    pub fn delete_urls(&mut self, urls: &[Url]) -> Result<()> {
        if self.db.is_none() {
            return Ok(());
        }
        let mut deleted = BTreeSet::new();
        for url in urls {
            if self.delete_one_url(url)? {
                deleted.insert(url.clone());
            }
        }
        if !deleted.is_empty() {
            info!(urls = deleted.len(), "URLs deleted from history");
            self.notify(HistoryEvent::UrlsDeleted {
                all_history: false,
                urls: deleted,
            });
        }
        self.refresh_first_recorded_time()?;
        self.commit()
    }

    /// Delete the visits in `[begin, end)`, limited to `restrict_urls` when
    /// it is non-empty, and commit right away. With no bounds and no
    /// restriction this is a full wipe.
    pub fn expire_history_between(
        &mut self,
        restrict_urls: &BTreeSet<Url>,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if self.db.is_none() {
            return Ok(());
        }
        if begin.is_none() && end.is_none() && restrict_urls.is_empty() {
            return self.delete_all_history();
        }

        let visits = match self.db.as_ref() {
            Some(db) => {
                let restrict_ids: BTreeSet<UrlId> = restrict_urls
                    .iter()
                    .filter_map(|url| db.get_row_for_url(url).transpose())
                    .map(|row| row.map(|row| row.id))
                    .collect::<Result<_>>()?;
                // A restriction that resolves to no rows matches no visits.
                db.visits_in_range(begin, end)?
                    .into_iter()
                    .filter(|v| restrict_urls.is_empty() || restrict_ids.contains(&v.url_id))
                    .collect::<Vec<_>>()
            }
            None => Vec::new(),
        };
        self.expire_visits(&visits)?;
        self.expire_archived_between(restrict_urls, begin, end)?;

        if let Some(index) = self.text_index.as_mut() {
            if restrict_urls.is_empty() {
                index.delete_range(begin, end)?;
            } else {
                for url in restrict_urls {
                    index.delete_url(url)?;
                }
            }
        }

        self.refresh_first_recorded_time()?;
        self.commit()
    }

    fn expire_archived_between(
        &self,
        restrict_urls: &BTreeSet<Url>,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let Some(archived) = self.archived.as_ref() else {
            return Ok(());
        };
        let mut touched = BTreeSet::new();
        for visit in archived.visits_in_range(begin, end)? {
            if !restrict_urls.is_empty() {
                let Some(row) = archived.get_url_row(visit.url_id)? else {
                    continue;
                };
                if !restrict_urls.contains(&row.url) {
                    continue;
                }
            }
            archived.delete_visit(visit.id)?;
            touched.insert(visit.url_id);
        }
        for url_id in touched {
            if archived.most_recent_visit_for_url(url_id)?.is_none() {
                archived.delete_url_row(url_id)?;
            }
        }
        Ok(())
    }

    fn expire_visits(&mut self, visits: &[VisitRow]) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        for visit in visits {
            db.delete_visit(visit.id)?;
        }
        let deleted = self.fix_up_urls_after_visit_removal(visits)?;
        if let Some(index) = self.text_index.as_mut() {
            for url in &deleted {
                index.delete_url(url)?;
            }
        }
        if !deleted.is_empty() {
            self.notify(HistoryEvent::UrlsDeleted {
                all_history: false,
                urls: deleted,
            });
        }
        Ok(())
    }

    /// Delete specific visits. Returns false when history is unavailable.
    pub fn remove_visits(&mut self, visits: &[VisitRow]) -> Result<bool> {
        if self.db.is_none() {
            return Ok(false);
        }
        self.expire_visits(visits)?;
        self.schedule_commit();
        Ok(true)
    }

    /// Drop rows that only existed because they were bookmarked.
    pub fn urls_no_longer_bookmarked(&mut self, urls: &BTreeSet<Url>) -> Result<()> {
        let mut deleted = BTreeSet::new();
        for url in urls {
            let orphan = match self.db.as_ref() {
                Some(db) => match db.get_row_for_url(url)? {
                    Some(row) => db.visits_for_url(row.id)?.is_empty().then_some(row),
                    None => None,
                },
                None => return Ok(()),
            };
            if let Some(row) = orphan {
                self.purge_url_row(&row)?;
                deleted.insert(row.url);
            }
        }
        if !deleted.is_empty() {
            self.notify(HistoryEvent::UrlsDeleted {
                all_history: false,
                urls: deleted,
            });
        }
        self.schedule_commit();
        Ok(())
    }

    // =========================================================================
    // Full wipe
    // =========================================================================

    /// Delete all history. Bookmarked URLs survive with zeroed counters and
    /// keep their icons; everything else, including the archived store and
    /// the text index, is emptied and the files vacuumed.
    pub fn delete_all_history(&mut self) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };

        let mut kept = Vec::new();
        for url in self.bookmarks.bookmarked_urls() {
            if let Some(mut row) = db.get_row_for_url(&url)? {
                row.visit_count = 0;
                row.typed_count = 0;
                row.last_visit = None;
                kept.push(row);
            }
        }

        if let Some(thumbnails) = self.thumbnails.as_ref() {
            thumbnails.init_temporary_tables()?;
            let mut copied: HashMap<IconId, IconId> = HashMap::new();
            for row in &kept {
                for mapping in thumbnails.icon_mappings_for_page_url(&row.url)? {
                    let icon_id = match copied.get(&mapping.icon_id) {
                        Some(id) => *id,
                        None => {
                            let id = thumbnails.copy_to_temporary_favicon_table(mapping.icon_id)?;
                            copied.insert(mapping.icon_id, id);
                            id
                        }
                    };
                    thumbnails.add_to_temporary_icon_mapping_table(
                        &row.url,
                        icon_id,
                        mapping.icon_type,
                    )?;
                }
            }
            thumbnails.commit_temporary_tables()?;
            thumbnails.recreate_thumbnail_table()?;
            let store = thumbnails.database();
            store.commit_transaction()?;
            store.vacuum()?;
            store.begin_transaction()?;
        }

        db.begin_temporary_url_table()?;
        for row in &kept {
            db.add_temporary_url(row)?;
        }
        db.commit_temporary_url_table()?;
        db.recreate_all_tables_but_url()?;
        let store = db.database();
        store.commit_transaction()?;
        store.vacuum()?;
        store.begin_transaction()?;

        if let Some(archived) = self.archived.as_ref() {
            archived.recreate_tables()?;
            let store = archived.database();
            store.commit_transaction()?;
            store.vacuum()?;
            store.begin_transaction()?;
        }

        if let Some(index) = self.text_index.as_mut() {
            index.commit_transaction()?;
            index.delete_all()?;
            index.begin_transaction()?;
        }

        self.redirects.clear();
        self.refresh_first_recorded_time()?;
        info!(kept_urls = kept.len(), "All history deleted");
        self.notify(HistoryEvent::UrlsDeleted {
            all_history: true,
            urls: BTreeSet::new(),
        });
        self.commit()
    }
}
