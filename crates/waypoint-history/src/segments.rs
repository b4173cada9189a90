//! Most-visited segments: grouping visits by normalized URL and ranking them.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};
use url::Url;

use waypoint_core::error::Result;
use waypoint_core::types::{MostVisitedUrl, PageTransition, PageUsageData, SegmentId, VisitId};
use waypoint_storage::{compute_segment_name, UrlStore, VisitStore};

use crate::backend::HistoryBackend;

impl HistoryBackend {
    /// Attribute the main-frame visit `visit_id` to a segment and count it.
    ///
    /// Typed and bookmark navigations start (or refresh) the segment named
    /// after their URL; everything else inherits the segment of the visit
    /// that led to it.
    pub(crate) fn update_segments(
        &self,
        url: &Url,
        from_visit: VisitId,
        visit_id: VisitId,
        transition: PageTransition,
        time: DateTime<Utc>,
    ) -> Result<Option<SegmentId>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(None);
        };
        if !visit_id.is_set() || !transition.is_main_frame() {
            return Ok(None);
        }
        let core = transition.core();
        if core == PageTransition::KEYWORD_GENERATED || core == PageTransition::RELOAD {
            return Ok(None);
        }

        let segment_id = if core == PageTransition::TYPED || core == PageTransition::AUTO_BOOKMARK {
            let Some(row) = db.get_row_for_url(url)? else {
                return Ok(None);
            };
            let name = compute_segment_name(url);
            match db.segment_id_for_name(&name)? {
                Some(id) => {
                    db.update_segment_representation_url(id, row.id)?;
                    id
                }
                None => {
                    let id = db.create_segment(row.id, &name)?;
                    debug!(segment_id = %id, name = %name, "Segment created");
                    id
                }
            }
        } else {
            match self.last_segment_id(from_visit)? {
                Some(id) => id,
                None => return Ok(None),
            }
        };

        if let Some(mut visit) = db.get_visit_row(visit_id)? {
            visit.segment_id = segment_id;
            db.update_visit_row(&visit)?;
        }
        db.increase_segment_visit_count(segment_id, time, 1)?;
        Ok(Some(segment_id))
    }

    /// Walk referrers back from `from_visit` to the nearest visit that has a
    /// segment.
    fn last_segment_id(&self, from_visit: VisitId) -> Result<Option<SegmentId>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(None);
        };
        let mut seen = HashSet::new();
        let mut current = from_visit;
        while current.is_set() {
            if !seen.insert(current) {
                error!(visit_id = %current, "Loop in referrer chain, giving up");
                return Ok(None);
            }
            let Some(visit) = db.get_visit_row(current)? else {
                return Ok(None);
            };
            if visit.segment_id.is_set() {
                return Ok(Some(visit.segment_id));
            }
            current = visit.referring_visit;
        }
        Ok(None)
    }

    /// Segments ranked by recency-weighted usage since `from_time`.
    ///
    /// The first call also queues the retention sweep of old counters, which
    /// runs once this request has been answered.
    pub fn query_segment_usage(
        &mut self,
        from_time: DateTime<Utc>,
        max_results: usize,
    ) -> Result<Vec<PageUsageData>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(Vec::new());
        };
        let usage = db.query_segment_usage(from_time, max_results, self.now())?;
        if !self.segment_queried {
            self.segment_queried = true;
            self.segment_sweep_pending = true;
        }
        Ok(usage)
    }

    /// Drop per-day counters older than the retention window.
    pub fn delete_old_segment_data(&mut self) -> Result<usize> {
        let Some(db) = self.db.as_ref() else {
            return Ok(0);
        };
        let cutoff = self.now() - self.config.segment_retention();
        let deleted = db.delete_segment_data_older_than(cutoff)?;
        if deleted > 0 {
            info!(rows = deleted, "Old segment usage swept");
            self.schedule_commit();
        }
        Ok(deleted)
    }

    /// Pin a segment at a position of the most-visited list.
    pub fn set_segment_presentation_index(
        &mut self,
        segment_id: SegmentId,
        index: i32,
    ) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        db.set_segment_presentation_index(segment_id, index)?;
        self.schedule_commit();
        Ok(())
    }

    /// The `count` most used pages of the last `days_back` days with the
    /// redirects each one leads through.
    pub fn query_most_visited_urls(
        &self,
        count: usize,
        days_back: i64,
    ) -> Result<Vec<MostVisitedUrl>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(Vec::new());
        };
        let now = self.now();
        let usage = db.query_segment_usage(now - Duration::days(days_back), count, now)?;

        let mut result = Vec::with_capacity(usage.len());
        for page in usage {
            let mut redirects = self.query_redirects_from(&page.url)?;
            if redirects.last() != Some(&page.url) {
                redirects.push(page.url.clone());
            }
            result.push(MostVisitedUrl {
                url: page.url,
                title: page.title,
                redirects,
            });
        }
        Ok(result)
    }
}
