//! History queries over the primary and archived stores and the text index.

use std::collections::HashSet;

use tracing::debug;

use waypoint_core::error::Result;
use waypoint_core::types::{QueryOptions, QueryResults, UrlResult};
use waypoint_storage::{HistoryDatabase, UrlStore, VisitStore};

use crate::backend::HistoryBackend;

impl HistoryBackend {
    /// Visible history matching `text_query`, newest first and one entry
    /// per URL. An empty query lists visits in the time window; anything
    /// else is a full-text search.
    pub fn query_history(&self, text_query: &str, options: &QueryOptions) -> Result<QueryResults> {
        let mut results = QueryResults::default();
        let Some(db) = self.db.as_ref() else {
            return Ok(results);
        };

        if text_query.trim().is_empty() {
            self.query_history_basic(db, options, &mut results)?;
        } else {
            self.query_history_text(db, text_query, options, &mut results)?;
        }

        debug!(
            results = results.len(),
            reached_beginning = results.reached_beginning,
            "History query answered"
        );
        Ok(results)
    }

    fn reached_beginning(&self, options: &QueryOptions) -> bool {
        options
            .begin_time
            .map_or(true, |begin| begin <= self.first_recorded_time)
    }

    fn query_history_basic(
        &self,
        db: &HistoryDatabase,
        options: &QueryOptions,
        results: &mut QueryResults,
    ) -> Result<()> {
        let mut matches = Vec::new();

        for visit in db.visible_visits_in_range(options.begin_time, options.end_time, options.max_count)? {
            match db.get_url_row(visit.url_id)? {
                Some(row) => matches.push(UrlResult::new(row, visit.visit_time)),
                None => debug!(visit_id = %visit.id, "Visible visit without a url row"),
            }
        }

        let reaches_archive = options
            .begin_time
            .map_or(true, |begin| begin < self.archive_cutoff());
        if let (Some(archived), true) = (self.archived.as_ref(), reaches_archive) {
            for visit in archived.visible_visits_in_range(
                options.begin_time,
                options.end_time,
                options.max_count,
            )? {
                let Some(mut row) = archived.get_url_row(visit.url_id)? else {
                    continue;
                };
                // The primary store has the current title and counters.
                if let Some(current) = db.get_row_for_url(&row.url)? {
                    row = current;
                }
                matches.push(UrlResult::new(row, visit.visit_time));
            }
        }

        matches.sort_by(|a, b| b.visit_time.cmp(&a.visit_time));
        let mut seen = HashSet::new();
        for result in matches {
            if options.remaining(results.len()) == Some(0) {
                break;
            }
            if seen.insert(result.row.url.clone()) {
                results.results.push(result);
            }
        }

        results.reached_beginning = self.reached_beginning(options);
        Ok(())
    }

    fn query_history_text(
        &self,
        db: &HistoryDatabase,
        text_query: &str,
        options: &QueryOptions,
        results: &mut QueryResults,
    ) -> Result<()> {
        let Some(index) = self.text_index.as_ref() else {
            debug!("Text query without a text index");
            return Ok(());
        };
        let matches = index.get_text_matches(text_query, options)?;

        let mut seen = HashSet::new();
        for text_match in matches.matches {
            if options.remaining(results.len()) == Some(0) {
                break;
            }
            if !seen.insert(text_match.url.clone()) {
                continue;
            }
            let row = match db.get_row_for_url(&text_match.url)? {
                Some(row) => row,
                None => match self.archived.as_ref() {
                    Some(archived) => match archived.get_row_for_url(&text_match.url)? {
                        Some(row) => row,
                        None => {
                            debug!(url = %text_match.url, "Text match without a history row");
                            continue;
                        }
                    },
                    None => continue,
                },
            };
            let mut result = UrlResult::new(row, text_match.time);
            result.row.title = text_match.title;
            result.snippet = text_match.snippet;
            result.title_matches = text_match.title_match_positions;
            results.results.push(result);
        }

        results.reached_beginning = self.reached_beginning(options);
        Ok(())
    }
}
