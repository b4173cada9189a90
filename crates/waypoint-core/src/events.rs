use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{PageTransition, UrlRow};

/// Change notifications broadcast by the history engine.
///
/// Delivery is fire-and-forget: observers receive an owned copy and the
/// engine never waits for them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum HistoryEvent {
    /// A visit was recorded for `row`.
    UrlVisited {
        row: UrlRow,
        transition: PageTransition,
        visit_time: DateTime<Utc>,
    },

    /// Rows changed outside of a visit (title updates, imports).
    UrlsModified { changed_urls: Vec<UrlRow> },

    /// Rows were removed. `all_history` marks a full wipe, in which case
    /// `urls` is empty.
    UrlsDeleted {
        all_history: bool,
        urls: BTreeSet<Url>,
    },

    /// The icons mapped to these pages changed.
    FaviconChanged { urls: BTreeSet<Url> },

    /// A keyword search term was recorded for `row`.
    KeywordSearchTermUpdated {
        row: UrlRow,
        keyword_id: i64,
        term: String,
    },

    /// The primary store could not be opened; history is unavailable.
    ProfileError { store: String, reason: String },
}

impl HistoryEvent {
    /// Returns the event name as a string (for logging and observers).
    pub fn event_name(&self) -> &'static str {
        match self {
            HistoryEvent::UrlVisited { .. } => "url_visited",
            HistoryEvent::UrlsModified { .. } => "urls_modified",
            HistoryEvent::UrlsDeleted { .. } => "urls_deleted",
            HistoryEvent::FaviconChanged { .. } => "favicon_changed",
            HistoryEvent::KeywordSearchTermUpdated { .. } => "keyword_search_term_updated",
            HistoryEvent::ProfileError { .. } => "profile_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let deleted = HistoryEvent::UrlsDeleted {
            all_history: true,
            urls: BTreeSet::new(),
        };
        assert_eq!(deleted.event_name(), "urls_deleted");

        let favicon = HistoryEvent::FaviconChanged {
            urls: BTreeSet::new(),
        };
        assert_eq!(favicon.event_name(), "favicon_changed");
    }

    #[test]
    fn test_event_serializes_to_json() {
        let url = Url::parse("https://example.test/").unwrap();
        let event = HistoryEvent::UrlVisited {
            row: UrlRow::new(url),
            transition: PageTransition::TYPED,
            visit_time: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("UrlVisited"));
        assert!(json.contains("https://example.test/"));
    }
}
