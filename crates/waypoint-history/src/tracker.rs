//! Remembers recent visits per navigation scope so a new navigation can be
//! linked to the visit it came from.

use std::collections::HashMap;

use url::Url;

use waypoint_core::types::VisitId;

const MAX_ITEMS_PER_SCOPE: usize = 128;

#[derive(Debug, Clone)]
struct TrackedVisit {
    page_id: i32,
    url: Url,
    visit_id: VisitId,
}

/// Recent `(page id, url, visit)` triples, keyed by the scope that issued
/// the navigations (a tab, a window).
#[derive(Debug, Default)]
pub struct VisitTracker {
    scopes: HashMap<u64, Vec<TrackedVisit>>,
}

impl VisitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The visit that `referrer` most recently resolved to in `scope`, at or
    /// before `page_id`. Zero when there is no referrer or no match.
    pub fn get_last_visit(&self, scope: u64, page_id: i32, referrer: Option<&Url>) -> VisitId {
        let Some(referrer) = referrer else {
            return VisitId::default();
        };
        self.scopes
            .get(&scope)
            .and_then(|visits| {
                visits
                    .iter()
                    .rev()
                    .find(|v| v.page_id <= page_id && &v.url == referrer)
            })
            .map(|v| v.visit_id)
            .unwrap_or_default()
    }

    pub fn add_visit(&mut self, scope: u64, page_id: i32, url: &Url, visit_id: VisitId) {
        let visits = self.scopes.entry(scope).or_default();
        visits.push(TrackedVisit {
            page_id,
            url: url.clone(),
            visit_id,
        });
        if visits.len() > MAX_ITEMS_PER_SCOPE {
            visits.drain(..MAX_ITEMS_PER_SCOPE / 2);
        }
    }

    /// Forget everything recorded for `scope`.
    pub fn clear_scope(&mut self, scope: u64) {
        self.scopes.remove(&scope);
    }

    pub fn scope_len(&self, scope: u64) -> usize {
        self.scopes.get(&scope).map_or(0, Vec::len)
    }
}
