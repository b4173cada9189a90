//! Redirect chains: the recent-chain cache and walks over stored visits.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::error;
use url::Url;

use waypoint_core::error::Result;
use waypoint_core::types::VisitId;
use waypoint_storage::{UrlStore, VisitStore};

use crate::backend::HistoryBackend;

const DEFAULT_CAPACITY: usize = 32;

/// Recently recorded redirect chains keyed by their destination URL.
///
/// Used to spread titles and favicons over every hop of a navigation.
#[derive(Debug)]
pub struct RedirectCache {
    chains: LruCache<Url, Vec<Url>>,
}

impl RedirectCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or_else(|| unreachable!("redirect cache capacity must be non-zero"));
        Self {
            chains: LruCache::new(capacity),
        }
    }

    pub fn put(&mut self, destination: Url, chain: Vec<Url>) {
        self.chains.put(destination, chain);
    }

    pub fn get(&mut self, destination: &Url) -> Option<&Vec<Url>> {
        self.chains.get(destination)
    }

    /// The cached chain ending at `url`, or just `url` itself.
    pub fn chain_or_self(&mut self, url: &Url) -> Vec<Url> {
        match self.chains.get(url) {
            Some(chain) if !chain.is_empty() => chain.clone(),
            _ => vec![url.clone()],
        }
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

impl HistoryBackend {
    /// URLs reached by following redirects forward from the most recent visit
    /// to `url`. Empty when `url` has no visits.
    pub fn query_redirects_from(&self, url: &Url) -> Result<Vec<Url>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(row) = db.get_row_for_url(url)? else {
            return Ok(Vec::new());
        };
        match db.most_recent_visit_for_url(row.id)? {
            Some(visit) => self.redirects_from_visit(visit.id),
            None => Ok(Vec::new()),
        }
    }

    /// URLs that redirected to the most recent visit of `url`, nearest first.
    /// For A -> B -> C queried at C this is `[B, A]`.
    pub fn query_redirects_to(&self, url: &Url) -> Result<Vec<Url>> {
        let Some(db) = self.db.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(row) = db.get_row_for_url(url)? else {
            return Ok(Vec::new());
        };
        match db.most_recent_visit_for_url(row.id)? {
            Some(visit) => self.redirects_to_visit(visit.id),
            None => Ok(Vec::new()),
        }
    }

    /// Follow redirect hops forward from `start`.
    pub fn redirects_from_visit(&self, start: VisitId) -> Result<Vec<Url>> {
        let mut urls = Vec::new();
        let Some(db) = self.db.as_ref() else {
            return Ok(urls);
        };
        let mut seen = HashSet::from([start]);
        let mut current = start;
        while let Some(next) = db.redirect_from_visit(current)? {
            if !seen.insert(next.id) {
                error!(visit_id = %next.id, "Loop in redirect chain, giving up");
                break;
            }
            match db.get_url_row(next.url_id)? {
                Some(row) => urls.push(row.url),
                None => break,
            }
            current = next.id;
        }
        Ok(urls)
    }

    /// Follow redirect hops backward from `start`.
    pub fn redirects_to_visit(&self, start: VisitId) -> Result<Vec<Url>> {
        let mut urls = Vec::new();
        let Some(db) = self.db.as_ref() else {
            return Ok(urls);
        };
        let mut seen = HashSet::from([start]);
        let mut current = start;
        while let Some(previous) = db.redirect_to_visit(current)? {
            if !seen.insert(previous.id) {
                error!(visit_id = %previous.id, "Loop in redirect chain, giving up");
                break;
            }
            match db.get_url_row(previous.url_id)? {
                Some(row) => urls.push(row.url),
                None => break,
            }
            current = previous.id;
        }
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_chain_or_self() {
        let mut cache = RedirectCache::new(4);
        let dest = url("https://c.test/");
        assert_eq!(cache.chain_or_self(&dest), vec![dest.clone()]);

        let chain = vec![url("https://a.test/"), url("https://b.test/"), dest.clone()];
        cache.put(dest.clone(), chain.clone());
        assert_eq!(cache.chain_or_self(&dest), chain);
    }

    #[test]
    fn test_eviction_is_lru() {
        let mut cache = RedirectCache::new(2);
        let a = url("https://a.test/");
        let b = url("https://b.test/");
        let c = url("https://c.test/");
        cache.put(a.clone(), vec![a.clone()]);
        cache.put(b.clone(), vec![b.clone()]);
        // Touch `a` so `b` is the oldest.
        assert!(cache.get(&a).is_some());
        cache.put(c.clone(), vec![c.clone()]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&a).is_some());
    }

    #[test]
    fn test_zero_capacity_falls_back() {
        let mut cache = RedirectCache::new(0);
        let a = url("https://a.test/");
        cache.put(a.clone(), vec![a.clone()]);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
