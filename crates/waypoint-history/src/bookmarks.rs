//! Bookmark lookups consulted when deleting history.

use std::collections::BTreeSet;
use std::sync::Mutex;

use url::Url;

/// Answers whether a URL is bookmarked. Bookmarked URLs survive expiry and
/// full wipes with their visit counts reset.
pub trait BookmarkService: Send + Sync {
    fn is_bookmarked(&self, url: &Url) -> bool;

    fn bookmarked_urls(&self) -> Vec<Url>;
}

/// A bookmark set held in memory.
#[derive(Debug, Default)]
pub struct InMemoryBookmarks {
    urls: Mutex<BTreeSet<Url>>,
}

impl InMemoryBookmarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: Url) {
        self.lock().insert(url);
    }

    pub fn remove(&self, url: &Url) -> bool {
        self.lock().remove(url)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<Url>> {
        match self.urls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl FromIterator<Url> for InMemoryBookmarks {
    fn from_iter<I: IntoIterator<Item = Url>>(iter: I) -> Self {
        Self {
            urls: Mutex::new(iter.into_iter().collect()),
        }
    }
}

impl BookmarkService for InMemoryBookmarks {
    fn is_bookmarked(&self, url: &Url) -> bool {
        self.lock().contains(url)
    }

    fn bookmarked_urls(&self) -> Vec<Url> {
        self.lock().iter().cloned().collect()
    }
}
