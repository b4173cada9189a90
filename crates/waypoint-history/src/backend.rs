//! The history engine: owns every store and performs all reads and writes.
//!
//! A `HistoryBackend` is driven from a single task (see `service.rs`); its
//! methods assume serialized, non-reentrant calls. Each store keeps one
//! long-running transaction open which `commit` checkpoints.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use waypoint_core::clock::{Clock, SystemClock};
use waypoint_core::config::HistoryConfig;
use waypoint_core::error::Result;
use waypoint_core::events::HistoryEvent;
use waypoint_storage::{
    ArchivedDatabase, Database, FtsTextIndex, HistoryDatabase, StoreHandle, StoreSchema, TextIndex,
    ThumbnailDatabase, VisitStore,
};

use crate::bookmarks::{BookmarkService, InMemoryBookmarks};
use crate::commit::CommitScheduler;
use crate::notify::{NotificationSink, NullSink};
use crate::redirects::RedirectCache;
use crate::tracker::VisitTracker;

/// Collaborators injected into the engine by its host.
#[derive(Clone)]
pub struct HistoryDeps {
    pub sink: Arc<dyn NotificationSink>,
    pub bookmarks: Arc<dyn BookmarkService>,
    pub clock: Arc<dyn Clock>,
}

impl HistoryDeps {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        bookmarks: Arc<dyn BookmarkService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sink,
            bookmarks,
            clock,
        }
    }

    /// No observers, no bookmarks, wall-clock time.
    pub fn detached() -> Self {
        Self {
            sink: Arc::new(NullSink),
            bookmarks: Arc::new(InMemoryBookmarks::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

/// The set of stores a backend runs on. Any of them may be missing.
#[derive(Default)]
pub struct HistoryStores {
    pub history: Option<HistoryDatabase>,
    pub archived: Option<ArchivedDatabase>,
    pub thumbnails: Option<ThumbnailDatabase>,
    pub text_index: Option<Box<dyn TextIndex>>,
}

impl HistoryStores {
    /// Fresh in-memory stores, mainly for tests.
    pub fn in_memory(with_text_index: bool) -> Result<Self> {
        let text_index: Option<Box<dyn TextIndex>> = if with_text_index {
            Some(Box::new(FtsTextIndex::in_memory()?))
        } else {
            None
        };
        Ok(Self {
            history: Some(HistoryDatabase::in_memory()?),
            archived: Some(ArchivedDatabase::in_memory()?),
            thumbnails: Some(ThumbnailDatabase::in_memory()?),
            text_index,
        })
    }
}

pub struct HistoryBackend {
    pub(crate) config: HistoryConfig,
    pub(crate) db: Option<HistoryDatabase>,
    pub(crate) archived: Option<ArchivedDatabase>,
    pub(crate) thumbnails: Option<ThumbnailDatabase>,
    pub(crate) text_index: Option<Box<dyn TextIndex>>,
    sink: Option<Arc<dyn NotificationSink>>,
    pub(crate) bookmarks: Arc<dyn BookmarkService>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) redirects: RedirectCache,
    pub(crate) tracker: VisitTracker,
    pub(crate) commits: CommitScheduler,
    /// Time of the oldest visit in any store.
    pub(crate) first_recorded_time: DateTime<Utc>,
    pub(crate) last_requested_time: Option<DateTime<Utc>>,
    pub(crate) last_recorded_time: Option<DateTime<Utc>>,
    /// Set after the first segment query; the retention sweep runs once.
    pub(crate) segment_queried: bool,
    /// The retention sweep waiting to run after the current request.
    pub(crate) segment_sweep_pending: bool,
}

impl HistoryBackend {
    /// Open the stores in `dir`.
    ///
    /// Never fails: a missing auxiliary store leaves the engine degraded, and
    /// a missing primary store leaves it unloaded after reporting a
    /// `ProfileError`.
    pub fn open(dir: &Path, config: HistoryConfig, deps: HistoryDeps) -> Self {
        let mut stores = HistoryStores::default();

        let history_path = dir.join(StoreSchema::History.file_name());
        match HistoryDatabase::open(&history_path) {
            Ok(db) => stores.history = Some(db),
            Err(e) => {
                error!(store = StoreSchema::History.name(), "Failed to open history: {}", e);
                deps.sink.notify(HistoryEvent::ProfileError {
                    store: StoreSchema::History.name().to_string(),
                    reason: e.to_string(),
                });
                return Self::with_stores(config, stores, deps);
            }
        }

        match ArchivedDatabase::open(&dir.join(StoreSchema::Archived.file_name())) {
            Ok(db) => stores.archived = Some(db),
            Err(e) => warn!("Could not open the archived store, running without it: {}", e),
        }

        match ThumbnailDatabase::open(&dir.join(StoreSchema::Thumbnail.file_name())) {
            Ok(db) => stores.thumbnails = Some(db),
            Err(e) => warn!("Could not open the favicon store, running without it: {}", e),
        }

        if config.text_index_enabled {
            match FtsTextIndex::open(&dir.join(StoreSchema::TextIndex.file_name())) {
                Ok(index) => stores.text_index = Some(Box::new(index)),
                Err(e) => warn!("Text index initialization failed, running without it: {}", e),
            }
        }

        Self::with_stores(config, stores, deps)
    }

    /// A backend over fresh in-memory stores.
    pub fn in_memory(config: HistoryConfig, deps: HistoryDeps) -> Result<Self> {
        let stores = HistoryStores::in_memory(config.text_index_enabled)?;
        Ok(Self::with_stores(config, stores, deps))
    }

    pub fn with_stores(config: HistoryConfig, stores: HistoryStores, deps: HistoryDeps) -> Self {
        let now = deps.clock.now();
        let mut backend = Self {
            redirects: RedirectCache::new(config.max_redirect_chains),
            commits: CommitScheduler::new(config.commit_interval()),
            config,
            db: stores.history,
            archived: stores.archived,
            thumbnails: stores.thumbnails,
            text_index: stores.text_index,
            sink: Some(deps.sink),
            bookmarks: deps.bookmarks,
            clock: deps.clock,
            tracker: VisitTracker::new(),
            first_recorded_time: now,
            last_requested_time: None,
            last_recorded_time: None,
            segment_queried: false,
            segment_sweep_pending: false,
        };
        if let Err(e) = backend.init() {
            warn!("History initialization incomplete: {}", e);
        }
        backend
    }

    fn init(&mut self) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };

        db.database().begin_transaction()?;
        if let Some(thumbnails) = self.thumbnails.as_ref() {
            thumbnails.database().begin_transaction()?;
        }
        if let Some(archived) = self.archived.as_ref() {
            archived.database().begin_transaction()?;
        }
        if let Some(index) = self.text_index.as_mut() {
            index.begin_transaction()?;
        }

        let cleaned = db.clean_up_in_progress_entries()?;
        if cleaned > 0 {
            info!(downloads = cleaned, "Interrupted downloads marked cancelled");
        }

        self.refresh_first_recorded_time()?;

        info!(
            archived = self.archived.is_some(),
            favicons = self.thumbnails.is_some(),
            text_index = self.text_index.is_some(),
            "History backend loaded"
        );
        Ok(())
    }

    /// Recompute the oldest visit time across the stores.
    pub(crate) fn refresh_first_recorded_time(&mut self) -> Result<()> {
        let mut first = None;
        if let Some(db) = self.db.as_ref() {
            first = db.first_visit_time()?;
        }
        if let Some(archived) = self.archived.as_ref() {
            if let Some(t) = archived.first_visit_time()? {
                first = Some(first.map_or(t, |f: DateTime<Utc>| f.min(t)));
            }
        }
        self.first_recorded_time = first.unwrap_or_else(|| self.clock.now());
        Ok(())
    }

    pub(crate) fn lower_first_recorded_time(&mut self, time: DateTime<Utc>) {
        if time < self.first_recorded_time {
            self.first_recorded_time = time;
        }
    }

    /// Whether the primary store is available.
    pub fn is_loaded(&self) -> bool {
        self.db.is_some()
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn first_recorded_time(&self) -> DateTime<Utc> {
        self.first_recorded_time
    }

    pub fn history_db(&self) -> Option<&HistoryDatabase> {
        self.db.as_ref()
    }

    pub fn archived_db(&self) -> Option<&ArchivedDatabase> {
        self.archived.as_ref()
    }

    pub fn thumbnail_db(&self) -> Option<&ThumbnailDatabase> {
        self.thumbnails.as_ref()
    }

    pub fn commit_scheduler(&self) -> &CommitScheduler {
        &self.commits
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Visits older than this belong in the archived store.
    pub fn archive_cutoff(&self) -> DateTime<Utc> {
        self.now() - self.config.archive_threshold()
    }

    pub(crate) fn notify(&self, event: HistoryEvent) {
        match self.sink.as_ref() {
            Some(sink) => sink.notify(event),
            None => debug!(event = event.event_name(), "Notification dropped after close"),
        }
    }

    /// Forget the navigation history of a tab or other page owner.
    pub fn clear_scope(&mut self, scope: u64) {
        self.tracker.clear_scope(scope);
    }

    // =========================================================================
    // Commits
    // =========================================================================

    /// Arm the deferred commit if none is pending.
    pub fn schedule_commit(&mut self) {
        if self.commits.schedule() {
            debug!("Commit scheduled");
        }
    }

    /// Checkpoint the long-running transaction of every store now.
    ///
    /// Every store is attempted even if an earlier one fails. A store whose
    /// commit failed keeps its transaction open and a new commit is armed.
    pub fn commit(&mut self) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        self.commits.committed();

        let mut failure = None;
        let mut record = |store: StoreSchema, result: Result<()>| {
            if let Err(e) = result {
                warn!(store = store.name(), "Commit failed: {}", e);
                failure.get_or_insert(e);
            }
        };

        record(StoreSchema::History, checkpoint(db.database()));
        if let Some(thumbnails) = self.thumbnails.as_ref() {
            record(StoreSchema::Thumbnail, checkpoint(thumbnails.database()));
        }
        if let Some(archived) = self.archived.as_ref() {
            record(StoreSchema::Archived, checkpoint(archived.database()));
        }
        if let Some(index) = self.text_index.as_mut() {
            let result = index
                .commit_transaction()
                .and_then(|()| index.begin_transaction());
            record(StoreSchema::TextIndex, result);
        }

        if let Some(e) = failure {
            self.schedule_commit();
            return Err(e);
        }
        debug!(commit_count = self.commits.commit_count(), "History committed");
        Ok(())
    }

    /// Run the deferred commit if it is armed and has not been cancelled.
    pub fn commit_if_due(&mut self) -> Result<bool> {
        let due = self
            .commits
            .scheduled()
            .is_some_and(|scheduled| !scheduled.token.is_cancelled());
        if !due {
            return Ok(false);
        }
        self.commit()?;
        Ok(true)
    }

    /// Housekeeping deferred until the request that triggered it has been
    /// answered.
    pub fn run_deferred_tasks(&mut self) {
        if std::mem::take(&mut self.segment_sweep_pending) {
            if let Err(e) = self.delete_old_segment_data() {
                warn!("Segment retention sweep failed: {}", e);
            }
        }
    }

    /// Prepare for teardown: disarm the commit timer and release the sink.
    pub fn closing(&mut self) {
        self.commits.cancel();
        self.sink = None;
        info!("History backend closing");
    }
}

/// End and reopen the long-running transaction of `store`.
fn checkpoint(store: &Database) -> Result<()> {
    store.commit_transaction()?;
    store.begin_transaction()
}

impl Drop for HistoryBackend {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            warn!("Final history commit failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastSink;
    use chrono::Duration;
    use waypoint_core::clock::ManualClock;
    use waypoint_core::error::WaypointError;
    use waypoint_core::types::{PageTransition, UrlRow, VisitId, VisitRow, VisitSource};
    use waypoint_storage::UrlStore;

    fn make_backend() -> HistoryBackend {
        HistoryBackend::in_memory(HistoryConfig::default(), HistoryDeps::detached()).unwrap()
    }

    #[test]
    fn test_in_memory_backend_is_loaded() {
        let backend = make_backend();
        assert!(backend.is_loaded());
        let db = backend.history_db().unwrap();
        assert_eq!(db.database().transaction_nesting(), 1);
        assert_eq!(
            backend.thumbnail_db().unwrap().database().transaction_nesting(),
            1
        );
    }

    #[test]
    fn test_commit_reopens_transactions() {
        let mut backend = make_backend();
        backend.schedule_commit();
        backend.commit().unwrap();
        assert_eq!(backend.commit_scheduler().commit_count(), 1);
        assert!(backend.commit_scheduler().deadline().is_none());
        assert_eq!(
            backend.history_db().unwrap().database().transaction_nesting(),
            1
        );
    }

    fn exec(backend: &HistoryBackend, sql: &str) {
        backend
            .history_db()
            .unwrap()
            .database()
            .with_conn(|conn| {
                conn.execute_batch(sql)
                    .map_err(|e| WaypointError::Storage(e.to_string()))
            })
            .unwrap();
    }

    #[test]
    fn test_failed_commit_keeps_transactions_and_rearms() {
        let mut backend = make_backend();
        // A deferred foreign key violation makes COMMIT fail on the primary store.
        exec(
            &backend,
            "CREATE TABLE fk_parent (id INTEGER PRIMARY KEY);
             CREATE TABLE fk_child (
                 parent_id INTEGER REFERENCES fk_parent(id) DEFERRABLE INITIALLY DEFERRED
             );
             INSERT INTO fk_child (parent_id) VALUES (42);",
        );

        assert!(backend.commit().is_err());
        let history = backend.history_db().unwrap().database();
        assert_eq!(history.transaction_nesting(), 1);
        assert_eq!(
            backend.thumbnail_db().unwrap().database().transaction_nesting(),
            1
        );
        assert!(backend.commit_scheduler().deadline().is_some());

        exec(&backend, "DELETE FROM fk_child;");
        backend.commit().unwrap();
        assert_eq!(
            backend.history_db().unwrap().database().transaction_nesting(),
            1
        );
        assert!(backend.commit_scheduler().deadline().is_none());
    }

    #[test]
    fn test_commit_if_due_ignores_cancelled_timer() {
        let mut backend = make_backend();
        assert!(!backend.commit_if_due().unwrap());
        backend.schedule_commit();
        backend.closing();
        assert!(!backend.commit_if_due().unwrap());
        assert_eq!(backend.commit_scheduler().commit_count(), 0);
    }

    #[test]
    fn test_first_recorded_time_spans_stores() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let deps = HistoryDeps::new(
            Arc::new(NullSink),
            Arc::new(InMemoryBookmarks::new()),
            clock,
        );
        let stores = HistoryStores::in_memory(false).unwrap();
        let archived = stores.archived.as_ref().unwrap();
        let id = archived
            .add_url(&UrlRow::new(url::Url::parse("https://old.test/").unwrap()))
            .unwrap();
        let old = now - Duration::days(200);
        archived
            .add_visit(&VisitRow::new(
                id,
                old,
                VisitId(0),
                PageTransition::LINK,
                VisitSource::Browsed,
            ))
            .unwrap();

        let backend = HistoryBackend::with_stores(HistoryConfig::default(), stores, deps);
        assert_eq!(
            backend.first_recorded_time().timestamp_micros(),
            old.timestamp_micros()
        );
    }

    #[test]
    fn test_unopenable_primary_reports_profile_error() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the profile directory should be.
        let profile = dir.path().join("profile");
        std::fs::write(&profile, b"not a directory").unwrap();
        let (sink, mut rx) = BroadcastSink::new(8);
        let deps = HistoryDeps::new(
            Arc::new(sink),
            Arc::new(InMemoryBookmarks::new()),
            Arc::new(SystemClock),
        );

        let backend = HistoryBackend::open(&profile, HistoryConfig::default(), deps);
        assert!(!backend.is_loaded());
        assert!(backend.thumbnail_db().is_none());
        match rx.try_recv().unwrap() {
            HistoryEvent::ProfileError { store, .. } => assert_eq!(store, "history"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_open_on_disk_creates_store_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend =
            HistoryBackend::open(dir.path(), HistoryConfig::default(), HistoryDeps::detached());
        assert!(backend.is_loaded());
        assert!(backend.archived_db().is_some());
        for schema in [
            StoreSchema::History,
            StoreSchema::Archived,
            StoreSchema::Thumbnail,
            StoreSchema::TextIndex,
        ] {
            assert!(dir.path().join(schema.file_name()).exists());
        }
    }
}
