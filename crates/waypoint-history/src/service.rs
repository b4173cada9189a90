//! The history service: a single worker task that owns the backend and
//! runs every operation in submission order.
//!
//! Callers post closures over an unbounded queue. Fire-and-forget writes go
//! through [`HistoryService::schedule`]; reads go through
//! [`HistoryService::request`] and come back as a [`CancelableRequest`].

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use waypoint_core::config::HistoryConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::{
    FaviconData, IconType, MostVisitedUrl, PageUsageData, QueryOptions, QueryResults, UrlRow,
    VisitRow,
};

use crate::backend::{HistoryBackend, HistoryDeps};
use crate::request::{CancelableRequest, RequestId, RequestTable};
use crate::visits::AddPageArgs;

type Task = Box<dyn FnOnce(&mut HistoryBackend) + Send>;

pub struct HistoryService {
    tx: mpsc::UnboundedSender<Task>,
    requests: RequestTable,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl HistoryService {
    /// Spawn the worker around `backend`. Must be called inside a Tokio
    /// runtime.
    pub fn start(backend: HistoryBackend) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(backend, rx, shutdown.clone()));
        Self {
            tx,
            requests: RequestTable::new(),
            shutdown,
            worker: Some(worker),
        }
    }

    /// Open the profile in `dir` and start serving it.
    pub fn open(dir: &Path, config: HistoryConfig, deps: HistoryDeps) -> Self {
        Self::start(HistoryBackend::open(dir, config, deps))
    }

    /// Queue `f` to run on the worker. Nothing is returned to the caller.
    pub fn schedule<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut HistoryBackend) + Send + 'static,
    {
        self.tx
            .send(Box::new(f))
            .map_err(|_| WaypointError::ShuttingDown)
    }

    /// Queue `f` and hand back a handle to its result.
    ///
    /// A request cancelled before the worker reaches it is never computed.
    pub fn request<T, F>(&self, f: F) -> CancelableRequest<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut HistoryBackend) -> T + Send + 'static,
    {
        let (request, pending) = self.requests.issue();
        let task: Task = Box::new(move |backend| {
            if pending.is_canceled() {
                debug!(request_id = pending.id(), "Skipping canceled request");
                return;
            }
            let value = f(backend);
            pending.forward(value);
        });
        if self.tx.send(task).is_err() {
            // The dropped task resolves the request as shut down.
            debug!("History worker is gone");
        }
        request
    }

    pub fn cancel(&self, id: RequestId) -> bool {
        self.requests.cancel(id)
    }

    /// Requests issued and not yet answered or cancelled.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    fn schedule_write<F>(&self, operation: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&mut HistoryBackend) -> Result<()> + Send + 'static,
    {
        self.schedule(move |backend| {
            if let Err(e) = f(backend) {
                warn!(operation, "History write failed: {}", e);
            }
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn add_page(&self, args: AddPageArgs) -> Result<()> {
        self.schedule_write("add_page", move |backend| backend.add_page(&args))
    }

    pub fn set_page_title(&self, url: Url, title: String) -> Result<()> {
        self.schedule_write("set_page_title", move |backend| {
            backend.set_page_title(&url, &title)
        })
    }

    pub fn set_page_contents(&self, url: Url, contents: String) -> Result<()> {
        self.schedule_write("set_page_contents", move |backend| {
            backend.set_page_contents(&url, &contents)
        })
    }

    pub fn set_favicon(
        &self,
        page_url: Url,
        icon_url: Url,
        image: Vec<u8>,
        icon_type: IconType,
    ) -> Result<()> {
        self.schedule_write("set_favicon", move |backend| {
            backend.set_favicon(&page_url, &icon_url, &image, icon_type)
        })
    }

    pub fn clear_scope(&self, scope: u64) -> Result<()> {
        self.schedule(move |backend| backend.clear_scope(scope))
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn query_history(
        &self,
        text_query: String,
        options: QueryOptions,
    ) -> CancelableRequest<Result<QueryResults>> {
        self.request(move |backend| backend.query_history(&text_query, &options))
    }

    pub fn query_url(
        &self,
        url: Url,
        want_visits: bool,
    ) -> CancelableRequest<Result<Option<(UrlRow, Vec<VisitRow>)>>> {
        self.request(move |backend| backend.query_url(&url, want_visits))
    }

    pub fn query_segment_usage(
        &self,
        from_time: DateTime<Utc>,
        max_results: usize,
    ) -> CancelableRequest<Result<Vec<PageUsageData>>> {
        self.request(move |backend| backend.query_segment_usage(from_time, max_results))
    }

    pub fn query_most_visited_urls(
        &self,
        count: usize,
        days_back: i64,
    ) -> CancelableRequest<Result<Vec<MostVisitedUrl>>> {
        self.request(move |backend| backend.query_most_visited_urls(count, days_back))
    }

    pub fn query_redirects_from(&self, url: Url) -> CancelableRequest<Result<Vec<Url>>> {
        self.request(move |backend| backend.query_redirects_from(&url))
    }

    pub fn query_redirects_to(&self, url: Url) -> CancelableRequest<Result<Vec<Url>>> {
        self.request(move |backend| backend.query_redirects_to(&url))
    }

    pub fn get_favicon_for_url(
        &self,
        page_url: Url,
        icon_types: Vec<IconType>,
    ) -> CancelableRequest<Result<FaviconData>> {
        self.request(move |backend| backend.get_favicon_for_url(&page_url, &icon_types))
    }

    /// Delete URLs everywhere. Resolves once the deletion is committed.
    pub fn delete_urls(&self, urls: Vec<Url>) -> CancelableRequest<Result<()>> {
        self.request(move |backend| backend.delete_urls(&urls))
    }

    /// Delete a time range of history. Resolves once the deletion is
    /// committed.
    pub fn expire_history_between(
        &self,
        restrict_urls: BTreeSet<Url>,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> CancelableRequest<Result<()>> {
        self.request(move |backend| backend.expire_history_between(&restrict_urls, begin, end))
    }

    pub fn archive_old_visits(&self) -> CancelableRequest<Result<usize>> {
        self.request(|backend| backend.archive_old_visits())
    }

    /// Commit now instead of waiting for the deferred commit.
    pub fn flush(&self) -> CancelableRequest<Result<()>> {
        self.request(|backend| backend.commit())
    }

    /// Total commits the backend has performed.
    pub fn commit_count(&self) -> CancelableRequest<u64> {
        self.request(|backend| backend.commit_scheduler().commit_count())
    }

    /// Stop the worker after it drains the queue, then commit and close the
    /// stores.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("History worker failed: {}", e);
            }
        }
    }
}

impl Drop for HistoryService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    mut backend: HistoryBackend,
    mut rx: mpsc::UnboundedReceiver<Task>,
    shutdown: CancellationToken,
) {
    let archive_every = backend.config().archive_interval();
    let mut archive_tick = time::interval_at(Instant::now() + archive_every, archive_every);
    archive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(loaded = backend.is_loaded(), "History worker started");

    loop {
        let commit_deadline = backend.commit_scheduler().deadline();
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            task = rx.recv() => match task {
                Some(task) => {
                    task(&mut backend);
                    backend.run_deferred_tasks();
                }
                None => break,
            },

            _ = time::sleep_until(commit_deadline.unwrap_or_else(Instant::now)),
                if commit_deadline.is_some() =>
            {
                if let Err(e) = backend.commit_if_due() {
                    warn!("Deferred commit failed: {}", e);
                }
            }

            _ = archive_tick.tick() => {
                match backend.archive_old_visits() {
                    Ok(0) => {}
                    Ok(moved) => debug!(visits = moved, "Archival sweep finished"),
                    Err(e) => warn!("Archival sweep failed: {}", e),
                }
            }
        }
    }

    // Work queued before shutdown still runs.
    while let Ok(task) = rx.try_recv() {
        task(&mut backend);
    }
    backend.run_deferred_tasks();
    backend.closing();
    drop(backend);
    info!("History worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use waypoint_core::clock::ManualClock;
    use waypoint_core::types::PageTransition;

    use crate::bookmarks::InMemoryBookmarks;
    use crate::notify::NullSink;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn make_service() -> HistoryService {
        let deps = HistoryDeps::new(
            Arc::new(NullSink),
            Arc::new(InMemoryBookmarks::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let backend = HistoryBackend::in_memory(HistoryConfig::default(), deps).unwrap();
        HistoryService::start(backend)
    }

    #[tokio::test]
    async fn test_requests_run_in_order() {
        let service = make_service();
        let u = url("https://a.test/");
        service
            .add_page(AddPageArgs::new(u.clone(), Utc::now(), PageTransition::TYPED))
            .unwrap();
        service.set_page_title(u.clone(), "A".to_string()).unwrap();

        let (row, visits) = service
            .query_url(u.clone(), true)
            .wait()
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(row.title, "A");
        assert_eq!(visits.len(), 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutations_batch_into_one_commit() {
        let service = make_service();
        for i in 0..5 {
            let u = url(&format!("https://site{}.test/", i));
            service
                .add_page(AddPageArgs::new(u, Utc::now() - Duration::minutes(i), PageTransition::LINK))
                .unwrap();
        }
        assert_eq!(service.commit_count().wait().await.unwrap(), 0);

        time::sleep(std::time::Duration::from_secs(11)).await;
        assert_eq!(service.commit_count().wait().await.unwrap(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_canceled_request_is_never_computed() {
        let service = make_service();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        // Hold the worker until the second request has been cancelled.
        service
            .schedule(move |_| {
                let _ = gate_rx.recv();
            })
            .unwrap();

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let request = service.request(move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        request.cancel();
        gate_tx.send(()).unwrap();

        assert!(matches!(request.wait().await, Err(WaypointError::Canceled)));
        service.flush().wait().await.unwrap().unwrap();
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(service.pending_requests(), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let service = make_service();
        let tx = service.tx.clone();
        service.shutdown().await;
        assert!(tx.send(Box::new(|_| {})).is_err());
    }
}
