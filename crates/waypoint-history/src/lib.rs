//! Waypoint History - the browsing history engine.
//!
//! [`HistoryBackend`] owns the primary, archived, favicon and full-text
//! stores and implements every history operation on top of them.
//! [`HistoryService`] runs a backend on a single worker task, batches its
//! writes into periodic commits and hands out cancellable requests.

pub mod backend;
pub mod bookmarks;
pub mod commit;
pub mod downloads;
pub mod expire;
pub mod favicons;
pub mod notify;
pub mod query;
pub mod redirects;
pub mod request;
pub mod segments;
pub mod service;
pub mod tracker;
pub mod visits;

pub use backend::{HistoryBackend, HistoryDeps, HistoryStores};
pub use bookmarks::{BookmarkService, InMemoryBookmarks};
pub use commit::{CommitScheduler, CommitState};
pub use notify::{BroadcastSink, NotificationSink, NullSink};
pub use redirects::RedirectCache;
pub use request::{CancelableRequest, RequestId, RequestTable};
pub use service::HistoryService;
pub use tracker::VisitTracker;
pub use visits::AddPageArgs;
