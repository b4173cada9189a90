//! Waypoint Storage crate - SQLite persistence for the history engine.
//!
//! Provides a WAL-mode SQLite wrapper with long-running transaction support
//! and per-store migrations, the primary and archived history stores behind
//! shared url/visit capability traits, the favicon store, and a
//! month-partitioned FTS5 full-text index.

pub mod archived_db;
pub mod db;
pub mod history_db;
pub mod migrations;
pub mod store;
pub mod text_index;
pub mod thumbnail_db;

pub use archived_db::ArchivedDatabase;
pub use db::Database;
pub use history_db::{compute_segment_name, day_slot, HistoryDatabase};
pub use migrations::StoreSchema;
pub use store::{StoreHandle, UrlStore, VisitStore};
pub use text_index::{sanitize_fts5_query, FtsTextIndex, TextIndex, TextMatch, TextMatches};
pub use thumbnail_db::ThumbnailDatabase;
