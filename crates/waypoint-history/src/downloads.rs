//! Download records kept alongside history.

use chrono::{DateTime, Utc};
use tracing::info;

use waypoint_core::error::Result;
use waypoint_core::types::DownloadRow;

use crate::backend::HistoryBackend;

impl HistoryBackend {
    /// Persist a new download. Returns its handle, or 0 when history is
    /// unavailable.
    pub fn create_download(&mut self, download: &DownloadRow) -> Result<i64> {
        let Some(db) = self.db.as_ref() else {
            return Ok(0);
        };
        let handle = db.create_download(download)?;
        self.schedule_commit();
        Ok(handle)
    }

    pub fn update_download(&mut self, download: &DownloadRow) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        db.update_download(download)?;
        self.schedule_commit();
        Ok(())
    }

    pub fn update_download_path(&mut self, db_handle: i64, path: &str) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        db.update_download_path(db_handle, path)?;
        self.schedule_commit();
        Ok(())
    }

    pub fn query_downloads(&self) -> Result<Vec<DownloadRow>> {
        match self.db.as_ref() {
            Some(db) => db.query_downloads(),
            None => Ok(Vec::new()),
        }
    }

    pub fn remove_download(&mut self, db_handle: i64) -> Result<()> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        db.remove_download(db_handle)?;
        self.schedule_commit();
        Ok(())
    }

    /// Remove finished downloads started in `[begin, end)`.
    pub fn remove_downloads_between(
        &mut self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let Some(db) = self.db.as_ref() else {
            return Ok(0);
        };
        let removed = db.remove_downloads_between(begin, end)?;
        if removed > 0 {
            info!(downloads = removed, "Downloads removed");
            self.schedule_commit();
        }
        Ok(removed)
    }

    /// The handle the next created download will get.
    pub fn next_download_id(&self) -> Result<i64> {
        match self.db.as_ref() {
            Some(db) => db.next_download_id(),
            None => Ok(0),
        }
    }
}
