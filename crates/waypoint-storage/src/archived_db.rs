//! Archived history store: URLs and visits past the archive threshold.

use std::path::Path;

use tracing::info;

use waypoint_core::error::WaypointError;

use crate::db::{storage_err, Database};
use crate::migrations::{StoreSchema, URLS_TABLE, VISITS_TABLE};
use crate::store::{StoreHandle, UrlStore, VisitStore};

pub struct ArchivedDatabase {
    db: Database,
}

impl ArchivedDatabase {
    pub fn open(path: &Path) -> Result<Self, WaypointError> {
        Ok(Self {
            db: Database::new(path, StoreSchema::Archived)?,
        })
    }

    pub fn in_memory() -> Result<Self, WaypointError> {
        Ok(Self {
            db: Database::in_memory(StoreSchema::Archived)?,
        })
    }

    /// Drop and recreate every table. Used by the full wipe.
    pub fn recreate_tables(&self) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS visits; DROP TABLE IF EXISTS urls;")
                .map_err(storage_err("Failed to drop archived tables"))?;
            conn.execute_batch(URLS_TABLE)
                .map_err(storage_err("Failed to recreate archived urls"))?;
            conn.execute_batch(VISITS_TABLE)
                .map_err(storage_err("Failed to recreate archived visits"))?;
            Ok(())
        })?;
        info!("Archived history tables recreated");
        Ok(())
    }
}

impl StoreHandle for ArchivedDatabase {
    fn database(&self) -> &Database {
        &self.db
    }
}

impl UrlStore for ArchivedDatabase {}
impl VisitStore for ArchivedDatabase {}
