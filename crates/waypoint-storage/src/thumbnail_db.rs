//! Favicon store: icons, page to icon mappings and legacy page thumbnails.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::info;
use url::Url;

use waypoint_core::error::WaypointError;
use waypoint_core::types::{FaviconRow, IconId, IconMapping, IconMappingId, IconType};

use crate::db::{from_micros, opt_to_micros, storage_err, url_column, Database};
use crate::migrations::{StoreSchema, THUMBNAILS_TABLE};

fn icon_type_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<IconType> {
    let bits: i64 = row.get(idx)?;
    IconType::from_bits(bits).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, bits))
}

pub struct ThumbnailDatabase {
    db: Database,
}

impl ThumbnailDatabase {
    pub fn open(path: &Path) -> Result<Self, WaypointError> {
        Ok(Self {
            db: Database::new(path, StoreSchema::Thumbnail)?,
        })
    }

    pub fn in_memory() -> Result<Self, WaypointError> {
        Ok(Self {
            db: Database::in_memory(StoreSchema::Thumbnail)?,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Favicons
    // =========================================================================

    /// Id of the icon stored for `icon_url` with the given type.
    pub fn favicon_id_for_icon_url(
        &self,
        icon_url: &Url,
        icon_type: IconType,
    ) -> Result<Option<IconId>, WaypointError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM favicons WHERE url = ?1 AND icon_type = ?2
                 ORDER BY id LIMIT 1",
                rusqlite::params![icon_url.as_str(), i64::from(icon_type.bits())],
                |row| Ok(IconId(row.get(0)?)),
            )
            .optional()
            .map_err(storage_err("Failed to look up favicon"))
        })
    }

    /// First icon for `icon_url` whose type is in `icon_types`.
    pub fn favicon_for_icon_url(
        &self,
        icon_url: &Url,
        icon_types: &[IconType],
    ) -> Result<Option<FaviconRow>, WaypointError> {
        for icon_type in icon_types {
            if let Some(id) = self.favicon_id_for_icon_url(icon_url, *icon_type)? {
                return self.get_favicon(id);
            }
        }
        Ok(None)
    }

    pub fn get_favicon(&self, id: IconId) -> Result<Option<FaviconRow>, WaypointError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, url, icon_type, last_updated, image_data FROM favicons WHERE id = ?1",
                [id.0],
                |row| {
                    Ok(FaviconRow {
                        id: IconId(row.get(0)?),
                        icon_url: url_column(row, 1)?,
                        icon_type: icon_type_column(row, 2)?,
                        last_updated: from_micros(row.get(3)?),
                        image: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(storage_err("Failed to read favicon"))
        })
    }

    pub fn add_favicon(&self, icon_url: &Url, icon_type: IconType) -> Result<IconId, WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO favicons (url, icon_type) VALUES (?1, ?2)",
                rusqlite::params![icon_url.as_str(), i64::from(icon_type.bits())],
            )
            .map_err(storage_err("Failed to add favicon"))?;
            Ok(IconId(conn.last_insert_rowid()))
        })
    }

    pub fn set_favicon_bitmap(
        &self,
        id: IconId,
        image: &[u8],
        time: DateTime<Utc>,
    ) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE favicons SET image_data = ?1, last_updated = ?2 WHERE id = ?3",
                rusqlite::params![image, opt_to_micros(Some(time)), id.0],
            )
            .map_err(storage_err("Failed to store favicon bitmap"))?;
            Ok(())
        })
    }

    /// `None` marks the icon as out of date.
    pub fn set_favicon_last_update_time(
        &self,
        id: IconId,
        time: Option<DateTime<Utc>>,
    ) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE favicons SET last_updated = ?1 WHERE id = ?2",
                rusqlite::params![opt_to_micros(time), id.0],
            )
            .map_err(storage_err("Failed to update favicon time"))?;
            Ok(())
        })
    }

    pub fn delete_favicon(&self, id: IconId) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM favicons WHERE id = ?1", [id.0])
                .map_err(storage_err("Failed to delete favicon"))?;
            Ok(())
        })
    }

    /// Whether any page still maps to `id`.
    pub fn has_mapping_for(&self, id: IconId) -> Result<bool, WaypointError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM icon_mapping WHERE icon_id = ?1",
                    [id.0],
                    |row| row.get(0),
                )
                .map_err(storage_err("Failed to count icon mappings"))?;
            Ok(count > 0)
        })
    }

    /// Delete `id` if no mapping references it. Returns whether it was deleted.
    pub fn delete_favicon_if_orphaned(&self, id: IconId) -> Result<bool, WaypointError> {
        if self.has_mapping_for(id)? {
            return Ok(false);
        }
        self.delete_favicon(id)?;
        Ok(true)
    }

    // =========================================================================
    // Icon mappings
    // =========================================================================

    pub fn icon_mappings_for_page_url(
        &self,
        page_url: &Url,
    ) -> Result<Vec<IconMapping>, WaypointError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, page_url, icon_id, icon_type FROM icon_mapping
                     WHERE page_url = ?1 ORDER BY id",
                )
                .map_err(storage_err("Failed to prepare icon mapping query"))?;
            let rows = stmt
                .query_map([page_url.as_str()], |row| {
                    Ok(IconMapping {
                        id: IconMappingId(row.get(0)?),
                        page_url: url_column(row, 1)?,
                        icon_id: IconId(row.get(2)?),
                        icon_type: icon_type_column(row, 3)?,
                    })
                })
                .map_err(storage_err("Failed to query icon mappings"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("Failed to read icon mapping"))
        })
    }

    pub fn add_icon_mapping(
        &self,
        page_url: &Url,
        icon_id: IconId,
        icon_type: IconType,
    ) -> Result<IconMappingId, WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO icon_mapping (page_url, icon_id, icon_type) VALUES (?1, ?2, ?3)",
                rusqlite::params![page_url.as_str(), icon_id.0, i64::from(icon_type.bits())],
            )
            .map_err(storage_err("Failed to add icon mapping"))?;
            Ok(IconMappingId(conn.last_insert_rowid()))
        })
    }

    pub fn update_icon_mapping(
        &self,
        mapping_id: IconMappingId,
        icon_id: IconId,
        icon_type: IconType,
    ) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE icon_mapping SET icon_id = ?1, icon_type = ?2 WHERE id = ?3",
                rusqlite::params![icon_id.0, i64::from(icon_type.bits()), mapping_id.0],
            )
            .map_err(storage_err("Failed to update icon mapping"))?;
            Ok(())
        })
    }

    /// Remove every mapping for `page_url`, returning the icons they used.
    pub fn delete_icon_mappings(&self, page_url: &Url) -> Result<Vec<IconId>, WaypointError> {
        let icons: Vec<IconId> = self
            .icon_mappings_for_page_url(page_url)?
            .into_iter()
            .map(|m| m.icon_id)
            .collect();
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM icon_mapping WHERE page_url = ?1",
                [page_url.as_str()],
            )
            .map_err(storage_err("Failed to delete icon mappings"))?;
            Ok(())
        })?;
        Ok(icons)
    }

    // =========================================================================
    // Thumbnails
    // =========================================================================

    pub fn set_page_thumbnail(
        &self,
        page_url: &Url,
        data: &[u8],
        time: DateTime<Utc>,
    ) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO thumbnails (page_url, last_updated, data)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![page_url.as_str(), opt_to_micros(Some(time)), data],
            )
            .map_err(storage_err("Failed to store thumbnail"))?;
            Ok(())
        })
    }

    pub fn get_page_thumbnail(&self, page_url: &Url) -> Result<Option<Vec<u8>>, WaypointError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT data FROM thumbnails WHERE page_url = ?1",
                [page_url.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err("Failed to read thumbnail"))
        })
    }

    pub fn delete_thumbnail(&self, page_url: &Url) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM thumbnails WHERE page_url = ?1",
                [page_url.as_str()],
            )
            .map_err(storage_err("Failed to delete thumbnail"))?;
            Ok(())
        })
    }

    // =========================================================================
    // Full wipe support
    // =========================================================================

    /// Create empty `temp_favicons` and `temp_icon_mapping` tables.
    pub fn init_temporary_tables(&self) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                "DROP TABLE IF EXISTS temp_favicons;
                 DROP TABLE IF EXISTS temp_icon_mapping;
                 CREATE TABLE temp_favicons (
                    id              INTEGER PRIMARY KEY,
                    url             TEXT NOT NULL,
                    icon_type       INTEGER NOT NULL DEFAULT 1,
                    last_updated    INTEGER NOT NULL DEFAULT 0,
                    image_data      BLOB
                 );
                 CREATE TABLE temp_icon_mapping (
                    id              INTEGER PRIMARY KEY,
                    page_url        TEXT NOT NULL,
                    icon_id         INTEGER NOT NULL,
                    icon_type       INTEGER NOT NULL DEFAULT 1
                 );",
            )
            .map_err(storage_err("Failed to create temporary favicon tables"))
        })
    }

    /// Copy icon `id` into `temp_favicons`, returning its new id.
    pub fn copy_to_temporary_favicon_table(&self, id: IconId) -> Result<IconId, WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO temp_favicons (url, icon_type, last_updated, image_data)
                 SELECT url, icon_type, last_updated, image_data FROM favicons WHERE id = ?1",
                [id.0],
            )
            .map_err(storage_err("Failed to copy favicon"))?;
            Ok(IconId(conn.last_insert_rowid()))
        })
    }

    pub fn add_to_temporary_icon_mapping_table(
        &self,
        page_url: &Url,
        icon_id: IconId,
        icon_type: IconType,
    ) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO temp_icon_mapping (page_url, icon_id, icon_type)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![page_url.as_str(), icon_id.0, i64::from(icon_type.bits())],
            )
            .map_err(storage_err("Failed to copy icon mapping"))?;
            Ok(())
        })
    }

    /// Replace the live favicon tables with the temporary ones.
    pub fn commit_temporary_tables(&self) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                "DROP TABLE favicons;
                 ALTER TABLE temp_favicons RENAME TO favicons;
                 CREATE INDEX IF NOT EXISTS favicons_url ON favicons (url);
                 DROP TABLE icon_mapping;
                 ALTER TABLE temp_icon_mapping RENAME TO icon_mapping;
                 CREATE INDEX IF NOT EXISTS icon_mapping_page_url_idx
                    ON icon_mapping (page_url);
                 CREATE INDEX IF NOT EXISTS icon_mapping_icon_id_idx
                    ON icon_mapping (icon_id);",
            )
            .map_err(storage_err("Failed to swap favicon tables"))?;
            Ok(())
        })?;
        info!("Favicon tables replaced");
        Ok(())
    }

    pub fn recreate_thumbnail_table(&self) -> Result<(), WaypointError> {
        self.db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS thumbnails;")
                .map_err(storage_err("Failed to drop thumbnails"))?;
            conn.execute_batch(THUMBNAILS_TABLE)
                .map_err(storage_err("Failed to recreate thumbnails"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_db() -> ThumbnailDatabase {
        ThumbnailDatabase::in_memory().unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_favicon_add_and_bitmap() {
        let db = make_db();
        let icon_url = url("https://a.test/favicon.ico");
        let id = db.add_favicon(&icon_url, IconType::Favicon).unwrap();
        let now = Utc::now();
        db.set_favicon_bitmap(id, b"png", now).unwrap();

        let row = db.get_favicon(id).unwrap().unwrap();
        assert_eq!(row.icon_url, icon_url);
        assert_eq!(row.image.as_deref(), Some(&b"png"[..]));
        assert_eq!(
            row.last_updated.map(|t| t.timestamp_micros()),
            Some(now.timestamp_micros())
        );

        assert_eq!(
            db.favicon_id_for_icon_url(&icon_url, IconType::Favicon).unwrap(),
            Some(id)
        );
        assert_eq!(
            db.favicon_id_for_icon_url(&icon_url, IconType::TouchIcon).unwrap(),
            None
        );
        assert!(db
            .favicon_for_icon_url(&icon_url, &[IconType::TouchIcon, IconType::Favicon])
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_out_of_date_marker() {
        let db = make_db();
        let id = db
            .add_favicon(&url("https://a.test/i.png"), IconType::TouchIcon)
            .unwrap();
        db.set_favicon_bitmap(id, b"x", Utc::now() - Duration::days(1))
            .unwrap();
        db.set_favicon_last_update_time(id, None).unwrap();
        assert_eq!(db.get_favicon(id).unwrap().unwrap().last_updated, None);
    }

    #[test]
    fn test_mappings_and_orphans() {
        let db = make_db();
        let page = url("https://a.test/");
        let icon = db
            .add_favicon(&url("https://a.test/favicon.ico"), IconType::Favicon)
            .unwrap();
        let mapping = db.add_icon_mapping(&page, icon, IconType::Favicon).unwrap();

        let mappings = db.icon_mappings_for_page_url(&page).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].id, mapping);
        assert!(!db.delete_favicon_if_orphaned(icon).unwrap());

        let removed = db.delete_icon_mappings(&page).unwrap();
        assert_eq!(removed, vec![icon]);
        assert!(db.delete_favicon_if_orphaned(icon).unwrap());
        assert!(db.get_favicon(icon).unwrap().is_none());
    }

    #[test]
    fn test_update_icon_mapping_keeps_identity() {
        let db = make_db();
        let page = url("https://a.test/");
        let touch = db
            .add_favicon(&url("https://a.test/t.png"), IconType::TouchIcon)
            .unwrap();
        let pre = db
            .add_favicon(&url("https://a.test/p.png"), IconType::TouchPrecomposedIcon)
            .unwrap();
        let mapping = db.add_icon_mapping(&page, touch, IconType::TouchIcon).unwrap();
        db.update_icon_mapping(mapping, pre, IconType::TouchPrecomposedIcon)
            .unwrap();

        let mappings = db.icon_mappings_for_page_url(&page).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].id, mapping);
        assert_eq!(mappings[0].icon_id, pre);
        assert_eq!(mappings[0].icon_type, IconType::TouchPrecomposedIcon);
    }

    #[test]
    fn test_thumbnails() {
        let db = make_db();
        let page = url("https://a.test/");
        db.set_page_thumbnail(&page, b"jpeg1", Utc::now()).unwrap();
        db.set_page_thumbnail(&page, b"jpeg2", Utc::now()).unwrap();
        assert_eq!(db.get_page_thumbnail(&page).unwrap(), Some(b"jpeg2".to_vec()));
        db.recreate_thumbnail_table().unwrap();
        assert_eq!(db.get_page_thumbnail(&page).unwrap(), None);
    }

    #[test]
    fn test_temporary_tables_keep_only_copied_icons() {
        let db = make_db();
        let kept_page = url("https://bookmark.test/");
        let kept = db
            .add_favicon(&url("https://bookmark.test/favicon.ico"), IconType::Favicon)
            .unwrap();
        db.set_favicon_bitmap(kept, b"keep", Utc::now()).unwrap();
        let dropped = db
            .add_favicon(&url("https://gone.test/favicon.ico"), IconType::Favicon)
            .unwrap();
        db.add_icon_mapping(&kept_page, kept, IconType::Favicon).unwrap();
        db.add_icon_mapping(&url("https://gone.test/"), dropped, IconType::Favicon)
            .unwrap();

        db.init_temporary_tables().unwrap();
        let new_id = db.copy_to_temporary_favicon_table(kept).unwrap();
        db.add_to_temporary_icon_mapping_table(&kept_page, new_id, IconType::Favicon)
            .unwrap();
        db.commit_temporary_tables().unwrap();

        let mappings = db.icon_mappings_for_page_url(&kept_page).unwrap();
        assert_eq!(mappings.len(), 1);
        let icon = db.get_favicon(mappings[0].icon_id).unwrap().unwrap();
        assert_eq!(icon.image.as_deref(), Some(&b"keep"[..]));
        assert!(db
            .icon_mappings_for_page_url(&url("https://gone.test/"))
            .unwrap()
            .is_empty());
    }
}
