//! Page icons and thumbnails.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};
use url::Url;

use waypoint_core::error::Result;
use waypoint_core::events::HistoryEvent;
use waypoint_core::types::{FaviconData, FaviconRow, IconId, IconType, ImportedFaviconUsage, UrlRow};
use waypoint_storage::{ThumbnailDatabase, UrlStore};

use crate::backend::HistoryBackend;

/// What `add_or_update_icon_mapping` did to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MappingChange {
    Unchanged,
    Added,
    /// An existing mapping now points at the new icon; holds the old one.
    Replaced(IconId),
}

/// Map `page_url` to `icon_id`, replacing a mapping of a substitutable type.
fn add_or_update_icon_mapping(
    thumbnails: &ThumbnailDatabase,
    page_url: &Url,
    icon_id: IconId,
    icon_type: IconType,
) -> Result<MappingChange> {
    let mappings = thumbnails.icon_mappings_for_page_url(page_url)?;
    if mappings.iter().any(|m| m.icon_id == icon_id) {
        return Ok(MappingChange::Unchanged);
    }
    match mappings
        .iter()
        .find(|m| m.icon_type.is_substitutable(icon_type))
    {
        Some(existing) => {
            thumbnails.update_icon_mapping(existing.id, icon_id, icon_type)?;
            Ok(MappingChange::Replaced(existing.icon_id))
        }
        None => {
            thumbnails.add_icon_mapping(page_url, icon_id, icon_type)?;
            Ok(MappingChange::Added)
        }
    }
}

impl HistoryBackend {
    /// The favicon store, or `None` with a warning when it is unavailable.
    fn favicon_store(&self, operation: &'static str) -> Option<&ThumbnailDatabase> {
        if self.thumbnails.is_none() {
            warn!(operation, "Favicon store unavailable");
        }
        self.thumbnails.as_ref()
    }

    fn favicon_data(&self, row: FaviconRow) -> FaviconData {
        let expired = match row.last_updated {
            Some(updated) => self.now() - updated > self.config.favicon_refetch(),
            None => true,
        };
        FaviconData {
            known_icon: true,
            expired,
            icon_url: Some(row.icon_url),
            icon_type: Some(row.icon_type),
            image: row.image,
        }
    }

    /// Look up an icon by its own URL.
    pub fn get_favicon(&self, icon_url: &Url, icon_types: &[IconType]) -> Result<FaviconData> {
        let Some(thumbnails) = self.favicon_store("get_favicon") else {
            return Ok(FaviconData::default());
        };
        match thumbnails.favicon_for_icon_url(icon_url, icon_types)? {
            Some(row) => Ok(self.favicon_data(row)),
            None => Ok(FaviconData::default()),
        }
    }

    /// The first icon mapped to `page_url` whose type was asked for.
    pub fn get_favicon_for_url(
        &self,
        page_url: &Url,
        icon_types: &[IconType],
    ) -> Result<FaviconData> {
        if self.db.is_none() {
            return Ok(FaviconData::default());
        }
        let Some(thumbnails) = self.favicon_store("get_favicon_for_url") else {
            return Ok(FaviconData::default());
        };
        for mapping in thumbnails.icon_mappings_for_page_url(page_url)? {
            if !icon_types.contains(&mapping.icon_type) {
                continue;
            }
            if let Some(row) = thumbnails.get_favicon(mapping.icon_id)? {
                return Ok(self.favicon_data(row));
            }
        }
        Ok(FaviconData::default())
    }

    /// Map `page_url` (and its recent redirect chain) to the icon stored for
    /// `icon_url`, then return that icon.
    pub fn update_favicon_mapping_and_fetch(
        &mut self,
        page_url: &Url,
        icon_url: &Url,
        icon_types: &[IconType],
    ) -> Result<FaviconData> {
        let found = match self.favicon_store("update_favicon_mapping_and_fetch") {
            Some(thumbnails) => thumbnails.favicon_for_icon_url(icon_url, icon_types)?,
            None => None,
        };
        let Some(row) = found else {
            return Ok(FaviconData::default());
        };
        self.set_favicon_mapping(page_url, row.id, row.icon_type)?;
        Ok(self.favicon_data(row))
    }

    /// Store icon bytes for `icon_url` and map `page_url` to it.
    pub fn set_favicon(
        &mut self,
        page_url: &Url,
        icon_url: &Url,
        image: &[u8],
        icon_type: IconType,
    ) -> Result<()> {
        if self.db.is_none() {
            return Ok(());
        }
        let now = self.now();
        let Some(thumbnails) = self.favicon_store("set_favicon") else {
            return Ok(());
        };
        let icon_id = match thumbnails.favicon_id_for_icon_url(icon_url, icon_type)? {
            Some(id) => id,
            None => thumbnails.add_favicon(icon_url, icon_type)?,
        };
        thumbnails.set_favicon_bitmap(icon_id, image, now)?;
        self.set_favicon_mapping(page_url, icon_id, icon_type)
    }

    /// Point every hop of the chain ending at `page_url` at `icon_id`.
    ///
    /// Icons that lose their last mapping are deleted. Observers hear about
    /// the pages whose mapping actually changed, once.
    pub fn set_favicon_mapping(
        &mut self,
        page_url: &Url,
        icon_id: IconId,
        icon_type: IconType,
    ) -> Result<()> {
        let chain = self.redirects.chain_or_self(page_url);
        let Some(thumbnails) = self.favicon_store("set_favicon_mapping") else {
            return Ok(());
        };

        let mut changed = BTreeSet::new();
        for url in chain {
            match add_or_update_icon_mapping(thumbnails, &url, icon_id, icon_type)? {
                MappingChange::Unchanged => {}
                MappingChange::Added => {
                    changed.insert(url);
                }
                MappingChange::Replaced(old) => {
                    if old != icon_id && thumbnails.delete_favicon_if_orphaned(old)? {
                        debug!(icon_id = %old, "Orphaned favicon deleted");
                    }
                    changed.insert(url);
                }
            }
        }

        if !changed.is_empty() {
            self.notify(HistoryEvent::FaviconChanged { urls: changed });
        }
        self.schedule_commit();
        Ok(())
    }

    /// Mark the icons of `page_url` as needing a refetch.
    pub fn set_favicon_out_of_date_for_page(&mut self, page_url: &Url) -> Result<()> {
        let Some(thumbnails) = self.favicon_store("set_favicon_out_of_date_for_page") else {
            return Ok(());
        };
        let mut touched = HashSet::new();
        for mapping in thumbnails.icon_mappings_for_page_url(page_url)? {
            if touched.insert(mapping.icon_id) {
                thumbnails.set_favicon_last_update_time(mapping.icon_id, None)?;
            }
        }
        if !touched.is_empty() {
            self.schedule_commit();
        }
        Ok(())
    }

    /// Give `new_page` the icons of `old_page` if they share an origin and
    /// `new_page` has none yet.
    pub fn clone_favicon(&mut self, old_page: &Url, new_page: &Url) -> Result<()> {
        if old_page.origin() != new_page.origin() {
            return Ok(());
        }
        let Some(thumbnails) = self.favicon_store("clone_favicon") else {
            return Ok(());
        };
        if !thumbnails.icon_mappings_for_page_url(new_page)?.is_empty() {
            return Ok(());
        }
        let mappings = thumbnails.icon_mappings_for_page_url(old_page)?;
        for mapping in &mappings {
            thumbnails.add_icon_mapping(new_page, mapping.icon_id, mapping.icon_type)?;
        }
        if !mappings.is_empty() {
            self.schedule_commit();
        }
        Ok(())
    }

    /// Bring in favicons from another browser.
    ///
    /// Pages unknown to history get a row only when bookmarked. Pages that
    /// already have a favicon keep it.
    pub fn set_imported_favicons(&mut self, usages: &[ImportedFaviconUsage]) -> Result<()> {
        let now = self.now();
        let (Some(db), Some(thumbnails)) = (
            self.db.as_ref(),
            self.favicon_store("set_imported_favicons"),
        ) else {
            return Ok(());
        };

        let mut changed = BTreeSet::new();
        for usage in usages {
            let icon_id = match thumbnails.favicon_id_for_icon_url(&usage.favicon_url, IconType::Favicon)? {
                Some(id) => id,
                None => {
                    let id = thumbnails.add_favicon(&usage.favicon_url, IconType::Favicon)?;
                    thumbnails.set_favicon_bitmap(id, &usage.png_data, now)?;
                    id
                }
            };

            for url in &usage.urls {
                match db.get_row_for_url(url)? {
                    None => {
                        if !self.bookmarks.is_bookmarked(url) {
                            continue;
                        }
                        db.add_url(&UrlRow::new(url.clone()))?;
                        thumbnails.add_icon_mapping(url, icon_id, IconType::Favicon)?;
                        changed.insert(url.clone());
                    }
                    Some(_) => {
                        let has_favicon = thumbnails
                            .icon_mappings_for_page_url(url)?
                            .iter()
                            .any(|m| m.icon_type == IconType::Favicon);
                        if !has_favicon {
                            thumbnails.add_icon_mapping(url, icon_id, IconType::Favicon)?;
                            changed.insert(url.clone());
                        }
                    }
                }
            }
        }

        if !changed.is_empty() {
            self.notify(HistoryEvent::FaviconChanged { urls: changed });
        }
        self.schedule_commit();
        Ok(())
    }

    // =========================================================================
    // Thumbnails
    // =========================================================================

    /// Store a thumbnail for a page history knows about.
    pub fn set_page_thumbnail(&mut self, page_url: &Url, image: &[u8]) -> Result<()> {
        let now = self.now();
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        let Some(row) = db.get_row_for_url(page_url)? else {
            debug!(url = %page_url, "Thumbnail for unknown page ignored");
            return Ok(());
        };
        let Some(thumbnails) = self.favicon_store("set_page_thumbnail") else {
            return Ok(());
        };
        thumbnails.set_page_thumbnail(page_url, image, row.last_visit.unwrap_or(now))?;
        self.schedule_commit();
        Ok(())
    }

    /// The thumbnail of the page `page_url` last redirected to, falling back
    /// to `page_url` itself.
    pub fn get_page_thumbnail(&self, page_url: &Url) -> Result<Option<Vec<u8>>> {
        let Some(thumbnails) = self.favicon_store("get_page_thumbnail") else {
            return Ok(None);
        };
        if let Some(destination) = self.query_redirects_from(page_url)?.last() {
            if let Some(image) = thumbnails.get_page_thumbnail(destination)? {
                return Ok(Some(image));
            }
        }
        thumbnails.get_page_thumbnail(page_url)
    }
}
