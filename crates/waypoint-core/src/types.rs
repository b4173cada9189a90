use std::collections::BTreeSet;
use std::fmt;
use std::ops::BitOr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl $name {
            /// Zero is reserved for "no row".
            pub fn is_set(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Row id of a URL in the `urls` table of a history store.
    UrlId
);
row_id!(
    /// Row id of a visit. Zero as a referrer marks the root of a chain.
    VisitId
);
row_id!(
    /// Row id of a most-visited segment.
    SegmentId
);
row_id!(
    /// Row id of a favicon.
    IconId
);
row_id!(
    /// Row id of a page to icon mapping.
    IconMappingId
);

// =============================================================================
// Page transitions
// =============================================================================

/// How a navigation happened: a core type in the low byte plus qualifier bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageTransition(pub u32);

impl PageTransition {
    pub const LINK: Self = Self(0);
    pub const TYPED: Self = Self(1);
    pub const AUTO_BOOKMARK: Self = Self(2);
    pub const AUTO_SUBFRAME: Self = Self(3);
    pub const MANUAL_SUBFRAME: Self = Self(4);
    pub const GENERATED: Self = Self(5);
    pub const START_PAGE: Self = Self(6);
    pub const FORM_SUBMIT: Self = Self(7);
    pub const RELOAD: Self = Self(8);
    pub const KEYWORD: Self = Self(9);
    pub const KEYWORD_GENERATED: Self = Self(10);

    pub const FORWARD_BACK: Self = Self(0x0100_0000);
    pub const FROM_ADDRESS_BAR: Self = Self(0x0200_0000);
    pub const HOME_PAGE: Self = Self(0x0400_0000);
    pub const CHAIN_START: Self = Self(0x1000_0000);
    pub const CHAIN_END: Self = Self(0x2000_0000);
    pub const CLIENT_REDIRECT: Self = Self(0x4000_0000);
    pub const SERVER_REDIRECT: Self = Self(0x8000_0000);

    pub const CORE_MASK: u32 = 0xFF;
    pub const QUALIFIER_MASK: u32 = 0xFFFF_FF00;
    pub const IS_REDIRECT_MASK: u32 = 0xC000_0000;

    /// The core type with all qualifiers stripped.
    pub fn core(self) -> Self {
        Self(self.0 & Self::CORE_MASK)
    }

    /// Whether the core type equals `other`'s core type.
    pub fn core_is(self, other: Self) -> bool {
        self.core() == other.core()
    }

    /// Whether every bit of the qualifier `q` is set.
    pub fn has(self, q: Self) -> bool {
        q.0 != 0 && self.0 & q.0 == q.0
    }

    pub fn with(self, q: Self) -> Self {
        Self(self.0 | q.0)
    }

    pub fn without(self, q: Self) -> Self {
        Self(self.0 & !q.0)
    }

    /// Whether this hop was reached through a client or server redirect.
    pub fn is_redirect(self) -> bool {
        self.0 & Self::IS_REDIRECT_MASK != 0
    }

    /// Subframe navigations do not count as top-level page views.
    pub fn is_main_frame(self) -> bool {
        !self.core_is(Self::AUTO_SUBFRAME) && !self.core_is(Self::MANUAL_SUBFRAME)
    }

    pub fn core_name(self) -> &'static str {
        match self.0 & Self::CORE_MASK {
            0 => "link",
            1 => "typed",
            2 => "auto_bookmark",
            3 => "auto_subframe",
            4 => "manual_subframe",
            5 => "generated",
            6 => "start_page",
            7 => "form_submit",
            8 => "reload",
            9 => "keyword",
            10 => "keyword_generated",
            _ => "unknown",
        }
    }

    /// Parse a core type by its `core_name`.
    pub fn from_core_name(name: &str) -> Option<Self> {
        let core = match name {
            "link" => Self::LINK,
            "typed" => Self::TYPED,
            "auto_bookmark" => Self::AUTO_BOOKMARK,
            "auto_subframe" => Self::AUTO_SUBFRAME,
            "manual_subframe" => Self::MANUAL_SUBFRAME,
            "generated" => Self::GENERATED,
            "start_page" => Self::START_PAGE,
            "form_submit" => Self::FORM_SUBMIT,
            "reload" => Self::RELOAD,
            "keyword" => Self::KEYWORD,
            "keyword_generated" => Self::KEYWORD_GENERATED,
            _ => return None,
        };
        Some(core)
    }
}

impl BitOr for PageTransition {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for PageTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.core_name())?;
        let qualifiers = [
            (Self::CHAIN_START, "chain_start"),
            (Self::CHAIN_END, "chain_end"),
            (Self::CLIENT_REDIRECT, "client_redirect"),
            (Self::SERVER_REDIRECT, "server_redirect"),
        ];
        for (q, name) in qualifiers {
            if self.has(q) {
                write!(f, "|{}", name)?;
            }
        }
        Ok(())
    }
}

/// Where a visit came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitSource {
    /// A navigation in this profile.
    #[default]
    Browsed,
    /// Received from another device.
    Synced,
    /// Added by an extension.
    Extension,
    /// Imported from another browser.
    Imported,
}

impl VisitSource {
    pub fn as_i64(self) -> i64 {
        match self {
            VisitSource::Browsed => 0,
            VisitSource::Synced => 1,
            VisitSource::Extension => 2,
            VisitSource::Imported => 3,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => VisitSource::Synced,
            2 => VisitSource::Extension,
            3 => VisitSource::Imported,
            _ => VisitSource::Browsed,
        }
    }
}

// =============================================================================
// Catalog rows
// =============================================================================

/// A canonical URL with aggregate visit statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRow {
    pub id: UrlId,
    pub url: Url,
    pub title: String,
    pub visit_count: u32,
    pub typed_count: u32,
    pub last_visit: Option<DateTime<Utc>>,
    pub hidden: bool,
}

impl UrlRow {
    pub fn new(url: Url) -> Self {
        Self {
            id: UrlId::default(),
            url,
            title: String::new(),
            visit_count: 0,
            typed_count: 0,
            last_visit: None,
            hidden: false,
        }
    }
}

/// One navigation hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRow {
    pub id: VisitId,
    pub url_id: UrlId,
    pub visit_time: DateTime<Utc>,
    pub referring_visit: VisitId,
    pub transition: PageTransition,
    pub segment_id: SegmentId,
    pub is_indexed: bool,
    pub source: VisitSource,
}

impl VisitRow {
    pub fn new(
        url_id: UrlId,
        visit_time: DateTime<Utc>,
        referring_visit: VisitId,
        transition: PageTransition,
        source: VisitSource,
    ) -> Self {
        Self {
            id: VisitId::default(),
            url_id,
            visit_time,
            referring_visit,
            transition,
            segment_id: SegmentId::default(),
            is_indexed: false,
            source,
        }
    }
}

// =============================================================================
// Icons
// =============================================================================

/// Kind of page icon. Discriminants are bit flags so several kinds can be
/// requested at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IconType {
    Favicon = 1,
    TouchIcon = 2,
    TouchPrecomposedIcon = 4,
}

impl IconType {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: i64) -> Option<Self> {
        match bits {
            1 => Some(IconType::Favicon),
            2 => Some(IconType::TouchIcon),
            4 => Some(IconType::TouchPrecomposedIcon),
            _ => None,
        }
    }

    /// Whether an existing mapping of type `self` may be replaced in place by
    /// one of type `other`.
    pub fn is_substitutable(self, other: IconType) -> bool {
        matches!(
            (self, other),
            (IconType::TouchIcon, IconType::TouchPrecomposedIcon)
                | (IconType::TouchPrecomposedIcon, IconType::TouchIcon)
        ) || self == other
    }
}

/// Association between a page and one of its icons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IconMapping {
    pub id: IconMappingId,
    pub page_url: Url,
    pub icon_id: IconId,
    pub icon_type: IconType,
}

/// A stored icon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaviconRow {
    pub id: IconId,
    pub icon_url: Url,
    pub icon_type: IconType,
    pub last_updated: Option<DateTime<Utc>>,
    pub image: Option<Vec<u8>>,
}

/// Answer to a favicon lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaviconData {
    /// Whether the icon is known to the store at all.
    pub known_icon: bool,
    /// Whether the bytes are stale and should be refetched.
    pub expired: bool,
    pub icon_url: Option<Url>,
    pub icon_type: Option<IconType>,
    pub image: Option<Vec<u8>>,
}

/// A favicon coming from another browser, with the pages that used it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedFaviconUsage {
    pub favicon_url: Url,
    pub png_data: Vec<u8>,
    pub urls: BTreeSet<Url>,
}

// =============================================================================
// Queries
// =============================================================================

/// Time window and size limit of a history query. Unset bounds are open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Zero means no limit.
    pub max_count: usize,
}

impl QueryOptions {
    pub fn with_max_count(max_count: usize) -> Self {
        Self {
            max_count,
            ..Self::default()
        }
    }

    /// Room left for results when `have` are already collected.
    pub fn remaining(&self, have: usize) -> Option<usize> {
        if self.max_count == 0 {
            None
        } else {
            Some(self.max_count.saturating_sub(have))
        }
    }
}

/// A URL returned from a history query with the visit that matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlResult {
    pub row: UrlRow,
    pub visit_time: DateTime<Utc>,
    /// Text snippet around the match for full-text queries.
    pub snippet: String,
    /// Byte ranges of the query terms within the title.
    pub title_matches: Vec<(usize, usize)>,
}

impl UrlResult {
    pub fn new(row: UrlRow, visit_time: DateTime<Utc>) -> Self {
        Self {
            row,
            visit_time,
            snippet: String::new(),
            title_matches: Vec::new(),
        }
    }
}

/// Ordered query results, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResults {
    pub results: Vec<UrlResult>,
    /// Set when the query window reaches before the first recorded visit.
    pub reached_beginning: bool,
}

impl QueryResults {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn urls(&self) -> impl Iterator<Item = &Url> {
        self.results.iter().map(|r| &r.row.url)
    }
}

/// One entry of the most-visited segment ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageUsageData {
    pub segment_id: SegmentId,
    pub url_id: UrlId,
    pub url: Url,
    pub title: String,
    pub score: f64,
    /// -1 when the user has not pinned the segment.
    pub presentation_index: i32,
}

/// A most-visited page with the redirects that lead from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MostVisitedUrl {
    pub url: Url,
    pub title: String,
    /// Redirect destinations, always ending with `url` itself.
    pub redirects: Vec<Url>,
}

/// A search term typed for a keyword that navigated to a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSearchTermRow {
    pub keyword_id: i64,
    pub url_id: UrlId,
    pub term: String,
}

/// A recent keyword search term and when its URL was last visited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSearchTermVisit {
    pub term: String,
    pub time: Option<DateTime<Utc>>,
}

// =============================================================================
// Downloads
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    InProgress,
    Complete,
    Cancelled,
    Interrupted,
}

impl DownloadState {
    pub fn as_i64(self) -> i64 {
        match self {
            DownloadState::InProgress => 0,
            DownloadState::Complete => 1,
            DownloadState::Cancelled => 2,
            DownloadState::Interrupted => 4,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => DownloadState::Complete,
            2 => DownloadState::Cancelled,
            4 => DownloadState::Interrupted,
            _ => DownloadState::InProgress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRow {
    /// Zero until the row is persisted.
    pub db_handle: i64,
    pub url: String,
    pub path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub received_bytes: i64,
    pub total_bytes: i64,
    pub state: DownloadState,
    pub opened: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_core_and_qualifiers() {
        let t = PageTransition::TYPED | PageTransition::CHAIN_START | PageTransition::CHAIN_END;
        assert_eq!(t.core(), PageTransition::TYPED);
        assert!(t.has(PageTransition::CHAIN_START));
        assert!(t.has(PageTransition::CHAIN_END));
        assert!(!t.is_redirect());
        assert!(!t.without(PageTransition::CHAIN_END).has(PageTransition::CHAIN_END));
    }

    #[test]
    fn test_transition_redirect_mask() {
        assert!(PageTransition::LINK.with(PageTransition::SERVER_REDIRECT).is_redirect());
        assert!(PageTransition::LINK.with(PageTransition::CLIENT_REDIRECT).is_redirect());
        assert!(!PageTransition::LINK.is_redirect());
    }

    #[test]
    fn test_transition_has_ignores_zero_qualifier() {
        assert!(!PageTransition::TYPED.has(PageTransition::LINK));
    }

    #[test]
    fn test_main_frame() {
        assert!(PageTransition::LINK.is_main_frame());
        assert!(!PageTransition::AUTO_SUBFRAME.is_main_frame());
        assert!(!(PageTransition::MANUAL_SUBFRAME | PageTransition::CHAIN_END).is_main_frame());
    }

    #[test]
    fn test_transition_names() {
        assert_eq!(
            PageTransition::from_core_name("reload"),
            Some(PageTransition::RELOAD)
        );
        assert_eq!(PageTransition::from_core_name("bogus"), None);
        let t = PageTransition::LINK | PageTransition::SERVER_REDIRECT | PageTransition::CHAIN_END;
        assert_eq!(t.to_string(), "link|chain_end|server_redirect");
    }

    #[test]
    fn test_icon_type_substitution() {
        assert!(IconType::TouchIcon.is_substitutable(IconType::TouchPrecomposedIcon));
        assert!(IconType::TouchPrecomposedIcon.is_substitutable(IconType::TouchIcon));
        assert!(IconType::Favicon.is_substitutable(IconType::Favicon));
        assert!(!IconType::Favicon.is_substitutable(IconType::TouchIcon));
    }

    #[test]
    fn test_icon_type_bits() {
        for t in [
            IconType::Favicon,
            IconType::TouchIcon,
            IconType::TouchPrecomposedIcon,
        ] {
            assert_eq!(IconType::from_bits(i64::from(t.bits())), Some(t));
        }
        assert_eq!(IconType::from_bits(3), None);
    }

    #[test]
    fn test_query_options_remaining() {
        assert_eq!(QueryOptions::default().remaining(10), None);
        let opts = QueryOptions::with_max_count(5);
        assert_eq!(opts.remaining(2), Some(3));
        assert_eq!(opts.remaining(7), Some(0));
    }

    #[test]
    fn test_row_id_is_set() {
        assert!(!VisitId::default().is_set());
        assert!(UrlId(4).is_set());
    }

    #[test]
    fn test_download_state_codes() {
        assert_eq!(DownloadState::from_i64(4), DownloadState::Interrupted);
        assert_eq!(DownloadState::Cancelled.as_i64(), 2);
        assert_eq!(DownloadState::from_i64(99), DownloadState::InProgress);
    }
}
