//! Core domain model plus the pure text/temporal primitives for MyGuide.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "guide-core";

/// One (timestamp, location) occurrence of an event. Owned by exactly one
/// [`CatalogEvent`]; the pair itself is the merge identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShowtimeSlot {
    pub starts_at: NaiveDateTime,
    pub location: String,
}

impl ShowtimeSlot {
    pub fn new(starts_at: NaiveDateTime, location: impl Into<String>) -> Self {
        Self {
            starts_at,
            location: location.into(),
        }
    }
}

/// Ephemeral scraped record handed from the listing scraper to the
/// reconciler, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub title: String,
    pub link: String,
    pub image_url: Option<String>,
    /// Raw (trimmed, case-preserved) description; hashed for dedup identity.
    pub description: Option<String>,
    pub normalized_description: Option<String>,
    pub showtimes: Vec<ShowtimeSlot>,
    /// Cleaned interest-tag strings, not yet resolved against the taxonomy.
    pub interests: Vec<String>,
}

/// Persisted, deduplicated event. `(title, description_hash)` is the natural
/// key of an active event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEvent {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub description_hash: String,
    pub is_active: bool,
    pub showtimes: Vec<ShowtimeSlot>,
    pub interest_ids: BTreeSet<InterestId>,
}

impl CatalogEvent {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        description_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            description_hash: description_hash.into(),
            is_active: false,
            showtimes: Vec::new(),
            interest_ids: BTreeSet::new(),
        }
    }

    pub fn soonest_showtime_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        self.showtimes
            .iter()
            .map(|slot| slot.starts_at)
            .filter(|starts_at| *starts_at >= now)
            .min()
    }
}

/// Key of an [`Interest`] taxonomy node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InterestId(pub u32);

impl fmt::Display for InterestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Taxonomy node: a category (no parent) or a tag (parent is a category).
/// Children are derived by scanning `parent_id`, never stored back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    pub id: InterestId,
    pub name: String,
    pub parent_id: Option<InterestId>,
}

impl Interest {
    pub fn is_category(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A viewer's stored interests plus like/dislike feedback keyed by event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerProfile {
    pub id: Uuid,
    pub username: String,
    pub interest_ids: BTreeSet<InterestId>,
    pub feedback: BTreeMap<Uuid, bool>,
}

impl ViewerProfile {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            interest_ids: BTreeSet::new(),
            feedback: BTreeMap::new(),
        }
    }
}

/// Injected mapping from a listing-URL path fragment to a category name.
/// Unmapped fragments resolve to the `"Unknown"` sentinel; the category is
/// never derived from page content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryMap(BTreeMap<String, String>);

impl CategoryMap {
    pub const UNKNOWN: &'static str = "Unknown";

    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn category_for_url(&self, url: &str) -> String {
        let fragment = Url::parse(url).ok().and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.find(|segment| !segment.is_empty()))
                .map(|segment| segment.to_ascii_lowercase())
        });
        fragment
            .and_then(|fragment| self.0.get(&fragment).cloned())
            .unwrap_or_else(|| Self::UNKNOWN.to_string())
    }
}

/// Text cleanup shared by the detail extractor: drops LRM marks, strips a
/// trailing `[\s-]*\d{4,}` noise suffix and trims. With `filter_digits` set,
/// a result that still has more than 5 digit characters and nothing but
/// digits, whitespace and `+-()` is treated as noise, not a real tag.
pub fn clean_text(text: &str, filter_digits: bool) -> Option<String> {
    let text: String = text.chars().filter(|c| *c != '\u{200e}').collect();
    let text = strip_numeric_suffix(&text).trim().to_string();
    if filter_digits {
        let digits = text.chars().filter(char::is_ascii_digit).count();
        let noise_only = text
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_whitespace() || matches!(c, '+' | '-' | '(' | ')'));
        if digits > 5 && noise_only {
            return None;
        }
    }
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn strip_numeric_suffix(text: &str) -> &str {
    let mut digit_start = text.len();
    for (index, c) in text.char_indices().rev() {
        if c.is_ascii_digit() {
            digit_start = index;
        } else {
            break;
        }
    }
    if text.len() - digit_start < 4 {
        return text;
    }
    let mut cut = digit_start;
    while let Some(c) = text[..cut].chars().next_back() {
        if c.is_whitespace() || c == '-' {
            cut -= c.len_utf8();
        } else {
            break;
        }
    }
    &text[..cut]
}

/// Canonical description form used for display and comparison: trimmed,
/// lower-cased, newlines collapsed to spaces.
pub fn normalize_description(desc: &str) -> Option<String> {
    let normalized = desc
        .trim()
        .to_lowercase()
        .replace('\n', " ")
        .replace('\r', "");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Parses a schedule anchor's machine-readable date attribute. The upstream
/// markup mixes `/`, `.`, `-` and `_` as time separators; all are normalized
/// to `:` before the fixed `%m/%d/%Y %H:%M` pattern is applied. Unparsable
/// input yields `None` so callers can drop the entry.
pub fn parse_showtime(raw: &str) -> Option<NaiveDateTime> {
    let mut parts = raw.split_whitespace();
    let date_part = parts.next()?;
    let time_part = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let time_part: String = time_part
        .chars()
        .map(|c| match c {
            '/' | '.' | '-' | '_' => ':',
            other => other,
        })
        .collect();
    NaiveDateTime::parse_from_str(&format!("{date_part} {time_part}"), "%m/%d/%Y %H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn clean_text_strips_long_numeric_suffix() {
        assert_eq!(
            clean_text("Jazz Evening - 202601", false).as_deref(),
            Some("Jazz Evening")
        );
        assert_eq!(
            clean_text("Jazz Evening 12345", false).as_deref(),
            Some("Jazz Evening")
        );
    }

    #[test]
    fn clean_text_keeps_short_numeric_suffix() {
        assert_eq!(
            clean_text("Area 51", false).as_deref(),
            Some("Area 51")
        );
        assert_eq!(clean_text("Hall 300", true).as_deref(), Some("Hall 300"));
    }

    #[test]
    fn clean_text_drops_phone_number_noise() {
        assert_eq!(clean_text("+375 (29) 123-45-67", true), None);
    }

    #[test]
    fn clean_text_keeps_digit_heavy_text_with_letters() {
        // More than 5 digits but not digits/punctuation only, so it stays.
        assert_eq!(
            clean_text("Room 123456 opening", true).as_deref(),
            Some("Room 123456 opening")
        );
    }

    #[test]
    fn clean_text_empty_results_become_none() {
        assert_eq!(clean_text("", false), None);
        assert_eq!(clean_text("   12345678", false), None);
    }

    #[test]
    fn normalize_description_folds_case_and_newlines() {
        assert_eq!(
            normalize_description("  A Night\nAt The\r\nOpera  ").as_deref(),
            Some("a night at the opera")
        );
        assert_eq!(normalize_description("   "), None);
    }

    #[test]
    fn parse_showtime_accepts_every_separator() {
        let expected = NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(18, 30, 0)
            .unwrap();
        for raw in [
            "03/14/2026 18:30",
            "03/14/2026 18/30",
            "03/14/2026 18.30",
            "03/14/2026 18-30",
            "03/14/2026 18_30",
        ] {
            assert_eq!(parse_showtime(raw), Some(expected), "raw={raw}");
        }
    }

    #[test]
    fn parse_showtime_rejects_garbage() {
        assert_eq!(parse_showtime("not a date"), None);
        assert_eq!(parse_showtime("03/14/2026"), None);
        assert_eq!(parse_showtime("2026-03-14 18:30"), None);
        assert_eq!(parse_showtime("03/14/2026 18:30 extra"), None);
    }

    #[test]
    fn category_map_resolves_first_path_segment() {
        let map = CategoryMap::new(BTreeMap::from([
            ("kino".to_string(), "Movies".to_string()),
            ("festivali".to_string(), "Festivals".to_string()),
        ]));
        assert_eq!(
            map.category_for_url("https://afisha.relax.by/kino/minsk/"),
            "Movies"
        );
        assert_eq!(
            map.category_for_url("https://afisha.relax.by/FESTIVALI/"),
            "Festivals"
        );
        assert_eq!(map.category_for_url("https://afisha.relax.by/"), "Unknown");
        assert_eq!(
            map.category_for_url("https://afisha.relax.by/teatr/"),
            "Unknown"
        );
        assert_eq!(map.category_for_url("not a url"), "Unknown");
    }

    #[test]
    fn soonest_showtime_ignores_past_slots() {
        let mut event = CatalogEvent::new("t", "", "hash");
        let day = |d: u32, h: u32| {
            NaiveDate::from_ymd_opt(2026, 5, d)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap()
        };
        event.showtimes = vec![
            ShowtimeSlot::new(day(1, 12), "a"),
            ShowtimeSlot::new(day(3, 9), "b"),
            ShowtimeSlot::new(day(2, 20), "c"),
        ];
        assert_eq!(event.soonest_showtime_after(day(2, 0)), Some(day(2, 20)));
        assert_eq!(event.soonest_showtime_after(day(4, 0)), None);
    }
}
