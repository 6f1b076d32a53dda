//! Heuristic recommendation engine: filters and ranks unseen active events
//! for one viewer over a single consistent catalog snapshot.

use std::collections::BTreeSet;

use chrono::{Duration, NaiveDateTime};
use guide_core::InterestId;
use guide_store::{CatalogState, CatalogStore, StoreError};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "guide-recommend";

/// Events further out than this never become candidates.
pub const WINDOW_DAYS: i64 = 7;

const INTEREST_MATCH_SCORE: i64 = 3;
const LIKED_OVERLAP_BONUS: i64 = 2;
const DISLIKED_OVERLAP_PENALTY: i64 = 3;

/// Top `limit` event ids for the viewer, best first. Empty output is a valid
/// result, never an error: unknown viewers, viewers with no interests and
/// `limit == 0` all yield an empty list.
pub fn recommend<S: CatalogStore>(
    store: &S,
    viewer_id: Uuid,
    now: NaiveDateTime,
    limit: usize,
) -> Result<Vec<Uuid>, StoreError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    // One snapshot for the whole computation so interest expansion and
    // feedback partitioning agree.
    let state = store.snapshot()?;
    let Some(viewer) = state.viewers.get(&viewer_id) else {
        return Ok(Vec::new());
    };

    let interest_ids = expand_interests(&state, &viewer.interest_ids);
    if interest_ids.is_empty() {
        // No generic fallback: an interest-less viewer gets nothing.
        return Ok(Vec::new());
    }

    let mut liked = BTreeSet::new();
    let mut disliked = BTreeSet::new();
    for (event_id, like) in &viewer.feedback {
        if let Some(event) = state.events.get(event_id) {
            let bucket = if *like { &mut liked } else { &mut disliked };
            bucket.extend(event.interest_ids.iter().copied());
        }
    }

    let horizon = now + Duration::days(WINDOW_DAYS);
    let mut scored: Vec<(i64, NaiveDateTime, Uuid)> = Vec::new();
    for event in state.events.values() {
        if !event.is_active || viewer.feedback.contains_key(&event.id) {
            continue;
        }
        if !event
            .showtimes
            .iter()
            .any(|slot| slot.starts_at >= now && slot.starts_at <= horizon)
        {
            continue;
        }
        let matches = event.interest_ids.intersection(&interest_ids).count();
        if matches == 0 {
            continue;
        }

        let mut score = INTEREST_MATCH_SCORE * matches as i64;
        let soonest = event.soonest_showtime_after(now);
        if let Some(starts_at) = soonest {
            score += temporal_bonus(now, starts_at);
        }
        if event.interest_ids.iter().any(|id| liked.contains(id)) {
            score += LIKED_OVERLAP_BONUS;
        }
        if event.interest_ids.iter().any(|id| disliked.contains(id)) {
            score -= DISLIKED_OVERLAP_PENALTY;
        }

        scored.push((score, soonest.unwrap_or(NaiveDateTime::MAX), event.id));
    }

    // Descending score; ties broken by soonest upcoming showtime, then id,
    // so equal-score output is deterministic.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    debug!(viewer = %viewer_id, candidates = scored.len(), "scored recommendation candidates");
    Ok(scored.into_iter().take(limit).map(|(_, _, id)| id).collect())
}

/// Direct interests plus their immediate children; exactly one hierarchy
/// level, so a category pulls in its tags but never the other way around.
fn expand_interests(
    state: &CatalogState,
    direct: &BTreeSet<InterestId>,
) -> BTreeSet<InterestId> {
    let mut expanded = direct.clone();
    for id in direct {
        expanded.extend(state.children_of(*id));
    }
    expanded
}

fn temporal_bonus(now: NaiveDateTime, starts_at: NaiveDateTime) -> i64 {
    let hours = (starts_at - now).num_seconds() as f64 / 3600.0;
    if hours < 1.0 {
        -2
    } else if hours <= 3.0 {
        3
    } else if hours <= 24.0 {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use guide_core::{CatalogEvent, ShowtimeSlot, ViewerProfile};
    use guide_store::{content_hash, MemoryStore};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    struct Fixture {
        store: MemoryStore,
        viewer_id: Uuid,
    }

    /// Seeds interests, events with one showtime each, and a viewer holding
    /// the given interests. `events` maps title -> (interest names, hours
    /// from now until the single showtime).
    fn fixture(
        viewer_interests: &[&str],
        events: &[(&str, &[&str], i64)],
    ) -> (Fixture, Vec<(String, Uuid)>) {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        let viewer_id = store
            .in_transaction(|state| {
                for (title, interests, hours) in events {
                    let mut event =
                        CatalogEvent::new(title.to_string(), "", content_hash(""));
                    event
                        .showtimes
                        .push(ShowtimeSlot::new(now() + Duration::hours(*hours), "Hall"));
                    event.is_active = true;
                    let id = state.insert_event(event)?;
                    for name in *interests {
                        let interest = state.get_or_create_interest(name, None)?;
                        state.attach_interest(id, interest)?;
                    }
                }
                let mut viewer = ViewerProfile::new("ana");
                for name in viewer_interests {
                    let interest = state.get_or_create_interest(name, None)?;
                    viewer.interest_ids.insert(interest);
                }
                let viewer_id = viewer.id;
                state.put_viewer(viewer);
                Ok(viewer_id)
            })
            .unwrap();
        let state = store.snapshot().unwrap();
        for event in state.events.values() {
            ids.push((event.title.clone(), event.id));
        }
        (Fixture { store, viewer_id }, ids)
    }

    fn id_of(ids: &[(String, Uuid)], title: &str) -> Uuid {
        ids.iter().find(|(t, _)| t == title).map(|(_, id)| *id).unwrap()
    }

    #[test]
    fn music_viewer_gets_only_the_music_event() {
        let (fx, ids) = fixture(
            &["Music"],
            &[("A", &["Music"], 2), ("B", &["Sports"], 2)],
        );
        let result = recommend(&fx.store, fx.viewer_id, now(), 10).unwrap();
        assert_eq!(result, vec![id_of(&ids, "A")]);
    }

    #[test]
    fn disliked_interest_lowers_score_but_noncandidates_stay_out() {
        let (fx, ids) = fixture(
            &["Music"],
            &[
                ("A", &["Music"], 2),
                ("B", &["Sports"], 2),
                ("DislikedGig", &["Music"], 2),
            ],
        );
        fx.store
            .in_transaction(|state| {
                state.set_feedback(fx.viewer_id, id_of(&ids, "DislikedGig"), false)?;
                Ok(())
            })
            .unwrap();

        let result = recommend(&fx.store, fx.viewer_id, now(), 10).unwrap();
        // A scores 3 (match) + 3 (temporal) - 3 (disliked Music overlap) = 3
        // and is still returned; B never becomes a candidate at all; the
        // disliked event itself is excluded by feedback.
        assert_eq!(result, vec![id_of(&ids, "A")]);
    }

    #[test]
    fn feedback_events_are_always_excluded() {
        let (fx, ids) = fixture(
            &["Music"],
            &[("A", &["Music"], 2), ("B", &["Music"], 3)],
        );
        fx.store
            .in_transaction(|state| {
                state.set_feedback(fx.viewer_id, id_of(&ids, "A"), true)?;
                Ok(())
            })
            .unwrap();
        let result = recommend(&fx.store, fx.viewer_id, now(), 10).unwrap();
        assert_eq!(result, vec![id_of(&ids, "B")]);
    }

    #[test]
    fn limit_bounds_and_zero_limit() {
        let (fx, _) = fixture(
            &["Music"],
            &[
                ("A", &["Music"], 2),
                ("B", &["Music"], 5),
                ("C", &["Music"], 8),
            ],
        );
        assert_eq!(recommend(&fx.store, fx.viewer_id, now(), 2).unwrap().len(), 2);
        assert!(recommend(&fx.store, fx.viewer_id, now(), 0).unwrap().is_empty());
    }

    #[test]
    fn interestless_viewer_gets_no_generic_fallback() {
        let (fx, _) = fixture(&[], &[("A", &["Music"], 2)]);
        assert!(recommend(&fx.store, fx.viewer_id, now(), 10).unwrap().is_empty());
    }

    #[test]
    fn unknown_viewer_yields_empty() {
        let (fx, _) = fixture(&["Music"], &[("A", &["Music"], 2)]);
        assert!(recommend(&fx.store, Uuid::new_v4(), now(), 10).unwrap().is_empty());
    }

    #[test]
    fn category_interest_expands_to_child_tags() {
        let store = MemoryStore::new();
        let viewer_id = store
            .in_transaction(|state| {
                let music = state.get_or_create_interest("Music", None)?;
                let jazz = state.get_or_create_interest("Jazz", Some(music))?;

                let mut event = CatalogEvent::new("JazzNight", "", content_hash(""));
                event
                    .showtimes
                    .push(ShowtimeSlot::new(now() + Duration::hours(2), "Hall"));
                event.is_active = true;
                let id = state.insert_event(event)?;
                // Tagged only with the child, not the category itself.
                state.attach_interest(id, jazz)?;

                let mut viewer = ViewerProfile::new("ana");
                viewer.interest_ids.insert(music);
                let viewer_id = viewer.id;
                state.put_viewer(viewer);
                Ok(viewer_id)
            })
            .unwrap();

        assert_eq!(recommend(&store, viewer_id, now(), 10).unwrap().len(), 1);
    }

    #[test]
    fn window_and_activity_filters_apply() {
        let (fx, ids) = fixture(
            &["Music"],
            &[
                ("InWindow", &["Music"], 48),
                ("BeyondWindow", &["Music"], 24 * 8),
            ],
        );
        // Add an inactive event as well to check the active filter.
        fx.store
            .in_transaction(|state| {
                let mut extra = CatalogEvent::new("Inactive", "x", content_hash("x"));
                extra
                    .showtimes
                    .push(ShowtimeSlot::new(now() + Duration::hours(2), "Hall"));
                let inactive_id = state.insert_event(extra)?;
                let music = state.interest_by_name("Music").unwrap().id;
                state.attach_interest(inactive_id, music)?;
                Ok(())
            })
            .unwrap();

        let result = recommend(&fx.store, fx.viewer_id, now(), 10).unwrap();
        assert_eq!(result, vec![id_of(&ids, "InWindow")]);
    }

    #[test]
    fn scoring_matches_the_documented_weights() {
        // 2h out: 3 (one match) + 3 (1-3h bonus) = 6.
        // 30m out: 3 - 2 = 1. 12h out: 3 + 1 = 4. 3d out: 3 + 0 = 3.
        let (fx, ids) = fixture(
            &["Music"],
            &[
                ("TwoHours", &["Music"], 2),
                ("HalfHour", &["Music"], 0),
                ("TwelveHours", &["Music"], 12),
                ("ThreeDays", &["Music"], 72),
            ],
        );
        let result = recommend(&fx.store, fx.viewer_id, now(), 10).unwrap();
        assert_eq!(
            result,
            vec![
                id_of(&ids, "TwoHours"),
                id_of(&ids, "TwelveHours"),
                id_of(&ids, "ThreeDays"),
                id_of(&ids, "HalfHour"),
            ]
        );
    }

    #[test]
    fn liked_overlap_beats_equal_match_count() {
        let (fx, ids) = fixture(
            &["Music"],
            &[
                ("Plain", &["Music"], 30),
                ("LikedKin", &["Music"], 30),
                ("PastLiked", &["Jazz"], 2),
            ],
        );
        // Like an event that shares the Jazz tag with LikedKin only after
        // tagging LikedKin with Jazz as well.
        fx.store
            .in_transaction(|state| {
                let jazz = state.get_or_create_interest("Jazz", None)?;
                let kin = state.find_event_by_title("LikedKin").unwrap();
                state.attach_interest(kin, jazz)?;
                state.set_feedback(fx.viewer_id, id_of(&ids, "PastLiked"), true)?;
                Ok(())
            })
            .unwrap();

        let result = recommend(&fx.store, fx.viewer_id, now(), 10).unwrap();
        // Both score 3 on the Music match with no temporal bonus at 30h out,
        // but LikedKin picks up the +2 liked-overlap bonus.
        assert_eq!(result[0], id_of(&ids, "LikedKin"));
        assert!(result.contains(&id_of(&ids, "Plain")));
    }

    #[test]
    fn equal_scores_break_ties_by_soonest_then_id() {
        let (fx, ids) = fixture(
            &["Music"],
            &[("Later", &["Music"], 50), ("Sooner", &["Music"], 40)],
        );
        let result = recommend(&fx.store, fx.viewer_id, now(), 10).unwrap();
        assert_eq!(
            result,
            vec![id_of(&ids, "Sooner"), id_of(&ids, "Later")]
        );
    }
}
