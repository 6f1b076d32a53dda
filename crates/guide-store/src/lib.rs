//! Catalog persistence collaborator: the store interface the pipeline needs,
//! a transactional in-memory implementation, and the content-hash primitive.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use chrono::NaiveDateTime;
use guide_core::{CatalogEvent, Interest, InterestId, ShowtimeSlot, ViewerProfile};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "guide-store";

/// Deterministic fixed-length fingerprint of description text; part of the
/// dedup identity key. Empty input hashes to the stable empty-digest constant.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store failure: {0}")]
    Internal(String),
}

/// One consistent catalog snapshot: events, the interest forest and viewer
/// profiles. The reconciler mutates a working copy of this inside a store
/// transaction; readers only ever see committed copies.
#[derive(Debug, Clone, Default)]
pub struct CatalogState {
    pub events: BTreeMap<Uuid, CatalogEvent>,
    pub interests: BTreeMap<InterestId, Interest>,
    pub viewers: BTreeMap<Uuid, ViewerProfile>,
    next_interest_id: u32,
}

impl CatalogState {
    pub fn find_event_by_title_and_hash(&self, title: &str, hash: &str) -> Option<Uuid> {
        self.events
            .values()
            .find(|event| event.title == title && event.description_hash == hash)
            .map(|event| event.id)
    }

    pub fn find_event_by_title(&self, title: &str) -> Option<Uuid> {
        self.events
            .values()
            .find(|event| event.title == title)
            .map(|event| event.id)
    }

    /// Upsert guard for the natural key: inserting a second event with the
    /// same (title, description_hash) is a conflict, not a silent duplicate.
    pub fn insert_event(&mut self, event: CatalogEvent) -> Result<Uuid, StoreError> {
        if self
            .find_event_by_title_and_hash(&event.title, &event.description_hash)
            .is_some()
        {
            return Err(StoreError::Conflict(format!(
                "event '{}' with identical description already stored",
                event.title
            )));
        }
        let id = event.id;
        self.events.insert(id, event);
        Ok(id)
    }

    pub fn remove_event(&mut self, id: Uuid) -> Option<CatalogEvent> {
        self.events.remove(&id)
    }

    /// Append-only set union on (timestamp, location); returns how many slots
    /// were actually new. Any addition re-activates the event.
    pub fn merge_showtimes(
        &mut self,
        event_id: Uuid,
        slots: &[ShowtimeSlot],
    ) -> Result<usize, StoreError> {
        let event = self
            .events
            .get_mut(&event_id)
            .ok_or_else(|| StoreError::NotFound(format!("event {event_id}")))?;
        let mut existing: BTreeSet<(NaiveDateTime, String)> = event
            .showtimes
            .iter()
            .map(|slot| (slot.starts_at, slot.location.clone()))
            .collect();
        let mut added = 0;
        for slot in slots {
            if existing.insert((slot.starts_at, slot.location.clone())) {
                event.showtimes.push(slot.clone());
                added += 1;
            }
        }
        if added > 0 {
            event.is_active = true;
        }
        Ok(added)
    }

    pub fn interest_by_name(&self, name: &str) -> Option<&Interest> {
        self.interests.values().find(|interest| interest.name == name)
    }

    /// Lookup/create-by-name with optional parent. Enforces the taxonomy
    /// invariants: names are globally unique and the forest never exceeds one
    /// level below a category.
    pub fn get_or_create_interest(
        &mut self,
        name: &str,
        parent_id: Option<InterestId>,
    ) -> Result<InterestId, StoreError> {
        if let Some(existing) = self.interest_by_name(name) {
            if existing.parent_id == parent_id {
                return Ok(existing.id);
            }
            return Err(StoreError::Conflict(format!(
                "interest name '{name}' already taken with a different parent"
            )));
        }
        if let Some(parent) = parent_id {
            let parent_node = self
                .interests
                .get(&parent)
                .ok_or_else(|| StoreError::NotFound(format!("parent interest {parent}")))?;
            if parent_node.parent_id.is_some() {
                return Err(StoreError::Conflict(format!(
                    "interest '{}' is a tag and cannot parent '{name}'",
                    parent_node.name
                )));
            }
        }
        let id = InterestId(self.next_interest_id);
        self.next_interest_id += 1;
        self.interests.insert(
            id,
            Interest {
                id,
                name: name.to_string(),
                parent_id,
            },
        );
        Ok(id)
    }

    pub fn children_of(&self, id: InterestId) -> Vec<InterestId> {
        self.interests
            .values()
            .filter(|interest| interest.parent_id == Some(id))
            .map(|interest| interest.id)
            .collect()
    }

    /// Idempotent attach; `true` when the reference was actually new.
    pub fn attach_interest(
        &mut self,
        event_id: Uuid,
        interest_id: InterestId,
    ) -> Result<bool, StoreError> {
        if !self.interests.contains_key(&interest_id) {
            return Err(StoreError::NotFound(format!("interest {interest_id}")));
        }
        let event = self
            .events
            .get_mut(&event_id)
            .ok_or_else(|| StoreError::NotFound(format!("event {event_id}")))?;
        Ok(event.interest_ids.insert(interest_id))
    }

    pub fn put_viewer(&mut self, viewer: ViewerProfile) {
        self.viewers.insert(viewer.id, viewer);
    }

    pub fn has_feedback_for(&self, event_id: Uuid) -> bool {
        self.viewers
            .values()
            .any(|viewer| viewer.feedback.contains_key(&event_id))
    }

    /// Feedback toggle: resubmitting the same value removes the row, a
    /// differing value updates it. Returns the stored value, `None` when the
    /// row was removed.
    pub fn set_feedback(
        &mut self,
        viewer_id: Uuid,
        event_id: Uuid,
        like: bool,
    ) -> Result<Option<bool>, StoreError> {
        if !self.events.contains_key(&event_id) {
            return Err(StoreError::NotFound(format!("event {event_id}")));
        }
        let viewer = self
            .viewers
            .get_mut(&viewer_id)
            .ok_or_else(|| StoreError::NotFound(format!("viewer {viewer_id}")))?;
        match viewer.feedback.get(&event_id).copied() {
            Some(existing) if existing == like => {
                viewer.feedback.remove(&event_id);
                Ok(None)
            }
            _ => {
                viewer.feedback.insert(event_id, like);
                Ok(Some(like))
            }
        }
    }
}

/// What the pipeline consumes from persistence. Each call is transactional
/// at call granularity; `in_transaction` commits only when the closure
/// succeeds, so a failing batch never partially lands.
pub trait CatalogStore: Send + Sync {
    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&mut CatalogState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError>;

    /// One consistent read-only copy of the committed catalog.
    fn snapshot(&self) -> Result<CatalogState, StoreError>;

    fn viewer(&self, id: Uuid) -> Result<Option<ViewerProfile>, StoreError>;
}

/// Reference store: copy-on-write over an `RwLock`. Writers clone the state,
/// apply the closure, and swap on success; concurrent readers never observe
/// a half-merged catalog. Single writer at a time by construction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<CatalogState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogStore for MemoryStore {
    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&mut CatalogState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| StoreError::Internal("catalog lock poisoned".to_string()))?;
        let mut working = guard.clone();
        let value = f(&mut working)?;
        debug!(
            events = working.events.len(),
            interests = working.interests.len(),
            "committing catalog transaction"
        );
        *guard = working;
        Ok(value)
    }

    fn snapshot(&self) -> Result<CatalogState, StoreError> {
        self.inner
            .read()
            .map(|state| state.clone())
            .map_err(|_| StoreError::Internal("catalog lock poisoned".to_string()))
    }

    fn viewer(&self, id: Uuid) -> Result<Option<ViewerProfile>, StoreError> {
        Ok(self.snapshot()?.viewers.get(&id).cloned())
    }
}
