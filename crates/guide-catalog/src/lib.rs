//! Catalog reconciliation: dedup/merge of scraped candidates, the
//! stale-event sweep, the ingestion service and its configuration.

use std::path::Path;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use guide_core::{CatalogEvent, CategoryMap, EventCandidate};
use guide_scrape::{FetchConfig, ListingScraper};
use guide_store::{content_hash, CatalogState, CatalogStore, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "guide-catalog";

/// Terminal counts of one ingestion run. Partial upstream failure still
/// produces a report; the run itself never fails on dropped items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub hard_deleted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

enum Disposition {
    Created,
    Updated,
    Skipped,
}

/// Merges candidate batches into the catalog under one store transaction.
/// The category interest comes from the configured source identity, never
/// from page content.
pub struct Reconciler<'a, S: CatalogStore> {
    store: &'a S,
    category: String,
}

impl<'a, S: CatalogStore> Reconciler<'a, S> {
    pub fn new(store: &'a S, category: impl Into<String>) -> Self {
        Self {
            store,
            category: category.into(),
        }
    }

    /// One transaction for the whole batch: any error aborts it with no
    /// partial commit.
    pub fn add_batch(&self, candidates: &[EventCandidate]) -> Result<BatchOutcome, StoreError> {
        self.store.in_transaction(|state| {
            let mut outcome = BatchOutcome::default();
            for candidate in candidates {
                match self.reconcile_one(state, candidate)? {
                    Disposition::Created => outcome.created += 1,
                    Disposition::Updated => outcome.updated += 1,
                    Disposition::Skipped => outcome.skipped += 1,
                }
            }
            Ok(outcome)
        })
    }

    fn reconcile_one(
        &self,
        state: &mut CatalogState,
        candidate: &EventCandidate,
    ) -> Result<Disposition, StoreError> {
        let description = candidate.description.clone().unwrap_or_default();
        let hash = content_hash(&description);

        let mut existing = state.find_event_by_title_and_hash(&candidate.title, &hash);
        if existing.is_none() && !description.is_empty() {
            // Title-only fallback so a legitimate description edit still
            // lands on the same event. Known tradeoff: two distinct events
            // that share a title get merged here.
            existing = state.find_event_by_title(&candidate.title);
        }

        match existing {
            Some(id) => {
                let mut changed = state.merge_showtimes(id, &candidate.showtimes)? > 0;
                let description_changed = state
                    .events
                    .get(&id)
                    .is_some_and(|event| event.description != description);
                if description_changed {
                    if let Some(event) = state.events.get_mut(&id) {
                        event.description = description;
                        event.description_hash = hash;
                    }
                    changed = true;
                }
                changed |= self.attach_interests(state, id, &candidate.interests)?;
                Ok(if changed {
                    Disposition::Updated
                } else {
                    Disposition::Skipped
                })
            }
            None => {
                let event = CatalogEvent::new(candidate.title.clone(), description, hash);
                let id = state.insert_event(event)?;
                state.merge_showtimes(id, &candidate.showtimes)?;
                self.attach_interests(state, id, &candidate.interests)?;
                Ok(Disposition::Created)
            }
        }
    }

    fn attach_interests(
        &self,
        state: &mut CatalogState,
        event_id: uuid::Uuid,
        tags: &[String],
    ) -> Result<bool, StoreError> {
        if tags.is_empty() {
            return Ok(false);
        }
        let parent = state.get_or_create_interest(&self.category, None)?;
        let mut attached = false;
        for tag in tags {
            let child = state.get_or_create_interest(tag, Some(parent))?;
            attached |= state.attach_interest(event_id, child)?;
        }
        attached |= state.attach_interest(event_id, parent)?;
        Ok(attached)
    }
}

/// Drops strictly-past showtimes, deactivates events left with none, and
/// hard-deletes inactive events nobody has feedback on. One transaction;
/// returns the deleted events.
pub fn sweep_stale_events<S: CatalogStore>(
    store: &S,
    now: NaiveDateTime,
) -> Result<Vec<CatalogEvent>, StoreError> {
    store.in_transaction(|state| {
        let ids: Vec<uuid::Uuid> = state.events.keys().copied().collect();
        let mut deleted = Vec::new();
        for id in ids {
            let retire = match state.events.get_mut(&id) {
                Some(event) => {
                    event.showtimes.retain(|slot| slot.starts_at >= now);
                    event.is_active = !event.showtimes.is_empty();
                    !event.is_active
                }
                None => false,
            };
            if retire && !state.has_feedback_for(id) {
                if let Some(event) = state.remove_event(id) {
                    deleted.push(event);
                }
            }
        }
        Ok(deleted)
    })
}

/// Full ingestion run: scrape, reconcile, sweep. Always completes with
/// counts even when some upstream items permanently failed.
pub async fn run_ingestion<S: CatalogStore>(
    scraper: &ListingScraper,
    store: &S,
    categories: &CategoryMap,
) -> Result<IngestReport, StoreError> {
    let candidates = scraper.parse().await;
    let category = categories.category_for_url(scraper.listing_url());
    ingest_batch_and_sweep(store, &category, &candidates, Local::now().naive_local())
}

/// Reconcile + sweep at a fixed `now`; split out from [`run_ingestion`] so
/// the merge semantics stay testable without a network.
pub fn ingest_batch_and_sweep<S: CatalogStore>(
    store: &S,
    category: &str,
    candidates: &[EventCandidate],
    now: NaiveDateTime,
) -> Result<IngestReport, StoreError> {
    info!(candidates = candidates.len(), category, "reconciling scraped batch");
    let batch = Reconciler::new(store, category).add_batch(candidates)?;
    let deleted = sweep_stale_events(store, now)?;
    let report = IngestReport {
        created: batch.created,
        updated: batch.updated,
        skipped: batch.skipped,
        hard_deleted: deleted.len(),
    };
    info!(
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        hard_deleted = report.hard_deleted,
        "ingestion finished"
    );
    Ok(report)
}

fn default_timeout_secs() -> u64 {
    30
}

/// Startup configuration: YAML file plus env-var overrides. A missing or
/// unreadable file is fatal at startup only; nothing later depends on it.
#[derive(Debug, Clone, Deserialize)]
pub struct GuideConfig {
    pub listing_url: String,
    #[serde(default = "default_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub categories: CategoryMap,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl GuideConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: GuideConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("GUIDE_CONFIG").unwrap_or_else(|_| "guide.yaml".to_string());
        Self::load(path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("GUIDE_LISTING_URL") {
            self.listing_url = url;
        }
        if let Ok(secs) = std::env::var("GUIDE_HTTP_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.http_timeout_secs = secs;
            }
        }
        if let Ok(agent) = std::env::var("GUIDE_USER_AGENT") {
            self.user_agent = Some(agent);
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            ..FetchConfig::default()
        }
    }
}
