//! Listing crawler: bounded-concurrency HTTP fetch, detail-page extraction
//! and the retry-round orchestration that yields event candidates.

use std::sync::Arc;
use std::time::Duration;

use guide_core::{clean_text, normalize_description, parse_showtime, EventCandidate, ShowtimeSlot};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

pub const CRATE_NAME: &str = "guide-scrape";

#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Timeout, connection failure or an error status. Retried per policy
    /// by the orchestrator, eventually dropped and logged; never fatal.
    #[error("transient fetch failure for {url}: {reason}")]
    Transient { url: String, reason: String },
    /// Unexpected markup. Isolated to the one item it came from.
    #[error("unexpected markup in {url}: {reason}")]
    Structural { url: String, reason: String },
}

/// Retry, timeout and concurrency knobs for one scraper instance.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Listing fetch: bounded fixed-sleep retry.
    pub listing_attempts: usize,
    pub listing_retry_delay: Duration,
    /// Detail fetch: run-scoped permit pool + resubmission rounds.
    pub detail_permits: usize,
    pub detail_rounds: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            listing_attempts: 5,
            listing_retry_delay: Duration::from_secs(2),
            detail_permits: 20,
            detail_rounds: 3,
        }
    }
}

/// HTTP retrieval with the two retry policies kept deliberately separate:
/// the listing fetch retries internally with a fixed sleep, while a detail
/// fetch makes exactly one attempt and leaves resubmission to the caller.
#[derive(Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Up to `listing_attempts` tries with a fixed sleep in between. Total
    /// exhaustion is reported as `None` (an empty listing), not an error.
    pub async fn fetch_listing(&self, url: &str) -> Option<String> {
        for attempt in 1..=self.config.listing_attempts {
            match self.get_text(url).await {
                Ok(body) => return Some(body),
                Err(err) => {
                    warn!(url, attempt, error = %err, "listing fetch failed");
                    if attempt < self.config.listing_attempts {
                        tokio::time::sleep(self.config.listing_retry_delay).await;
                    }
                }
            }
        }
        None
    }

    /// One attempt under one permit from the run-scoped pool. Transient
    /// failures go back to the orchestrator for the next retry round.
    pub async fn fetch_detail(
        &self,
        url: &str,
        permits: &Semaphore,
    ) -> Result<String, ScrapeError> {
        let _permit = permits.acquire().await.map_err(|_| ScrapeError::Transient {
            url: url.to_string(),
            reason: "permit pool closed".to_string(),
        })?;
        self.get_text(url).await
    }

    async fn get_text(&self, url: &str) -> Result<String, ScrapeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ScrapeError::Transient {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Transient {
                url: url.to_string(),
                reason: format!("http status {status}"),
            });
        }
        response.text().await.map_err(|err| ScrapeError::Transient {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }
}

/// Listing stub: enough to schedule a detail fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStub {
    pub title: String,
    pub link: String,
    pub image_url: Option<String>,
}

/// Structured fragment pulled out of one detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFragment {
    pub description: Option<String>,
    pub normalized_description: Option<String>,
    pub interests: Vec<String>,
    pub showtimes: Vec<ShowtimeSlot>,
}

/// Turns one detail page body into a [`DetailFragment`]. Parsing is
/// best-effort: unparsable showtimes are dropped in place, and only a
/// structural failure surfaces as an error for this one item.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetailExtractor;

impl DetailExtractor {
    pub fn extract(&self, url: &str, body: &str) -> Result<DetailFragment, ScrapeError> {
        let document = Html::parse_document(body);

        let description_sel = parse_selector(url, "div.b-afisha_cinema_description_text")?;
        let description = document
            .select(&description_sel)
            .next()
            .map(|node| collect_text(&node))
            .filter(|text| !text.is_empty());
        let normalized_description = description
            .as_deref()
            .and_then(normalize_description);

        let tag_sel = parse_selector(url, "div.b-afisha_cinema_description_table a")?;
        let interests: Vec<String> = document
            .select(&tag_sel)
            .filter_map(|node| {
                let text = collect_text(&node);
                if text.is_empty() {
                    None
                } else {
                    clean_text(&text, true)
                }
            })
            .collect();

        let time_sel = parse_selector(url, "a.schedule__seance-time")?;
        let place_sel = parse_selector(url, "div.schedule__place a.schedule__place-link")?;
        let address_sel = parse_selector(url, "div.schedule__place span.text-black-light")?;

        let mut showtimes = Vec::new();
        for anchor in document.select(&time_sel) {
            let Some(raw) = anchor.value().attr("data-date-format") else {
                continue;
            };
            let Some(starts_at) = parse_showtime(raw) else {
                warn!(url, raw, "dropping unparsable showtime");
                continue;
            };

            let scope = ancestor_with_class(&anchor, "schedule__item")
                .or_else(|| ancestor_with_class(&anchor, "schedule__seance"))
                .or_else(|| ancestor_with_class(&anchor, "schedule__seance-wrap"));
            let place = scope.and_then(|scope| {
                let place = scope.select(&place_sel).next().map(|node| collect_text(&node))?;
                let address = scope
                    .select(&address_sel)
                    .next()
                    .map(|node| collect_text(&node))
                    .filter(|text| !text.is_empty());
                Some(match address {
                    Some(address) => format!("{place}, {address}"),
                    None => place,
                })
            });
            let location = place
                .or_else(|| anchor.value().attr("data-category").map(str::to_string))
                .unwrap_or_else(|| "Unknown location".to_string());
            let location = clean_text(location.trim(), false)
                .unwrap_or_else(|| "Unknown location".to_string());

            showtimes.push(ShowtimeSlot::new(starts_at, location));
        }

        Ok(DetailFragment {
            description,
            normalized_description,
            interests,
            showtimes,
        })
    }
}

fn parse_selector(url: &str, selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|err| ScrapeError::Structural {
        url: url.to_string(),
        reason: format!("selector `{selector}`: {err}"),
    })
}

fn collect_text(node: &ElementRef<'_>) -> String {
    node.text().collect::<String>().trim().to_string()
}

fn ancestor_with_class<'a>(node: &ElementRef<'a>, class: &str) -> Option<ElementRef<'a>> {
    node.ancestors().filter_map(ElementRef::wrap).find(|el| {
        el.value().name() == "div"
            && el
                .value()
                .attr("class")
                .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    })
}

/// Orchestrates one crawl: listing fetch, concurrent detail fetch/extract
/// under a run-scoped permit pool, and bounded resubmission rounds for
/// failed items. Every returned candidate carries at least one showtime.
pub struct ListingScraper {
    fetcher: Arc<Fetcher>,
    extractor: DetailExtractor,
    listing_url: String,
}

impl ListingScraper {
    pub fn new(listing_url: impl Into<String>, config: FetchConfig) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: Arc::new(Fetcher::new(config)?),
            extractor: DetailExtractor,
            listing_url: listing_url.into(),
        })
    }

    pub fn listing_url(&self) -> &str {
        &self.listing_url
    }

    /// Stub extraction is separable so markup handling can be tested without
    /// a network. Items missing a title or a link are skipped outright.
    pub fn extract_stubs(url: &str, html: &str) -> Result<Vec<EventStub>, ScrapeError> {
        let document = Html::parse_document(html);
        let item_sel = parse_selector(url, "div.b-afisha-layout_strap--item")?;
        let title_sel = parse_selector(url, "a.b-afisha_blocks-strap_item_lnk_txt")?;
        let img_sel = parse_selector(url, "img")?;

        let mut stubs = Vec::new();
        for item in document.select(&item_sel) {
            let Some(anchor) = item.select(&title_sel).next() else {
                continue;
            };
            let title = collect_text(&anchor);
            let link = anchor
                .value()
                .attr("href")
                .unwrap_or_default()
                .trim()
                .to_string();
            if title.is_empty() || link.is_empty() {
                continue;
            }
            let image_url = item
                .select(&img_sel)
                .next()
                .and_then(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
                .map(str::to_string);
            stubs.push(EventStub {
                title,
                link,
                image_url,
            });
        }
        Ok(stubs)
    }

    /// One full crawl. Partial success is the normal terminal state: items
    /// that still fail after the final round are dropped and logged, never
    /// surfaced as a pipeline failure. Immediate successes precede
    /// late-retry successes; no total order is guaranteed.
    pub async fn parse(&self) -> Vec<EventCandidate> {
        let Some(html) = self.fetcher.fetch_listing(&self.listing_url).await else {
            return Vec::new();
        };
        if html.trim().is_empty() {
            return Vec::new();
        }
        let stubs = match Self::extract_stubs(&self.listing_url, &html) {
            Ok(stubs) => stubs,
            Err(err) => {
                warn!(url = %self.listing_url, error = %err, "listing markup unusable");
                return Vec::new();
            }
        };

        // Run-scoped counting permit pool; parallel scraper runs never
        // cross-throttle each other.
        let permits = Arc::new(Semaphore::new(self.fetcher.config().detail_permits));
        let mut pending = stubs;
        let mut candidates = Vec::new();

        for round in 1..=self.fetcher.config().detail_rounds {
            if pending.is_empty() {
                break;
            }
            let mut join = JoinSet::new();
            for (index, stub) in pending.iter().enumerate() {
                let fetcher = Arc::clone(&self.fetcher);
                let extractor = self.extractor;
                let permits = Arc::clone(&permits);
                let link = stub.link.clone();
                join.spawn(async move {
                    let result = match fetcher.fetch_detail(&link, &permits).await {
                        Ok(body) => extractor.extract(&link, &body),
                        Err(err) => Err(err),
                    };
                    (index, result)
                });
            }

            let mut failed = Vec::new();
            while let Some(joined) = join.join_next().await {
                match joined {
                    Ok((index, Ok(fragment))) => {
                        candidates.push(assemble(pending[index].clone(), fragment));
                    }
                    Ok((index, Err(err))) => {
                        warn!(
                            round,
                            title = %pending[index].title,
                            error = %err,
                            "detail fetch failed"
                        );
                        failed.push(index);
                    }
                    Err(err) => {
                        warn!(round, error = %err, "detail task aborted");
                    }
                }
            }

            failed.sort_unstable();
            pending = failed.into_iter().map(|index| pending[index].clone()).collect();
        }

        for stub in &pending {
            warn!(title = %stub.title, link = %stub.link, "dropping event after final retry round");
        }

        candidates.retain(|candidate| !candidate.showtimes.is_empty());
        candidates
    }
}

fn assemble(stub: EventStub, fragment: DetailFragment) -> EventCandidate {
    EventCandidate {
        title: stub.title,
        link: stub.link,
        image_url: stub.image_url,
        description: fragment.description,
        normalized_description: fragment.normalized_description,
        showtimes: fragment.showtimes,
        interests: fragment.interests,
    }
}
