//! Infinite-scroll discovery: scroll, settle, re-read, stop once the listing is stable.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use careerscan_adapters::{
    harvest_listing, AdapterError, ListingSelectors, NavigationError, PageSession, SessionError,
    SourceProfile,
};
use careerscan_core::{KeyedCandidate, UrlHash};
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Pause after every scroll. Also the pause between retried actions.
    pub settle_delay: Duration,
    pub stale_threshold: u32,
    pub max_scrolls: u32,
    pub max_duration: Duration,
    pub nav_timeout: Duration,
    pub action_retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            stale_threshold: 2,
            max_scrolls: 20,
            max_duration: Duration::from_secs(300),
            nav_timeout: Duration::from_secs(60),
            action_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("listing {url} failed to load: {source}")]
    Navigation {
        url: String,
        #[source]
        source: NavigationError,
    },
    #[error("listing {url} did not load within {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },
    #[error("{action} on {url} failed after {attempts} attempts: {source}")]
    Action {
        url: String,
        action: &'static str,
        attempts: u32,
        #[source]
        source: SessionError,
    },
    #[error("invalid listing url {0}")]
    ListingUrl(String),
    #[error(transparent)]
    Selector(#[from] AdapterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stale counter reached the threshold.
    Stable,
    ScrollCeiling,
    TimeCeiling,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    /// Deduplicated by canonical URL, in first-seen order.
    pub links: Vec<KeyedCandidate>,
    pub iterations: u32,
    pub stop: StopReason,
    pub failures: Vec<DiscoveryError>,
    pub invalid_links: u32,
}

impl DiscoveryOutcome {
    fn empty() -> Self {
        Self {
            links: Vec::new(),
            iterations: 0,
            stop: StopReason::Stable,
            failures: Vec::new(),
            invalid_links: 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop == StopReason::Cancelled
    }
}

/// Accumulated candidate set, unique by canonical URL hash.
#[derive(Debug, Default)]
struct CandidateSet {
    seen: HashSet<UrlHash>,
    links: Vec<KeyedCandidate>,
}

impl CandidateSet {
    /// Returns how many candidates were new.
    fn absorb(&mut self, candidates: impl IntoIterator<Item = KeyedCandidate>) -> usize {
        let before = self.links.len();
        for candidate in candidates {
            if self.seen.insert(candidate.hash.clone()) {
                self.links.push(candidate);
            }
        }
        self.links.len() - before
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Discover every listing page of a source with one session, serially.
    pub async fn discover_source(
        &self,
        session: &mut dyn PageSession,
        profile: &SourceProfile,
        cancel: &CancellationToken,
    ) -> DiscoveryOutcome {
        let mut merged = CandidateSet::default();
        let mut total = DiscoveryOutcome::empty();

        for target in profile.listing_targets() {
            let page = self
                .discover_page(session, &target, &profile.selectors.listing, cancel)
                .await;
            let fresh = merged.absorb(page.links);
            info!(
                listing = %target,
                new_links = fresh,
                iterations = page.iterations,
                stop = ?page.stop,
                "listing page discovered"
            );
            total.iterations += page.iterations;
            total.invalid_links += page.invalid_links;
            total.failures.extend(page.failures);
            total.stop = page.stop;
            if page.stop == StopReason::Cancelled {
                break;
            }
        }

        if !total.failures.is_empty() && !merged.links.is_empty() {
            for failure in &total.failures {
                warn!(error = %failure, "listing page failed; keeping candidates from other pages");
            }
        }
        total.links = merged.links;
        total
    }

    /// Drive one listing page to `Done`. Partial results survive failures.
    pub async fn discover_page(
        &self,
        session: &mut dyn PageSession,
        listing_url: &str,
        selectors: &ListingSelectors,
        cancel: &CancellationToken,
    ) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome::empty();
        let mut set = CandidateSet::default();

        let Ok(base) = Url::parse(listing_url) else {
            outcome.failures.push(DiscoveryError::ListingUrl(listing_url.to_string()));
            outcome.stop = StopReason::Failed;
            return outcome;
        };

        if let Err(e) = self.open_listing(session, listing_url, cancel).await {
            outcome.stop = match e {
                Interrupted::Cancelled => StopReason::Cancelled,
                Interrupted::OutOfTime => StopReason::TimeCeiling,
                Interrupted::Failed(err) => {
                    outcome.failures.push(err);
                    StopReason::Failed
                }
            };
            return outcome;
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(self.config.max_duration)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60));
        let mut stale = 0u32;
        debug!(listing = %listing_url, "discovery: idle -> scrolling");

        outcome.stop = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if outcome.iterations >= self.config.max_scrolls {
                break StopReason::ScrollCeiling;
            }
            if Instant::now() >= deadline {
                break StopReason::TimeCeiling;
            }

            outcome.iterations += 1;
            let html = match self.scroll_and_read(session, listing_url, deadline, cancel).await {
                Ok(html) => html,
                Err(Interrupted::Cancelled) => break StopReason::Cancelled,
                Err(Interrupted::OutOfTime) => break StopReason::TimeCeiling,
                Err(Interrupted::Failed(err)) => {
                    outcome.failures.push(err);
                    break StopReason::Failed;
                }
            };

            let harvested = match harvest_listing(&html, selectors, &base) {
                Ok(links) => links,
                Err(err) => {
                    outcome.failures.push(err.into());
                    break StopReason::Failed;
                }
            };
            let mut keyed = Vec::with_capacity(harvested.len());
            for link in harvested {
                match link.keyed() {
                    Ok(candidate) => keyed.push(candidate),
                    Err(err) => {
                        outcome.invalid_links += 1;
                        debug!(error = %err, "discarding invalid listing link");
                    }
                }
            }

            let delta = set.absorb(keyed);
            if delta > 0 {
                stale = 0;
            } else {
                stale += 1;
            }
            debug!(
                iteration = outcome.iterations,
                delta,
                stale,
                total = set.links.len(),
                "discovery: settling"
            );
            if stale >= self.config.stale_threshold {
                break StopReason::Stable;
            }
        };

        debug!(listing = %listing_url, stop = ?outcome.stop, "discovery: done");
        outcome.links = set.links;
        outcome
    }

    async fn open_listing(
        &self,
        session: &mut dyn PageSession,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                r = timeout(self.config.nav_timeout, session.navigate(url)) => r,
            };
            let err = match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(source @ NavigationError::Fatal { .. })) => {
                    return Err(Interrupted::Failed(DiscoveryError::Navigation {
                        url: url.to_string(),
                        source,
                    }))
                }
                Ok(Err(source)) => DiscoveryError::Navigation {
                    url: url.to_string(),
                    source,
                },
                Err(_) => DiscoveryError::NavigationTimeout {
                    url: url.to_string(),
                    timeout: self.config.nav_timeout,
                },
            };
            if attempt >= self.config.action_retries {
                return Err(Interrupted::Failed(err));
            }
            warn!(error = %err, attempt, "listing navigation failed; retrying");
            self.pause(cancel).await?;
        }
    }

    /// One `Scrolling` + `Settling` step, retrying the page actions.
    async fn scroll_and_read(
        &self,
        session: &mut dyn PageSession,
        url: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, Interrupted> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let scrolled = self
                .within(deadline, cancel, session.scroll_to_bottom())
                .await?;
            let (action, result) = match scrolled {
                Err(e) => ("scroll", Err(e)),
                Ok(()) => {
                    self.pause(cancel).await?;
                    ("read", self.within(deadline, cancel, session.html()).await?)
                }
            };
            let source = match result {
                Ok(html) => return Ok(html),
                Err(source) => source,
            };
            if attempt >= self.config.action_retries {
                return Err(Interrupted::Failed(DiscoveryError::Action {
                    url: url.to_string(),
                    action,
                    attempts: attempt,
                    source,
                }));
            }
            warn!(error = %source, action, attempt, "listing action failed; retrying");
            self.pause(cancel).await?;
        }
    }

    /// Bound one page action by the navigation timeout and the page deadline.
    ///
    /// Hitting the deadline ends discovery; hitting only the navigation timeout
    /// is an ordinary, retryable action failure.
    async fn within<T>(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        action: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<Result<T, SessionError>, Interrupted> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let limit = remaining.min(self.config.nav_timeout);
        tokio::select! {
            _ = cancel.cancelled() => Err(Interrupted::Cancelled),
            result = timeout(limit, action) => match result {
                Ok(result) => Ok(result),
                Err(_) if limit == remaining => Err(Interrupted::OutOfTime),
                Err(_) => Ok(Err(SessionError::Lost(format!(
                    "page action did not finish within {limit:?}"
                )))),
            },
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), Interrupted> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = sleep(self.config.settle_delay) => Ok(()),
        }
    }
}

enum Interrupted {
    Cancelled,
    /// The page deadline passed mid-action.
    OutOfTime,
    Failed(DiscoveryError),
}
