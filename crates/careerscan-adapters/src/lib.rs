//! Source capability descriptors, the page-session seam and HTML selection helpers.
//!
//! A source is described purely by data (`SourceProfile`): which listing pages to
//! visit and which selectors locate cards, links and detail fields. The crawl
//! engine drives a `PageSession` (one per worker, owned, never shared) and hands
//! the rendered HTML to the helpers here.

use std::time::Duration;

use async_trait::async_trait;
use careerscan_core::{CandidateLink, ExtractedFields};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod chromium;

pub use chromium::{ChromiumSession, ChromiumSessionFactory};

pub const CRATE_NAME: &str = "careerscan-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSelectors {
    pub job_card: String,
    pub job_link: String,
    pub job_title: String,
    #[serde(default)]
    pub job_team: Option<String>,
    #[serde(default)]
    pub job_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSelectors {
    #[serde(default = "default_detail_title")]
    pub detail_title: String,
    pub detail_description: String,
    #[serde(default)]
    pub detail_team: Option<String>,
    #[serde(default)]
    pub detail_location: Option<String>,
    #[serde(default)]
    pub detail_type: Option<String>,
}

fn default_detail_title() -> String {
    "h1".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSelectors {
    #[serde(flatten)]
    pub listing: ListingSelectors,
    #[serde(flatten)]
    pub detail: DetailSelectors,
}

/// Data-driven description of one careers site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    /// Search prefix; each search term is appended with spaces as `+`.
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub search_terms: Vec<String>,
    pub selectors: SourceSelectors,
}

fn default_enabled() -> bool {
    true
}

impl SourceProfile {
    /// Every listing page discovery should visit, in order, without repeats.
    pub fn listing_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        let searches = self.search_url.iter().flat_map(|prefix| {
            self.search_terms
                .iter()
                .map(move |term| format!("{prefix}{}", term.trim().replace(' ', "+")))
        });
        for target in self.listing_urls.iter().cloned().chain(searches) {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    /// Reject profiles that could never produce work: no pages or unparsable selectors.
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.listing_targets().is_empty() {
            return Err(AdapterError::NoListingPages(self.source_id.clone()));
        }
        for target in self.listing_targets() {
            Url::parse(&target).map_err(|e| AdapterError::ListingUrl {
                url: target.clone(),
                message: e.to_string(),
            })?;
        }
        let listing = &self.selectors.listing;
        let detail = &self.selectors.detail;
        let required = [
            &listing.job_card,
            &listing.job_link,
            &listing.job_title,
            &detail.detail_title,
            &detail.detail_description,
        ];
        let optional = [
            &listing.job_team,
            &listing.job_location,
            &detail.detail_team,
            &detail.detail_location,
            &detail.detail_type,
        ];
        for selector in required
            .into_iter()
            .chain(optional.into_iter().flatten())
        {
            parse_selector(selector)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("invalid css selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("source {0} has no listing pages")]
    NoListingPages(String),
    #[error("invalid listing url {url:?}: {message}")]
    ListingUrl { url: String, message: String },
}

/// Browser-level failure that is not tied to one navigation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("page session lost: {0}")]
    Lost(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
}

impl SessionError {
    /// The tab or browser is gone; the session must be replaced, not retried.
    pub fn is_lost(&self) -> bool {
        matches!(self, SessionError::Lost(_))
    }
}

/// Outcome class of a failed navigation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    /// Worth another attempt (connection reset, 5xx, throttling).
    #[error("transient navigation failure: {0}")]
    Transient(String),
    /// The URL will not load no matter how often it is retried.
    #[error("fatal navigation failure: {message}")]
    Fatal {
        status: Option<u16>,
        message: String,
    },
    /// The tab died mid-navigation; the URL itself may be fine.
    #[error("page session lost during navigation: {0}")]
    SessionLost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: u16) -> RetryDisposition {
    match status {
        408 | 429 => RetryDisposition::Retryable,
        500..=599 => RetryDisposition::Retryable,
        400..=499 => RetryDisposition::NonRetryable,
        _ => RetryDisposition::Retryable,
    }
}

/// Maps a document status to a navigation error, if it is one.
pub fn status_error(url: &str, status: u16) -> Option<NavigationError> {
    if status < 400 {
        return None;
    }
    let message = format!("{url} answered HTTP {status}");
    Some(match classify_status(status) {
        RetryDisposition::Retryable => NavigationError::Transient(message),
        RetryDisposition::NonRetryable => NavigationError::Fatal {
            status: Some(status),
            message,
        },
    })
}

/// Browser network errors that mean the URL itself is dead.
pub fn classify_net_error(message: &str) -> RetryDisposition {
    const FATAL: &[&str] = &[
        "ERR_NAME_NOT_RESOLVED",
        "ERR_INVALID_URL",
        "ERR_UNKNOWN_URL_SCHEME",
        "ERR_BLOCKED_BY_CLIENT",
        "ERR_CERT_",
        "ERR_SSL_PROTOCOL_ERROR",
        "ERR_TOO_MANY_REDIRECTS",
    ];
    if FATAL.iter().any(|code| message.contains(code)) {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

/// DevTools errors that mean the tab or its browser connection is gone.
pub fn is_session_lost(message: &str) -> bool {
    const LOST: &[&str] = &[
        "target closed",
        "no target with given id",
        "session closed",
        "session with given id not found",
        "receiver is gone",
        "channel closed",
        "websocket",
        "connection closed",
    ];
    let message = message.to_ascii_lowercase();
    LOST.iter().any(|needle| message.contains(needle))
}

/// Layout state of the first element matching a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Absent,
    /// In the DOM, but zero-sized or styled hidden.
    Hidden,
    Visible,
}

/// An owned browser tab. Not shared between workers.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Navigate and wait for the document response; the caller bounds it with a timeout.
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError>;

    /// Time since the last network request settled; zero while any request is in flight.
    async fn network_idle_for(&mut self) -> Result<Duration, SessionError>;

    async fn visibility(&mut self, selector: &str) -> Result<Visibility, SessionError>;

    async fn scroll_to_bottom(&mut self) -> Result<(), SessionError>;

    /// Serialized DOM as currently rendered.
    async fn html(&mut self) -> Result<String, SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PageSession>, SessionError>;
}

pub fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<Vec<_>>().join(" "))
}

fn select_first_text(
    root: ElementRef<'_>,
    selector: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(root.select(&sel).next().and_then(element_text))
}

fn select_optional_text(
    root: ElementRef<'_>,
    selector: Option<&str>,
) -> Result<Option<String>, AdapterError> {
    match selector {
        Some(selector) => select_first_text(root, selector),
        None => Ok(None),
    }
}

fn select_first_attr(
    root: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(root
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Harvest job cards from a rendered listing page.
///
/// Hrefs are resolved against `base_url`. Cards without a link or a title are
/// skipped; duplicates are kept (the discovery engine dedups on canonical form).
pub fn harvest_listing(
    html: &str,
    selectors: &ListingSelectors,
    base_url: &Url,
) -> Result<Vec<CandidateLink>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = parse_selector(&selectors.job_card)?;
    let mut out = Vec::new();
    for card in document.select(&card_sel) {
        let href = match select_first_attr(card, &selectors.job_link, "href")? {
            Some(href) => href,
            // The card itself may be the anchor.
            None => match card.value().attr("href").and_then(|h| text_or_none(h.to_string())) {
                Some(href) => href,
                None => continue,
            },
        };
        let Ok(resolved) = base_url.join(&href) else {
            continue;
        };
        let Some(title) = select_first_text(card, &selectors.job_title)? else {
            continue;
        };
        out.push(CandidateLink {
            raw_url: resolved.to_string(),
            title,
            team: select_optional_text(card, selectors.job_team.as_deref())?,
            location: select_optional_text(card, selectors.job_location.as_deref())?,
        });
    }
    Ok(out)
}

/// Listing-card values used when the detail page omits a field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingHints {
    pub title: String,
    pub team: Option<String>,
    pub location: Option<String>,
}

/// Read detail fields from a rendered page.
///
/// Returns `None` when the description container is missing or empty.
pub fn read_detail(
    html: &str,
    selectors: &DetailSelectors,
    hints: &ListingHints,
) -> Result<Option<ExtractedFields>, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let Some(raw_description) = select_first_text(root, &selectors.detail_description)? else {
        return Ok(None);
    };
    let title = select_first_text(root, &selectors.detail_title)?
        .unwrap_or_else(|| hints.title.clone());
    let team = select_optional_text(root, selectors.detail_team.as_deref())?
        .or_else(|| hints.team.clone());
    let location = select_optional_text(root, selectors.detail_location.as_deref())?
        .or_else(|| hints.location.clone());
    let employment_type = select_optional_text(root, selectors.detail_type.as_deref())?;
    Ok(Some(ExtractedFields {
        title,
        raw_description,
        team,
        location,
        employment_type,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing_selectors() -> ListingSelectors {
        ListingSelectors {
            job_card: "li.job".to_string(),
            job_link: "a".to_string(),
            job_title: ".title".to_string(),
            job_team: Some(".team".to_string()),
            job_location: None,
        }
    }

    fn detail_selectors() -> DetailSelectors {
        DetailSelectors {
            detail_title: default_detail_title(),
            detail_description: "#description".to_string(),
            detail_team: None,
            detail_location: Some(".loc".to_string()),
            detail_type: Some(".type".to_string()),
        }
    }

    #[test]
    fn harvest_resolves_relative_links_and_skips_incomplete_cards() {
        let html = r#"
            <ul>
              <li class="job"><a href="/jobs/1?utm_source=x"><span class="title"> Backend
                 Engineer </span></a><span class="team">Platform</span></li>
              <li class="job"><a href="https://other.example.com/jobs/2"><span class="title">SRE</span></a></li>
              <li class="job"><span class="title">No link here</span></li>
              <li class="job"><a href="/jobs/4"></a></li>
            </ul>"#;
        let base = Url::parse("https://careers.example.com/search?q=eng").unwrap();
        let links = harvest_listing(html, &listing_selectors(), &base).unwrap();

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].raw_url, "https://careers.example.com/jobs/1?utm_source=x");
        assert_eq!(links[0].title, "Backend Engineer");
        assert_eq!(links[0].team.as_deref(), Some("Platform"));
        assert_eq!(links[1].raw_url, "https://other.example.com/jobs/2");
        assert_eq!(links[1].team, None);
    }

    #[test]
    fn detail_falls_back_to_listing_hints() {
        let html = r#"
            <main>
              <div class="loc">Remote</div>
              <section id="description"><p>Own the ingestion tier.</p><p>Rust preferred.</p></section>
            </main>"#;
        let hints = ListingHints {
            title: "Data Engineer".to_string(),
            team: Some("Data".to_string()),
            location: Some("Berlin".to_string()),
        };
        let fields = read_detail(html, &detail_selectors(), &hints).unwrap().unwrap();

        assert_eq!(fields.title, "Data Engineer");
        assert_eq!(fields.raw_description, "Own the ingestion tier. Rust preferred.");
        assert_eq!(fields.team.as_deref(), Some("Data"));
        assert_eq!(fields.location.as_deref(), Some("Remote"));
        assert_eq!(fields.employment_type, None);
    }

    #[test]
    fn empty_description_is_not_extracted() {
        let html = r#"<h1>Role</h1><div id="description">   </div>"#;
        let got = read_detail(html, &detail_selectors(), &ListingHints::default()).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn search_terms_expand_into_listing_targets() {
        let profile: SourceProfile = serde_json::from_value(serde_json::json!({
            "source_id": "acme",
            "display_name": "Acme",
            "listing_urls": ["https://acme.example.com/careers"],
            "search_url": "https://acme.example.com/search?q=",
            "search_terms": ["Backend Engineer", "SRE", "Backend Engineer"],
            "selectors": {
                "job_card": ".card", "job_link": "a", "job_title": "h3",
                "detail_description": ".desc"
            }
        }))
        .unwrap();

        assert!(profile.enabled);
        assert_eq!(profile.selectors.detail.detail_title, "h1");
        assert_eq!(
            profile.listing_targets(),
            vec![
                "https://acme.example.com/careers".to_string(),
                "https://acme.example.com/search?q=Backend+Engineer".to_string(),
                "https://acme.example.com/search?q=SRE".to_string(),
            ]
        );
        profile.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_selectors_and_empty_sources() {
        let mut profile = SourceProfile {
            source_id: "x".to_string(),
            display_name: "X".to_string(),
            enabled: true,
            listing_urls: vec![],
            search_url: None,
            search_terms: vec![],
            selectors: SourceSelectors {
                listing: listing_selectors(),
                detail: detail_selectors(),
            },
        };
        assert_eq!(
            profile.validate(),
            Err(AdapterError::NoListingPages("x".to_string()))
        );

        profile.listing_urls.push("https://x.example.com/jobs".to_string());
        profile.selectors.listing.job_card = "li[".to_string();
        assert!(matches!(
            profile.validate(),
            Err(AdapterError::Selector { .. })
        ));
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(status_error("u", 200), None);
        assert!(matches!(
            status_error("u", 404),
            Some(NavigationError::Fatal { status: Some(404), .. })
        ));
        assert!(matches!(
            status_error("u", 503),
            Some(NavigationError::Transient(_))
        ));
        assert_eq!(classify_status(429), RetryDisposition::Retryable);
        assert_eq!(
            classify_net_error("net::ERR_NAME_NOT_RESOLVED at https://gone.example"),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_net_error("net::ERR_CONNECTION_RESET"),
            RetryDisposition::Retryable
        );
    }

    #[test]
    fn lost_sessions_are_told_apart_from_network_errors() {
        assert!(is_session_lost("Target closed"));
        assert!(is_session_lost("No target with given id found"));
        assert!(is_session_lost("oneshot canceled: receiver is gone"));
        assert!(!is_session_lost("net::ERR_CONNECTION_RESET"));
        assert!(SessionError::Lost("tab crashed".into()).is_lost());
        assert!(!SessionError::Script("bad js".into()).is_lost());
    }
}
