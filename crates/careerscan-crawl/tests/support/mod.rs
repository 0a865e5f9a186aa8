//! Scripted page sessions: a fake careers site with deterministic listing and detail pages.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use careerscan_adapters::{
    DetailSelectors, ListingSelectors, NavigationError, PageSession, SessionError,
    SessionFactory, SourceProfile, SourceSelectors, Visibility,
};
use tokio_util::sync::CancellationToken;

pub const LISTING: &str = "https://careers.acme.example/jobs";

pub fn job_url(n: usize) -> String {
    format!("https://careers.acme.example/jobs/{n}")
}

/// A listing page rendering one card per href, in order.
pub fn listing_html(hrefs: &[String]) -> String {
    let cards: String = hrefs
        .iter()
        .map(|href| {
            format!(r#"<li class="job"><a href="{href}"><span class="title">Role at {href}</span></a></li>"#)
        })
        .collect();
    format!("<html><body><ul>{cards}</ul></body></html>")
}

pub fn detail_html(title: &str, description: &str) -> String {
    format!(
        r#"<html><body><h1>{title}</h1><span class="type">Full-time</span>
        <div id="description">{description}</div></body></html>"#
    )
}

pub fn selectors() -> SourceSelectors {
    SourceSelectors {
        listing: ListingSelectors {
            job_card: "li.job".to_string(),
            job_link: "a".to_string(),
            job_title: ".title".to_string(),
            job_team: None,
            job_location: None,
        },
        detail: DetailSelectors {
            detail_title: "h1".to_string(),
            detail_description: "#description".to_string(),
            detail_team: None,
            detail_location: None,
            detail_type: Some(".type".to_string()),
        },
    }
}

pub fn profile(listing_urls: &[&str]) -> SourceProfile {
    SourceProfile {
        source_id: "acme".to_string(),
        display_name: "Acme".to_string(),
        enabled: true,
        listing_urls: listing_urls.iter().map(|u| u.to_string()).collect(),
        search_url: None,
        search_terms: Vec::new(),
        selectors: selectors(),
    }
}

#[derive(Debug, Clone)]
pub enum Listing {
    /// The n-th read returns the n-th snapshot; the last one repeats.
    Snapshots(Vec<String>),
    /// Every read reveals one more job.
    Endless,
}

#[derive(Debug, Clone)]
pub enum Detail {
    Ready(String),
    /// Present in the DOM, never laid out.
    NeverVisible,
    /// Requests never settle.
    NetworkBusy,
    /// Document answers with this HTTP status.
    Fatal(u16),
    /// Hidden for the first `failures` navigations, ready afterwards.
    Flaky { failures: u32, html: String },
    /// Navigation never completes.
    Hang,
    /// Every navigation fails at once with a retryable error.
    Unavailable,
}

#[derive(Debug, Default)]
struct SiteState {
    listings: HashMap<String, Listing>,
    details: HashMap<String, Detail>,
    /// Scrolls at or after this count fail.
    scroll_failures_from: Option<u32>,
    /// Listing reads at or after this count never return.
    hang_reads_from: Option<usize>,
    /// Each session dies on its detail navigation after this many.
    session_lifetime: Option<u32>,
    detail_gate: Option<Arc<Semaphore>>,
    /// The factory refuses to open more sessions than this.
    open_limit: Option<u32>,
    navigations: HashMap<String, u32>,
    navigated_at: HashMap<String, Vec<Instant>>,
    sessions_opened: u32,
    sessions_open: u32,
    max_sessions_open: u32,
    cancel_on_detail: Option<CancellationToken>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSite {
    state: Arc<Mutex<SiteState>>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut SiteState) -> R) -> R {
        let mut state = self.state.lock().expect("site state");
        f(&mut state)
    }

    pub fn listing(&self, url: &str, listing: Listing) -> &Self {
        self.with(|s| s.listings.insert(url.to_string(), listing));
        self
    }

    pub fn detail(&self, url: &str, detail: Detail) -> &Self {
        self.with(|s| s.details.insert(url.to_string(), detail));
        self
    }

    pub fn fail_scrolls_from(&self, n: u32) -> &Self {
        self.with(|s| s.scroll_failures_from = Some(n));
        self
    }

    pub fn hang_reads_from(&self, n: usize) -> &Self {
        self.with(|s| s.hang_reads_from = Some(n));
        self
    }

    /// Every session loses its tab on the detail navigation following the first `n`.
    pub fn sessions_die_after(&self, n: u32) -> &Self {
        self.with(|s| s.session_lifetime = Some(n));
        self
    }

    pub fn refuse_sessions_after(&self, n: u32) -> &Self {
        self.with(|s| s.open_limit = Some(n));
        self
    }

    /// Detail navigations are counted, then block until `gate` hands out a permit.
    pub fn gate_details(&self, gate: Arc<Semaphore>) -> &Self {
        self.with(|s| s.detail_gate = Some(gate));
        self
    }

    /// Cancel `token` the moment any worker starts navigating to a detail page.
    pub fn cancel_on_detail(&self, token: Option<CancellationToken>) -> &Self {
        self.with(|s| s.cancel_on_detail = token);
        self
    }

    pub fn navigations(&self, url: &str) -> u32 {
        self.with(|s| s.navigations.get(url).copied().unwrap_or(0))
    }

    pub fn navigation_times(&self, url: &str) -> Vec<Instant> {
        self.with(|s| s.navigated_at.get(url).cloned().unwrap_or_default())
    }

    pub fn sessions_opened(&self) -> u32 {
        self.with(|s| s.sessions_opened)
    }

    pub fn sessions_open(&self) -> u32 {
        self.with(|s| s.sessions_open)
    }

    pub fn max_sessions_open(&self) -> u32 {
        self.with(|s| s.max_sessions_open)
    }

    pub fn session(&self) -> FakeSession {
        self.with(|s| {
            s.sessions_opened += 1;
            s.sessions_open += 1;
            s.max_sessions_open = s.max_sessions_open.max(s.sessions_open);
        });
        FakeSession {
            site: self.clone(),
            current: None,
            reads: 0,
            scrolls: 0,
            detail_visits: 0,
            dead: false,
            closed: false,
        }
    }
}

#[async_trait]
impl SessionFactory for FakeSite {
    async fn open(&self) -> Result<Box<dyn PageSession>, SessionError> {
        let refused = self.with(|s| s.open_limit.is_some_and(|n| s.sessions_opened >= n));
        if refused {
            return Err(SessionError::Launch("browser exited".to_string()));
        }
        Ok(Box::new(self.session()))
    }
}

pub struct FakeSession {
    site: FakeSite,
    current: Option<String>,
    reads: usize,
    scrolls: u32,
    detail_visits: u32,
    dead: bool,
    closed: bool,
}

impl FakeSession {
    fn alive(&self) -> Result<(), SessionError> {
        if self.dead {
            Err(SessionError::Lost("target closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn current_listing(&self) -> Option<Listing> {
        let url = self.current.as_ref()?;
        self.site.with(|s| s.listings.get(url).cloned())
    }

    fn current_detail(&self) -> Option<(Detail, u32)> {
        let url = self.current.as_ref()?;
        self.site.with(|s| {
            s.details
                .get(url)
                .cloned()
                .map(|d| (d, s.navigations.get(url).copied().unwrap_or(0)))
        })
    }
}

#[async_trait]
impl PageSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        if self.dead {
            return Err(NavigationError::SessionLost("target closed".to_string()));
        }
        let (is_listing, detail, cancel, lifetime, gate) = self.site.with(|s| {
            *s.navigations.entry(url.to_string()).or_default() += 1;
            s.navigated_at
                .entry(url.to_string())
                .or_default()
                .push(Instant::now());
            (
                s.listings.contains_key(url),
                s.details.get(url).cloned(),
                s.cancel_on_detail.clone(),
                s.session_lifetime,
                s.detail_gate.clone(),
            )
        });
        self.current = Some(url.to_string());
        self.reads = 0;
        self.scrolls = 0;
        if is_listing {
            return Ok(());
        }
        if lifetime.is_some_and(|n| self.detail_visits >= n) {
            self.dead = true;
            return Err(NavigationError::SessionLost("target closed".to_string()));
        }
        self.detail_visits += 1;
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("detail gate closed");
        }
        if let Some(token) = cancel {
            token.cancel();
            std::future::pending::<()>().await;
        }
        match detail {
            None => Err(NavigationError::Fatal {
                status: Some(404),
                message: format!("{url} answered HTTP 404"),
            }),
            Some(Detail::Fatal(status)) => Err(NavigationError::Fatal {
                status: Some(status),
                message: format!("{url} answered HTTP {status}"),
            }),
            Some(Detail::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Detail::Unavailable) => Err(NavigationError::Transient(format!(
                "{url} answered HTTP 503"
            ))),
            Some(_) => Ok(()),
        }
    }

    async fn network_idle_for(&mut self) -> Result<Duration, SessionError> {
        self.alive()?;
        match self.current_detail() {
            Some((Detail::NetworkBusy, _)) => Ok(Duration::ZERO),
            _ => Ok(Duration::from_secs(10)),
        }
    }

    async fn visibility(&mut self, _selector: &str) -> Result<Visibility, SessionError> {
        self.alive()?;
        Ok(match self.current_detail() {
            Some((Detail::Ready(_), _)) => Visibility::Visible,
            Some((Detail::Flaky { failures, .. }, navigations)) if navigations > failures => {
                Visibility::Visible
            }
            Some(_) => Visibility::Hidden,
            None => Visibility::Absent,
        })
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), SessionError> {
        self.alive()?;
        self.scrolls += 1;
        let limit = self.site.with(|s| s.scroll_failures_from);
        match limit {
            Some(n) if self.scrolls >= n => Err(SessionError::Lost("renderer crashed".to_string())),
            _ => Ok(()),
        }
    }

    async fn html(&mut self) -> Result<String, SessionError> {
        self.alive()?;
        if let Some(listing) = self.current_listing() {
            let read = self.reads;
            self.reads += 1;
            let hang_from = self.site.with(|s| s.hang_reads_from);
            if hang_from.is_some_and(|n| self.reads >= n) {
                std::future::pending::<()>().await;
            }
            return Ok(match listing {
                Listing::Snapshots(snapshots) => snapshots
                    .get(read.min(snapshots.len().saturating_sub(1)))
                    .cloned()
                    .unwrap_or_default(),
                Listing::Endless => {
                    listing_html(&(0..=read).map(job_url).collect::<Vec<_>>())
                }
            });
        }
        Ok(match self.current_detail() {
            Some((Detail::Ready(html), _)) | Some((Detail::Flaky { html, .. }, _)) => html,
            _ => "<html><body><div id=\"description\"></div></body></html>".to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            self.site.with(|s| s.sessions_open -= 1);
        }
        Ok(())
    }
}
