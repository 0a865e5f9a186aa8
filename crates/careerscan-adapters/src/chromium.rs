//! Chromium DevTools implementation of `PageSession`.
//!
//! One browser process per factory, one tab per session. Network quiescence is
//! tracked from CDP `Network` events rather than inferred from document load.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    classify_net_error, is_session_lost, status_error, NavigationError, PageSession, RetryDisposition,
    SessionError, SessionFactory, Visibility,
};

const SCROLL_JS: &str = "window.scrollTo(0, document.body ? document.body.scrollHeight : 0)";
const STATUS_JS: &str = "(() => { const nav = performance.getEntriesByType('navigation')[0]; \
     return nav && typeof nav.responseStatus === 'number' ? nav.responseStatus : 0; })()";

/// A failed CDP call either lost the tab or merely failed to run.
fn cdp_error(e: chromiumoxide::error::CdpError) -> SessionError {
    let message = e.to_string();
    if is_session_lost(&message) {
        SessionError::Lost(message)
    } else {
        SessionError::Script(message)
    }
}

fn visibility_js(selector: &str) -> Result<String, SessionError> {
    let quoted = serde_json::to_string(selector).map_err(|e| SessionError::Script(e.to_string()))?;
    Ok(format!(
        "(() => {{ const el = document.querySelector({quoted}); \
         if (!el) return 'absent'; \
         const r = el.getBoundingClientRect(); const s = window.getComputedStyle(el); \
         return (r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none') \
           ? 'visible' : 'hidden'; }})()"
    ))
}

pub struct ChromiumSessionFactory {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl ChromiumSessionFactory {
    pub async fn launch(headless: bool) -> Result<Self, SessionError> {
        let builder = BrowserConfig::builder();
        let builder = if headless { builder } else { builder.with_head() };
        let config = builder.build().map_err(SessionError::Launch)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler stopped");
                    break;
                }
            }
        });
        Ok(Self { browser, handler })
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn open(&self) -> Result<Box<dyn PageSession>, SessionError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;
        let session = ChromiumSession::attach(page).await?;
        Ok(Box::new(session))
    }
}

#[derive(Debug)]
struct NetworkActivity {
    in_flight: HashSet<String>,
    last_activity: Instant,
}

impl NetworkActivity {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

pub struct ChromiumSession {
    page: Option<Page>,
    activity: Arc<Mutex<NetworkActivity>>,
    tracker: JoinHandle<()>,
}

impl ChromiumSession {
    async fn attach(page: Page) -> Result<Self, SessionError> {
        page.execute(EnableParams::default())
            .await
            .map_err(|e| SessionError::Lost(e.to_string()))?;
        let lost = |e: chromiumoxide::error::CdpError| SessionError::Lost(e.to_string());
        let mut started = page.event_listener::<EventRequestWillBeSent>().await.map_err(lost)?;
        let mut finished = page.event_listener::<EventLoadingFinished>().await.map_err(lost)?;
        let mut failed = page.event_listener::<EventLoadingFailed>().await.map_err(lost)?;

        let activity = Arc::new(Mutex::new(NetworkActivity {
            in_flight: HashSet::new(),
            last_activity: Instant::now(),
        }));
        let shared = Arc::clone(&activity);
        let tracker = tokio::spawn(async move {
            loop {
                let (id, done) = tokio::select! {
                    Some(ev) = started.next() => (ev.request_id.inner().clone(), false),
                    Some(ev) = finished.next() => (ev.request_id.inner().clone(), true),
                    Some(ev) = failed.next() => (ev.request_id.inner().clone(), true),
                    else => break,
                };
                let Ok(mut state) = shared.lock() else { break };
                if done {
                    state.in_flight.remove(&id);
                } else {
                    state.in_flight.insert(id);
                }
                state.touch();
            }
        });

        Ok(Self {
            page: Some(page),
            activity,
            tracker,
        })
    }

    fn page(&self) -> Result<&Page, SessionError> {
        self.page
            .as_ref()
            .ok_or_else(|| SessionError::Lost("session already closed".to_string()))
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, js: &str) -> Result<T, SessionError> {
        self.page()?
            .evaluate(js)
            .await
            .map_err(cdp_error)?
            .into_value::<T>()
            .map_err(|e| SessionError::Script(e.to_string()))
    }

    fn reset_activity(&self) {
        if let Ok(mut state) = self.activity.lock() {
            state.in_flight.clear();
            state.touch();
        }
    }
}

#[async_trait]
impl PageSession for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        self.reset_activity();
        let page = self
            .page()
            .map_err(|e| NavigationError::SessionLost(e.to_string()))?;
        if let Err(e) = page.goto(url).await {
            let message = e.to_string();
            if is_session_lost(&message) {
                return Err(NavigationError::SessionLost(message));
            }
            return Err(match classify_net_error(&message) {
                RetryDisposition::NonRetryable => NavigationError::Fatal {
                    status: None,
                    message,
                },
                RetryDisposition::Retryable => NavigationError::Transient(message),
            });
        }
        let status: i64 = self.eval(STATUS_JS).await.map_err(|e| match e {
            SessionError::Lost(message) => NavigationError::SessionLost(message),
            other => NavigationError::Transient(other.to_string()),
        })?;
        match u16::try_from(status).ok().and_then(|s| status_error(url, s)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn network_idle_for(&mut self) -> Result<Duration, SessionError> {
        let state = self
            .activity
            .lock()
            .map_err(|_| SessionError::Lost("network tracker poisoned".to_string()))?;
        if state.in_flight.is_empty() {
            Ok(state.last_activity.elapsed())
        } else {
            Ok(Duration::ZERO)
        }
    }

    async fn visibility(&mut self, selector: &str) -> Result<Visibility, SessionError> {
        let state: String = self.eval(&visibility_js(selector)?).await?;
        Ok(match state.as_str() {
            "visible" => Visibility::Visible,
            "hidden" => Visibility::Hidden,
            _ => Visibility::Absent,
        })
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), SessionError> {
        self.page()?.evaluate(SCROLL_JS).await.map_err(cdp_error)?;
        Ok(())
    }

    async fn html(&mut self) -> Result<String, SessionError> {
        self.page()?
            .content()
            .await
            .map_err(|e| SessionError::Lost(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.tracker.abort();
        match self.page.take() {
            Some(page) => page.close().await.map_err(|e| SessionError::Lost(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.tracker.abort();
    }
}
