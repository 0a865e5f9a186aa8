//! Render-wait extraction of one detail page.
//!
//! Each attempt walks `Navigating -> AwaitingNetworkQuiesce -> AwaitingVisibleContent
//! -> Extracted`. Every wait is bounded and every timeout becomes a `FailureReason`;
//! nothing falls through to a read of half-rendered content.

use std::fmt;
use std::time::Duration;

use careerscan_adapters::{
    read_detail, DetailSelectors, ListingHints, NavigationError, PageSession, SessionError,
    Visibility,
};
use careerscan_core::{ExtractedFields, FailureReason};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RenderWaitConfig {
    pub nav_timeout: Duration,
    pub quiet_window: Duration,
    pub quiesce_timeout: Duration,
    pub visible_timeout: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Floor on the pause before a retry, so retries never hit a site faster than fresh jobs do.
    pub politeness: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RenderWaitConfig {
    fn default() -> Self {
        Self {
            nav_timeout: Duration::from_secs(60),
            quiet_window: Duration::from_millis(500),
            quiesce_timeout: Duration::from_secs(20),
            visible_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(250),
            max_attempts: 3,
            politeness: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Navigating,
    AwaitingNetworkQuiesce,
    AwaitingVisibleContent,
    Extracted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Navigating => "navigating",
            Phase::AwaitingNetworkQuiesce => "awaiting_network_quiesce",
            Phase::AwaitingVisibleContent => "awaiting_visible_content",
            Phase::Extracted => "extracted",
        })
    }
}

/// Why one attempt failed, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub phase: Phase,
    pub reason: FailureReason,
    pub detail: String,
    /// The page session died; no further attempt on it can succeed.
    pub session_lost: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Extracted {
        fields: ExtractedFields,
        attempts: u32,
    },
    Failed {
        /// `FatalNavigation` or `ExtractionExhausted`.
        reason: FailureReason,
        detail: String,
        attempts: u32,
        log: Vec<AttemptFailure>,
    },
    /// The session died mid-job. The job is not judged; the caller decides
    /// whether to replay it on a fresh session.
    SessionLost {
        detail: String,
        attempts: u32,
        log: Vec<AttemptFailure>,
    },
}

impl ExtractionOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            ExtractionOutcome::Extracted { attempts, .. }
            | ExtractionOutcome::Failed { attempts, .. }
            | ExtractionOutcome::SessionLost { attempts, .. } => *attempts,
        }
    }
}

/// Everything the extractor needs to know about one job.
#[derive(Debug, Clone)]
pub struct DetailTarget<'a> {
    pub url: &'a str,
    pub selectors: &'a DetailSelectors,
    pub hints: ListingHints,
}

#[derive(Debug, Clone)]
pub struct RenderWaitExtractor {
    config: RenderWaitConfig,
}

impl RenderWaitExtractor {
    pub fn new(config: RenderWaitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RenderWaitConfig {
        &self.config
    }

    /// Retry transient render failures with backoff; fatal ones end immediately,
    /// and so does a lost session.
    pub async fn extract(
        &self,
        session: &mut dyn PageSession,
        target: &DetailTarget<'_>,
    ) -> ExtractionOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut log = Vec::new();

        for attempt in 1..=max_attempts {
            let failure = match self.attempt(session, target, attempt).await {
                Ok(fields) => {
                    debug!(attempt, "render-wait: extracted");
                    return ExtractionOutcome::Extracted {
                        fields,
                        attempts: attempt,
                    };
                }
                Err(failure) => failure,
            };

            warn!(
                attempt,
                phase = %failure.phase,
                reason = %failure.reason,
                detail = %failure.detail,
                "render-wait attempt failed"
            );
            if failure.session_lost {
                let detail = failure.detail.clone();
                log.push(failure);
                return ExtractionOutcome::SessionLost {
                    detail,
                    attempts: attempt,
                    log,
                };
            }
            if !failure.reason.is_retryable() {
                let detail = failure.detail.clone();
                let reason = failure.reason;
                log.push(failure);
                return ExtractionOutcome::Failed {
                    reason,
                    detail,
                    attempts: attempt,
                    log,
                };
            }
            log.push(failure);

            if attempt < max_attempts {
                let delay = self
                    .config
                    .backoff
                    .delay_for_attempt((attempt - 1) as usize)
                    .max(self.config.politeness);
                debug!(?delay, "render-wait: backing off");
                sleep(delay).await;
            }
        }

        let detail = log
            .iter()
            .map(|f| format!("#{} {}: {}", f.attempt, f.reason, f.detail))
            .collect::<Vec<_>>()
            .join("; ");
        ExtractionOutcome::Failed {
            reason: FailureReason::ExtractionExhausted,
            detail,
            attempts: max_attempts,
            log,
        }
    }

    async fn attempt(
        &self,
        session: &mut dyn PageSession,
        target: &DetailTarget<'_>,
        attempt: u32,
    ) -> Result<ExtractedFields, AttemptFailure> {
        let fail = move |phase: Phase, reason: FailureReason, detail: String| AttemptFailure {
            attempt,
            phase,
            reason,
            detail,
            session_lost: false,
        };
        let broken = move |phase: Phase, reason: FailureReason, error: SessionError| AttemptFailure {
            session_lost: error.is_lost(),
            ..fail(phase, reason, error.to_string())
        };

        debug!(attempt, phase = %Phase::Navigating, "render-wait");
        match timeout(self.config.nav_timeout, session.navigate(target.url)).await {
            Err(_) => {
                return Err(fail(
                    Phase::Navigating,
                    FailureReason::NavigationTimeout,
                    format!("no response within {:?}", self.config.nav_timeout),
                ))
            }
            Ok(Err(NavigationError::Fatal { message, .. })) => {
                return Err(fail(Phase::Navigating, FailureReason::FatalNavigation, message))
            }
            Ok(Err(NavigationError::Transient(message))) => {
                return Err(fail(Phase::Navigating, FailureReason::NavigationTimeout, message))
            }
            Ok(Err(NavigationError::SessionLost(message))) => {
                return Err(AttemptFailure {
                    session_lost: true,
                    ..fail(Phase::Navigating, FailureReason::NavigationTimeout, message)
                })
            }
            Ok(Ok(())) => {}
        }

        debug!(attempt, phase = %Phase::AwaitingNetworkQuiesce, "render-wait");
        let quiesce = async {
            loop {
                let idle = session.network_idle_for().await?;
                if idle >= self.config.quiet_window {
                    return Ok::<(), SessionError>(());
                }
                let remaining = self.config.quiet_window - idle;
                sleep(remaining.min(self.config.poll_interval)).await;
            }
        };
        match timeout(self.config.quiesce_timeout, quiesce).await {
            Err(_) => {
                return Err(fail(
                    Phase::AwaitingNetworkQuiesce,
                    FailureReason::RenderTimeout,
                    format!(
                        "network not quiet for {:?} within {:?}",
                        self.config.quiet_window, self.config.quiesce_timeout
                    ),
                ))
            }
            Ok(Err(e)) => {
                return Err(broken(
                    Phase::AwaitingNetworkQuiesce,
                    FailureReason::RenderTimeout,
                    e,
                ))
            }
            Ok(Ok(())) => {}
        }

        debug!(attempt, phase = %Phase::AwaitingVisibleContent, "render-wait");
        let description = target.selectors.detail_description.as_str();
        let phase = Phase::AwaitingVisibleContent;
        let visible = async {
            loop {
                let last = session
                    .visibility(description)
                    .await
                    .map_err(|e| broken(phase, FailureReason::ContentNotVisible, e))?;
                if last == Visibility::Visible {
                    let html = session
                        .html()
                        .await
                        .map_err(|e| broken(phase, FailureReason::ContentNotVisible, e))?;
                    let fields = read_detail(&html, target.selectors, &target.hints)
                        .map_err(|e| fail(phase, FailureReason::FatalNavigation, e.to_string()))?;
                    if let Some(fields) = fields {
                        return Ok::<_, AttemptFailure>(fields);
                    }
                }
                debug!(?last, "render-wait: description not ready");
                sleep(self.config.poll_interval).await;
            }
        };
        match timeout(self.config.visible_timeout, visible).await {
            Err(_) => Err(fail(
                Phase::AwaitingVisibleContent,
                FailureReason::ContentNotVisible,
                format!(
                    "{description:?} not visible with content within {:?}",
                    self.config.visible_timeout
                ),
            )),
            Ok(Err(failure)) => Err(failure),
            Ok(Ok(fields)) => {
                debug!(attempt, phase = %Phase::Extracted, "render-wait");
                Ok(fields)
            }
        }
    }
}
