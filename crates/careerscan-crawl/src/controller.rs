//! Run controller: `Starting -> Discovering -> Extracting -> Finalizing -> Completed | Failed`.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use careerscan_adapters::{
    ListingHints, PageSession, SessionError, SessionFactory, SourceProfile, SourceSelectors,
};
use careerscan_core::{FailureReason, JobRecord, RunCounts, RunStatus, ScrapeRun, UrlHash};
use careerscan_storage::{DedupIndex, JobStore, StoreError};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::discovery::{DiscoveryEngine, DiscoveryOutcome};
use crate::extract::{DetailTarget, ExtractionOutcome, RenderWaitExtractor};
use crate::CrawlConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Discover, record new candidates, then extract everything unprocessed.
    Full,
    /// Skip discovery; extract only rows still `processed = false`.
    Resume,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Cap on jobs extracted in this run.
    pub limit: Option<u32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Full,
            limit: None,
        }
    }
}

/// Errors that prevent a run from being recorded at all.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: i64,
    pub url: String,
    pub reason: FailureReason,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// The finalized run row.
    pub run: ScrapeRun,
    pub candidates: usize,
    pub new_jobs: usize,
    pub already_known: usize,
    pub invalid_links: u32,
    pub queued: usize,
    pub extracted: u32,
    pub failures: Vec<JobFailure>,
}

/// First run-level fault wins; raising it also cancels the run.
#[derive(Debug, Clone)]
struct Fault {
    token: CancellationToken,
    message: Arc<StdMutex<Option<String>>>,
}

impl Fault {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            message: Arc::new(StdMutex::new(None)),
        }
    }

    fn raise(&self, message: impl Into<String>) {
        let message = message.into();
        if let Ok(mut slot) = self.message.lock() {
            if slot.is_none() {
                error!(%message, "run-level fault");
                *slot = Some(message);
            }
        }
        self.token.cancel();
    }

    fn message(&self) -> Option<String> {
        self.message.lock().ok().and_then(|slot| slot.clone())
    }
}

#[derive(Debug, Default)]
struct WorkerTally {
    extracted: u32,
    failures: Vec<JobFailure>,
}

struct Worker<'a, F> {
    id: usize,
    session: Box<dyn PageSession>,
    factory: &'a F,
    queue: Arc<Mutex<VecDeque<JobRecord>>>,
    store: JobStore,
    extractor: Arc<RenderWaitExtractor>,
    selectors: Arc<SourceSelectors>,
    politeness: Duration,
    recycle_after: u32,
    token: CancellationToken,
    fault: Fault,
}

impl<F: SessionFactory> Worker<'_, F> {
    async fn run(mut self) -> WorkerTally {
        let mut tally = WorkerTally::default();
        let mut first = true;
        let mut served = 0u32;

        'jobs: loop {
            if self.token.is_cancelled() {
                break;
            }
            let Some(job) = self.queue.lock().await.pop_front() else {
                break;
            };
            if !first {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = sleep(self.politeness) => {}
                }
            }
            first = false;
            if served >= self.recycle_after {
                if !self.replace_session("recycle").await {
                    break;
                }
                served = 0;
            }

            let selectors = Arc::clone(&self.selectors);
            let target = DetailTarget {
                url: &job.canonical_url,
                selectors: &selectors.detail,
                hints: ListingHints {
                    title: job.title.clone(),
                    team: job.team.clone(),
                    location: job.location.clone(),
                },
            };
            let span = info_span!("extract_job", worker = self.id, job_id = job.id, url = %job.canonical_url);
            let mut replayed = false;
            let outcome = loop {
                // Cancellation drops the in-flight attempt before any store write.
                let outcome = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        debug!(job_id = job.id, "extraction interrupted; job stays pending");
                        break 'jobs;
                    }
                    outcome = self
                        .extractor
                        .extract(self.session.as_mut(), &target)
                        .instrument(span.clone()) => outcome,
                };
                served += 1;
                let ExtractionOutcome::SessionLost { detail, .. } = &outcome else {
                    break outcome;
                };
                span.in_scope(|| warn!(%detail, replayed, "page session lost"));
                if !self.replace_session("lost").await {
                    // The job stays pending for a later resume.
                    break 'jobs;
                }
                served = 0;
                if replayed {
                    break outcome;
                }
                replayed = true;
            };

            // The store write always runs to completion.
            let written = match &outcome {
                ExtractionOutcome::Extracted { fields, attempts } => self
                    .store
                    .update_extracted(job.id, fields, *attempts)
                    .await
                    .map(|_| {
                        tally.extracted += 1;
                    }),
                ExtractionOutcome::Failed {
                    reason,
                    detail,
                    attempts,
                    ..
                } => {
                    self.record_failure(&job, *reason, detail, *attempts, &mut tally)
                        .await
                }
                ExtractionOutcome::SessionLost {
                    detail, attempts, ..
                } => {
                    let detail = format!("page session lost twice: {detail}");
                    self.record_failure(
                        &job,
                        FailureReason::ExtractionExhausted,
                        &detail,
                        *attempts,
                        &mut tally,
                    )
                    .await
                }
            };
            if let Err(e) = written {
                self.fault.raise(format!("store unavailable: {e}"));
                break;
            }
            span.in_scope(|| match &outcome {
                ExtractionOutcome::Extracted { attempts, .. } => {
                    info!(attempts, "job extracted")
                }
                ExtractionOutcome::Failed { reason, attempts, .. } => {
                    warn!(%reason, attempts, "job extraction failed")
                }
                ExtractionOutcome::SessionLost { attempts, .. } => {
                    warn!(attempts, "job abandoned after repeated session loss")
                }
            });
        }

        if let Err(e) = self.session.close().await {
            debug!(worker = self.id, error = %e, "session close failed");
        }
        tally
    }

    async fn record_failure(
        &self,
        job: &JobRecord,
        reason: FailureReason,
        detail: &str,
        attempts: u32,
        tally: &mut WorkerTally,
    ) -> Result<(), StoreError> {
        self.store
            .mark_failed(job.id, reason, detail, attempts)
            .await?;
        tally.failures.push(JobFailure {
            job_id: job.id,
            url: job.canonical_url.clone(),
            reason,
            detail: detail.to_string(),
        });
        Ok(())
    }

    /// Close the current tab and open a fresh one. A factory failure is run-level.
    async fn replace_session(&mut self, cause: &'static str) -> bool {
        if let Err(e) = self.session.close().await {
            debug!(worker = self.id, error = %e, "session close failed");
        }
        match self.factory.open().await {
            Ok(session) => {
                self.session = session;
                debug!(worker = self.id, cause, "page session replaced");
                true
            }
            Err(e) => {
                self.fault
                    .raise(format!("browser session unavailable: {e}"));
                false
            }
        }
    }
}

pub struct RunController<F> {
    store: JobStore,
    factory: F,
    config: CrawlConfig,
}

impl<F: SessionFactory> RunController<F> {
    pub fn new(store: JobStore, factory: F, config: CrawlConfig) -> Self {
        Self {
            store,
            factory,
            config,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn into_factory(self) -> F {
        self.factory
    }

    /// Execute one run for one source. Per-job failures never fail the run.
    ///
    /// `Err` is returned only when the run row itself cannot be created or closed.
    pub async fn run(
        &self,
        profile: &SourceProfile,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let run = self.store.record_run(Some(&profile.source_id)).await?;
        let span = info_span!("scrape_run", run_id = run.id, source_id = %profile.source_id);
        self.drive(run, profile, options, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        run: ScrapeRun,
        profile: &SourceProfile,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        info!(mode = ?options.mode, "run starting");
        let token = cancel.child_token();
        let fault = Fault::new(token.clone());
        let timer = self.config.run_timeout.map(|limit| {
            let fault = fault.clone();
            tokio::spawn(async move {
                sleep(limit).await;
                fault.raise(format!("run timed out after {limit:?}"));
            })
        });

        let mut report = RunReport {
            run: run.clone(),
            candidates: 0,
            new_jobs: 0,
            already_known: 0,
            invalid_links: 0,
            queued: 0,
            extracted: 0,
            failures: Vec::new(),
        };
        let mut discovered: HashSet<UrlHash> = HashSet::new();
        let mut extraction_finished = false;

        'phases: {
            if options.mode == RunMode::Full {
                debug!("run: discovering");
                let outcome = match self.discover(profile, &token).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        fault.raise(format!("browser session unavailable: {e}"));
                        break 'phases;
                    }
                };
                report.invalid_links = outcome.invalid_links;
                if outcome.is_cancelled() {
                    break 'phases;
                }
                if outcome.links.is_empty() {
                    let message = match outcome.failures.last() {
                        Some(failure) => format!("discovery failed: {failure}"),
                        None => "discovery produced no candidates".to_string(),
                    };
                    fault.raise(message);
                    break 'phases;
                }

                report.candidates = outcome.links.len();
                discovered.extend(outcome.links.iter().map(|c| c.hash.clone()));
                if let Err(e) = self.record_candidates(profile, outcome, &mut report).await {
                    fault.raise(format!("store unavailable: {e}"));
                    break 'phases;
                }
                if let Err(e) = self
                    .store
                    .record_discovered(run.id, clamp_u32(discovered.len()))
                    .await
                {
                    fault.raise(format!("store unavailable: {e}"));
                    break 'phases;
                }
            }

            debug!("run: extracting");
            let backlog = match self
                .store
                .list_unprocessed(Some(&profile.source_id), options.limit)
                .await
            {
                Ok(backlog) => backlog,
                Err(e) => {
                    fault.raise(format!("store unavailable: {e}"));
                    break 'phases;
                }
            };
            report.queued = backlog.len();
            discovered.extend(backlog.iter().map(|job| job.url_hash.clone()));

            match self.extract_all(profile, backlog, &token, &fault).await {
                Ok(tally) => {
                    report.extracted = tally.extracted;
                    report.failures = tally.failures;
                }
                Err(e) => {
                    fault.raise(format!("browser session unavailable: {e}"));
                    break 'phases;
                }
            }
            extraction_finished = !token.is_cancelled();
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        debug!("run: finalizing");
        let error_message = match fault.message() {
            Some(message) => Some(message),
            None if cancel.is_cancelled() => Some("run cancelled".to_string()),
            None if !extraction_finished => Some("run interrupted".to_string()),
            None => None,
        };
        let status = if error_message.is_none() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let jobs_analyzed = match self.store.count_analyzed_since(run.started_at).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "could not count analyzed jobs");
                0
            }
        };
        let counts = RunCounts {
            jobs_discovered: clamp_u32(discovered.len()),
            jobs_scraped: report.extracted,
            jobs_analyzed,
        };
        self.store
            .finalize_run(run.id, status, counts, error_message.as_deref())
            .await?;
        if let Some(finalized) = self.store.get_run(run.id).await? {
            report.run = finalized;
        }
        info!(
            status = %report.run.status,
            discovered = counts.jobs_discovered,
            scraped = counts.jobs_scraped,
            failed = report.failures.len(),
            "run finished"
        );
        Ok(report)
    }

    async fn discover(
        &self,
        profile: &SourceProfile,
        token: &CancellationToken,
    ) -> Result<DiscoveryOutcome, SessionError> {
        let mut session = self.factory.open().await?;
        let engine = DiscoveryEngine::new(self.config.discovery());
        let outcome = engine
            .discover_source(session.as_mut(), profile, token)
            .await;
        if let Err(e) = session.close().await {
            debug!(error = %e, "discovery session close failed");
        }
        Ok(outcome)
    }

    async fn record_candidates(
        &self,
        profile: &SourceProfile,
        outcome: DiscoveryOutcome,
        report: &mut RunReport,
    ) -> Result<(), StoreError> {
        let index = DedupIndex::new(self.store.clone());
        let (fresh, known) = index.partition(outcome.links).await?;
        report.already_known = known.len();
        for candidate in &fresh {
            if index.mark_known(&profile.source_id, candidate).await?.inserted {
                report.new_jobs += 1;
            }
        }
        info!(
            new = report.new_jobs,
            known = report.already_known,
            "candidates recorded"
        );
        Ok(())
    }

    async fn extract_all(
        &self,
        profile: &SourceProfile,
        backlog: Vec<JobRecord>,
        token: &CancellationToken,
        fault: &Fault,
    ) -> Result<WorkerTally, SessionError> {
        let mut total = WorkerTally::default();
        if backlog.is_empty() {
            info!("nothing to extract");
            return Ok(total);
        }

        let workers = self.config.workers.max(1).min(backlog.len());
        let mut sessions = Vec::with_capacity(workers);
        for _ in 0..workers {
            match self.factory.open().await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    for mut session in sessions {
                        let _ = session.close().await;
                    }
                    return Err(e);
                }
            }
        }
        info!(jobs = backlog.len(), workers, "extraction starting");

        let queue = Arc::new(Mutex::new(VecDeque::from(backlog)));
        let extractor = Arc::new(RenderWaitExtractor::new(self.config.render_wait()));
        let selectors = Arc::new(profile.selectors.clone());
        let workers = sessions.into_iter().enumerate().map(|(id, session)| {
            Worker {
                id,
                session,
                factory: &self.factory,
                queue: Arc::clone(&queue),
                store: self.store.clone(),
                extractor: Arc::clone(&extractor),
                selectors: Arc::clone(&selectors),
                politeness: self.config.scroll_pause,
                recycle_after: self.config.session_recycle_jobs.max(1),
                token: token.clone(),
                fault: fault.clone(),
            }
            .run()
        });

        for tally in join_all(workers).await {
            total.extracted += tally.extracted;
            total.failures.extend(tally.failures);
        }
        Ok(total)
    }
}

fn clamp_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
